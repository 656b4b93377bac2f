//! Resolution of the Terraform state backend names for an environment.
//!
//! Every workflow that touches an environment (bootstrap, apply, destroy and
//! the downstream deploy that reads published values) must agree on these
//! names, so they are produced in exactly one place: [`StateLocator::resolve`].
//! Resolution order is an explicit non-blank override, then the deterministic
//! `{prefix}-terraform-{state|locks}-{environment}` name.

use crate::context::EnvironmentContext;
use cloud::ParameterStore;
use serde::{Deserialize, Serialize};
use terraform::BackendConfig;
use tracing::{debug, warn};

pub const DEFAULT_STATE_KEY: &str = "infrastructure/terraform.tfstate";
pub const STATE_BUCKET_NAME: &str = "state_bucket";
pub const LOCK_TABLE_NAME: &str = "lock_table";

/// Parameter-store key for a published value of an environment.
pub fn parameter_key(environment: &str, name: &str) -> String {
    format!("/terraform/{}/{}", environment, name)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateBackendHandle {
    pub bucket: String,
    pub lock_table: String,
    pub region: String,
    /// Object key of the state file inside the bucket
    pub key: String,
}

impl StateBackendHandle {
    pub fn backend_config(&self) -> BackendConfig {
        BackendConfig {
            bucket: self.bucket.clone(),
            lock_table: self.lock_table.clone(),
            region: self.region.clone(),
            key: self.key.clone(),
        }
    }
}

/// Explicit backend names that take precedence over the derived ones.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateOverrides {
    pub bucket: Option<String>,
    pub lock_table: Option<String>,
}

impl StateOverrides {
    pub fn new(bucket: Option<String>, lock_table: Option<String>) -> Self {
        Self { bucket, lock_table }
    }

    /// Field-wise fallback: keeps each usable value of `self`, else takes
    /// the one from `fallback`.
    pub fn or(self, fallback: StateOverrides) -> Self {
        Self {
            bucket: usable(self.bucket).or_else(|| usable(fallback.bucket)),
            lock_table: usable(self.lock_table).or_else(|| usable(fallback.lock_table)),
        }
    }

    pub fn is_empty(&self) -> bool {
        usable(self.bucket.clone()).is_none() && usable(self.lock_table.clone()).is_none()
    }
}

fn usable(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

#[derive(Debug, Clone)]
pub struct StateLocator {
    state_key: String,
}

impl Default for StateLocator {
    fn default() -> Self {
        Self::new(DEFAULT_STATE_KEY)
    }
}

impl StateLocator {
    pub fn new(state_key: impl Into<String>) -> Self {
        Self {
            state_key: state_key.into(),
        }
    }

    pub fn default_bucket(context: &EnvironmentContext) -> String {
        format!(
            "{}-terraform-state-{}",
            context.prefix(),
            context.environment()
        )
    }

    pub fn default_lock_table(context: &EnvironmentContext) -> String {
        format!(
            "{}-terraform-locks-{}",
            context.prefix(),
            context.environment()
        )
    }

    /// Pure: the same context and overrides always give the same handle.
    pub fn resolve(
        &self,
        context: &EnvironmentContext,
        overrides: &StateOverrides,
    ) -> StateBackendHandle {
        let bucket = usable(overrides.bucket.clone())
            .unwrap_or_else(|| Self::default_bucket(context));
        let lock_table = usable(overrides.lock_table.clone())
            .unwrap_or_else(|| Self::default_lock_table(context));

        StateBackendHandle {
            bucket,
            lock_table,
            region: context.region().to_string(),
            key: self.state_key.clone(),
        }
    }
}

/// Backend names a previous run published for this environment.
///
/// Missing keys and lookup failures both yield an empty override, which
/// makes the caller fall back to the derived names.
pub async fn published_overrides<S>(store: &S, context: &EnvironmentContext) -> StateOverrides
where
    S: ParameterStore + ?Sized,
{
    let mut overrides = StateOverrides::default();

    for name in [STATE_BUCKET_NAME, LOCK_TABLE_NAME] {
        let key = parameter_key(context.environment(), name);
        let value = match store.get_parameter(&key).await {
            Ok(Some(value)) => Some(value),
            Ok(None) => {
                debug!("{} not published, using derived name", key);
                None
            }
            Err(e) => {
                warn!(
                    "Could not read {}: {}. Falling back to the derived name",
                    key, e
                );
                None
            }
        };

        if name == STATE_BUCKET_NAME {
            overrides.bucket = value;
        } else {
            overrides.lock_table = value;
        }
    }

    overrides
}

#[cfg(test)]
mod tests {
    use super::*;
    use cloud::InMemoryCloud;

    fn dev() -> EnvironmentContext {
        EnvironmentContext::new("dev", "us-east-1", "neo4j-demos").unwrap()
    }

    #[test]
    fn test_deterministic_names() {
        let handle = StateLocator::default().resolve(&dev(), &StateOverrides::default());
        assert_eq!(handle.bucket, "neo4j-demos-terraform-state-dev");
        assert_eq!(handle.lock_table, "neo4j-demos-terraform-locks-dev");
        assert_eq!(handle.region, "us-east-1");
        assert_eq!(handle.key, DEFAULT_STATE_KEY);
    }

    #[test]
    fn test_resolution_is_pure() {
        let locator = StateLocator::default();
        let overrides = StateOverrides::new(Some("custom-bucket".to_string()), None);
        for environment in ["dev", "staging", "prod"] {
            let ctx = EnvironmentContext::new(environment, "us-east-1", "neo4j-demos").unwrap();
            assert_eq!(
                locator.resolve(&ctx, &overrides),
                locator.resolve(&ctx, &overrides)
            );
            assert_eq!(
                locator.resolve(&ctx, &StateOverrides::default()),
                locator.resolve(&ctx.clone(), &StateOverrides::default())
            );
        }
    }

    #[test]
    fn test_override_wins() {
        let overrides = StateOverrides::new(Some("custom-bucket".to_string()), None);
        let handle = StateLocator::default().resolve(&dev(), &overrides);
        assert_eq!(handle.bucket, "custom-bucket");
        assert_eq!(handle.lock_table, "neo4j-demos-terraform-locks-dev");
    }

    #[test]
    fn test_blank_override_is_ignored() {
        let overrides = StateOverrides::new(Some("   ".to_string()), Some(String::new()));
        assert!(overrides.is_empty());
        let handle = StateLocator::default().resolve(&dev(), &overrides);
        assert_eq!(handle.bucket, "neo4j-demos-terraform-state-dev");
        assert_eq!(handle.lock_table, "neo4j-demos-terraform-locks-dev");
    }

    #[test]
    fn test_override_fallback_chain() {
        let explicit = StateOverrides::new(Some("flag-bucket".to_string()), Some(" ".to_string()));
        let published = StateOverrides::new(
            Some("published-bucket".to_string()),
            Some("published-locks".to_string()),
        );

        let merged = explicit.or(published);
        assert_eq!(merged.bucket.as_deref(), Some("flag-bucket"));
        assert_eq!(merged.lock_table.as_deref(), Some("published-locks"));
    }

    #[test]
    fn test_backend_config_conversion() {
        let handle = StateLocator::new("apps/terraform.tfstate")
            .resolve(&dev(), &StateOverrides::default());
        let backend = handle.backend_config();
        assert_eq!(backend.bucket, handle.bucket);
        assert_eq!(backend.lock_table, handle.lock_table);
        assert_eq!(backend.key, "apps/terraform.tfstate");
    }

    #[tokio::test]
    async fn test_published_overrides() {
        let store = InMemoryCloud::new().with_parameter("/terraform/dev/state_bucket", "custom-bucket");

        let overrides = published_overrides(&store, &dev()).await;
        assert_eq!(overrides.bucket.as_deref(), Some("custom-bucket"));
        assert_eq!(overrides.lock_table, None);

        let handle = StateLocator::default().resolve(&dev(), &overrides);
        assert_eq!(handle.bucket, "custom-bucket");
        assert_eq!(handle.lock_table, "neo4j-demos-terraform-locks-dev");
    }

    #[tokio::test]
    async fn test_published_overrides_tolerates_lookup_failure() {
        let store = InMemoryCloud::new()
            .with_parameter("/terraform/dev/state_bucket", "custom-bucket")
            .fail("ssm:get-parameter", 2);

        let overrides = published_overrides(&store, &dev()).await;
        assert!(overrides.is_empty());
    }
}
