use regex::Regex;
use serde::Serialize;
use thiserror::Error;

pub const DEFAULT_PREFIX: &str = "neo4j-demos";
pub use cloud::DEFAULT_REGION;

/// Longest bucket name S3 accepts
const MAX_BUCKET_NAME: usize = 63;
const NAME_PATTERN: &str = r"^[a-z0-9]([a-z0-9-]*[a-z0-9])?$";
const REGION_PATTERN: &str = r"^[a-z]{2}(-gov)?-[a-z]+-[0-9]$";

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ContextError {
    #[error("Invalid environment name '{0}': use lowercase letters, digits and hyphens")]
    InvalidEnvironment(String),

    #[error("Invalid naming prefix '{0}': use lowercase letters, digits and hyphens")]
    InvalidPrefix(String),

    #[error("Invalid region '{0}'")]
    InvalidRegion(String),

    #[error("Derived bucket name '{name}' exceeds {max} characters")]
    NameTooLong { name: String, max: usize },

    #[error("Invalid name pattern: {0}")]
    Pattern(String),
}

/// Environment a run targets. Every derived resource name comes from here.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EnvironmentContext {
    environment: String,
    region: String,
    prefix: String,
}

impl EnvironmentContext {
    pub fn new(
        environment: impl Into<String>,
        region: impl Into<String>,
        prefix: impl Into<String>,
    ) -> Result<Self, ContextError> {
        let environment = environment.into();
        let region = region.into();
        let prefix = prefix.into();

        let name = compile(NAME_PATTERN)?;
        if !name.is_match(&environment) {
            return Err(ContextError::InvalidEnvironment(environment));
        }
        if !name.is_match(&prefix) {
            return Err(ContextError::InvalidPrefix(prefix));
        }
        if !compile(REGION_PATTERN)?.is_match(&region) {
            return Err(ContextError::InvalidRegion(region));
        }

        // the longest name derived from the context is the state bucket
        let bucket = format!("{}-terraform-state-{}", prefix, environment);
        if bucket.len() > MAX_BUCKET_NAME {
            return Err(ContextError::NameTooLong {
                name: bucket,
                max: MAX_BUCKET_NAME,
            });
        }

        Ok(Self {
            environment,
            region,
            prefix,
        })
    }

    pub fn environment(&self) -> &str {
        &self.environment
    }

    pub fn region(&self) -> &str {
        &self.region
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Substitutes `{prefix}`, `{environment}` and `{region}`.
    pub fn expand(&self, template: &str) -> String {
        template
            .replace("{prefix}", &self.prefix)
            .replace("{environment}", &self.environment)
            .replace("{region}", &self.region)
    }

    /// Like [`expand`](Self::expand), also substituting `{cluster}`.
    pub fn expand_with_cluster(&self, template: &str, cluster: &str) -> String {
        self.expand(&template.replace("{cluster}", cluster))
    }
}

fn compile(pattern: &str) -> Result<Regex, ContextError> {
    Regex::new(pattern).map_err(|e| ContextError::Pattern(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_context() {
        let ctx = EnvironmentContext::new("dev", DEFAULT_REGION, DEFAULT_PREFIX).unwrap();
        assert_eq!(ctx.environment(), "dev");
        assert_eq!(ctx.region(), "us-east-1");
        assert_eq!(ctx.prefix(), "neo4j-demos");

        assert!(EnvironmentContext::new("prod-2", "us-gov-west-1", "demos").is_ok());
    }

    #[test]
    fn test_invalid_names() {
        assert_eq!(
            EnvironmentContext::new("Dev", "us-east-1", "neo4j-demos"),
            Err(ContextError::InvalidEnvironment("Dev".to_string()))
        );
        assert!(matches!(
            EnvironmentContext::new("dev-", "us-east-1", "neo4j-demos"),
            Err(ContextError::InvalidEnvironment(_))
        ));
        assert!(matches!(
            EnvironmentContext::new("", "us-east-1", "neo4j-demos"),
            Err(ContextError::InvalidEnvironment(_))
        ));
        assert!(matches!(
            EnvironmentContext::new("dev", "us-east-1", "neo4j_demos"),
            Err(ContextError::InvalidPrefix(_))
        ));
        assert!(matches!(
            EnvironmentContext::new("dev", "useast1", "neo4j-demos"),
            Err(ContextError::InvalidRegion(_))
        ));
    }

    #[test]
    fn test_bucket_name_length_limit() {
        let long_env = "a".repeat(40);
        assert!(matches!(
            EnvironmentContext::new(long_env, "us-east-1", "neo4j-demos"),
            Err(ContextError::NameTooLong { .. })
        ));
    }

    #[test]
    fn test_template_expansion() {
        let ctx = EnvironmentContext::new("staging", "eu-west-1", "neo4j-demos").unwrap();
        assert_eq!(ctx.expand("{prefix}-{environment}"), "neo4j-demos-staging");
        assert_eq!(
            ctx.expand("/terraform/{environment}/region={region}"),
            "/terraform/staging/region=eu-west-1"
        );
        assert_eq!(
            ctx.expand_with_cluster("alias/eks/{cluster}", "neo4j-demos-staging"),
            "alias/eks/neo4j-demos-staging"
        );
    }
}
