use crate::context::DEFAULT_PREFIX;
use crate::import::ImportCandidate;
use crate::locator::{StateOverrides, DEFAULT_STATE_KEY};
use crate::publisher::default_output_mapping;
use crate::teardown::{PollPolicy, RetryPolicy};
use cloud::AwsCliConfig;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendSection {
    /// Overrides the derived state bucket name
    pub state_bucket: Option<String>,
    /// Overrides the derived lock table name
    pub lock_table: Option<String>,
    pub state_key: String,
}

impl Default for BackendSection {
    fn default() -> Self {
        Self {
            state_bucket: None,
            lock_table: None,
            state_key: DEFAULT_STATE_KEY.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TerraformSection {
    pub binary: String,
    /// Root module that creates the state bucket and lock table (local state)
    pub bootstrap_dir: PathBuf,
    /// Root module of the environment itself (remote state)
    pub infrastructure_dir: PathBuf,
    /// Input variables; values may use `{prefix}`, `{environment}` and `{region}`
    pub variables: BTreeMap<String, String>,
}

impl Default for TerraformSection {
    fn default() -> Self {
        let mut variables = BTreeMap::new();
        variables.insert("environment".to_string(), "{environment}".to_string());
        variables.insert("aws_region".to_string(), "{region}".to_string());

        Self {
            binary: "terraform".to_string(),
            bootstrap_dir: PathBuf::from("terraform/bootstrap"),
            infrastructure_dir: PathBuf::from("terraform"),
            variables,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterSection {
    pub name: String,
    pub vpc_name: String,
    /// Application namespaces deleted before the nodegroups
    pub namespaces: Vec<String>,
}

impl Default for ClusterSection {
    fn default() -> Self {
        Self {
            name: "{prefix}-{environment}".to_string(),
            vpc_name: "{prefix}-{environment}-vpc".to_string(),
            namespaces: vec!["neo4j-app".to_string()],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TeardownSection {
    pub retry_attempts: u32,
    pub retry_interval_secs: u64,
    pub poll_interval_secs: u64,
    pub max_wait_secs: u64,
    /// Tag whose value is the environment name on Elastic IPs
    pub address_tag_key: String,
}

impl Default for TeardownSection {
    fn default() -> Self {
        Self {
            retry_attempts: 3,
            retry_interval_secs: 10,
            poll_interval_secs: 15,
            max_wait_secs: 900,
            address_tag_key: "Environment".to_string(),
        }
    }
}

impl TeardownSection {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.retry_attempts,
            Duration::from_secs(self.retry_interval_secs),
        )
    }

    pub fn poll_policy(&self) -> PollPolicy {
        PollPolicy::from_bounds(
            Duration::from_secs(self.poll_interval_secs),
            Duration::from_secs(self.max_wait_secs),
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconcilerConfig {
    pub prefix: String,
    pub backend: BackendSection,
    pub terraform: TerraformSection,
    pub aws: AwsCliConfig,
    pub cluster: ClusterSection,
    pub imports: Vec<ImportCandidate>,
    /// Terraform output name -> parameter key template
    pub outputs: BTreeMap<String, String>,
    pub teardown: TeardownSection,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            prefix: DEFAULT_PREFIX.to_string(),
            backend: BackendSection::default(),
            terraform: TerraformSection::default(),
            aws: AwsCliConfig::default(),
            cluster: ClusterSection::default(),
            imports: ImportCandidate::defaults(),
            outputs: default_output_mapping(),
            teardown: TeardownSection::default(),
        }
    }
}

impl ReconcilerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn from_toml(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    /// Applies `RECONCILE_*` and `AWS_PROFILE` from the process environment.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides_from(|name| std::env::var(name).ok());
    }

    /// Same as [`apply_env_overrides`](Self::apply_env_overrides) with an
    /// explicit variable source. Blank values are ignored.
    pub fn apply_overrides_from<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        if let Some(prefix) = get("RECONCILE_PREFIX") {
            self.prefix = prefix;
        }
        if let Some(region) = get("RECONCILE_REGION") {
            self.aws.region = region;
        }
        if let Some(bucket) = get("RECONCILE_STATE_BUCKET") {
            self.backend.state_bucket = Some(bucket);
        }
        if let Some(table) = get("RECONCILE_LOCK_TABLE") {
            self.backend.lock_table = Some(table);
        }
        if let Some(profile) = get("AWS_PROFILE") {
            self.aws.profile = Some(profile);
        }
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    pub fn with_region(mut self, region: impl Into<String>) -> Self {
        self.aws.region = region.into();
        self
    }

    pub fn with_state_bucket(mut self, bucket: impl Into<String>) -> Self {
        self.backend.state_bucket = Some(bucket.into());
        self
    }

    pub fn with_lock_table(mut self, table: impl Into<String>) -> Self {
        self.backend.lock_table = Some(table.into());
        self
    }

    pub fn with_imports(mut self, imports: Vec<ImportCandidate>) -> Self {
        self.imports = imports;
        self
    }

    pub fn with_teardown(mut self, teardown: TeardownSection) -> Self {
        self.teardown = teardown;
        self
    }

    /// Backend names given explicitly through the file, environment or flags.
    pub fn state_overrides(&self) -> StateOverrides {
        StateOverrides::new(
            self.backend.state_bucket.clone(),
            self.backend.lock_table.clone(),
        )
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.prefix.trim().is_empty() {
            return Err("Prefix cannot be empty".to_string());
        }

        if self.backend.state_key.trim().is_empty() {
            return Err("State key cannot be empty".to_string());
        }

        if self.terraform.binary.is_empty() {
            return Err("Terraform binary cannot be empty".to_string());
        }

        if self.cluster.name.trim().is_empty() {
            return Err("Cluster name cannot be empty".to_string());
        }

        self.aws.validate()?;

        for candidate in &self.imports {
            if !candidate.kind.is_importable() {
                return Err(format!(
                    "Import candidate {} has kind {}, which cannot be imported",
                    candidate.name, candidate.kind
                ));
            }
            if candidate.address.trim().is_empty() {
                return Err(format!(
                    "Import candidate {} needs a state address",
                    candidate.name
                ));
            }
        }

        for (output, key) in &self.outputs {
            if !key.starts_with('/') {
                return Err(format!(
                    "Parameter key for output {} must start with '/'",
                    output
                ));
            }
        }

        if self.teardown.retry_attempts == 0 {
            return Err("Retry attempts must be greater than 0".to_string());
        }

        if self.teardown.poll_interval_secs == 0 {
            return Err("Poll interval must be greater than 0".to_string());
        }

        if self.teardown.max_wait_secs < self.teardown.poll_interval_secs {
            return Err("Max wait must be at least one poll interval".to_string());
        }

        if self.teardown.address_tag_key.trim().is_empty() {
            return Err("Address tag key cannot be empty".to_string());
        }

        Ok(())
    }
}
