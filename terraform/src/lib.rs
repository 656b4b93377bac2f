//! Terraform integration for the reconciler.
//!
//! The reconciler treats Terraform as an external collaborator: it feeds it
//! backend settings and variables and reads back exit codes, the state address
//! list and outputs. [`DeclarativeTool`] is that contract; [`TerraformCli`]
//! drives the real binary.

pub mod cli;

#[cfg(any(test, feature = "test-support"))]
pub mod fake;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

pub use cli::TerraformCli;

#[cfg(any(test, feature = "test-support"))]
pub use fake::FakeTerraform;

/// Errors related to running Terraform
#[derive(Error, Debug)]
pub enum TerraformError {
    #[error("terraform {command} failed (exit code {code:?}): {stderr}")]
    CommandFailed {
        command: String,
        code: Option<i32>,
        stderr: String,
    },
    #[error("Failed to parse terraform output: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type TerraformResult<T> = Result<T, TerraformError>;

/// Input variables passed as `-var name=value`.
pub type Variables = BTreeMap<String, String>;

/// Remote state backend settings passed to `terraform init`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendConfig {
    pub bucket: String,
    pub lock_table: String,
    pub region: String,
    /// Object key of the state file inside the bucket
    pub key: String,
}

impl BackendConfig {
    /// `-backend-config` arguments for the S3 backend.
    pub fn to_args(&self) -> Vec<String> {
        vec![
            format!("-backend-config=bucket={}", self.bucket),
            format!("-backend-config=dynamodb_table={}", self.lock_table),
            format!("-backend-config=region={}", self.region),
            format!("-backend-config=key={}", self.key),
            "-backend-config=encrypt=true".to_string(),
        ]
    }
}

/// Result of `terraform plan -detailed-exitcode`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PlanOutcome {
    NoChanges,
    Changes,
}

impl PlanOutcome {
    /// Maps the detailed exit code; `None` for anything that is a failure.
    pub fn from_exit_code(code: Option<i32>) -> Option<Self> {
        match code {
            Some(0) => Some(PlanOutcome::NoChanges),
            Some(2) => Some(PlanOutcome::Changes),
            _ => None,
        }
    }
}

/// One entry of `terraform output -json`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputValue {
    #[serde(default)]
    pub sensitive: bool,
    pub value: serde_json::Value,
}

impl OutputValue {
    pub fn plain(value: impl Into<String>) -> Self {
        Self {
            sensitive: false,
            value: serde_json::Value::String(value.into()),
        }
    }

    pub fn sensitive(value: impl Into<String>) -> Self {
        Self {
            sensitive: true,
            value: serde_json::Value::String(value.into()),
        }
    }

    /// Strings verbatim, everything else as compact JSON.
    pub fn as_plain_string(&self) -> String {
        match &self.value {
            serde_json::Value::String(s) => s.clone(),
            other => other.to_string(),
        }
    }
}

#[async_trait]
pub trait DeclarativeTool: Send + Sync {
    /// `None` keeps whatever backend the root module declares (local state).
    async fn init(&self, backend: Option<&BackendConfig>, reconfigure: bool)
        -> TerraformResult<()>;

    async fn plan(&self, vars: &Variables) -> TerraformResult<PlanOutcome>;

    async fn apply(&self, vars: &Variables) -> TerraformResult<()>;

    async fn destroy(&self, vars: &Variables) -> TerraformResult<()>;

    /// Addresses currently tracked in state.
    async fn state_list(&self) -> TerraformResult<Vec<String>>;

    async fn import(&self, address: &str, id: &str, vars: &Variables) -> TerraformResult<()>;

    async fn outputs(&self) -> TerraformResult<BTreeMap<String, OutputValue>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_args() {
        let backend = BackendConfig {
            bucket: "neo4j-demos-terraform-state-dev".to_string(),
            lock_table: "neo4j-demos-terraform-locks-dev".to_string(),
            region: "us-east-1".to_string(),
            key: "infrastructure/terraform.tfstate".to_string(),
        };

        let args = backend.to_args();
        assert_eq!(args.len(), 5);
        assert_eq!(
            args[0],
            "-backend-config=bucket=neo4j-demos-terraform-state-dev"
        );
        assert_eq!(
            args[1],
            "-backend-config=dynamodb_table=neo4j-demos-terraform-locks-dev"
        );
        assert!(args.contains(&"-backend-config=key=infrastructure/terraform.tfstate".to_string()));
    }

    #[test]
    fn test_plan_outcome_from_exit_code() {
        assert_eq!(PlanOutcome::from_exit_code(Some(0)), Some(PlanOutcome::NoChanges));
        assert_eq!(PlanOutcome::from_exit_code(Some(2)), Some(PlanOutcome::Changes));
        assert_eq!(PlanOutcome::from_exit_code(Some(1)), None);
        assert_eq!(PlanOutcome::from_exit_code(None), None);
    }

    #[test]
    fn test_output_value_rendering() {
        let json = r#"{
            "cluster_name": {"sensitive": false, "type": "string", "value": "neo4j-demos-dev"},
            "subnets": {"sensitive": false, "type": ["list", "string"], "value": ["a", "b"]},
            "db_password": {"sensitive": true, "type": "string", "value": "hunter2"}
        }"#;
        let outputs: BTreeMap<String, OutputValue> = serde_json::from_str(json).unwrap();

        assert_eq!(outputs["cluster_name"].as_plain_string(), "neo4j-demos-dev");
        assert_eq!(outputs["subnets"].as_plain_string(), r#"["a","b"]"#);
        assert!(outputs["db_password"].sensitive);
    }

    #[test]
    fn test_error_display() {
        let error = TerraformError::CommandFailed {
            command: "apply".to_string(),
            code: Some(1),
            stderr: "Error: creating EKS Cluster".to_string(),
        };
        assert!(error.to_string().contains("terraform apply failed"));
        assert!(error.to_string().contains("creating EKS Cluster"));
    }
}
