//! What a reconciliation run did, in a form CI can archive and read back.

use crate::context::EnvironmentContext;
use crate::locator::StateBackendHandle;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Kinds of cloud object the reconciler creates, imports or removes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    EcrRepository,
    KmsAlias,
    LogGroup,
    StateBucket,
    ObjectVersion,
    LockTable,
    Namespace,
    Nodegroup,
    LoadBalancer,
    NetworkInterface,
    NatGateway,
    ElasticIp,
}

impl ResourceKind {
    /// Kinds the import pass knows how to probe and bind.
    pub fn is_importable(&self) -> bool {
        matches!(
            self,
            ResourceKind::EcrRepository | ResourceKind::KmsAlias | ResourceKind::LogGroup
        )
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ResourceKind::EcrRepository => "ecr_repository",
            ResourceKind::KmsAlias => "kms_alias",
            ResourceKind::LogGroup => "log_group",
            ResourceKind::StateBucket => "state_bucket",
            ResourceKind::ObjectVersion => "object_version",
            ResourceKind::LockTable => "lock_table",
            ResourceKind::Namespace => "namespace",
            ResourceKind::Nodegroup => "nodegroup",
            ResourceKind::LoadBalancer => "load_balancer",
            ResourceKind::NetworkInterface => "network_interface",
            ResourceKind::NatGateway => "nat_gateway",
            ResourceKind::ElasticIp => "elastic_ip",
        };
        write!(f, "{}", s)
    }
}

/// A cloud object that may or may not be tracked in declarative state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManagedResourceRef {
    pub kind: ResourceKind,
    pub external_id: String,
    /// State address, for objects Terraform manages
    pub address: Option<String>,
}

impl ManagedResourceRef {
    pub fn new(kind: ResourceKind, external_id: impl Into<String>) -> Self {
        Self {
            kind,
            external_id: external_id.into(),
            address: None,
        }
    }

    pub fn tracked_at(
        kind: ResourceKind,
        external_id: impl Into<String>,
        address: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            external_id: external_id.into(),
            address: Some(address.into()),
        }
    }
}

impl fmt::Display for ManagedResourceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.address {
            Some(address) => write!(f, "{} {} ({})", self.kind, self.external_id, address),
            None => write!(f, "{} {}", self.kind, self.external_id),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Bootstrap,
    Apply,
    Destroy,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operation::Bootstrap => write!(f, "bootstrap"),
            Operation::Apply => write!(f, "apply"),
            Operation::Destroy => write!(f, "destroy"),
        }
    }
}

/// Step of a run, used to attribute failures
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Locate,
    ConflictResolution,
    Bootstrap,
    Init,
    Plan,
    Import,
    Apply,
    Publish,
    ApplicationTeardown,
    NodegroupTeardown,
    NetworkTeardown,
    Destroy,
    BackendPurge,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Stage::Locate => "locate",
            Stage::ConflictResolution => "conflict resolution",
            Stage::Bootstrap => "bootstrap",
            Stage::Init => "init",
            Stage::Plan => "plan",
            Stage::Import => "import",
            Stage::Apply => "apply",
            Stage::Publish => "publish",
            Stage::ApplicationTeardown => "application teardown",
            Stage::NodegroupTeardown => "nodegroup teardown",
            Stage::NetworkTeardown => "network teardown",
            Stage::Destroy => "destroy",
            Stage::BackendPurge => "backend purge",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Race or transient API error in best-effort cleanup; the run continued
    Transient,
    /// A parameter-store write failed; downstream readers may see stale values
    Publish,
    /// The run stopped here
    Fatal,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureRecord {
    pub stage: Stage,
    pub kind: FailureKind,
    pub resource: Option<String>,
    pub message: String,
}

impl FailureRecord {
    pub fn transient(stage: Stage, resource: impl Into<String>, message: impl ToString) -> Self {
        Self {
            stage,
            kind: FailureKind::Transient,
            resource: Some(resource.into()),
            message: message.to_string(),
        }
    }

    pub fn publish(key: impl Into<String>, message: impl ToString) -> Self {
        Self {
            stage: Stage::Publish,
            kind: FailureKind::Publish,
            resource: Some(key.into()),
            message: message.to_string(),
        }
    }

    pub fn fatal(stage: Stage, message: impl ToString) -> Self {
        Self {
            stage,
            kind: FailureKind::Fatal,
            resource: None,
            message: message.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconciliationOutcome {
    pub run_id: Uuid,
    pub operation: Operation,
    pub environment: String,
    pub backend: Option<StateBackendHandle>,
    /// The declarative tool converged (apply or destroy completed)
    pub applied: bool,
    pub imported: Vec<ManagedResourceRef>,
    pub destroyed: Vec<ManagedResourceRef>,
    pub published: Vec<String>,
    pub errors: Vec<FailureRecord>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl ReconciliationOutcome {
    pub fn new(operation: Operation, context: &EnvironmentContext) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            operation,
            environment: context.environment().to_string(),
            backend: None,
            applied: false,
            imported: Vec::new(),
            destroyed: Vec::new(),
            published: Vec::new(),
            errors: Vec::new(),
            started_at: Utc::now(),
            finished_at: None,
        }
    }

    pub fn record(&mut self, failure: FailureRecord) {
        self.errors.push(failure);
    }

    pub fn extend_failures(&mut self, failures: impl IntoIterator<Item = FailureRecord>) {
        self.errors.extend(failures);
    }

    pub fn is_fatal(&self) -> bool {
        self.errors.iter().any(|e| e.kind == FailureKind::Fatal)
    }

    /// Some published value may be stale because its write failed.
    pub fn has_stale_parameters(&self) -> bool {
        self.errors.iter().any(|e| e.kind == FailureKind::Publish)
    }

    pub fn failures_of(&self, kind: FailureKind) -> impl Iterator<Item = &FailureRecord> {
        self.errors.iter().filter(move |e| e.kind == kind)
    }

    pub fn finish(&mut self) {
        self.finished_at = Some(Utc::now());
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }
}
