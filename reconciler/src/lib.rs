pub mod config;
pub mod conflict;
pub mod context;
pub mod executor;
pub mod import;
pub mod locator;
pub mod outcome;
pub mod publisher;
pub mod teardown;

pub use config::{
    BackendSection, ClusterSection, ConfigError, ReconcilerConfig, TeardownSection,
    TerraformSection,
};
pub use conflict::{ConflictReport, ConflictResolver};
pub use context::{ContextError, EnvironmentContext, DEFAULT_PREFIX, DEFAULT_REGION};
pub use executor::{ReconcileError, ReconcileResult, Reconciler};
pub use import::{ImportCandidate, ImportReconciler, ImportReport};
pub use locator::{
    parameter_key, published_overrides, StateBackendHandle, StateLocator, StateOverrides,
};
pub use outcome::{
    FailureKind, FailureRecord, ManagedResourceRef, Operation, ReconciliationOutcome,
    ResourceKind, Stage,
};
pub use publisher::{default_output_mapping, OutputPublisher, PublishReport, PublishedEntry};
pub use teardown::{PollPolicy, RetryPolicy, Teardown};
