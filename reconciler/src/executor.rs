//! Runs bootstrap, apply and destroy for one environment.
//!
//! Each run produces a [`ReconciliationOutcome`]. Best-effort stages
//! (conflict resolution, imports, publishing) add failure records and let
//! the run continue; a fatal error stops the run and is recorded as the
//! last failure.

use crate::config::ReconcilerConfig;
use crate::conflict::ConflictResolver;
use crate::context::{ContextError, EnvironmentContext};
use crate::import::ImportReconciler;
use crate::locator::{published_overrides, StateBackendHandle, StateLocator};
use crate::outcome::{FailureRecord, ManagedResourceRef, Operation, ReconciliationOutcome, Stage};
use crate::publisher::{published_keys, OutputPublisher, PublishedEntry};
use crate::teardown::Teardown;
use cloud::{CloudError, CloudProvider};
use std::collections::BTreeMap;
use terraform::{BackendConfig, DeclarativeTool, PlanOutcome, TerraformError, Variables};
use thiserror::Error;
use tracing::{error, info, warn};

/// Bootstrap module variable receiving the state bucket name
pub const BUCKET_VARIABLE: &str = "state_bucket_name";
/// Bootstrap module variable receiving the lock table name
pub const LOCK_TABLE_VARIABLE: &str = "lock_table_name";

#[derive(Error, Debug)]
pub enum ReconcileError {
    #[error(transparent)]
    Context(#[from] ContextError),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("terraform {stage} failed: {source}")]
    Tool {
        stage: Stage,
        #[source]
        source: TerraformError,
    },

    #[error("{stage} failed: {source}")]
    Teardown {
        stage: Stage,
        #[source]
        source: CloudError,
    },
}

impl ReconcileError {
    pub fn stage(&self) -> Stage {
        match self {
            ReconcileError::Context(_) | ReconcileError::Config(_) => Stage::Locate,
            ReconcileError::Tool { stage, .. } | ReconcileError::Teardown { stage, .. } => *stage,
        }
    }
}

pub type ReconcileResult<T> = Result<T, ReconcileError>;

fn tool_error(stage: Stage) -> impl FnOnce(TerraformError) -> ReconcileError {
    move |source| ReconcileError::Tool { stage, source }
}

fn teardown_error(stage: Stage) -> impl FnOnce(CloudError) -> ReconcileError {
    move |source| ReconcileError::Teardown { stage, source }
}

pub struct Reconciler<C, T> {
    context: EnvironmentContext,
    config: ReconcilerConfig,
    cloud: C,
    bootstrap: T,
    infrastructure: T,
}

impl<C, T> Reconciler<C, T>
where
    C: CloudProvider,
    T: DeclarativeTool,
{
    /// `bootstrap` drives the root module that creates the state backend,
    /// `infrastructure` the one that keeps its state in it.
    pub fn new(
        context: EnvironmentContext,
        config: ReconcilerConfig,
        cloud: C,
        bootstrap: T,
        infrastructure: T,
    ) -> ReconcileResult<Self> {
        config.validate().map_err(ReconcileError::Config)?;
        Ok(Self {
            context,
            config,
            cloud,
            bootstrap,
            infrastructure,
        })
    }

    pub fn context(&self) -> &EnvironmentContext {
        &self.context
    }

    pub fn cloud(&self) -> &C {
        &self.cloud
    }

    pub fn bootstrap_tool(&self) -> &T {
        &self.bootstrap
    }

    pub fn infrastructure_tool(&self) -> &T {
        &self.infrastructure
    }

    pub fn cluster_name(&self) -> String {
        self.context.expand(&self.config.cluster.name)
    }

    pub fn variables(&self) -> Variables {
        self.config
            .terraform
            .variables
            .iter()
            .map(|(name, value)| (name.clone(), self.context.expand(value)))
            .collect()
    }

    /// Resolves the backend every workflow uses. Names a previous bootstrap
    /// published take precedence over the derived ones, below any explicit
    /// override.
    pub async fn locate(&self) -> StateBackendHandle {
        let overrides = self
            .config
            .state_overrides()
            .or(published_overrides(&self.cloud, &self.context).await);

        let backend = StateLocator::new(&self.config.backend.state_key)
            .resolve(&self.context, &overrides);
        info!(
            "State backend for {}: bucket {}, lock table {}",
            self.context.environment(),
            backend.bucket,
            backend.lock_table
        );
        backend
    }

    pub async fn bootstrap(&self) -> ReconciliationOutcome {
        let mut outcome = ReconciliationOutcome::new(Operation::Bootstrap, &self.context);
        let backend = self.locate().await;
        outcome.backend = Some(backend.clone());

        let result = self.bootstrap_backend(&backend, &mut outcome).await;
        self.conclude(outcome, result)
    }

    pub async fn apply(&self, bootstrap: bool) -> ReconciliationOutcome {
        let mut outcome = ReconciliationOutcome::new(Operation::Apply, &self.context);
        let backend = self.locate().await;
        outcome.backend = Some(backend.clone());

        let result = self.run_apply(&backend, bootstrap, &mut outcome).await;
        self.conclude(outcome, result)
    }

    pub async fn destroy(&self, include_backend: bool) -> ReconciliationOutcome {
        let mut outcome = ReconciliationOutcome::new(Operation::Destroy, &self.context);
        let backend = self.locate().await;
        outcome.backend = Some(backend.clone());

        let result = self
            .run_destroy(&backend, include_backend, &mut outcome)
            .await;
        self.conclude(outcome, result)
    }

    /// Values a downstream deploy would read for this environment.
    pub async fn published_values(&self) -> BTreeMap<String, Option<String>> {
        let keys = published_keys(&self.context, &self.config.outputs);
        OutputPublisher::new(&self.cloud).read_back(&keys).await
    }

    fn conclude(
        &self,
        mut outcome: ReconciliationOutcome,
        result: ReconcileResult<()>,
    ) -> ReconciliationOutcome {
        match result {
            Ok(()) => info!(
                "{} of {} finished with {} non-fatal failures",
                outcome.operation,
                self.context.environment(),
                outcome.errors.len()
            ),
            Err(e) => {
                error!("{} of {} failed: {}", outcome.operation, self.context.environment(), e);
                outcome.record(FailureRecord::fatal(e.stage(), &e));
            }
        }
        if outcome.has_stale_parameters() {
            warn!("Some parameters were not published; downstream values may be stale");
        }
        outcome.finish();
        outcome
    }

    /// Init that falls back to a single `-reconfigure` retry, for a backend
    /// whose settings changed since the last init.
    async fn init(&self, tool: &T, backend: Option<&BackendConfig>) -> ReconcileResult<()> {
        if let Err(first) = tool.init(backend, false).await {
            warn!("terraform init failed, retrying with -reconfigure: {}", first);
            tool.init(backend, true)
                .await
                .map_err(tool_error(Stage::Init))?;
        }
        Ok(())
    }

    async fn bootstrap_backend(
        &self,
        backend: &StateBackendHandle,
        outcome: &mut ReconciliationOutcome,
    ) -> ReconcileResult<()> {
        let report = ConflictResolver::new(&self.cloud).resolve(backend).await;
        outcome.destroyed.extend(report.removed);
        outcome.extend_failures(report.failures);

        let mut variables = self.variables();
        variables.insert(BUCKET_VARIABLE.to_string(), backend.bucket.clone());
        variables.insert(LOCK_TABLE_VARIABLE.to_string(), backend.lock_table.clone());

        info!("Creating state backend {}", backend.bucket);
        self.init(&self.bootstrap, None).await?;
        self.bootstrap
            .apply(&variables)
            .await
            .map_err(tool_error(Stage::Bootstrap))?;

        let entries = OutputPublisher::<C>::backend_entries(&self.context, backend);
        self.publish(&entries, outcome).await;
        Ok(())
    }

    async fn publish(&self, entries: &[PublishedEntry], outcome: &mut ReconciliationOutcome) {
        let report = OutputPublisher::new(&self.cloud).publish(entries).await;
        outcome.published.extend(report.written);
        outcome.extend_failures(report.failures);
    }

    async fn run_apply(
        &self,
        backend: &StateBackendHandle,
        bootstrap: bool,
        outcome: &mut ReconciliationOutcome,
    ) -> ReconcileResult<()> {
        if bootstrap {
            self.bootstrap_backend(backend, outcome).await?;
        }

        let variables = self.variables();
        self.init(&self.infrastructure, Some(&backend.backend_config()))
            .await?;

        let plan = self
            .infrastructure
            .plan(&variables)
            .await
            .map_err(tool_error(Stage::Plan))?;
        info!("Plan for {}: {:?}", self.context.environment(), plan);

        let cluster = self.cluster_name();
        let candidates: Vec<ManagedResourceRef> = self
            .config
            .imports
            .iter()
            .map(|candidate| candidate.resolve(&self.context, &cluster))
            .collect();
        let report = ImportReconciler::new(&self.cloud, &self.infrastructure, &variables)
            .reconcile(&candidates)
            .await;
        let imported_any = !report.imported.is_empty();
        outcome.imported.extend(report.imported);
        outcome.extend_failures(report.failures);

        if plan == PlanOutcome::NoChanges && !imported_any {
            info!("Infrastructure already converged, skipping apply");
        } else {
            self.infrastructure
                .apply(&variables)
                .await
                .map_err(tool_error(Stage::Apply))?;
        }
        outcome.applied = true;

        let mut entries = OutputPublisher::<C>::backend_entries(&self.context, backend);
        match self.infrastructure.outputs().await {
            Ok(outputs) => entries.extend(OutputPublisher::<C>::output_entries(
                &self.context,
                &self.config.outputs,
                &outputs,
            )),
            Err(e) => {
                warn!("Could not read terraform outputs: {}", e);
                outcome.record(FailureRecord::publish("terraform output", e));
            }
        }
        self.publish(&entries, outcome).await;
        Ok(())
    }

    async fn run_destroy(
        &self,
        backend: &StateBackendHandle,
        include_backend: bool,
        outcome: &mut ReconciliationOutcome,
    ) -> ReconcileResult<()> {
        let variables = self.variables();
        self.init(&self.infrastructure, Some(&backend.backend_config()))
            .await?;

        let teardown = Teardown::new(
            &self.cloud,
            self.config.teardown.retry_policy(),
            self.config.teardown.poll_policy(),
        );
        let cluster = self.cluster_name();

        teardown
            .application_layer(&cluster, &self.config.cluster.namespaces, &mut outcome.destroyed)
            .await
            .map_err(teardown_error(Stage::ApplicationTeardown))?;

        teardown
            .nodegroups(&cluster, &mut outcome.destroyed)
            .await
            .map_err(teardown_error(Stage::NodegroupTeardown))?;

        let vpc_name = self.context.expand(&self.config.cluster.vpc_name);
        teardown
            .network(
                &vpc_name,
                (
                    self.config.teardown.address_tag_key.as_str(),
                    self.context.environment(),
                ),
                &mut outcome.destroyed,
            )
            .await
            .map_err(teardown_error(Stage::NetworkTeardown))?;

        info!("Destroying infrastructure for {}", self.context.environment());
        self.infrastructure
            .destroy(&variables)
            .await
            .map_err(tool_error(Stage::Destroy))?;
        outcome.applied = true;

        if include_backend {
            let report = ConflictResolver::new(&self.cloud)
                .for_stage(Stage::BackendPurge)
                .resolve(backend)
                .await;
            outcome.destroyed.extend(report.removed);
            outcome.extend_failures(report.failures);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::outcome::FailureKind;
    use cloud::InMemoryCloud;
    use terraform::fake::FakeTerraform;

    fn reconciler(
        cloud: InMemoryCloud,
        infrastructure: FakeTerraform,
    ) -> Reconciler<InMemoryCloud, FakeTerraform> {
        let context = EnvironmentContext::new("dev", "us-east-1", "neo4j-demos").unwrap();
        Reconciler::new(
            context,
            ReconcilerConfig::default(),
            cloud,
            FakeTerraform::new(),
            infrastructure,
        )
        .unwrap()
    }

    #[test]
    fn test_variables_are_expanded() {
        let r = reconciler(InMemoryCloud::new(), FakeTerraform::new());
        let vars = r.variables();
        assert_eq!(vars["environment"], "dev");
        assert_eq!(vars["aws_region"], "us-east-1");
        assert_eq!(r.cluster_name(), "neo4j-demos-dev");
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let context = EnvironmentContext::new("dev", "us-east-1", "neo4j-demos").unwrap();
        let result = Reconciler::new(
            context,
            ReconcilerConfig::default().with_prefix(""),
            InMemoryCloud::new(),
            FakeTerraform::new(),
            FakeTerraform::new(),
        );
        assert!(matches!(result, Err(ReconcileError::Config(_))));
    }

    #[tokio::test]
    async fn test_init_retries_once_with_reconfigure() {
        let r = reconciler(InMemoryCloud::new(), FakeTerraform::new().failing_init(1));

        let outcome = r.apply(false).await;

        assert!(!outcome.is_fatal());
        assert_eq!(
            r.infrastructure_tool().calls_starting_with("init"),
            vec!["init", "init -reconfigure"]
        );
    }

    #[tokio::test]
    async fn test_second_init_failure_is_fatal() {
        let r = reconciler(InMemoryCloud::new(), FakeTerraform::new().failing_init(2));

        let outcome = r.apply(false).await;

        assert!(outcome.is_fatal());
        assert!(!outcome.applied);
        let fatal = outcome.failures_of(FailureKind::Fatal).next().unwrap();
        assert_eq!(fatal.stage, Stage::Init);
        assert!(r.infrastructure_tool().calls_starting_with("plan").is_empty());
    }

    #[tokio::test]
    async fn test_converged_plan_skips_apply() {
        let r = reconciler(
            InMemoryCloud::new(),
            FakeTerraform::new().with_plan(PlanOutcome::NoChanges),
        );

        let outcome = r.apply(false).await;

        assert!(outcome.applied);
        assert!(!r.infrastructure_tool().applied());
        assert_eq!(outcome.published.len(), 3);
    }

    #[tokio::test]
    async fn test_plan_failure_is_fatal_before_imports() {
        let cloud = InMemoryCloud::new().with_repository("neo4j-demos-app-dev");
        let r = reconciler(cloud, FakeTerraform::new().failing_plan());

        let outcome = r.apply(false).await;

        assert!(outcome.is_fatal());
        assert!(!outcome.applied);
        let fatal = outcome.failures_of(FailureKind::Fatal).next().unwrap();
        assert_eq!(fatal.stage, Stage::Plan);
        let tool = r.infrastructure_tool();
        assert!(tool.calls_starting_with("state list").is_empty());
        assert!(tool.calls_starting_with("import").is_empty());
        assert!(tool.calls_starting_with("apply").is_empty());
        assert!(r.cloud().events_for("ssm:put-parameter").is_empty());
    }

    #[tokio::test]
    async fn test_apply_failure_stops_before_publish() {
        let r = reconciler(InMemoryCloud::new(), FakeTerraform::new().failing_apply());

        let outcome = r.apply(false).await;

        assert!(outcome.is_fatal());
        assert!(outcome.published.is_empty());
        assert!(r.cloud().events_for("ssm:put-parameter").is_empty());
    }

    #[tokio::test]
    async fn test_destroy_failure_is_fatal_after_teardown() {
        let r = reconciler(InMemoryCloud::new(), FakeTerraform::new().failing_destroy());

        let outcome = r.destroy(false).await;

        assert!(outcome.is_fatal());
        assert_eq!(
            outcome.failures_of(FailureKind::Fatal).next().unwrap().stage,
            Stage::Destroy
        );
    }
}
