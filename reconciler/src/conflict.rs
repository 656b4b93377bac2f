//! Best-effort removal of a state backend left behind by an earlier run.
//!
//! A versioned bucket cannot be deleted while any object version or delete
//! marker remains, so every version is removed individually before the
//! bucket itself. Nothing here aborts the run: expected absence is logged at
//! debug level, anything else becomes a transient failure in the report.

use crate::locator::StateBackendHandle;
use crate::outcome::{FailureRecord, ManagedResourceRef, ResourceKind, Stage};
use cloud::{tolerate_absence, CleanupStatus, CloudError, LockTable, ObjectStorage};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Default)]
pub struct ConflictReport {
    pub removed: Vec<ManagedResourceRef>,
    pub failures: Vec<FailureRecord>,
}

impl ConflictReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }

    fn removed(&mut self, kind: ResourceKind, id: impl Into<String>) {
        self.removed.push(ManagedResourceRef::new(kind, id));
    }
}

pub struct ConflictResolver<'a, C: ?Sized> {
    cloud: &'a C,
    stage: Stage,
}

impl<'a, C> ConflictResolver<'a, C>
where
    C: ObjectStorage + LockTable + ?Sized,
{
    pub fn new(cloud: &'a C) -> Self {
        Self {
            cloud,
            stage: Stage::ConflictResolution,
        }
    }

    /// Attribute failures to a different stage, e.g. the final backend purge
    /// of a destroy.
    pub fn for_stage(mut self, stage: Stage) -> Self {
        self.stage = stage;
        self
    }

    pub async fn resolve(&self, backend: &StateBackendHandle) -> ConflictReport {
        let mut report = ConflictReport::default();

        self.purge_bucket(&backend.bucket, &mut report).await;
        self.purge_table(&backend.lock_table, &mut report).await;

        if report.removed.is_empty() && report.is_clean() {
            info!("No state backend leftovers for bucket {}", backend.bucket);
        } else {
            info!(
                "Conflict resolution removed {} resources with {} failures",
                report.removed.len(),
                report.failures.len()
            );
        }
        report
    }

    fn transient(&self, report: &mut ConflictReport, resource: &str, error: CloudError) {
        warn!("Could not clean up {}: {}", resource, error);
        report
            .failures
            .push(FailureRecord::transient(self.stage, resource, error));
    }

    async fn purge_bucket(&self, bucket: &str, report: &mut ConflictReport) {
        match self.cloud.bucket_exists(bucket).await {
            Ok(true) => {}
            Ok(false) => {
                debug!("State bucket {} does not exist", bucket);
                return;
            }
            Err(e) if e.is_not_found() => {
                debug!("State bucket {} does not exist", bucket);
                return;
            }
            Err(e) => return self.transient(report, bucket, e),
        }

        let versions = match self.cloud.list_object_versions(bucket).await {
            Ok(versions) => versions,
            Err(e) if e.is_not_found() => {
                debug!("State bucket {} vanished before listing", bucket);
                return;
            }
            Err(e) => return self.transient(report, bucket, e),
        };

        info!(
            "Emptying state bucket {} ({} versions and delete markers)",
            bucket,
            versions.len()
        );

        for version in &versions {
            let id = format!("{}/{}@{}", bucket, version.key, version.version_id);
            match tolerate_absence(self.cloud.delete_object_version(bucket, version).await) {
                Ok(CleanupStatus::Removed) => report.removed(ResourceKind::ObjectVersion, id),
                Ok(CleanupStatus::AlreadyAbsent) => debug!("{} already gone", id),
                Err(e) => self.transient(report, &id, e),
            }
        }

        match tolerate_absence(self.cloud.delete_bucket(bucket).await) {
            Ok(CleanupStatus::Removed) => {
                info!("Deleted state bucket {}", bucket);
                report.removed(ResourceKind::StateBucket, bucket);
            }
            Ok(CleanupStatus::AlreadyAbsent) => debug!("State bucket {} already gone", bucket),
            Err(e) => self.transient(report, bucket, e),
        }
    }

    async fn purge_table(&self, table: &str, report: &mut ConflictReport) {
        match self.cloud.table_exists(table).await {
            Ok(true) => {}
            Ok(false) => {
                debug!("Lock table {} does not exist", table);
                return;
            }
            Err(e) if e.is_not_found() => {
                debug!("Lock table {} does not exist", table);
                return;
            }
            Err(e) => return self.transient(report, table, e),
        }

        match tolerate_absence(self.cloud.delete_table(table).await) {
            Ok(CleanupStatus::Removed) => {}
            Ok(CleanupStatus::AlreadyAbsent) => {
                debug!("Lock table {} already gone", table);
                return;
            }
            Err(e) => return self.transient(report, table, e),
        }

        // the table name cannot be reused until deletion has finished
        match tolerate_absence(self.cloud.wait_table_deleted(table).await) {
            Ok(_) => {
                info!("Deleted lock table {}", table);
                report.removed(ResourceKind::LockTable, table);
            }
            Err(e) => self.transient(report, table, e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::EnvironmentContext;
    use crate::locator::{StateLocator, StateOverrides};
    use cloud::{InMemoryCloud, ObjectVersion};

    fn backend() -> StateBackendHandle {
        let ctx = EnvironmentContext::new("dev", "us-east-1", "neo4j-demos").unwrap();
        StateLocator::default().resolve(&ctx, &StateOverrides::default())
    }

    fn leftover_backend() -> InMemoryCloud {
        InMemoryCloud::new()
            .with_bucket(
                "neo4j-demos-terraform-state-dev",
                vec![
                    ObjectVersion::version("infrastructure/terraform.tfstate", "v1"),
                    ObjectVersion::version("infrastructure/terraform.tfstate", "v2"),
                    ObjectVersion::delete_marker("infrastructure/terraform.tfstate", "m1"),
                ],
            )
            .with_table("neo4j-demos-terraform-locks-dev")
    }

    #[tokio::test]
    async fn test_removes_versioned_bucket_and_table() {
        let cloud = leftover_backend();
        let report = ConflictResolver::new(&cloud).resolve(&backend()).await;

        assert!(report.is_clean());
        assert!(!cloud.has_bucket("neo4j-demos-terraform-state-dev"));
        assert!(!cloud.has_table("neo4j-demos-terraform-locks-dev"));

        let versions = report
            .removed
            .iter()
            .filter(|r| r.kind == ResourceKind::ObjectVersion)
            .count();
        assert_eq!(versions, 3);
        assert!(report
            .removed
            .iter()
            .any(|r| r.kind == ResourceKind::StateBucket));
        assert!(report
            .removed
            .iter()
            .any(|r| r.kind == ResourceKind::LockTable));

        // versions go before the bucket, the table wait after the table delete
        let last_version = cloud.event_index("s3:delete-object:m1").unwrap();
        let bucket = cloud
            .event_index("s3:delete-bucket:neo4j-demos-terraform-state-dev")
            .unwrap();
        assert!(last_version < bucket);
        assert!(
            cloud
                .event_index("dynamodb:delete-table:neo4j-demos-terraform-locks-dev")
                .unwrap()
                < cloud
                    .event_index("dynamodb:wait-table-not-exists:neo4j-demos-terraform-locks-dev")
                    .unwrap()
        );
    }

    #[tokio::test]
    async fn test_idempotent_on_empty_backend() {
        let cloud = InMemoryCloud::new();
        let resolver = ConflictResolver::new(&cloud);

        let first = resolver.resolve(&backend()).await;
        let second = resolver.resolve(&backend()).await;

        assert!(first.removed.is_empty() && first.is_clean());
        assert!(second.removed.is_empty() && second.is_clean());
        assert_eq!(
            cloud.events(),
            vec![
                "s3:head-bucket:neo4j-demos-terraform-state-dev",
                "dynamodb:describe-table:neo4j-demos-terraform-locks-dev",
                "s3:head-bucket:neo4j-demos-terraform-state-dev",
                "dynamodb:describe-table:neo4j-demos-terraform-locks-dev",
            ]
        );
    }

    #[tokio::test]
    async fn test_second_pass_after_cleanup_only_probes() {
        let cloud = leftover_backend();
        let resolver = ConflictResolver::new(&cloud);
        resolver.resolve(&backend()).await;
        let before = cloud.events().len();

        let report = resolver.resolve(&backend()).await;
        assert!(report.removed.is_empty());
        assert_eq!(cloud.events().len(), before + 2);
    }

    #[tokio::test]
    async fn test_failures_are_recorded_not_raised() {
        let cloud = leftover_backend().fail("s3:delete-object", 1);
        let report = ConflictResolver::new(&cloud)
            .for_stage(Stage::BackendPurge)
            .resolve(&backend())
            .await;

        // one version survived, so the bucket delete fails too
        assert_eq!(report.failures.len(), 2);
        assert!(report
            .failures
            .iter()
            .all(|f| f.stage == Stage::BackendPurge));
        assert!(cloud.has_bucket("neo4j-demos-terraform-state-dev"));

        // the lock table is still handled
        assert!(!cloud.has_table("neo4j-demos-terraform-locks-dev"));
    }

    #[tokio::test]
    async fn test_probe_failure_skips_bucket() {
        let cloud = leftover_backend().fail("s3:head-bucket", 1);
        let report = ConflictResolver::new(&cloud).resolve(&backend()).await;

        assert_eq!(report.failures.len(), 1);
        assert!(cloud.events_for("s3:delete-bucket").is_empty());
        assert!(cloud.has_bucket("neo4j-demos-terraform-state-dev"));
    }
}
