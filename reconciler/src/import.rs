//! Binds cloud objects that exist but are missing from Terraform state.
//!
//! Typical case: a previous apply created the ECR repository or the cluster
//! KMS alias, then failed before writing state. A fresh apply would try to
//! create them again and fail with "already exists". Each candidate goes
//! through probe, tracking check and import, and a failure on one never
//! stops the others.

use crate::context::EnvironmentContext;
use crate::outcome::{FailureRecord, ManagedResourceRef, ResourceKind, Stage};
use cloud::{CloudResult, ContainerRegistry, KeyService, LogGroups};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use terraform::{DeclarativeTool, Variables};
use tracing::{debug, info, warn};

/// Import candidate as written in configuration. `name` may use the
/// `{prefix}`, `{environment}`, `{region}` and `{cluster}` placeholders.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportCandidate {
    pub kind: ResourceKind,
    pub name: String,
    pub address: String,
}

impl ImportCandidate {
    pub fn new(kind: ResourceKind, name: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            kind,
            name: name.into(),
            address: address.into(),
        }
    }

    /// Objects known to survive a failed apply in this infrastructure.
    pub fn defaults() -> Vec<Self> {
        vec![
            Self::new(
                ResourceKind::EcrRepository,
                "{prefix}-app-{environment}",
                "aws_ecr_repository.app",
            ),
            Self::new(
                ResourceKind::KmsAlias,
                "alias/eks/{cluster}",
                "module.eks.module.kms.aws_kms_alias.this[\"cluster\"]",
            ),
            Self::new(
                ResourceKind::LogGroup,
                "/aws/eks/{cluster}/cluster",
                "module.eks.aws_cloudwatch_log_group.this[0]",
            ),
        ]
    }

    pub fn resolve(&self, context: &EnvironmentContext, cluster: &str) -> ManagedResourceRef {
        ManagedResourceRef::tracked_at(
            self.kind,
            context.expand_with_cluster(&self.name, cluster),
            self.address.clone(),
        )
    }
}

#[derive(Debug, Clone, Default)]
pub struct ImportReport {
    pub imported: Vec<ManagedResourceRef>,
    pub already_tracked: Vec<ManagedResourceRef>,
    pub absent: Vec<ManagedResourceRef>,
    pub failures: Vec<FailureRecord>,
}

enum TrackedAddresses {
    NotFetched,
    Fetched(BTreeSet<String>),
    Unavailable,
}

pub struct ImportReconciler<'a, C: ?Sized, T: ?Sized> {
    cloud: &'a C,
    tool: &'a T,
    variables: &'a Variables,
}

impl<'a, C, T> ImportReconciler<'a, C, T>
where
    C: ContainerRegistry + KeyService + LogGroups + ?Sized,
    T: DeclarativeTool + ?Sized,
{
    pub fn new(cloud: &'a C, tool: &'a T, variables: &'a Variables) -> Self {
        Self {
            cloud,
            tool,
            variables,
        }
    }

    async fn exists(&self, resource: &ManagedResourceRef) -> CloudResult<bool> {
        let id = resource.external_id.as_str();
        match resource.kind {
            ResourceKind::EcrRepository => self.cloud.repository_exists(id).await,
            ResourceKind::KmsAlias => self.cloud.alias_exists(id).await,
            ResourceKind::LogGroup => self.cloud.log_group_exists(id).await,
            _ => Ok(false),
        }
    }

    /// The address list is fetched on first need and reused for the rest of
    /// the pass.
    async fn is_tracked(
        &self,
        cache: &mut TrackedAddresses,
        address: &str,
        report: &mut ImportReport,
    ) -> Option<bool> {
        if matches!(cache, TrackedAddresses::NotFetched) {
            *cache = match self.tool.state_list().await {
                Ok(addresses) => {
                    debug!("{} addresses in state", addresses.len());
                    TrackedAddresses::Fetched(addresses.into_iter().collect())
                }
                Err(e) => {
                    warn!("Could not list state, skipping imports: {}", e);
                    report
                        .failures
                        .push(FailureRecord::transient(Stage::Import, "state list", e));
                    TrackedAddresses::Unavailable
                }
            };
        }

        match cache {
            TrackedAddresses::Fetched(addresses) => Some(addresses.contains(address)),
            _ => None,
        }
    }

    pub async fn reconcile(&self, candidates: &[ManagedResourceRef]) -> ImportReport {
        let mut report = ImportReport::default();
        let mut tracked = TrackedAddresses::NotFetched;

        for candidate in candidates {
            let Some(address) = candidate.address.as_deref() else {
                warn!("{} has no state address, skipping", candidate);
                continue;
            };
            if !candidate.kind.is_importable() {
                warn!("{} cannot be imported, skipping", candidate);
                continue;
            }

            match self.exists(candidate).await {
                Ok(true) => {}
                Ok(false) => {
                    debug!("{} does not exist", candidate);
                    report.absent.push(candidate.clone());
                    continue;
                }
                Err(e) if e.is_not_found() => {
                    debug!("{} does not exist", candidate);
                    report.absent.push(candidate.clone());
                    continue;
                }
                Err(e) => {
                    warn!("Existence check failed for {}: {}", candidate, e);
                    report.failures.push(FailureRecord::transient(
                        Stage::Import,
                        candidate.external_id.clone(),
                        e,
                    ));
                    continue;
                }
            }

            match self.is_tracked(&mut tracked, address, &mut report).await {
                Some(true) => {
                    debug!("{} already tracked", candidate);
                    report.already_tracked.push(candidate.clone());
                    continue;
                }
                Some(false) => {}
                None => continue,
            }

            info!("Importing {}", candidate);
            match self
                .tool
                .import(address, &candidate.external_id, self.variables)
                .await
            {
                Ok(()) => {
                    if let TrackedAddresses::Fetched(addresses) = &mut tracked {
                        addresses.insert(address.to_string());
                    }
                    report.imported.push(candidate.clone());
                }
                Err(e) => {
                    warn!("Import of {} failed: {}", candidate, e);
                    report.failures.push(FailureRecord::transient(
                        Stage::Import,
                        candidate.external_id.clone(),
                        e,
                    ));
                }
            }
        }

        report
    }
}
