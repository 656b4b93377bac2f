use crate::types::{
    ElasticIp, LoadBalancer, NatGateway, NatGatewayState, NetworkInterface, ObjectVersion,
    ParameterKind,
};
use async_trait::async_trait;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CloudError {
    /// The target does not exist. This is an expected outcome on probe and
    /// delete paths, never a failure in itself.
    #[error("{service} resource not found: {resource}")]
    NotFound { service: String, resource: String },

    #[error("{service} call failed for {resource}: {message}")]
    Api {
        service: String,
        resource: String,
        message: String,
    },

    #[error("Failed to parse {service} response: {source}")]
    Parse {
        service: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Timed out after {seconds}s waiting for {what}")]
    Timeout { what: String, seconds: u64 },

    #[error("Failed to launch {program}: {source}")]
    Launch {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid configuration: {message}")]
    InvalidConfig { message: String },
}

impl CloudError {
    pub fn not_found(service: impl Into<String>, resource: impl Into<String>) -> Self {
        Self::NotFound {
            service: service.into(),
            resource: resource.into(),
        }
    }

    pub fn api(
        service: impl Into<String>,
        resource: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::Api {
            service: service.into(),
            resource: resource.into(),
            message: message.into(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, CloudError::NotFound { .. })
    }
}

pub type CloudResult<T> = Result<T, CloudError>;

/// Result of a delete call once expected absence has been separated from
/// genuine failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CleanupStatus {
    Removed,
    AlreadyAbsent,
}

/// Folds `NotFound` into [`CleanupStatus::AlreadyAbsent`] and passes every
/// other error through.
pub fn tolerate_absence(result: CloudResult<()>) -> CloudResult<CleanupStatus> {
    match result {
        Ok(()) => Ok(CleanupStatus::Removed),
        Err(e) if e.is_not_found() => Ok(CleanupStatus::AlreadyAbsent),
        Err(e) => Err(e),
    }
}

/// Versioned object storage holding the Terraform state.
#[async_trait]
pub trait ObjectStorage: Send + Sync {
    async fn bucket_exists(&self, bucket: &str) -> CloudResult<bool>;

    /// Every object version and delete marker in the bucket, all pages.
    async fn list_object_versions(&self, bucket: &str) -> CloudResult<Vec<ObjectVersion>>;

    async fn delete_object_version(&self, bucket: &str, version: &ObjectVersion)
        -> CloudResult<()>;

    async fn delete_bucket(&self, bucket: &str) -> CloudResult<()>;
}

/// Key-value table used as the Terraform state lock.
#[async_trait]
pub trait LockTable: Send + Sync {
    async fn table_exists(&self, table: &str) -> CloudResult<bool>;

    async fn delete_table(&self, table: &str) -> CloudResult<()>;

    /// Blocks until the table is fully removed.
    async fn wait_table_deleted(&self, table: &str) -> CloudResult<()>;
}

#[async_trait]
pub trait ContainerRegistry: Send + Sync {
    async fn repository_exists(&self, name: &str) -> CloudResult<bool>;
}

#[async_trait]
pub trait KeyService: Send + Sync {
    async fn alias_exists(&self, alias: &str) -> CloudResult<bool>;
}

#[async_trait]
pub trait LogGroups: Send + Sync {
    async fn log_group_exists(&self, name: &str) -> CloudResult<bool>;
}

/// Namespaced key-value store used to hand resource identifiers to other
/// pipelines. Writes are last-writer-wins.
#[async_trait]
pub trait ParameterStore: Send + Sync {
    /// `Ok(None)` when the key has never been written.
    async fn get_parameter(&self, name: &str) -> CloudResult<Option<String>>;

    async fn put_parameter(&self, name: &str, value: &str, kind: ParameterKind)
        -> CloudResult<()>;
}

#[async_trait]
pub trait NetworkApi: Send + Sync {
    /// Looks up a VPC by its `Name` tag.
    async fn find_vpc_by_name(&self, name: &str) -> CloudResult<Option<String>>;

    async fn list_load_balancers(&self, vpc_id: &str) -> CloudResult<Vec<LoadBalancer>>;

    async fn delete_load_balancer(&self, arn: &str) -> CloudResult<()>;

    /// Network interfaces in the VPC that are detached (`available`).
    async fn list_available_network_interfaces(
        &self,
        vpc_id: &str,
    ) -> CloudResult<Vec<NetworkInterface>>;

    async fn delete_network_interface(&self, id: &str) -> CloudResult<()>;

    /// NAT gateways in the VPC that are not already deleted.
    async fn list_nat_gateways(&self, vpc_id: &str) -> CloudResult<Vec<NatGateway>>;

    async fn delete_nat_gateway(&self, id: &str) -> CloudResult<()>;

    async fn nat_gateway_state(&self, id: &str) -> CloudResult<NatGatewayState>;

    /// Elastic IPs carrying the given tag.
    async fn list_addresses(&self, tag_key: &str, tag_value: &str)
        -> CloudResult<Vec<ElasticIp>>;

    async fn release_address(&self, allocation_id: &str) -> CloudResult<()>;
}

/// Managed Kubernetes control plane and the workloads running on it.
#[async_trait]
pub trait ClusterApi: Send + Sync {
    async fn cluster_exists(&self, cluster: &str) -> CloudResult<bool>;

    /// Deletes an application namespace and waits for its finalizers.
    async fn delete_namespace(&self, cluster: &str, namespace: &str) -> CloudResult<()>;

    async fn list_nodegroups(&self, cluster: &str) -> CloudResult<Vec<String>>;

    async fn delete_nodegroup(&self, cluster: &str, nodegroup: &str) -> CloudResult<()>;

    async fn nodegroup_exists(&self, cluster: &str, nodegroup: &str) -> CloudResult<bool>;
}

/// Every service the reconciler touches, behind one handle.
pub trait CloudProvider:
    ObjectStorage
    + LockTable
    + ContainerRegistry
    + KeyService
    + LogGroups
    + ParameterStore
    + NetworkApi
    + ClusterApi
{
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tolerate_absence() {
        assert_eq!(tolerate_absence(Ok(())).unwrap(), CleanupStatus::Removed);

        let absent = tolerate_absence(Err(CloudError::not_found("s3", "bucket")));
        assert_eq!(absent.unwrap(), CleanupStatus::AlreadyAbsent);

        let failed = tolerate_absence(Err(CloudError::api("s3", "bucket", "AccessDenied")));
        assert!(failed.is_err());
    }

    #[test]
    fn test_error_display() {
        let error = CloudError::not_found("ecr", "neo4j-demos-app-dev");
        assert!(error.is_not_found());
        assert_eq!(
            error.to_string(),
            "ecr resource not found: neo4j-demos-app-dev"
        );

        let error = CloudError::Timeout {
            what: "NAT gateway nat-1 deletion".to_string(),
            seconds: 900,
        };
        assert!(error.to_string().contains("900s"));
        assert!(!error.is_not_found());
    }
}
