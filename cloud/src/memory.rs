//! In-memory cloud used by tests across the workspace.
//!
//! Behaves like the real services where the reconciler depends on it: a
//! versioned bucket cannot be deleted while versions remain, an Elastic IP
//! cannot be released while a live NAT gateway holds it, and NAT gateways
//! take a configurable number of polls to go from `deleting` to `deleted`.
//! Every call is appended to an event log so tests can assert on ordering
//! and on the absence of calls.

use crate::provider::{
    CloudError, CloudProvider, CloudResult, ClusterApi, ContainerRegistry, KeyService, LockTable,
    LogGroups, NetworkApi, ObjectStorage, ParameterStore,
};
use crate::types::{
    ElasticIp, LoadBalancer, NatGateway, NatGatewayState, NetworkInterface, ObjectVersion,
    ParameterKind,
};
use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Mutex, MutexGuard};

#[derive(Debug, Clone)]
struct MemoryNat {
    vpc_id: String,
    gateway: NatGateway,
    polls_until_deleted: u32,
}

#[derive(Debug, Clone)]
struct MemoryAddress {
    address: ElasticIp,
    tags: BTreeMap<String, String>,
    held_by_nat: Option<String>,
}

#[derive(Debug, Default)]
struct MemoryCluster {
    namespaces: BTreeSet<String>,
    nodegroups: BTreeSet<String>,
}

#[derive(Debug, Default)]
struct State {
    buckets: BTreeMap<String, Vec<ObjectVersion>>,
    tables: BTreeSet<String>,
    repositories: BTreeSet<String>,
    aliases: BTreeSet<String>,
    log_groups: BTreeSet<String>,
    parameters: BTreeMap<String, (String, ParameterKind)>,
    vpcs: BTreeMap<String, String>,
    load_balancers: Vec<(String, LoadBalancer)>,
    interfaces: Vec<(String, NetworkInterface)>,
    nats: Vec<MemoryNat>,
    addresses: Vec<MemoryAddress>,
    clusters: BTreeMap<String, MemoryCluster>,
    nat_deletion_polls: u32,
    /// Operation name -> remaining number of injected failures
    failures: HashMap<String, u32>,
    events: Vec<String>,
}

#[derive(Debug, Default)]
pub struct InMemoryCloud {
    state: Mutex<State>,
}

impl InMemoryCloud {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Records the call and returns an injected failure if one is pending.
    fn enter(state: &mut State, operation: &str, resource: &str) -> CloudResult<()> {
        state.events.push(format!("{}:{}", operation, resource));

        if let Some(remaining) = state.failures.get_mut(operation) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(CloudError::api(
                    "memory",
                    resource,
                    format!("injected failure for {}", operation),
                ));
            }
        }
        Ok(())
    }

    pub fn with_bucket(self, name: &str, versions: Vec<ObjectVersion>) -> Self {
        self.state().buckets.insert(name.to_string(), versions);
        self
    }

    pub fn with_table(self, name: &str) -> Self {
        self.state().tables.insert(name.to_string());
        self
    }

    pub fn with_repository(self, name: &str) -> Self {
        self.state().repositories.insert(name.to_string());
        self
    }

    pub fn with_alias(self, alias: &str) -> Self {
        self.state().aliases.insert(alias.to_string());
        self
    }

    pub fn with_log_group(self, name: &str) -> Self {
        self.state().log_groups.insert(name.to_string());
        self
    }

    pub fn with_parameter(self, name: &str, value: &str) -> Self {
        self.state()
            .parameters
            .insert(name.to_string(), (value.to_string(), ParameterKind::String));
        self
    }

    pub fn with_vpc(self, name: &str, vpc_id: &str) -> Self {
        self.state()
            .vpcs
            .insert(name.to_string(), vpc_id.to_string());
        self
    }

    pub fn with_load_balancer(self, vpc_id: &str, name: &str) -> Self {
        self.state().load_balancers.push((
            vpc_id.to_string(),
            LoadBalancer {
                arn: format!("arn:aws:elasticloadbalancing:lb/{}", name),
                name: name.to_string(),
            },
        ));
        self
    }

    pub fn with_available_interface(self, vpc_id: &str, id: &str) -> Self {
        self.state().interfaces.push((
            vpc_id.to_string(),
            NetworkInterface {
                id: id.to_string(),
                status: "available".to_string(),
            },
        ));
        self
    }

    /// Adds a NAT gateway holding the given Elastic IP allocation.
    pub fn with_nat_gateway(self, vpc_id: &str, id: &str, allocation_id: &str) -> Self {
        {
            let mut state = self.state();
            state.nats.push(MemoryNat {
                vpc_id: vpc_id.to_string(),
                gateway: NatGateway {
                    id: id.to_string(),
                    state: NatGatewayState::Available,
                    allocation_ids: vec![allocation_id.to_string()],
                },
                polls_until_deleted: 0,
            });
            state.addresses.push(MemoryAddress {
                address: ElasticIp {
                    allocation_id: allocation_id.to_string(),
                    public_ip: None,
                    association_id: Some(format!("eipassoc-{}", id)),
                },
                tags: BTreeMap::new(),
                held_by_nat: Some(id.to_string()),
            });
        }
        self
    }

    pub fn with_tagged_address(self, allocation_id: &str, tag_key: &str, tag_value: &str) -> Self {
        let mut tags = BTreeMap::new();
        tags.insert(tag_key.to_string(), tag_value.to_string());
        self.state().addresses.push(MemoryAddress {
            address: ElasticIp {
                allocation_id: allocation_id.to_string(),
                public_ip: None,
                association_id: None,
            },
            tags,
            held_by_nat: None,
        });
        self
    }

    pub fn with_cluster(self, cluster: &str, namespaces: &[&str], nodegroups: &[&str]) -> Self {
        self.state().clusters.insert(
            cluster.to_string(),
            MemoryCluster {
                namespaces: namespaces.iter().map(|s| s.to_string()).collect(),
                nodegroups: nodegroups.iter().map(|s| s.to_string()).collect(),
            },
        );
        self
    }

    /// Number of state polls a deleted NAT gateway reports `deleting` for.
    pub fn with_nat_deletion_polls(self, polls: u32) -> Self {
        self.state().nat_deletion_polls = polls;
        self
    }

    /// Makes the next `times` calls of `operation` fail with an API error.
    pub fn fail(self, operation: &str, times: u32) -> Self {
        self.state().failures.insert(operation.to_string(), times);
        self
    }

    pub fn events(&self) -> Vec<String> {
        self.state().events.clone()
    }

    pub fn events_for(&self, operation: &str) -> Vec<String> {
        let prefix = format!("{}:", operation);
        self.state()
            .events
            .iter()
            .filter(|e| e.starts_with(&prefix))
            .cloned()
            .collect()
    }

    /// Position of the first event equal to `event`.
    pub fn event_index(&self, event: &str) -> Option<usize> {
        self.state().events.iter().position(|e| e == event)
    }

    pub fn has_bucket(&self, name: &str) -> bool {
        self.state().buckets.contains_key(name)
    }

    pub fn has_table(&self, name: &str) -> bool {
        self.state().tables.contains(name)
    }

    pub fn parameter(&self, name: &str) -> Option<(String, ParameterKind)> {
        self.state().parameters.get(name).cloned()
    }

    pub fn address_count(&self) -> usize {
        self.state().addresses.len()
    }

    pub fn nodegroups(&self, cluster: &str) -> Vec<String> {
        self.state()
            .clusters
            .get(cluster)
            .map(|c| c.nodegroups.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn namespaces(&self, cluster: &str) -> Vec<String> {
        self.state()
            .clusters
            .get(cluster)
            .map(|c| c.namespaces.iter().cloned().collect())
            .unwrap_or_default()
    }
}

#[async_trait]
impl ObjectStorage for InMemoryCloud {
    async fn bucket_exists(&self, bucket: &str) -> CloudResult<bool> {
        let mut state = self.state();
        Self::enter(&mut state, "s3:head-bucket", bucket)?;
        Ok(state.buckets.contains_key(bucket))
    }

    async fn list_object_versions(&self, bucket: &str) -> CloudResult<Vec<ObjectVersion>> {
        let mut state = self.state();
        Self::enter(&mut state, "s3:list-object-versions", bucket)?;
        state
            .buckets
            .get(bucket)
            .cloned()
            .ok_or_else(|| CloudError::not_found("s3", bucket))
    }

    async fn delete_object_version(
        &self,
        bucket: &str,
        version: &ObjectVersion,
    ) -> CloudResult<()> {
        let mut state = self.state();
        Self::enter(&mut state, "s3:delete-object", &version.version_id)?;
        let versions = state
            .buckets
            .get_mut(bucket)
            .ok_or_else(|| CloudError::not_found("s3", bucket))?;
        let before = versions.len();
        versions.retain(|v| v != version);
        if versions.len() == before {
            return Err(CloudError::not_found("s3", &version.version_id));
        }
        Ok(())
    }

    async fn delete_bucket(&self, bucket: &str) -> CloudResult<()> {
        let mut state = self.state();
        Self::enter(&mut state, "s3:delete-bucket", bucket)?;
        match state.buckets.get(bucket) {
            None => Err(CloudError::not_found("s3", bucket)),
            Some(versions) if !versions.is_empty() => Err(CloudError::api(
                "s3",
                bucket,
                "BucketNotEmpty: The bucket you tried to delete is not empty",
            )),
            Some(_) => {
                state.buckets.remove(bucket);
                Ok(())
            }
        }
    }
}

#[async_trait]
impl LockTable for InMemoryCloud {
    async fn table_exists(&self, table: &str) -> CloudResult<bool> {
        let mut state = self.state();
        Self::enter(&mut state, "dynamodb:describe-table", table)?;
        Ok(state.tables.contains(table))
    }

    async fn delete_table(&self, table: &str) -> CloudResult<()> {
        let mut state = self.state();
        Self::enter(&mut state, "dynamodb:delete-table", table)?;
        if state.tables.remove(table) {
            Ok(())
        } else {
            Err(CloudError::not_found("dynamodb", table))
        }
    }

    async fn wait_table_deleted(&self, table: &str) -> CloudResult<()> {
        let mut state = self.state();
        Self::enter(&mut state, "dynamodb:wait-table-not-exists", table)?;
        Ok(())
    }
}

#[async_trait]
impl ContainerRegistry for InMemoryCloud {
    async fn repository_exists(&self, name: &str) -> CloudResult<bool> {
        let mut state = self.state();
        Self::enter(&mut state, "ecr:describe-repositories", name)?;
        Ok(state.repositories.contains(name))
    }
}

#[async_trait]
impl KeyService for InMemoryCloud {
    async fn alias_exists(&self, alias: &str) -> CloudResult<bool> {
        let mut state = self.state();
        Self::enter(&mut state, "kms:list-aliases", alias)?;
        Ok(state.aliases.contains(alias))
    }
}

#[async_trait]
impl LogGroups for InMemoryCloud {
    async fn log_group_exists(&self, name: &str) -> CloudResult<bool> {
        let mut state = self.state();
        Self::enter(&mut state, "logs:describe-log-groups", name)?;
        Ok(state.log_groups.contains(name))
    }
}

#[async_trait]
impl ParameterStore for InMemoryCloud {
    async fn get_parameter(&self, name: &str) -> CloudResult<Option<String>> {
        let mut state = self.state();
        Self::enter(&mut state, "ssm:get-parameter", name)?;
        Ok(state.parameters.get(name).map(|(value, _)| value.clone()))
    }

    async fn put_parameter(
        &self,
        name: &str,
        value: &str,
        kind: ParameterKind,
    ) -> CloudResult<()> {
        let mut state = self.state();
        Self::enter(&mut state, "ssm:put-parameter", name)?;
        state
            .parameters
            .insert(name.to_string(), (value.to_string(), kind));
        Ok(())
    }
}

#[async_trait]
impl NetworkApi for InMemoryCloud {
    async fn find_vpc_by_name(&self, name: &str) -> CloudResult<Option<String>> {
        let mut state = self.state();
        Self::enter(&mut state, "ec2:describe-vpcs", name)?;
        Ok(state.vpcs.get(name).cloned())
    }

    async fn list_load_balancers(&self, vpc_id: &str) -> CloudResult<Vec<LoadBalancer>> {
        let mut state = self.state();
        Self::enter(&mut state, "elbv2:describe-load-balancers", vpc_id)?;
        Ok(state
            .load_balancers
            .iter()
            .filter(|(vpc, _)| vpc == vpc_id)
            .map(|(_, lb)| lb.clone())
            .collect())
    }

    async fn delete_load_balancer(&self, arn: &str) -> CloudResult<()> {
        let mut state = self.state();
        Self::enter(&mut state, "elbv2:delete-load-balancer", arn)?;
        let before = state.load_balancers.len();
        state.load_balancers.retain(|(_, lb)| lb.arn != arn);
        if state.load_balancers.len() == before {
            return Err(CloudError::not_found("elbv2", arn));
        }
        Ok(())
    }

    async fn list_available_network_interfaces(
        &self,
        vpc_id: &str,
    ) -> CloudResult<Vec<NetworkInterface>> {
        let mut state = self.state();
        Self::enter(&mut state, "ec2:describe-network-interfaces", vpc_id)?;
        Ok(state
            .interfaces
            .iter()
            .filter(|(vpc, eni)| vpc == vpc_id && eni.status == "available")
            .map(|(_, eni)| eni.clone())
            .collect())
    }

    async fn delete_network_interface(&self, id: &str) -> CloudResult<()> {
        let mut state = self.state();
        Self::enter(&mut state, "ec2:delete-network-interface", id)?;
        let before = state.interfaces.len();
        state.interfaces.retain(|(_, eni)| eni.id != id);
        if state.interfaces.len() == before {
            return Err(CloudError::not_found("ec2", id));
        }
        Ok(())
    }

    async fn list_nat_gateways(&self, vpc_id: &str) -> CloudResult<Vec<NatGateway>> {
        let mut state = self.state();
        Self::enter(&mut state, "ec2:describe-nat-gateways", vpc_id)?;
        Ok(state
            .nats
            .iter()
            .filter(|nat| nat.vpc_id == vpc_id && nat.gateway.state != NatGatewayState::Deleted)
            .map(|nat| nat.gateway.clone())
            .collect())
    }

    async fn delete_nat_gateway(&self, id: &str) -> CloudResult<()> {
        let mut state = self.state();
        Self::enter(&mut state, "ec2:delete-nat-gateway", id)?;
        let polls = state.nat_deletion_polls;
        let nat = state
            .nats
            .iter_mut()
            .find(|nat| nat.gateway.id == id && nat.gateway.state != NatGatewayState::Deleted)
            .ok_or_else(|| CloudError::not_found("ec2", id))?;
        nat.gateway.state = NatGatewayState::Deleting;
        nat.polls_until_deleted = polls;
        Ok(())
    }

    async fn nat_gateway_state(&self, id: &str) -> CloudResult<NatGatewayState> {
        let mut state = self.state();
        Self::enter(&mut state, "ec2:nat-gateway-state", id)?;

        let nat = state
            .nats
            .iter_mut()
            .find(|nat| nat.gateway.id == id)
            .ok_or_else(|| CloudError::not_found("ec2", id))?;

        if nat.gateway.state == NatGatewayState::Deleting {
            if nat.polls_until_deleted == 0 {
                nat.gateway.state = NatGatewayState::Deleted;
            } else {
                nat.polls_until_deleted -= 1;
            }
        }
        let current = nat.gateway.state;

        if current == NatGatewayState::Deleted {
            for address in state.addresses.iter_mut() {
                if address.held_by_nat.as_deref() == Some(id) {
                    address.held_by_nat = None;
                    address.address.association_id = None;
                }
            }
        }

        state.events.push(format!("ec2:nat-gateway-state:{}={}", id, current));
        Ok(current)
    }

    async fn list_addresses(&self, tag_key: &str, tag_value: &str) -> CloudResult<Vec<ElasticIp>> {
        let mut state = self.state();
        Self::enter(&mut state, "ec2:describe-addresses", tag_value)?;
        Ok(state
            .addresses
            .iter()
            .filter(|a| a.tags.get(tag_key).map(String::as_str) == Some(tag_value))
            .map(|a| a.address.clone())
            .collect())
    }

    async fn release_address(&self, allocation_id: &str) -> CloudResult<()> {
        let mut state = self.state();
        Self::enter(&mut state, "ec2:release-address", allocation_id)?;

        let position = state
            .addresses
            .iter()
            .position(|a| a.address.allocation_id == allocation_id)
            .ok_or_else(|| CloudError::not_found("ec2", allocation_id))?;

        if state.addresses[position].held_by_nat.is_some() {
            return Err(CloudError::api(
                "ec2",
                allocation_id,
                "InvalidIPAddress.InUse: address is associated with a NAT gateway",
            ));
        }

        state.addresses.remove(position);
        Ok(())
    }
}

#[async_trait]
impl ClusterApi for InMemoryCloud {
    async fn cluster_exists(&self, cluster: &str) -> CloudResult<bool> {
        let mut state = self.state();
        Self::enter(&mut state, "eks:describe-cluster", cluster)?;
        Ok(state.clusters.contains_key(cluster))
    }

    async fn delete_namespace(&self, cluster: &str, namespace: &str) -> CloudResult<()> {
        let mut state = self.state();
        Self::enter(&mut state, "kubectl:delete-namespace", namespace)?;
        let found = state
            .clusters
            .get_mut(cluster)
            .ok_or_else(|| CloudError::not_found("eks", cluster))?;
        // --ignore-not-found: a missing namespace is success
        found.namespaces.remove(namespace);
        Ok(())
    }

    async fn list_nodegroups(&self, cluster: &str) -> CloudResult<Vec<String>> {
        let mut state = self.state();
        Self::enter(&mut state, "eks:list-nodegroups", cluster)?;
        state
            .clusters
            .get(cluster)
            .map(|c| c.nodegroups.iter().cloned().collect())
            .ok_or_else(|| CloudError::not_found("eks", cluster))
    }

    async fn delete_nodegroup(&self, cluster: &str, nodegroup: &str) -> CloudResult<()> {
        let mut state = self.state();
        Self::enter(&mut state, "eks:delete-nodegroup", nodegroup)?;
        let found = state
            .clusters
            .get_mut(cluster)
            .ok_or_else(|| CloudError::not_found("eks", cluster))?;
        if found.nodegroups.remove(nodegroup) {
            Ok(())
        } else {
            Err(CloudError::not_found("eks", nodegroup))
        }
    }

    async fn nodegroup_exists(&self, cluster: &str, nodegroup: &str) -> CloudResult<bool> {
        let mut state = self.state();
        Self::enter(&mut state, "eks:describe-nodegroup", nodegroup)?;
        Ok(state
            .clusters
            .get(cluster)
            .is_some_and(|c| c.nodegroups.contains(nodegroup)))
    }
}

impl CloudProvider for InMemoryCloud {}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_versioned_bucket_blocks_deletion() {
        let cloud = InMemoryCloud::new()
            .with_bucket("state", vec![ObjectVersion::version("k", "v1")]);

        assert!(cloud.delete_bucket("state").await.is_err());
        cloud
            .delete_object_version("state", &ObjectVersion::version("k", "v1"))
            .await
            .unwrap();
        cloud.delete_bucket("state").await.unwrap();
        assert!(!cloud.has_bucket("state"));
        assert!(cloud.delete_bucket("state").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_address_held_by_nat_until_deleted() {
        let cloud = InMemoryCloud::new()
            .with_nat_gateway("vpc-1", "nat-1", "eipalloc-1")
            .with_nat_deletion_polls(1);

        assert!(cloud.release_address("eipalloc-1").await.is_err());

        cloud.delete_nat_gateway("nat-1").await.unwrap();
        assert_eq!(
            cloud.nat_gateway_state("nat-1").await.unwrap(),
            NatGatewayState::Deleting
        );
        assert_eq!(
            cloud.nat_gateway_state("nat-1").await.unwrap(),
            NatGatewayState::Deleted
        );

        cloud.release_address("eipalloc-1").await.unwrap();
        assert_eq!(cloud.address_count(), 0);
    }

    #[tokio::test]
    async fn test_injected_failures_are_consumed() {
        let cloud = InMemoryCloud::new()
            .with_table("locks")
            .fail("dynamodb:delete-table", 1);

        assert!(cloud.delete_table("locks").await.is_err());
        cloud.delete_table("locks").await.unwrap();
        assert_eq!(cloud.events_for("dynamodb:delete-table").len(), 2);
    }
}
