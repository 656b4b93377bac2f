//! Removal of the objects Terraform cannot delete on its own.
//!
//! Destroy fails when workloads still hold cloud objects the state does not
//! know about: load balancers created by Kubernetes services, detached
//! network interfaces, and Elastic IPs still associated with a NAT gateway.
//! The steps run in dependency order (application layer, nodegroups,
//! network) and each tolerates objects that are already gone. Any other
//! error is retried a bounded number of times at a fixed interval and then
//! returned.

use crate::outcome::{ManagedResourceRef, ResourceKind};
use cloud::{
    tolerate_absence, CleanupStatus, CloudError, CloudResult, ClusterApi, NatGatewayState,
    NetworkApi,
};
use std::collections::BTreeSet;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Fixed-interval retry for a single cloud call. `NotFound` is returned
/// immediately: absence is an answer, not a transient error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub interval: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            interval: Duration::from_secs(10),
        }
    }
}

impl RetryPolicy {
    pub fn new(attempts: u32, interval: Duration) -> Self {
        Self {
            attempts: attempts.max(1),
            interval,
        }
    }

    pub async fn run<T, F, Fut>(&self, what: &str, mut call: F) -> CloudResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = CloudResult<T>>,
    {
        let mut attempt = 1;
        loop {
            match call().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_not_found() || attempt >= self.attempts => return Err(e),
                Err(e) => {
                    warn!(
                        "{} failed (attempt {}/{}): {}",
                        what, attempt, self.attempts, e
                    );
                    pause(self.interval).await;
                    attempt += 1;
                }
            }
        }
    }
}

/// Fixed-interval polling with an upper bound on the number of checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollPolicy {
    pub interval: Duration,
    pub max_polls: u32,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self::from_bounds(Duration::from_secs(15), Duration::from_secs(900))
    }
}

impl PollPolicy {
    pub fn new(interval: Duration, max_polls: u32) -> Self {
        Self {
            interval,
            max_polls: max_polls.max(1),
        }
    }

    /// Polls every `interval` for at most `max_wait`.
    pub fn from_bounds(interval: Duration, max_wait: Duration) -> Self {
        let polls = if interval.as_millis() == 0 {
            1
        } else {
            (max_wait.as_millis() / interval.as_millis()).max(1)
        };
        Self::new(interval, u32::try_from(polls).unwrap_or(u32::MAX))
    }

    pub fn max_wait(&self) -> Duration {
        self.interval * self.max_polls
    }

    /// Calls `check` until it reports true, failing with
    /// [`CloudError::Timeout`] once the poll budget is spent.
    pub async fn until<F, Fut>(&self, what: &str, mut check: F) -> CloudResult<()>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = CloudResult<bool>>,
    {
        for poll in 1..=self.max_polls {
            if check().await? {
                return Ok(());
            }
            debug!("Waiting for {} ({}/{})", what, poll, self.max_polls);
            if poll < self.max_polls {
                pause(self.interval).await;
            }
        }

        Err(CloudError::Timeout {
            what: what.to_string(),
            seconds: self.max_wait().as_secs(),
        })
    }
}

async fn pause(interval: Duration) {
    if !interval.is_zero() {
        tokio::time::sleep(interval).await;
    }
}

pub struct Teardown<'a, C: ?Sized> {
    cloud: &'a C,
    retry: RetryPolicy,
    poll: PollPolicy,
}

impl<'a, C> Teardown<'a, C>
where
    C: NetworkApi + ClusterApi + ?Sized,
{
    pub fn new(cloud: &'a C, retry: RetryPolicy, poll: PollPolicy) -> Self {
        Self { cloud, retry, poll }
    }

    async fn cluster_present(&self, cluster: &str) -> CloudResult<bool> {
        match self
            .retry
            .run("describe cluster", || self.cloud.cluster_exists(cluster))
            .await
        {
            Err(e) if e.is_not_found() => Ok(false),
            other => other,
        }
    }

    /// Deletes the application namespaces so their controllers release load
    /// balancers and volumes.
    pub async fn application_layer(
        &self,
        cluster: &str,
        namespaces: &[String],
        destroyed: &mut Vec<ManagedResourceRef>,
    ) -> CloudResult<()> {
        if !self.cluster_present(cluster).await? {
            info!("Cluster {} not found, application layer already gone", cluster);
            return Ok(());
        }

        for namespace in namespaces {
            let what = format!("delete namespace {}", namespace);
            let result = self
                .retry
                .run(&what, || self.cloud.delete_namespace(cluster, namespace))
                .await;

            match tolerate_absence(result)? {
                CleanupStatus::Removed => {
                    info!("Deleted namespace {} on {}", namespace, cluster);
                    destroyed.push(ManagedResourceRef::new(
                        ResourceKind::Namespace,
                        format!("{}/{}", cluster, namespace),
                    ));
                }
                CleanupStatus::AlreadyAbsent => debug!("Namespace {} already gone", namespace),
            }
        }
        Ok(())
    }

    pub async fn nodegroups(
        &self,
        cluster: &str,
        destroyed: &mut Vec<ManagedResourceRef>,
    ) -> CloudResult<()> {
        if !self.cluster_present(cluster).await? {
            info!("Cluster {} not found, no nodegroups to remove", cluster);
            return Ok(());
        }

        let nodegroups = match self
            .retry
            .run("list nodegroups", || self.cloud.list_nodegroups(cluster))
            .await
        {
            Ok(nodegroups) => nodegroups,
            Err(e) if e.is_not_found() => return Ok(()),
            Err(e) => return Err(e),
        };

        for nodegroup in &nodegroups {
            let what = format!("delete nodegroup {}", nodegroup);
            let result = self
                .retry
                .run(&what, || self.cloud.delete_nodegroup(cluster, nodegroup))
                .await;
            if tolerate_absence(result)? == CleanupStatus::AlreadyAbsent {
                debug!("Nodegroup {} already gone", nodegroup);
                continue;
            }

            info!("Waiting for nodegroup {} to be deleted", nodegroup);
            self.poll
                .until(&format!("nodegroup {} deletion", nodegroup), || async move {
                    match self.cloud.nodegroup_exists(cluster, nodegroup).await {
                        Ok(exists) => Ok(!exists),
                        Err(e) if e.is_not_found() => Ok(true),
                        Err(e) => Err(e),
                    }
                })
                .await?;

            destroyed.push(ManagedResourceRef::new(
                ResourceKind::Nodegroup,
                format!("{}/{}", cluster, nodegroup),
            ));
        }
        Ok(())
    }

    /// Clears the VPC named `vpc_name` of objects that block its deletion.
    ///
    /// Elastic IPs are released only after every NAT gateway has reported
    /// `deleted`; a NAT still holding its address makes the release fail.
    pub async fn network(
        &self,
        vpc_name: &str,
        address_tag: (&str, &str),
        destroyed: &mut Vec<ManagedResourceRef>,
    ) -> CloudResult<()> {
        let vpc = self
            .retry
            .run("describe vpcs", || self.cloud.find_vpc_by_name(vpc_name))
            .await;
        let vpc_id = match vpc {
            Ok(Some(id)) => id,
            Ok(None) => {
                info!("VPC {} not found, no network resources to clean", vpc_name);
                return Ok(());
            }
            Err(e) if e.is_not_found() => return Ok(()),
            Err(e) => return Err(e),
        };
        info!("Cleaning network resources in {} ({})", vpc_name, vpc_id);

        self.load_balancers(&vpc_id, destroyed).await?;
        self.network_interfaces(&vpc_id, destroyed).await?;
        let nat_allocations = self.nat_gateways(&vpc_id, destroyed).await?;
        self.addresses(nat_allocations, address_tag, destroyed).await
    }

    async fn load_balancers(
        &self,
        vpc_id: &str,
        destroyed: &mut Vec<ManagedResourceRef>,
    ) -> CloudResult<()> {
        let balancers = self
            .retry
            .run("describe load balancers", || {
                self.cloud.list_load_balancers(vpc_id)
            })
            .await?;

        for lb in &balancers {
            let what = format!("delete load balancer {}", lb.name);
            let result = self
                .retry
                .run(&what, || self.cloud.delete_load_balancer(&lb.arn))
                .await;
            if tolerate_absence(result)? == CleanupStatus::Removed {
                info!("Deleted load balancer {}", lb.name);
                destroyed.push(ManagedResourceRef::new(
                    ResourceKind::LoadBalancer,
                    lb.arn.clone(),
                ));
            }
        }
        Ok(())
    }

    async fn network_interfaces(
        &self,
        vpc_id: &str,
        destroyed: &mut Vec<ManagedResourceRef>,
    ) -> CloudResult<()> {
        let interfaces = self
            .retry
            .run("describe network interfaces", || {
                self.cloud.list_available_network_interfaces(vpc_id)
            })
            .await?;

        for eni in &interfaces {
            let what = format!("delete network interface {}", eni.id);
            let result = self
                .retry
                .run(&what, || self.cloud.delete_network_interface(&eni.id))
                .await;
            if tolerate_absence(result)? == CleanupStatus::Removed {
                debug!("Deleted network interface {}", eni.id);
                destroyed.push(ManagedResourceRef::new(
                    ResourceKind::NetworkInterface,
                    eni.id.clone(),
                ));
            }
        }
        Ok(())
    }

    /// Deletes every NAT gateway and waits for each to reach `deleted`.
    /// Returns the Elastic IP allocations they held.
    async fn nat_gateways(
        &self,
        vpc_id: &str,
        destroyed: &mut Vec<ManagedResourceRef>,
    ) -> CloudResult<Vec<String>> {
        let gateways = self
            .retry
            .run("describe NAT gateways", || self.cloud.list_nat_gateways(vpc_id))
            .await?;

        let mut allocations = Vec::new();
        for nat in &gateways {
            allocations.extend(nat.allocation_ids.iter().cloned());

            if nat.state.is_going_away() {
                debug!("NAT gateway {} already {}", nat.id, nat.state);
            } else {
                let what = format!("delete NAT gateway {}", nat.id);
                let result = self
                    .retry
                    .run(&what, || self.cloud.delete_nat_gateway(&nat.id))
                    .await;
                tolerate_absence(result)?;
            }
        }

        for nat in &gateways {
            info!("Waiting for NAT gateway {} to be deleted", nat.id);
            self.poll
                .until(&format!("NAT gateway {} deletion", nat.id), || async move {
                    match self.cloud.nat_gateway_state(&nat.id).await {
                        Ok(state) => Ok(state == NatGatewayState::Deleted),
                        Err(e) if e.is_not_found() => Ok(true),
                        Err(e) => Err(e),
                    }
                })
                .await?;

            destroyed.push(ManagedResourceRef::new(
                ResourceKind::NatGateway,
                nat.id.clone(),
            ));
        }
        Ok(allocations)
    }

    async fn addresses(
        &self,
        nat_allocations: Vec<String>,
        (tag_key, tag_value): (&str, &str),
        destroyed: &mut Vec<ManagedResourceRef>,
    ) -> CloudResult<()> {
        let tagged = self
            .retry
            .run("describe addresses", || {
                self.cloud.list_addresses(tag_key, tag_value)
            })
            .await?;

        let mut allocations: BTreeSet<String> = nat_allocations.into_iter().collect();
        for address in tagged {
            if address.is_associated() {
                debug!(
                    "Address {} is still associated, leaving it",
                    address.allocation_id
                );
            } else {
                allocations.insert(address.allocation_id);
            }
        }

        for allocation in &allocations {
            let what = format!("release address {}", allocation);
            let result = self
                .retry
                .run(&what, || self.cloud.release_address(allocation))
                .await;
            if tolerate_absence(result)? == CleanupStatus::Removed {
                info!("Released Elastic IP {}", allocation);
                destroyed.push(ManagedResourceRef::new(
                    ResourceKind::ElasticIp,
                    allocation.clone(),
                ));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cloud::InMemoryCloud;

    const VPC_NAME: &str = "neo4j-demos-dev-vpc";
    const CLUSTER: &str = "neo4j-demos-dev";

    fn fast() -> (RetryPolicy, PollPolicy) {
        (
            RetryPolicy::new(3, Duration::ZERO),
            PollPolicy::new(Duration::ZERO, 5),
        )
    }

    fn teardown(cloud: &InMemoryCloud) -> Teardown<'_, InMemoryCloud> {
        let (retry, poll) = fast();
        Teardown::new(cloud, retry, poll)
    }

    fn network_cloud() -> InMemoryCloud {
        InMemoryCloud::new()
            .with_vpc(VPC_NAME, "vpc-1")
            .with_load_balancer("vpc-1", "k8s-app-ingress")
            .with_available_interface("vpc-1", "eni-1")
            .with_nat_gateway("vpc-1", "nat-1", "eipalloc-nat")
            .with_tagged_address("eipalloc-spare", "Environment", "dev")
            .with_nat_deletion_polls(2)
    }

    #[tokio::test]
    async fn test_retry_policy_stops_on_not_found() {
        let retry = RetryPolicy::new(5, Duration::ZERO);
        let mut calls = 0;
        let result: CloudResult<()> = retry
            .run("probe", || {
                calls += 1;
                async { Err(CloudError::not_found("ec2", "nat-1")) }
            })
            .await;
        assert!(result.unwrap_err().is_not_found());
        assert_eq!(calls, 1);
    }

    #[tokio::test]
    async fn test_retry_policy_is_bounded() {
        let retry = RetryPolicy::new(3, Duration::ZERO);
        let mut calls = 0;
        let result: CloudResult<()> = retry
            .run("delete", || {
                calls += 1;
                async { Err(CloudError::api("ec2", "nat-1", "RequestLimitExceeded")) }
            })
            .await;
        assert!(result.is_err());
        assert_eq!(calls, 3);
    }

    #[tokio::test]
    async fn test_poll_policy_times_out() {
        let poll = PollPolicy::new(Duration::ZERO, 4);
        let mut checks = 0;
        let result = poll
            .until("never", || {
                checks += 1;
                async { Ok(false) }
            })
            .await;
        assert!(matches!(result, Err(CloudError::Timeout { .. })));
        assert_eq!(checks, 4);
    }

    #[test]
    fn test_poll_bounds() {
        let poll = PollPolicy::from_bounds(Duration::from_secs(15), Duration::from_secs(900));
        assert_eq!(poll.max_polls, 60);
        assert_eq!(poll.max_wait(), Duration::from_secs(900));
    }

    #[test]
    fn test_sub_millisecond_poll_interval() {
        let poll = PollPolicy::from_bounds(Duration::from_micros(500), Duration::from_secs(1));
        assert_eq!(poll.max_polls, 1);
    }

    #[tokio::test]
    async fn test_nat_deleted_before_address_release() {
        let cloud = network_cloud();
        let mut destroyed = Vec::new();

        teardown(&cloud)
            .network(VPC_NAME, ("Environment", "dev"), &mut destroyed)
            .await
            .unwrap();

        let nat_deleted = cloud
            .event_index("ec2:nat-gateway-state:nat-1=deleted")
            .unwrap();
        let release = cloud
            .event_index("ec2:release-address:eipalloc-nat")
            .unwrap();
        assert!(nat_deleted < release);
        assert_eq!(cloud.address_count(), 0);

        let kinds: Vec<ResourceKind> = destroyed.iter().map(|r| r.kind).collect();
        assert_eq!(
            kinds,
            vec![
                ResourceKind::LoadBalancer,
                ResourceKind::NetworkInterface,
                ResourceKind::NatGateway,
                ResourceKind::ElasticIp,
                ResourceKind::ElasticIp,
            ]
        );
    }

    #[tokio::test]
    async fn test_nat_timeout_leaves_addresses() {
        let cloud = network_cloud().with_nat_deletion_polls(50);
        let mut destroyed = Vec::new();

        let result = teardown(&cloud)
            .network(VPC_NAME, ("Environment", "dev"), &mut destroyed)
            .await;

        assert!(matches!(result, Err(CloudError::Timeout { .. })));
        assert!(cloud.events_for("ec2:release-address").is_empty());
        assert_eq!(cloud.address_count(), 2);
    }

    #[tokio::test]
    async fn test_missing_vpc_is_nothing_to_clean() {
        let cloud = InMemoryCloud::new();
        let mut destroyed = Vec::new();

        teardown(&cloud)
            .network(VPC_NAME, ("Environment", "dev"), &mut destroyed)
            .await
            .unwrap();
        assert!(destroyed.is_empty());
        assert_eq!(cloud.events(), vec!["ec2:describe-vpcs:neo4j-demos-dev-vpc"]);
    }

    #[tokio::test]
    async fn test_transient_errors_are_retried() {
        let cloud = network_cloud().fail("elbv2:delete-load-balancer", 2);
        let mut destroyed = Vec::new();

        teardown(&cloud)
            .network(VPC_NAME, ("Environment", "dev"), &mut destroyed)
            .await
            .unwrap();
        assert_eq!(cloud.events_for("elbv2:delete-load-balancer").len(), 3);
    }

    #[tokio::test]
    async fn test_persistent_error_is_returned() {
        let cloud = network_cloud().fail("ec2:delete-nat-gateway", 10);
        let mut destroyed = Vec::new();

        let result = teardown(&cloud)
            .network(VPC_NAME, ("Environment", "dev"), &mut destroyed)
            .await;
        assert!(matches!(result, Err(CloudError::Api { .. })));
        assert!(cloud.events_for("ec2:release-address").is_empty());
    }

    #[tokio::test]
    async fn test_application_layer_and_nodegroups() {
        let cloud = InMemoryCloud::new().with_cluster(CLUSTER, &["neo4j-app"], &["general"]);
        let teardown = teardown(&cloud);
        let mut destroyed = Vec::new();

        teardown
            .application_layer(
                CLUSTER,
                &["neo4j-app".to_string(), "monitoring".to_string()],
                &mut destroyed,
            )
            .await
            .unwrap();
        teardown.nodegroups(CLUSTER, &mut destroyed).await.unwrap();

        assert!(cloud.namespaces(CLUSTER).is_empty());
        assert!(cloud.nodegroups(CLUSTER).is_empty());
        assert!(destroyed
            .iter()
            .any(|r| r.kind == ResourceKind::Nodegroup && r.external_id == "neo4j-demos-dev/general"));
        assert!(
            cloud.event_index("kubectl:delete-namespace:neo4j-app").unwrap()
                < cloud.event_index("eks:delete-nodegroup:general").unwrap()
        );
    }

    #[tokio::test]
    async fn test_missing_cluster_is_already_gone() {
        let cloud = InMemoryCloud::new();
        let teardown = teardown(&cloud);
        let mut destroyed = Vec::new();

        teardown
            .application_layer(CLUSTER, &["neo4j-app".to_string()], &mut destroyed)
            .await
            .unwrap();
        teardown.nodegroups(CLUSTER, &mut destroyed).await.unwrap();

        assert!(destroyed.is_empty());
        assert!(cloud.events_for("kubectl:delete-namespace").is_empty());
        assert!(cloud.events_for("eks:delete-nodegroup").is_empty());
    }
}
