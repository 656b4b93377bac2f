//! Cloud provider backed by the `aws` and `kubectl` command-line tools.
//!
//! Every call runs with `--output json` and an empty `AWS_PAGER`; responses
//! are parsed into private response structs. Error text on stderr is
//! classified so that a missing resource becomes [`CloudError::NotFound`]
//! rather than a generic API failure.

use crate::config::AwsCliConfig;
use crate::process::{CommandRunner, CommandSpec, SystemRunner};
use crate::provider::{
    CloudError, CloudProvider, CloudResult, ClusterApi, ContainerRegistry, KeyService, LockTable,
    LogGroups, NetworkApi, ObjectStorage, ParameterStore,
};
use crate::types::{
    ElasticIp, LoadBalancer, NatGateway, NatGatewayState, NetworkInterface, ObjectVersion,
    ParameterKind,
};
use async_trait::async_trait;
use regex::Regex;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tracing::{debug, warn};

const NOT_FOUND_PATTERN: &str = r"NoSuchBucket|NoSuchEntity|\(404\)|Not Found|NotFound";

pub struct AwsCli<R = SystemRunner> {
    config: AwsCliConfig,
    runner: R,
    not_found: Regex,
}

impl AwsCli<SystemRunner> {
    pub fn with_system_runner(config: AwsCliConfig) -> CloudResult<Self> {
        Self::new(config, SystemRunner::new())
    }
}

impl<R: CommandRunner> AwsCli<R> {
    pub fn new(config: AwsCliConfig, runner: R) -> CloudResult<Self> {
        config
            .validate()
            .map_err(|message| CloudError::InvalidConfig { message })?;

        let not_found = Regex::new(NOT_FOUND_PATTERN).map_err(|e| CloudError::InvalidConfig {
            message: format!("not-found pattern: {}", e),
        })?;

        Ok(Self {
            config,
            runner,
            not_found,
        })
    }

    pub fn config(&self) -> &AwsCliConfig {
        &self.config
    }

    pub fn runner(&self) -> &R {
        &self.runner
    }

    fn aws(&self, service: &str, operation: &str) -> CommandSpec {
        let mut spec = CommandSpec::new(&self.config.binary)
            .args([service, operation])
            .args(["--region", self.config.region.as_str()])
            .args(["--output", "json"])
            .env("AWS_PAGER", "");

        if let Some(profile) = &self.config.profile {
            spec = spec.args(["--profile", profile.as_str()]);
        }

        spec
    }

    fn is_not_found(&self, stderr: &str) -> bool {
        self.not_found.is_match(stderr)
    }

    async fn call(&self, spec: CommandSpec, service: &str, resource: &str) -> CloudResult<String> {
        debug!("{} call: {}", service, spec);

        let output = self
            .runner
            .run(&spec)
            .await
            .map_err(|source| CloudError::Launch {
                program: spec.program.clone(),
                source,
            })?;

        if output.is_success() {
            return Ok(output.stdout);
        }

        if self.is_not_found(&output.stderr) {
            return Err(CloudError::not_found(service, resource));
        }

        Err(CloudError::api(service, resource, output.stderr.trim()))
    }

    async fn call_json<T: DeserializeOwned>(
        &self,
        spec: CommandSpec,
        service: &str,
        resource: &str,
    ) -> CloudResult<T> {
        let stdout = self.call(spec, service, resource).await?;
        let body = if stdout.trim().is_empty() {
            "{}"
        } else {
            stdout.as_str()
        };

        serde_json::from_str(body).map_err(|source| CloudError::Parse {
            service: service.to_string(),
            source,
        })
    }

    async fn probe(&self, spec: CommandSpec, service: &str, resource: &str) -> CloudResult<bool> {
        match self.call(spec, service, resource).await {
            Ok(_) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn update_kubeconfig(&self, cluster: &str) -> CloudResult<()> {
        let spec = self
            .aws("eks", "update-kubeconfig")
            .args(["--name", cluster, "--alias", cluster]);
        self.call(spec, "eks", cluster).await.map(|_| ())
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ListObjectVersionsResponse {
    #[serde(default)]
    versions: Vec<VersionEntry>,
    #[serde(default)]
    delete_markers: Vec<VersionEntry>,
    #[serde(default)]
    is_truncated: bool,
    next_key_marker: Option<String>,
    next_version_id_marker: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct VersionEntry {
    key: String,
    version_id: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ListAliasesResponse {
    #[serde(default)]
    aliases: Vec<AliasEntry>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct AliasEntry {
    alias_name: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct DescribeLogGroupsResponse {
    #[serde(default)]
    log_groups: Vec<LogGroupEntry>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct LogGroupEntry {
    log_group_name: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct GetParameterResponse {
    parameter: ParameterEntry,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ParameterEntry {
    value: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct DescribeVpcsResponse {
    #[serde(default)]
    vpcs: Vec<VpcEntry>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct VpcEntry {
    vpc_id: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct DescribeLoadBalancersResponse {
    #[serde(default)]
    load_balancers: Vec<LoadBalancerEntry>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct LoadBalancerEntry {
    load_balancer_arn: String,
    load_balancer_name: String,
    vpc_id: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct DescribeNetworkInterfacesResponse {
    #[serde(default)]
    network_interfaces: Vec<NetworkInterfaceEntry>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct NetworkInterfaceEntry {
    network_interface_id: String,
    status: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct DescribeNatGatewaysResponse {
    #[serde(default)]
    nat_gateways: Vec<NatGatewayEntry>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct NatGatewayEntry {
    nat_gateway_id: String,
    state: NatGatewayState,
    #[serde(default)]
    nat_gateway_addresses: Vec<NatGatewayAddressEntry>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct NatGatewayAddressEntry {
    allocation_id: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct DescribeAddressesResponse {
    #[serde(default)]
    addresses: Vec<AddressEntry>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct AddressEntry {
    allocation_id: Option<String>,
    public_ip: Option<String>,
    association_id: Option<String>,
}

#[derive(Deserialize)]
struct ListNodegroupsResponse {
    #[serde(default)]
    nodegroups: Vec<String>,
}

#[async_trait]
impl<R: CommandRunner> ObjectStorage for AwsCli<R> {
    async fn bucket_exists(&self, bucket: &str) -> CloudResult<bool> {
        let spec = self.aws("s3api", "head-bucket").args(["--bucket", bucket]);
        self.probe(spec, "s3", bucket).await
    }

    async fn list_object_versions(&self, bucket: &str) -> CloudResult<Vec<ObjectVersion>> {
        let mut versions = Vec::new();
        let mut markers: Option<(String, String)> = None;

        loop {
            let mut spec = self
                .aws("s3api", "list-object-versions")
                .args(["--bucket", bucket, "--no-paginate"]);
            if let Some((key_marker, version_marker)) = &markers {
                spec = spec.args([
                    "--key-marker",
                    key_marker.as_str(),
                    "--version-id-marker",
                    version_marker.as_str(),
                ]);
            }

            let page: ListObjectVersionsResponse = self.call_json(spec, "s3", bucket).await?;

            versions.extend(
                page.versions
                    .into_iter()
                    .map(|v| ObjectVersion::version(v.key, v.version_id)),
            );
            versions.extend(
                page.delete_markers
                    .into_iter()
                    .map(|m| ObjectVersion::delete_marker(m.key, m.version_id)),
            );

            match (
                page.is_truncated,
                page.next_key_marker,
                page.next_version_id_marker,
            ) {
                (true, Some(key), Some(version)) => markers = Some((key, version)),
                (true, _, _) => {
                    warn!(
                        "Version listing of {} is truncated without a continuation marker",
                        bucket
                    );
                    return Err(CloudError::api(
                        "s3",
                        bucket,
                        format!(
                            "truncated version listing without markers after {} entries",
                            versions.len()
                        ),
                    ));
                }
                (false, _, _) => break,
            }
        }

        debug!("Bucket {} holds {} versions", bucket, versions.len());
        Ok(versions)
    }

    async fn delete_object_version(
        &self,
        bucket: &str,
        version: &ObjectVersion,
    ) -> CloudResult<()> {
        let spec = self.aws("s3api", "delete-object").args([
            "--bucket",
            bucket,
            "--key",
            version.key.as_str(),
            "--version-id",
            version.version_id.as_str(),
        ]);
        self.call(spec, "s3", &version.key).await.map(|_| ())
    }

    async fn delete_bucket(&self, bucket: &str) -> CloudResult<()> {
        let spec = self.aws("s3api", "delete-bucket").args(["--bucket", bucket]);
        self.call(spec, "s3", bucket).await.map(|_| ())
    }
}

#[async_trait]
impl<R: CommandRunner> LockTable for AwsCli<R> {
    async fn table_exists(&self, table: &str) -> CloudResult<bool> {
        let spec = self
            .aws("dynamodb", "describe-table")
            .args(["--table-name", table]);
        self.probe(spec, "dynamodb", table).await
    }

    async fn delete_table(&self, table: &str) -> CloudResult<()> {
        let spec = self
            .aws("dynamodb", "delete-table")
            .args(["--table-name", table]);
        self.call(spec, "dynamodb", table).await.map(|_| ())
    }

    async fn wait_table_deleted(&self, table: &str) -> CloudResult<()> {
        let spec = self
            .aws("dynamodb", "wait")
            .args(["table-not-exists", "--table-name", table]);
        self.call(spec, "dynamodb", table).await.map(|_| ())
    }
}

#[async_trait]
impl<R: CommandRunner> ContainerRegistry for AwsCli<R> {
    async fn repository_exists(&self, name: &str) -> CloudResult<bool> {
        let spec = self
            .aws("ecr", "describe-repositories")
            .args(["--repository-names", name]);
        self.probe(spec, "ecr", name).await
    }
}

#[async_trait]
impl<R: CommandRunner> KeyService for AwsCli<R> {
    async fn alias_exists(&self, alias: &str) -> CloudResult<bool> {
        let spec = self.aws("kms", "list-aliases");
        let response: ListAliasesResponse = self.call_json(spec, "kms", alias).await?;
        Ok(response.aliases.iter().any(|a| a.alias_name == alias))
    }
}

#[async_trait]
impl<R: CommandRunner> LogGroups for AwsCli<R> {
    async fn log_group_exists(&self, name: &str) -> CloudResult<bool> {
        let spec = self
            .aws("logs", "describe-log-groups")
            .args(["--log-group-name-prefix", name]);
        let response: DescribeLogGroupsResponse = self.call_json(spec, "logs", name).await?;
        Ok(response.log_groups.iter().any(|g| g.log_group_name == name))
    }
}

#[async_trait]
impl<R: CommandRunner> ParameterStore for AwsCli<R> {
    async fn get_parameter(&self, name: &str) -> CloudResult<Option<String>> {
        let spec = self
            .aws("ssm", "get-parameter")
            .args(["--name", name, "--with-decryption"]);

        match self
            .call_json::<GetParameterResponse>(spec, "ssm", name)
            .await
        {
            Ok(response) => Ok(Some(response.parameter.value)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn put_parameter(
        &self,
        name: &str,
        value: &str,
        kind: ParameterKind,
    ) -> CloudResult<()> {
        let spec = self.aws("ssm", "put-parameter").args([
            "--name",
            name,
            "--value",
            value,
            "--type",
            kind.as_str(),
            "--overwrite",
        ]);
        self.call(spec, "ssm", name).await.map(|_| ())
    }
}

#[async_trait]
impl<R: CommandRunner> NetworkApi for AwsCli<R> {
    async fn find_vpc_by_name(&self, name: &str) -> CloudResult<Option<String>> {
        let filter = format!("Name=tag:Name,Values={}", name);
        let spec = self
            .aws("ec2", "describe-vpcs")
            .args(["--filters", filter.as_str()]);
        let response: DescribeVpcsResponse = self.call_json(spec, "ec2", name).await?;
        Ok(response.vpcs.into_iter().next().map(|v| v.vpc_id))
    }

    async fn list_load_balancers(&self, vpc_id: &str) -> CloudResult<Vec<LoadBalancer>> {
        let spec = self.aws("elbv2", "describe-load-balancers");
        let response: DescribeLoadBalancersResponse =
            self.call_json(spec, "elbv2", vpc_id).await?;

        Ok(response
            .load_balancers
            .into_iter()
            .filter(|lb| lb.vpc_id.as_deref() == Some(vpc_id))
            .map(|lb| LoadBalancer {
                arn: lb.load_balancer_arn,
                name: lb.load_balancer_name,
            })
            .collect())
    }

    async fn delete_load_balancer(&self, arn: &str) -> CloudResult<()> {
        let spec = self
            .aws("elbv2", "delete-load-balancer")
            .args(["--load-balancer-arn", arn]);
        self.call(spec, "elbv2", arn).await.map(|_| ())
    }

    async fn list_available_network_interfaces(
        &self,
        vpc_id: &str,
    ) -> CloudResult<Vec<NetworkInterface>> {
        let vpc_filter = format!("Name=vpc-id,Values={}", vpc_id);
        let spec = self.aws("ec2", "describe-network-interfaces").args([
            "--filters",
            vpc_filter.as_str(),
            "Name=status,Values=available",
        ]);
        let response: DescribeNetworkInterfacesResponse =
            self.call_json(spec, "ec2", vpc_id).await?;

        Ok(response
            .network_interfaces
            .into_iter()
            .map(|eni| NetworkInterface {
                id: eni.network_interface_id,
                status: eni.status,
            })
            .collect())
    }

    async fn delete_network_interface(&self, id: &str) -> CloudResult<()> {
        let spec = self
            .aws("ec2", "delete-network-interface")
            .args(["--network-interface-id", id]);
        self.call(spec, "ec2", id).await.map(|_| ())
    }

    async fn list_nat_gateways(&self, vpc_id: &str) -> CloudResult<Vec<NatGateway>> {
        // describe-nat-gateways takes `--filter`, not `--filters`
        let vpc_filter = format!("Name=vpc-id,Values={}", vpc_id);
        let spec = self
            .aws("ec2", "describe-nat-gateways")
            .args(["--filter", vpc_filter.as_str()]);
        let response: DescribeNatGatewaysResponse = self.call_json(spec, "ec2", vpc_id).await?;

        Ok(response
            .nat_gateways
            .into_iter()
            .filter(|nat| nat.state != NatGatewayState::Deleted)
            .map(|nat| NatGateway {
                id: nat.nat_gateway_id,
                state: nat.state,
                allocation_ids: nat
                    .nat_gateway_addresses
                    .into_iter()
                    .filter_map(|a| a.allocation_id)
                    .collect(),
            })
            .collect())
    }

    async fn delete_nat_gateway(&self, id: &str) -> CloudResult<()> {
        let spec = self
            .aws("ec2", "delete-nat-gateway")
            .args(["--nat-gateway-id", id]);
        self.call(spec, "ec2", id).await.map(|_| ())
    }

    async fn nat_gateway_state(&self, id: &str) -> CloudResult<NatGatewayState> {
        let spec = self
            .aws("ec2", "describe-nat-gateways")
            .args(["--nat-gateway-ids", id]);
        let response: DescribeNatGatewaysResponse = self.call_json(spec, "ec2", id).await?;

        response
            .nat_gateways
            .into_iter()
            .next()
            .map(|nat| nat.state)
            .ok_or_else(|| CloudError::not_found("ec2", id))
    }

    async fn list_addresses(&self, tag_key: &str, tag_value: &str) -> CloudResult<Vec<ElasticIp>> {
        let filter = format!("Name=tag:{},Values={}", tag_key, tag_value);
        let spec = self
            .aws("ec2", "describe-addresses")
            .args(["--filters", filter.as_str()]);
        let response: DescribeAddressesResponse = self.call_json(spec, "ec2", tag_value).await?;

        Ok(response
            .addresses
            .into_iter()
            .filter_map(|a| {
                a.allocation_id.map(|allocation_id| ElasticIp {
                    allocation_id,
                    public_ip: a.public_ip,
                    association_id: a.association_id,
                })
            })
            .collect())
    }

    async fn release_address(&self, allocation_id: &str) -> CloudResult<()> {
        let spec = self
            .aws("ec2", "release-address")
            .args(["--allocation-id", allocation_id]);
        self.call(spec, "ec2", allocation_id).await.map(|_| ())
    }
}

#[async_trait]
impl<R: CommandRunner> ClusterApi for AwsCli<R> {
    async fn cluster_exists(&self, cluster: &str) -> CloudResult<bool> {
        let spec = self.aws("eks", "describe-cluster").args(["--name", cluster]);
        self.probe(spec, "eks", cluster).await
    }

    async fn delete_namespace(&self, cluster: &str, namespace: &str) -> CloudResult<()> {
        self.update_kubeconfig(cluster).await?;

        let timeout = format!("--timeout={}s", self.config.namespace_delete_timeout_secs);
        let spec = CommandSpec::new(&self.config.kubectl_binary).args([
            "--context",
            cluster,
            "delete",
            "namespace",
            namespace,
            "--ignore-not-found",
            "--wait=true",
            timeout.as_str(),
        ]);
        self.call(spec, "kubernetes", namespace).await.map(|_| ())
    }

    async fn list_nodegroups(&self, cluster: &str) -> CloudResult<Vec<String>> {
        let spec = self
            .aws("eks", "list-nodegroups")
            .args(["--cluster-name", cluster]);
        let response: ListNodegroupsResponse = self.call_json(spec, "eks", cluster).await?;
        Ok(response.nodegroups)
    }

    async fn delete_nodegroup(&self, cluster: &str, nodegroup: &str) -> CloudResult<()> {
        let spec = self.aws("eks", "delete-nodegroup").args([
            "--cluster-name",
            cluster,
            "--nodegroup-name",
            nodegroup,
        ]);
        self.call(spec, "eks", nodegroup).await.map(|_| ())
    }

    async fn nodegroup_exists(&self, cluster: &str, nodegroup: &str) -> CloudResult<bool> {
        let spec = self.aws("eks", "describe-nodegroup").args([
            "--cluster-name",
            cluster,
            "--nodegroup-name",
            nodegroup,
        ]);
        self.probe(spec, "eks", nodegroup).await
    }
}

impl<R: CommandRunner> CloudProvider for AwsCli<R> {}
