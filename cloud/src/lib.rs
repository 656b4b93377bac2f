pub mod config;
pub mod process;
pub mod provider;
pub mod types;

#[cfg(feature = "aws-cli")]
pub mod aws;

#[cfg(any(test, feature = "test-support"))]
pub mod memory;

pub use config::{AwsCliConfig, DEFAULT_REGION};
pub use process::{CommandOutput, CommandRunner, CommandSpec, SystemRunner};
pub use provider::{
    tolerate_absence, CleanupStatus, CloudError, CloudProvider, CloudResult, ClusterApi,
    ContainerRegistry, KeyService, LockTable, LogGroups, NetworkApi, ObjectStorage,
    ParameterStore,
};
pub use types::{
    ElasticIp, LoadBalancer, NatGateway, NatGatewayState, NetworkInterface, ObjectVersion,
    ParameterKind,
};

#[cfg(feature = "aws-cli")]
pub use aws::AwsCli;

#[cfg(any(test, feature = "test-support"))]
pub use memory::InMemoryCloud;

#[cfg(any(test, feature = "test-support"))]
pub use process::ScriptedRunner;
