//! Collaborator seams the executor drives.
//!
//! Each trait is one external capability: command execution, the cloud
//! provider, swarm membership and the container runtime. The CLI-backed
//! implementations live in [`crate::cli`]; tests substitute recording mocks.

use std::collections::HashMap;

use async_trait::async_trait;

use edgegrid_state::{CloudInstance, HostRecord, NodeRole, NodeState, PortBinding};

/// Runs a shell command on a host, locally or over SSH.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Returns stdout; a non-zero exit is an error.
    async fn run(&self, host: &str, command: &str) -> anyhow::Result<String>;
}

/// Cloud instances carrying this system's management tag.
#[async_trait]
pub trait CloudProvider: Send + Sync {
    async fn describe_instances(&self) -> anyhow::Result<Vec<CloudInstance>>;

    async fn describe_instance(&self, instance_id: &str) -> anyhow::Result<Option<CloudInstance>>;

    /// Launch a new tagged instance in `zone`. Returns it in whatever state
    /// the provider reports (normally pending).
    async fn launch_instance(&self, zone: &str) -> anyhow::Result<CloudInstance>;

    async fn start_instance(&self, instance_id: &str) -> anyhow::Result<()>;

    async fn stop_instance(&self, instance_id: &str) -> anyhow::Result<()>;

    async fn terminate_instance(&self, instance_id: &str) -> anyhow::Result<()>;
}

/// A node as reported by the swarm.
#[derive(Debug, Clone, PartialEq)]
pub struct SwarmNode {
    pub node_id: String,
    pub address: String,
    pub role: NodeRole,
    pub state: NodeState,
    pub labels: HashMap<String, String>,
}

/// Cluster membership.
#[async_trait]
pub trait SwarmApi: Send + Sync {
    /// Create a new swarm with `host` as its first manager. Returns the node id.
    async fn init(&self, host: &HostRecord) -> anyhow::Result<String>;

    /// Join `host` to the existing swarm. Returns the node id.
    async fn join(&self, host: &HostRecord, role: NodeRole) -> anyhow::Result<String>;

    async fn leave(&self, host: &HostRecord) -> anyhow::Result<()>;

    async fn remove_node(&self, node_id: &str) -> anyhow::Result<()>;

    async fn list_nodes(&self) -> anyhow::Result<Vec<SwarmNode>>;

    async fn promote(&self, node_id: &str) -> anyhow::Result<()>;

    async fn demote(&self, node_id: &str) -> anyhow::Result<()>;

    async fn set_label(&self, node_id: &str, key: &str, value: &str) -> anyhow::Result<()>;
}

/// Everything needed to create one container.
#[derive(Debug, Clone, PartialEq)]
pub struct LaunchRequest {
    pub host: String,
    pub name: String,
    pub image: String,
    pub ports: Vec<PortBinding>,
    pub env: Vec<(String, String)>,
    pub labels: HashMap<String, String>,
    pub args: Vec<String>,
}

/// A container as seen by the runtime.
#[derive(Debug, Clone, PartialEq)]
pub struct RunningContainer {
    pub id: String,
    pub name: String,
    pub image: String,
    pub ports: Vec<PortBinding>,
    pub args: Vec<String>,
    pub labels: HashMap<String, String>,
}

/// Container runtime on a given host.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Create and start the container. Returns its id.
    async fn create_and_start(&self, request: &LaunchRequest) -> anyhow::Result<String>;

    async fn inspect(&self, host: &str, container_id: &str) -> anyhow::Result<Option<RunningContainer>>;

    async fn stop(&self, host: &str, container_id: &str) -> anyhow::Result<()>;

    /// Running containers on `host`.
    async fn list(&self, host: &str) -> anyhow::Result<Vec<RunningContainer>>;
}
