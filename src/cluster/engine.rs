//! Container engine trait definitions
//!
//! Abstracts the per-node engine API so cluster code is agnostic of the
//! underlying client and tests can run against a scripted engine. The
//! engine never touches the database.

use async_trait::async_trait;
use thiserror::Error;

use crate::types::RegistryAuth;

/// Error type for engine operations
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Docker error: {0}")]
    Docker(#[from] bollard::errors::Error),

    #[error("Image pull failed: {0}")]
    ImagePull(String),

    #[error("Container not found: {0}")]
    ContainerNotFound(String),

    #[error("Node not available: {0}")]
    NodeUnavailable(String),

    #[error("{0}")]
    Other(String),
}

pub type EngineResult<T> = Result<T, EngineError>;

/// Capacity reported by a node
#[derive(Debug, Clone, Copy)]
pub struct NodeInfo {
    /// Total RAM in MiB
    pub total_ram: u64,

    pub total_cpus: u64,
}

/// Everything needed to create one container
#[derive(Debug, Clone, Default)]
pub struct ContainerSpec {
    /// Container name; equals the owning document id
    pub name: String,

    pub image: String,

    pub command: Vec<String>,

    /// Memory limit in MB
    pub mem_limit_mb: u64,

    /// Memory+swap limit in MB; equal to `mem_limit_mb` to disable swap
    pub memswap_limit_mb: u64,

    pub security_opt: Option<Vec<String>>,
}

/// One engine-side container as reported by `list_containers`
#[derive(Debug, Clone)]
pub struct EngineContainer {
    pub name: String,

    /// Exit code, when the container has exited
    pub exit_status: Option<i64>,

    /// Engine status line
    pub description: Option<String>,
}

/// Per-node engine operations.
#[async_trait]
pub trait ContainerEngine: Send + Sync {
    /// Total capacity of the node
    async fn node_info(&self) -> EngineResult<NodeInfo>;

    /// Pull an image, failing on any progress line carrying an error
    async fn pull_image(&self, image: &str, auth: Option<&RegistryAuth>) -> EngineResult<()>;

    async fn create_container(&self, spec: &ContainerSpec) -> EngineResult<()>;

    async fn start_container(&self, name: &str) -> EngineResult<()>;

    /// Block until the container exits, returning its exit code
    async fn wait_container(&self, name: &str) -> EngineResult<i64>;

    async fn container_logs(&self, name: &str) -> EngineResult<String>;

    /// Kill then remove; a missing container is not an error
    async fn remove_container(&self, name: &str) -> EngineResult<()>;

    async fn container_ip(&self, name: &str) -> EngineResult<String>;

    async fn connect_to_network(&self, name: &str, network: &str) -> EngineResult<()>;

    async fn list_containers(&self) -> EngineResult<Vec<EngineContainer>>;
}
