//! Node discovery and per-node engine clients
//!
//! Nodes are merged from the `[docker.nodes]` config table and the optional
//! `machines_dir` of per-machine descriptors. The registry owns one engine
//! client per reachable node plus the process-wide `thread_limit` semaphore
//! bounding concurrent engine calls across all nodes.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::Deserialize;
use tokio::sync::{Semaphore, SemaphorePermit};
use tracing::{info, warn};

use crate::config::{DockerConfiguration, NodeConfiguration};

use super::docker::DockerEngine;
use super::engine::{ContainerEngine, EngineError, EngineResult};

/// Builds an engine client for one node; tests inject fakes through this.
pub trait EngineConnector: Send + Sync {
    fn connect(
        &self,
        node_name: &str,
        node_config: &NodeConfiguration,
    ) -> EngineResult<Arc<dyn ContainerEngine>>;
}

/// Production connector backed by the Docker API.
pub struct DockerConnector {
    api_timeout_seconds: u64,
}

impl DockerConnector {
    pub fn new(api_timeout_seconds: u64) -> Self {
        Self {
            api_timeout_seconds,
        }
    }
}

impl EngineConnector for DockerConnector {
    fn connect(
        &self,
        _node_name: &str,
        node_config: &NodeConfiguration,
    ) -> EngineResult<Arc<dyn ContainerEngine>> {
        Ok(Arc::new(DockerEngine::connect(
            node_config,
            self.api_timeout_seconds,
        )?))
    }
}

/// Per-machine descriptor file inside `machines_dir`.
#[derive(Debug, Deserialize)]
struct MachineDescriptor {
    /// Node name; the file stem is used when absent
    name: Option<String>,

    base_url: String,

    #[serde(default)]
    tls: Option<crate::config::TlsConfiguration>,
}

pub struct NodeRegistry {
    configs: HashMap<String, NodeConfiguration>,
    clients: RwLock<HashMap<String, Arc<dyn ContainerEngine>>>,
    connector: Arc<dyn EngineConnector>,
    thread_limit: Arc<Semaphore>,
}

impl NodeRegistry {
    pub fn new(
        docker: &DockerConfiguration,
        connector: Arc<dyn EngineConnector>,
    ) -> anyhow::Result<Self> {
        let mut configs = docker.nodes.clone();

        if let Some(machines_dir) = &docker.machines_dir {
            for (name, config) in discover_machines(machines_dir)? {
                configs.insert(name, config);
            }
        }

        info!("Configured nodes: {:?}", configs.keys().collect::<Vec<_>>());

        Ok(Self {
            configs,
            clients: RwLock::new(HashMap::new()),
            connector,
            thread_limit: Arc::new(Semaphore::new(docker.thread_limit)),
        })
    }

    /// Names of all configured nodes, dead or alive.
    pub fn node_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.configs.keys().cloned().collect();
        names.sort();
        names
    }

    /// Names of nodes with a live client.
    pub fn active_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.clients.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Client for a node, when it is in the active set.
    pub fn engine(&self, node_name: &str) -> EngineResult<Arc<dyn ContainerEngine>> {
        self.clients
            .read()
            .get(node_name)
            .cloned()
            .ok_or_else(|| EngineError::NodeUnavailable(node_name.to_string()))
    }

    /// Build a fresh client for a node and add it to the active set.
    pub fn connect_node(&self, node_name: &str) -> EngineResult<Arc<dyn ContainerEngine>> {
        let config = self.configs.get(node_name).ok_or_else(|| {
            EngineError::NodeUnavailable(format!("no config for node {}", node_name))
        })?;

        let engine = self.connector.connect(node_name, config)?;
        self.clients
            .write()
            .insert(node_name.to_string(), engine.clone());
        Ok(engine)
    }

    /// Drop a node's client from the active set.
    pub fn remove_node(&self, node_name: &str) {
        self.clients.write().remove(node_name);
    }

    /// Acquire an engine-call slot; every engine API call holds one.
    pub async fn acquire(&self) -> SemaphorePermit<'_> {
        self.thread_limit
            .acquire()
            .await
            .expect("thread limit semaphore closed")
    }
}

fn discover_machines(dir: &Path) -> anyhow::Result<Vec<(String, NodeConfiguration)>> {
    let mut machines = Vec::new();

    if !dir.exists() {
        warn!("machines_dir {:?} does not exist", dir);
        return Ok(machines);
    }

    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.extension().and_then(|ext| ext.to_str()) != Some("toml") {
            continue;
        }

        let content = std::fs::read_to_string(&path)?;
        let descriptor: MachineDescriptor = match toml::from_str(&content) {
            Ok(descriptor) => descriptor,
            Err(e) => {
                warn!("Skipping machine descriptor {:?}: {}", path, e);
                continue;
            }
        };

        let name = descriptor.name.unwrap_or_else(|| {
            path.file_stem()
                .and_then(|stem| stem.to_str())
                .unwrap_or_default()
                .to_string()
        });

        machines.push((
            name,
            NodeConfiguration {
                base_url: descriptor.base_url,
                tls: descriptor.tls,
            },
        ));
    }

    Ok(machines)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn docker_config() -> DockerConfiguration {
        toml::from_str(
            r#"
            thread_limit = 2
            [nodes.node-1]
            base_url = "tcp://node-1:2376"
            "#,
        )
        .unwrap()
    }

    struct NullConnector;

    impl EngineConnector for NullConnector {
        fn connect(
            &self,
            node_name: &str,
            _node_config: &NodeConfiguration,
        ) -> EngineResult<Arc<dyn ContainerEngine>> {
            Err(EngineError::NodeUnavailable(node_name.to_string()))
        }
    }

    #[test]
    fn test_nodes_from_config() {
        let registry = NodeRegistry::new(&docker_config(), Arc::new(NullConnector)).unwrap();
        assert_eq!(registry.node_names(), vec!["node-1"]);
        assert!(registry.active_names().is_empty());
        assert!(registry.engine("node-1").is_err());
    }

    #[test]
    fn test_machines_dir_merge() {
        let dir = tempfile::tempdir().unwrap();
        let mut file = std::fs::File::create(dir.path().join("node-2.toml")).unwrap();
        writeln!(file, "base_url = \"tcp://node-2:2376\"").unwrap();
        let mut named = std::fs::File::create(dir.path().join("third.toml")).unwrap();
        writeln!(named, "name = \"node-3\"\nbase_url = \"tcp://node-3:2376\"").unwrap();

        let mut config = docker_config();
        config.machines_dir = Some(dir.path().to_path_buf());

        let registry = NodeRegistry::new(&config, Arc::new(NullConnector)).unwrap();
        assert_eq!(registry.node_names(), vec!["node-1", "node-2", "node-3"]);
    }

    #[tokio::test]
    async fn test_thread_limit_bounds_permits() {
        let registry = NodeRegistry::new(&docker_config(), Arc::new(NullConnector)).unwrap();
        let permit_a = registry.acquire().await;
        let _permit_b = registry.acquire().await;
        // Third acquire would block; release one and retry
        drop(permit_a);
        let _permit_c = registry.acquire().await;
    }
}
