//! Node liveness inspection
//!
//! Probes a node by running a disposable inspection container built from
//! the data-container image; any API failure or non-zero exit marks the
//! node dead. This module is the only writer of dead-node records.

use std::sync::Arc;

use futures_util::future::join_all;
use serde_json::json;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::config::Configuration;
use crate::database::{self, Database};
use crate::notification::notify;
use crate::types::{DeadNode, NodeRecord, RegistryAuth};

use super::engine::{ContainerEngine, ContainerSpec, NodeInfo};
use super::registry::NodeRegistry;

pub struct NodeInspector {
    config: Arc<Configuration>,
    db: Arc<Database>,
    registry: Arc<NodeRegistry>,

    /// Serializes full-cluster sweeps so concurrent per-container failures
    /// cannot fan out into parallel inspections
    invalidation_lock: Mutex<()>,
}

impl NodeInspector {
    pub fn new(config: Arc<Configuration>, db: Arc<Database>, registry: Arc<NodeRegistry>) -> Self {
        Self {
            config,
            db,
            registry,
            invalidation_lock: Mutex::new(()),
        }
    }

    /// Connect every configured node and record its capacity, without
    /// running inspection containers. Used at process startup.
    pub async fn register_all(&self) {
        for node_name in self.registry.node_names() {
            match self.registry.connect_node(&node_name) {
                Ok(engine) => match self.fetch_info(engine.as_ref()).await {
                    Ok(node_info) => {
                        self.record_online(&node_name, node_info).await;
                    }
                    Err(description) => {
                        self.mark_dead(&node_name, description).await;
                    }
                },
                Err(e) => {
                    self.mark_dead(&node_name, e.to_string()).await;
                }
            }
        }
    }

    /// Probe one node and update its liveness records.
    pub async fn update_node(&self, node_name: &str) {
        info!("Inspect node {}.", node_name);

        let engine = match self.registry.engine(node_name) {
            Ok(engine) => engine,
            Err(_) => match self.registry.connect_node(node_name) {
                Ok(engine) => engine,
                Err(e) => {
                    self.mark_dead(node_name, e.to_string()).await;
                    return;
                }
            },
        };

        match self.probe(node_name, engine.as_ref()).await {
            Ok(node_info) => self.record_online(node_name, node_info).await,
            Err(description) => self.mark_dead(node_name, description).await,
        }
    }

    /// Probe every configured node. Skipped entirely unless dead-node
    /// invalidation is enabled; only one sweep runs at a time.
    pub async fn update_all_nodes(&self) {
        if !self.config.defaults.error_handling.dead_node_invalidation {
            return;
        }

        let Ok(_guard) = self.invalidation_lock.try_lock() else {
            return;
        };

        info!("Update status of all nodes.");
        let names = self.registry.node_names();
        join_all(names.iter().map(|name| self.update_node(name))).await;

        let conn = self.db.lock().await;
        match database::all_dead_nodes(&conn) {
            Ok(dead) if !dead.is_empty() => {
                warn!(
                    "Dead nodes: {:?}",
                    dead.iter().map(|d| d.name.as_str()).collect::<Vec<_>>()
                );
            }
            _ => {}
        }
    }

    /// Run the disposable inspection container; any failure means dead.
    async fn probe(&self, node_name: &str, engine: &dyn ContainerEngine) -> Result<NodeInfo, String> {
        let description = &self.config.defaults.inspection_container_description;
        let container_name = format!("inspect-{}", node_name);

        let auth = description
            .registry_auth
            .as_ref()
            .map(|auth| RegistryAuth {
                username: auth.username.clone(),
                password: auth.password.clone(),
            });

        let result: Result<i64, String> = async {
            {
                let _permit = self.registry.acquire().await;
                engine
                    .pull_image(&description.image, auth.as_ref())
                    .await
                    .map_err(|e| e.to_string())?;
                engine
                    .remove_container(&container_name)
                    .await
                    .map_err(|e| e.to_string())?;
            }

            let settings = json!({
                "inspection_url": self.config.server_web.external_url.trim_end_matches('/'),
            });
            let mut command: Vec<String> = description
                .entry_point
                .split_whitespace()
                .map(str::to_string)
                .collect();
            command.push(settings.to_string());

            let spec = ContainerSpec {
                name: container_name.clone(),
                image: description.image.clone(),
                command,
                mem_limit_mb: 0,
                memswap_limit_mb: 0,
                security_opt: None,
            };

            {
                let _permit = self.registry.acquire().await;
                engine
                    .create_container(&spec)
                    .await
                    .map_err(|e| e.to_string())?;
                if let Some(net) = &self.config.docker.net {
                    engine
                        .connect_to_network(&container_name, net)
                        .await
                        .map_err(|e| e.to_string())?;
                }
                engine
                    .start_container(&container_name)
                    .await
                    .map_err(|e| e.to_string())?;
            }

            let _permit = self.registry.acquire().await;
            engine
                .wait_container(&container_name)
                .await
                .map_err(|e| e.to_string())
        }
        .await;

        {
            let _permit = self.registry.acquire().await;
            if let Err(e) = engine.remove_container(&container_name).await {
                warn!("Remove {}: {}", container_name, e);
            }
        }

        match result {
            Ok(0) => self.fetch_info(engine).await,
            Ok(code) => Err(format!(
                "Inspection container on node {} exited with code {}",
                node_name, code
            )),
            Err(description) => Err(description),
        }
    }

    async fn fetch_info(&self, engine: &dyn ContainerEngine) -> Result<NodeInfo, String> {
        let _permit = self.registry.acquire().await;
        engine.node_info().await.map_err(|e| e.to_string())
    }

    async fn record_online(&self, node_name: &str, node_info: NodeInfo) {
        let revived;
        {
            let conn = self.db.lock().await;
            revived = database::is_dead_node(&conn, node_name).unwrap_or(false);
            if revived {
                let _ = database::delete_dead_node(&conn, node_name);
            }
            let record = NodeRecord {
                cluster_node: node_name.to_string(),
                is_online: true,
                total_ram: node_info.total_ram,
                total_cpus: node_info.total_cpus,
                debug_info: None,
            };
            if let Err(e) = database::upsert_node(&conn, &record) {
                warn!("Could not persist node record for {}: {}", node_name, e);
            }
        }
        if revived {
            info!("Node {} is back online.", node_name);
        }
    }

    async fn mark_dead(&self, node_name: &str, description: String) {
        warn!("Node {} is dead: {}", node_name, description);

        let was_dead;
        {
            let conn = self.db.lock().await;
            was_dead = database::is_dead_node(&conn, node_name).unwrap_or(false);
            let _ = database::upsert_dead_node(
                &conn,
                &DeadNode {
                    name: node_name.to_string(),
                    description: description.clone(),
                },
            );
            if let Ok(Some(mut record)) = database::get_node(&conn, node_name) {
                record.is_online = false;
                record.debug_info = Some(description.clone());
                let _ = database::upsert_node(&conn, &record);
            } else {
                let _ = database::upsert_node(
                    &conn,
                    &NodeRecord {
                        cluster_node: node_name.to_string(),
                        is_online: false,
                        total_ram: 0,
                        total_cpus: 0,
                        debug_info: Some(description.clone()),
                    },
                );
            }
        }

        self.registry.remove_node(node_name);

        let connectors = &self.config.defaults.error_handling.dead_node_notification;
        if !was_dead && !connectors.is_empty() {
            notify(
                connectors,
                json!({ "node_name": node_name, "description": description }),
            )
            .await;
        }
    }
}
