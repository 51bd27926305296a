//! Cluster operations
//!
//! Bridges the state machine and the per-node container engines: creates
//! and starts containers for persisted documents, reconciles engine state
//! with the database and retires data containers nobody depends on.

mod docker;
mod engine;
mod inspector;
mod registry;

pub use docker::DockerEngine;
pub use engine::{
    ContainerEngine, ContainerSpec, EngineContainer, EngineError, EngineResult, NodeInfo,
};
pub use inspector::NodeInspector;
pub use registry::{DockerConnector, EngineConnector, NodeRegistry};

use std::collections::HashMap;
use std::sync::Arc;

use futures_util::future::join_all;
use serde_json::json;
use tokio::sync::Mutex;
use tracing::warn;
use uuid::Uuid;

use crate::config::Configuration;
use crate::database::{self, Database};
use crate::state_machine::{Collection, StateMachine};
use crate::states::{end_states, is_end_state, State};
use crate::types::{ApplicationContainer, DataContainer, RegistryAuth, Task};

/// One engine-side container with the node it lives on.
#[derive(Debug, Clone)]
pub struct ClusterContainer {
    pub exit_status: Option<i64>,
    pub description: Option<String>,
    pub node: String,
}

pub struct Cluster {
    config: Arc<Configuration>,
    db: Arc<Database>,
    state_machine: Arc<StateMachine>,
    registry: Arc<NodeRegistry>,
    inspector: Arc<NodeInspector>,

    /// Held across data-container assignment and retirement so two
    /// schedulings cannot create duplicate caches for the same input set
    data_container_lock: Mutex<()>,
}

impl Cluster {
    pub fn new(
        config: Arc<Configuration>,
        db: Arc<Database>,
        state_machine: Arc<StateMachine>,
        registry: Arc<NodeRegistry>,
        inspector: Arc<NodeInspector>,
    ) -> Self {
        Self {
            config,
            db,
            state_machine,
            registry,
            inspector,
            data_container_lock: Mutex::new(()),
        }
    }

    /// A transient engine failure may mean the node is gone; sweep the
    /// cluster in the background. Gated and coalesced by the inspector.
    fn schedule_inspection(&self) {
        let inspector = self.inspector.clone();
        tokio::spawn(async move {
            inspector.update_all_nodes().await;
        });
    }

    pub fn registry(&self) -> &Arc<NodeRegistry> {
        &self.registry
    }

    /// Pull an image on one node.
    pub async fn update_image(
        &self,
        node_name: &str,
        image: &str,
        auth: Option<&RegistryAuth>,
    ) -> EngineResult<()> {
        let engine = self.registry.engine(node_name)?;
        let _permit = self.registry.acquire().await;
        tracing::info!("Pull image {} on node {}.", image, node_name);
        engine.pull_image(image, auth).await
    }

    /// Create the engine container for a persisted document and move it to
    /// waiting; failures fail the document and clean up the engine side.
    pub async fn create_container(&self, container_id: &str, collection: Collection) {
        match self.try_create(container_id, collection).await {
            Ok(()) => {
                let _ = self
                    .state_machine
                    .transition(collection, container_id, State::Waiting, "Container waiting.", None)
                    .await;
            }
            Err(e) => {
                let _ = self
                    .state_machine
                    .transition(
                        collection,
                        container_id,
                        State::Failed,
                        "Container creation failed.",
                        Some(e.to_string()),
                    )
                    .await;
                self.remove_engine_container(container_id, collection).await;
                self.schedule_inspection();
            }
        }
    }

    /// Start a created engine container and persist its address; failures
    /// fail the document and clean up the engine side.
    pub async fn start_container(&self, container_id: &str, collection: Collection) {
        match self.try_start(container_id, collection).await {
            Ok(()) => {}
            Err(e) => {
                let _ = self
                    .state_machine
                    .transition(
                        collection,
                        container_id,
                        State::Failed,
                        "Container start failed.",
                        Some(e.to_string()),
                    )
                    .await;
                self.remove_engine_container(container_id, collection).await;
                self.schedule_inspection();
            }
        }
    }

    /// Fill an application container's `data_container_ids` with live data
    /// containers already holding each input file.
    pub async fn assign_existing_data_containers(
        &self,
        application_container_id: &str,
    ) -> database::DatabaseResult<()> {
        let _guard = self.data_container_lock.lock().await;
        let conn = self.db.lock().await;

        let ac: ApplicationContainer = database::require(&conn, application_container_id)?;
        let task: Task = database::require(&conn, &ac.task_id)?;

        let live_states = [
            State::Created.index(),
            State::Waiting.index(),
            State::Processing.index(),
        ];
        let live: Vec<DataContainer> = database::find_in_states(&conn, &live_states)?;

        let mut data_container_ids = Vec::with_capacity(task.input_files.len());
        for file in &task.input_files {
            let found = live
                .iter()
                .find(|dc| dc.input_files.iter().any(|f| f == file))
                .map(|dc| dc.id.clone());
            data_container_ids.push(found);
        }

        let mut ac = ac;
        ac.data_container_ids = data_container_ids;
        database::update(&conn, &ac)?;
        Ok(())
    }

    /// Engine containers across all live nodes, keyed by name.
    pub async fn containers(&self) -> HashMap<String, ClusterContainer> {
        let nodes = self.registry.active_names();

        let listings = join_all(nodes.iter().map(|node_name| async {
            let engine = self.registry.engine(node_name)?;
            let _permit = self.registry.acquire().await;
            engine
                .list_containers()
                .await
                .map(|containers| (node_name.clone(), containers))
        }))
        .await;

        let mut result = HashMap::new();
        for listing in listings {
            match listing {
                Ok((node, containers)) => {
                    for container in containers {
                        result.insert(
                            container.name,
                            ClusterContainer {
                                exit_status: container.exit_status,
                                description: container.description,
                                node: node.clone(),
                            },
                        );
                    }
                }
                Err(e) => {
                    warn!("Error on container list: {}", e);
                }
            }
        }
        result
    }

    /// Reconcile engine state with the database: remove finished
    /// containers, fail unexpected exits with their logs and fail
    /// containers the engine no longer knows.
    pub async fn reconcile_containers(&self) {
        let mut containers = self.containers().await;
        containers.retain(|name, _| Uuid::parse_str(name).is_ok());

        self.reconcile_collection::<ApplicationContainer>(&containers, Collection::ApplicationContainers)
            .await;
        self.reconcile_collection::<DataContainer>(&containers, Collection::DataContainers)
            .await;
    }

    async fn reconcile_collection<T>(
        &self,
        containers: &HashMap<String, ClusterContainer>,
        collection: Collection,
    ) where
        T: database::Document,
    {
        let docs: Vec<(String, i64)> = {
            let conn = self.db.lock().await;
            match database::find_all::<T>(&conn) {
                Ok(docs) => docs.iter().map(|d| (d.id().to_string(), d.state())).collect(),
                Err(e) => {
                    warn!("Reconcile query failed: {}", e);
                    return;
                }
            }
        };

        for (id, state) in &docs {
            let Some(container) = containers.get(id) else {
                continue;
            };
            if is_end_state(*state) {
                self.remove_engine_container(id, collection).await;
            } else if container.exit_status.map(|code| code != 0).unwrap_or(false) {
                let logs = self
                    .fetch_logs(id, &container.node)
                    .await
                    .unwrap_or_else(|| "container logs not available".to_string());
                let description = format!(
                    "Container exited unexpectedly ({}): {}",
                    container.description.as_deref().unwrap_or("unknown"),
                    logs
                );
                let _ = self
                    .state_machine
                    .transition(collection, id, State::Failed, &description, None)
                    .await;
                self.remove_engine_container(id, collection).await;
            }
        }

        // Containers the database believes are live but the engine lost
        for (id, state) in &docs {
            if *state != State::Waiting.index() && *state != State::Processing.index() {
                continue;
            }
            if !containers.contains_key(id) {
                let _ = self
                    .state_machine
                    .transition(collection, id, State::Failed, "Container vanished.", None)
                    .await;
            }
        }
    }

    /// Retire processing data containers with no non-terminal dependents.
    pub async fn clean_up_unused_data_containers(&self) {
        let _guard = self.data_container_lock.lock().await;

        let unused: Vec<String> = {
            let conn = self.db.lock().await;
            let processing: Vec<DataContainer> = match database::find_in_states(
                &conn,
                &[State::Processing.index()],
            ) {
                Ok(containers) => containers,
                Err(e) => {
                    warn!("Data container sweep failed: {}", e);
                    return;
                }
            };
            let open: Vec<ApplicationContainer> =
                match database::find_not_in_states(&conn, &end_states()) {
                    Ok(containers) => containers,
                    Err(e) => {
                        warn!("Data container sweep failed: {}", e);
                        return;
                    }
                };

            processing
                .into_iter()
                .filter(|dc| {
                    !open.iter().any(|ac| {
                        ac.data_container_ids.iter().flatten().any(|id| id == &dc.id)
                    })
                })
                .map(|dc| dc.id)
                .collect()
        };

        for dc_id in unused {
            let _ = self
                .state_machine
                .transition(
                    Collection::DataContainers,
                    &dc_id,
                    State::Success,
                    "Container removed. Not in use by any application container.",
                    None,
                )
                .await;
            self.remove_engine_container(&dc_id, Collection::DataContainers).await;
        }
    }

    /// Address under which a container is reachable: the overlay network
    /// uses container names as hostnames, otherwise ask the engine.
    pub async fn get_ip(&self, container_id: &str, node_name: &str) -> EngineResult<String> {
        if self.config.docker.net.is_some() {
            return Ok(container_id.to_string());
        }
        let engine = self.registry.engine(node_name)?;
        let _permit = self.registry.acquire().await;
        engine.container_ip(container_id).await
    }

    async fn try_create(&self, container_id: &str, collection: Collection) -> EngineResult<()> {
        let spec;
        let node_name;
        {
            let conn = self.db.lock().await;
            match collection {
                Collection::ApplicationContainers => {
                    let ac: ApplicationContainer = database::require(&conn, container_id)
                        .map_err(|e| EngineError::Other(e.to_string()))?;
                    let task: Task = database::require(&conn, &ac.task_id)
                        .map_err(|e| EngineError::Other(e.to_string()))?;
                    node_name = ac
                        .cluster_node
                        .clone()
                        .ok_or_else(|| EngineError::Other("container not placed".to_string()))?;
                    spec = self.application_container_spec(&ac, &task);
                }
                Collection::DataContainers => {
                    let dc: DataContainer = database::require(&conn, container_id)
                        .map_err(|e| EngineError::Other(e.to_string()))?;
                    node_name = dc
                        .cluster_node
                        .clone()
                        .ok_or_else(|| EngineError::Other("container not placed".to_string()))?;
                    spec = self.data_container_spec(&dc);
                }
                other => {
                    return Err(EngineError::Other(format!(
                        "collection {} not valid for containers",
                        other
                    )))
                }
            }
        }

        let engine = self.registry.engine(&node_name)?;
        let _permit = self.registry.acquire().await;
        // A leftover container with this name would shadow the new one
        engine.remove_container(container_id).await?;
        engine.create_container(&spec).await?;
        if let Some(net) = &self.config.docker.net {
            engine.connect_to_network(container_id, net).await?;
        }
        Ok(())
    }

    async fn try_start(&self, container_id: &str, collection: Collection) -> EngineResult<()> {
        let node_name = {
            let conn = self.db.lock().await;
            let node: Option<String> = match collection {
                Collection::ApplicationContainers => {
                    database::get::<ApplicationContainer>(&conn, container_id)
                        .ok()
                        .flatten()
                        .and_then(|ac| ac.cluster_node)
                }
                Collection::DataContainers => database::get::<DataContainer>(&conn, container_id)
                    .ok()
                    .flatten()
                    .and_then(|dc| dc.cluster_node),
                _ => None,
            };
            node.ok_or_else(|| EngineError::Other("container not placed".to_string()))?
        };

        let engine = self.registry.engine(&node_name)?;
        {
            let _permit = self.registry.acquire().await;
            engine.start_container(container_id).await?;
        }

        let ip = self.get_ip(container_id, &node_name).await?;

        let conn = self.db.lock().await;
        match collection {
            Collection::ApplicationContainers => {
                if let Ok(mut ac) = database::require::<ApplicationContainer>(&conn, container_id) {
                    ac.ip = Some(ip);
                    let _ = database::update(&conn, &ac);
                }
            }
            Collection::DataContainers => {
                if let Ok(mut dc) = database::require::<DataContainer>(&conn, container_id) {
                    dc.ip = Some(ip);
                    let _ = database::update(&conn, &dc);
                }
            }
            _ => {}
        }
        Ok(())
    }

    async fn fetch_logs(&self, container_id: &str, node_name: &str) -> Option<String> {
        let engine = self.registry.engine(node_name).ok()?;
        let _permit = self.registry.acquire().await;
        engine.container_logs(container_id).await.ok()
    }

    async fn remove_engine_container(&self, container_id: &str, collection: Collection) {
        let node_name = {
            let conn = self.db.lock().await;
            match collection {
                Collection::ApplicationContainers => {
                    database::get::<ApplicationContainer>(&conn, container_id)
                        .ok()
                        .flatten()
                        .and_then(|ac| ac.cluster_node)
                }
                Collection::DataContainers => database::get::<DataContainer>(&conn, container_id)
                    .ok()
                    .flatten()
                    .and_then(|dc| dc.cluster_node),
                _ => None,
            }
        };
        let Some(node_name) = node_name else {
            return;
        };
        let Ok(engine) = self.registry.engine(&node_name) else {
            return;
        };
        let _permit = self.registry.acquire().await;
        if let Err(e) = engine.remove_container(container_id).await {
            warn!("Remove container {}: {}", container_id, e);
        }
    }

    fn application_container_spec(&self, ac: &ApplicationContainer, task: &Task) -> ContainerSpec {
        let settings = json!({
            "container_id": ac.id,
            "callback_key": ac.callback_key,
            "callback_url": format!(
                "{}/application-containers/callback",
                self.config.server_web.external_url.trim_end_matches('/')
            ),
        });

        let description = &task.application_container_description;
        let entry_point = description
            .entry_point
            .clone()
            .unwrap_or_else(|| {
                self.config
                    .defaults
                    .application_container_description
                    .entry_point
                    .clone()
            });

        let mut command: Vec<String> =
            entry_point.split_whitespace().map(str::to_string).collect();
        command.push(settings.to_string());

        let security_opt = description
            .tracing
            .as_ref()
            .map(|_| vec!["seccomp:unconfined".to_string()]);

        ContainerSpec {
            name: ac.id.clone(),
            image: description.image.clone(),
            command,
            mem_limit_mb: ac.container_ram,
            memswap_limit_mb: ac.container_ram,
            security_opt,
        }
    }

    fn data_container_spec(&self, dc: &DataContainer) -> ContainerSpec {
        let description = &self.config.defaults.data_container_description;
        let settings = json!({
            "container_id": dc.id,
            "callback_key": dc.callback_key,
            "callback_url": format!(
                "{}/data-containers/callback",
                self.config.server_web.external_url.trim_end_matches('/')
            ),
        });

        let mut command: Vec<String> = description
            .entry_point
            .split_whitespace()
            .map(str::to_string)
            .collect();
        command.push(settings.to_string());

        ContainerSpec {
            name: dc.id.clone(),
            image: description.image.clone(),
            command,
            mem_limit_mb: dc.container_ram,
            memswap_limit_mb: dc.container_ram,
            security_opt: None,
        }
    }
}
