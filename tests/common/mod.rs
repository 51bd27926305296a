//! Shared test harness: an in-memory database plus scripted engines
//! standing in for the per-node container API.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::json;

use flotilla::callback::CallbackDispatcher;
use flotilla::cluster::{
    Cluster, ContainerEngine, ContainerSpec, EngineConnector, EngineContainer, EngineError,
    EngineResult, NodeInfo, NodeInspector, NodeRegistry,
};
use flotilla::config::{Configuration, NodeConfiguration};
use flotilla::database::Database;
use flotilla::scheduling::Scheduler;
use flotilla::state_machine::StateMachine;
use flotilla::types::{CallbackPayload, Connector};
use flotilla::worker::{MasterSignals, Worker};

#[derive(Debug, Clone)]
pub struct FakeContainer {
    pub image: String,
    pub running: bool,
    pub exit_status: Option<i64>,
}

#[derive(Default)]
struct FakeEngineState {
    containers: HashMap<String, FakeContainer>,
    pulled_images: Vec<String>,
}

/// Scripted engine for one node.
pub struct FakeEngine {
    info: NodeInfo,
    state: Mutex<FakeEngineState>,

    /// Exit code reported for inspection containers
    pub inspect_exit_code: Mutex<i64>,

    /// When set, every pull fails with this message
    pub pull_error: Mutex<Option<String>>,
}

impl FakeEngine {
    pub fn new(total_ram: u64) -> Arc<Self> {
        Arc::new(Self {
            info: NodeInfo {
                total_ram,
                total_cpus: 4,
            },
            state: Mutex::new(FakeEngineState::default()),
            inspect_exit_code: Mutex::new(0),
            pull_error: Mutex::new(None),
        })
    }

    pub fn pulled_images(&self) -> Vec<String> {
        self.state.lock().pulled_images.clone()
    }

    pub fn container(&self, name: &str) -> Option<FakeContainer> {
        self.state.lock().containers.get(name).cloned()
    }

    pub fn container_names(&self) -> Vec<String> {
        self.state.lock().containers.keys().cloned().collect()
    }

    /// Simulate a container exiting with the given code.
    pub fn set_exited(&self, name: &str, exit_status: i64) {
        if let Some(container) = self.state.lock().containers.get_mut(name) {
            container.running = false;
            container.exit_status = Some(exit_status);
        }
    }

    /// Simulate the engine losing a container entirely.
    pub fn drop_container(&self, name: &str) {
        self.state.lock().containers.remove(name);
    }
}

#[async_trait]
impl ContainerEngine for FakeEngine {
    async fn node_info(&self) -> EngineResult<NodeInfo> {
        Ok(self.info)
    }

    async fn pull_image(&self, image: &str, _auth: Option<&flotilla::types::RegistryAuth>) -> EngineResult<()> {
        if let Some(message) = self.pull_error.lock().clone() {
            return Err(EngineError::ImagePull(message));
        }
        self.state.lock().pulled_images.push(image.to_string());
        Ok(())
    }

    async fn create_container(&self, spec: &ContainerSpec) -> EngineResult<()> {
        self.state.lock().containers.insert(
            spec.name.clone(),
            FakeContainer {
                image: spec.image.clone(),
                running: false,
                exit_status: None,
            },
        );
        Ok(())
    }

    async fn start_container(&self, name: &str) -> EngineResult<()> {
        let mut state = self.state.lock();
        let container = state
            .containers
            .get_mut(name)
            .ok_or_else(|| EngineError::ContainerNotFound(name.to_string()))?;
        container.running = true;
        Ok(())
    }

    async fn wait_container(&self, name: &str) -> EngineResult<i64> {
        if name.starts_with("inspect-") {
            return Ok(*self.inspect_exit_code.lock());
        }
        Ok(self
            .state
            .lock()
            .containers
            .get(name)
            .and_then(|container| container.exit_status)
            .unwrap_or(0))
    }

    async fn container_logs(&self, _name: &str) -> EngineResult<String> {
        Ok("fake container logs".to_string())
    }

    async fn remove_container(&self, name: &str) -> EngineResult<()> {
        self.state.lock().containers.remove(name);
        Ok(())
    }

    async fn container_ip(&self, name: &str) -> EngineResult<String> {
        if self.state.lock().containers.contains_key(name) {
            Ok("172.17.0.2".to_string())
        } else {
            Err(EngineError::ContainerNotFound(name.to_string()))
        }
    }

    async fn connect_to_network(&self, _name: &str, _network: &str) -> EngineResult<()> {
        Ok(())
    }

    async fn list_containers(&self) -> EngineResult<Vec<EngineContainer>> {
        Ok(self
            .state
            .lock()
            .containers
            .iter()
            .map(|(name, container)| EngineContainer {
                name: name.clone(),
                exit_status: container.exit_status,
                description: container
                    .exit_status
                    .map(|code| format!("Exited ({}) 1 second ago", code)),
            })
            .collect())
    }
}

pub struct FakeConnector {
    engines: HashMap<String, Arc<FakeEngine>>,
}

impl EngineConnector for FakeConnector {
    fn connect(
        &self,
        node_name: &str,
        _node_config: &NodeConfiguration,
    ) -> EngineResult<Arc<dyn ContainerEngine>> {
        self.engines
            .get(node_name)
            .cloned()
            .map(|engine| engine as Arc<dyn ContainerEngine>)
            .ok_or_else(|| EngineError::NodeUnavailable(node_name.to_string()))
    }
}

/// Signal sink for tests that drive the worker synchronously.
struct NullSignals;

impl MasterSignals for NullSignals {
    fn schedule(&self) {}
    fn container_callback(&self) {}
    fn data_container_callback(&self) {}
    fn update_node_status(&self, _node_name: &str) {}
}

pub struct Harness {
    pub db: Arc<Database>,
    pub state_machine: Arc<StateMachine>,
    pub inspector: Arc<NodeInspector>,
    pub worker: Arc<Worker>,
    pub dispatcher: Arc<CallbackDispatcher>,
    pub engines: HashMap<String, Arc<FakeEngine>>,
}

fn build_config(nodes: &[(&str, u64)], max_task_trials: i64) -> Configuration {
    let node_tables: String = nodes
        .iter()
        .map(|(name, _)| {
            format!(
                "[docker.nodes.{}]\nbase_url = \"tcp://{}:2376\"\n",
                name, name
            )
        })
        .collect();

    let toml_str = format!(
        r#"
        [server_web]
        external_url = "http://localhost:8000"

        [server_master]
        external_url = "tcp://localhost:8001"

        [docker]
        thread_limit = 4
        net = "flotilla-net"
        {node_tables}

        [defaults.application_container_description]
        entry_point = "python3 /worker.py"

        [defaults.data_container_description]
        image = "example/data-container"
        entry_point = "python3 /server.py"
        container_ram = 256
        num_workers = 4

        [defaults.inspection_container_description]
        image = "example/data-container"
        entry_point = "python3 /inspect.py"

        [defaults.scheduling_strategies]
        container_allocation = "spread"

        [defaults.error_handling]
        max_task_trials = {max_task_trials}
        dead_node_invalidation = true
        "#
    );

    toml::from_str(&toml_str).expect("harness config must parse")
}

/// Build a fully wired master with fake engines and register all nodes.
pub async fn harness(nodes: &[(&str, u64)], max_task_trials: i64) -> Harness {
    let config = Arc::new(build_config(nodes, max_task_trials));

    let engines: HashMap<String, Arc<FakeEngine>> = nodes
        .iter()
        .map(|(name, total_ram)| (name.to_string(), FakeEngine::new(*total_ram)))
        .collect();

    let db = Arc::new(Database::open_in_memory().unwrap());
    let state_machine = Arc::new(StateMachine::new(
        db.clone(),
        config.defaults.error_handling.clone(),
    ));

    let connector = Arc::new(FakeConnector {
        engines: engines.clone(),
    });
    let registry = Arc::new(NodeRegistry::new(&config.docker, connector).unwrap());
    let inspector = Arc::new(NodeInspector::new(
        config.clone(),
        db.clone(),
        registry.clone(),
    ));
    let cluster = Arc::new(Cluster::new(
        config.clone(),
        db.clone(),
        state_machine.clone(),
        registry,
        inspector.clone(),
    ));
    let scheduler = Scheduler::new(
        config.clone(),
        db.clone(),
        state_machine.clone(),
        cluster.clone(),
    )
    .unwrap();

    let worker = Worker::start(
        config.clone(),
        db.clone(),
        state_machine.clone(),
        cluster.clone(),
        scheduler,
        inspector.clone(),
    );

    // Tests drive ticks explicitly, so callbacks must not wake the live
    // worker loops behind their back
    let signals: Arc<dyn MasterSignals> = Arc::new(NullSignals);
    let dispatcher = Arc::new(CallbackDispatcher::new(
        config,
        db.clone(),
        state_machine.clone(),
        signals,
    ));

    inspector.register_all().await;

    Harness {
        db,
        state_machine,
        inspector,
        worker,
        dispatcher,
        engines,
    }
}

/// File connector as a user would submit it.
pub fn input_file(url: &str) -> Connector {
    serde_json::from_value(json!({
        "connector_type": "http",
        "connector_access": { "url": url }
    }))
    .unwrap()
}

/// Register a task the way the API front-end does: group plus task plus
/// created/waiting transitions.
pub async fn submit_task(
    harness: &Harness,
    container_ram: u64,
    input_files: Vec<Connector>,
    no_cache: bool,
) -> String {
    use flotilla::database;
    use flotilla::state_machine::Collection;
    use flotilla::states::{State, STATE_NEW};
    use flotilla::types::{ApplicationContainerDescription, Task, TaskGroup};

    let mut group = TaskGroup::prototype("alice", 1);
    let result_files = input_files.iter().map(|_| None).collect();
    let task = Task {
        id: uuid::Uuid::new_v4().to_string(),
        username: "alice".to_string(),
        tags: Vec::new(),
        no_cache,
        application_container_description: ApplicationContainerDescription {
            image: "example/app".to_string(),
            container_ram,
            entry_point: None,
            registry_auth: None,
            parameters: None,
            tracing: None,
            sandbox: None,
        },
        input_files,
        result_files,
        notifications: Vec::new(),
        state: STATE_NEW,
        trials: 0,
        transitions: Vec::new(),
        task_group_id: group.id.clone(),
        created_at: None,
    };
    group.task_ids.push(task.id.clone());

    {
        let conn = harness.db.lock().await;
        database::insert(&conn, &group).unwrap();
        database::insert(&conn, &task).unwrap();
    }

    let sm = &harness.state_machine;
    sm.transition(Collection::TaskGroups, &group.id, State::Created, "Task group created.", None)
        .await
        .unwrap();
    sm.transition(Collection::Tasks, &task.id, State::Created, "Task created.", None)
        .await
        .unwrap();
    sm.transition(Collection::Tasks, &task.id, State::Waiting, "Task waiting.", None)
        .await
        .unwrap();
    sm.transition(Collection::TaskGroups, &group.id, State::Waiting, "Task group waiting.", None)
        .await
        .unwrap();

    task.id
}

/// Callback payload as a container worker would send it.
pub fn callback(key: &str, callback_type: i64, container_id: &str, state: i64) -> CallbackPayload {
    serde_json::from_value(json!({
        "callback_key": key,
        "callback_type": callback_type,
        "container_id": container_id,
        "content": { "state": state, "description": "worker progress" }
    }))
    .unwrap()
}
