//! Master process - the scheduling orchestrator

use std::sync::Arc;

use anyhow::Result;
use tracing::info;

use flotilla::bus;
use flotilla::cluster::{Cluster, DockerConnector, NodeInspector, NodeRegistry};
use flotilla::config::Configuration;
use flotilla::database::Database;
use flotilla::scheduling::Scheduler;
use flotilla::state_machine::StateMachine;
use flotilla::worker::{MasterSignals, Worker};

pub async fn run(config_path: &str, debug: bool) -> Result<()> {
    let config = Arc::new(Configuration::load(config_path)?);
    super::init_tracing(&config, debug, true);

    info!("Starting flotilla master v{}", env!("CARGO_PKG_VERSION"));

    let db = Arc::new(Database::open(&config.storage.db_path)?);
    let state_machine = Arc::new(StateMachine::new(
        db.clone(),
        config.defaults.error_handling.clone(),
    ));

    let connector = Arc::new(DockerConnector::new(config.docker.api_timeout_seconds));
    let registry = Arc::new(NodeRegistry::new(&config.docker, connector)?);
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
    )?;

    let worker = Worker::start(
        config.clone(),
        db,
        state_machine,
        cluster,
        scheduler,
        inspector.clone(),
    );

    // Learn node capacities before anything is scheduled
    inspector.register_all().await;
    worker.startup().await;

    let bind = format!(
        "{}:{}",
        config.server_master.bind_host, config.server_master.bind_port
    );
    let signals: Arc<dyn MasterSignals> = worker;
    bus::serve_inbox(&bind, signals).await
}
