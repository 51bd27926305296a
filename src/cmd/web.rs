//! Web process - the user-facing HTTP API

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use tracing::info;

use flotilla::auth::Authorize;
use flotilla::bus::BusClient;
use flotilla::callback::CallbackDispatcher;
use flotilla::config::Configuration;
use flotilla::database::Database;
use flotilla::state_machine::StateMachine;
use flotilla::web::{build_router, AppState};
use flotilla::worker::MasterSignals;

pub async fn run(config_path: &str, debug: bool) -> Result<()> {
    let config = Arc::new(Configuration::load(config_path)?);
    super::init_tracing(&config, debug, true);

    info!("Starting flotilla web v{}", env!("CARGO_PKG_VERSION"));

    let db = Arc::new(Database::open(&config.storage.db_path)?);
    let state_machine = Arc::new(StateMachine::new(
        db.clone(),
        config.defaults.error_handling.clone(),
    ));
    let authorize = Arc::new(Authorize::new(
        db.clone(),
        config.defaults.authorization.clone(),
    ));

    let signals: Arc<dyn MasterSignals> =
        Arc::new(BusClient::new(&config.server_master.external_url));
    let dispatcher = Arc::new(CallbackDispatcher::new(
        config.clone(),
        db.clone(),
        state_machine.clone(),
        signals.clone(),
    ));

    let state = AppState {
        config: config.clone(),
        db,
        state_machine,
        authorize,
        dispatcher,
        signals,
    };
    let app = build_router(state);

    let bind: SocketAddr = format!(
        "{}:{}",
        config.server_web.bind_host, config.server_web.bind_port
    )
    .parse()?;

    info!("API listening on {}", bind);
    let listener = tokio::net::TcpListener::bind(bind).await?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;

    Ok(())
}
