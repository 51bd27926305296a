//! User-facing HTTP API
//!
//! Thin front-end over the state machine and callback dispatcher: request
//! validation, authentication and query passthrough. Scheduling decisions
//! never happen here; the master is signalled over the bus instead.

mod handlers;
mod middleware;
mod query;
mod schema;

pub use query::ALLOWED_STAGES;

use std::sync::Arc;

use axum::{
    middleware::from_fn_with_state,
    routing::{get, post},
    Router,
};
use tower_http::trace::TraceLayer;

use crate::auth::Authorize;
use crate::callback::CallbackDispatcher;
use crate::config::Configuration;
use crate::database::Database;
use crate::state_machine::StateMachine;
use crate::worker::MasterSignals;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Configuration>,
    pub db: Arc<Database>,
    pub state_machine: Arc<StateMachine>,
    pub authorize: Arc<Authorize>,
    pub dispatcher: Arc<CallbackDispatcher>,
    pub signals: Arc<dyn MasterSignals>,
}

pub fn build_router(state: AppState) -> Router {
    let protected = Router::new()
        .route("/tasks", post(handlers::post_tasks))
        .route("/tasks/cancel", post(handlers::post_tasks_cancel))
        .route("/tasks/query", post(handlers::post_tasks_query))
        .route("/task-groups/query", post(handlers::post_task_groups_query))
        .route(
            "/application-containers/query",
            post(handlers::post_application_containers_query),
        )
        .route(
            "/data-containers/query",
            post(handlers::post_data_containers_query),
        )
        .route("/nodes", get(handlers::get_nodes).post(handlers::post_nodes))
        .route_layer(from_fn_with_state(state.clone(), middleware::require_user));

    Router::new()
        .route("/", get(handlers::get_root))
        .route("/token", get(handlers::get_token))
        .route(
            "/application-containers/callback",
            post(handlers::post_application_containers_callback),
        )
        .route(
            "/data-containers/callback",
            post(handlers::post_data_containers_callback),
        )
        .merge(protected)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
