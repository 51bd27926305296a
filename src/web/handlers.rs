//! HTTP handlers for the user API

use std::net::SocketAddr;

use axum::{
    extract::{ConnectInfo, State},
    http::HeaderMap,
    Extension, Json,
};
use serde_json::{json, Value};

use crate::auth::AuthenticatedUser;
use crate::database;
use crate::error::{Result, ServerError};
use crate::secrets::scrub_secrets;
use crate::state_machine::Collection;
use crate::states::{end_states, State as LifecycleState};
use crate::types::{ApplicationContainer, CallbackPayload, DataContainer, Task, TaskGroup};

use super::middleware::{authenticate, client_ip};
use super::query::run_pipeline;
use super::schema::{
    CancelBatch, CancelTarget, NodesSubmission, QuerySubmission, TaskBatchSubmission,
    TaskSubmission,
};
use super::AppState;

pub async fn get_root() -> Json<Value> {
    Json(json!({ "version": env!("CARGO_PKG_VERSION") }))
}

pub async fn get_token(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> Result<Json<Value>> {
    let ip = client_ip(&headers, &addr);
    // Tokens are only issued against the real password
    let user = authenticate(&state, &headers, &ip, false, true).await?;

    let token = state.authorize.issue_token(&user.username, &ip).await?;
    Ok(Json(json!({
        "token": token,
        "valid_for_seconds": state.authorize.tokens_valid_for_seconds(),
    })))
}

pub async fn post_tasks(
    State(state): State<AppState>,
    Extension(user): Extension<AuthenticatedUser>,
    Json(body): Json<Value>,
) -> Result<Json<Value>> {
    let (submissions, batch) = if body.get("tasks").is_some() {
        let parsed: TaskBatchSubmission =
            serde_json::from_value(body).map_err(|e| ServerError::Validation(e.to_string()))?;
        (parsed.tasks, true)
    } else {
        let parsed: TaskSubmission =
            serde_json::from_value(body).map_err(|e| ServerError::Validation(e.to_string()))?;
        (vec![parsed], false)
    };

    let group = TaskGroup::prototype(&user.username, submissions.len());
    let group_id = group.id.clone();
    {
        let conn = state.db.lock().await;
        database::insert(&conn, &group)?;
    }
    state
        .state_machine
        .transition(Collection::TaskGroups, &group_id, LifecycleState::Created, "Task group created.", None)
        .await?;

    let mut task_ids = Vec::with_capacity(submissions.len());
    for submission in submissions {
        let task = submission.into_task(&user.username, &group_id);
        let task_id = task.id.clone();
        {
            let conn = state.db.lock().await;
            database::insert(&conn, &task)?;
            let mut group: TaskGroup = database::require(&conn, &group_id)?;
            group.task_ids.push(task_id.clone());
            database::update(&conn, &group)?;
        }
        state
            .state_machine
            .transition(Collection::Tasks, &task_id, LifecycleState::Created, "Task created.", None)
            .await?;
        state
            .state_machine
            .transition(Collection::Tasks, &task_id, LifecycleState::Waiting, "Task waiting.", None)
            .await?;
        task_ids.push(task_id);
    }

    state
        .state_machine
        .transition(Collection::TaskGroups, &group_id, LifecycleState::Waiting, "Task group waiting.", None)
        .await?;

    state.signals.schedule();

    if batch {
        let tasks: Vec<Value> = task_ids.iter().map(|id| json!({ "_id": id })).collect();
        Ok(Json(json!({ "task_group_id": group_id, "tasks": tasks })))
    } else {
        Ok(Json(json!({ "_id": task_ids[0] })))
    }
}

pub async fn post_tasks_cancel(
    State(state): State<AppState>,
    Extension(user): Extension<AuthenticatedUser>,
    Json(body): Json<Value>,
) -> Result<Json<Value>> {
    let (targets, batch) = if body.get("tasks").is_some() {
        let parsed: CancelBatch =
            serde_json::from_value(body).map_err(|e| ServerError::Validation(e.to_string()))?;
        (parsed.tasks, true)
    } else {
        let parsed: CancelTarget =
            serde_json::from_value(body).map_err(|e| ServerError::Validation(e.to_string()))?;
        (vec![parsed], false)
    };

    // Ownership is checked for every target before anything is cancelled
    {
        let conn = state.db.lock().await;
        for target in &targets {
            let task: Option<Task> = database::get(&conn, &target.id)?;
            let owned = task
                .map(|task| user.is_admin || task.username == user.username)
                .unwrap_or(false);
            if !owned {
                return Err(ServerError::Validation(format!(
                    "Task not found: {}",
                    target.id
                )));
            }
        }
    }

    let mut responses = Vec::with_capacity(targets.len());
    for target in &targets {
        state
            .state_machine
            .transition(Collection::Tasks, &target.id, LifecycleState::Cancelled, "Task cancelled.", None)
            .await?;
        let conn = state.db.lock().await;
        let task: Task = database::require(&conn, &target.id)?;
        responses.push(json!({ "_id": task.id, "state": task.state }));
    }

    state.signals.container_callback();

    if batch {
        Ok(Json(json!({ "tasks": responses })))
    } else {
        Ok(Json(responses.into_iter().next().unwrap_or(json!({}))))
    }
}

pub async fn post_tasks_query(
    state: State<AppState>,
    user: Extension<AuthenticatedUser>,
    body: Json<Value>,
) -> Result<Json<Value>> {
    query_collection(state, user, body, "tasks").await
}

pub async fn post_task_groups_query(
    state: State<AppState>,
    user: Extension<AuthenticatedUser>,
    body: Json<Value>,
) -> Result<Json<Value>> {
    query_collection(state, user, body, "task_groups").await
}

pub async fn post_application_containers_query(
    state: State<AppState>,
    user: Extension<AuthenticatedUser>,
    body: Json<Value>,
) -> Result<Json<Value>> {
    query_collection(state, user, body, "application_containers").await
}

pub async fn post_data_containers_query(
    state: State<AppState>,
    user: Extension<AuthenticatedUser>,
    body: Json<Value>,
) -> Result<Json<Value>> {
    query_collection(state, user, body, "data_containers").await
}

async fn query_collection(
    State(state): State<AppState>,
    Extension(user): Extension<AuthenticatedUser>,
    Json(body): Json<Value>,
    collection: &str,
) -> Result<Json<Value>> {
    let submission: QuerySubmission =
        serde_json::from_value(body).map_err(|e| ServerError::Validation(e.to_string()))?;

    let mut pipeline = submission.aggregate;
    if !user.is_admin {
        pipeline.insert(0, json!({ "$match": { "username": user.username } }));
    }

    let docs = {
        let conn = state.db.lock().await;
        database::all_raw(&conn, collection)?
    };

    let mut result = run_pipeline(docs, &pipeline).map_err(ServerError::Validation)?;
    for doc in result.iter_mut() {
        scrub_secrets(doc);
    }

    Ok(Json(json!({ collection: result })))
}

pub async fn get_nodes(State(state): State<AppState>) -> Result<Json<Value>> {
    let conn = state.db.lock().await;

    let open_acs: Vec<ApplicationContainer> = database::find_not_in_states(&conn, &end_states())?;
    let open_dcs: Vec<DataContainer> = database::find_not_in_states(&conn, &end_states())?;

    let nodes: Vec<Value> = database::all_nodes(&conn)?
        .into_iter()
        .map(|node| {
            let node_acs: Vec<&ApplicationContainer> = open_acs
                .iter()
                .filter(|ac| ac.cluster_node.as_deref() == Some(node.cluster_node.as_str()))
                .collect();
            let node_dcs: Vec<&DataContainer> = open_dcs
                .iter()
                .filter(|dc| dc.cluster_node.as_deref() == Some(node.cluster_node.as_str()))
                .collect();

            let reserved_ram: u64 = node_acs.iter().map(|ac| ac.container_ram).sum::<u64>()
                + node_dcs.iter().map(|dc| dc.container_ram).sum::<u64>();

            json!({
                "cluster_node": node.cluster_node,
                "is_online": node.is_online,
                "debug_info": node.debug_info,
                "total_ram": node.total_ram,
                "total_cpus": node.total_cpus,
                "reserved_ram": reserved_ram,
                "active_application_containers": node_acs.len(),
                "active_data_containers": node_dcs.len(),
            })
        })
        .collect();

    let dead_nodes = database::all_dead_nodes(&conn)?;

    Ok(Json(json!({ "nodes": nodes, "dead_nodes": dead_nodes })))
}

pub async fn post_nodes(
    State(state): State<AppState>,
    Extension(user): Extension<AuthenticatedUser>,
    Json(body): Json<Value>,
) -> Result<Json<Value>> {
    if !user.is_admin {
        return Err(ServerError::Unauthorized);
    }

    let submission: NodesSubmission =
        serde_json::from_value(body).map_err(|e| ServerError::Validation(e.to_string()))?;

    for node in submission.nodes {
        state.signals.update_node_status(&node.cluster_node);
    }

    Ok(Json(json!({})))
}

pub async fn post_application_containers_callback(
    State(state): State<AppState>,
    Json(body): Json<Value>,
) -> Result<Json<Value>> {
    let payload: CallbackPayload =
        serde_json::from_value(body).map_err(|e| ServerError::Validation(e.to_string()))?;
    let response = state
        .dispatcher
        .application_container_callback(payload)
        .await?;
    Ok(Json(response))
}

pub async fn post_data_containers_callback(
    State(state): State<AppState>,
    Json(body): Json<Value>,
) -> Result<Json<Value>> {
    let payload: CallbackPayload =
        serde_json::from_value(body).map_err(|e| ServerError::Validation(e.to_string()))?;
    let response = state.dispatcher.data_container_callback(payload).await?;
    Ok(Json(response))
}
