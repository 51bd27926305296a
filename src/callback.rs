//! Container callback protocol
//!
//! Containers report progress with ordered callbacks. The dispatcher
//! authorizes each one against the stored callback key, enforces the
//! strict sequence, advances container state and answers the handshake
//! with the file descriptors the in-container worker needs.

use std::sync::Arc;

use serde_json::{json, Value};
use thiserror::Error;

use crate::config::Configuration;
use crate::database::{self, Database};
use crate::secrets::secrets_equal;
use crate::state_machine::{Collection, StateMachine};
use crate::states::State;
use crate::types::{ApplicationContainer, CallbackPayload, DataContainer, Task};
use crate::worker::MasterSignals;

#[derive(Debug, Error)]
pub enum CallbackError {
    #[error("callback not authorized")]
    Unauthorized,

    #[error("{0}")]
    BadRequest(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl From<database::DatabaseError> for CallbackError {
    fn from(e: database::DatabaseError) -> Self {
        CallbackError::Internal(e.to_string())
    }
}

pub struct CallbackDispatcher {
    config: Arc<Configuration>,
    db: Arc<Database>,
    state_machine: Arc<StateMachine>,
    signals: Arc<dyn MasterSignals>,
}

impl CallbackDispatcher {
    pub fn new(
        config: Arc<Configuration>,
        db: Arc<Database>,
        state_machine: Arc<StateMachine>,
        signals: Arc<dyn MasterSignals>,
    ) -> Self {
        Self {
            config,
            db,
            state_machine,
            signals,
        }
    }

    /// Handle a callback from an application container worker.
    pub async fn application_container_callback(
        &self,
        payload: CallbackPayload,
    ) -> Result<Value, CallbackError> {
        let container_id = payload.container_id.clone();

        {
            let conn = self.db.lock().await;
            let ac: ApplicationContainer = database::get(&conn, &container_id)?
                .ok_or(CallbackError::Unauthorized)?;
            if !secrets_equal(&ac.callback_key, &payload.callback_key) {
                return Err(CallbackError::Unauthorized);
            }
        }

        self.validate_callback::<ApplicationContainer>(
            Collection::ApplicationContainers,
            &payload,
        )
        .await?;

        let ac: ApplicationContainer = {
            let conn = self.db.lock().await;
            database::require(&conn, &container_id)?
        };

        if ac.state == State::Failed.index() {
            self.signals.container_callback();
            return Err(CallbackError::BadRequest("Container failed.".to_string()));
        }

        match payload.callback_type {
            0 => self.application_container_handshake(&ac).await,
            3 => {
                self.state_machine
                    .transition(
                        Collection::ApplicationContainers,
                        &container_id,
                        State::Success,
                        "Callback with callback_type 3 has been sent.",
                        None,
                    )
                    .await?;
                self.signals.container_callback();
                Ok(json!({}))
            }
            _ => Ok(json!({})),
        }
    }

    /// Handle a callback from a data container worker.
    pub async fn data_container_callback(
        &self,
        payload: CallbackPayload,
    ) -> Result<Value, CallbackError> {
        let container_id = payload.container_id.clone();

        {
            let conn = self.db.lock().await;
            let dc: DataContainer = database::get(&conn, &container_id)?
                .ok_or(CallbackError::Unauthorized)?;
            if !secrets_equal(&dc.callback_key, &payload.callback_key) {
                return Err(CallbackError::Unauthorized);
            }
        }

        self.validate_callback::<DataContainer>(Collection::DataContainers, &payload)
            .await?;

        let dc: DataContainer = {
            let conn = self.db.lock().await;
            database::require(&conn, &container_id)?
        };

        if dc.state == State::Failed.index() {
            self.signals.container_callback();
            return Err(CallbackError::BadRequest("Container failed.".to_string()));
        }

        match payload.callback_type {
            0 => {
                let description = &self.config.defaults.data_container_description;
                Ok(json!({
                    "input_files": dc.input_files,
                    "input_file_keys": dc.input_file_keys,
                    "num_workers": description.num_workers,
                }))
            }
            1 => {
                self.state_machine
                    .transition(
                        Collection::DataContainers,
                        &container_id,
                        State::Processing,
                        "Input files available in data container.",
                        None,
                    )
                    .await?;
                self.signals.data_container_callback();
                Ok(json!({}))
            }
            _ => Ok(json!({})),
        }
    }

    /// Record the callback and enforce sequence and content rules; rule
    /// violations fail the container.
    async fn validate_callback<T>(
        &self,
        collection: Collection,
        payload: &CallbackPayload,
    ) -> Result<(), CallbackError>
    where
        T: database::Document + CallbackLog,
    {
        let expected;
        {
            let conn = self.db.lock().await;
            let Some(mut container) = database::get::<T>(&conn, &payload.container_id)? else {
                return Err(CallbackError::Unauthorized);
            };
            if crate::states::is_end_state(container.state()) {
                return Ok(());
            }
            expected = container.callbacks_ref().len() as i64;
            let raw = serde_json::to_value(payload)
                .map_err(|e| CallbackError::Internal(e.to_string()))?;
            container.callbacks_mut().push(raw);
            database::update(&conn, &container)?;
        }

        if payload.callback_type != expected {
            self.state_machine
                .transition(
                    collection,
                    &payload.container_id,
                    State::Failed,
                    "Callback with invalid callback_type has been sent.",
                    None,
                )
                .await?;
            return Ok(());
        }

        if payload.content.state == State::Failed.index() {
            self.state_machine
                .transition(
                    collection,
                    &payload.container_id,
                    State::Failed,
                    "Something went wrong on the other side.",
                    payload.content.exception.clone(),
                )
                .await?;
            return Ok(());
        }

        if payload.content.state != State::Success.index() {
            self.state_machine
                .transition(
                    collection,
                    &payload.container_id,
                    State::Failed,
                    "Callback with invalid state has been sent.",
                    None,
                )
                .await?;
        }

        Ok(())
    }

    /// Build the handshake packet the application container worker runs
    /// with: task metadata plus one input file descriptor per position.
    async fn application_container_handshake(
        &self,
        ac: &ApplicationContainer,
    ) -> Result<Value, CallbackError> {
        let conn = self.db.lock().await;
        let task: Task = database::require(&conn, &ac.task_id)?;

        let input_files: Value = if task.no_cache {
            serde_json::to_value(&task.input_files)
                .map_err(|e| CallbackError::Internal(e.to_string()))?
        } else {
            let mut files = Vec::with_capacity(task.input_files.len());
            for (input_file, dc_id) in task.input_files.iter().zip(ac.data_container_ids.iter()) {
                let Some(dc_id) = dc_id else {
                    return Err(CallbackError::Internal(format!(
                        "input file without data container on {}",
                        ac.id
                    )));
                };
                let dc: DataContainer = database::require(&conn, dc_id)?;
                let ip = dc.ip.clone().unwrap_or_else(|| dc.id.clone());

                let key = dc
                    .input_files
                    .iter()
                    .zip(dc.input_file_keys.iter())
                    .find(|(file, _)| *file == input_file)
                    .map(|(_, key)| key.clone())
                    .ok_or_else(|| {
                        CallbackError::Internal(format!(
                            "data container {} does not hold the requested input file",
                            dc.id
                        ))
                    })?;

                files.push(json!({
                    "connector_type": "http",
                    "connector_access": { "url": format!("http://{}/{}", ip, key) },
                }));
            }
            Value::Array(files)
        };

        let description = &task.application_container_description;
        Ok(json!({
            "task_id": task.id,
            "result_files": task.result_files,
            "parameters": description.parameters,
            "sandbox": description.sandbox,
            "tracing": description.tracing,
            "input_files": input_files,
        }))
    }
}

/// Access to the raw callback log shared by both container kinds.
trait CallbackLog {
    fn callbacks_ref(&self) -> &Vec<Value>;
    fn callbacks_mut(&mut self) -> &mut Vec<Value>;
}

impl CallbackLog for ApplicationContainer {
    fn callbacks_ref(&self) -> &Vec<Value> {
        &self.callbacks
    }
    fn callbacks_mut(&mut self) -> &mut Vec<Value> {
        &mut self.callbacks
    }
}

impl CallbackLog for DataContainer {
    fn callbacks_ref(&self) -> &Vec<Value> {
        &self.callbacks
    }
    fn callbacks_mut(&mut self) -> &mut Vec<Value> {
        &mut self.callbacks
    }
}
