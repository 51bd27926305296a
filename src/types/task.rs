use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::states::{Transition, STATE_NEW};

use super::connector::{Connector, NotificationConnector};

/// Credentials for pulling from a private registry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RegistryAuth {
    pub username: String,
    pub password: String,
}

/// User-supplied description of the application container to run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ApplicationContainerDescription {
    pub image: String,

    /// RAM limit in MB
    pub container_ram: u64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entry_point: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub registry_auth: Option<RegistryAuth>,

    /// Parameters handed verbatim to the in-container worker
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameters: Option<Value>,

    /// Tracing settings, opaque to the scheduler
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tracing: Option<Value>,

    /// Sandbox settings, opaque to the scheduler
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sandbox: Option<Value>,
}

/// A user-submitted unit of work: one containerized application plus its
/// input and result file references.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    #[serde(rename = "_id")]
    pub id: String,

    pub username: String,

    #[serde(default)]
    pub tags: Vec<String>,

    #[serde(default)]
    pub no_cache: bool,

    pub application_container_description: ApplicationContainerDescription,

    pub input_files: Vec<Connector>,

    pub result_files: Vec<Option<Connector>>,

    #[serde(default)]
    pub notifications: Vec<NotificationConnector>,

    pub state: i64,

    pub trials: i64,

    pub transitions: Vec<Transition>,

    pub task_group_id: String,

    pub created_at: Option<f64>,
}

impl Task {
    pub fn ram(&self) -> u64 {
        self.application_container_description.container_ram
    }
}

/// A batch of tasks submitted in one request; its end state derives from
/// the member tasks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskGroup {
    #[serde(rename = "_id")]
    pub id: String,

    pub username: String,

    pub tasks_count: usize,

    pub task_ids: Vec<String>,

    pub state: i64,

    pub transitions: Vec<Transition>,

    pub created_at: Option<f64>,
}

impl TaskGroup {
    pub fn prototype(username: impl Into<String>, tasks_count: usize) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            username: username.into(),
            tasks_count,
            task_ids: Vec::new(),
            state: STATE_NEW,
            transitions: Vec::new(),
            created_at: None,
        }
    }
}
