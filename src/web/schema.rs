//! Request body shapes
//!
//! Validation is structural: unknown fields are rejected and required
//! fields enforced through serde, mirroring the task, cancel, query and
//! callback schemas of the wire protocol.

use serde::Deserialize;
use serde_json::Value;
use uuid::Uuid;

use crate::states::STATE_NEW;
use crate::types::{
    ApplicationContainerDescription, Connector, NotificationConnector, Task,
};

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TaskSubmission {
    #[serde(default)]
    pub tags: Vec<String>,

    #[serde(default)]
    pub no_cache: bool,

    pub application_container_description: ApplicationContainerDescription,

    pub input_files: Vec<Connector>,

    pub result_files: Vec<Option<Connector>>,

    #[serde(default)]
    pub notifications: Vec<NotificationConnector>,
}

impl TaskSubmission {
    pub fn into_task(self, username: &str, task_group_id: &str) -> Task {
        Task {
            id: Uuid::new_v4().to_string(),
            username: username.to_string(),
            tags: self.tags,
            no_cache: self.no_cache,
            application_container_description: self.application_container_description,
            input_files: self.input_files,
            result_files: self.result_files,
            notifications: self.notifications,
            state: STATE_NEW,
            trials: 0,
            transitions: Vec::new(),
            task_group_id: task_group_id.to_string(),
            created_at: None,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TaskBatchSubmission {
    pub tasks: Vec<TaskSubmission>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CancelTarget {
    #[serde(rename = "_id")]
    pub id: String,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CancelBatch {
    pub tasks: Vec<CancelTarget>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct QuerySubmission {
    pub aggregate: Vec<Value>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NodesSubmission {
    pub nodes: Vec<NodeTarget>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NodeTarget {
    pub cluster_node: String,
}
