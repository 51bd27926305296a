use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::secrets::generate_secret;
use crate::states::{Transition, STATE_NEW};

use super::connector::Connector;
use super::task::Task;

/// Short-lived container running a user workload.
///
/// `data_container_ids` is positionally aligned with the task's
/// `input_files`; a `None` entry means the file is served without a cache.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationContainer {
    #[serde(rename = "_id")]
    pub id: String,

    pub task_id: String,

    pub username: String,

    pub cluster_node: Option<String>,

    /// RAM limit in MB
    pub container_ram: u64,

    pub state: i64,

    pub data_container_ids: Vec<Option<String>>,

    pub callback_key: String,

    /// Raw callback payloads in arrival order
    pub callbacks: Vec<Value>,

    pub transitions: Vec<Transition>,

    pub created_at: Option<f64>,

    pub ip: Option<String>,
}

impl ApplicationContainer {
    /// Fresh container document for a task, not yet placed or created.
    pub fn prototype(task: &Task) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            task_id: task.id.clone(),
            username: task.username.clone(),
            cluster_node: None,
            container_ram: task.application_container_description.container_ram,
            state: STATE_NEW,
            data_container_ids: Vec::new(),
            callback_key: generate_secret(),
            callbacks: Vec::new(),
            transitions: Vec::new(),
            created_at: None,
            ip: None,
        }
    }

    /// Data container ids without the uncached positions.
    pub fn referenced_data_containers(&self) -> Vec<String> {
        self.data_container_ids.iter().flatten().cloned().collect()
    }
}

/// Short-lived container caching a task's input files and serving them
/// over HTTP to application containers on the same network.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataContainer {
    #[serde(rename = "_id")]
    pub id: String,

    pub username: String,

    pub cluster_node: Option<String>,

    /// RAM limit in MB
    pub container_ram: u64,

    pub input_files: Vec<Connector>,

    /// One random URL path token per input file
    pub input_file_keys: Vec<String>,

    pub callback_key: String,

    pub callbacks: Vec<Value>,

    pub transitions: Vec<Transition>,

    pub state: i64,

    pub created_at: Option<f64>,

    pub ip: Option<String>,
}

impl DataContainer {
    /// Fresh cache container for a set of input files, not yet placed.
    pub fn prototype(
        username: impl Into<String>,
        input_files: Vec<Connector>,
        container_ram: u64,
    ) -> Self {
        let input_file_keys = input_files.iter().map(|_| generate_secret()).collect();
        Self {
            id: Uuid::new_v4().to_string(),
            username: username.into(),
            cluster_node: None,
            container_ram,
            input_files,
            input_file_keys,
            callback_key: generate_secret(),
            callbacks: Vec::new(),
            transitions: Vec::new(),
            state: STATE_NEW,
            created_at: None,
            ip: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::task::ApplicationContainerDescription;

    fn task() -> Task {
        Task {
            id: "task-1".to_string(),
            username: "alice".to_string(),
            tags: Vec::new(),
            no_cache: false,
            application_container_description: ApplicationContainerDescription {
                image: "example/app".to_string(),
                container_ram: 512,
                entry_point: None,
                registry_auth: None,
                parameters: None,
                tracing: None,
                sandbox: None,
            },
            input_files: Vec::new(),
            result_files: Vec::new(),
            notifications: Vec::new(),
            state: STATE_NEW,
            trials: 0,
            transitions: Vec::new(),
            task_group_id: "group-1".to_string(),
            created_at: None,
        }
    }

    #[test]
    fn test_application_container_prototype() {
        let ac = ApplicationContainer::prototype(&task());
        assert_eq!(ac.task_id, "task-1");
        assert_eq!(ac.container_ram, 512);
        assert_eq!(ac.state, STATE_NEW);
        assert_eq!(ac.callback_key.len(), 64);
        assert!(ac.cluster_node.is_none());
    }

    #[test]
    fn test_data_container_prototype_keys() {
        let files = vec![Connector::http("http://a"), Connector::http("http://b")];
        let dc = DataContainer::prototype("alice", files, 256);
        assert_eq!(dc.input_file_keys.len(), 2);
        assert_ne!(dc.input_file_keys[0], dc.input_file_keys[1]);
        assert_ne!(dc.callback_key, dc.input_file_keys[0]);
    }

    #[test]
    fn test_referenced_data_containers_skips_uncached() {
        let mut ac = ApplicationContainer::prototype(&task());
        ac.data_container_ids = vec![Some("dc-1".to_string()), None, Some("dc-2".to_string())];
        assert_eq!(ac.referenced_data_containers(), vec!["dc-1", "dc-2"]);
    }
}
