use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Opaque descriptor of an external file source or sink.
///
/// Connectors are interpreted by the worker process inside the container,
/// never by the scheduler; only their shape is validated here. The result
/// variant additionally allows `local_result_file` and `add_meta_data`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Connector {
    pub connector_type: String,

    pub connector_access: Value,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_result_file: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub add_meta_data: Option<bool>,
}

impl Connector {
    /// Build the http connector handed to an application container for a
    /// cached input file.
    pub fn http(url: impl Into<String>) -> Self {
        let url: String = url.into();
        Self {
            connector_type: "http".to_string(),
            connector_access: serde_json::json!({ "url": url }),
            local_result_file: None,
            add_meta_data: None,
        }
    }
}

/// Endpoint notified when a task reaches a terminal state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NotificationConnector {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connector_type: Option<String>,

    pub connector_access: NotificationAccess,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NotificationAccess {
    pub url: String,

    /// HTTP method, `POST` or `PUT` (any casing)
    pub method: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub json_data: Option<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssl_verify: Option<bool>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth: Option<NotificationAuth>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NotificationAuth {
    pub auth_type: String,
    pub username: String,
    pub password: String,
}
