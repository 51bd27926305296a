use serde::{Deserialize, Serialize};

/// Callback sent by a container worker to advance its protocol.
///
/// `callback_type` must equal the number of callbacks already recorded for
/// the container; any gap or repeat fails the container.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CallbackPayload {
    pub callback_key: String,

    pub callback_type: i64,

    pub container_id: String,

    pub content: CallbackContent,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CallbackContent {
    /// State index reported by the worker; anything but success fails the
    /// container
    pub state: i64,

    pub description: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exception: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub telemetry: Option<Telemetry>,
}

/// Resource usage reported with the final callbacks.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Telemetry {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_vms_memory: Option<f64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_rss_memory: Option<f64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_file_sizes: Option<Vec<Option<f64>>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_file_sizes: Option<Vec<Option<f64>>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wall_time: Option<f64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub std_out: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub std_err: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub return_code: Option<i64>,
}
