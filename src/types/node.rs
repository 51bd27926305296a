use serde::{Deserialize, Serialize};

/// Known cluster node and its last observed capacity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeRecord {
    pub cluster_node: String,

    pub is_online: bool,

    /// Total RAM in MiB
    pub total_ram: u64,

    pub total_cpus: u64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub debug_info: Option<String>,
}

/// A node the inspector currently considers unreachable.
///
/// The inspector is the only writer of these records.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadNode {
    pub name: String,
    pub description: String,
}
