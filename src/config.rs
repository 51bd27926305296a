//! Configuration structures and loading

use std::collections::HashMap;
use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::types::NotificationConnector;

/// Main server configuration, shared by every process role.
#[derive(Debug, Clone, Deserialize)]
pub struct Configuration {
    /// Enable debug mode
    #[serde(default)]
    pub debug: bool,

    pub server_web: WebConfiguration,

    pub server_master: MasterConfiguration,

    #[serde(default)]
    pub server_log: LogConfiguration,

    #[serde(default)]
    pub server_files: FilesConfiguration,

    #[serde(default)]
    pub storage: StorageConfiguration,

    pub docker: DockerConfiguration,

    pub defaults: DefaultsConfiguration,
}

impl Configuration {
    /// Load configuration from a TOML file
    pub fn load(path: &str) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path))?;

        let config: Configuration =
            toml::from_str(&content).with_context(|| "Failed to parse configuration")?;

        Ok(config)
    }
}

/// Web (user API) process configuration
#[derive(Debug, Clone, Deserialize)]
pub struct WebConfiguration {
    #[serde(default = "default_host")]
    pub bind_host: String,

    #[serde(default = "default_web_port")]
    pub bind_port: u16,

    /// URL under which containers and users reach the API
    pub external_url: String,
}

/// Master (scheduler) process configuration
#[derive(Debug, Clone, Deserialize)]
pub struct MasterConfiguration {
    #[serde(default = "default_host")]
    pub bind_host: String,

    #[serde(default = "default_master_port")]
    pub bind_port: u16,

    /// Address the web process pushes inbox messages to
    pub external_url: String,

    /// Republish `schedule` on this interval to self-heal stuck states
    #[serde(default)]
    pub scheduling_interval_seconds: Option<u64>,
}

/// Log process configuration
#[derive(Debug, Clone, Deserialize)]
pub struct LogConfiguration {
    #[serde(default = "default_host")]
    pub bind_host: String,

    #[serde(default = "default_log_port")]
    pub bind_port: u16,

    /// Address master/web tee their log lines to; unset disables the tee
    #[serde(default)]
    pub external_url: Option<String>,

    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,

    #[serde(default)]
    pub suppress_stdout: bool,
}

impl Default for LogConfiguration {
    fn default() -> Self {
        Self {
            bind_host: default_host(),
            bind_port: default_log_port(),
            external_url: None,
            log_dir: default_log_dir(),
            suppress_stdout: false,
        }
    }
}

/// Static file server configuration
#[derive(Debug, Clone, Deserialize)]
pub struct FilesConfiguration {
    #[serde(default = "default_host")]
    pub bind_host: String,

    #[serde(default = "default_files_port")]
    pub bind_port: u16,

    #[serde(default = "default_input_files_dir")]
    pub input_files_dir: PathBuf,

    #[serde(default = "default_result_files_dir")]
    pub result_files_dir: PathBuf,
}

impl Default for FilesConfiguration {
    fn default() -> Self {
        Self {
            bind_host: default_host(),
            bind_port: default_files_port(),
            input_files_dir: default_input_files_dir(),
            result_files_dir: default_result_files_dir(),
        }
    }
}

/// State persistence configuration
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfiguration {
    /// SQLite database path; `:memory:` is accepted for tests
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,
}

impl Default for StorageConfiguration {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
        }
    }
}

/// Container engine configuration
#[derive(Debug, Clone, Deserialize)]
pub struct DockerConfiguration {
    /// Upper bound on concurrent engine API calls, across all nodes
    #[serde(default = "default_thread_limit")]
    pub thread_limit: usize,

    /// Per-call engine API timeout in seconds
    #[serde(default = "default_api_timeout")]
    pub api_timeout_seconds: u64,

    /// Overlay network joining containers across nodes
    #[serde(default)]
    pub net: Option<String>,

    /// Directory of per-machine TOML descriptors, merged with `nodes`
    #[serde(default)]
    pub machines_dir: Option<PathBuf>,

    /// Explicit node name to endpoint mapping
    #[serde(default)]
    pub nodes: HashMap<String, NodeConfiguration>,
}

/// A single engine node endpoint
#[derive(Debug, Clone, Deserialize)]
pub struct NodeConfiguration {
    pub base_url: String,

    #[serde(default)]
    pub tls: Option<TlsConfiguration>,
}

/// TLS bundle for one node
#[derive(Debug, Clone, Deserialize)]
pub struct TlsConfiguration {
    pub ca: PathBuf,
    pub cert: PathBuf,
    pub key: PathBuf,
}

/// Built-in container descriptions and policies
#[derive(Debug, Clone, Deserialize)]
pub struct DefaultsConfiguration {
    pub application_container_description: AppContainerDefaults,

    pub data_container_description: DataContainerDescription,

    pub inspection_container_description: InspectionContainerDescription,

    #[serde(default)]
    pub scheduling_strategies: SchedulingStrategies,

    #[serde(default)]
    pub error_handling: ErrorHandling,

    #[serde(default)]
    pub authorization: AuthorizationDefaults,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AppContainerDefaults {
    /// Entry point used when a task does not override it
    pub entry_point: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DataContainerDescription {
    pub image: String,

    pub entry_point: String,

    /// RAM limit in MB
    pub container_ram: u64,

    #[serde(default = "default_num_workers")]
    pub num_workers: u64,

    #[serde(default)]
    pub registry_auth: Option<RegistryAuthConfiguration>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct InspectionContainerDescription {
    pub image: String,

    pub entry_point: String,

    #[serde(default)]
    pub registry_auth: Option<RegistryAuthConfiguration>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RegistryAuthConfiguration {
    pub username: String,
    pub password: String,
}

/// Pluggable scheduling strategy selection
#[derive(Debug, Clone, Deserialize)]
pub struct SchedulingStrategies {
    #[serde(default = "default_allocation")]
    pub container_allocation: String,
}

impl Default for SchedulingStrategies {
    fn default() -> Self {
        Self {
            container_allocation: default_allocation(),
        }
    }
}

/// Retry and node invalidation policy
#[derive(Debug, Clone, Deserialize)]
pub struct ErrorHandling {
    #[serde(default = "default_max_task_trials")]
    pub max_task_trials: i64,

    #[serde(default)]
    pub dead_node_invalidation: bool,

    /// Connectors notified whenever a node is declared dead
    #[serde(default)]
    pub dead_node_notification: Vec<NotificationConnector>,
}

impl Default for ErrorHandling {
    fn default() -> Self {
        Self {
            max_task_trials: default_max_task_trials(),
            dead_node_invalidation: false,
            dead_node_notification: Vec::new(),
        }
    }
}

/// Login throttling and token lifetime
#[derive(Debug, Clone, Deserialize)]
pub struct AuthorizationDefaults {
    #[serde(default = "default_num_login_attempts")]
    pub num_login_attempts: usize,

    #[serde(default = "default_block_for_seconds")]
    pub block_for_seconds: i64,

    #[serde(default = "default_tokens_valid_for_seconds")]
    pub tokens_valid_for_seconds: i64,
}

impl Default for AuthorizationDefaults {
    fn default() -> Self {
        Self {
            num_login_attempts: default_num_login_attempts(),
            block_for_seconds: default_block_for_seconds(),
            tokens_valid_for_seconds: default_tokens_valid_for_seconds(),
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".into()
}

fn default_web_port() -> u16 {
    8000
}

fn default_master_port() -> u16 {
    8001
}

fn default_log_port() -> u16 {
    8002
}

fn default_files_port() -> u16 {
    8003
}

fn default_log_dir() -> PathBuf {
    PathBuf::from(".flotilla/logs")
}

fn default_input_files_dir() -> PathBuf {
    PathBuf::from(".flotilla/input_files")
}

fn default_result_files_dir() -> PathBuf {
    PathBuf::from(".flotilla/result_files")
}

fn default_db_path() -> PathBuf {
    PathBuf::from(".flotilla/flotilla.db")
}

fn default_thread_limit() -> usize {
    6
}

fn default_api_timeout() -> u64 {
    30
}

fn default_num_workers() -> u64 {
    4
}

fn default_allocation() -> String {
    "spread".into()
}

fn default_max_task_trials() -> i64 {
    3
}

fn default_num_login_attempts() -> usize {
    3
}

fn default_block_for_seconds() -> i64 {
    120
}

fn default_tokens_valid_for_seconds() -> i64 {
    86400
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
        [server_web]
        external_url = "http://localhost:8000"

        [server_master]
        external_url = "tcp://localhost:8001"

        [docker]
        [docker.nodes.node-1]
        base_url = "tcp://node-1:2376"

        [defaults.application_container_description]
        entry_point = "python3 /worker.py"

        [defaults.data_container_description]
        image = "example/data-container"
        entry_point = "python3 /server.py"
        container_ram = 256

        [defaults.inspection_container_description]
        image = "example/data-container"
        entry_point = "python3 /inspect.py"
    "#;

    #[test]
    fn test_minimal_config_with_defaults() {
        let config: Configuration = toml::from_str(MINIMAL).unwrap();
        assert_eq!(config.server_web.bind_port, 8000);
        assert_eq!(config.docker.thread_limit, 6);
        assert_eq!(config.docker.api_timeout_seconds, 30);
        assert_eq!(config.defaults.error_handling.max_task_trials, 3);
        assert_eq!(config.defaults.scheduling_strategies.container_allocation, "spread");
        assert_eq!(config.defaults.authorization.num_login_attempts, 3);
        assert!(config.docker.nodes.contains_key("node-1"));
        assert!(!config.defaults.error_handling.dead_node_invalidation);
    }

    #[test]
    fn test_node_tls_bundle() {
        let toml_str = format!(
            "{}\n[docker.nodes.node-2]\nbase_url = \"https://node-2:2376\"\n\
             [docker.nodes.node-2.tls]\nca = \"ca.pem\"\ncert = \"cert.pem\"\nkey = \"key.pem\"\n",
            MINIMAL
        );
        let config: Configuration = toml::from_str(&toml_str).unwrap();
        let node = &config.docker.nodes["node-2"];
        assert!(node.tls.is_some());
    }
}
