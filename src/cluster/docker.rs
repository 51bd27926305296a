//! Docker implementation of the container engine trait

use async_trait::async_trait;
use bollard::auth::DockerCredentials;
use bollard::container::{
    Config, CreateContainerOptions, ListContainersOptions, LogsOptions, RemoveContainerOptions,
    WaitContainerOptions,
};
use bollard::image::CreateImageOptions;
use bollard::models::HostConfig;
use bollard::network::ConnectNetworkOptions;
use bollard::Docker;
use futures_util::stream::StreamExt;
use tracing::debug;

use crate::config::NodeConfiguration;
use crate::types::RegistryAuth;

use super::engine::{
    ContainerEngine, ContainerSpec, EngineContainer, EngineError, EngineResult, NodeInfo,
};

pub struct DockerEngine {
    client: Docker,
}

impl DockerEngine {
    /// Connect to a node endpoint with its TLS bundle, if any.
    pub fn connect(node: &NodeConfiguration, api_timeout_seconds: u64) -> EngineResult<Self> {
        let client = match &node.tls {
            Some(tls) => Docker::connect_with_ssl(
                &node.base_url,
                &tls.key,
                &tls.cert,
                &tls.ca,
                api_timeout_seconds,
                bollard::API_DEFAULT_VERSION,
            )?,
            None => Docker::connect_with_http(
                &node.base_url,
                api_timeout_seconds,
                bollard::API_DEFAULT_VERSION,
            )?,
        };

        Ok(Self { client })
    }
}

fn not_found(e: &bollard::errors::Error) -> bool {
    matches!(
        e,
        bollard::errors::Error::DockerResponseServerError {
            status_code: 404,
            ..
        }
    )
}

#[async_trait]
impl ContainerEngine for DockerEngine {
    async fn node_info(&self) -> EngineResult<NodeInfo> {
        let info = self.client.info().await?;
        Ok(NodeInfo {
            total_ram: info.mem_total.unwrap_or(0) as u64 / (1024 * 1024),
            total_cpus: info.ncpu.unwrap_or(0) as u64,
        })
    }

    async fn pull_image(&self, image: &str, auth: Option<&RegistryAuth>) -> EngineResult<()> {
        let options = Some(CreateImageOptions {
            from_image: image,
            ..Default::default()
        });

        let credentials = auth.map(|auth| DockerCredentials {
            username: Some(auth.username.clone()),
            password: Some(auth.password.clone()),
            ..Default::default()
        });

        let mut stream = self.client.create_image(options, None, credentials);

        while let Some(result) = stream.next().await {
            let info = result?;
            if let Some(error) = info.error {
                return Err(EngineError::ImagePull(error));
            }
            if let Some(status) = info.status {
                if status.to_lowercase().contains("error") {
                    return Err(EngineError::ImagePull(status));
                }
                debug!("Pull: {}", status);
            }
        }

        Ok(())
    }

    async fn create_container(&self, spec: &ContainerSpec) -> EngineResult<()> {
        let mem_bytes = spec.mem_limit_mb as i64 * 1024 * 1024;
        let memswap_bytes = spec.memswap_limit_mb as i64 * 1024 * 1024;

        let host_config = HostConfig {
            memory: Some(mem_bytes),
            memory_swap: Some(memswap_bytes),
            security_opt: spec.security_opt.clone(),
            ..Default::default()
        };

        let config = Config {
            image: Some(spec.image.clone()),
            cmd: Some(spec.command.clone()),
            host_config: Some(host_config),
            ..Default::default()
        };

        let options = Some(CreateContainerOptions {
            name: spec.name.clone(),
            platform: None,
        });

        self.client.create_container(options, config).await?;
        Ok(())
    }

    async fn start_container(&self, name: &str) -> EngineResult<()> {
        match self.client.start_container::<String>(name, None).await {
            Ok(()) => Ok(()),
            // 304: already running
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 304, ..
            }) => Ok(()),
            Err(e) if not_found(&e) => Err(EngineError::ContainerNotFound(name.to_string())),
            Err(e) => Err(EngineError::Docker(e)),
        }
    }

    async fn wait_container(&self, name: &str) -> EngineResult<i64> {
        let mut stream = self
            .client
            .wait_container(name, None::<WaitContainerOptions<String>>);

        match stream.next().await {
            Some(Ok(response)) => Ok(response.status_code),
            // A non-zero exit surfaces as a dedicated error variant
            Some(Err(bollard::errors::Error::DockerContainerWaitError { code, .. })) => Ok(code),
            Some(Err(e)) => Err(EngineError::Docker(e)),
            None => Err(EngineError::Other(format!(
                "wait for container {} yielded no result",
                name
            ))),
        }
    }

    async fn container_logs(&self, name: &str) -> EngineResult<String> {
        let options = Some(LogsOptions::<String> {
            stdout: true,
            stderr: true,
            tail: "all".to_string(),
            ..Default::default()
        });

        let mut stream = self.client.logs(name, options);
        let mut logs = String::new();

        while let Some(result) = stream.next().await {
            let output = result?;
            logs.push_str(&String::from_utf8_lossy(&output.into_bytes()));
        }

        Ok(logs)
    }

    async fn remove_container(&self, name: &str) -> EngineResult<()> {
        // Kill errors are expected for containers that never started
        if let Err(e) = self
            .client
            .kill_container::<String>(name, None)
            .await
        {
            debug!("Kill {}: {}", name, e);
        }

        let options = Some(RemoveContainerOptions {
            force: true,
            v: true,
            ..Default::default()
        });

        match self.client.remove_container(name, options).await {
            Ok(()) => Ok(()),
            Err(e) if not_found(&e) => Ok(()),
            Err(e) => Err(EngineError::Docker(e)),
        }
    }

    async fn container_ip(&self, name: &str) -> EngineResult<String> {
        let inspect = self.client.inspect_container(name, None).await.map_err(|e| {
            if not_found(&e) {
                EngineError::ContainerNotFound(name.to_string())
            } else {
                EngineError::Docker(e)
            }
        })?;

        let networks = inspect
            .network_settings
            .and_then(|settings| settings.networks)
            .unwrap_or_default();

        networks
            .get("bridge")
            .or_else(|| networks.values().next())
            .and_then(|endpoint| endpoint.ip_address.clone())
            .filter(|ip| !ip.is_empty())
            .ok_or_else(|| EngineError::Other(format!("no ip address for container {}", name)))
    }

    async fn connect_to_network(&self, name: &str, network: &str) -> EngineResult<()> {
        self.client
            .connect_network(
                network,
                ConnectNetworkOptions {
                    container: name,
                    ..Default::default()
                },
            )
            .await?;
        Ok(())
    }

    async fn list_containers(&self) -> EngineResult<Vec<EngineContainer>> {
        let options = Some(ListContainersOptions::<String> {
            all: true,
            ..Default::default()
        });

        let containers = self.client.list_containers(options).await?;

        let mut result = Vec::new();
        for container in containers {
            let name = container
                .names
                .and_then(|names| names.first().cloned())
                .unwrap_or_default()
                .trim_start_matches('/')
                .to_string();

            let status = container.status.unwrap_or_default();
            let exited = container
                .state
                .as_deref()
                .map(|state| state.eq_ignore_ascii_case("exited"))
                .unwrap_or(false);
            let exit_status = if exited { parse_exit_code(&status) } else { None };

            result.push(EngineContainer {
                name,
                exit_status,
                description: Some(status),
            });
        }

        Ok(result)
    }
}

/// Extract the exit code from an engine status line like "Exited (137) 2 minutes ago".
fn parse_exit_code(status: &str) -> Option<i64> {
    let open = status.find('(')?;
    let close = status[open..].find(')')? + open;
    status[open + 1..close].parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_exit_code() {
        assert_eq!(parse_exit_code("Exited (0) 5 seconds ago"), Some(0));
        assert_eq!(parse_exit_code("Exited (137) 2 minutes ago"), Some(137));
        assert_eq!(parse_exit_code("Up 2 minutes"), None);
        assert_eq!(parse_exit_code("Exited"), None);
    }
}
