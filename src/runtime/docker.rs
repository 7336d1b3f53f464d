//! Docker adapter for the container runtime boundary.

use std::collections::HashMap;

use async_trait::async_trait;
use bollard::Docker;
use bollard::container::{
    Config, CreateContainerOptions, InspectContainerOptions, RemoveContainerOptions,
    StopContainerOptions,
};
use bollard::models::{HostConfig, PortBinding, PortMap, RestartPolicy, RestartPolicyNameEnum};

use super::error::{Result, RuntimeError};
use super::{ContainerInspection, ContainerRuntime, ContainerSpec, CreatedContainer};

/// Grace period before Docker kills a stopping container.
const STOP_TIMEOUT_SECS: i64 = 10;

/// Connect to the local Docker daemon and make sure it answers.
pub async fn connect_docker() -> Result<Docker> {
    let docker = Docker::connect_with_local_defaults().map_err(|e| RuntimeError::Unavailable {
        reason: e.to_string(),
    })?;
    docker
        .ping()
        .await
        .map_err(|e| RuntimeError::Unavailable {
            reason: format!("ping failed: {}", e),
        })?;
    Ok(docker)
}

/// [`ContainerRuntime`] backed by the local Docker daemon.
#[derive(Clone)]
pub struct DockerRuntime {
    docker: Docker,
}

impl DockerRuntime {
    /// Wrap an already connected client; see [`connect_docker`].
    pub fn with_client(docker: Docker) -> Self {
        Self { docker }
    }
}

fn port_key(port: u16) -> String {
    format!("{}/tcp", port)
}

/// Host port Docker bound to `internal_port`, if any.
fn host_port(ports: &PortMap, internal_port: u16) -> Option<u16> {
    ports
        .get(&port_key(internal_port))?
        .as_ref()?
        .iter()
        .find_map(|binding| binding.host_port.as_deref()?.parse().ok())
}

fn container_config(spec: &ContainerSpec) -> Config<String> {
    let key = port_key(spec.internal_port);

    let mut port_bindings: PortMap = HashMap::new();
    port_bindings.insert(
        key.clone(),
        Some(vec![PortBinding {
            host_ip: None,
            // "0" lets Docker pick an ephemeral port.
            host_port: Some("0".to_string()),
        }]),
    );

    let host_config = HostConfig {
        port_bindings: Some(port_bindings),
        memory: Some(spec.limits.memory_bytes),
        cpu_shares: Some(spec.limits.cpu_shares),
        pids_limit: Some(spec.limits.pids_limit),
        restart_policy: Some(RestartPolicy {
            name: Some(RestartPolicyNameEnum::ON_FAILURE),
            maximum_retry_count: Some(spec.limits.restart_max_retries),
        }),
        extra_hosts: Some(vec!["host.docker.internal:host-gateway".to_string()]),
        ..Default::default()
    };

    Config {
        image: Some(spec.image.clone()),
        env: Some(spec.env.clone()),
        exposed_ports: Some([(key, HashMap::new())].into_iter().collect()),
        host_config: Some(host_config),
        attach_stdout: Some(true),
        attach_stderr: Some(true),
        tty: Some(true),
        ..Default::default()
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn create(&self, spec: &ContainerSpec) -> Result<CreatedContainer> {
        let options = CreateContainerOptions {
            name: spec.name.clone(),
            ..Default::default()
        };
        let response = self
            .docker
            .create_container(Some(options), container_config(spec))
            .await
            .map_err(|e| RuntimeError::from_docker(&spec.name, e))?;

        for warning in &response.warnings {
            tracing::warn!(container = %spec.name, "Docker create warning: {}", warning);
        }

        Ok(CreatedContainer {
            id: response.id,
            assigned_port: None,
        })
    }

    async fn start(&self, id: &str) -> Result<()> {
        self.docker
            .start_container::<String>(id, None)
            .await
            .map_err(|e| RuntimeError::from_docker(id, e))
    }

    async fn stop(&self, id: &str) -> Result<()> {
        self.docker
            .stop_container(id, Some(StopContainerOptions { t: STOP_TIMEOUT_SECS }))
            .await
            .map_err(|e| RuntimeError::from_docker(id, e))
    }

    async fn remove(&self, id: &str) -> Result<()> {
        self.docker
            .remove_container(
                id,
                Some(RemoveContainerOptions {
                    force: true,
                    ..Default::default()
                }),
            )
            .await
            .map_err(|e| RuntimeError::from_docker(id, e))
    }

    async fn inspect(&self, id: &str) -> Result<ContainerInspection> {
        let info = self
            .docker
            .inspect_container(id, None::<InspectContainerOptions>)
            .await
            .map_err(|e| RuntimeError::from_docker(id, e))?;

        let running = info
            .state
            .as_ref()
            .and_then(|state| state.running)
            .unwrap_or(false);

        // Every container we create publishes exactly one TCP port, so take
        // the first bound host port.
        let assigned_port = info
            .network_settings
            .as_ref()
            .and_then(|settings| settings.ports.as_ref())
            .and_then(|ports| {
                ports
                    .keys()
                    .filter_map(|key| key.strip_suffix("/tcp")?.parse::<u16>().ok())
                    .find_map(|internal| host_port(ports, internal))
            });

        Ok(ContainerInspection {
            running,
            assigned_port,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::ResourceLimits;

    fn spec() -> ContainerSpec {
        ContainerSpec {
            image: "runner-prod".to_string(),
            name: "brave-otter-k3x9q".to_string(),
            env: vec![
                "SOCKET_PATH=brave-otter-k3x9q".to_string(),
                "ORIGINS=https://a.example".to_string(),
            ],
            internal_port: 5000,
            limits: ResourceLimits::default(),
        }
    }

    #[test]
    fn test_container_config_publishes_workload_port() {
        let config = container_config(&spec());
        let exposed = config.exposed_ports.unwrap();
        assert!(exposed.contains_key("5000/tcp"));

        let host = config.host_config.unwrap();
        let bindings = host.port_bindings.unwrap();
        let binding = bindings["5000/tcp"].as_ref().unwrap();
        assert_eq!(binding[0].host_port.as_deref(), Some("0"));
    }

    #[test]
    fn test_container_config_applies_limits_and_restart_cap() {
        let host = container_config(&spec()).host_config.unwrap();
        assert_eq!(host.memory, Some(1024 * 1024 * 1024));
        assert_eq!(host.cpu_shares, Some(512));
        assert_eq!(host.pids_limit, Some(256));
        let policy = host.restart_policy.unwrap();
        assert_eq!(policy.name, Some(RestartPolicyNameEnum::ON_FAILURE));
        assert_eq!(policy.maximum_retry_count, Some(3));
    }

    #[test]
    fn test_container_config_passes_env() {
        let config = container_config(&spec());
        let env = config.env.unwrap();
        assert!(env.contains(&"SOCKET_PATH=brave-otter-k3x9q".to_string()));
        assert_eq!(config.image.as_deref(), Some("runner-prod"));
    }

    #[test]
    fn test_host_port_parses_first_binding() {
        let mut ports: PortMap = HashMap::new();
        ports.insert(
            "5000/tcp".to_string(),
            Some(vec![
                PortBinding {
                    host_ip: Some("0.0.0.0".to_string()),
                    host_port: Some("49153".to_string()),
                },
                PortBinding {
                    host_ip: Some("::".to_string()),
                    host_port: Some("49153".to_string()),
                },
            ]),
        );
        assert_eq!(host_port(&ports, 5000), Some(49153));
        assert_eq!(host_port(&ports, 8080), None);
    }

    #[test]
    fn test_host_port_handles_unbound() {
        let mut ports: PortMap = HashMap::new();
        ports.insert("5000/tcp".to_string(), None);
        assert_eq!(host_port(&ports, 5000), None);
    }
}
