//! Docker implementation of the runtime gateway

use std::collections::HashMap;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, DownloadFromContainerOptions, InspectContainerOptions,
    ListContainersOptions, RemoveContainerOptions, StartContainerOptions, StopContainerOptions,
};
use bollard::errors::Error as DockerError;
use bollard::exec::{CreateExecOptions, StartExecOptions, StartExecResults};
use bollard::image::ListImagesOptions;
use bollard::models::{
    ContainerInspectResponse, ContainerSummary as DockerContainerSummary, HostConfig,
    ImageSummary as DockerImageSummary, PortBinding as DockerPortBinding,
};
use bollard::{Docker, API_DEFAULT_VERSION};
use futures::StreamExt;
use tracing::{debug, info};

use crate::config::DockerConfig;

use super::{
    ArchiveStream, AttachedNetwork, ContainerDetail, ContainerMount, ContainerRuntime,
    ContainerSpec, ContainerSummary, ImageSummary, RuntimeError, RuntimeInfo,
};

/// Tag Docker reports for dangling images
const UNTAGGED_IMAGE: &str = "<none>:<none>";

/// Runtime gateway backed by the local Docker daemon
#[derive(Clone)]
pub struct DockerRuntime {
    docker: Docker,
}

impl DockerRuntime {
    /// Connect to the daemon using the configured socket, or the local defaults
    pub fn connect(config: &DockerConfig) -> Result<Self> {
        let docker = match config.socket.as_deref() {
            Some(socket) => Docker::connect_with_unix(socket, config.timeout_secs, API_DEFAULT_VERSION)
                .with_context(|| format!("Failed to connect to Docker socket {}", socket))?,
            None => Docker::connect_with_local_defaults()
                .context("Failed to connect to local Docker daemon")?
                .with_timeout(Duration::from_secs(config.timeout_secs)),
        };

        info!(socket = ?config.socket, timeout_secs = config.timeout_secs, "Docker runtime connected");

        Ok(Self { docker })
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn list_containers(
        &self,
        include_stopped: bool,
    ) -> Result<Vec<ContainerSummary>, RuntimeError> {
        let options = ListContainersOptions::<String> {
            all: include_stopped,
            ..Default::default()
        };

        let containers = self.docker.list_containers(Some(options)).await?;
        Ok(containers.into_iter().map(summary_from_docker).collect())
    }

    async fn inspect(&self, id: &str) -> Result<ContainerDetail, RuntimeError> {
        let response = self
            .docker
            .inspect_container(id, None::<InspectContainerOptions>)
            .await?;
        Ok(detail_from_docker(response))
    }

    async fn create(&self, spec: ContainerSpec) -> Result<String, RuntimeError> {
        let options = CreateContainerOptions {
            name: spec.name.clone(),
            platform: None,
        };

        let response = self
            .docker
            .create_container(Some(options), config_from_spec(spec))
            .await?;

        for warning in &response.warnings {
            debug!(container_id = %response.id, warning = %warning, "Container created with warning");
        }

        Ok(response.id)
    }

    async fn start(&self, id: &str) -> Result<(), RuntimeError> {
        self.docker
            .start_container(id, None::<StartContainerOptions<String>>)
            .await?;
        Ok(())
    }

    async fn stop(&self, id: &str, grace_period: Duration) -> Result<(), RuntimeError> {
        let options = StopContainerOptions {
            t: grace_period.as_secs() as i64,
        };
        self.docker.stop_container(id, Some(options)).await?;
        Ok(())
    }

    async fn remove(&self, id: &str) -> Result<(), RuntimeError> {
        let options = RemoveContainerOptions {
            force: true,
            ..Default::default()
        };
        self.docker.remove_container(id, Some(options)).await?;
        Ok(())
    }

    async fn exec(
        &self,
        id: &str,
        command: &[String],
        wait_for_completion: bool,
    ) -> Result<Option<String>, RuntimeError> {
        let exec = self
            .docker
            .create_exec(
                id,
                CreateExecOptions::<String> {
                    cmd: Some(command.to_vec()),
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    ..Default::default()
                },
            )
            .await?;

        let options = StartExecOptions {
            detach: !wait_for_completion,
            ..Default::default()
        };

        match self.docker.start_exec(&exec.id, Some(options)).await? {
            StartExecResults::Attached { mut output, .. } => {
                let mut collected = String::new();
                while let Some(chunk) = output.next().await {
                    let chunk =
                        chunk.map_err(|e| RuntimeError::OutputInterrupted(e.to_string()))?;
                    collected.push_str(&chunk.to_string());
                }
                Ok(Some(collected))
            }
            StartExecResults::Detached => Ok(None),
        }
    }

    async fn archive(&self, id: &str, path: &str) -> Result<ArchiveStream, RuntimeError> {
        let options = DownloadFromContainerOptions {
            path: path.to_string(),
        };

        let stream = self
            .docker
            .download_from_container(id, Some(options))
            .map(|chunk| chunk.map(|bytes| bytes.to_vec()).map_err(RuntimeError::from));

        Ok(stream.boxed())
    }

    async fn list_images(&self, name: &str) -> Result<Vec<ImageSummary>, RuntimeError> {
        let mut filters = HashMap::new();
        filters.insert("reference".to_string(), vec![name.to_string()]);

        let options = ListImagesOptions::<String> {
            filters,
            ..Default::default()
        };

        let images = self.docker.list_images(Some(options)).await?;
        Ok(images.into_iter().map(image_from_docker).collect())
    }

    async fn info(&self) -> Result<RuntimeInfo, RuntimeError> {
        let info = self.docker.info().await?;
        Ok(RuntimeInfo {
            name: info.name.unwrap_or_default(),
        })
    }
}

impl From<DockerError> for RuntimeError {
    fn from(err: DockerError) -> Self {
        match err {
            DockerError::DockerResponseServerError {
                status_code: 404,
                message,
            } => RuntimeError::NotFound(message),
            DockerError::RequestTimeoutError => {
                RuntimeError::TimedOut("request to Docker daemon timed out".to_string())
            }
            other => RuntimeError::Unavailable(other.to_string()),
        }
    }
}

fn summary_from_docker(summary: DockerContainerSummary) -> ContainerSummary {
    ContainerSummary {
        id: summary.id.unwrap_or_default(),
        names: summary.names.unwrap_or_default(),
        image: summary.image.unwrap_or_default(),
        state: summary.state.unwrap_or_default(),
    }
}

fn detail_from_docker(response: ContainerInspectResponse) -> ContainerDetail {
    let env = response
        .config
        .and_then(|config| config.env)
        .unwrap_or_default();

    let mounts = response
        .mounts
        .unwrap_or_default()
        .into_iter()
        .map(|mount| ContainerMount {
            source: mount.source.unwrap_or_default(),
            destination: mount.destination.unwrap_or_default(),
        })
        .collect();

    let extra_hosts = response
        .host_config
        .and_then(|host_config| host_config.extra_hosts)
        .unwrap_or_default();

    let (ip_address, networks) = match response.network_settings {
        Some(settings) => {
            let mut networks: Vec<AttachedNetwork> = settings
                .networks
                .unwrap_or_default()
                .into_iter()
                .map(|(name, endpoint)| AttachedNetwork {
                    name,
                    ip_address: endpoint.ip_address.unwrap_or_default(),
                })
                .collect();
            networks.sort_by(|a, b| a.name.cmp(&b.name));
            (settings.ip_address.unwrap_or_default(), networks)
        }
        None => (String::new(), Vec::new()),
    };

    ContainerDetail {
        id: response.id.unwrap_or_default(),
        name: response.name.unwrap_or_default(),
        env,
        mounts,
        extra_hosts,
        ip_address,
        networks,
    }
}

fn image_from_docker(image: DockerImageSummary) -> ImageSummary {
    ImageSummary {
        id: image.id,
        repo_tags: image
            .repo_tags
            .into_iter()
            .filter(|tag| tag != UNTAGGED_IMAGE)
            .collect(),
        created: image.created,
    }
}

fn config_from_spec(spec: ContainerSpec) -> Config<String> {
    let exposed_ports: HashMap<String, HashMap<(), ()>> = spec
        .exposed_ports
        .into_iter()
        .map(|port| (port, HashMap::new()))
        .collect();

    let port_bindings = spec
        .port_bindings
        .into_iter()
        .map(|(port, binding)| {
            (
                port,
                Some(vec![DockerPortBinding {
                    host_ip: Some(binding.host_ip),
                    host_port: Some(binding.host_port),
                }]),
            )
        })
        .collect();

    let host_config = HostConfig {
        binds: Some(spec.binds),
        port_bindings: Some(port_bindings),
        network_mode: Some(spec.network_mode),
        extra_hosts: Some(spec.extra_hosts),
        auto_remove: Some(spec.auto_remove),
        privileged: Some(spec.privileged),
        ..Default::default()
    };

    Config {
        image: Some(spec.image),
        env: Some(spec.env),
        exposed_ports: Some(exposed_ports),
        host_config: Some(host_config),
        ..Default::default()
    }
}
