//! Network, host and mount resolution from the parent container
//!
//! The orchestrator runs inside a long-lived parent container. Node containers
//! inherit its custom network, its extra hosts, the folders mounted under
//! [`NODE_MOUNT_POINT`] and its proxy settings. Each value is resolved at most
//! once per [`ParentResolver`] and never refreshed afterwards, even if the
//! parent is reconfigured.

use std::sync::Arc;

use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

use crate::models::{HttpProxyEnvironment, MountBinding, NetworkResolution};
use crate::runtime::{AttachedNetwork, ContainerDetail, ContainerMount, ContainerRuntime};

use super::error::OrchestratorError;

/// Network mode used when the parent only sits on the default bridge
pub const DEFAULT_NETWORK_MODE: &str = "default";

/// Name of Docker's default bridge network
pub const DEFAULT_NETWORK_NAME: &str = "bridge";

/// Network mode sharing the host's network stack
pub const HOST_NETWORK_MODE: &str = "host";

// Lets nodes reach a macOS host, which Docker Desktop does not expose by name.
const MAC_HOST_NAME: &str = "mac.host.local";
const MAC_HOST_IP: &str = "192.168.65.1";

// The daemon's host name resolves here when nodes share the host network.
const HOST_MODE_LOOPBACK_IP: &str = "127.0.1.0";

/// Parent mounts below this path are propagated to every node
pub const NODE_MOUNT_POINT: &str = "/tmp/node";

/// Destinations a propagated mount may never override
pub const PROTECTED_MOUNT_POINTS: [&str; 3] =
    ["/var/run/docker.sock", "/home/seluser/videos", "/dev/shm"];

const PROXY_ENV_PREFIX: &str = "dockgrid_";
const PROXY_ENV_VARS: [&str; 3] = ["http_proxy", "https_proxy", "no_proxy"];

/// Pick the node network mode from the parent's attached networks
pub fn resolve_network_mode(networks: &[AttachedNetwork]) -> String {
    networks
        .iter()
        .find(|network| !network.name.eq_ignore_ascii_case(DEFAULT_NETWORK_NAME))
        .map(|network| network.name.clone())
        .unwrap_or_else(|| DEFAULT_NETWORK_MODE.to_string())
}

/// Build the extra hosts for node containers.
///
/// The macOS host entry always comes first, then the daemon host entry for
/// host networking, then the parent's own entries.
pub fn mirror_extra_hosts(
    network_mode: &str,
    daemon_host_name: Option<&str>,
    parent_extra_hosts: &[String],
) -> Vec<String> {
    let mut extra_hosts = vec![format!("{}:{}", MAC_HOST_NAME, MAC_HOST_IP)];

    if network_mode.eq_ignore_ascii_case(HOST_NETWORK_MODE) {
        if let Some(host_name) = daemon_host_name.filter(|name| !name.is_empty()) {
            extra_hosts.push(format!("{}:{}", host_name, HOST_MODE_LOOPBACK_IP));
        }
    }

    extra_hosts.extend(parent_extra_hosts.iter().cloned());
    extra_hosts
}

/// Retarget the parent's node mounts onto node containers.
///
/// Only mounts at or below [`NODE_MOUNT_POINT`] are kept, with that prefix
/// stripped from the destination. Any protected or empty destination fails
/// the whole resolution.
pub fn resolve_mount_bindings(
    mounts: &[ContainerMount],
) -> Result<Vec<MountBinding>, OrchestratorError> {
    let mut bindings = Vec::new();

    for mount in mounts {
        let Some(destination) = strip_node_mount_point(&mount.destination) else {
            continue;
        };

        if destination.is_empty() {
            return Err(OrchestratorError::Configuration(format!(
                "{} itself may not be mounted via node mounting",
                NODE_MOUNT_POINT
            )));
        }

        if PROTECTED_MOUNT_POINTS
            .iter()
            .any(|protected| protected.eq_ignore_ascii_case(destination))
        {
            return Err(OrchestratorError::Configuration(format!(
                "The following points may not be mounted via node mounting: {}",
                PROTECTED_MOUNT_POINTS.join(",")
            )));
        }

        bindings.push(MountBinding {
            host_source: mount.source.clone(),
            container_destination: destination.to_string(),
        });
    }

    Ok(bindings)
}

fn strip_node_mount_point(destination: &str) -> Option<&str> {
    let rest = destination.strip_prefix(NODE_MOUNT_POINT)?;
    if rest.is_empty() || rest.starts_with('/') {
        Some(rest)
    } else {
        None
    }
}

/// Collect the parent's proxy variables with the internal prefix stripped
pub fn resolve_proxy_environment(env: &[String]) -> HttpProxyEnvironment {
    let mut proxy_env = HttpProxyEnvironment::default();

    for entry in env {
        let (key, value) = entry.split_once('=').unwrap_or((entry.as_str(), ""));
        let Some(name) = key.strip_prefix(PROXY_ENV_PREFIX) else {
            continue;
        };
        if PROXY_ENV_VARS.contains(&name) {
            proxy_env.insert(format!("{}={}", name, value));
        }
    }

    proxy_env
}

/// Find a container id by name, matching the daemon's `/`-prefixed first name
pub(crate) async fn lookup_container_id(
    runtime: &dyn ContainerRuntime,
    node_id: &str,
    container_name: &str,
) -> Option<String> {
    let search = if container_name.starts_with('/') {
        container_name.to_string()
    } else {
        format!("/{}", container_name)
    };

    let containers = match runtime.list_containers(true).await {
        Ok(containers) => containers,
        Err(e) => {
            debug!(node_id = %node_id, error = %e, "Error while getting container id");
            return None;
        }
    };

    containers
        .into_iter()
        .find(|container| {
            container
                .names
                .first()
                .is_some_and(|name| name.eq_ignore_ascii_case(&search))
        })
        .map(|container| container.id)
}

/// Memoized view of the parent container
pub struct ParentResolver {
    runtime: Arc<dyn ContainerRuntime>,
    node_id: String,
    network: OnceCell<NetworkResolution>,
    mounts: OnceCell<Result<Vec<MountBinding>, OrchestratorError>>,
    proxy_env: OnceCell<HttpProxyEnvironment>,
}

impl ParentResolver {
    pub fn new(runtime: Arc<dyn ContainerRuntime>, node_id: impl Into<String>) -> Self {
        Self {
            runtime,
            node_id: node_id.into(),
            network: OnceCell::new(),
            mounts: OnceCell::new(),
            proxy_env: OnceCell::new(),
        }
    }

    /// Network mode and extra hosts for node containers
    pub async fn network(&self, parent_name: &str) -> &NetworkResolution {
        self.network
            .get_or_init(|| async {
                let parent = self.inspect_parent(parent_name).await;
                let (networks, parent_hosts) = match &parent {
                    Some(detail) => (detail.networks.as_slice(), detail.extra_hosts.as_slice()),
                    None => (&[][..], &[][..]),
                };

                let mode = resolve_network_mode(networks);
                let daemon_host_name = if mode.eq_ignore_ascii_case(HOST_NETWORK_MODE) {
                    self.daemon_host_name().await
                } else {
                    None
                };
                let extra_hosts =
                    mirror_extra_hosts(&mode, daemon_host_name.as_deref(), parent_hosts);

                info!(
                    node_id = %self.node_id,
                    network_mode = %mode,
                    extra_hosts = ?extra_hosts,
                    "Node network resolved"
                );

                NetworkResolution { mode, extra_hosts }
            })
            .await
    }

    /// Retargeted node mounts, or the configuration error that forbids them
    pub async fn mount_bindings(
        &self,
        parent_name: &str,
    ) -> Result<&[MountBinding], OrchestratorError> {
        let resolved = self
            .mounts
            .get_or_init(|| async {
                let mounts = self
                    .inspect_parent(parent_name)
                    .await
                    .map(|detail| detail.mounts)
                    .unwrap_or_default();

                let resolved = resolve_mount_bindings(&mounts);
                match &resolved {
                    Ok(bindings) => debug!(
                        node_id = %self.node_id,
                        count = bindings.len(),
                        "Node mounts resolved"
                    ),
                    Err(e) => warn!(node_id = %self.node_id, error = %e, "Node mounts rejected"),
                }
                resolved
            })
            .await;

        match resolved {
            Ok(bindings) => Ok(bindings.as_slice()),
            Err(e) => Err(e.clone()),
        }
    }

    /// Proxy variables forwarded to node containers
    pub async fn proxy_environment(&self, parent_name: &str) -> &HttpProxyEnvironment {
        self.proxy_env
            .get_or_init(|| async {
                let env = self
                    .inspect_parent(parent_name)
                    .await
                    .map(|detail| detail.env)
                    .unwrap_or_default();
                resolve_proxy_environment(&env)
            })
            .await
    }

    async fn inspect_parent(&self, parent_name: &str) -> Option<ContainerDetail> {
        let Some(parent_id) =
            lookup_container_id(self.runtime.as_ref(), &self.node_id, parent_name).await
        else {
            warn!(
                node_id = %self.node_id,
                parent = %parent_name,
                "Parent container not found, using defaults"
            );
            return None;
        };

        match self.runtime.inspect(&parent_id).await {
            Ok(detail) => Some(detail),
            Err(e) => {
                warn!(
                    node_id = %self.node_id,
                    parent = %parent_name,
                    error = %e,
                    "Error while inspecting parent container, using defaults"
                );
                None
            }
        }
    }

    async fn daemon_host_name(&self) -> Option<String> {
        match self.runtime.info().await {
            Ok(info) => Some(info.name),
            Err(e) => {
                debug!(node_id = %self.node_id, error = %e, "Error while getting host name");
                None
            }
        }
    }
}
