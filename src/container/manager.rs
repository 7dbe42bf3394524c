//! Node container lifecycle management

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};
use url::Url;

use crate::metrics;
use crate::models::{
    ContainerCreationStatus, ContainerRegistration, HttpProxyEnvironment, MountBinding,
    NetworkResolution,
};
use crate::runtime::{ArchiveStream, ContainerRuntime, ContainerSpec, PortBinding};

use super::error::OrchestratorError;
use super::resolver::{lookup_container_id, ParentResolver, HOST_NETWORK_MODE};

/// Gap between a node port and its live-preview port
pub const NO_VNC_PORT_GAP: u16 = 10000;

/// Grace period given to a node before it is killed on stop
pub const STOP_GRACE_PERIOD: Duration = Duration::from_secs(5);

/// Environment variable carrying the live-preview port
pub const NO_VNC_PORT_ENV: &str = "NOVNC_PORT";

const SHARED_MEMORY_BIND: &str = "/dev/shm:/dev/shm";

/// Build the deterministic node container name.
///
/// Other components find a node again by recomputing this name, so it must
/// stay a pure function of its inputs.
pub fn container_name(parent_name: &str, node_port: &str) -> String {
    format!("{}_{}", parent_name, node_port)
}

/// Creates, inspects and tears down single-session node containers
pub struct ContainerManager {
    /// Runtime gateway
    runtime: Arc<dyn ContainerRuntime>,

    /// Identifies this orchestrator in logs
    node_id: String,

    /// Memoized parent container view
    resolver: ParentResolver,
}

impl ContainerManager {
    /// Create a new container manager
    pub fn new(runtime: Arc<dyn ContainerRuntime>, node_id: impl Into<String>) -> Self {
        let node_id = node_id.into();
        Self {
            resolver: ParentResolver::new(runtime.clone(), node_id.clone()),
            runtime,
            node_id,
        }
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Create and start a node container for one test session.
    ///
    /// `env_vars` may be updated in place with network-mode overrides and the
    /// live-preview port. Runtime failures yield a failed status; only a
    /// configuration error is returned as `Err`.
    pub async fn create_container(
        &self,
        parent_name: &str,
        image: &str,
        env_vars: &mut HashMap<String, String>,
        node_port: &str,
    ) -> Result<ContainerCreationStatus, OrchestratorError> {
        let name = container_name(parent_name, node_port);

        let Ok(primary_port) = node_port.parse::<u16>() else {
            warn!(node_id = %self.node_id, node_port = %node_port, "Invalid node port");
            metrics::record_container_failed(image);
            return Ok(ContainerCreationStatus::failed(name));
        };

        let requested_no_vnc_port = env_vars
            .get(NO_VNC_PORT_ENV)
            .and_then(|p| p.parse::<u16>().ok());

        let Some(no_vnc_port) =
            requested_no_vnc_port.or_else(|| primary_port.checked_add(NO_VNC_PORT_GAP))
        else {
            warn!(
                node_id = %self.node_id,
                node_port = primary_port,
                "Node port leaves no room for the live-preview port"
            );
            metrics::record_container_failed(image);
            return Ok(ContainerCreationStatus::failed(name));
        };

        let mounts = match self.resolver.mount_bindings(parent_name).await {
            Ok(mounts) => mounts,
            Err(e) => {
                metrics::record_container_failed(image);
                return Err(e);
            }
        };
        let mut binds: Vec<String> = mounts.iter().map(MountBinding::to_string).collect();
        binds.push(SHARED_MEMORY_BIND.to_string());

        if requested_no_vnc_port.is_none() {
            env_vars.insert(NO_VNC_PORT_ENV.to_string(), no_vnc_port.to_string());
        }

        let network = self.resolver.network(parent_name).await;

        // Host networking collapses port isolation, so nodes pick random ports
        if network.mode.eq_ignore_ascii_case(HOST_NETWORK_MODE) {
            env_vars.insert("SELENIUM_HUB_HOST".to_string(), "localhost".to_string());
            env_vars.insert("SELENIUM_NODE_HOST".to_string(), "localhost".to_string());
            env_vars.insert("PICK_ALL_RANDOM_PORTS".to_string(), "true".to_string());
        }

        let proxy_env = self.resolver.proxy_environment(parent_name).await;
        let env = flatten_env(env_vars, proxy_env);

        let ports = [primary_port.to_string(), no_vnc_port.to_string()];
        let port_bindings: BTreeMap<String, PortBinding> = ports
            .iter()
            .map(|port| {
                (
                    format!("{}/tcp", port),
                    PortBinding {
                        host_ip: String::new(),
                        host_port: port.clone(),
                    },
                )
            })
            .collect();

        let spec = ContainerSpec {
            name: name.clone(),
            image: image.to_string(),
            env,
            exposed_ports: port_bindings.keys().cloned().collect(),
            binds,
            port_bindings,
            network_mode: network.mode.clone(),
            extra_hosts: network.extra_hosts.clone(),
            auto_remove: true,
            privileged: true,
        };

        debug!(node_id = %self.node_id, spec = ?spec, "Creating node container");

        let container_id = match self.runtime.create(spec).await {
            Ok(id) => id,
            Err(e) => {
                warn!(
                    node_id = %self.node_id,
                    container_name = %name,
                    error = %e,
                    "Error while creating a new container"
                );
                metrics::record_container_failed(image);
                return Ok(ContainerCreationStatus::failed(name));
            }
        };

        if let Err(e) = self.runtime.start(&container_id).await {
            warn!(
                node_id = %self.node_id,
                container_name = %name,
                error = %e,
                "Error while starting a new container"
            );
            if let Err(e) = self.runtime.remove(&container_id).await {
                debug!(node_id = %self.node_id, error = %e, "Error while removing unstarted container");
            }
            metrics::record_container_failed(image);
            return Ok(ContainerCreationStatus::failed(name));
        }

        info!(
            node_id = %self.node_id,
            container_id = %container_id,
            container_name = %name,
            no_vnc_port = no_vnc_port,
            "Node container started"
        );
        metrics::record_container_created(image);

        Ok(ContainerCreationStatus::created(name, node_port))
    }

    /// Stop a node container; it removes itself once stopped
    pub async fn stop_container(&self, container_id: &str) {
        match self.runtime.stop(container_id, STOP_GRACE_PERIOD).await {
            Ok(()) => {
                debug!(node_id = %self.node_id, container_id = %container_id, "Container stopped");
                metrics::record_container_stopped();
            }
            Err(e) => warn!(
                node_id = %self.node_id,
                container_id = %container_id,
                error = %e,
                "Error while stopping the container"
            ),
        }
    }

    /// Run a command in a node container.
    ///
    /// Returns the output only when waited for and fully drained.
    pub async fn execute_command(
        &self,
        container_id: &str,
        command: &[String],
        wait_for_completion: bool,
    ) -> Option<String> {
        info!(node_id = %self.node_id, command = ?command, "Executing command");

        match self.runtime.exec(container_id, command, wait_for_completion).await {
            Ok(output) => {
                if let Some(output) = &output {
                    debug!(node_id = %self.node_id, output = %output, "Command output");
                }
                output
            }
            Err(crate::runtime::RuntimeError::OutputInterrupted(e)) => {
                debug!(node_id = %self.node_id, error = %e, "Error while reading the command output");
                None
            }
            Err(e) => {
                debug!(node_id = %self.node_id, error = %e, "Error while executing the command");
                None
            }
        }
    }

    /// Copy a folder out of a node container as a tar stream
    pub async fn copy_files(&self, container_id: &str, folder: &str) -> Option<ArchiveStream> {
        match self.runtime.archive(container_id, folder).await {
            Ok(stream) => Some(stream),
            Err(e) => {
                warn!(
                    node_id = %self.node_id,
                    container_id = %container_id,
                    folder = %folder,
                    error = %e,
                    "Error while copying folder"
                );
                None
            }
        }
    }

    /// Resolve a node that registered from `remote_host`
    ///
    /// A node without a usable port resolves to no container.
    pub async fn register_node(&self, parent_name: &str, remote_host: &Url) -> ContainerRegistration {
        let Some(node_port) = remote_host.port_or_known_default() else {
            warn!(node_id = %self.node_id, remote_host = %remote_host, "Registered node has no port");
            return ContainerRegistration::default();
        };

        if remote_host.port().is_none() {
            warn!(
                node_id = %self.node_id,
                remote_host = %remote_host,
                node_port = node_port,
                "Registered node has no explicit port, assuming the scheme default"
            );
        }

        let Some(secondary_port) = node_port.checked_add(NO_VNC_PORT_GAP) else {
            warn!(
                node_id = %self.node_id,
                node_port = node_port,
                "Node port leaves no room for the live-preview port"
            );
            return ContainerRegistration::default();
        };

        let name = container_name(parent_name, &node_port.to_string());

        ContainerRegistration {
            container_id: self.container_id(&name).await,
            secondary_port: Some(secondary_port),
        }
    }

    /// Find a container id by its name
    pub async fn container_id(&self, container_name: &str) -> Option<String> {
        lookup_container_id(self.runtime.as_ref(), &self.node_id, container_name).await
    }

    /// IP address of a container, preferring the default network
    pub async fn get_container_ip(&self, container_name: &str) -> Option<String> {
        let container_id = self.container_id(container_name).await?;

        let detail = match self.runtime.inspect(&container_id).await {
            Ok(detail) => detail,
            Err(e) => {
                debug!(node_id = %self.node_id, error = %e, "Error while getting the container IP");
                return None;
            }
        };

        if !detail.ip_address.trim().is_empty() {
            return Some(detail.ip_address);
        }

        detail
            .networks
            .into_iter()
            .map(|network| network.ip_address)
            .find(|ip| !ip.trim().is_empty())
    }

    /// Newest tagged local image for `image_name`, or the name itself
    pub async fn latest_downloaded_image(&self, image_name: &str) -> String {
        let images = match self.runtime.list_images(image_name).await {
            Ok(images) => images,
            Err(e) => {
                warn!(node_id = %self.node_id, error = %e, "Error while listing images");
                return image_name.to_string();
            }
        };

        let latest = images
            .into_iter()
            .filter(|image| !image.repo_tags.is_empty())
            .max_by_key(|image| image.created)
            .and_then(|image| image.repo_tags.into_iter().next());

        match latest {
            Some(tag) => tag,
            None => {
                warn!(
                    node_id = %self.node_id,
                    image = %image_name,
                    "A downloaded node image was not found"
                );
                image_name.to_string()
            }
        }
    }

    /// Count non-exited containers whose image reference contains `image`
    pub async fn running_containers(&self, image: &str) -> usize {
        match self.runtime.list_containers(true).await {
            Ok(containers) => containers
                .iter()
                .filter(|c| c.image.contains(image) && !c.state.eq_ignore_ascii_case("exited"))
                .count(),
            Err(e) => {
                warn!(
                    node_id = %self.node_id,
                    error = %e,
                    "Error while getting number of running containers"
                );
                0
            }
        }
    }

    /// Network mode and extra hosts handed to nodes
    pub async fn network_resolution(&self, parent_name: &str) -> &NetworkResolution {
        self.resolver.network(parent_name).await
    }

    /// Mounts propagated to nodes
    pub async fn mount_bindings(
        &self,
        parent_name: &str,
    ) -> Result<&[MountBinding], OrchestratorError> {
        self.resolver.mount_bindings(parent_name).await
    }

    /// Proxy variables propagated to nodes
    pub async fn proxy_environment(&self, parent_name: &str) -> &HttpProxyEnvironment {
        self.resolver.proxy_environment(parent_name).await
    }
}

/// `KEY=value` entries sorted by key, followed by the proxy variables
fn flatten_env(env_vars: &HashMap<String, String>, proxy_env: &HttpProxyEnvironment) -> Vec<String> {
    let mut keys: Vec<&String> = env_vars.keys().collect();
    keys.sort();

    keys.into_iter()
        .map(|key| format!("{}={}", key, env_vars[key]))
        .chain(proxy_env.entries().iter().cloned())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use mockall::predicate::eq;
    use pretty_assertions::assert_eq;

    use crate::runtime::{
        AttachedNetwork, ContainerDetail, ContainerMount, ContainerSummary, ImageSummary,
        MockContainerRuntime, RuntimeError, RuntimeInfo,
    };

    fn summary(id: &str, name: &str, image: &str, state: &str) -> ContainerSummary {
        ContainerSummary {
            id: id.to_string(),
            names: vec![format!("/{}", name)],
            image: image.to_string(),
            state: state.to_string(),
        }
    }

    fn hub_detail(networks: &[&str]) -> ContainerDetail {
        ContainerDetail {
            id: "hub-id".to_string(),
            name: "/hub".to_string(),
            env: vec!["dockgrid_http_proxy=http://proxy:3128".to_string()],
            mounts: vec![ContainerMount {
                source: "/srv/uploads".to_string(),
                destination: "/tmp/node/home/seluser/uploads".to_string(),
            }],
            extra_hosts: vec!["db:10.1.1.1".to_string()],
            networks: networks
                .iter()
                .map(|name| AttachedNetwork {
                    name: name.to_string(),
                    ip_address: "172.18.0.2".to_string(),
                })
                .collect(),
            ..Default::default()
        }
    }

    /// Mock whose parent container is `hub` with the given networks
    fn runtime_with_hub(networks: &[&str]) -> MockContainerRuntime {
        let mut runtime = MockContainerRuntime::new();
        runtime
            .expect_list_containers()
            .returning(|_| Ok(vec![summary("hub-id", "hub", "dockgrid:latest", "running")]));
        let detail = hub_detail(networks);
        runtime
            .expect_inspect()
            .with(eq("hub-id"))
            .returning(move |_| Ok(detail.clone()));
        runtime.expect_info().returning(|| {
            Ok(RuntimeInfo {
                name: "docker-host".to_string(),
            })
        });
        runtime
    }

    fn capture_create(runtime: &mut MockContainerRuntime) -> Arc<Mutex<Option<ContainerSpec>>> {
        let captured = Arc::new(Mutex::new(None));
        let sink = captured.clone();
        runtime.expect_create().times(1).returning(move |spec| {
            *sink.lock().unwrap() = Some(spec);
            Ok("node-id".to_string())
        });
        captured
    }

    #[test]
    fn test_container_name_is_deterministic() {
        assert_eq!(container_name("hub", "30001"), "hub_30001");
        assert_eq!(container_name("hub", "30001"), container_name("hub", "30001"));
    }

    #[tokio::test]
    async fn test_create_container_on_host_network() {
        let mut runtime = runtime_with_hub(&["host"]);
        let captured = capture_create(&mut runtime);
        runtime.expect_start().with(eq("node-id")).times(1).returning(|_| Ok(()));

        let manager = ContainerManager::new(Arc::new(runtime), "test");
        let mut env_vars = HashMap::new();
        env_vars.insert("SCREEN_WIDTH".to_string(), "1920".to_string());

        let status = manager
            .create_container("hub", "elgalu/selenium:3", &mut env_vars, "30001")
            .await
            .unwrap();

        assert!(status.is_success());
        assert_eq!(status.container_name(), "hub_30001");
        assert_eq!(status.mapped_port(), Some("30001"));

        let spec = captured.lock().unwrap().clone().unwrap();
        assert_eq!(spec.name, "hub_30001");
        assert_eq!(spec.image, "elgalu/selenium:3");
        assert_eq!(spec.network_mode, "host");
        assert!(spec.auto_remove);
        assert!(spec.privileged);
        assert_eq!(
            spec.port_bindings.keys().cloned().collect::<Vec<_>>(),
            vec!["30001/tcp".to_string(), "40001/tcp".to_string()]
        );
        assert_eq!(spec.port_bindings["40001/tcp"].host_ip, "");
        assert_eq!(spec.port_bindings["40001/tcp"].host_port, "40001");
        assert_eq!(
            spec.binds,
            vec![
                "/srv/uploads:/home/seluser/uploads".to_string(),
                "/dev/shm:/dev/shm".to_string()
            ]
        );
        assert_eq!(
            spec.extra_hosts,
            vec![
                "mac.host.local:192.168.65.1".to_string(),
                "docker-host:127.0.1.0".to_string(),
                "db:10.1.1.1".to_string()
            ]
        );
        for expected in [
            "SELENIUM_HUB_HOST=localhost",
            "SELENIUM_NODE_HOST=localhost",
            "PICK_ALL_RANDOM_PORTS=true",
            "NOVNC_PORT=40001",
            "SCREEN_WIDTH=1920",
            "http_proxy=http://proxy:3128",
        ] {
            assert!(spec.env.contains(&expected.to_string()), "missing {}", expected);
        }
        assert_eq!(env_vars.get("SELENIUM_HUB_HOST").map(String::as_str), Some("localhost"));
    }

    #[tokio::test]
    async fn test_create_container_on_custom_network_keeps_env() {
        let mut runtime = runtime_with_hub(&["bridge", "grid"]);
        let captured = capture_create(&mut runtime);
        runtime.expect_start().returning(|_| Ok(()));

        let manager = ContainerManager::new(Arc::new(runtime), "test");
        let mut env_vars = HashMap::new();
        env_vars.insert(NO_VNC_PORT_ENV.to_string(), "50001".to_string());

        let status = manager
            .create_container("hub", "node", &mut env_vars, "30001")
            .await
            .unwrap();
        assert!(status.is_success());

        let spec = captured.lock().unwrap().clone().unwrap();
        assert_eq!(spec.network_mode, "grid");
        assert!(spec.port_bindings.contains_key("50001/tcp"));
        assert!(!env_vars.contains_key("SELENIUM_HUB_HOST"));
        assert_eq!(
            spec.extra_hosts,
            vec!["mac.host.local:192.168.65.1".to_string(), "db:10.1.1.1".to_string()]
        );
    }

    #[tokio::test]
    async fn test_parent_is_resolved_once() {
        let mut runtime = MockContainerRuntime::new();
        runtime
            .expect_list_containers()
            .returning(|_| Ok(vec![summary("hub-id", "hub", "dockgrid:latest", "running")]));
        let detail = hub_detail(&["grid"]);
        // network, mounts and proxy env each inspect exactly once
        runtime
            .expect_inspect()
            .times(3)
            .returning(move |_| Ok(detail.clone()));
        runtime.expect_create().times(2).returning(|_| Ok("node-id".to_string()));
        runtime.expect_start().times(2).returning(|_| Ok(()));

        let manager = ContainerManager::new(Arc::new(runtime), "test");
        for port in ["30001", "30002"] {
            let status = manager
                .create_container("hub", "node", &mut HashMap::new(), port)
                .await
                .unwrap();
            assert!(status.is_success());
        }
    }

    #[tokio::test]
    async fn test_missing_parent_degrades_to_defaults() {
        let mut runtime = MockContainerRuntime::new();
        runtime.expect_list_containers().returning(|_| Ok(vec![]));
        runtime.expect_inspect().never();
        let captured = capture_create(&mut runtime);
        runtime.expect_start().returning(|_| Ok(()));

        let manager = ContainerManager::new(Arc::new(runtime), "test");
        let status = manager
            .create_container("hub", "node", &mut HashMap::new(), "30001")
            .await
            .unwrap();
        assert!(status.is_success());

        let spec = captured.lock().unwrap().clone().unwrap();
        assert_eq!(spec.network_mode, "default");
        assert_eq!(spec.binds, vec!["/dev/shm:/dev/shm".to_string()]);
        assert_eq!(spec.extra_hosts, vec!["mac.host.local:192.168.65.1".to_string()]);
    }

    #[tokio::test]
    async fn test_protected_mount_fails_creation() {
        let mut runtime = MockContainerRuntime::new();
        runtime
            .expect_list_containers()
            .returning(|_| Ok(vec![summary("hub-id", "hub", "dockgrid:latest", "running")]));
        let mut detail = hub_detail(&["bridge"]);
        detail.mounts.push(ContainerMount {
            source: "/var/run/docker.sock".to_string(),
            destination: "/tmp/node/var/run/docker.sock".to_string(),
        });
        runtime.expect_inspect().returning(move |_| Ok(detail.clone()));
        runtime.expect_create().never();

        let manager = ContainerManager::new(Arc::new(runtime), "test");
        let result = manager
            .create_container("hub", "node", &mut HashMap::new(), "30001")
            .await;
        assert!(matches!(result, Err(OrchestratorError::Configuration(_))));
    }

    #[tokio::test]
    async fn test_start_failure_returns_failed_status() {
        let mut runtime = runtime_with_hub(&["bridge"]);
        runtime.expect_create().returning(|_| Ok("node-id".to_string()));
        runtime
            .expect_start()
            .returning(|_| Err(RuntimeError::Unavailable("daemon gone".to_string())));
        runtime.expect_remove().with(eq("node-id")).times(1).returning(|_| Ok(()));

        let manager = ContainerManager::new(Arc::new(runtime), "test");
        let status = manager
            .create_container("hub", "node", &mut HashMap::new(), "30001")
            .await
            .unwrap();
        assert!(!status.is_success());
        assert_eq!(status.mapped_port(), None);
    }

    #[tokio::test]
    async fn test_create_failure_returns_failed_status() {
        let mut runtime = runtime_with_hub(&["bridge"]);
        runtime
            .expect_create()
            .returning(|_| Err(RuntimeError::TimedOut("slow".to_string())));
        runtime.expect_start().never();

        let manager = ContainerManager::new(Arc::new(runtime), "test");
        let status = manager
            .create_container("hub", "node", &mut HashMap::new(), "30001")
            .await
            .unwrap();
        assert!(!status.is_success());
    }

    #[tokio::test]
    async fn test_invalid_port_returns_failed_status() {
        let mut runtime = MockContainerRuntime::new();
        runtime.expect_create().never();

        let manager = ContainerManager::new(Arc::new(runtime), "test");
        let status = manager
            .create_container("hub", "node", &mut HashMap::new(), "not-a-port")
            .await
            .unwrap();
        assert!(!status.is_success());
    }

    #[tokio::test]
    async fn test_register_node_uses_naming_rule() {
        let mut runtime = MockContainerRuntime::new();
        runtime.expect_list_containers().returning(|_| {
            Ok(vec![
                summary("hub-id", "hub", "dockgrid:latest", "running"),
                summary("node-id", "hub_40000", "elgalu/selenium", "running"),
            ])
        });

        let manager = ContainerManager::new(Arc::new(runtime), "test");
        let url = Url::parse("http://172.17.0.3:40000").unwrap();
        let registration = manager.register_node("hub", &url).await;

        assert_eq!(registration.container_id.as_deref(), Some("node-id"));
        assert_eq!(registration.secondary_port, Some(50000));
        assert_eq!(
            manager.container_id(&container_name("hub", "40000")).await,
            registration.container_id
        );
    }

    #[tokio::test]
    async fn test_port_without_preview_counterpart_fails() {
        let mut runtime = MockContainerRuntime::new();
        runtime.expect_list_containers().never();
        runtime.expect_create().never();

        let manager = ContainerManager::new(Arc::new(runtime), "test");
        for port in ["56000", "60000"] {
            let mut env_vars = HashMap::new();
            let status = manager
                .create_container("hub", "node", &mut env_vars, port)
                .await
                .unwrap();
            assert!(!status.is_success());
            assert!(!env_vars.contains_key(NO_VNC_PORT_ENV));
        }

        let url = Url::parse("http://172.17.0.3:60000").unwrap();
        assert_eq!(
            manager.register_node("hub", &url).await,
            ContainerRegistration::default()
        );
    }

    #[tokio::test]
    async fn test_highest_valid_port_keeps_offset() {
        let mut runtime = runtime_with_hub(&["bridge"]);
        let captured = capture_create(&mut runtime);
        runtime.expect_start().returning(|_| Ok(()));

        let manager = ContainerManager::new(Arc::new(runtime), "test");
        let status = manager
            .create_container("hub", "node", &mut HashMap::new(), "55535")
            .await
            .unwrap();
        assert!(status.is_success());

        let spec = captured.lock().unwrap().clone().unwrap();
        assert!(spec.port_bindings.contains_key("65535/tcp"));
    }

    #[tokio::test]
    async fn test_register_node_without_port() {
        let mut runtime = MockContainerRuntime::new();
        runtime
            .expect_list_containers()
            .times(1)
            .returning(|_| Ok(vec![summary("node-id", "hub_80", "elgalu/selenium", "running")]));

        let manager = ContainerManager::new(Arc::new(runtime), "test");

        let unknown = Url::parse("node://172.17.0.3").unwrap();
        assert_eq!(
            manager.register_node("hub", &unknown).await,
            ContainerRegistration::default()
        );

        let implicit = Url::parse("http://172.17.0.3").unwrap();
        let registration = manager.register_node("hub", &implicit).await;
        assert_eq!(registration.container_id.as_deref(), Some("node-id"));
        assert_eq!(registration.secondary_port, Some(10080));
    }

    #[test]
    fn test_configuration_error_counts_as_failure() {
        use metrics_exporter_prometheus::PrometheusBuilder;

        let mut runtime = MockContainerRuntime::new();
        runtime
            .expect_list_containers()
            .returning(|_| Ok(vec![summary("hub-id", "hub", "dockgrid:latest", "running")]));
        let mut detail = hub_detail(&["bridge"]);
        detail.mounts.push(ContainerMount {
            source: "/host".to_string(),
            destination: "/tmp/node/dev/shm".to_string(),
        });
        runtime.expect_inspect().returning(move |_| Ok(detail.clone()));
        runtime.expect_create().never();
        let manager = ContainerManager::new(Arc::new(runtime), "test");

        let recorder = PrometheusBuilder::new().build_recorder();
        let handle = recorder.handle();
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();

        let result = ::metrics::with_local_recorder(&recorder, || {
            rt.block_on(manager.create_container(
                "hub",
                "misconfigured",
                &mut HashMap::new(),
                "30001",
            ))
        });

        assert!(matches!(result, Err(OrchestratorError::Configuration(_))));
        assert!(handle
            .render()
            .contains("dockgrid_containers_failed_total{image=\"misconfigured\"} 1"));
    }

    #[tokio::test]
    async fn test_container_ip_prefers_default_network() {
        let mut runtime = MockContainerRuntime::new();
        runtime
            .expect_list_containers()
            .returning(|_| Ok(vec![summary("node-id", "hub_30001", "node", "running")]));
        runtime.expect_inspect().returning(|_| {
            Ok(ContainerDetail {
                ip_address: "172.17.0.4".to_string(),
                networks: vec![AttachedNetwork {
                    name: "grid".to_string(),
                    ip_address: "10.0.0.5".to_string(),
                }],
                ..Default::default()
            })
        });

        let manager = ContainerManager::new(Arc::new(runtime), "test");
        assert_eq!(
            manager.get_container_ip("hub_30001").await.as_deref(),
            Some("172.17.0.4")
        );
    }

    #[tokio::test]
    async fn test_container_ip_falls_back_to_custom_network() {
        let mut runtime = MockContainerRuntime::new();
        runtime
            .expect_list_containers()
            .returning(|_| Ok(vec![summary("node-id", "hub_30001", "node", "running")]));
        runtime.expect_inspect().returning(|_| {
            Ok(ContainerDetail {
                ip_address: String::new(),
                networks: vec![AttachedNetwork {
                    name: "grid".to_string(),
                    ip_address: "10.0.0.5".to_string(),
                }],
                ..Default::default()
            })
        });

        let manager = ContainerManager::new(Arc::new(runtime), "test");
        assert_eq!(
            manager.get_container_ip("hub_30001").await.as_deref(),
            Some("10.0.0.5")
        );
        assert_eq!(manager.get_container_ip("unknown").await, None);
    }

    #[tokio::test]
    async fn test_latest_downloaded_image() {
        let mut runtime = MockContainerRuntime::new();
        runtime.expect_list_images().with(eq("x")).returning(|_| {
            Ok(vec![
                ImageSummary {
                    id: "1".to_string(),
                    repo_tags: vec!["x:1".to_string()],
                    created: 1,
                },
                ImageSummary {
                    id: "3".to_string(),
                    repo_tags: vec!["x:3".to_string()],
                    created: 3,
                },
                ImageSummary {
                    id: "4".to_string(),
                    repo_tags: vec![],
                    created: 4,
                },
                ImageSummary {
                    id: "2".to_string(),
                    repo_tags: vec!["x:2".to_string()],
                    created: 2,
                },
            ])
        });

        let manager = ContainerManager::new(Arc::new(runtime), "test");
        assert_eq!(manager.latest_downloaded_image("x").await, "x:3");
    }

    #[tokio::test]
    async fn test_latest_downloaded_image_falls_back_to_name() {
        let mut runtime = MockContainerRuntime::new();
        runtime.expect_list_images().returning(|name| {
            if name == "x" {
                Ok(vec![ImageSummary {
                    id: "1".to_string(),
                    repo_tags: vec![],
                    created: 1,
                }])
            } else {
                Ok(vec![])
            }
        });

        let manager = ContainerManager::new(Arc::new(runtime), "test");
        assert_eq!(manager.latest_downloaded_image("x").await, "x");
        assert_eq!(manager.latest_downloaded_image("y").await, "y");
    }

    #[tokio::test]
    async fn test_running_containers_counts_non_exited() {
        let mut runtime = MockContainerRuntime::new();
        runtime.expect_list_containers().with(eq(true)).returning(|_| {
            Ok(vec![
                summary("1", "hub_30001", "docker.io/elgalu/selenium:3.141", "running"),
                summary("2", "hub_30002", "elgalu/selenium:latest", "Exited"),
                summary("3", "hub_30003", "elgalu/selenium", "created"),
                summary("4", "hub", "dockgrid:latest", "running"),
            ])
        });

        let manager = ContainerManager::new(Arc::new(runtime), "test");
        assert_eq!(manager.running_containers("elgalu/selenium").await, 2);
    }

    #[tokio::test]
    async fn test_stop_container_swallows_errors() {
        let mut runtime = MockContainerRuntime::new();
        runtime
            .expect_stop()
            .withf(|id, grace| id == "node-id" && *grace == Duration::from_secs(5))
            .times(1)
            .returning(|_, _| Err(RuntimeError::NotFound("node-id".to_string())));

        let manager = ContainerManager::new(Arc::new(runtime), "test");
        manager.stop_container("node-id").await;
    }

    #[tokio::test]
    async fn test_copy_files_streams_archive() {
        use futures::StreamExt;

        let mut runtime = MockContainerRuntime::new();
        runtime.expect_archive().returning(|id, folder| {
            if id == "node-id" && folder == "/home/seluser/videos" {
                Ok(futures::stream::iter(vec![Ok(vec![1u8, 2]), Ok(vec![3u8])]).boxed())
            } else {
                Err(RuntimeError::NotFound(id.to_string()))
            }
        });

        let manager = ContainerManager::new(Arc::new(runtime), "test");
        let stream = manager
            .copy_files("node-id", "/home/seluser/videos")
            .await
            .unwrap();
        let chunks: Vec<_> = stream.collect().await;
        assert_eq!(chunks, vec![Ok(vec![1, 2]), Ok(vec![3])]);

        assert!(manager.copy_files("gone", "/tmp").await.is_none());
    }

    #[tokio::test]
    async fn test_execute_command_swallows_drain_failure() {
        let mut runtime = MockContainerRuntime::new();
        runtime.expect_exec().returning(|_, command, wait| {
            if !wait {
                Ok(None)
            } else if command[0] == "broken" {
                Err(RuntimeError::OutputInterrupted("stream closed".to_string()))
            } else {
                Ok(Some("done".to_string()))
            }
        });

        let manager = ContainerManager::new(Arc::new(runtime), "test");
        let broken = vec!["broken".to_string()];
        let ok = vec!["bash".to_string(), "-c".to_string(), "true".to_string()];

        assert_eq!(manager.execute_command("node-id", &broken, true).await, None);
        assert_eq!(
            manager.execute_command("node-id", &ok, true).await.as_deref(),
            Some("done")
        );
        assert_eq!(manager.execute_command("node-id", &ok, false).await, None);
    }
}
