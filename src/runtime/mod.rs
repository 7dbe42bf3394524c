//! Container runtime gateway
//!
//! A thin capability interface over a local container daemon. The
//! orchestration layer only talks to [`ContainerRuntime`], so alternate
//! runtimes (or a mock in tests) can be plugged in without touching it.
//!
//! The gateway never retries. Every failure is reported as a
//! [`RuntimeError`] and the caller decides what to do with it.

mod docker;

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::BoxStream;
use thiserror::Error;

pub use docker::DockerRuntime;

/// Gateway error types
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RuntimeError {
    #[error("Container runtime unavailable: {0}")]
    Unavailable(String),

    #[error("Container runtime operation timed out: {0}")]
    TimedOut(String),

    #[error("Not found: {0}")]
    NotFound(String),

    /// The command ran but its output could not be drained
    #[error("Output stream interrupted: {0}")]
    OutputInterrupted(String),
}

/// Byte stream of a tar archive copied out of a container
pub type ArchiveStream = BoxStream<'static, Result<Vec<u8>, RuntimeError>>;

/// Entry of a container listing
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContainerSummary {
    pub id: String,
    /// Names as reported by the daemon, `/`-prefixed
    pub names: Vec<String>,
    /// Image reference, including registry and tag
    pub image: String,
    pub state: String,
}

/// A bind mount seen on an inspected container
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContainerMount {
    pub source: String,
    pub destination: String,
}

/// A network a container is attached to
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AttachedNetwork {
    pub name: String,
    pub ip_address: String,
}

/// Result of inspecting a single container
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContainerDetail {
    pub id: String,
    pub name: String,
    /// Environment as `KEY=value` entries
    pub env: Vec<String>,
    pub mounts: Vec<ContainerMount>,
    /// Host config extra hosts, `name:ip`
    pub extra_hosts: Vec<String>,
    /// Address on the default bridge network, empty if none
    pub ip_address: String,
    /// Attached networks, sorted by name
    pub networks: Vec<AttachedNetwork>,
}

/// Host side of a port binding
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PortBinding {
    /// Empty means the runtime picks the interface
    pub host_ip: String,
    pub host_port: String,
}

/// Everything needed to create a container
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    pub env: Vec<String>,
    /// Container ports in `port/proto` form
    pub exposed_ports: Vec<String>,
    pub binds: Vec<String>,
    pub port_bindings: BTreeMap<String, PortBinding>,
    pub network_mode: String,
    pub extra_hosts: Vec<String>,
    pub auto_remove: bool,
    pub privileged: bool,
}

/// Entry of an image listing
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImageSummary {
    pub id: String,
    /// Empty for dangling images
    pub repo_tags: Vec<String>,
    /// Creation time, seconds since the epoch
    pub created: i64,
}

/// Daemon information
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RuntimeInfo {
    /// Host name of the machine running the daemon
    pub name: String,
}

/// Operations the orchestrator needs from a container runtime
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    async fn list_containers(
        &self,
        include_stopped: bool,
    ) -> Result<Vec<ContainerSummary>, RuntimeError>;

    async fn inspect(&self, id: &str) -> Result<ContainerDetail, RuntimeError>;

    /// Create a container and return its id
    async fn create(&self, spec: ContainerSpec) -> Result<String, RuntimeError>;

    async fn start(&self, id: &str) -> Result<(), RuntimeError>;

    async fn stop(&self, id: &str, grace_period: Duration) -> Result<(), RuntimeError>;

    /// Forcefully remove a container
    async fn remove(&self, id: &str) -> Result<(), RuntimeError>;

    /// Run a command inside a container.
    ///
    /// When `wait_for_completion` is false the exec is detached and `None` is
    /// returned. Otherwise the combined output is drained and returned; a
    /// failure while draining is reported as [`RuntimeError::OutputInterrupted`].
    async fn exec(
        &self,
        id: &str,
        command: &[String],
        wait_for_completion: bool,
    ) -> Result<Option<String>, RuntimeError>;

    /// Copy a path out of a container as a tar stream
    async fn archive(&self, id: &str, path: &str) -> Result<ArchiveStream, RuntimeError>;

    /// List local images whose reference matches `name`
    async fn list_images(&self, name: &str) -> Result<Vec<ImageSummary>, RuntimeError>;

    async fn info(&self) -> Result<RuntimeInfo, RuntimeError>;
}
