//! Node container orchestration
//!
//! Handles all interactions with the container runtime on behalf of the grid:
//! - Resolving network, hosts, mounts and proxy settings from the parent container
//! - Creating and starting single-session node containers
//! - Executing commands and copying files out of nodes
//! - Stopping nodes and counting the running fleet

mod error;
mod manager;
mod resolver;

pub use error::OrchestratorError;
pub use manager::{
    container_name, ContainerManager, NO_VNC_PORT_ENV, NO_VNC_PORT_GAP, STOP_GRACE_PERIOD,
};
pub use resolver::{
    mirror_extra_hosts, resolve_mount_bindings, resolve_network_mode, resolve_proxy_environment,
    ParentResolver, DEFAULT_NETWORK_MODE, DEFAULT_NETWORK_NAME, HOST_NETWORK_MODE,
    NODE_MOUNT_POINT, PROTECTED_MOUNT_POINTS,
};
