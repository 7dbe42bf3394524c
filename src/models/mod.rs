//! Data models for dockgrid
//!
//! Values produced by the orchestration layer and the parent-container
//! resolution it memoizes.

use std::fmt;

use serde::{Deserialize, Serialize};

// ============================================================================
// Provisioning Models
// ============================================================================

/// Outcome of a container creation request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerCreationStatus {
    success: bool,
    container_name: String,
    mapped_port: Option<String>,
}

impl ContainerCreationStatus {
    /// A container that was created and started on `port`
    pub fn created(container_name: impl Into<String>, port: impl Into<String>) -> Self {
        Self {
            success: true,
            container_name: container_name.into(),
            mapped_port: Some(port.into()),
        }
    }

    /// A creation attempt that consumed no resources
    pub fn failed(container_name: impl Into<String>) -> Self {
        Self {
            success: false,
            container_name: container_name.into(),
            mapped_port: None,
        }
    }

    pub fn is_success(&self) -> bool {
        self.success
    }

    pub fn container_name(&self) -> &str {
        &self.container_name
    }

    pub fn mapped_port(&self) -> Option<&str> {
        self.mapped_port.as_deref()
    }
}

/// Identity of a node container resolved at registration time
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerRegistration {
    /// `None` when no container carries the expected name
    pub container_id: Option<String>,

    /// Live-preview port, derived from the node port; `None` when the node
    /// port has no valid counterpart
    pub secondary_port: Option<u16>,
}

// ============================================================================
// Parent Container Resolution
// ============================================================================

/// A host folder bound into a node container
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MountBinding {
    pub host_source: String,
    pub container_destination: String,
}

impl fmt::Display for MountBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host_source, self.container_destination)
    }
}

/// Network settings mirrored from the parent container
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkResolution {
    /// Network mode handed to every node container
    pub mode: String,

    /// Ordered `name:ip` entries
    pub extra_hosts: Vec<String>,
}

/// Proxy variables forwarded from the parent container, as `KEY=value`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpProxyEnvironment {
    entries: Vec<String>,
}

impl HttpProxyEnvironment {
    /// Add an entry unless it is already present
    pub fn insert(&mut self, entry: impl Into<String>) {
        let entry = entry.into();
        if !self.entries.contains(&entry) {
            self.entries.push(entry);
        }
    }

    pub fn entries(&self) -> &[String] {
        &self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
