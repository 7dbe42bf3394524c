//! Configuration module for dockgrid
//!
//! Supports configuration via:
//! - YAML/TOML/JSON config files (`config/dockgrid`, `/etc/dockgrid/config`)
//! - Environment variables (with DOCKGRID__ prefix)
//! - A `.env` file in the working directory

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Main application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Name of the container the orchestrator itself runs in
    #[serde(default = "default_parent_container")]
    pub parent_container: String,

    /// Image used for browser nodes
    #[serde(default = "default_node_image")]
    pub node_image: String,

    /// Seconds between fleet reports
    #[serde(default = "default_monitor_interval")]
    pub monitor_interval_secs: u64,

    /// Docker daemon connection
    #[serde(default)]
    pub docker: DockerConfig,

    /// Idle session reclamation
    #[serde(default)]
    pub reclaimer: ReclaimerConfig,

    /// Metrics settings
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Docker daemon connection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DockerConfig {
    /// Unix socket path; local defaults (`DOCKER_HOST`) when unset
    #[serde(default)]
    pub socket: Option<String>,

    /// Request timeout in seconds
    #[serde(default = "default_docker_timeout")]
    pub timeout_secs: u64,
}

/// Idle session reclamation settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReclaimerConfig {
    /// Inactivity after which a session is reclaimed
    #[serde(default = "default_idle_threshold")]
    pub idle_threshold_secs: u64,

    /// Delay between two polls of the occupied slots
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,
}

/// Metrics configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Enable metrics collection
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Address of the Prometheus scrape endpoint, none to only record
    #[serde(default)]
    pub listen_addr: Option<String>,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_parent_container() -> String {
    "dockgrid".to_string()
}

fn default_node_image() -> String {
    "elgalu/selenium".to_string()
}

fn default_monitor_interval() -> u64 {
    5
}

fn default_docker_timeout() -> u64 {
    120
}

fn default_idle_threshold() -> u64 {
    90
}

fn default_poll_interval() -> u64 {
    500
}

fn default_true() -> bool {
    true
}

impl Default for DockerConfig {
    fn default() -> Self {
        Self {
            socket: None,
            timeout_secs: default_docker_timeout(),
        }
    }
}

impl Default for ReclaimerConfig {
    fn default() -> Self {
        Self {
            idle_threshold_secs: default_idle_threshold(),
            poll_interval_ms: default_poll_interval(),
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            listen_addr: None,
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            parent_container: default_parent_container(),
            node_image: default_node_image(),
            monitor_interval_secs: default_monitor_interval(),
            docker: DockerConfig::default(),
            reclaimer: ReclaimerConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

impl ReclaimerConfig {
    pub fn idle_threshold(&self) -> Duration {
        Duration::from_secs(self.idle_threshold_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

impl MetricsConfig {
    /// Parsed scrape endpoint address
    pub fn listen_addr(&self) -> Result<Option<SocketAddr>> {
        self.listen_addr
            .as_deref()
            .map(|addr| {
                addr.parse::<SocketAddr>()
                    .with_context(|| format!("Invalid metrics listen address: {}", addr))
            })
            .transpose()
    }
}

impl AppConfig {
    /// Load configuration from file and environment variables
    pub fn load() -> Result<Self> {
        // Try to load .env file if present
        let _ = dotenvy::dotenv();

        let config = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default())?)
            .add_source(config::File::with_name("config/dockgrid").required(false))
            .add_source(config::File::with_name("/etc/dockgrid/config").required(false))
            .add_source(
                config::Environment::with_prefix("DOCKGRID")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .context("Failed to build configuration")?;

        let app_config: AppConfig = config
            .try_deserialize()
            .context("Failed to deserialize configuration")?;

        app_config.validate()?;

        Ok(app_config)
    }

    /// Validate configuration values
    fn validate(&self) -> Result<()> {
        if self.parent_container.trim().is_empty() {
            anyhow::bail!("Parent container name cannot be empty");
        }

        if self.node_image.trim().is_empty() {
            anyhow::bail!("Node image cannot be empty");
        }

        if self.monitor_interval_secs == 0 {
            anyhow::bail!("Monitor interval cannot be 0");
        }

        if self.docker.timeout_secs == 0 {
            anyhow::bail!("Docker timeout cannot be 0");
        }

        if self.reclaimer.idle_threshold_secs == 0 {
            anyhow::bail!("Idle threshold cannot be 0");
        }

        if self.reclaimer.poll_interval_ms < 10 {
            anyhow::bail!("Minimum poll interval is 10ms");
        }

        self.metrics.listen_addr()?;

        Ok(())
    }
}
