//! dockgrid - Disposable browser-node containers for Selenium-style grids
//!
//! The binary checks that the parent container can host nodes, then reports
//! the running node fleet until it is asked to stop.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::signal;
use tracing::{info, warn};

use dockgrid::config::AppConfig;
use dockgrid::container::ContainerManager;
use dockgrid::logging::init_logging;
use dockgrid::runtime::DockerRuntime;

#[tokio::main]
async fn main() -> Result<()> {
    let config = AppConfig::load()?;

    init_logging(&config.log_level)?;

    info!(version = env!("CARGO_PKG_VERSION"), "Starting dockgrid");

    if config.metrics.enabled {
        dockgrid::metrics::init_metrics(config.metrics.listen_addr()?)?;
        info!(listen_addr = ?config.metrics.listen_addr, "Prometheus metrics initialized");
    }

    let runtime = Arc::new(DockerRuntime::connect(&config.docker)?);
    let node_id = format!("dockgrid-{}", std::process::id());
    let manager = ContainerManager::new(runtime, node_id);

    let node_image = manager.latest_downloaded_image(&config.node_image).await;
    info!(image = %node_image, "Node image selected");

    preflight(&manager, &config.parent_container).await?;

    let mut ticker = tokio::time::interval(Duration::from_secs(config.monitor_interval_secs));
    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            _ = ticker.tick() => {
                let running = manager.running_containers(&config.node_image).await;
                dockgrid::metrics::record_running_nodes(&config.node_image, running);
                info!(image = %config.node_image, running = running, "Node fleet status");
            }
        }
    }

    info!("dockgrid stopped");
    Ok(())
}

/// Resolve everything nodes inherit from the parent container
async fn preflight(manager: &ContainerManager, parent: &str) -> Result<()> {
    let mounts = manager
        .mount_bindings(parent)
        .await
        .with_context(|| format!("Parent container {} cannot host nodes", parent))?;
    let network = manager.network_resolution(parent).await;
    let proxy_env = manager.proxy_environment(parent).await;

    info!(
        parent = %parent,
        network_mode = %network.mode,
        extra_hosts = ?network.extra_hosts,
        mounts = mounts.len(),
        proxy_vars = proxy_env.entries().len(),
        "Parent container resolved"
    );

    Ok(())
}

/// Handle shutdown signals gracefully
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received");
}
