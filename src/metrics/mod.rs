//! Prometheus metrics export
//!
//! Counters for node provisioning, gauges for the running fleet and
//! histograms for session durations.

use std::net::SocketAddr;

use anyhow::Context;
use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder};

const SESSION_DURATION_BUCKETS: &[f64] = &[
    5.0, 15.0, 30.0, 60.0, 120.0, 300.0, 600.0, 1200.0, 1800.0, 3600.0,
];

/// Install the Prometheus recorder.
///
/// With a listen address the exporter also serves `/metrics` over HTTP,
/// which needs a running tokio runtime.
pub fn init_metrics(listen_addr: Option<SocketAddr>) -> anyhow::Result<()> {
    let builder = PrometheusBuilder::new()
        .set_buckets_for_metric(
            Matcher::Full("dockgrid_session_duration_seconds".to_string()),
            SESSION_DURATION_BUCKETS,
        )
        .context("Invalid histogram buckets")?;

    match listen_addr {
        Some(addr) => builder
            .with_http_listener(addr)
            .install()
            .context("Failed to install Prometheus exporter")?,
        None => {
            builder
                .install_recorder()
                .context("Failed to install Prometheus recorder")?;
        }
    }

    Ok(())
}

/// Record a node container that was created and started
pub fn record_container_created(image: &str) {
    counter!("dockgrid_containers_created_total", "image" => image.to_string()).increment(1);
}

/// Record a node container that could not be provisioned
pub fn record_container_failed(image: &str) {
    counter!("dockgrid_containers_failed_total", "image" => image.to_string()).increment(1);
}

/// Record a node container that was stopped
pub fn record_container_stopped() {
    counter!("dockgrid_containers_stopped_total").increment(1);
}

/// Record the size of the running node fleet
pub fn record_running_nodes(image: &str, count: usize) {
    gauge!("dockgrid_running_nodes", "image" => image.to_string()).set(count as f64);
}

/// Record a session reclaimed after going idle
pub fn record_session_reclaimed(proxy: &str, duration_secs: f64) {
    counter!("dockgrid_sessions_reclaimed_total", "proxy" => proxy.to_string()).increment(1);
    histogram!("dockgrid_session_duration_seconds", "proxy" => proxy.to_string(), "outcome" => "reclaimed")
        .record(duration_secs);
}

/// Record a session that ended normally
pub fn record_session_completed(proxy: &str, duration_secs: f64) {
    counter!("dockgrid_sessions_completed_total", "proxy" => proxy.to_string()).increment(1);
    histogram!("dockgrid_session_duration_seconds", "proxy" => proxy.to_string(), "outcome" => "completed")
        .record(duration_secs);
}
