//! Observability module for Conductor.
//!
//! Provides logging and metrics wiring.

use crate::config::ObservabilityConfig;
use crate::error::{ConductorError, Result};
use metrics::{counter, gauge};
use metrics_exporter_prometheus::PrometheusBuilder;
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Initialize observability (logging and metrics).
pub fn init(config: &ObservabilityConfig) -> Result<()> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    let subscriber = tracing_subscriber::registry().with(filter);

    if config.json_logs {
        subscriber
            .with(fmt::layer().json())
            .try_init()
            .map_err(|e| ConductorError::Internal(format!("Failed to init logging: {}", e)))?;
    } else {
        subscriber
            .with(fmt::layer())
            .try_init()
            .map_err(|e| ConductorError::Internal(format!("Failed to init logging: {}", e)))?;
    }

    info!("Observability initialized");
    Ok(())
}

/// Run the Prometheus metrics server.
pub async fn run_metrics_server(config: ObservabilityConfig) -> Result<()> {
    let builder = PrometheusBuilder::new();

    let handle = builder.install_recorder().map_err(|e| {
        ConductorError::Internal(format!("Failed to install metrics recorder: {}", e))
    })?;

    register_metrics();

    let app = axum::Router::new()
        .route(
            "/metrics",
            axum::routing::get(move || async move { handle.render() }),
        )
        .route("/health", axum::routing::get(|| async { "OK" }));

    let listener = TcpListener::bind(config.metrics_addr).await?;
    info!(addr = %config.metrics_addr, "Metrics server listening");

    axum::serve(listener, app)
        .await
        .map_err(|e| ConductorError::Network(e.to_string()))?;

    Ok(())
}

/// Register standard metrics.
fn register_metrics() {
    // Restart lifecycle
    gauge!("conductor_restart_active").set(0.0);
    counter!("conductor_restart_runs_total").absolute(0);
    counter!("conductor_nodes_restarted_total").absolute(0);
    counter!("conductor_connections_force_closed_total").absolute(0);

    // Backend clients
    counter!("conductor_broker_api_errors_total").absolute(0);
    counter!("conductor_ssh_commands_total").absolute(0);

    // Cluster view
    gauge!("conductor_cluster_nodes_total").set(0.0);
    gauge!("conductor_cluster_nodes_healthy").set(0.0);
}

/// Record the start or end of a restart run.
pub fn record_restart_active(active: bool) {
    gauge!("conductor_restart_active").set(if active { 1.0 } else { 0.0 });
    if active {
        counter!("conductor_restart_runs_total").increment(1);
    }
}

/// Record an SSH command execution.
pub fn record_ssh_command(sudo: bool) {
    counter!("conductor_ssh_commands_total", "sudo" => sudo.to_string()).increment(1);
}

/// Record a broker API error by class.
pub fn record_broker_error(kind: &str) {
    counter!("conductor_broker_api_errors_total", "kind" => kind.to_string()).increment(1);
}

/// Update the cluster health gauges.
pub fn update_cluster_metrics(nodes_total: usize, nodes_healthy: usize) {
    gauge!("conductor_cluster_nodes_total").set(nodes_total as f64);
    gauge!("conductor_cluster_nodes_healthy").set(nodes_healthy as f64);
}
