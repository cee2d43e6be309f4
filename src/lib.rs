//! Conductor - safe, sequenced rolling restarts for clustered RabbitMQ.
//!
//! Conductor drains, stops, restarts and re-validates each broker node in
//! turn, preserving cluster availability throughout. The operator-facing
//! surface is an administrative HTTP service; the core is a single-writer
//! state machine coordinating the broker's management HTTP API and an SSH
//! control channel into each host.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        Conductor                             │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Admin API: start / cancel / status / validate / node ops   │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Orchestrator: admission | drain | restart | health wait    │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Backends: management HTTP client | SSH session pool        │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Quick Start
//!
//! ```no_run
//! use conductor::config::ConductorConfig;
//! use conductor::types::ClusterTopology;
//!
//! #[tokio::main]
//! async fn main() -> conductor::Result<()> {
//!     let config = ConductorConfig::development();
//!     let topology = ClusterTopology::from_file("topology.yaml".as_ref())?;
//!     conductor::run(config, topology).await
//! }
//! ```

pub mod api;
pub mod broker;
pub mod cli;
pub mod config;
pub mod error;
pub mod events;
pub mod health;
pub mod observability;
pub mod orchestrator;
pub mod service;
pub mod shutdown;
pub mod ssh;
pub mod status;
pub mod types;
pub mod validator;

// Re-exports
pub use error::{ConductorError, Result};

use crate::api::ApiState;
use crate::broker::HttpBrokerClient;
use crate::config::ConductorConfig;
use crate::events::EventBus;
use crate::orchestrator::RestartOrchestrator;
use crate::service::ServiceController;
use crate::shutdown::Shutdown;
use crate::ssh::{CommandRunner, SshExecutor};
use crate::status::StatusReporter;
use crate::types::ClusterTopology;
use crate::validator::ClusterValidator;
use std::sync::Arc;
use tracing::{error, info, warn};

/// Run the Conductor server with the given configuration and topology.
pub async fn run(config: ConductorConfig, topology: ClusterTopology) -> Result<()> {
    info!(
        cluster = %topology.cluster_name,
        nodes = topology.nodes.len(),
        "Starting Conductor"
    );

    observability::init(&config.observability)?;

    let topology = Arc::new(topology);
    let broker: Arc<dyn broker::BrokerApi> = Arc::new(HttpBrokerClient::new(
        &config.broker,
        &topology.nodes,
        config.restart.timeouts.api_timeout,
    )?);
    let ssh: Arc<dyn CommandRunner> = Arc::new(SshExecutor::new(config.ssh.clone()));
    let service = ServiceController::new(Arc::clone(&ssh), config.restart.service_name.clone());
    let events = Arc::new(EventBus::new());

    let orchestrator = Arc::new(RestartOrchestrator::new(
        Arc::clone(&broker),
        service.clone(),
        Arc::clone(&topology),
        config.restart.clone(),
        Arc::clone(&events),
    ));

    let state = ApiState {
        orchestrator: Arc::clone(&orchestrator),
        reporter: StatusReporter::new(Arc::clone(&orchestrator)),
        validator: ClusterValidator::new(Arc::clone(&broker), Arc::clone(&topology)),
        broker,
        service,
        topology,
        events,
        api_key: config.api.api_key.clone(),
    };

    if state.api_key.is_none() {
        warn!("No API key configured; write endpoints are unauthenticated");
    }

    let shutdown = Shutdown::new();

    let metrics_handle = if config.observability.metrics_enabled {
        let obs_config = config.observability.clone();
        Some(tokio::spawn(async move {
            if let Err(e) = observability::run_metrics_server(obs_config).await {
                error!("Metrics server error: {}", e);
            }
        }))
    } else {
        None
    };

    shutdown.listen_for_signals(Arc::clone(&orchestrator));

    let shutdown_wait = {
        let shutdown = shutdown.clone();
        async move { shutdown.wait().await }
    };

    api::run_server(state, config.api.bind_addr, shutdown_wait).await?;

    info!("Shutting down Conductor gracefully...");

    // All pooled SSH sessions are disposed on termination.
    ssh.dispose().await;

    if let Some(handle) = metrics_handle {
        if !handle.is_finished() {
            handle.abort();
        }
    }

    info!("Conductor shutdown complete");
    Ok(())
}
