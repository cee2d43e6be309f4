//! Admin HTTP API.
//!
//! Thin handlers: validate the request, call into the orchestrator or the
//! clients, return JSON. Write endpoints require an API key (`X-API-Key`
//! header or `apiKey` query parameter); when no key is configured the check
//! is bypassed with a warning.

use crate::broker::BrokerApi;
use crate::error::ConductorError;
use crate::events::EventBus;
use crate::orchestrator::{RestartOptions, RestartOrchestrator, StartOutcome};
use crate::service::ServiceController;
use crate::status::StatusReporter;
use crate::types::{ClusterTopology, Node, Phase};
use crate::validator::ClusterValidator;
use axum::{
    extract::{Path, Query, Request, State},
    http::StatusCode,
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{info, warn};

/// Shared state for all handlers.
#[derive(Clone)]
pub struct ApiState {
    pub orchestrator: Arc<RestartOrchestrator>,
    pub reporter: StatusReporter,
    pub validator: ClusterValidator,
    pub broker: Arc<dyn BrokerApi>,
    pub service: ServiceController,
    pub topology: Arc<ClusterTopology>,
    pub events: Arc<EventBus>,
    pub api_key: Option<String>,
}

/// JSON error body.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reasons: Option<Vec<String>>,
    #[serde(rename = "nodesCompleted", skip_serializing_if = "Option::is_none")]
    pub nodes_completed: Option<usize>,
}

impl ErrorBody {
    fn new(message: impl Into<String>) -> Self {
        Self {
            error: message.into(),
            reasons: None,
            nodes_completed: None,
        }
    }
}

fn error_response(error: &ConductorError) -> Response {
    let status =
        StatusCode::from_u16(error.to_status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let mut body = ErrorBody::new(error.to_string());
    if let ConductorError::AdmissionDenied { reasons } = error {
        body.reasons = Some(reasons.clone());
    }
    (status, Json(body)).into_response()
}

/// Build the admin API router.
pub fn routes(state: ApiState) -> Router {
    let write_routes = Router::new()
        .route("/api/rolling-restart/start", post(start_restart))
        .route("/api/rolling-restart/cancel", post(cancel_restart))
        .route("/api/nodes/:id/maintenance", put(set_node_maintenance))
        .route("/api/nodes/:id/restart", post(node_restart))
        .route("/api/nodes/:id/stop", post(node_stop))
        .route("/api/nodes/:id/start", post(node_start))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            require_api_key,
        ));

    Router::new()
        .merge(write_routes)
        .route("/api/rolling-restart/status", get(restart_status))
        .route("/api/rolling-restart/validate", post(validate_restart))
        .route("/api/rolling-restart/history", get(restart_history))
        .route("/api/cluster/status", get(cluster_status))
        .route("/api/cluster/health", get(cluster_health))
        .route("/api/nodes/:id/queues", get(node_queues))
        .route("/api/nodes/:id/system", get(node_system))
        .route("/health", get(service_health))
        .with_state(state)
}

/// Bind and serve the admin API until shutdown is signalled.
pub async fn run_server(
    state: ApiState,
    bind_addr: std::net::SocketAddr,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> crate::error::Result<()> {
    let app = routes(state);
    let listener = TcpListener::bind(bind_addr).await?;
    info!(addr = %bind_addr, "Admin API listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
        .map_err(|e| ConductorError::Network(e.to_string()))?;

    Ok(())
}

// ============================================================================
// API-key middleware
// ============================================================================

async fn require_api_key(
    State(state): State<ApiState>,
    request: Request,
    next: Next,
) -> Response {
    let Some(expected) = state.api_key.as_deref() else {
        warn!("No API key configured; write endpoint invoked without authentication");
        return next.run(request).await;
    };

    let header_key = request
        .headers()
        .get("x-api-key")
        .and_then(|v| v.to_str().ok());

    let query_key = request.uri().query().and_then(|query| {
        query.split('&').find_map(|pair| {
            pair.strip_prefix("apiKey=")
                .map(|value| value.to_string())
        })
    });

    let presented = header_key.map(str::to_string).or(query_key);
    match presented {
        Some(key) if key == expected => next.run(request).await,
        Some(_) => (
            StatusCode::UNAUTHORIZED,
            Json(ErrorBody::new("invalid API key")),
        )
            .into_response(),
        None => (
            StatusCode::UNAUTHORIZED,
            Json(ErrorBody::new("missing API key")),
        )
            .into_response(),
    }
}

// ============================================================================
// Rolling restart endpoints
// ============================================================================

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct StartResponse {
    success: bool,
    run_id: String,
    outcome: Phase,
    nodes_completed: usize,
    nodes_total: usize,
}

async fn start_restart(
    State(state): State<ApiState>,
    body: Option<Json<RestartOptions>>,
) -> Response {
    let options = body.map(|Json(o)| o).unwrap_or_default();

    if !state.orchestrator.rolling_restart_enabled() {
        return (
            StatusCode::FORBIDDEN,
            Json(ErrorBody::new("rolling restart is disabled by configuration")),
        )
            .into_response();
    }

    match state.orchestrator.start(options).await {
        Ok(StartOutcome::DryRun(plan)) => (StatusCode::OK, Json(plan)).into_response(),
        Ok(StartOutcome::Finished(outcome)) => (
            StatusCode::OK,
            Json(StartResponse {
                success: outcome.outcome == Phase::Completed,
                run_id: outcome.run_id,
                outcome: outcome.outcome,
                nodes_completed: outcome.nodes_completed,
                nodes_total: outcome.nodes_total,
            }),
        )
            .into_response(),
        Err(e) => {
            // A failure inside a started run reports 400 with the node
            // count; pre-start failures map by error class.
            let pre_start = matches!(
                e,
                ConductorError::AdmissionDenied { .. } | ConductorError::RestartInProgress
            );
            let snapshot = state.orchestrator.state_snapshot().await;
            if !pre_start && snapshot.phase == Phase::Failed && !snapshot.errors.is_empty() {
                let mut body = ErrorBody::new(e.to_string());
                body.nodes_completed = Some(snapshot.progress.completed);
                return (StatusCode::BAD_REQUEST, Json(body)).into_response();
            }
            error_response(&e)
        }
    }
}

async fn restart_status(State(state): State<ApiState>) -> Response {
    let status = state.reporter.status().await;
    (StatusCode::OK, Json(status)).into_response()
}

#[derive(Debug, Default, Deserialize)]
struct CancelRequest {
    #[serde(default)]
    reason: Option<String>,
}

async fn cancel_restart(
    State(state): State<ApiState>,
    body: Option<Json<CancelRequest>>,
) -> Response {
    let reason = body.and_then(|Json(r)| r.reason);
    match state.orchestrator.cancel(reason.as_deref()).await {
        Ok(()) => (
            StatusCode::OK,
            Json(serde_json::json!({ "success": true, "cancelRequested": true })),
        )
            .into_response(),
        Err(e) => error_response(&e),
    }
}

async fn validate_restart(State(state): State<ApiState>) -> Response {
    match state.orchestrator.validate_only().await {
        Ok(verdict) => {
            let status = if verdict.can_restart {
                StatusCode::OK
            } else {
                StatusCode::BAD_REQUEST
            };
            (status, Json(verdict)).into_response()
        }
        Err(e) => error_response(&e),
    }
}

async fn restart_history(State(state): State<ApiState>) -> Response {
    let runs = state.events.run_history(50);
    (StatusCode::OK, Json(runs)).into_response()
}

// ============================================================================
// Cluster endpoints
// ============================================================================

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ClusterNodeStatus {
    id: String,
    name: String,
    reachable: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    health: Option<crate::health::NodeHealth>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    connections: usize,
    queues: usize,
}

async fn cluster_status(State(state): State<ApiState>) -> Response {
    let report = match state.validator.validate_cluster_health().await {
        Ok(report) => report,
        Err(e) => return error_response(&e),
    };

    let connections = state.broker.get_connections(None).await.unwrap_or_default();
    let queues = state.broker.get_queues(None).await.unwrap_or_default();

    let nodes: Vec<ClusterNodeStatus> = report
        .nodes
        .into_iter()
        .map(|summary| {
            let connections = connections
                .iter()
                .filter(|c| c.node == summary.name)
                .count();
            let queues = queues.iter().filter(|q| q.node == summary.name).count();
            ClusterNodeStatus {
                id: summary.id,
                name: summary.name,
                reachable: summary.reachable,
                health: summary.health,
                error: summary.error,
                connections,
                queues,
            }
        })
        .collect();

    let body = serde_json::json!({
        "clusterName": state.topology.cluster_name,
        "totalNodes": report.total_nodes,
        "healthyNodes": report.healthy_nodes,
        "allNodesHealthy": report.all_nodes_healthy,
        "issues": report.issues,
        "nodes": nodes,
    });
    (StatusCode::OK, Json(body)).into_response()
}

#[derive(Debug, Default, Deserialize)]
struct ClusterHealthQuery {
    #[serde(default, rename = "checkSSH", alias = "checkSsh")]
    check_ssh: bool,
}

async fn cluster_health(
    State(state): State<ApiState>,
    Query(query): Query<ClusterHealthQuery>,
) -> Response {
    let report = match state.validator.validate_cluster_health().await {
        Ok(report) => report,
        Err(e) => return error_response(&e),
    };

    let probes = state.broker.test_connectivity(&state.topology.nodes).await;
    let reachable = probes.iter().filter(|p| p.connected).count();

    let ssh_probes = if query.check_ssh {
        let mut results = HashMap::new();
        for node in &state.topology.nodes {
            let outcome = state.service.probe(node).await;
            results.insert(node.id.clone(), outcome.is_ok());
        }
        Some(results)
    } else {
        None
    };

    let status = if reachable == probes.len() && !probes.is_empty() {
        StatusCode::OK
    } else if reachable > 0 {
        StatusCode::MULTI_STATUS
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    let body = serde_json::json!({
        "healthy": report.healthy,
        "canStartRollingRestart": report.can_start_rolling_restart,
        "totalNodes": report.total_nodes,
        "healthyNodes": report.healthy_nodes,
        "issues": report.issues,
        "connectivity": probes,
        "ssh": ssh_probes,
    });
    (status, Json(body)).into_response()
}

// ============================================================================
// Per-node endpoints
// ============================================================================

fn find_node(state: &ApiState, id: &str) -> Result<Node, ConductorError> {
    state
        .topology
        .node(id)
        .cloned()
        .ok_or_else(|| ConductorError::NodeNotFound(id.to_string()))
}

#[derive(Debug, Deserialize)]
struct MaintenanceRequest {
    maintenance: bool,
    #[serde(default)]
    reason: Option<String>,
}

async fn set_node_maintenance(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    Json(request): Json<MaintenanceRequest>,
) -> Response {
    let node = match find_node(&state, &id) {
        Ok(node) => node,
        Err(e) => return error_response(&e),
    };

    let reason = request.reason.as_deref().unwrap_or("operator request");
    match state
        .broker
        .set_maintenance_mode(&node, request.maintenance, reason)
        .await
    {
        Ok(ack) => (StatusCode::OK, Json(ack)).into_response(),
        Err(e) => error_response(&e),
    }
}

#[derive(Debug, Default, Deserialize)]
struct NodeOpRequest {
    #[serde(default)]
    reason: Option<String>,
}

enum NodeOp {
    Restart,
    Stop,
    Start,
}

async fn run_node_op(state: ApiState, id: String, op: NodeOp, reason: Option<String>) -> Response {
    let node = match find_node(&state, &id) {
        Ok(node) => node,
        Err(e) => return error_response(&e),
    };

    // Single-node operations are refused while a rolling restart owns the
    // hosts.
    if state.orchestrator.is_active() {
        return error_response(&ConductorError::RestartInProgress);
    }

    info!(
        node = %node.name,
        reason = reason.as_deref().unwrap_or("unspecified"),
        "Single-node operation requested"
    );

    let result = match op {
        NodeOp::Restart => state.service.restart(&node).await,
        NodeOp::Stop => state.service.stop(&node).await,
        NodeOp::Start => state.service.start(&node).await,
    };

    match result {
        Ok(()) => (
            StatusCode::OK,
            Json(serde_json::json!({ "success": true, "node": node.name })),
        )
            .into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(ErrorBody::new(e.to_string())),
        )
            .into_response(),
    }
}

async fn node_restart(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    body: Option<Json<NodeOpRequest>>,
) -> Response {
    let reason = body.and_then(|Json(r)| r.reason);
    run_node_op(state, id, NodeOp::Restart, reason).await
}

async fn node_stop(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    body: Option<Json<NodeOpRequest>>,
) -> Response {
    let reason = body.and_then(|Json(r)| r.reason);
    run_node_op(state, id, NodeOp::Stop, reason).await
}

async fn node_start(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    body: Option<Json<NodeOpRequest>>,
) -> Response {
    let reason = body.and_then(|Json(r)| r.reason);
    run_node_op(state, id, NodeOp::Start, reason).await
}

async fn node_queues(State(state): State<ApiState>, Path(id): Path<String>) -> Response {
    let node = match find_node(&state, &id) {
        Ok(node) => node,
        Err(e) => return error_response(&e),
    };

    match state.broker.get_queues(Some(&node)).await {
        Ok(queues) => (StatusCode::OK, Json(queues)).into_response(),
        Err(e) => error_response(&e),
    }
}

async fn node_system(State(state): State<ApiState>, Path(id): Path<String>) -> Response {
    let node = match find_node(&state, &id) {
        Ok(node) => node,
        Err(e) => return error_response(&e),
    };

    match state.service.system_info(&node).await {
        Ok(info) => (StatusCode::OK, Json(info)).into_response(),
        Err(e) => error_response(&e),
    }
}

// ============================================================================
// Service health
// ============================================================================

async fn service_health() -> Response {
    (
        StatusCode::OK,
        Json(serde_json::json!({
            "status": "ok",
            "version": env!("CARGO_PKG_VERSION"),
        })),
    )
        .into_response()
}
