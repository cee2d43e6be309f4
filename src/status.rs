//! Read-only status reporting over the orchestrator state.

use crate::orchestrator::RestartOrchestrator;
use crate::types::{OrchestratorState, Phase, Progress};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Operator-facing status snapshot with derived fields.
///
/// Built from a single consistent [`OrchestratorState`] snapshot; no field
/// is read twice, so values never tear across a concurrent run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusSnapshot {
    pub phase: Phase,
    pub is_active: bool,
    pub progress: Progress,
    pub progress_percent: u32,
    /// Seconds, extrapolated from per-node pace. Absent until the first
    /// node completes.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub estimated_time_remaining: Option<u64>,
    pub phase_description: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub errors: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connections_draining: Option<usize>,
    pub cancel_requested: bool,
}

/// Derive the status snapshot from one state snapshot, at `now`.
pub fn derive(state: &OrchestratorState, now: DateTime<Utc>) -> StatusSnapshot {
    let progress_percent = if state.progress.total == 0 {
        0
    } else {
        ((state.progress.completed as f64 / state.progress.total as f64) * 100.0).round() as u32
    };

    let estimated_time_remaining = match (state.is_active, state.started_at) {
        (true, Some(started_at)) if state.progress.completed > 0 => {
            let elapsed = (now - started_at).num_seconds().max(0) as f64;
            let per_node = elapsed / state.progress.completed as f64;
            let remaining = (state.progress.total - state.progress.completed) as f64;
            Some((per_node * remaining).round() as u64)
        }
        _ => None,
    };

    let connections_draining = if state.phase == Phase::Draining {
        state.current_node_connections
    } else {
        None
    };

    StatusSnapshot {
        phase: state.phase,
        is_active: state.is_active,
        progress: state.progress.clone(),
        progress_percent,
        estimated_time_remaining,
        phase_description: state.phase.description().to_string(),
        started_at: state.started_at,
        completed_at: state.completed_at,
        last_error: state.errors.last().cloned(),
        errors: state.errors.clone(),
        connections_draining,
        cancel_requested: state.cancel_requested,
    }
}

/// Read-only view over a live orchestrator.
#[derive(Clone)]
pub struct StatusReporter {
    orchestrator: Arc<RestartOrchestrator>,
}

impl StatusReporter {
    pub fn new(orchestrator: Arc<RestartOrchestrator>) -> Self {
        Self { orchestrator }
    }

    /// Current status, derived from one consistent state snapshot.
    pub async fn status(&self) -> StatusSnapshot {
        let state = self.orchestrator.state_snapshot().await;
        derive(&state, Utc::now())
    }
}
