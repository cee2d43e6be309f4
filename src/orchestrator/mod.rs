//! The rolling restart orchestrator.
//!
//! A single-writer state machine: at most one run is active, all phase work
//! executes sequentially in the caller's task, and status readers obtain
//! consistent snapshots through a short-held lock. Cancellation is observed
//! at phase boundaries and poll ticks; in-flight SSH and HTTP calls are not
//! interrupted.

use crate::broker::BrokerApi;
use crate::config::{RestartConfig, FORCE_CLOSE_HARD_CAP};
use crate::error::{ConductorError, Result};
use crate::events::{EventBus, RestartEventKind, RunRecord};
use crate::service::ServiceController;
use crate::types::{ClusterTopology, Node, NodeRestartRecord, OrchestratorState, Phase};
use crate::validator::{ClusterValidator, ValidationVerdict};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::{error, info, warn};

// ============================================================================
// Options and outcomes
// ============================================================================

/// Options accepted by `start`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RestartOptions {
    /// Plan only: return the node sequence without touching state.
    pub dry_run: bool,
    /// Bypass admission. Honored only when `skip_validation` is also set.
    pub force: bool,
    /// Second half of the dual-key admission bypass.
    pub skip_validation: bool,
    /// Operator-supplied reason, recorded in logs.
    pub reason: Option<String>,
}

/// The plan returned by a dry run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DryRunPlan {
    pub dry_run: bool,
    pub nodes: Vec<String>,
    pub estimated_duration: String,
}

/// How a live run ended.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunOutcome {
    pub run_id: String,
    pub outcome: Phase,
    pub nodes_completed: usize,
    pub nodes_total: usize,
}

/// Result of `start`.
#[derive(Debug, Clone)]
pub enum StartOutcome {
    DryRun(DryRunPlan),
    Finished(RunOutcome),
}

/// How a polling loop ended.
enum LoopEnd {
    Done,
    Cancelled,
}

/// How the whole node sequence ended.
enum RunEnd {
    Completed,
    Cancelled,
}

/// How one node's sub-machine ended.
enum NodeEnd {
    Completed,
    Cancelled,
    Failed(ConductorError),
}

// ============================================================================
// Orchestrator
// ============================================================================

/// The rolling restart state machine.
pub struct RestartOrchestrator {
    broker: Arc<dyn BrokerApi>,
    service: ServiceController,
    validator: ClusterValidator,
    topology: Arc<ClusterTopology>,
    config: RestartConfig,
    events: Arc<EventBus>,
    state: RwLock<OrchestratorState>,
    /// The active slot. Exactly one run may hold it.
    active: AtomicBool,
    cancel_requested: AtomicBool,
}

impl RestartOrchestrator {
    pub fn new(
        broker: Arc<dyn BrokerApi>,
        service: ServiceController,
        topology: Arc<ClusterTopology>,
        config: RestartConfig,
        events: Arc<EventBus>,
    ) -> Self {
        let validator = ClusterValidator::new(Arc::clone(&broker), Arc::clone(&topology));
        Self {
            broker,
            service,
            validator,
            topology,
            config,
            events,
            state: RwLock::new(OrchestratorState::default()),
            active: AtomicBool::new(false),
            cancel_requested: AtomicBool::new(false),
        }
    }

    /// Whether a run currently holds the active slot.
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// Whether the configuration gate permits rolling restarts at all.
    pub fn rolling_restart_enabled(&self) -> bool {
        self.config.enable_rolling_restart
    }

    /// Consistent snapshot of the orchestrator state.
    pub async fn state_snapshot(&self) -> OrchestratorState {
        self.state.read().await.clone()
    }

    /// Admission preview without starting anything.
    pub async fn validate_only(&self) -> Result<ValidationVerdict> {
        self.validator.validate_rolling_restart(&self.config).await
    }

    /// Request cancellation of the active run.
    ///
    /// Returns immediately; the run observes the flag at its next phase
    /// boundary or poll tick. Idempotent while a run is active; an error
    /// once no run is.
    pub async fn cancel(&self, reason: Option<&str>) -> Result<()> {
        if !self.is_active() {
            return Err(ConductorError::NoActiveRestart);
        }
        info!(reason = reason.unwrap_or("unspecified"), "Cancellation requested");
        self.cancel_requested.store(true, Ordering::SeqCst);
        self.state.write().await.cancel_requested = true;
        Ok(())
    }

    /// Run a rolling restart (or plan one, with `dry_run`).
    ///
    /// Executes the entire restart in the caller's task; the future
    /// resolves when the run reaches a terminal phase.
    pub async fn start(&self, options: RestartOptions) -> Result<StartOutcome> {
        if self.is_active() {
            return Err(ConductorError::RestartInProgress);
        }

        // Dual-key bypass: `force` alone is ignored.
        let bypass_admission = options.force && options.skip_validation;
        if bypass_admission {
            warn!("Admission bypassed (force + skipValidation)");
        } else {
            let verdict = self.validator.validate_rolling_restart(&self.config).await?;
            if !verdict.can_restart {
                return Err(ConductorError::AdmissionDenied {
                    reasons: verdict.reasons,
                });
            }
        }

        let nodes = self.topology.ordered_nodes();

        if options.dry_run {
            return Ok(StartOutcome::DryRun(DryRunPlan {
                dry_run: true,
                nodes: nodes.iter().map(|n| n.name.clone()).collect(),
                estimated_duration: format_minutes(estimate_duration(
                    &self.config.timeouts,
                    nodes.len(),
                )),
            }));
        }

        // Acquire the active slot; losers of the race fail fast.
        if self
            .active
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(ConductorError::RestartInProgress);
        }
        self.cancel_requested.store(false, Ordering::SeqCst);

        let run_id = uuid::Uuid::new_v4().to_string();
        info!(
            run_id = %run_id,
            nodes = nodes.len(),
            reason = options.reason.as_deref().unwrap_or("unspecified"),
            "Rolling restart starting"
        );

        self.state.write().await.begin_run(nodes.len());
        crate::observability::record_restart_active(true);
        self.events.publish(
            &run_id,
            RestartEventKind::Started {
                total_nodes: nodes.len(),
            },
        );

        let mut node_records = Vec::with_capacity(nodes.len());
        let result = self.run_nodes(&run_id, &nodes, &mut node_records).await;

        // Terminal transition; exception-safe slot release in all paths.
        let outcome = self
            .finish_run(&run_id, result, node_records, nodes.len())
            .await;
        crate::observability::record_restart_active(false);
        self.active.store(false, Ordering::SeqCst);

        match outcome {
            Ok(run_outcome) => Ok(StartOutcome::Finished(run_outcome)),
            Err(e) => Err(e),
        }
    }

    /// Process every node in ascending `config_order`.
    async fn run_nodes(
        &self,
        run_id: &str,
        nodes: &[Node],
        records: &mut Vec<NodeRestartRecord>,
    ) -> Result<RunEnd> {
        for (index, node) in nodes.iter().enumerate() {
            if self.cancelled() {
                return Ok(RunEnd::Cancelled);
            }

            {
                let mut state = self.state.write().await;
                state.node_index = index;
                state.progress.current = Some(node.name.clone());
            }

            let (record, end) = self.run_node(run_id, node).await;
            records.push(record);

            match end {
                NodeEnd::Completed => {
                    let completed = {
                        let mut state = self.state.write().await;
                        state.progress.completed += 1;
                        state.progress.current = None;
                        state.progress.completed
                    };
                    metrics::counter!("conductor_nodes_restarted_total").increment(1);
                    self.events.publish(
                        run_id,
                        RestartEventKind::Progress {
                            completed,
                            total: nodes.len(),
                        },
                    );
                    info!(run_id = %run_id, node = %node.name, completed, total = nodes.len(), "Node restart complete");
                }
                NodeEnd::Cancelled => return Ok(RunEnd::Cancelled),
                NodeEnd::Failed(e) => return Err(e),
            }

            let is_last = index + 1 == nodes.len();
            if !is_last {
                if self.cancelled() {
                    return Ok(RunEnd::Cancelled);
                }
                tokio::time::sleep(self.config.timeouts.inter_node).await;
            }
        }

        Ok(RunEnd::Completed)
    }

    /// Apply the terminal transition and record the run.
    async fn finish_run(
        &self,
        run_id: &str,
        result: Result<RunEnd>,
        node_records: Vec<NodeRestartRecord>,
        total: usize,
    ) -> Result<RunOutcome> {
        let now = Utc::now();
        let (phase, error) = match &result {
            Ok(RunEnd::Completed) => (Phase::Completed, None),
            Ok(RunEnd::Cancelled) => (Phase::Cancelled, None),
            Err(e) => (Phase::Failed, Some(e.to_string())),
        };

        let (completed, started_at, errors) = {
            let mut state = self.state.write().await;
            state.phase = phase;
            state.is_active = false;
            state.completed_at = Some(now);
            state.current_node_connections = None;
            state.progress.current = None;
            if let Some(message) = &error {
                state.errors.push(message.clone());
            }
            (
                state.progress.completed,
                state.started_at.unwrap_or(now),
                state.errors.clone(),
            )
        };

        match phase {
            Phase::Completed => {
                info!(run_id = %run_id, completed, "Rolling restart completed");
                self.events.publish(run_id, RestartEventKind::Completed);
            }
            Phase::Cancelled => {
                warn!(run_id = %run_id, completed, "Rolling restart cancelled");
                self.events.publish(run_id, RestartEventKind::Cancelled);
            }
            _ => {
                let message = error.clone().unwrap_or_default();
                error!(run_id = %run_id, completed, error = %message, "Rolling restart failed");
                self.events
                    .publish(run_id, RestartEventKind::Failed { error: message });
            }
        }

        self.events.record_run(RunRecord {
            run_id: run_id.to_string(),
            started_at,
            ended_at: now,
            outcome: phase,
            nodes_completed: completed,
            nodes_total: total,
            node_records,
            errors,
        });

        match result {
            Ok(_) => Ok(RunOutcome {
                run_id: run_id.to_string(),
                outcome: phase,
                nodes_completed: completed,
                nodes_total: total,
            }),
            Err(e) => Err(e),
        }
    }

    // ========================================================================
    // Per-node sub-machine
    // ========================================================================

    /// Run one node through `preparing → draining → restarting → validating
    /// → pause → cleanup`.
    ///
    /// Once the node has been placed in maintenance mode, every exit path
    /// attempts to revert it before returning.
    async fn run_node(&self, run_id: &str, node: &Node) -> (NodeRestartRecord, NodeEnd) {
        let mut record = NodeRestartRecord::begin(node);

        self.enter_phase(run_id, Phase::Preparing, node, &mut record)
            .await;

        match self
            .broker
            .set_maintenance_mode(node, true, "Rolling restart")
            .await
        {
            Ok(ack) => {
                if let Some(warning) = ack.warning {
                    warn!(node = %node.name, "{}", warning);
                }
            }
            Err(e) => {
                // Maintenance was never entered; nothing to revert.
                record.fail(e.to_string());
                return (record, NodeEnd::Failed(e));
            }
        }

        let steps = self.guarded_node_steps(run_id, node, &mut record).await;

        match steps {
            Ok(LoopEnd::Done) => {
                if let Err(e) = self
                    .broker
                    .set_maintenance_mode(node, false, "Rolling restart completed")
                    .await
                {
                    warn!(node = %node.name, error = %e, "Failed to leave maintenance mode after successful restart");
                }
                record.complete();
                (record, NodeEnd::Completed)
            }
            Ok(LoopEnd::Cancelled) => {
                self.revert_maintenance(node).await;
                record.fail("cancelled");
                (record, NodeEnd::Cancelled)
            }
            Err(e) => {
                self.revert_maintenance(node).await;
                record.fail(e.to_string());
                (record, NodeEnd::Failed(e))
            }
        }
    }

    /// The steps covered by the cleanup invariant. Cancellation is checked
    /// at every phase boundary.
    async fn guarded_node_steps(
        &self,
        run_id: &str,
        node: &Node,
        record: &mut NodeRestartRecord,
    ) -> Result<LoopEnd> {
        if self.cancelled() {
            return Ok(LoopEnd::Cancelled);
        }

        self.enter_phase(run_id, Phase::Draining, node, record).await;
        if let LoopEnd::Cancelled = self.drain_connections(node).await {
            return Ok(LoopEnd::Cancelled);
        }

        if self.cancelled() {
            return Ok(LoopEnd::Cancelled);
        }

        self.enter_phase(run_id, Phase::Restarting, node, record)
            .await;
        self.service.restart(node).await?;

        if self.cancelled() {
            return Ok(LoopEnd::Cancelled);
        }

        self.enter_phase(run_id, Phase::Validating, node, record)
            .await;
        if let LoopEnd::Cancelled = self.wait_for_health(node).await? {
            return Ok(LoopEnd::Cancelled);
        }

        // Idle stabilization before declaring the node done.
        tokio::time::sleep(self.config.timeouts.post_restart_validation).await;

        Ok(LoopEnd::Done)
    }

    /// Best-effort maintenance revert on the failure and cancel paths. A
    /// revert failure is logged and never replaces the original error.
    async fn revert_maintenance(&self, node: &Node) {
        if let Err(e) = self
            .broker
            .set_maintenance_mode(node, false, "cleanup")
            .await
        {
            error!(node = %node.name, error = %e, "Maintenance-mode cleanup failed");
        }
    }

    // ========================================================================
    // Polling loops
    // ========================================================================

    /// Wait for the node's client connections to drain.
    ///
    /// Never fails the restart: the budget elapsing, or an unobservable
    /// count, only shortens or lengthens the wait. With force-close enabled
    /// and a small enough remainder, surviving connections are closed.
    async fn drain_connections(&self, node: &Node) -> LoopEnd {
        let timeouts = &self.config.timeouts;
        let deadline = Instant::now() + timeouts.connection_drain;

        loop {
            if self.cancelled() {
                self.clear_draining().await;
                return LoopEnd::Cancelled;
            }
            if Instant::now() >= deadline {
                break;
            }

            match self.broker.get_connection_count(node).await {
                Ok(count) => {
                    self.state.write().await.current_node_connections = Some(count);
                    if count == 0 {
                        self.clear_draining().await;
                        return LoopEnd::Done;
                    }
                }
                Err(e) => {
                    // Transient observation failure: proceed as if drained.
                    warn!(node = %node.name, error = %e, "Connection count unavailable, proceeding with restart");
                    self.clear_draining().await;
                    return LoopEnd::Done;
                }
            }

            tokio::time::sleep(timeouts.connection_drain_check).await;
        }

        let remaining = self
            .broker
            .get_connection_count(node)
            .await
            .unwrap_or(0);

        if remaining > 0 {
            warn!(
                node = %node.name,
                remaining,
                budget_secs = timeouts.connection_drain.as_secs(),
                "Drain budget elapsed with connections remaining"
            );

            let cap = self.config.force_close_max.min(FORCE_CLOSE_HARD_CAP);
            if self.config.force_close_connections_after_drain && remaining <= cap {
                match self
                    .broker
                    .force_close_node_connections(node, remaining)
                    .await
                {
                    Ok(outcome) => {
                        metrics::counter!("conductor_connections_force_closed_total")
                            .increment(outcome.closed as u64);
                        info!(
                            node = %node.name,
                            closed = outcome.closed,
                            remaining = outcome.remaining,
                            "Force-closed surviving connections"
                        );
                    }
                    Err(e) => {
                        warn!(node = %node.name, error = %e, "Force-close sweep failed")
                    }
                }
            }
        }

        self.clear_draining().await;
        LoopEnd::Done
    }

    /// Wait for the node to report healthy after restart.
    ///
    /// Per-poll errors are tolerated: immediately after `systemctl start`
    /// the management API may still refuse or 5xx while the broker boots.
    async fn wait_for_health(&self, node: &Node) -> Result<LoopEnd> {
        let timeouts = &self.config.timeouts;
        let deadline = Instant::now() + timeouts.node_startup;

        loop {
            if self.cancelled() {
                return Ok(LoopEnd::Cancelled);
            }
            if Instant::now() >= deadline {
                break;
            }

            match self.broker.check_node_health(node).await {
                Ok(health) if health.is_healthy => {
                    info!(node = %node.name, "Node is healthy after restart");
                    return Ok(LoopEnd::Done);
                }
                Ok(health) => {
                    tracing::debug!(node = %node.name, issues = ?health.issues, "Node not yet healthy");
                }
                Err(e) => {
                    tracing::debug!(node = %node.name, error = %e, "Health poll failed, retrying");
                }
            }

            tokio::time::sleep(timeouts.health_check_interval).await;
        }

        Err(ConductorError::HealthWaitExceeded {
            node: node.name.clone(),
            timeout_secs: timeouts.node_startup.as_secs(),
        })
    }

    // ========================================================================
    // Shared state helpers
    // ========================================================================

    fn cancelled(&self) -> bool {
        self.cancel_requested.load(Ordering::SeqCst)
    }

    async fn clear_draining(&self) {
        self.state.write().await.current_node_connections = None;
    }

    async fn enter_phase(
        &self,
        run_id: &str,
        phase: Phase,
        node: &Node,
        record: &mut NodeRestartRecord,
    ) {
        self.state.write().await.phase = phase;
        record.transition(phase);
        self.events.publish(
            run_id,
            RestartEventKind::PhaseChange {
                phase,
                node: Some(node.name.clone()),
            },
        );
    }
}

// ============================================================================
// Duration estimation
// ============================================================================

/// Budget allowance for the stop/kill/start command sequence itself.
const RESTART_COMMAND_ALLOWANCE: Duration = Duration::from_secs(45);

/// Rough wallclock estimate for restarting `node_count` nodes.
///
/// Assumes a full drain, half the startup budget per node, and the fixed
/// pauses; used for dry-run output and operator-facing ETAs.
pub fn estimate_duration(timeouts: &crate::config::Timeouts, node_count: usize) -> Duration {
    if node_count == 0 {
        return Duration::ZERO;
    }
    let per_node = timeouts.connection_drain
        + RESTART_COMMAND_ALLOWANCE
        + timeouts.node_startup / 2
        + timeouts.post_restart_validation;
    per_node * node_count as u32 + timeouts.inter_node * (node_count as u32 - 1)
}

/// Render a duration as whole minutes, rounding up.
pub fn format_minutes(duration: Duration) -> String {
    let minutes = duration.as_secs().div_ceil(60).max(1);
    if minutes == 1 {
        "1 minute".to_string()
    } else {
        format!("{} minutes", minutes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Timeouts;

    #[test]
    fn test_estimate_duration_three_nodes_default_timeouts() {
        let estimate = estimate_duration(&Timeouts::default(), 3);
        // 3 × (60 + 45 + 90 + 30) + 2 × 15 = 705s
        assert_eq!(estimate, Duration::from_secs(705));
        assert_eq!(format_minutes(estimate), "12 minutes");
    }

    #[test]
    fn test_estimate_duration_zero_nodes() {
        assert_eq!(estimate_duration(&Timeouts::default(), 0), Duration::ZERO);
    }

    #[test]
    fn test_format_minutes_rounds_up() {
        assert_eq!(format_minutes(Duration::from_secs(1)), "1 minute");
        assert_eq!(format_minutes(Duration::from_secs(60)), "1 minute");
        assert_eq!(format_minutes(Duration::from_secs(61)), "2 minutes");
        assert_eq!(format_minutes(Duration::from_secs(720)), "12 minutes");
    }

    #[test]
    fn test_restart_options_deserialize_camel_case() {
        let options: RestartOptions =
            serde_json::from_str(r#"{"dryRun": true, "skipValidation": false}"#).unwrap();
        assert!(options.dry_run);
        assert!(!options.skip_validation);
        assert!(!options.force);
    }
}
