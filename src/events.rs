//! Restart event notification.
//!
//! The orchestrator publishes ordered events on an in-process broadcast
//! channel; subscribers are advisory and may lag or drop without blocking
//! orchestration. A bounded in-memory history backs the history endpoint —
//! nothing is persisted.

use crate::types::{NodeRestartRecord, Phase};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use tokio::sync::broadcast;
use tracing::debug;

/// What happened.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum RestartEventKind {
    Started {
        total_nodes: usize,
    },
    PhaseChange {
        phase: Phase,
        #[serde(skip_serializing_if = "Option::is_none")]
        node: Option<String>,
    },
    Progress {
        completed: usize,
        total: usize,
    },
    Completed,
    Failed {
        error: String,
    },
    Cancelled,
}

/// A single restart event.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RestartEvent {
    pub id: String,
    /// Identifier of the run this event belongs to.
    pub run_id: String,
    pub kind: RestartEventKind,
    pub timestamp: DateTime<Utc>,
}

/// Summary of one completed (or terminated) run, kept for the history
/// endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunRecord {
    pub run_id: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub outcome: Phase,
    pub nodes_completed: usize,
    pub nodes_total: usize,
    pub node_records: Vec<NodeRestartRecord>,
    pub errors: Vec<String>,
}

/// Default bound on retained events.
const DEFAULT_EVENT_HISTORY: usize = 1000;

/// Default bound on retained run records.
const DEFAULT_RUN_HISTORY: usize = 50;

/// In-process event bus with bounded history.
pub struct EventBus {
    sender: broadcast::Sender<RestartEvent>,
    events: RwLock<VecDeque<RestartEvent>>,
    runs: RwLock<VecDeque<RunRecord>>,
    event_capacity: usize,
    run_capacity: usize,
}

impl EventBus {
    /// Create a bus with default capacities.
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_EVENT_HISTORY, DEFAULT_RUN_HISTORY)
    }

    /// Create a bus with explicit history bounds.
    pub fn with_capacity(event_capacity: usize, run_capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(event_capacity.max(16));
        Self {
            sender,
            events: RwLock::new(VecDeque::new()),
            runs: RwLock::new(VecDeque::new()),
            event_capacity,
            run_capacity,
        }
    }

    /// Subscribe to the live event stream.
    pub fn subscribe(&self) -> broadcast::Receiver<RestartEvent> {
        self.sender.subscribe()
    }

    /// Publish an event. Never blocks; a missing subscriber is fine.
    pub fn publish(&self, run_id: &str, kind: RestartEventKind) {
        let event = RestartEvent {
            id: uuid::Uuid::new_v4().to_string(),
            run_id: run_id.to_string(),
            kind,
            timestamp: Utc::now(),
        };

        debug!(run_id = %event.run_id, kind = ?event.kind, "Restart event");

        {
            let mut events = self.events.write();
            if events.len() >= self.event_capacity {
                events.pop_front();
            }
            events.push_back(event.clone());
        }

        let _ = self.sender.send(event);
    }

    /// Record a terminated run.
    pub fn record_run(&self, record: RunRecord) {
        let mut runs = self.runs.write();
        if runs.len() >= self.run_capacity {
            runs.pop_front();
        }
        runs.push_back(record);
    }

    /// Most recent events, newest first.
    pub fn recent_events(&self, limit: usize) -> Vec<RestartEvent> {
        self.events
            .read()
            .iter()
            .rev()
            .take(limit)
            .cloned()
            .collect()
    }

    /// Recorded runs, newest first.
    pub fn run_history(&self, limit: usize) -> Vec<RunRecord> {
        self.runs.read().iter().rev().take(limit).cloned().collect()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
