//! Core types shared across Conductor.

use crate::error::{ConductorError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;

/// Stable identifier of a broker node within the topology.
pub type NodeId = String;

/// A single broker node in the cluster topology.
///
/// Immutable within one configuration epoch; reloaded only with the
/// topology file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Node {
    /// Stable node identifier, unique across the topology.
    pub id: NodeId,
    /// Human-readable node name (typically the Erlang node name).
    pub name: String,
    /// Host IP address.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_ip: Option<String>,
    /// Hostname, used when no IP is configured.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    /// Broker protocol (AMQP) port.
    pub port: u16,
    /// Management HTTP API port.
    pub management_port: u16,
    /// SSH port on the host.
    #[serde(default = "default_ssh_port")]
    pub ssh_port: u16,
    /// Global restart ordering, ascending and unique across nodes.
    pub config_order: i64,
}

fn default_ssh_port() -> u16 {
    22
}

impl Node {
    /// The address used to reach this host: IP if configured, else hostname.
    pub fn host(&self) -> &str {
        self.host_ip
            .as_deref()
            .or(self.hostname.as_deref())
            .unwrap_or_default()
    }

    /// Base URL of this node's own management API endpoint.
    pub fn management_base(&self) -> String {
        format!("http://{}:{}", self.host(), self.management_port)
    }
}

/// Per-topology restart tuning carried in the topology file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RestartDefaults {
    /// Seconds to wait for a node to come back healthy after restart.
    pub node_startup_timeout: u64,
    /// Seconds between health polls while waiting.
    pub health_check_interval: u64,
}

impl Default for RestartDefaults {
    fn default() -> Self {
        Self {
            node_startup_timeout: 180,
            health_check_interval: 10,
        }
    }
}

/// The cluster topology: an ordered set of nodes plus restart tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterTopology {
    /// Cluster display name.
    pub cluster_name: String,
    /// Topology file schema version.
    #[serde(default)]
    pub version: String,
    /// Cluster nodes. Always sorted by `config_order` after loading.
    pub nodes: Vec<Node>,
    /// Restart tuning defaults.
    #[serde(default)]
    pub restart_config: RestartDefaults,
}

impl ClusterTopology {
    /// Load and validate a topology from a YAML file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            ConductorError::Topology(format!("failed to read {}: {}", path.display(), e))
        })?;
        Self::from_yaml(&content)
    }

    /// Parse and validate a topology from YAML text.
    pub fn from_yaml(content: &str) -> Result<Self> {
        let mut topology: Self = serde_yaml::from_str(content)?;
        topology.validate()?;
        topology.nodes.sort_by_key(|n| n.config_order);
        Ok(topology)
    }

    /// Validate topology invariants.
    ///
    /// Rejects missing id/name/host, duplicate ids, names or config orders,
    /// and out-of-range ports.
    pub fn validate(&self) -> Result<()> {
        if self.nodes.is_empty() {
            return Err(ConductorError::Topology("topology has no nodes".into()));
        }

        let mut ids = HashSet::new();
        let mut names = HashSet::new();
        let mut orders = HashSet::new();

        for node in &self.nodes {
            if node.id.is_empty() {
                return Err(ConductorError::Topology("node with empty id".into()));
            }
            if node.name.is_empty() {
                return Err(ConductorError::Topology(format!(
                    "node {} has an empty name",
                    node.id
                )));
            }
            if node.host().is_empty() {
                return Err(ConductorError::Topology(format!(
                    "node {} has neither hostIp nor hostname",
                    node.id
                )));
            }
            for (label, port) in [
                ("port", node.port),
                ("managementPort", node.management_port),
                ("sshPort", node.ssh_port),
            ] {
                if port == 0 {
                    return Err(ConductorError::Topology(format!(
                        "node {}: {} must be in 1..65535",
                        node.id, label
                    )));
                }
            }
            if !ids.insert(node.id.as_str()) {
                return Err(ConductorError::Topology(format!(
                    "duplicate node id: {}",
                    node.id
                )));
            }
            if !names.insert(node.name.as_str()) {
                return Err(ConductorError::Topology(format!(
                    "duplicate node name: {}",
                    node.name
                )));
            }
            if !orders.insert(node.config_order) {
                return Err(ConductorError::Topology(format!(
                    "duplicate configOrder: {}",
                    node.config_order
                )));
            }
        }

        Ok(())
    }

    /// Nodes in restart order (ascending `config_order`).
    pub fn ordered_nodes(&self) -> Vec<Node> {
        let mut nodes = self.nodes.clone();
        nodes.sort_by_key(|n| n.config_order);
        nodes
    }

    /// Look up a node by id.
    pub fn node(&self, id: &str) -> Option<&Node> {
        self.nodes.iter().find(|n| n.id == id)
    }
}

/// Orchestrator phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Idle,
    Preparing,
    Maintenance,
    Draining,
    Restarting,
    Validating,
    Completed,
    Failed,
    Cancelled,
}

impl Phase {
    /// Fixed operator-facing description per phase.
    pub fn description(&self) -> &'static str {
        match self {
            Phase::Idle => "No rolling restart in progress",
            Phase::Preparing => "Preparing node for restart",
            Phase::Maintenance => "Placing node into maintenance mode",
            Phase::Draining => "Draining client connections",
            Phase::Restarting => "Restarting broker service",
            Phase::Validating => "Waiting for node to become healthy",
            Phase::Completed => "Rolling restart completed",
            Phase::Failed => "Rolling restart failed",
            Phase::Cancelled => "Rolling restart cancelled",
        }
    }

    /// Whether this phase is a terminal or idle (inactive) phase.
    pub fn is_inactive(&self) -> bool {
        matches!(
            self,
            Phase::Idle | Phase::Completed | Phase::Failed | Phase::Cancelled
        )
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Phase::Idle => "idle",
            Phase::Preparing => "preparing",
            Phase::Maintenance => "maintenance",
            Phase::Draining => "draining",
            Phase::Restarting => "restarting",
            Phase::Validating => "validating",
            Phase::Completed => "completed",
            Phase::Failed => "failed",
            Phase::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Restart progress counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Progress {
    /// Total nodes in this run.
    pub total: usize,
    /// Nodes fully restarted and validated.
    pub completed: usize,
    /// Name of the node currently being processed.
    pub current: Option<String>,
}

/// The orchestrator's process-wide state record.
///
/// Owned by the orchestrator's single execution context; readers obtain
/// snapshots through a short-held lock.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrchestratorState {
    pub phase: Phase,
    pub is_active: bool,
    pub node_index: usize,
    pub progress: Progress,
    /// Live connection count for the current node, only while draining.
    pub current_node_connections: Option<usize>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub errors: Vec<String>,
    pub cancel_requested: bool,
}

impl Default for OrchestratorState {
    fn default() -> Self {
        Self {
            phase: Phase::Idle,
            is_active: false,
            node_index: 0,
            progress: Progress::default(),
            current_node_connections: None,
            started_at: None,
            completed_at: None,
            errors: Vec::new(),
            cancel_requested: false,
        }
    }
}

impl OrchestratorState {
    /// Reset all fields for a fresh run over `total` nodes.
    pub fn begin_run(&mut self, total: usize) {
        self.phase = Phase::Preparing;
        self.is_active = true;
        self.node_index = 0;
        self.progress = Progress {
            total,
            completed: 0,
            current: None,
        };
        self.current_node_connections = None;
        self.started_at = Some(Utc::now());
        self.completed_at = None;
        self.errors.clear();
        self.cancel_requested = false;
    }
}

/// A recorded phase transition within a node's restart.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseTransition {
    pub phase: Phase,
    pub at: DateTime<Utc>,
}

/// Append-only record of one node's restart within a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeRestartRecord {
    pub node_id: NodeId,
    pub node_name: String,
    pub started_at: DateTime<Utc>,
    pub transitions: Vec<PhaseTransition>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl NodeRestartRecord {
    /// Start a record for a node.
    pub fn begin(node: &Node) -> Self {
        Self {
            node_id: node.id.clone(),
            node_name: node.name.clone(),
            started_at: Utc::now(),
            transitions: Vec::new(),
            completed_at: None,
            duration_ms: None,
            error: None,
        }
    }

    /// Record a phase transition.
    pub fn transition(&mut self, phase: Phase) {
        self.transitions.push(PhaseTransition {
            phase,
            at: Utc::now(),
        });
    }

    /// Close the record successfully.
    pub fn complete(&mut self) {
        let now = Utc::now();
        self.duration_ms = Some((now - self.started_at).num_milliseconds().max(0) as u64);
        self.completed_at = Some(now);
    }

    /// Close the record with an error.
    pub fn fail(&mut self, error: impl Into<String>) {
        let now = Utc::now();
        self.duration_ms = Some((now - self.started_at).num_milliseconds().max(0) as u64);
        self.completed_at = Some(now);
        self.error = Some(error.into());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn topology_yaml() -> &'static str {
        r#"
clusterName: prod-rabbit
version: "1"
nodes:
  - id: rabbit-2
    name: rabbit@host-2
    hostIp: 10.0.0.2
    port: 5672
    managementPort: 15672
    sshPort: 22
    configOrder: 2
  - id: rabbit-1
    name: rabbit@host-1
    hostIp: 10.0.0.1
    port: 5672
    managementPort: 15672
    sshPort: 22
    configOrder: 1
restartConfig:
  nodeStartupTimeout: 120
  healthCheckInterval: 5
"#
    }

    #[test]
    fn test_topology_parses_and_sorts_by_config_order() {
        let topology = ClusterTopology::from_yaml(topology_yaml()).unwrap();
        assert_eq!(topology.cluster_name, "prod-rabbit");
        assert_eq!(topology.nodes.len(), 2);
        assert_eq!(topology.nodes[0].id, "rabbit-1");
        assert_eq!(topology.nodes[1].id, "rabbit-2");
        assert_eq!(topology.restart_config.node_startup_timeout, 120);
    }

    #[test]
    fn test_topology_round_trips_in_restart_order() {
        let topology = ClusterTopology::from_yaml(topology_yaml()).unwrap();
        let orders: Vec<i64> = topology
            .ordered_nodes()
            .iter()
            .map(|n| n.config_order)
            .collect();
        let mut sorted = orders.clone();
        sorted.sort_unstable();
        assert_eq!(orders, sorted);
    }

    #[test]
    fn test_topology_rejects_duplicate_config_order() {
        let yaml = r#"
clusterName: c
nodes:
  - { id: a, name: na, hostIp: 10.0.0.1, port: 5672, managementPort: 15672, configOrder: 1 }
  - { id: b, name: nb, hostIp: 10.0.0.2, port: 5672, managementPort: 15672, configOrder: 1 }
"#;
        let err = ClusterTopology::from_yaml(yaml).unwrap_err();
        assert!(err.to_string().contains("duplicate configOrder"));
    }

    #[test]
    fn test_topology_rejects_missing_host() {
        let yaml = r#"
clusterName: c
nodes:
  - { id: a, name: na, port: 5672, managementPort: 15672, configOrder: 1 }
"#;
        let err = ClusterTopology::from_yaml(yaml).unwrap_err();
        assert!(err.to_string().contains("neither hostIp nor hostname"));
    }

    #[test]
    fn test_topology_rejects_non_numeric_config_order() {
        let yaml = r#"
clusterName: c
nodes:
  - { id: a, name: na, hostIp: h, port: 5672, managementPort: 15672, configOrder: first }
"#;
        assert!(ClusterTopology::from_yaml(yaml).is_err());
    }

    #[test]
    fn test_topology_rejects_zero_port() {
        let yaml = r#"
clusterName: c
nodes:
  - { id: a, name: na, hostIp: h, port: 0, managementPort: 15672, configOrder: 1 }
"#;
        let err = ClusterTopology::from_yaml(yaml).unwrap_err();
        assert!(err.to_string().contains("port"));
    }

    #[test]
    fn test_node_host_prefers_ip() {
        let yaml = r#"
clusterName: c
nodes:
  - id: a
    name: na
    hostIp: 10.0.0.1
    hostname: host-a.internal
    port: 5672
    managementPort: 15672
    configOrder: 1
"#;
        let topology = ClusterTopology::from_yaml(yaml).unwrap();
        assert_eq!(topology.nodes[0].host(), "10.0.0.1");
        assert_eq!(
            topology.nodes[0].management_base(),
            "http://10.0.0.1:15672"
        );
    }

    #[test]
    fn test_phase_descriptions_and_terminality() {
        assert!(Phase::Idle.is_inactive());
        assert!(Phase::Completed.is_inactive());
        assert!(Phase::Failed.is_inactive());
        assert!(Phase::Cancelled.is_inactive());
        assert!(!Phase::Draining.is_inactive());
        assert_eq!(Phase::Draining.description(), "Draining client connections");
        assert_eq!(Phase::Draining.to_string(), "draining");
    }

    #[test]
    fn test_state_begin_run() {
        let mut state = OrchestratorState::default();
        state.errors.push("old".into());
        state.begin_run(3);
        assert!(state.is_active);
        assert_eq!(state.phase, Phase::Preparing);
        assert_eq!(state.progress.total, 3);
        assert_eq!(state.progress.completed, 0);
        assert!(state.errors.is_empty());
        assert!(state.started_at.is_some());
        assert!(state.completed_at.is_none());
    }

    #[test]
    fn test_node_restart_record_lifecycle() {
        let node = Node {
            id: "rabbit-1".into(),
            name: "rabbit@host-1".into(),
            host_ip: Some("10.0.0.1".into()),
            hostname: None,
            port: 5672,
            management_port: 15672,
            ssh_port: 22,
            config_order: 1,
        };

        let mut record = NodeRestartRecord::begin(&node);
        record.transition(Phase::Preparing);
        record.transition(Phase::Draining);
        record.complete();

        assert_eq!(record.transitions.len(), 2);
        assert!(record.completed_at.is_some());
        assert!(record.error.is_none());

        let mut failed = NodeRestartRecord::begin(&node);
        failed.fail("health wait exceeded");
        assert_eq!(failed.error.as_deref(), Some("health wait exceeded"));
    }
}
