//! Cluster-wide health validation and restart admission.

use crate::broker::BrokerApi;
use crate::config::RestartConfig;
use crate::error::Result;
use crate::health::{self, NodeHealth};
use crate::types::{ClusterTopology, NodeId};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, warn};

/// Health of one node within a cluster report.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeHealthSummary {
    pub id: NodeId,
    pub name: String,
    pub reachable: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub health: Option<NodeHealth>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Aggregated cluster health across all topology nodes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterHealthReport {
    pub healthy: bool,
    pub total_nodes: usize,
    pub healthy_nodes: usize,
    pub all_nodes_healthy: bool,
    pub can_start_rolling_restart: bool,
    pub issues: Vec<String>,
    pub nodes: Vec<NodeHealthSummary>,
}

/// The admission verdict for a rolling restart.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationVerdict {
    pub can_restart: bool,
    pub reasons: Vec<String>,
    pub total_nodes: usize,
    pub healthy_nodes: usize,
    pub all_nodes_healthy: bool,
}

/// Composes the broker client and health evaluator across the topology.
#[derive(Clone)]
pub struct ClusterValidator {
    broker: Arc<dyn BrokerApi>,
    topology: Arc<ClusterTopology>,
}

impl ClusterValidator {
    pub fn new(broker: Arc<dyn BrokerApi>, topology: Arc<ClusterTopology>) -> Self {
        Self { broker, topology }
    }

    /// Evaluate every node plus cluster-wide alarm and partition state.
    pub async fn validate_cluster_health(&self) -> Result<ClusterHealthReport> {
        let mut issues = Vec::new();
        let mut nodes = Vec::new();
        let mut healthy_nodes = 0usize;
        let total_nodes = self.topology.nodes.len();

        for node in &self.topology.nodes {
            match self.broker.check_node_health(node).await {
                Ok(node_health) => {
                    if node_health.is_healthy {
                        healthy_nodes += 1;
                    } else {
                        issues.extend(node_health.issues.iter().cloned());
                    }
                    nodes.push(NodeHealthSummary {
                        id: node.id.clone(),
                        name: node.name.clone(),
                        reachable: true,
                        health: Some(node_health),
                        error: None,
                    });
                }
                Err(e) => {
                    warn!(node = %node.name, error = %e, "Node health check failed");
                    issues.push(format!("node {}: {}", node.name, e));
                    nodes.push(NodeHealthSummary {
                        id: node.id.clone(),
                        name: node.name.clone(),
                        reachable: false,
                        health: None,
                        error: Some(e.to_string()),
                    });
                }
            }
        }

        match self.broker.get_alarms().await {
            Ok(alarms) => {
                let critical = health::critical_alarms(&alarms);
                if !critical.is_empty() {
                    let described: Vec<String> = critical
                        .iter()
                        .map(|a| format!("{} on {}", a.alarm, a.node))
                        .collect();
                    issues.push(format!("Critical alarms: {}", described.join(", ")));
                }
            }
            Err(e) => issues.push(format!("alarm check failed: {}", e)),
        }

        match self.broker.get_partitions().await {
            Ok(partitions) if !partitions.is_empty() => {
                let described: Vec<String> = partitions
                    .iter()
                    .map(|(node, peers)| format!("{} cannot reach {}", node, peers.join(", ")))
                    .collect();
                issues.push(format!(
                    "Network partitions detected: {}",
                    described.join("; ")
                ));
            }
            Ok(_) => {}
            Err(e) => issues.push(format!("partition check failed: {}", e)),
        }

        let healthy = issues.is_empty();
        let all_nodes_healthy = healthy_nodes == total_nodes && total_nodes > 0;

        crate::observability::update_cluster_metrics(total_nodes, healthy_nodes);
        debug!(
            total_nodes,
            healthy_nodes,
            issue_count = issues.len(),
            "Cluster health evaluated"
        );

        Ok(ClusterHealthReport {
            healthy,
            total_nodes,
            healthy_nodes,
            all_nodes_healthy,
            can_start_rolling_restart: healthy && all_nodes_healthy,
            issues,
            nodes,
        })
    }

    /// Rolling-restart admission: the stricter gate in front of `start`.
    ///
    /// Denies whenever the cluster-health verdict would: every issue the
    /// health report raises blocks admission, except that
    /// `allow_restart_with_partitions` tolerates partition findings (both
    /// the cluster-wide map and nodes unhealthy solely because of a
    /// partition), and `require_all_nodes_healthy = false` tolerates
    /// individually unhealthy nodes.
    pub async fn validate_rolling_restart(
        &self,
        config: &RestartConfig,
    ) -> Result<ValidationVerdict> {
        let mut reasons = Vec::new();

        if !config.enable_rolling_restart {
            reasons.push("rolling restart is disabled by configuration".to_string());
        }

        let total = self.topology.nodes.len();
        if total < 2 {
            reasons.push(format!(
                "rolling restart requires at least 2 nodes, topology has {}",
                total
            ));
        }

        let report = self.validate_cluster_health().await?;
        let tolerate_partitions = config.allow_restart_with_partitions;

        // Per-node admissibility. A node unhealthy only because it reports
        // a partition counts as admissible when partitions are tolerated.
        let mut admissible_nodes = 0usize;
        let mut node_issues = Vec::new();
        for summary in &report.nodes {
            match &summary.health {
                Some(health) if health.is_healthy => admissible_nodes += 1,
                Some(health) if tolerate_partitions && health.healthy_ignoring_partitions() => {
                    admissible_nodes += 1;
                }
                Some(health) => node_issues.extend(health.issues.iter().cloned()),
                None => node_issues.push(format!(
                    "node {}: {}",
                    summary.name,
                    summary.error.as_deref().unwrap_or("unreachable")
                )),
            }
        }

        // Cluster-level findings deny in both modes: critical alarms, the
        // partitions map (unless tolerated), and failed observations.
        for issue in &report.issues {
            let is_partition_finding = issue.starts_with("Network partitions detected");
            let is_cluster_level = issue.starts_with("Critical alarms")
                || is_partition_finding
                || issue.starts_with("alarm check failed")
                || issue.starts_with("partition check failed");
            if is_cluster_level && !(is_partition_finding && tolerate_partitions) {
                reasons.push(issue.clone());
            }
        }

        if config.require_all_nodes_healthy && admissible_nodes < report.total_nodes {
            reasons.push(format!(
                "all nodes must be healthy: {}/{} healthy",
                admissible_nodes, report.total_nodes
            ));
            reasons.extend(node_issues);
        }

        Ok(ValidationVerdict {
            can_restart: reasons.is_empty(),
            reasons,
            total_nodes: report.total_nodes,
            healthy_nodes: report.healthy_nodes,
            all_nodes_healthy: report.all_nodes_healthy,
        })
    }
}
