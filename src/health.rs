//! Node health evaluation.
//!
//! A pure derivation from raw broker counters and the alarm list to a
//! boolean verdict plus a human-readable issue list. Recomputed on every
//! check; nothing here is cached.

use crate::broker::{Alarm, NodeInfo};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Memory usage above this percentage disqualifies a node.
pub const MEMORY_PERCENT_MAX: u64 = 90;

/// Free disk below this many GiB disqualifies a node.
pub const DISK_FREE_GB_MIN: u64 = 1;

/// File-descriptor usage above this percentage disqualifies a node.
pub const FD_PERCENT_MAX: u64 = 95;

/// Alarm kinds that disqualify the whole cluster from restart admission.
pub const CRITICAL_ALARMS: [&str; 3] = ["memory_alarm", "disk_alarm", "file_descriptor_alarm"];

/// Derived health of a single node at one point in time.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeHealth {
    pub running: bool,
    pub memory_percent: u64,
    pub disk_free_gb: u64,
    pub fd_percent: u64,
    /// Peers this node reports it cannot reach.
    pub partitions: Vec<String>,
    /// Alarms attributed to this node.
    pub alarms: Vec<Alarm>,
    pub is_healthy: bool,
    /// Violated predicates, in check order, as human strings.
    pub issues: Vec<String>,
    pub last_check: DateTime<Utc>,
}

impl NodeHealth {
    /// Whether the node meets every health predicate except the partition
    /// check. Used by admission when partitions are explicitly tolerated.
    pub fn healthy_ignoring_partitions(&self) -> bool {
        self.running
            && self.alarms.is_empty()
            && self.memory_percent <= MEMORY_PERCENT_MAX
            && self.disk_free_gb >= DISK_FREE_GB_MIN
            && self.fd_percent <= FD_PERCENT_MAX
    }
}

/// Percentage of `used` against `limit`, rounded; 0 when the limit is 0.
fn percent(used: u64, limit: u64) -> u64 {
    if limit == 0 {
        return 0;
    }
    ((used as f64 / limit as f64) * 100.0).round() as u64
}

/// Derive [`NodeHealth`] from raw counters and the cluster alarm list.
pub fn evaluate(info: &NodeInfo, alarms: &[Alarm]) -> NodeHealth {
    let memory_percent = percent(info.mem_used, info.mem_limit);
    let disk_free_gb = info.disk_free / (1 << 30);
    let fd_percent = percent(info.fd_used, info.fd_total);

    let node_alarms: Vec<Alarm> = alarms
        .iter()
        .filter(|a| a.node == info.name)
        .cloned()
        .collect();

    let mut issues = Vec::new();
    if !info.running {
        issues.push(format!("node {} is not running", info.name));
    }
    if !info.partitions.is_empty() {
        issues.push(format!(
            "node {} reports partitions from: {}",
            info.name,
            info.partitions.join(", ")
        ));
    }
    if !node_alarms.is_empty() {
        let kinds: Vec<&str> = node_alarms.iter().map(|a| a.alarm.as_str()).collect();
        issues.push(format!(
            "node {} has active alarms: {}",
            info.name,
            kinds.join(", ")
        ));
    }
    if memory_percent > MEMORY_PERCENT_MAX {
        issues.push(format!(
            "node {} memory usage {}% exceeds {}%",
            info.name, memory_percent, MEMORY_PERCENT_MAX
        ));
    }
    if disk_free_gb < DISK_FREE_GB_MIN {
        issues.push(format!(
            "node {} has {}GB free disk, below {}GB",
            info.name, disk_free_gb, DISK_FREE_GB_MIN
        ));
    }
    if fd_percent > FD_PERCENT_MAX {
        issues.push(format!(
            "node {} file descriptor usage {}% exceeds {}%",
            info.name, fd_percent, FD_PERCENT_MAX
        ));
    }

    NodeHealth {
        running: info.running,
        memory_percent,
        disk_free_gb,
        fd_percent,
        partitions: info.partitions.clone(),
        alarms: node_alarms,
        is_healthy: issues.is_empty(),
        issues,
        last_check: Utc::now(),
    }
}

/// The subset of alarms whose kind disqualifies restart admission.
pub fn critical_alarms(alarms: &[Alarm]) -> Vec<&Alarm> {
    alarms
        .iter()
        .filter(|a| CRITICAL_ALARMS.contains(&a.alarm.as_str()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn healthy_info() -> NodeInfo {
        NodeInfo {
            name: "rabbit@host-1".to_string(),
            running: true,
            mem_used: 512 * (1 << 20),
            mem_limit: 4 * (1 << 30),
            disk_free: 50 * (1 << 30),
            disk_free_limit: 1 << 30,
            fd_used: 200,
            fd_total: 65536,
            sockets_used: 10,
            sockets_total: 58890,
            partitions: vec![],
            uptime: 86_400_000,
        }
    }

    #[test]
    fn test_healthy_node() {
        let health = evaluate(&healthy_info(), &[]);
        assert!(health.is_healthy);
        assert!(health.issues.is_empty());
        assert_eq!(health.memory_percent, 13);
        assert_eq!(health.disk_free_gb, 50);
        assert_eq!(health.fd_percent, 0);
    }

    #[test]
    fn test_not_running_is_first_issue() {
        let mut info = healthy_info();
        info.running = false;
        let health = evaluate(&info, &[]);
        assert!(!health.is_healthy);
        assert!(health.issues[0].contains("not running"));
    }

    #[test]
    fn test_zero_limits_do_not_divide() {
        let mut info = healthy_info();
        info.mem_limit = 0;
        info.fd_total = 0;
        let health = evaluate(&info, &[]);
        assert_eq!(health.memory_percent, 0);
        assert_eq!(health.fd_percent, 0);
    }

    #[test]
    fn test_memory_threshold_boundary() {
        let mut info = healthy_info();
        // exactly 90% is still healthy
        info.mem_limit = 100;
        info.mem_used = 90;
        assert!(evaluate(&info, &[]).is_healthy);
        // 91% is not
        info.mem_used = 91;
        let health = evaluate(&info, &[]);
        assert!(!health.is_healthy);
        assert!(health.issues[0].contains("memory usage 91%"));
    }

    #[test]
    fn test_disk_floor_and_threshold() {
        let mut info = healthy_info();
        // 1.9 GiB floors to 1 GB, which meets the minimum
        info.disk_free = (1 << 30) + (1 << 29) + (1 << 28);
        assert!(evaluate(&info, &[]).is_healthy);
        // just under 1 GiB floors to 0
        info.disk_free = (1 << 30) - 1;
        let health = evaluate(&info, &[]);
        assert!(!health.is_healthy);
        assert_eq!(health.disk_free_gb, 0);
    }

    #[test]
    fn test_alarms_scoped_to_node() {
        let alarms = vec![
            Alarm {
                alarm: "memory_alarm".into(),
                node: "rabbit@host-2".into(),
            },
            Alarm {
                alarm: "disk_alarm".into(),
                node: "rabbit@host-1".into(),
            },
        ];
        let health = evaluate(&healthy_info(), &alarms);
        assert!(!health.is_healthy);
        assert_eq!(health.alarms.len(), 1);
        assert_eq!(health.alarms[0].alarm, "disk_alarm");
    }

    #[test]
    fn test_partitions_disqualify() {
        let mut info = healthy_info();
        info.partitions = vec!["rabbit@host-3".into()];
        let health = evaluate(&info, &[]);
        assert!(!health.is_healthy);
        assert!(health.issues[0].contains("partitions"));
    }

    #[test]
    fn test_issue_ordering_matches_check_order() {
        let mut info = healthy_info();
        info.running = false;
        info.partitions = vec!["rabbit@host-2".into()];
        info.mem_limit = 100;
        info.mem_used = 99;
        let health = evaluate(&info, &[]);
        assert!(health.issues[0].contains("not running"));
        assert!(health.issues[1].contains("partitions"));
        assert!(health.issues[2].contains("memory"));
    }

    #[test]
    fn test_healthy_ignoring_partitions() {
        // Unhealthy only because of a partition.
        let mut info = healthy_info();
        info.partitions = vec!["rabbit@host-2".into()];
        let health = evaluate(&info, &[]);
        assert!(!health.is_healthy);
        assert!(health.healthy_ignoring_partitions());

        // Partitioned and not running: not tolerable.
        info.running = false;
        let health = evaluate(&info, &[]);
        assert!(!health.healthy_ignoring_partitions());

        // A fully healthy node trivially qualifies.
        let health = evaluate(&healthy_info(), &[]);
        assert!(health.healthy_ignoring_partitions());
    }

    #[test]
    fn test_critical_alarm_subset() {
        let alarms = vec![
            Alarm {
                alarm: "memory_alarm".into(),
                node: "a".into(),
            },
            Alarm {
                alarm: "some_informational_alarm".into(),
                node: "a".into(),
            },
            Alarm {
                alarm: "file_descriptor_alarm".into(),
                node: "b".into(),
            },
        ];
        let critical = critical_alarms(&alarms);
        assert_eq!(critical.len(), 2);
        assert_eq!(critical[0].alarm, "memory_alarm");
        assert_eq!(critical[1].alarm, "file_descriptor_alarm");
    }
}
