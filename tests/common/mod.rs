//! Shared fixtures and scripted fakes for integration tests.

use async_trait::async_trait;
use conductor::broker::{
    Alarm, BrokerApi, Connection, ConnectivityProbe, ForceCloseOutcome, MaintenanceAck, NodeInfo,
    QueueInfo,
};
use conductor::config::{RestartConfig, Timeouts};
use conductor::error::{ConductorError, Result};
use conductor::health::{self, NodeHealth};
use conductor::service::{RestartPauses, ServiceController};
use conductor::ssh::{CommandRunner, ExecOptions};
use conductor::types::{ClusterTopology, Node, RestartDefaults};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

/// Build an N-node topology named a, b, c, ... in config order.
pub fn topology(names: &[&str]) -> Arc<ClusterTopology> {
    let nodes = names
        .iter()
        .enumerate()
        .map(|(i, name)| Node {
            id: format!("node-{}", name),
            name: name.to_string(),
            host_ip: Some(format!("10.0.0.{}", i + 1)),
            hostname: None,
            port: 5672,
            management_port: 15672,
            ssh_port: 22,
            config_order: (i + 1) as i64,
        })
        .collect();

    Arc::new(ClusterTopology {
        cluster_name: "test-cluster".to_string(),
        version: "1".to_string(),
        nodes,
        restart_config: RestartDefaults::default(),
    })
}

/// Millisecond-scale timeouts so test runs finish quickly.
pub fn fast_timeouts() -> Timeouts {
    Timeouts {
        connection_drain: Duration::from_millis(80),
        connection_drain_check: Duration::from_millis(10),
        post_restart_validation: Duration::ZERO,
        inter_node: Duration::ZERO,
        node_startup: Duration::from_millis(150),
        health_check_interval: Duration::from_millis(10),
        api_timeout: Duration::from_secs(1),
    }
}

/// Restart config wired for tests: enabled, fast timeouts.
pub fn fast_restart_config() -> RestartConfig {
    RestartConfig {
        enable_rolling_restart: true,
        timeouts: fast_timeouts(),
        ..RestartConfig::default()
    }
}

/// How a node's connection count evolves across drain polls.
#[derive(Debug, Clone)]
pub enum ConnectionScript {
    /// Always this many connections.
    Constant(usize),
    /// Successive counts; the last value repeats.
    Sequence(Vec<usize>),
    /// Every observation fails.
    Unobservable,
}

/// How a node's health evolves across health polls.
#[derive(Debug, Clone)]
pub enum HealthScript {
    /// Healthy once the service is running, after this many failed polls.
    HealthyAfter(usize),
    /// Never reports healthy.
    NeverHealthy,
}

#[derive(Default)]
struct FakeBrokerInner {
    maintenance: HashSet<String>,
    maintenance_calls: Vec<(String, bool, String)>,
    connection_scripts: HashMap<String, VecDeque<usize>>,
    constant_connections: HashMap<String, usize>,
    unobservable: HashSet<String>,
    health_scripts: HashMap<String, HealthScript>,
    health_polls: HashMap<String, usize>,
    force_close_calls: Vec<(String, usize)>,
    closed_connections: Vec<String>,
    unreachable: HashSet<String>,
    maintenance_unsupported: bool,
}

/// Scripted in-memory broker double. Records every maintenance toggle and
/// force-close sweep for later assertions.
pub struct FakeBroker {
    inner: Mutex<FakeBrokerInner>,
    /// Runner shared with the service controller, so health reflects
    /// whether the service was actually restarted.
    runner: Arc<FakeRunner>,
}

impl FakeBroker {
    pub fn new(runner: Arc<FakeRunner>) -> Self {
        Self {
            inner: Mutex::new(FakeBrokerInner::default()),
            runner,
        }
    }

    pub fn script_connections(&self, node_name: &str, script: ConnectionScript) {
        let mut inner = self.inner.lock();
        match script {
            ConnectionScript::Constant(n) => {
                inner.constant_connections.insert(node_name.to_string(), n);
            }
            ConnectionScript::Sequence(values) => {
                inner
                    .connection_scripts
                    .insert(node_name.to_string(), values.into());
            }
            ConnectionScript::Unobservable => {
                inner.unobservable.insert(node_name.to_string());
            }
        }
    }

    pub fn script_health(&self, node_name: &str, script: HealthScript) {
        self.inner
            .lock()
            .health_scripts
            .insert(node_name.to_string(), script);
    }

    pub fn set_unreachable(&self, node_name: &str) {
        self.inner.lock().unreachable.insert(node_name.to_string());
    }

    pub fn set_maintenance_unsupported(&self) {
        self.inner.lock().maintenance_unsupported = true;
    }

    /// Nodes currently in maintenance mode.
    pub fn nodes_in_maintenance(&self) -> Vec<String> {
        self.inner.lock().maintenance.iter().cloned().collect()
    }

    /// Every maintenance call as `(node, enabled, reason)`.
    pub fn maintenance_calls(&self) -> Vec<(String, bool, String)> {
        self.inner.lock().maintenance_calls.clone()
    }

    pub fn force_close_calls(&self) -> Vec<(String, usize)> {
        self.inner.lock().force_close_calls.clone()
    }

    pub fn closed_connections(&self) -> Vec<String> {
        self.inner.lock().closed_connections.clone()
    }

    fn next_connection_count(&self, node_name: &str) -> Result<usize> {
        let mut inner = self.inner.lock();
        if inner.unobservable.contains(node_name) {
            return Err(ConductorError::BrokerUnreachable(node_name.to_string()));
        }
        if let Some(queue) = inner.connection_scripts.get_mut(node_name) {
            let value = if queue.len() > 1 {
                queue.pop_front().unwrap()
            } else {
                *queue.front().unwrap_or(&0)
            };
            return Ok(value);
        }
        Ok(*inner.constant_connections.get(node_name).unwrap_or(&0))
    }
}

#[async_trait]
impl BrokerApi for FakeBroker {
    async fn get_node(&self, node: &Node) -> Result<NodeInfo> {
        if self.inner.lock().unreachable.contains(&node.name) {
            return Err(ConductorError::BrokerUnreachable(node.management_base()));
        }
        Ok(NodeInfo {
            name: node.name.clone(),
            running: self.runner.service_active(&node.name),
            mem_used: 100,
            mem_limit: 1000,
            disk_free: 10 * (1 << 30),
            fd_used: 10,
            fd_total: 1000,
            ..NodeInfo::default()
        })
    }

    async fn get_alarms(&self) -> Result<Vec<Alarm>> {
        Ok(vec![])
    }

    async fn get_partitions(&self) -> Result<HashMap<String, Vec<String>>> {
        Ok(HashMap::new())
    }

    async fn get_connections(&self, node: Option<&Node>) -> Result<Vec<Connection>> {
        let count = match node {
            Some(n) => self.next_connection_count(&n.name)?,
            None => 0,
        };
        let name = node.map(|n| n.name.clone()).unwrap_or_default();
        Ok((0..count)
            .map(|i| Connection {
                name: format!("{}:{}", name, i),
                state: "running".to_string(),
                node: name.clone(),
                user: "app".to_string(),
                client_properties: HashMap::new(),
            })
            .collect())
    }

    async fn get_connection_count(&self, node: &Node) -> Result<usize> {
        self.next_connection_count(&node.name)
    }

    async fn close_connection(&self, name: &str) -> Result<()> {
        self.inner.lock().closed_connections.push(name.to_string());
        Ok(())
    }

    async fn force_close_node_connections(
        &self,
        node: &Node,
        max_to_close: usize,
    ) -> Result<ForceCloseOutcome> {
        let mut inner = self.inner.lock();
        inner
            .force_close_calls
            .push((node.name.clone(), max_to_close));
        Ok(ForceCloseOutcome {
            closed: max_to_close,
            remaining: 0,
        })
    }

    async fn set_maintenance_mode(
        &self,
        node: &Node,
        enabled: bool,
        reason: &str,
    ) -> Result<MaintenanceAck> {
        let mut inner = self.inner.lock();
        inner
            .maintenance_calls
            .push((node.name.clone(), enabled, reason.to_string()));

        if inner.maintenance_unsupported {
            return Ok(MaintenanceAck {
                node: node.id.clone(),
                enabled,
                warning: Some(format!("maintenance mode not supported by {}", node.name)),
            });
        }

        if enabled {
            inner.maintenance.insert(node.name.clone());
        } else {
            inner.maintenance.remove(&node.name);
        }
        Ok(MaintenanceAck {
            node: node.id.clone(),
            enabled,
            warning: None,
        })
    }

    async fn check_node_health(&self, node: &Node) -> Result<NodeHealth> {
        // Health scripts model post-restart behavior; before the service
        // has been restarted (admission checks) the node reports normally.
        let restarted = self.runner.was_started(&node.name);
        {
            let mut inner = self.inner.lock();
            if inner.unreachable.contains(&node.name) {
                return Err(ConductorError::BrokerUnreachable(node.management_base()));
            }

            if restarted {
                let polls = inner.health_polls.entry(node.name.clone()).or_insert(0);
                *polls += 1;
                let polls = *polls;

                match inner.health_scripts.get(&node.name) {
                    Some(HealthScript::NeverHealthy) => {
                        return Err(ConductorError::BrokerApi {
                            status: 503,
                            message: format!("{} still booting", node.name),
                        });
                    }
                    Some(HealthScript::HealthyAfter(n)) if polls <= *n => {
                        return Err(ConductorError::BrokerApi {
                            status: 503,
                            message: format!("{} still booting", node.name),
                        });
                    }
                    _ => {}
                }
            }
        }

        let info = self.get_node(node).await?;
        Ok(health::evaluate(&info, &[]))
    }

    async fn get_queues(&self, _node: Option<&Node>) -> Result<Vec<QueueInfo>> {
        Ok(vec![])
    }

    async fn test_connectivity(&self, nodes: &[Node]) -> Vec<ConnectivityProbe> {
        let inner = self.inner.lock();
        nodes
            .iter()
            .map(|n| {
                let connected = !inner.unreachable.contains(&n.name);
                ConnectivityProbe {
                    node: n.id.clone(),
                    connected,
                    duration_ms: Some(1),
                    error: if connected {
                        None
                    } else {
                        Some("connection refused".to_string())
                    },
                }
            })
            .collect()
    }
}

#[derive(Default)]
struct FakeRunnerInner {
    commands: Vec<(String, String)>,
    active: HashMap<String, bool>,
    fail_start: HashSet<String>,
}

/// In-memory command runner double tracking per-node service state.
#[derive(Default)]
pub struct FakeRunner {
    inner: Mutex<FakeRunnerInner>,
}

impl FakeRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `systemctl start` fail on this node.
    pub fn fail_start(&self, node_name: &str) {
        self.inner.lock().fail_start.insert(node_name.to_string());
    }

    /// Every `(node, command)` pair executed, in order.
    pub fn commands(&self) -> Vec<(String, String)> {
        self.inner.lock().commands.clone()
    }

    pub fn commands_for(&self, node_name: &str) -> Vec<String> {
        self.inner
            .lock()
            .commands
            .iter()
            .filter(|(node, _)| node == node_name)
            .map(|(_, command)| command.clone())
            .collect()
    }

    pub fn service_active(&self, node_name: &str) -> bool {
        *self.inner.lock().active.get(node_name).unwrap_or(&true)
    }

    /// Whether `systemctl start` has been executed on this node.
    pub fn was_started(&self, node_name: &str) -> bool {
        self.inner
            .lock()
            .commands
            .iter()
            .any(|(node, command)| node == node_name && command.starts_with("systemctl start"))
    }
}

#[async_trait]
impl CommandRunner for FakeRunner {
    async fn execute(&self, node: &Node, command: &str, _opts: ExecOptions) -> Result<String> {
        let mut inner = self.inner.lock();
        inner
            .commands
            .push((node.name.clone(), command.to_string()));

        if command.starts_with("systemctl is-active") {
            let active = *inner.active.get(&node.name).unwrap_or(&true);
            return if active {
                Ok("active".to_string())
            } else {
                Err(ConductorError::CommandFailed {
                    host: node.host().to_string(),
                    command: command.to_string(),
                    status: 3,
                    output: "inactive".to_string(),
                })
            };
        }
        if command.starts_with("systemctl stop") || command.starts_with("systemctl kill") {
            inner.active.insert(node.name.clone(), false);
            return Ok(String::new());
        }
        if command.starts_with("systemctl start") {
            if inner.fail_start.contains(&node.name) {
                return Err(ConductorError::CommandFailed {
                    host: node.host().to_string(),
                    command: command.to_string(),
                    status: 1,
                    output: "Job for rabbitmq-server.service failed".to_string(),
                });
            }
            inner.active.insert(node.name.clone(), true);
            return Ok(String::new());
        }

        Ok("ok".to_string())
    }

    async fn dispose(&self) {}
}

/// A service controller over the fake runner with zeroed pauses.
pub fn fast_service(runner: Arc<FakeRunner>) -> ServiceController {
    ServiceController::new(runner, "rabbitmq-server").with_pauses(RestartPauses {
        after_stop: Duration::ZERO,
        after_kill: Duration::ZERO,
        after_start: Duration::ZERO,
    })
}
