//! Typed client for the RabbitMQ management HTTP API.
//!
//! All cluster-wide reads go through a single base endpoint (an override or
//! the first topology node); maintenance-mode toggles and connectivity
//! probes address each node's own management endpoint.

use crate::config::BrokerConfig;
use crate::error::{ConductorError, Result};
use crate::health::{self, NodeHealth};
use crate::types::{Node, NodeId};
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Raw node counters as reported by `GET /api/nodes/{name}`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeInfo {
    pub name: String,
    #[serde(default)]
    pub running: bool,
    #[serde(default)]
    pub mem_used: u64,
    #[serde(default)]
    pub mem_limit: u64,
    #[serde(default)]
    pub disk_free: u64,
    #[serde(default)]
    pub disk_free_limit: u64,
    #[serde(default)]
    pub fd_used: u64,
    #[serde(default)]
    pub fd_total: u64,
    #[serde(default)]
    pub sockets_used: u64,
    #[serde(default)]
    pub sockets_total: u64,
    #[serde(default)]
    pub partitions: Vec<String>,
    #[serde(default)]
    pub uptime: u64,
}

/// A broker alarm, attributed to a node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Alarm {
    pub alarm: String,
    pub node: String,
}

/// A client connection as listed by the management API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Connection {
    pub name: String,
    #[serde(default)]
    pub state: String,
    #[serde(default)]
    pub node: String,
    #[serde(default)]
    pub user: String,
    #[serde(default)]
    pub client_properties: HashMap<String, serde_json::Value>,
}

/// A queue as listed by the management API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueInfo {
    pub name: String,
    #[serde(default)]
    pub vhost: String,
    #[serde(default)]
    pub state: String,
    #[serde(default)]
    pub node: String,
    #[serde(default)]
    pub messages: u64,
    #[serde(default)]
    pub consumers: u64,
}

/// Acknowledgement of a maintenance-mode toggle.
///
/// `warning` is set when the broker does not support the endpoint; the
/// caller proceeds regardless.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MaintenanceAck {
    pub node: NodeId,
    pub enabled: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub warning: Option<String>,
}

/// Outcome of a force-close sweep over a node's connections.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ForceCloseOutcome {
    pub closed: usize,
    pub remaining: usize,
}

/// One probe from a connectivity test.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectivityProbe {
    pub node: NodeId,
    pub connected: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Capability contract the orchestrator consumes for broker operations.
#[async_trait]
pub trait BrokerApi: Send + Sync {
    /// Fetch raw counters for one node.
    async fn get_node(&self, node: &Node) -> Result<NodeInfo>;

    /// Fetch all active alarms.
    async fn get_alarms(&self) -> Result<Vec<Alarm>>;

    /// Map of node name to the peers it cannot reach, for partitioned nodes.
    async fn get_partitions(&self) -> Result<HashMap<String, Vec<String>>>;

    /// List client connections, optionally restricted to one node.
    async fn get_connections(&self, node: Option<&Node>) -> Result<Vec<Connection>>;

    /// Count of connections in state `running` on the node.
    ///
    /// A failed observation is non-fatal to the drain loop, which treats the
    /// error as "proceed as if drained".
    async fn get_connection_count(&self, node: &Node) -> Result<usize>;

    /// Close a single connection by name.
    async fn close_connection(&self, name: &str) -> Result<()>;

    /// Close up to `max_to_close` running connections on the node,
    /// swallowing per-connection failures.
    async fn force_close_node_connections(
        &self,
        node: &Node,
        max_to_close: usize,
    ) -> Result<ForceCloseOutcome>;

    /// Toggle maintenance mode against the node's own management endpoint.
    async fn set_maintenance_mode(
        &self,
        node: &Node,
        enabled: bool,
        reason: &str,
    ) -> Result<MaintenanceAck>;

    /// Derive health for one node from its counters and the alarm list.
    async fn check_node_health(&self, node: &Node) -> Result<NodeHealth>;

    /// List queues, optionally restricted to one node.
    async fn get_queues(&self, node: Option<&Node>) -> Result<Vec<QueueInfo>>;

    /// Probe `GET /api/overview` against each node in turn.
    async fn test_connectivity(&self, nodes: &[Node]) -> Vec<ConnectivityProbe>;
}

/// Keep connections whose state is `running` and which live on `node_name`.
pub fn running_connections_on<'a>(
    connections: &'a [Connection],
    node_name: &str,
) -> Vec<&'a Connection> {
    connections
        .iter()
        .filter(|c| c.state == "running" && c.node == node_name)
        .collect()
}

/// Percent-encode a path segment (connection and node names carry `@`).
fn encode_segment(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for b in raw.bytes() {
        match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(b as char)
            }
            _ => out.push_str(&format!("%{:02X}", b)),
        }
    }
    out
}

/// HTTP implementation of [`BrokerApi`] backed by reqwest.
#[derive(Clone, Debug)]
pub struct HttpBrokerClient {
    client: reqwest::Client,
    default_base: String,
    username: String,
    password: String,
}

impl HttpBrokerClient {
    /// Create a client. `default_base` serves cluster-wide reads; it is the
    /// configured override when present, otherwise the first topology node's
    /// own endpoint.
    pub fn new(config: &BrokerConfig, nodes: &[Node], api_timeout: Duration) -> Result<Self> {
        let default_base = config
            .management_api_base
            .clone()
            .or_else(|| nodes.first().map(|n| n.management_base()))
            .ok_or_else(|| {
                ConductorError::Config("no management API base and no nodes configured".into())
            })?;

        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .timeout(api_timeout)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());

        Ok(Self {
            client,
            default_base: default_base.trim_end_matches('/').to_string(),
            username: config.username.clone(),
            password: config.password.clone(),
        })
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, base: &str, path: &str) -> Result<T> {
        let url = format!("{}{}", base, path);
        let response = match self
            .client
            .get(&url)
            .basic_auth(&self.username, Some(&self.password))
            .send()
            .await
        {
            Ok(response) => response,
            Err(e) => {
                crate::observability::record_broker_error("network");
                return Err(e.into());
            }
        };

        let status = response.status();
        if !status.is_success() {
            crate::observability::record_broker_error(status.as_str());
            let body = response.text().await.unwrap_or_default();
            return Err(ConductorError::from_broker_response(
                path,
                status.as_u16(),
                body,
            ));
        }

        response
            .json()
            .await
            .map_err(|e| ConductorError::Serialization(e.to_string()))
    }

    fn node_path(node: &Node) -> String {
        format!("/api/nodes/{}", encode_segment(&node.name))
    }
}

#[async_trait]
impl BrokerApi for HttpBrokerClient {
    async fn get_node(&self, node: &Node) -> Result<NodeInfo> {
        self.get_json(&self.default_base, &Self::node_path(node))
            .await
    }

    async fn get_alarms(&self) -> Result<Vec<Alarm>> {
        self.get_json(&self.default_base, "/api/alarms").await
    }

    async fn get_partitions(&self) -> Result<HashMap<String, Vec<String>>> {
        let nodes: Vec<NodeInfo> = self.get_json(&self.default_base, "/api/nodes").await?;
        Ok(nodes
            .into_iter()
            .filter(|n| !n.partitions.is_empty())
            .map(|n| (n.name, n.partitions))
            .collect())
    }

    async fn get_connections(&self, node: Option<&Node>) -> Result<Vec<Connection>> {
        let all: Vec<Connection> = self.get_json(&self.default_base, "/api/connections").await?;
        Ok(match node {
            Some(n) => all.into_iter().filter(|c| c.node == n.name).collect(),
            None => all,
        })
    }

    async fn get_connection_count(&self, node: &Node) -> Result<usize> {
        match self.get_connections(None).await {
            Ok(connections) => Ok(running_connections_on(&connections, &node.name).len()),
            Err(e) => {
                warn!(node = %node.name, error = %e, "Connection count observation failed");
                Err(e)
            }
        }
    }

    async fn close_connection(&self, name: &str) -> Result<()> {
        let path = format!("/api/connections/{}", encode_segment(name));
        let url = format!("{}{}", self.default_base, path);
        let response = self
            .client
            .delete(&url)
            .basic_auth(&self.username, Some(&self.password))
            .header("X-Reason", "conductor rolling restart")
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() && status != StatusCode::NOT_FOUND {
            let body = response.text().await.unwrap_or_default();
            return Err(ConductorError::from_broker_response(
                &path,
                status.as_u16(),
                body,
            ));
        }
        Ok(())
    }

    async fn force_close_node_connections(
        &self,
        node: &Node,
        max_to_close: usize,
    ) -> Result<ForceCloseOutcome> {
        let connections = self.get_connections(None).await?;
        let running = running_connections_on(&connections, &node.name);

        let mut closed = 0usize;
        for connection in running.iter().take(max_to_close) {
            match self.close_connection(&connection.name).await {
                Ok(()) => closed += 1,
                Err(e) => {
                    warn!(
                        node = %node.name,
                        connection = %connection.name,
                        error = %e,
                        "Failed to force-close connection"
                    );
                }
            }
        }

        Ok(ForceCloseOutcome {
            closed,
            remaining: running.len().saturating_sub(closed),
        })
    }

    async fn set_maintenance_mode(
        &self,
        node: &Node,
        enabled: bool,
        reason: &str,
    ) -> Result<MaintenanceAck> {
        let path = format!("{}/maintenance", Self::node_path(node));
        let url = format!("{}{}", node.management_base(), path);

        let body = serde_json::json!({
            "maintenance": enabled,
            "reason": reason,
        });

        let result = self
            .client
            .put(&url)
            .basic_auth(&self.username, Some(&self.password))
            .json(&body)
            .send()
            .await;

        match result {
            Ok(response) if response.status().is_success() => Ok(MaintenanceAck {
                node: node.id.clone(),
                enabled,
                warning: None,
            }),
            // Older brokers lack the endpoint entirely. Non-fatal.
            Ok(response)
                if matches!(
                    response.status(),
                    StatusCode::NOT_FOUND
                        | StatusCode::METHOD_NOT_ALLOWED
                        | StatusCode::NOT_IMPLEMENTED
                ) =>
            {
                let warning = format!(
                    "maintenance mode not supported by {} (HTTP {})",
                    node.name,
                    response.status().as_u16()
                );
                warn!(node = %node.name, "{}", warning);
                Ok(MaintenanceAck {
                    node: node.id.clone(),
                    enabled,
                    warning: Some(warning),
                })
            }
            Ok(response) => {
                let status = response.status().as_u16();
                let body = response.text().await.unwrap_or_default();
                Err(ConductorError::from_broker_response(&path, status, body))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn check_node_health(&self, node: &Node) -> Result<NodeHealth> {
        let info = self.get_node(node).await?;
        let alarms = self.get_alarms().await?;
        Ok(health::evaluate(&info, &alarms))
    }

    async fn get_queues(&self, node: Option<&Node>) -> Result<Vec<QueueInfo>> {
        let all: Vec<QueueInfo> = self.get_json(&self.default_base, "/api/queues").await?;
        Ok(match node {
            Some(n) => all.into_iter().filter(|q| q.node == n.name).collect(),
            None => all,
        })
    }

    async fn test_connectivity(&self, nodes: &[Node]) -> Vec<ConnectivityProbe> {
        let mut probes = Vec::with_capacity(nodes.len());

        for node in nodes {
            let url = format!("{}/api/overview", node.management_base());
            let start = Instant::now();

            let result = self
                .client
                .get(&url)
                .basic_auth(&self.username, Some(&self.password))
                .send()
                .await;

            let probe = match result {
                Ok(response) if response.status().is_success() => {
                    debug!(node = %node.name, "Connectivity probe succeeded");
                    ConnectivityProbe {
                        node: node.id.clone(),
                        connected: true,
                        duration_ms: Some(start.elapsed().as_millis() as u64),
                        error: None,
                    }
                }
                Ok(response) => ConnectivityProbe {
                    node: node.id.clone(),
                    connected: false,
                    duration_ms: Some(start.elapsed().as_millis() as u64),
                    error: Some(format!("HTTP {}", response.status().as_u16())),
                },
                Err(e) => ConnectivityProbe {
                    node: node.id.clone(),
                    connected: false,
                    duration_ms: None,
                    error: Some(e.to_string()),
                },
            };

            probes.push(probe);
        }

        probes
    }
}
