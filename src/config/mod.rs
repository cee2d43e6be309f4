//! Configuration module for Conductor.

use crate::error::{ConductorError, Result};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Hard upper bound on connections that may ever be force-closed after a
/// drain. Configuration can lower `force_close_max` but never raise it
/// past this.
pub const FORCE_CLOSE_HARD_CAP: usize = 10;

/// Main configuration for a Conductor instance.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ConductorConfig {
    /// Admin API configuration.
    pub api: ApiConfig,
    /// Broker management API configuration.
    pub broker: BrokerConfig,
    /// SSH control channel configuration.
    pub ssh: SshConfig,
    /// Rolling restart configuration.
    pub restart: RestartConfig,
    /// Observability configuration.
    pub observability: ObservabilityConfig,
}

impl ConductorConfig {
    /// Load configuration from a JSON file.
    pub fn from_file(path: &std::path::Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConductorError::Config(format!("Failed to read config file: {}", e)))?;

        let config: Self = serde_json::from_str(&content)
            .map_err(|e| ConductorError::Config(format!("Failed to parse config: {}", e)))?;

        config.validate()?;
        Ok(config)
    }

    /// Apply environment variable overrides.
    ///
    /// Recognized variables: `RABBITMQ_ADMIN_USER`, `RABBITMQ_ADMIN_PASSWORD`,
    /// `RABBITMQ_MANAGEMENT_API_BASE`, `API_KEY`, `SSH_USER`, `SSH_KEY_PATH`,
    /// `SSH_PASSWORD`, `ENABLE_ROLLING_RESTART`, `REQUIRE_ALL_NODES_HEALTHY`,
    /// `ALLOW_RESTART_WITH_PARTITIONS`, `FORCE_CLOSE_CONNECTIONS_AFTER_DRAIN`
    /// and the `*_MS` timeout knobs.
    pub fn apply_env(mut self) -> Self {
        if let Ok(v) = std::env::var("RABBITMQ_ADMIN_USER") {
            self.broker.username = v;
        }
        if let Ok(v) = std::env::var("RABBITMQ_ADMIN_PASSWORD") {
            self.broker.password = v;
        }
        if let Ok(v) = std::env::var("RABBITMQ_MANAGEMENT_API_BASE") {
            self.broker.management_api_base = Some(v);
        }
        if let Ok(v) = std::env::var("API_KEY") {
            self.api.api_key = Some(v);
        }
        if let Ok(v) = std::env::var("SSH_USER") {
            self.ssh.user = v;
        }
        if let Ok(v) = std::env::var("SSH_KEY_PATH") {
            self.ssh.key_path = Some(PathBuf::from(v));
        }
        if let Ok(v) = std::env::var("SSH_PASSWORD") {
            self.ssh.password = Some(v);
        }
        if let Some(v) = env_bool("ENABLE_ROLLING_RESTART") {
            self.restart.enable_rolling_restart = v;
        }
        if let Some(v) = env_bool("REQUIRE_ALL_NODES_HEALTHY") {
            self.restart.require_all_nodes_healthy = v;
        }
        if let Some(v) = env_bool("ALLOW_RESTART_WITH_PARTITIONS") {
            self.restart.allow_restart_with_partitions = v;
        }
        if let Some(v) = env_bool("FORCE_CLOSE_CONNECTIONS_AFTER_DRAIN") {
            self.restart.force_close_connections_after_drain = v;
        }

        let timeouts = &mut self.restart.timeouts;
        for (name, slot) in [
            ("CONNECTION_DRAIN_TIMEOUT_MS", &mut timeouts.connection_drain),
            (
                "CONNECTION_DRAIN_CHECK_INTERVAL_MS",
                &mut timeouts.connection_drain_check,
            ),
            (
                "POST_RESTART_VALIDATION_MS",
                &mut timeouts.post_restart_validation,
            ),
            ("INTER_NODE_DELAY_MS", &mut timeouts.inter_node),
            ("NODE_STARTUP_TIMEOUT_MS", &mut timeouts.node_startup),
            (
                "HEALTH_CHECK_INTERVAL_MS",
                &mut timeouts.health_check_interval,
            ),
            ("API_TIMEOUT_MS", &mut timeouts.api_timeout),
        ] {
            if let Some(ms) = env_millis(name) {
                *slot = ms;
            }
        }

        self
    }

    /// Validate configuration.
    pub fn validate(&self) -> Result<()> {
        if self.broker.username.is_empty() {
            return Err(ConductorError::InvalidConfig {
                field: "broker.username".to_string(),
                reason: "RABBITMQ_ADMIN_USER is required".to_string(),
            });
        }
        if self.broker.password.is_empty() {
            return Err(ConductorError::InvalidConfig {
                field: "broker.password".to_string(),
                reason: "RABBITMQ_ADMIN_PASSWORD is required".to_string(),
            });
        }
        if self.restart.force_close_max == 0 {
            return Err(ConductorError::InvalidConfig {
                field: "restart.force_close_max".to_string(),
                reason: "force-close cap must be non-zero".to_string(),
            });
        }
        if self.restart.force_close_max > FORCE_CLOSE_HARD_CAP {
            return Err(ConductorError::InvalidConfig {
                field: "restart.force_close_max".to_string(),
                reason: format!(
                    "force-close cap cannot exceed the hard limit of {}",
                    FORCE_CLOSE_HARD_CAP
                ),
            });
        }
        if self.restart.timeouts.connection_drain_check.is_zero() {
            return Err(ConductorError::InvalidConfig {
                field: "restart.timeouts.connection_drain_check".to_string(),
                reason: "drain poll interval must be non-zero".to_string(),
            });
        }
        if self.restart.timeouts.health_check_interval.is_zero() {
            return Err(ConductorError::InvalidConfig {
                field: "restart.timeouts.health_check_interval".to_string(),
                reason: "health poll interval must be non-zero".to_string(),
            });
        }
        Ok(())
    }

    /// Create a minimal development configuration.
    pub fn development() -> Self {
        Self {
            api: ApiConfig {
                bind_addr: "127.0.0.1:8080".parse().expect("valid socket address"),
                api_key: None,
            },
            broker: BrokerConfig {
                management_api_base: None,
                username: "guest".to_string(),
                password: "guest".to_string(),
            },
            ssh: SshConfig::default(),
            restart: RestartConfig {
                enable_rolling_restart: true,
                ..RestartConfig::default()
            },
            observability: ObservabilityConfig::default(),
        }
    }
}

fn env_bool(name: &str) -> Option<bool> {
    std::env::var(name)
        .ok()
        .map(|v| matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"))
}

fn env_millis(name: &str) -> Option<Duration> {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .map(Duration::from_millis)
}

/// Admin API configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    /// Address to bind the admin API.
    pub bind_addr: SocketAddr,
    /// API key required on write endpoints. Validation is bypassed with a
    /// warning when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:8080".parse().expect("valid socket address"),
            api_key: None,
        }
    }
}

/// Broker management API configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    /// Base URL override for the management API. When unset, each node's
    /// own `hostIp:managementPort` endpoint is used.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub management_api_base: Option<String>,
    /// HTTP Basic auth user.
    pub username: String,
    /// HTTP Basic auth password.
    pub password: String,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            management_api_base: None,
            username: String::new(),
            password: String::new(),
        }
    }
}

/// SSH control channel configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SshConfig {
    /// SSH login user.
    pub user: String,
    /// Private key path. Takes precedence over the password.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_path: Option<PathBuf>,
    /// Password auth fallback.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    /// TCP connect timeout per session.
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,
    /// Keepalive interval on live sessions.
    #[serde(with = "humantime_serde")]
    pub keepalive_interval: Duration,
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            user: "rabbitmq-ops".to_string(),
            key_path: None,
            password: None,
            connect_timeout: Duration::from_secs(30),
            keepalive_interval: Duration::from_secs(5),
        }
    }
}

/// Rolling restart configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RestartConfig {
    /// Master gate: rolling restarts are refused unless enabled.
    pub enable_rolling_restart: bool,
    /// Require every node healthy before admission.
    pub require_all_nodes_healthy: bool,
    /// Permit admission despite detected network partitions.
    pub allow_restart_with_partitions: bool,
    /// Force-close connections that survive the drain budget.
    pub force_close_connections_after_drain: bool,
    /// Safety cap: never force-close when more than this many connections
    /// remain. May be lowered, but never raised above
    /// [`FORCE_CLOSE_HARD_CAP`].
    pub force_close_max: usize,
    /// systemd unit controlling the broker on each host.
    pub service_name: String,
    /// Timeout knobs.
    pub timeouts: Timeouts,
}

impl Default for RestartConfig {
    fn default() -> Self {
        Self {
            enable_rolling_restart: false,
            require_all_nodes_healthy: true,
            allow_restart_with_partitions: false,
            force_close_connections_after_drain: false,
            force_close_max: 10,
            service_name: "rabbitmq-server".to_string(),
            timeouts: Timeouts::default(),
        }
    }
}

/// Timeout knobs governing the restart state machine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Timeouts {
    /// Budget for the connection-drain loop.
    #[serde(with = "humantime_serde")]
    pub connection_drain: Duration,
    /// Poll interval within the drain loop.
    #[serde(with = "humantime_serde")]
    pub connection_drain_check: Duration,
    /// Idle stabilization pause after a node validates healthy.
    #[serde(with = "humantime_serde")]
    pub post_restart_validation: Duration,
    /// Pause between consecutive nodes.
    #[serde(with = "humantime_serde")]
    pub inter_node: Duration,
    /// Budget for the post-restart health wait.
    #[serde(with = "humantime_serde")]
    pub node_startup: Duration,
    /// Poll interval within the health wait.
    #[serde(with = "humantime_serde")]
    pub health_check_interval: Duration,
    /// Per-call deadline on management API requests.
    #[serde(with = "humantime_serde")]
    pub api_timeout: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            connection_drain: Duration::from_secs(60),
            connection_drain_check: Duration::from_secs(5),
            post_restart_validation: Duration::from_secs(30),
            inter_node: Duration::from_secs(15),
            node_startup: Duration::from_secs(180),
            health_check_interval: Duration::from_secs(10),
            api_timeout: Duration::from_secs(30),
        }
    }
}

/// Observability configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    /// Enable Prometheus metrics.
    pub metrics_enabled: bool,
    /// Metrics bind address.
    pub metrics_addr: SocketAddr,
    /// Log level.
    pub log_level: String,
    /// Enable JSON logging.
    pub json_logs: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            metrics_enabled: true,
            metrics_addr: "0.0.0.0:9090".parse().expect("valid socket address"),
            log_level: "info".to_string(),
            json_logs: false,
        }
    }
}

/// Serde helper for Duration using humantime format.
pub mod humantime_serde {
    use serde::{self, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&format!("{}ms", duration.as_millis()))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        parse_duration(&s).map_err(serde::de::Error::custom)
    }

    fn parse_duration(s: &str) -> Result<Duration, String> {
        let s = s.trim();
        if let Some(ms) = s.strip_suffix("ms") {
            ms.parse::<u64>()
                .map(Duration::from_millis)
                .map_err(|e| e.to_string())
        } else if let Some(s_val) = s.strip_suffix('s') {
            s_val
                .parse::<u64>()
                .map(Duration::from_secs)
                .map_err(|e| e.to_string())
        } else if let Some(m) = s.strip_suffix('m') {
            m.parse::<u64>()
                .map(|v| Duration::from_secs(v * 60))
                .map_err(|e| e.to_string())
        } else {
            s.parse::<u64>()
                .map(Duration::from_millis)
                .map_err(|e| e.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_fails_without_credentials() {
        let config = ConductorConfig::default();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("RABBITMQ_ADMIN_USER"));
    }

    #[test]
    fn test_development_config_validates() {
        let config = ConductorConfig::development();
        config.validate().unwrap();
        assert!(config.restart.enable_rolling_restart);
        assert_eq!(config.restart.force_close_max, 10);
    }

    #[test]
    fn test_default_timeouts() {
        let timeouts = Timeouts::default();
        assert_eq!(timeouts.connection_drain, Duration::from_secs(60));
        assert_eq!(timeouts.connection_drain_check, Duration::from_secs(5));
        assert_eq!(timeouts.node_startup, Duration::from_secs(180));
        assert_eq!(timeouts.api_timeout, Duration::from_secs(30));
    }

    #[test]
    fn test_timeouts_serde_round_trip() {
        let timeouts = Timeouts::default();
        let json = serde_json::to_string(&timeouts).unwrap();
        assert!(json.contains("\"60000ms\""));
        let back: Timeouts = serde_json::from_str(&json).unwrap();
        assert_eq!(back, timeouts);
    }

    #[test]
    fn test_humantime_parses_suffixes() {
        let parsed: Timeouts = serde_json::from_str(
            r#"{
                "connection_drain": "2m",
                "connection_drain_check": "5s",
                "post_restart_validation": "30s",
                "inter_node": "15000",
                "node_startup": "180s",
                "health_check_interval": "10s",
                "api_timeout": "30000ms"
            }"#,
        )
        .unwrap();
        assert_eq!(parsed.connection_drain, Duration::from_secs(120));
        assert_eq!(parsed.inter_node, Duration::from_secs(15));
        assert_eq!(parsed.api_timeout, Duration::from_secs(30));
    }

    #[test]
    fn test_force_close_cap_cannot_exceed_hard_limit() {
        let mut config = ConductorConfig::development();
        config.restart.force_close_max = FORCE_CLOSE_HARD_CAP + 1;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("hard limit of 10"));

        config.restart.force_close_max = 3;
        config.validate().unwrap();
    }

    #[test]
    fn test_zero_poll_interval_rejected() {
        let mut config = ConductorConfig::development();
        config.restart.timeouts.connection_drain_check = Duration::ZERO;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("drain poll interval"));
    }
}
