//! Broker service control over SSH.
//!
//! Wraps the systemctl stop/kill/start sequences and the read-only system
//! probes issued against cluster hosts. The rolling-restart sub-machine and
//! the single-node operation endpoints both go through here.

use crate::error::{ConductorError, Result};
use crate::ssh::{CommandRunner, ExecOptions};
use crate::types::Node;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Deadline for `systemctl stop`.
const STOP_TIMEOUT: Duration = Duration::from_secs(30);

/// Deadline for `systemctl start`.
const START_TIMEOUT: Duration = Duration::from_secs(45);

/// Deadline for status checks and `systemctl kill`.
const CHECK_TIMEOUT: Duration = Duration::from_secs(10);

/// Deadline for the best-effort `rabbitmqctl node_health_check`.
const HEALTH_CHECK_TIMEOUT: Duration = Duration::from_secs(30);

/// Fixed pauses inside the stop/kill/start sequence.
#[derive(Debug, Clone, Copy)]
pub struct RestartPauses {
    /// After `systemctl stop`, before re-checking.
    pub after_stop: Duration,
    /// After `systemctl kill`.
    pub after_kill: Duration,
    /// After `systemctl start`, before re-checking.
    pub after_start: Duration,
}

impl Default for RestartPauses {
    fn default() -> Self {
        Self {
            after_stop: Duration::from_secs(3),
            after_kill: Duration::from_secs(2),
            after_start: Duration::from_secs(10),
        }
    }
}

/// Snapshot of host-level system information from read-only probes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemInfo {
    pub uptime: String,
    pub load_average: String,
    pub memory: String,
    pub root_disk: String,
}

/// Controls the broker systemd unit on cluster hosts.
#[derive(Clone)]
pub struct ServiceController {
    runner: Arc<dyn CommandRunner>,
    service_name: String,
    pauses: RestartPauses,
}

impl ServiceController {
    /// Create a controller for the given unit.
    pub fn new(runner: Arc<dyn CommandRunner>, service_name: impl Into<String>) -> Self {
        Self {
            runner,
            service_name: service_name.into(),
            pauses: RestartPauses::default(),
        }
    }

    /// Override the fixed pauses (tests use zero).
    pub fn with_pauses(mut self, pauses: RestartPauses) -> Self {
        self.pauses = pauses;
        self
    }

    /// Whether systemd reports the unit active. `systemctl is-active` exits
    /// non-zero for every inactive state, so a command failure means "no".
    pub async fn is_active(&self, node: &Node) -> Result<bool> {
        let result = self
            .runner
            .execute(
                node,
                &format!("systemctl is-active {}", self.service_name),
                ExecOptions {
                    sudo: false,
                    timeout: CHECK_TIMEOUT,
                },
            )
            .await;

        match result {
            Ok(output) => Ok(output.trim() == "active"),
            Err(ConductorError::CommandFailed { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Stop the unit, escalating to `systemctl kill` if it stays active.
    pub async fn stop(&self, node: &Node) -> Result<()> {
        info!(node = %node.name, "Stopping broker service");
        self.runner
            .execute(
                node,
                &format!("systemctl stop {}", self.service_name),
                ExecOptions {
                    sudo: true,
                    timeout: STOP_TIMEOUT,
                },
            )
            .await?;
        tokio::time::sleep(self.pauses.after_stop).await;

        if self.is_active(node).await? {
            warn!(node = %node.name, "Service still active after stop, killing");
            self.runner
                .execute(
                    node,
                    &format!("systemctl kill {}", self.service_name),
                    ExecOptions {
                        sudo: true,
                        timeout: CHECK_TIMEOUT,
                    },
                )
                .await?;
            tokio::time::sleep(self.pauses.after_kill).await;
        }

        Ok(())
    }

    /// Start the unit and verify systemd reports it active.
    pub async fn start(&self, node: &Node) -> Result<()> {
        info!(node = %node.name, "Starting broker service");
        self.runner
            .execute(
                node,
                &format!("systemctl start {}", self.service_name),
                ExecOptions {
                    sudo: true,
                    timeout: START_TIMEOUT,
                },
            )
            .await?;
        tokio::time::sleep(self.pauses.after_start).await;

        if !self.is_active(node).await? {
            return Err(ConductorError::NodeOperation {
                node: node.name.clone(),
                reason: format!("{} did not become active after start", self.service_name),
            });
        }
        Ok(())
    }

    /// The full stop-then-start sequence used by the restart sub-machine.
    ///
    /// Ends with a best-effort `rabbitmqctl node_health_check`; its failure
    /// is logged but non-fatal — the HTTP health wait is authoritative.
    pub async fn restart(&self, node: &Node) -> Result<()> {
        let was_active = self.is_active(node).await?;
        info!(node = %node.name, was_active, "Beginning service restart");

        self.stop(node).await?;
        self.start(node).await?;

        match self
            .runner
            .execute(
                node,
                "rabbitmqctl node_health_check",
                ExecOptions {
                    sudo: true,
                    timeout: HEALTH_CHECK_TIMEOUT,
                },
            )
            .await
        {
            Ok(_) => info!(node = %node.name, "rabbitmqctl health check passed"),
            Err(e) => {
                warn!(node = %node.name, error = %e, "rabbitmqctl health check failed, deferring to HTTP health wait")
            }
        }

        Ok(())
    }

    /// Gather read-only system probes from the host.
    pub async fn system_info(&self, node: &Node) -> Result<SystemInfo> {
        let opts = ExecOptions {
            sudo: false,
            timeout: CHECK_TIMEOUT,
        };
        let uptime = self.runner.execute(node, "uptime", opts).await?;
        let load_average = self.runner.execute(node, "cat /proc/loadavg", opts).await?;
        let memory = self
            .runner
            .execute(node, "cat /proc/meminfo | head -n 5", opts)
            .await?;
        let root_disk = self
            .runner
            .execute(node, "df -h / | tail -n 1", opts)
            .await?;

        Ok(SystemInfo {
            uptime,
            load_average,
            memory,
            root_disk,
        })
    }

    /// Cheap reachability probe used by the SSH half of cluster health.
    pub async fn probe(&self, node: &Node) -> Result<()> {
        self.runner
            .execute(
                node,
                "echo ok",
                ExecOptions {
                    sudo: false,
                    timeout: CHECK_TIMEOUT,
                },
            )
            .await
            .map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use parking_lot::Mutex;

    /// Scripted command runner that records every command it executes.
    struct ScriptedRunner {
        log: Mutex<Vec<String>>,
        /// Map from command prefix to canned response.
        responses: Mutex<Vec<(String, Result<String>)>>,
    }

    impl ScriptedRunner {
        fn new() -> Self {
            Self {
                log: Mutex::new(Vec::new()),
                responses: Mutex::new(Vec::new()),
            }
        }

        fn respond(&self, prefix: &str, result: Result<String>) {
            self.responses.lock().push((prefix.to_string(), result));
        }

        fn commands(&self) -> Vec<String> {
            self.log.lock().clone()
        }
    }

    #[async_trait]
    impl CommandRunner for ScriptedRunner {
        async fn execute(&self, _node: &Node, command: &str, _opts: ExecOptions) -> Result<String> {
            self.log.lock().push(command.to_string());
            let responses = self.responses.lock();
            for (prefix, result) in responses.iter() {
                if command.starts_with(prefix) {
                    return match result {
                        Ok(s) => Ok(s.clone()),
                        Err(_) => Err(ConductorError::CommandFailed {
                            host: "test".into(),
                            command: command.into(),
                            status: 1,
                            output: "scripted failure".into(),
                        }),
                    };
                }
            }
            Ok(String::new())
        }

        async fn dispose(&self) {}
    }

    fn test_node() -> Node {
        Node {
            id: "rabbit-1".into(),
            name: "rabbit@host-1".into(),
            host_ip: Some("10.0.0.1".into()),
            hostname: None,
            port: 5672,
            management_port: 15672,
            ssh_port: 22,
            config_order: 1,
        }
    }

    fn zero_pauses() -> RestartPauses {
        RestartPauses {
            after_stop: Duration::ZERO,
            after_kill: Duration::ZERO,
            after_start: Duration::ZERO,
        }
    }

    #[tokio::test]
    async fn test_is_active_maps_exit_failure_to_false() {
        let runner = Arc::new(ScriptedRunner::new());
        runner.respond(
            "systemctl is-active",
            Err(ConductorError::Internal("placeholder".into())),
        );
        let controller = ServiceController::new(runner, "rabbitmq-server");
        assert!(!controller.is_active(&test_node()).await.unwrap());
    }

    #[tokio::test]
    async fn test_restart_escalates_to_kill_when_unit_stays_active() {
        let runner = Arc::new(ScriptedRunner::new());
        // is-active always reports "active", so stop escalates to kill.
        runner.respond("systemctl is-active", Ok("active".into()));
        let controller = ServiceController::new(Arc::clone(&runner) as Arc<dyn CommandRunner>, "rabbitmq-server")
            .with_pauses(zero_pauses());

        controller.restart(&test_node()).await.unwrap();
        let commands = runner.commands();
        assert_eq!(commands[0], "systemctl is-active rabbitmq-server");
        assert_eq!(commands[1], "systemctl stop rabbitmq-server");
        assert!(commands.iter().any(|c| c == "systemctl kill rabbitmq-server"));
        assert!(commands
            .iter()
            .any(|c| c == "systemctl start rabbitmq-server"));
        // kill precedes start
        let kill_idx = commands.iter().position(|c| c.contains("kill")).unwrap();
        let start_idx = commands
            .iter()
            .position(|c| c == "systemctl start rabbitmq-server")
            .unwrap();
        assert!(kill_idx < start_idx);
    }

    #[tokio::test]
    async fn test_start_fails_when_unit_stays_inactive() {
        let runner = Arc::new(ScriptedRunner::new());
        runner.respond("systemctl is-active", Ok("inactive".into()));
        let controller = ServiceController::new(Arc::clone(&runner) as Arc<dyn CommandRunner>, "rabbitmq-server")
            .with_pauses(zero_pauses());

        let err = controller.start(&test_node()).await.unwrap_err();
        assert!(err.to_string().contains("did not become active"));
    }

    #[tokio::test]
    async fn test_restart_tolerates_failed_rabbitmqctl_check() {
        let runner = Arc::new(ScriptedRunner::new());
        runner.respond("systemctl is-active", Ok("active".into()));
        runner.respond(
            "rabbitmqctl node_health_check",
            Err(ConductorError::Internal("placeholder".into())),
        );
        let controller = ServiceController::new(Arc::clone(&runner) as Arc<dyn CommandRunner>, "rabbitmq-server")
            .with_pauses(zero_pauses());

        controller.restart(&test_node()).await.unwrap();
        assert!(runner
            .commands()
            .iter()
            .any(|c| c.starts_with("rabbitmqctl node_health_check")));
    }

    #[tokio::test]
    async fn test_system_info_issues_expected_probes() {
        let runner = Arc::new(ScriptedRunner::new());
        runner.respond("uptime", Ok("up 3 days".into()));
        runner.respond("cat /proc/loadavg", Ok("0.10 0.20 0.30 1/200 4242".into()));
        let controller =
            ServiceController::new(Arc::clone(&runner) as Arc<dyn CommandRunner>, "rabbitmq-server");

        let info = controller.system_info(&test_node()).await.unwrap();
        assert_eq!(info.uptime, "up 3 days");
        let commands = runner.commands();
        assert!(commands.iter().any(|c| c.starts_with("df -h /")));
        assert!(commands.iter().any(|c| c.contains("/proc/meminfo")));
    }
}
