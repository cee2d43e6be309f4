//! SSH command execution on cluster hosts.
//!
//! Sessions are pooled per `(host, ssh_port)` and reused while the
//! underlying socket stays alive; a dead session is discarded and redialed
//! on the next command. Dialing is serialized per key so concurrent callers
//! never race to open duplicate sessions.

use crate::config::SshConfig;
use crate::error::{ConductorError, Result};
use crate::types::Node;
use async_trait::async_trait;
use parking_lot::Mutex;
use ssh2::Session;
use std::collections::HashMap;
use std::io::Read;
use std::net::TcpStream;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Options for a single command execution.
#[derive(Debug, Clone, Copy)]
pub struct ExecOptions {
    /// Run the command under `sudo` (a PTY is allocated).
    pub sudo: bool,
    /// Per-command deadline.
    pub timeout: Duration,
}

impl Default for ExecOptions {
    fn default() -> Self {
        Self {
            sudo: false,
            timeout: Duration::from_secs(30),
        }
    }
}

/// Capability contract the orchestrator consumes for host operations.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run a command on the node's host, returning trimmed stdout.
    ///
    /// Fails when the exit status is non-zero, with combined stdout+stderr
    /// in the error message.
    async fn execute(&self, node: &Node, command: &str, opts: ExecOptions) -> Result<String>;

    /// Dispose all pooled sessions. Called on process termination.
    async fn dispose(&self);
}

type PoolKey = (String, u16);

/// A pooled session slot. The inner mutex serializes dial and use per host.
type SessionSlot = Arc<std::sync::Mutex<Option<Session>>>;

/// SSH implementation of [`CommandRunner`] backed by libssh2.
///
/// All libssh2 calls are blocking and run under `spawn_blocking`.
pub struct SshExecutor {
    config: SshConfig,
    pool: Mutex<HashMap<PoolKey, SessionSlot>>,
}

impl SshExecutor {
    /// Create an executor. No sessions are dialed until first use.
    pub fn new(config: SshConfig) -> Self {
        Self {
            config,
            pool: Mutex::new(HashMap::new()),
        }
    }

    fn slot_for(&self, key: PoolKey) -> SessionSlot {
        let mut pool = self.pool.lock();
        Arc::clone(
            pool.entry(key)
                .or_insert_with(|| Arc::new(std::sync::Mutex::new(None))),
        )
    }

    fn connect(config: &SshConfig, host: &str, port: u16) -> Result<Session> {
        let addr = format!("{}:{}", host, port);
        let socket_addr = addr
            .parse::<std::net::SocketAddr>()
            .or_else(|_| {
                use std::net::ToSocketAddrs;
                addr.to_socket_addrs()
                    .map_err(|e| ConductorError::SshConnect {
                        host: host.to_string(),
                        port,
                        reason: format!("address resolution failed: {}", e),
                    })?
                    .next()
                    .ok_or_else(|| ConductorError::SshConnect {
                        host: host.to_string(),
                        port,
                        reason: "address resolution returned no results".to_string(),
                    })
            })?;

        let stream = TcpStream::connect_timeout(&socket_addr, config.connect_timeout).map_err(
            |e| ConductorError::SshConnect {
                host: host.to_string(),
                port,
                reason: e.to_string(),
            },
        )?;

        let mut session = Session::new().map_err(|e| ConductorError::SshConnect {
            host: host.to_string(),
            port,
            reason: e.to_string(),
        })?;
        session.set_tcp_stream(stream);
        session.handshake().map_err(|e| ConductorError::SshConnect {
            host: host.to_string(),
            port,
            reason: format!("handshake failed: {}", e),
        })?;

        if let Some(key_path) = &config.key_path {
            session
                .userauth_pubkey_file(&config.user, None, key_path, None)
                .map_err(|e| ConductorError::SshAuth {
                    host: host.to_string(),
                    reason: format!("key auth failed: {}", e),
                })?;
        } else if let Some(password) = &config.password {
            session
                .userauth_password(&config.user, password)
                .map_err(|e| ConductorError::SshAuth {
                    host: host.to_string(),
                    reason: format!("password auth failed: {}", e),
                })?;
        } else {
            return Err(ConductorError::SshAuthMissing(host.to_string()));
        }

        session.set_keepalive(true, config.keepalive_interval.as_secs() as u32);
        info!(host = %host, port, "SSH session established");
        Ok(session)
    }

    /// Run a command on an already-open session, blocking.
    fn run_on_session(
        session: &Session,
        host: &str,
        command: &str,
        opts: ExecOptions,
        started: Instant,
    ) -> Result<String> {
        session.set_timeout(opts.timeout.as_millis() as u32);

        let map_err = |e: ssh2::Error| {
            if started.elapsed() >= opts.timeout {
                ConductorError::CommandTimeout {
                    host: host.to_string(),
                    command: command.to_string(),
                    timeout_secs: opts.timeout.as_secs(),
                }
            } else {
                ConductorError::SshConnect {
                    host: host.to_string(),
                    port: 0,
                    reason: e.to_string(),
                }
            }
        };

        let mut channel = session.channel_session().map_err(map_err)?;

        let full_command;
        let command_line = if opts.sudo {
            // sudo needs a PTY on most hardened hosts
            channel.request_pty("xterm", None, None).map_err(map_err)?;
            full_command = format!("sudo {}", command);
            full_command.as_str()
        } else {
            command
        };

        channel.exec(command_line).map_err(map_err)?;

        let mut stdout = String::new();
        channel.read_to_string(&mut stdout).map_err(|e| {
            if started.elapsed() >= opts.timeout {
                ConductorError::CommandTimeout {
                    host: host.to_string(),
                    command: command.to_string(),
                    timeout_secs: opts.timeout.as_secs(),
                }
            } else {
                ConductorError::Internal(format!("reading command output: {}", e))
            }
        })?;

        let mut stderr = String::new();
        let _ = channel.stderr().read_to_string(&mut stderr);

        channel.wait_close().map_err(map_err)?;
        let status = channel.exit_status().map_err(map_err)?;

        if status != 0 {
            let mut output = stdout;
            if !stderr.is_empty() {
                if !output.is_empty() {
                    output.push('\n');
                }
                output.push_str(&stderr);
            }
            return Err(ConductorError::CommandFailed {
                host: host.to_string(),
                command: command.to_string(),
                status,
                output: output.trim_end().to_string(),
            });
        }

        Ok(stdout.trim_end().to_string())
    }
}

#[async_trait]
impl CommandRunner for SshExecutor {
    async fn execute(&self, node: &Node, command: &str, opts: ExecOptions) -> Result<String> {
        let host = node.host().to_string();
        let port = node.ssh_port;
        let slot = self.slot_for((host.clone(), port));
        let config = self.config.clone();
        let command = command.to_string();

        debug!(host = %host, command = %command, sudo = opts.sudo, "Executing SSH command");
        crate::observability::record_ssh_command(opts.sudo);

        tokio::task::spawn_blocking(move || {
            let started = Instant::now();
            let mut guard = slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner());

            // Probe a reused session; discard it when the socket has died.
            if let Some(session) = guard.as_ref() {
                if session.keepalive_send().is_err() {
                    warn!(host = %host, "Pooled SSH session is dead, reconnecting");
                    *guard = None;
                }
            }

            if guard.is_none() {
                *guard = Some(Self::connect(&config, &host, port)?);
            }

            let session = guard.as_ref().expect("session populated above");
            let result = Self::run_on_session(session, &host, &command, opts, started);

            // Connection-level failures poison the session; command failures
            // (non-zero exit) leave it reusable.
            if matches!(
                result,
                Err(ConductorError::SshConnect { .. }) | Err(ConductorError::CommandTimeout { .. })
            ) {
                *guard = None;
            }

            result
        })
        .await
        .map_err(|e| ConductorError::Internal(format!("SSH task panicked: {}", e)))?
    }

    async fn dispose(&self) {
        let slots: Vec<SessionSlot> = {
            let mut pool = self.pool.lock();
            pool.drain().map(|(_, slot)| slot).collect()
        };

        let count = slots.len();
        if count == 0 {
            return;
        }

        tokio::task::spawn_blocking(move || {
            for slot in slots {
                let mut guard = slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
                if let Some(session) = guard.take() {
                    let _ = session.disconnect(None, "conductor shutting down", None);
                }
            }
        })
        .await
        .ok();

        info!(sessions = count, "Disposed SSH session pool");
    }
}
