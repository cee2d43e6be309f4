//! Process shutdown for the Conductor service.
//!
//! One trigger stops the admin API and metrics listeners; `run()` then
//! disposes the SSH session pool. A rolling restart that is mid-flight is
//! abandoned: run state is in-memory, so a node the run had placed into
//! maintenance mode stays there. The signal listener calls this out so the
//! operator knows to check the cluster before starting another run.

use crate::orchestrator::RestartOrchestrator;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, warn};

/// Watch-backed shutdown signal shared by the service's listeners.
#[derive(Clone)]
pub struct Shutdown {
    triggered: Arc<AtomicBool>,
    tx: Arc<watch::Sender<bool>>,
    rx: watch::Receiver<bool>,
}

impl Shutdown {
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        Self {
            triggered: Arc::new(AtomicBool::new(false)),
            tx: Arc::new(tx),
            rx,
        }
    }

    /// Trigger shutdown. Idempotent; only the first caller is logged.
    pub fn trigger(&self, source: &str) {
        if self
            .triggered
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            info!(source, "Shutting down: stopping admin API and metrics listeners");
            let _ = self.tx.send(true);
        }
    }

    /// Whether shutdown has been triggered.
    pub fn is_triggered(&self) -> bool {
        self.triggered.load(Ordering::SeqCst)
    }

    /// Resolves once shutdown has been triggered. Handed to the admin
    /// server as its graceful-shutdown future.
    pub async fn wait(&self) {
        let mut rx = self.rx.clone();
        // An Err means the sender side is gone, which only happens past
        // trigger time; stop either way.
        let _ = rx.wait_for(|triggered| *triggered).await;
    }

    /// Spawn the OS signal listener (SIGTERM/SIGINT/SIGQUIT).
    ///
    /// If a rolling restart is active when the signal arrives, its
    /// abandonment is logged: the current node may be left in maintenance
    /// mode, and the run cannot be resumed after the process exits.
    pub fn listen_for_signals(&self, orchestrator: Arc<RestartOrchestrator>) {
        let shutdown = self.clone();
        tokio::spawn(async move {
            let signal = wait_for_signal().await;
            if orchestrator.is_active() {
                warn!(
                    signal,
                    "Rolling restart in flight: run state is in-memory and will be \
                     abandoned; the current node may remain in maintenance mode. \
                     Validate the cluster before starting a new run."
                );
            }
            shutdown.trigger(signal);
        });
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(unix)]
async fn wait_for_signal() -> &'static str {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate()).expect("Failed to install SIGTERM handler");
    let mut sigint = signal(SignalKind::interrupt()).expect("Failed to install SIGINT handler");
    let mut sigquit = signal(SignalKind::quit()).expect("Failed to install SIGQUIT handler");

    tokio::select! {
        _ = sigterm.recv() => "SIGTERM",
        _ = sigint.recv() => "SIGINT",
        _ = sigquit.recv() => "SIGQUIT",
    }
}

#[cfg(windows)]
async fn wait_for_signal() -> &'static str {
    tokio::signal::ctrl_c()
        .await
        .expect("Failed to install Ctrl+C handler");
    "ctrl-c"
}
