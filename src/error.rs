//! Error types for Conductor.
//!
//! This module provides a unified error type [`ConductorError`] for all
//! Conductor operations, along with a convenient [`Result`] type alias.
//!
//! # Error Categories
//!
//! Errors are organized into the following categories:
//!
//! - **Configuration**: invalid settings, topology files, or environment
//! - **Admission**: the cluster is not in a state that permits a restart
//! - **Broker API**: failures talking to the RabbitMQ management API
//! - **SSH**: connection and command-execution failures on cluster hosts
//! - **Node operation**: a restart step failed for a specific node
//! - **Concurrency**: restart lifecycle violations (double start, idle cancel)
//!
//! # Example
//!
//! ```rust
//! use conductor::error::{ConductorError, Result};
//!
//! fn require_nodes(count: usize) -> Result<()> {
//!     if count < 2 {
//!         return Err(ConductorError::AdmissionDenied {
//!             reasons: vec!["cluster requires at least 2 nodes".into()],
//!         });
//!     }
//!     Ok(())
//! }
//! ```

use std::io;
use thiserror::Error;

/// Main error type for Conductor operations.
#[derive(Error, Debug)]
pub enum ConductorError {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration: {field}: {reason}")]
    InvalidConfig { field: String, reason: String },

    #[error("Topology error: {0}")]
    Topology(String),

    // Admission errors
    #[error("Rolling restart admission denied: {}", reasons.join("; "))]
    AdmissionDenied { reasons: Vec<String> },

    // Broker management API errors
    #[error("Cannot connect to management API at {0}")]
    BrokerUnreachable(String),

    #[error("Management API authentication failed for {0}")]
    BrokerAuth(String),

    #[error("Management API endpoint not found: {0}")]
    BrokerEndpointMissing(String),

    #[error("Management API error ({status}): {message}")]
    BrokerApi { status: u16, message: String },

    // SSH errors
    #[error("SSH connection to {host}:{port} failed: {reason}")]
    SshConnect {
        host: String,
        port: u16,
        reason: String,
    },

    #[error("SSH authentication for {0} is not configured: set a key path or password")]
    SshAuthMissing(String),

    #[error("SSH authentication failed for {host}: {reason}")]
    SshAuth { host: String, reason: String },

    #[error("Command `{command}` on {host} exited with status {status}: {output}")]
    CommandFailed {
        host: String,
        command: String,
        status: i32,
        output: String,
    },

    #[error("Command `{command}` on {host} timed out after {timeout_secs}s")]
    CommandTimeout {
        host: String,
        command: String,
        timeout_secs: u64,
    },

    // Node operation errors
    #[error("Node not found: {0}")]
    NodeNotFound(String),

    #[error("Node {node} failed to become healthy within {timeout_secs}s")]
    HealthWaitExceeded { node: String, timeout_secs: u64 },

    #[error("Node operation failed on {node}: {reason}")]
    NodeOperation { node: String, reason: String },

    // Concurrency violations
    #[error("Rolling restart already in progress")]
    RestartInProgress,

    #[error("No rolling restart is active")]
    NoActiveRestart,

    #[error("Rolling restart was cancelled")]
    Cancelled,

    // Network / timeout
    #[error("Request timeout after {0}ms")]
    Timeout(u64),

    #[error("Network error: {0}")]
    Network(String),

    // Serialization
    #[error("Serialization error: {0}")]
    Serialization(String),

    // External errors
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ConductorError {
    /// Map to the HTTP status code the admin API reports for this error.
    pub fn to_status_code(&self) -> u16 {
        match self {
            ConductorError::AdmissionDenied { .. }
            | ConductorError::RestartInProgress
            | ConductorError::NoActiveRestart
            | ConductorError::InvalidConfig { .. }
            | ConductorError::Topology(_) => 400,
            ConductorError::BrokerAuth(_) => 401,
            ConductorError::NodeNotFound(_) => 404,
            ConductorError::BrokerUnreachable(_) => 503,
            _ => 500,
        }
    }

    /// Check whether the error is a transient observation failure.
    ///
    /// Transient errors are tolerated by the drain and health-wait polling
    /// loops; everything else fails the current node.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ConductorError::BrokerUnreachable(_)
                | ConductorError::BrokerApi {
                    status: 500..=599,
                    ..
                }
                | ConductorError::Timeout(_)
                | ConductorError::Network(_)
        )
    }

    /// Classify a non-success management-API response by HTTP status.
    pub fn from_broker_response(endpoint: &str, status: u16, body: String) -> Self {
        match status {
            401 => ConductorError::BrokerAuth(endpoint.to_string()),
            404 => ConductorError::BrokerEndpointMissing(endpoint.to_string()),
            _ => ConductorError::BrokerApi {
                status,
                message: if body.is_empty() {
                    format!("{} returned HTTP {}", endpoint, status)
                } else {
                    body
                },
            },
        }
    }
}

impl From<reqwest::Error> for ConductorError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_connect() {
            ConductorError::BrokerUnreachable(e.url().map(|u| u.to_string()).unwrap_or_default())
        } else if e.is_timeout() {
            ConductorError::Network(format!("request timed out: {}", e))
        } else if e.is_decode() {
            ConductorError::Serialization(e.to_string())
        } else {
            ConductorError::Network(e.to_string())
        }
    }
}

impl From<serde_json::Error> for ConductorError {
    fn from(e: serde_json::Error) -> Self {
        ConductorError::Serialization(e.to_string())
    }
}

impl From<serde_yaml::Error> for ConductorError {
    fn from(e: serde_yaml::Error) -> Self {
        ConductorError::Topology(e.to_string())
    }
}

/// Result type alias for Conductor operations.
pub type Result<T> = std::result::Result<T, ConductorError>;
