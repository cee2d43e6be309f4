//! Command-line interface for Conductor.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Conductor - safe, sequenced rolling restarts for clustered RabbitMQ.
#[derive(Parser)]
#[command(name = "conductor")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Configuration file path (JSON)
    #[arg(short, long, env = "CONDUCTOR_CONFIG")]
    pub config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, env = "CONDUCTOR_LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands.
#[derive(Subcommand)]
pub enum Commands {
    /// Start the Conductor admin service
    Serve {
        /// Topology file (YAML)
        #[arg(short, long, env = "CONDUCTOR_TOPOLOGY", default_value = "topology.yaml")]
        topology: PathBuf,

        /// Bind address for the admin API
        #[arg(long)]
        bind: Option<String>,

        /// Bind address for the metrics server
        #[arg(long)]
        metrics_addr: Option<String>,
    },

    /// Validate a topology file and exit
    Validate {
        /// Topology file (YAML)
        #[arg(default_value = "topology.yaml")]
        topology: PathBuf,
    },

    /// Preview restart admission against the live cluster
    Check {
        /// Topology file (YAML)
        #[arg(short, long, env = "CONDUCTOR_TOPOLOGY", default_value = "topology.yaml")]
        topology: PathBuf,
    },

    /// Show version information
    Version,
}

impl Cli {
    /// Parse command-line arguments.
    pub fn parse_args() -> Self {
        Self::parse()
    }
}
