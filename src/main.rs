//! Conductor CLI - Main entry point.

use conductor::broker::HttpBrokerClient;
use conductor::cli::{Cli, Commands};
use conductor::config::ConductorConfig;
use conductor::types::ClusterTopology;
use conductor::validator::ClusterValidator;
use std::sync::Arc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse_args();

    let mut config = match &cli.config {
        Some(path) => ConductorConfig::from_file(path)?,
        None => ConductorConfig::default(),
    };
    config = config.apply_env();
    config.observability.log_level = cli.log_level.clone();

    match cli.command {
        Commands::Serve {
            topology,
            bind,
            metrics_addr,
        } => {
            if let Some(bind) = bind {
                config.api.bind_addr = bind.parse()?;
            }
            if let Some(addr) = metrics_addr {
                config.observability.metrics_addr = addr.parse()?;
            }
            config.validate()?;

            let topology = ClusterTopology::from_file(&topology)?;
            conductor::run(config, topology).await?;
        }

        Commands::Validate { topology } => match ClusterTopology::from_file(&topology) {
            Ok(parsed) => {
                println!("Topology OK: {}", parsed.cluster_name);
                println!("Nodes ({}):", parsed.nodes.len());
                for node in parsed.ordered_nodes() {
                    println!(
                        "  {:>3}. {} ({}) ssh={} mgmt={}",
                        node.config_order,
                        node.name,
                        node.host(),
                        node.ssh_port,
                        node.management_port
                    );
                }
            }
            Err(e) => {
                eprintln!("Topology invalid: {}", e);
                std::process::exit(1);
            }
        },

        Commands::Check { topology } => {
            config.validate()?;
            let topology = Arc::new(ClusterTopology::from_file(&topology)?);
            let broker = Arc::new(HttpBrokerClient::new(
                &config.broker,
                &topology.nodes,
                config.restart.timeouts.api_timeout,
            )?);
            let validator = ClusterValidator::new(broker, Arc::clone(&topology));

            match validator.validate_rolling_restart(&config.restart).await {
                Ok(verdict) => {
                    println!(
                        "Cluster: {} ({}/{} nodes healthy)",
                        topology.cluster_name, verdict.healthy_nodes, verdict.total_nodes
                    );
                    if verdict.can_restart {
                        println!("Rolling restart: ADMITTED");
                    } else {
                        println!("Rolling restart: DENIED");
                        for reason in &verdict.reasons {
                            println!("  - {}", reason);
                        }
                        std::process::exit(1);
                    }
                }
                Err(e) => {
                    eprintln!("Admission check failed: {}", e);
                    std::process::exit(1);
                }
            }
        }

        Commands::Version => {
            println!("Conductor v{}", env!("CARGO_PKG_VERSION"));
            println!("Safe, sequenced rolling restarts for clustered RabbitMQ deployments");
        }
    }

    Ok(())
}
