//! pulsed: the PulseGrid heartbeat daemon.
//!
//! Single binary that assembles the heartbeat subsystems of a node:
//! - Cluster data store (redb)
//! - Cluster bus
//! - Heartbeat control core and peer-drop supervisor
//! - Heartbeat transports (unicast, multicast, disk, relay)
//! - Configuration watcher
//!
//! # Usage
//!
//! ```text
//! pulsed run --config /etc/pulsegrid/cluster.toml --data-dir /var/lib/pulsegrid
//! pulsed check --config /etc/pulsegrid/cluster.toml
//! pulsed relay --listen 0.0.0.0:8080
//! ```

mod config_watch;
mod daemon;
mod recorder;

use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use pulse_core::ClusterConfig;
use tokio_util::sync::CancellationToken;
use tracing::info;

#[derive(Parser)]
#[command(name = "pulsed", about = "PulseGrid heartbeat daemon")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the heartbeat agent of this node.
    Run {
        /// Cluster configuration file.
        #[arg(long, default_value = "/etc/pulsegrid/cluster.toml")]
        config: PathBuf,

        /// Data directory for the cluster data store.
        #[arg(long, default_value = "/var/lib/pulsegrid")]
        data_dir: PathBuf,
    },
    /// Validate a configuration file and print the resolved heartbeats.
    Check {
        #[arg(long, default_value = "/etc/pulsegrid/cluster.toml")]
        config: PathBuf,
    },
    /// Run a heartbeat relay for nodes using the relay transport.
    Relay {
        #[arg(long, default_value = "0.0.0.0:8080")]
        listen: SocketAddr,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,pulsed=debug,pulsegrid=debug")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Run { config, data_dir } => daemon::run(config, data_dir).await,
        Command::Check { config } => check(config),
        Command::Relay { listen } => relay(listen).await,
    }
}

fn check(path: PathBuf) -> anyhow::Result<()> {
    let config = ClusterConfig::from_file(&path)
        .with_context(|| format!("invalid configuration {}", path.display()))?;

    println!(
        "cluster {} node {} ({} peers), maintenance grace period {:?}",
        config.cluster.name,
        config.node.name,
        config.peers().len(),
        config.maintenance_grace_period()?
    );
    for hb in &config.hb {
        println!(
            "  {:<16} {:<10} interval {:?} timeout {:?}",
            hb.tx_id(),
            hb.driver.kind().as_str(),
            hb.interval()?,
            hb.timeout()?
        );
        println!(
            "  {:<16} {:<10} interval {:?} timeout {:?}",
            hb.rx_id(),
            hb.driver.kind().as_str(),
            hb.interval()?,
            hb.timeout()?
        );
    }
    if config.hb.is_empty() {
        println!("  no heartbeats configured");
    }
    Ok(())
}

async fn relay(listen: SocketAddr) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(listen)
        .await
        .with_context(|| format!("failed to bind relay on {listen}"))?;
    let token = CancellationToken::new();
    let server = tokio::spawn(pulsegrid_transport::relay::serve(listener, token.clone()));

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");
    token.cancel();
    server.await??;
    Ok(())
}
