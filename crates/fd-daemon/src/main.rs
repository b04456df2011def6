//! fd-daemon: runs node fault detection over WebSocket connections.

use anyhow::Result;
use clap::Parser;
use fault_detection::NodeId;
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;

use fd_daemon::{Daemon, DaemonConfig};

#[derive(Parser, Debug)]
#[command(name = "fd-daemon")]
#[command(about = "Node fault detection daemon")]
struct Args {
    /// Directory holding config.json (created with defaults if missing)
    #[arg(short, long, default_value = ".fd-daemon")]
    config_dir: PathBuf,

    /// Address to listen on for incoming connections
    #[arg(short, long)]
    listen: Option<String>,

    /// Seed node address to discover (repeatable)
    #[arg(short, long = "seed")]
    seeds: Vec<String>,

    /// Cluster name
    #[arg(long)]
    cluster_name: Option<String>,

    /// Node name
    #[arg(long)]
    name: Option<String>,

    /// Node ID as 32 hex characters (generated if not provided)
    #[arg(long)]
    node_id: Option<NodeId>,

    /// Enable verbose logging
    #[arg(long)]
    verbose: bool,
}

impl Args {
    /// Command-line values take precedence over the config file.
    fn apply(self, config: &mut DaemonConfig) {
        if let Some(listen) = self.listen {
            config.listen = listen;
        }
        if !self.seeds.is_empty() {
            config.seeds = self.seeds;
        }
        if let Some(cluster_name) = self.cluster_name {
            config.cluster_name = cluster_name;
        }
        if let Some(name) = self.name {
            config.node_name = name;
        }
        if self.node_id.is_some() {
            config.node_id = self.node_id;
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // respects RUST_LOG, defaults to info (or debug with --verbose)
    let default_filter = if args.verbose {
        "debug,fd_daemon=debug,fault_detection=debug"
    } else {
        "info,fd_daemon=info,fault_detection=info"
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("Starting fd-daemon");
    info!("Config directory: {:?}", args.config_dir);

    let mut config = DaemonConfig::load(&args.config_dir)?;
    args.apply(&mut config);
    info!("Cluster: {}, seeds: {:?}", config.cluster_name, config.seeds);

    let daemon = Daemon::start(config).await?;
    info!("Daemon running as {}. Press Ctrl+C to stop.", daemon.local_node());

    daemon
        .run(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("Failed to listen for Ctrl+C: {}", e);
            }
        })
        .await;

    Ok(())
}
