//! Segcopy Node - runs the segment copy services of one cluster member
//!
//! - Opens the store of every shard placed on this node
//! - Serves inbound copy requests on the configured TCP address
//! - Drives copies from local primaries to their replicas
//! - Periodically commits new files on local primaries

mod config;
mod node;

use clap::Parser;
use std::path::PathBuf;
use tokio::sync::oneshot;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Segcopy node CLI arguments
#[derive(Parser, Debug)]
#[command(name = "segcopy-node")]
#[command(about = "Segment copy node: replicates shard segment files from primaries to replicas", long_about = None)]
struct Args {
    /// Path to the node configuration (TOML)
    #[arg(long, short = 'c')]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(long, short = 'v')]
    verbose: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let filter = if args.verbose {
        tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| "segcopy_core=debug,segcopy_node=debug".into())
    } else {
        tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| "segcopy_core=info,segcopy_node=info".into())
    };
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = config::NodeConfig::load(args.config.as_deref())?;
    info!(
        "Starting node {} on {} (data dir {:?}, {} peers, {} shards configured)",
        config.node_id,
        config.bind_addr,
        config.data_dir,
        config.peers.len(),
        config.shards.len()
    );

    let node = node::Node::build(config)?;

    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Received Ctrl-C, shutting down"),
            Err(e) => tracing::error!("Failed to listen for Ctrl-C: {}", e),
        }
        let _ = shutdown_tx.send(());
    });

    node.run(shutdown_rx).await?;
    info!("Node stopped");
    Ok(())
}
