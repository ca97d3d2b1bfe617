use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use mlcoord::config::NodeConfig;
use mlcoord::node::Node;
use mlcoord::shutdown::install_shutdown_handler;

#[derive(Parser, Debug)]
#[command(name = "mlcoord")]
#[command(about = "Replicated job coordination for distributed ML training")]
struct Args {
    /// Unique ID for this node, of the form node-<i>
    #[arg(long, default_value = "node-1")]
    id: String,

    /// Address for the consensus transport
    #[arg(long, default_value = "127.0.0.1:7000")]
    raft: SocketAddr,

    /// Address for the HTTP control API
    #[arg(long, default_value = "127.0.0.1:8000")]
    http: SocketAddr,

    /// Bootstrap a new single-server cluster (first node only)
    #[arg(long)]
    bootstrap: bool,

    /// Data directory; defaults to raft-data/<id>
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Number of shards each parent job splits into
    #[arg(long, default_value = "3")]
    cluster_size: u32,

    /// Trainer command line
    #[arg(long, default_value = "python3 ml-code/train.py")]
    trainer: String,

    /// Merger command line
    #[arg(long, default_value = "python3 ml-code/merge.py")]
    merger: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let config = NodeConfig {
        node_id: args.id.clone(),
        raft_addr: args.raft,
        http_addr: args.http,
        data_dir: args
            .data_dir
            .unwrap_or_else(|| PathBuf::from("raft-data").join(&args.id)),
        bootstrap: args.bootstrap,
        cluster_size: args.cluster_size,
        trainer_cmd: args.trainer,
        merger_cmd: args.merger,
        ..NodeConfig::default()
    };

    tracing::info!(
        node_id = %config.node_id,
        raft_addr = %config.raft_addr,
        http_addr = %config.http_addr,
        bootstrap = config.bootstrap,
        cluster_size = config.cluster_size,
        "starting mlcoord node"
    );

    let shutdown = install_shutdown_handler();
    let (node, raft_rx) = Node::new(config, shutdown)?;
    node.run(raft_rx).await?;

    Ok(())
}
