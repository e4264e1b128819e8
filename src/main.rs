//! ccn-node: concept graph daemon
//!
//! Runs one graph node against a local IPFS daemon (or an in-memory
//! substrate with `--memory`) and serves the HTTP/WebSocket API.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use ccn_node::api::{create_router, ApiState};
use ccn_node::config::{Config, SubstrateKind};
use ccn_node::loader::StructureSource;
use ccn_node::substrate::{IpfsSubstrate, MemorySubstrate, Substrate};
use ccn_node::{Node, NodeSettings};

#[derive(Parser)]
#[command(name = "ccn-node")]
#[command(about = "Peer-replicated concept graph node")]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "ccn-node.toml")]
    config: PathBuf,

    /// HTTP API port (overrides config file)
    #[arg(long, env = "CCN_HTTP_PORT")]
    http_port: Option<u16>,

    /// Kubo RPC endpoint (overrides config file)
    #[arg(long, env = "CCN_IPFS_API")]
    ipfs_api: Option<String>,

    /// YAML concept structure to load at startup
    #[arg(long, env = "CCN_STRUCTURE_FILE")]
    structure: Option<PathBuf>,

    /// Run on the in-memory substrate instead of IPFS
    #[arg(long)]
    memory: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("ccn_node=info".parse()?))
        .init();

    let cli = Cli::parse();

    let mut config = Config::load_or_default(&cli.config)
        .with_context(|| format!("reading {}", cli.config.display()))?;

    // Apply CLI overrides
    if let Some(port) = cli.http_port {
        config.api.http_port = port;
    }
    if let Some(url) = cli.ipfs_api {
        config.substrate.api_url = url;
    }
    if let Some(structure) = cli.structure {
        config.bootstrap.structure_file = Some(structure);
    }
    if cli.memory {
        config.substrate.kind = SubstrateKind::Memory;
    }

    let substrate: Arc<dyn Substrate> = match config.substrate.kind {
        SubstrateKind::Ipfs => Arc::new(IpfsSubstrate::new(config.substrate.api_url.clone())),
        SubstrateKind::Memory => {
            warn!("Running on the in-memory substrate; state is lost on exit");
            Arc::new(MemorySubstrate::standalone(config.node.memory_peer_id.clone()))
        }
    };

    let settings = NodeSettings {
        gossip: config.gossip.settings(),
        bootstrap_peers: config.substrate.bootstrap_peers.clone(),
        structure: config
            .bootstrap
            .structure_file
            .clone()
            .map(StructureSource::File),
    };

    let node = Node::start(substrate, settings)
        .await
        .context("node startup failed")?;
    info!(peer = %node.peer_id(), owner = %node.owner_guid(), "Node ready");

    let tasks = node
        .spawn_tasks()
        .await
        .context("failed to start gossip")?;

    let app = create_router(Arc::new(ApiState {
        node: node.clone(),
        heartbeat: Duration::from_secs(config.api.heartbeat_secs.max(1)),
    }));

    let addr = SocketAddr::from(([0, 0, 0, 0], config.api.http_port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {}", addr))?;
    info!("API listening on http://{}", addr);

    let shutdown_node = node.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            tokio::signal::ctrl_c().await.ok();
            info!("Shutting down...");
            shutdown_node.shutdown();
        })
        .await?;

    for task in tasks {
        let _ = task.await;
    }
    info!("Stopped");
    Ok(())
}
