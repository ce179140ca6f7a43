//! Fidias node daemon
//!
//! Exit codes: 1 invalid bind address, 2 missing data directory, 3 bind
//! failure.

use anyhow::{Context, Result};
use clap::Parser;
use fidias_client::{RpcHandler, TcpTransport, serve};
use fidias_common::Config;
use fidias_common::config::{LoggingConfig, StorageBackend};
use fidias_node::FidiasNode;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

const EXIT_INVALID_ADDRESS: i32 = 1;
const EXIT_MISSING_DATA_DIR: i32 = 2;
const EXIT_BIND_FAILED: i32 = 3;

#[derive(Parser, Debug)]
#[command(name = "fidias-node")]
#[command(about = "Fidias storage node")]
#[command(version)]
struct Args {
    /// Configuration file path (TOML)
    #[arg(short, long, env = "FIDIAS_CONFIG")]
    config: Option<PathBuf>,

    /// Node name
    #[arg(long)]
    name: Option<String>,

    /// Listen address (host:port)
    #[arg(short, long)]
    bind: Option<String>,

    /// Address other members reach this node on, if not the bind address
    #[arg(long)]
    advertise: Option<String>,

    /// Data directory for disk-backed stores
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Member to join at startup (repeatable)
    #[arg(long = "seed")]
    seeds: Vec<String>,

    /// Use disk-backed stores
    #[arg(long)]
    disk: bool,

    /// Log filter when RUST_LOG is unset
    #[arg(long)]
    log_level: Option<String>,

    /// Emit JSON log lines
    #[arg(long)]
    log_json: bool,
}

/// Defaults, then the config file, then `FIDIAS__*` variables, then flags
fn load_config(args: &Args) -> Result<Config> {
    let mut builder = config::Config::builder();
    if let Some(path) = &args.config {
        builder = builder.add_source(config::File::from(path.as_path()));
    }
    let mut cfg: Config = builder
        .add_source(
            config::Environment::with_prefix("FIDIAS")
                .separator("__")
                .try_parsing(true)
                .list_separator(",")
                .with_list_parse_key("node.seeds"),
        )
        .build()
        .context("failed to load configuration")?
        .try_deserialize()
        .context("invalid configuration")?;

    if let Some(name) = &args.name {
        cfg.node.name.clone_from(name);
    }
    if let Some(bind) = &args.bind {
        cfg.node.bind_address.clone_from(bind);
    }
    if let Some(advertise) = &args.advertise {
        cfg.node.advertise_address = Some(advertise.clone());
    }
    if let Some(dir) = &args.data_dir {
        cfg.node.data_dir.clone_from(dir);
    }
    if !args.seeds.is_empty() {
        cfg.node.seeds.clone_from(&args.seeds);
    }
    if args.disk {
        cfg.storage.backend = StorageBackend::Disk;
    }
    if let Some(level) = &args.log_level {
        cfg.logging.level.clone_from(level);
    }
    if args.log_json {
        cfg.logging.json = true;
    }
    Ok(cfg)
}

fn init_tracing(logging: &LoggingConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level));
    let registry = tracing_subscriber::registry().with(filter);
    if logging.json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = load_config(&args)?;
    init_tracing(&config.logging);

    info!("Starting Fidias node {}", config.node.name);

    let bind: SocketAddr = match config.node.bind_address.parse() {
        Ok(addr) => addr,
        Err(e) => {
            error!("Invalid bind address {}: {}", config.node.bind_address, e);
            std::process::exit(EXIT_INVALID_ADDRESS);
        }
    };
    if config.storage.backend == StorageBackend::Disk && !config.node.data_dir.is_dir() {
        error!("Data directory {} does not exist", config.node.data_dir.display());
        std::process::exit(EXIT_MISSING_DATA_DIR);
    }

    let max_frame = config.transport.max_frame_size;
    let transport = Arc::new(TcpTransport::new(config.transport.clone()));
    let node = FidiasNode::new(config, transport.clone()).context("failed to build node")?;

    let listener = match TcpListener::bind(bind).await {
        Ok(listener) => listener,
        Err(e) => {
            error!("Cannot bind {}: {}", bind, e);
            std::process::exit(EXIT_BIND_FAILED);
        }
    };

    node.start();
    let reaper = transport.pool().spawn_reaper(node.cancel_token());
    let handler: Arc<dyn RpcHandler> = node.clone();
    let server = tokio::spawn(serve(listener, handler, max_frame, node.cancel_token()));

    if !node.config().node.seeds.is_empty() {
        match node.join_seeds().await {
            Ok(learned) => info!(
                "Learned {} members, {} hosts in the ring",
                learned,
                node.ring().snapshot().host_count()
            ),
            Err(e) => warn!("Could not join any seed: {}", e),
        }
    }

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("Shutting down...");
    node.shutdown().await;
    for task in [server, reaper] {
        if let Err(e) = task.await {
            warn!("Task ended abnormally: {}", e);
        }
    }

    info!("Fidias node shut down gracefully");
    Ok(())
}
