//! Tether RPC Server - hosts the document engine behind the Tether transport.
//!
//! Serves the framed socket protocol on one port and an HTTP `/health` probe on
//! another. Both ports are printed to stdout so a parent process can find them.

mod engine;
mod health;

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tether_core::{AutosaveMode, Persistence, RpcServer, ServerConfig};
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser, Debug)]
#[command(name = "tether-rpc")]
#[command(about = "Tether RPC server for the document engine")]
struct Args {
    /// Transport port (0 = auto-assign). Overrides the config file.
    #[arg(short, long)]
    port: Option<u16>,

    /// Host to bind to. Overrides the config file.
    #[arg(long)]
    host: Option<String>,

    /// Port for the HTTP health endpoint (0 = auto-assign)
    #[arg(long, default_value = "0")]
    http_port: u16,

    /// Shared key clients must present in the handshake
    #[arg(long)]
    auth_key: Option<String>,

    /// JSON snapshot file; loaded at startup, written by autosave
    #[arg(long)]
    data_file: Option<PathBuf>,

    /// Server config as a JSON file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Autosave policy: "burst" or "inactivity"
    #[arg(long)]
    autosave_mode: Option<String>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

fn load_config(args: &Args) -> Result<ServerConfig> {
    let mut config = match &args.config {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("reading config {}", path.display()))?;
            ServerConfig::from_json(&text)?
        }
        None => ServerConfig::default(),
    };

    if let Some(host) = &args.host {
        config.host = host.clone();
    }
    if let Some(port) = args.port {
        config.port = port;
    }
    if let Some(key) = &args.auth_key {
        config.auth_key = Some(key.clone());
    }
    if let Some(mode) = &args.autosave_mode {
        config.autosave.mode = mode.parse::<AutosaveMode>()?;
    }

    config.validate()?;
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Set up logging
    let log_level = if args.debug { Level::DEBUG } else { Level::INFO };
    FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .with_thread_ids(false)
        .compact()
        .init();

    info!("Starting Tether RPC Server");

    let config = load_config(&args)?;
    let host = config.host.clone();

    let store = Arc::new(engine::DocumentStore::new(args.data_file.clone()));
    match store.data_file() {
        Some(path) => info!("Data file: {}", path.display()),
        None => info!("No data file; state is kept in memory only"),
    }
    info!(
        "Autosave: {} ({})",
        if config.autosave.enabled { "on" } else { "off" },
        config.autosave.mode
    );

    let registry = engine::registry(&store)?;
    let persistence: Arc<dyn Persistence> = store;

    let mut server = RpcServer::start(registry, persistence, config).await?;
    let http_addr = health::start_health_server(&host, args.http_port).await?;

    // Ports for the parent process (intentional stdout)
    println!("RPC_PORT={}", server.port);
    println!("HTTP_PORT={}", http_addr.port());

    info!("Transport on {}, health on {}", server.addr(), http_addr);

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received, saving and exiting");
    server.shutdown().await;

    Ok(())
}
