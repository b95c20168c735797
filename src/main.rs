//! CLI entry point: `serve` runs the TCP server against a data root;
//! `describe` is a diagnostic client that prints `GetCollectionsDescription`
//! output. Out of the core's scope per the spec, but needed to exercise the
//! stack end to end (`SPEC_FULL §6.4`).

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use frostbox_client::Connector;
use frostbox_server::{bind_listener, serve, ServerConfig};
use frostbox_store::DataStore;
use serde::Deserialize;
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "frostbox", about = "Replicated, versioned, read-optimized key-value store")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Runs the TCP server against a data root directory.
    Serve {
        /// Path to a TOML settings file (see `ServerFileConfig`).
        #[arg(long)]
        config: Option<PathBuf>,
        /// Overrides the bind port from the config file; 0 means OS-chosen.
        #[arg(long)]
        port: Option<u16>,
        /// Overrides the data root directory from the config file.
        #[arg(long)]
        root: Option<PathBuf>,
        #[arg(long, env = "FROSTBOX_LOG", default_value = "info")]
        log_level: String,
    },
    /// Connects to a running server and prints its collections description.
    Describe {
        #[arg(long, default_value = "127.0.0.1")]
        host: String,
        #[arg(long)]
        port: u16,
    },
}

/// The on-disk shape of `serve --config`: bind address, data root, and the
/// per-collection sizing defaults in [`ServerConfig`] (`SPEC_FULL §6.4`).
#[derive(Debug, Deserialize)]
struct ServerFileConfig {
    #[serde(default = "default_bind_addr")]
    bind_addr: SocketAddr,
    #[serde(default = "default_root")]
    root: PathBuf,
    #[serde(default)]
    limits: ServerConfig,
}

fn default_bind_addr() -> SocketAddr {
    "127.0.0.1:7878".parse().unwrap()
}

fn default_root() -> PathBuf {
    PathBuf::from("./frostbox-data")
}

impl Default for ServerFileConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            root: default_root(),
            limits: ServerConfig::default(),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Command::Serve { config, port, root, log_level } => run_serve(config, port, root, log_level).await,
        Command::Describe { host, port } => run_describe(host, port).await,
    }
}

async fn run_serve(
    config_path: Option<PathBuf>,
    port_override: Option<u16>,
    root_override: Option<PathBuf>,
    log_level: String,
) -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_new(&log_level).unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let mut file_config = match &config_path {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("reading config file {}", path.display()))?;
            toml::from_str(&text).with_context(|| format!("parsing config file {}", path.display()))?
        }
        None => ServerFileConfig::default(),
    };
    if let Some(port) = port_override {
        file_config.bind_addr.set_port(port);
    }
    if let Some(root) = root_override {
        file_config.root = root;
    }

    let store = Arc::new(DataStore::new(&file_config.root));
    store.open().context("opening data store")?;

    let listener = bind_listener(file_config.bind_addr).context("binding listener")?;
    let local_addr = listener.local_addr().context("reading bound address")?;
    tracing::info!(%local_addr, root = %file_config.root.display(), "frostbox server starting");

    let (shutdown_tx, shutdown_rx) = watch::channel(());
    let serve_task = tokio::spawn(serve(listener, store, Arc::new(file_config.limits), shutdown_rx));

    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
    tracing::info!("shutdown requested");
    let _ = shutdown_tx.send(());
    let _ = serve_task.await;
    Ok(())
}

async fn run_describe(host: String, port: u16) -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new("info"))
        .init();

    let mut connector = Connector::connect(&host, port)
        .await
        .with_context(|| format!("connecting to {host}:{port}"))?;
    let collections = connector
        .get_collections_description()
        .await
        .context("requesting collections description")?;

    if collections.is_empty() {
        println!("(no collections)");
        return Ok(());
    }
    for collection in collections {
        println!(
            "{}: {} objects, {} bytes, last_version={}, keys={:?}, segment_file_size={}, max_objects_per_segment={}",
            collection.name,
            collection.count,
            collection.size_in_bytes,
            collection.last_version.as_deref().unwrap_or("(none)"),
            collection.key_names,
            collection.segment_file_size,
            collection.max_objects_per_segment,
        );
    }
    Ok(())
}
