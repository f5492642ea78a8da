//! fleetgated - The fleetgate background service
//!
//! This is the main entry point for the fleetgated service.
//! It wires together all the components:
//! - Configuration loading
//! - Store initialization
//! - Access engine
//! - HTTP API

use anyhow::{Context, Result};
use clap::Parser;
use fleetgate_config::{load_config, ServiceConfig};
use fleetgate_core::{AccessEngine, EngineConfig};
use fleetgate_store::{SqliteStore, Store};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal::unix::{signal, SignalKind};
use tracing::info;
use tracing_subscriber::EnvFilter;

mod http;

/// fleetgated - Machine access control and usage tracking service
#[derive(Parser, Debug)]
#[command(name = "fleetgated")]
#[command(about = "Machine access control and usage tracking service", long_about = None)]
struct Args {
    /// Configuration file path
    #[arg(short, long, env = "FLEETGATE_CONFIG")]
    config: Option<PathBuf>,

    /// Listen address override (or set FLEETGATE_LISTEN env var)
    #[arg(short, long, env = "FLEETGATE_LISTEN")]
    listen: Option<SocketAddr>,

    /// Data directory override (or set FLEETGATE_DATA_DIR env var)
    #[arg(short, long, env = "FLEETGATE_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Log level
    #[arg(short = 'L', long, default_value = "info")]
    log_level: String,
}

fn build_config(args: &Args) -> Result<ServiceConfig> {
    let mut config = match &args.config {
        Some(path) => load_config(path)
            .with_context(|| format!("Failed to load config from {:?}", path))?,
        None => ServiceConfig::default(),
    };

    if let Some(listen) = args.listen {
        config.listen_addr = listen;
    }
    if let Some(data_dir) = &args.data_dir {
        config.data_dir = data_dir.clone();
    }
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "fleetgated starting");

    let config = build_config(&args)?;

    info!(
        listen_addr = %config.listen_addr,
        data_dir = %config.data_dir.display(),
        single_open_session = config.enforce_single_open_session_per_machine,
        "Configuration loaded"
    );

    // Create data directory
    std::fs::create_dir_all(&config.data_dir)
        .with_context(|| format!("Failed to create data directory {:?}", config.data_dir))?;

    // Initialize store
    let db_path = config.db_path();
    let store: Arc<dyn Store> = Arc::new(
        SqliteStore::open(&db_path)
            .with_context(|| format!("Failed to open database {:?}", db_path))?,
    );

    info!(db_path = %db_path.display(), "Store initialized");

    // Initialize access engine
    let engine = Arc::new(AccessEngine::new(
        store,
        EngineConfig {
            enforce_single_open_session_per_machine: config
                .enforce_single_open_session_per_machine,
        },
    ));

    let app = http::router(http::AppState { engine });

    let listener = tokio::net::TcpListener::bind(config.listen_addr)
        .await
        .with_context(|| format!("Failed to bind {}", config.listen_addr))?;

    info!(listen_addr = %config.listen_addr, "Service running");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let mut sigterm = signal(SignalKind::terminate()).expect("Failed to create SIGTERM handler");
    let mut sigint = signal(SignalKind::interrupt()).expect("Failed to create SIGINT handler");

    tokio::select! {
        _ = sigterm.recv() => {
            info!("Received SIGTERM, shutting down gracefully");
        }
        _ = sigint.recv() => {
            info!("Received SIGINT, shutting down gracefully");
        }
    }
}
