//! Burrow Server - tunnel relay CLI
//!
//! Binds the control listener, opens the configuration catalog and serves
//! agent sessions until interrupted.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use serde::{Deserialize, Serialize};
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use burrow_catalog::SqlCatalog;
use burrow_server::{ServerConfig, TunnelServer};

/// Burrow tunnel server - exposes services behind NAT through connected agents
#[derive(Parser, Debug)]
#[command(name = "burrow-server")]
#[command(about = "Burrow tunnel server - exposes services behind NAT through connected agents")]
#[command(version)]
struct Args {
    /// Control listener address agents connect to (default 0.0.0.0:7000)
    #[arg(long, env = "BURROW_BIND")]
    bind: Option<SocketAddr>,

    /// Database URL for the configuration catalog
    #[arg(long, env = "BURROW_DATABASE_URL")]
    database_url: Option<String>,

    /// Configuration file (YAML)
    #[arg(long, short = 'c')]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

/// Configuration file format; CLI args override these values.
#[derive(Debug, Default, Serialize, Deserialize)]
struct ConfigFile {
    #[serde(skip_serializing_if = "Option::is_none")]
    bind: Option<SocketAddr>,

    #[serde(skip_serializing_if = "Option::is_none")]
    database_url: Option<String>,

    /// Seconds without a heartbeat before a session is destroyed
    #[serde(skip_serializing_if = "Option::is_none")]
    heartbeat_timeout_secs: Option<u64>,

    /// Seconds a pending entry waits for its data connection
    #[serde(skip_serializing_if = "Option::is_none")]
    pending_timeout_secs: Option<u64>,

    /// Seconds between traffic meter flushes
    #[serde(skip_serializing_if = "Option::is_none")]
    flush_interval_secs: Option<u64>,
}

fn setup_logging(log_level: &str) -> Result<()> {
    let filter = EnvFilter::try_new(log_level)
        .with_context(|| format!("Invalid log level: {}", log_level))?;

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_thread_ids(false))
        .with(filter)
        .init();

    Ok(())
}

fn load_config_file(path: &PathBuf) -> Result<ConfigFile> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: ConfigFile = serde_yaml::from_str(&contents)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

    Ok(config)
}

/// Merge CLI args with the config file; CLI args win, defaults last.
fn build_server_config(args: &Args) -> Result<(ServerConfig, String)> {
    let file = match &args.config {
        Some(path) => {
            info!("Loading configuration from: {}", path.display());
            load_config_file(path)?
        }
        None => ConfigFile::default(),
    };

    let mut config = ServerConfig::default();
    if let Some(bind) = args.bind.or(file.bind) {
        config.bind_addr = bind;
    }
    if let Some(secs) = file.heartbeat_timeout_secs {
        config.heartbeat_timeout = Duration::from_secs(secs);
    }
    if let Some(secs) = file.pending_timeout_secs {
        config.pending_timeout = Duration::from_secs(secs);
    }
    if let Some(secs) = file.flush_interval_secs {
        config.flush_interval = Duration::from_secs(secs);
    }

    let database_url = args
        .database_url
        .clone()
        .or(file.database_url)
        .unwrap_or_else(|| "sqlite://burrow.db?mode=rwc".to_string());
    Ok((config, database_url))
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    setup_logging(&args.log_level)?;

    info!("Burrow Server starting...");

    let (config, database_url) = build_server_config(&args)?;

    let db = burrow_catalog::connect(&database_url)
        .await
        .with_context(|| format!("Failed to open catalog database: {}", database_url))?;
    burrow_catalog::migrate(&db)
        .await
        .context("Failed to run catalog migrations")?;
    let catalog = Arc::new(SqlCatalog::new(db));

    let server = TunnelServer::bind(config, catalog)
        .await
        .context("Failed to bind control listener")?;
    info!("Control listener on {}", server.local_addr());

    tokio::select! {
        result = server.serve() => {
            if let Err(e) = result {
                error!("Server error: {:#}", e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down...");
        }
    }

    server.shutdown().await;
    info!("Server stopped");
    Ok(())
}
