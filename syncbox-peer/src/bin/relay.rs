//! Syncbox session relay
//!
//! Assigns peer ids, tracks membership and fans every peer broadcast out
//! to all connected peers.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use syncbox_peer::config::RelayConfig;
use syncbox_peer::logging::init_tracing;
use syncbox_peer::session::RelayServer;
use tokio::signal;
use tracing::info;

/// Command-line arguments for syncbox-relay
#[derive(Parser, Debug)]
#[command(name = "syncbox-relay")]
#[command(about = "Session relay for Syncbox peers")]
#[command(version)]
struct Args {
    /// Config file (default: <config_dir>/syncbox/relay.toml)
    #[arg(short, long, env = "SYNCBOX_RELAY_CONFIG")]
    config: Option<PathBuf>,

    /// Listen address, host:port
    #[arg(short, long, env = "SYNCBOX_RELAY_BIND")]
    bind: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "SYNCBOX_LOG_LEVEL")]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config =
        RelayConfig::load(args.config.as_deref()).context("Failed to load configuration")?;
    if let Some(bind) = args.bind {
        config.bind = bind;
    }
    if let Some(level) = args.log_level {
        config.logging.level = level;
    }

    init_tracing(&config.logging, &["syncbox_peer", "syncbox_relay"])
        .context("Failed to initialize logging")?;

    info!("Starting Syncbox relay v{}", env!("CARGO_PKG_VERSION"));

    let server = RelayServer::bind(config.bind.as_str())
        .await
        .with_context(|| format!("Failed to bind relay to {}", config.bind))?;

    tokio::select! {
        result = server.serve() => {
            result.context("Relay error")?;
        }
        _ = signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down");
        }
    }

    info!("Relay shutdown complete");
    Ok(())
}
