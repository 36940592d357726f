//! Syncbox peer node - Main entry point
//!
//! Joins a relay session, keeps a local cache of decoded resources and
//! plays every peer's requests in sync with the rest of the session.
//! Controlled through the HTTP API.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use syncbox_common::events::EventBus;
use syncbox_peer::api::{self, AppContext};
use syncbox_peer::config::{OutputKind, PeerConfig};
use syncbox_peer::logging::init_tracing;
use syncbox_peer::pipeline::SymphoniaDecoder;
use syncbox_peer::session::RelaySession;
use syncbox_peer::{NodeServices, PeerNode};
use tokio::signal;
use tracing::{info, warn};

/// Command-line arguments for syncbox-peer
#[derive(Parser, Debug)]
#[command(name = "syncbox-peer")]
#[command(about = "Synchronized playback peer node")]
#[command(version)]
struct Args {
    /// Config file (default: <config_dir>/syncbox/peer.toml)
    #[arg(short, long, env = "SYNCBOX_CONFIG")]
    config: Option<PathBuf>,

    /// Relay address, host:port
    #[arg(short, long, env = "SYNCBOX_RELAY")]
    relay: Option<String>,

    /// HTTP API port
    #[arg(short, long, env = "SYNCBOX_PORT")]
    port: Option<u16>,

    /// Disable the HTTP API
    #[arg(long)]
    no_http: bool,

    /// Audio output
    #[arg(long, value_enum, env = "SYNCBOX_OUTPUT")]
    output: Option<OutputKind>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "SYNCBOX_LOG_LEVEL")]
    log_level: Option<String>,
}

impl Args {
    /// Apply CLI/env overrides on top of the file config
    fn apply(&self, config: &mut PeerConfig) {
        if let Some(relay) = &self.relay {
            config.session.relay_addr = relay.clone();
        }
        if let Some(port) = self.port {
            config.http.port = port;
        }
        if self.no_http {
            config.http.enabled = false;
        }
        if let Some(output) = self.output {
            config.audio.output = output;
        }
        if let Some(level) = &self.log_level {
            config.logging.level = level.clone();
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config =
        PeerConfig::load(args.config.as_deref()).context("Failed to load configuration")?;
    args.apply(&mut config);

    init_tracing(&config.logging, &["syncbox_peer", "syncbox_common"])
        .context("Failed to initialize logging")?;

    info!("Starting Syncbox peer v{}", env!("CARGO_PKG_VERSION"));
    info!("Joining relay at {}", config.session.relay_addr);

    let (session, inbox) = RelaySession::connect(config.session.relay_addr.as_str())
        .await
        .context("Failed to join relay session")?;

    let services = NodeServices {
        fetcher: config
            .fetch
            .build_fetcher()
            .context("Failed to initialize fetch backend")?,
        decoder: Arc::new(SymphoniaDecoder),
        devices: config.audio.device_factory(),
    };

    let node = PeerNode::new(session, services, config.node_settings(), EventBus::default())
        .await
        .context("Failed to initialize peer node")?;
    let mut pump = node.spawn(inbox);

    if config.http.enabled {
        let addr: SocketAddr = format!("{}:{}", config.http.bind, config.http.port)
            .parse()
            .context("Invalid HTTP bind address")?;
        let ctx = AppContext {
            node: Arc::clone(&node),
        };

        tokio::select! {
            result = api::serve(ctx, addr, shutdown_signal()) => {
                result.context("HTTP server error")?;
            }
            _ = &mut pump => {
                warn!("Relay session ended");
            }
        }
    } else {
        tokio::select! {
            _ = shutdown_signal() => {}
            _ = &mut pump => {
                warn!("Relay session ended");
            }
        }
    }

    info!("Peer shutdown complete");
    Ok(())
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                warn!("Failed to install terminate handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, shutting down");
        },
        _ = terminate => {
            info!("Received terminate signal, shutting down");
        },
    }
}
