//! Tracing initialization shared by the peer and relay binaries

use crate::error::{Error, Result};
use std::fs::OpenOptions;
use std::sync::Arc;
use syncbox_common::config::LoggingConfig;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Install the global subscriber
///
/// `RUST_LOG` wins over the configured level. With `logging.file` set,
/// output is appended to that file as well as stderr.
pub fn init_tracing(logging: &LoggingConfig, targets: &[&str]) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| default_filter(logging, targets).into());

    let file_layer = match &logging.file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map_err(|e| {
                    Error::Config(format!("Failed to open log file {}: {}", path.display(), e))
                })?;
            Some(
                tracing_subscriber::fmt::layer()
                    .with_ansi(false)
                    .with_writer(Arc::new(file)),
            )
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .with(file_layer)
        .try_init()
        .map_err(|e| Error::Config(format!("Failed to install tracing subscriber: {}", e)))
}

/// `target=level` directives for our crates, `warn` for everything else
fn default_filter(logging: &LoggingConfig, targets: &[&str]) -> String {
    let mut directives = vec!["warn".to_string(), "tower_http=info".to_string()];
    directives.extend(
        targets
            .iter()
            .map(|target| format!("{}={}", target, logging.level)),
    );
    directives.join(",")
}
