//! Configuration file resolution and loading
//!
//! Config file lookup follows this priority order:
//! 1. Command-line argument (highest priority)
//! 2. Environment variable
//! 3. Per-user config directory (`<config_dir>/syncbox/<file>`)
//! 4. System-wide location (`/etc/syncbox/<file>`, Linux only)
//!
//! A missing config file is not an error: callers fall back to built-in
//! defaults and log a warning.

use crate::{Error, Result};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Logging configuration
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,

    /// Log file path (logs to stderr if not specified)
    pub file: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: None,
        }
    }
}

/// Locate the config file for a Syncbox program
///
/// An explicit path (CLI or environment) is returned as-is so that a
/// typo surfaces as a load error. Default locations are only returned
/// when the file exists.
pub fn resolve_config_path(
    cli_arg: Option<&Path>,
    env_var_name: &str,
    file_name: &str,
) -> Option<PathBuf> {
    // Priority 1: Command-line argument
    if let Some(path) = cli_arg {
        return Some(path.to_path_buf());
    }

    // Priority 2: Environment variable
    if let Ok(path) = std::env::var(env_var_name) {
        if !path.is_empty() {
            return Some(PathBuf::from(path));
        }
    }

    // Priority 3: Per-user config directory
    if let Some(path) = dirs::config_dir().map(|d| d.join("syncbox").join(file_name)) {
        if path.exists() {
            return Some(path);
        }
    }

    // Priority 4: System-wide config
    if cfg!(target_os = "linux") {
        let system_config = PathBuf::from("/etc/syncbox").join(file_name);
        if system_config.exists() {
            return Some(system_config);
        }
    }

    None
}

/// Load a TOML config file, or built-in defaults when no file was found
pub fn load_toml<T>(path: Option<&Path>) -> Result<T>
where
    T: DeserializeOwned + Default,
{
    let Some(path) = path else {
        warn!("No config file found, using built-in defaults");
        return Ok(T::default());
    };

    let content = std::fs::read_to_string(path).map_err(|e| {
        Error::Config(format!("Failed to read config file {}: {}", path.display(), e))
    })?;

    let config = toml::from_str(&content).map_err(|e| {
        Error::Config(format!("Failed to parse config file {}: {}", path.display(), e))
    })?;

    info!("Loaded configuration from {}", path.display());
    Ok(config)
}
