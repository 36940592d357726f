//! Configuration for syncbox-peer and syncbox-relay
//!
//! # Settings Sources Priority
//!
//! 1. Command-line arguments (--relay, --port, --output, ...)
//! 2. Environment variables (SYNCBOX_*, via clap)
//! 3. TOML configuration file
//! 4. Built-in defaults (code constants)
//!
//! Every section and field is optional in the file.

use crate::control::LocatorValidator;
use crate::coordinator::{BarrierPolicy, CoordinatorSettings, TimeoutAction};
use crate::endpoint::{clamp_volume, CpalDevice, DeviceFactory, NullDevice, PlaybackDevice};
use crate::error::{Error, Result};
use crate::node::NodeSettings;
use crate::pipeline::{CommandFetcher, HttpFetcher, ResourceFetcher};
use crate::readiness::ReadinessScope;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use syncbox_common::config::{load_toml, resolve_config_path, LoggingConfig};
use syncbox_common::PeerId;

/// Environment variable naming the peer config file
pub const PEER_CONFIG_ENV: &str = "SYNCBOX_CONFIG";
/// Environment variable naming the relay config file
pub const RELAY_CONFIG_ENV: &str = "SYNCBOX_RELAY_CONFIG";

/// Peer node configuration (`peer.toml`)
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(default)]
pub struct PeerConfig {
    pub session: SessionConfig,
    pub http: HttpConfig,
    pub coordinator: CoordinatorConfig,
    pub fetch: FetchConfig,
    pub audio: AudioConfig,
    pub control: ControlConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct SessionConfig {
    /// Relay to join, host:port
    pub relay_addr: String,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            relay_addr: "127.0.0.1:5750".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct HttpConfig {
    pub enabled: bool,
    pub bind: String,
    pub port: u16,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind: "127.0.0.1".to_string(),
            port: 5751,
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct CoordinatorConfig {
    pub readiness_scope: ReadinessScope,
    /// Unset waits forever
    pub barrier_timeout_ms: Option<u64>,
    pub on_barrier_timeout: TimeoutAction,
    pub poll_interval_ms: u64,
    pub broadcast_failures: bool,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            readiness_scope: ReadinessScope::default(),
            barrier_timeout_ms: None,
            on_barrier_timeout: TimeoutAction::default(),
            poll_interval_ms: 100,
            broadcast_failures: true,
        }
    }
}

impl CoordinatorConfig {
    pub fn settings(&self) -> CoordinatorSettings {
        CoordinatorSettings {
            scope: self.readiness_scope,
            barrier: BarrierPolicy {
                timeout: self.barrier_timeout_ms.map(Duration::from_millis),
                on_timeout: self.on_barrier_timeout,
                poll_interval: Duration::from_millis(self.poll_interval_ms),
            },
            broadcast_failures: self.broadcast_failures,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FetchBackend {
    /// Plain HTTP(S) download
    #[default]
    Http,
    /// External downloader program
    Command,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct FetchConfig {
    pub backend: FetchBackend,
    /// Downloader program for the command backend
    pub command: String,
    /// Argument templates; `{locator}` and `{output_dir}` are substituted
    pub args: Vec<String>,
    pub timeout_secs: u64,
    /// HTTP backend size cap
    pub max_bytes: u64,
    /// Parent of scratch directories (system temp dir if unset)
    pub scratch_dir: Option<PathBuf>,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            backend: FetchBackend::Http,
            command: "yt-dlp".to_string(),
            args: CommandFetcher::default_args(),
            timeout_secs: 300,
            max_bytes: 256 * 1024 * 1024,
            scratch_dir: None,
        }
    }
}

impl FetchConfig {
    pub fn build_fetcher(&self) -> Result<Arc<dyn ResourceFetcher>> {
        let timeout = Duration::from_secs(self.timeout_secs);
        let fetcher: Arc<dyn ResourceFetcher> = match self.backend {
            FetchBackend::Http => Arc::new(HttpFetcher::new(
                timeout,
                self.max_bytes,
                self.scratch_dir.clone(),
            )?),
            FetchBackend::Command => Arc::new(CommandFetcher::new(
                self.command.clone(),
                self.args.clone(),
                timeout,
                self.scratch_dir.clone(),
            )),
        };
        Ok(fetcher)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum OutputKind {
    /// Sound card via cpal
    #[default]
    Cpal,
    /// Silent
    Null,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct AudioConfig {
    pub output: OutputKind,
    /// Output device name (default device if unset)
    pub device: Option<String>,
    pub local_volume: f32,
    pub remote_volume: f32,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            output: OutputKind::Cpal,
            device: None,
            local_volume: 0.1,
            remote_volume: 0.2,
        }
    }
}

impl AudioConfig {
    /// One device per endpoint
    pub fn device_factory(&self) -> DeviceFactory {
        let factory: DeviceFactory = match self.output {
            OutputKind::Cpal => {
                let device = self.device.clone();
                Arc::new(move |_peer: PeerId| -> Result<Box<dyn PlaybackDevice>> {
                    Ok(Box::new(CpalDevice::open(device.clone())?))
                })
            }
            OutputKind::Null => {
                Arc::new(|_peer: PeerId| -> Result<Box<dyn PlaybackDevice>> {
                    Ok(Box::new(NullDevice::new()))
                })
            }
        };
        factory
    }
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(default)]
pub struct ControlConfig {
    /// Hosts a requested locator may point at; empty allows any
    pub allowed_hosts: Vec<String>,
}

impl PeerConfig {
    /// Resolve and load the peer config file
    pub fn load(cli_path: Option<&Path>) -> Result<Self> {
        let path = resolve_config_path(cli_path, PEER_CONFIG_ENV, "peer.toml");
        let config: Self = load_toml(path.as_deref())?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.coordinator.poll_interval_ms == 0 {
            return Err(Error::Config(
                "coordinator.poll_interval_ms must be greater than 0".to_string(),
            ));
        }
        if self.coordinator.barrier_timeout_ms == Some(0) {
            return Err(Error::Config(
                "coordinator.barrier_timeout_ms must be greater than 0 when set".to_string(),
            ));
        }
        for (name, volume) in [
            ("audio.local_volume", self.audio.local_volume),
            ("audio.remote_volume", self.audio.remote_volume),
        ] {
            if !(0.0..=1.0).contains(&volume) {
                return Err(Error::Config(format!(
                    "{} must be between 0.0 and 1.0, got {}",
                    name, volume
                )));
            }
        }
        if self.fetch.backend == FetchBackend::Command && self.fetch.command.trim().is_empty() {
            return Err(Error::Config("fetch.command must not be empty".to_string()));
        }
        if self.fetch.max_bytes == 0 {
            return Err(Error::Config("fetch.max_bytes must be greater than 0".to_string()));
        }
        Ok(())
    }

    pub fn node_settings(&self) -> NodeSettings {
        NodeSettings {
            coordinator: self.coordinator.settings(),
            local_volume: clamp_volume(self.audio.local_volume),
            remote_volume: clamp_volume(self.audio.remote_volume),
            validator: LocatorValidator::new(self.control.allowed_hosts.clone()),
        }
    }
}

/// Relay configuration (`relay.toml`)
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct RelayConfig {
    pub bind: String,
    pub logging: LoggingConfig,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:5750".to_string(),
            logging: LoggingConfig::default(),
        }
    }
}

impl RelayConfig {
    pub fn load(cli_path: Option<&Path>) -> Result<Self> {
        let path = resolve_config_path(cli_path, RELAY_CONFIG_ENV, "relay.toml");
        Ok(load_toml(path.as_deref())?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = PeerConfig::default();
        assert_eq!(config.session.relay_addr, "127.0.0.1:5750");
        assert_eq!(config.http.port, 5751);
        assert!(config.coordinator.broadcast_failures);
        assert_eq!(config.coordinator.readiness_scope, ReadinessScope::Request);
        assert_eq!(config.fetch.command, "yt-dlp");
        assert!(config.validate().is_ok());

        let settings = config.node_settings();
        assert_eq!(settings.coordinator.barrier.timeout, None);
        assert_eq!(
            settings.coordinator.barrier.poll_interval,
            Duration::from_millis(100)
        );
        assert!((settings.local_volume - 0.1).abs() < f32::EPSILON);
    }

    #[test]
    fn test_parse_sections() {
        let config: PeerConfig = toml::from_str(
            r#"
            [coordinator]
            readiness_scope = "locator"
            barrier_timeout_ms = 5000
            on_barrier_timeout = "proceed_with_ready"
            broadcast_failures = false

            [fetch]
            backend = "command"

            [audio]
            output = "null"
            remote_volume = 0.5

            [control]
            allowed_hosts = ["youtube.com"]
            "#,
        )
        .unwrap();

        let settings = config.coordinator.settings();
        assert_eq!(settings.scope, ReadinessScope::Locator);
        assert_eq!(settings.barrier.timeout, Some(Duration::from_secs(5)));
        assert_eq!(settings.barrier.on_timeout, TimeoutAction::ProceedWithReady);
        assert!(!settings.broadcast_failures);
        assert_eq!(config.fetch.backend, FetchBackend::Command);
        assert_eq!(config.audio.output, OutputKind::Null);
        assert_eq!(config.audio.local_volume, 0.1);
        assert_eq!(config.node_settings().validator.allowed_hosts(), ["youtube.com"]);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = PeerConfig::default();
        config.audio.local_volume = 1.5;
        assert!(matches!(config.validate(), Err(Error::Config(_))));

        let mut config = PeerConfig::default();
        config.coordinator.poll_interval_ms = 0;
        assert!(config.validate().is_err());

        let mut config = PeerConfig::default();
        config.coordinator.barrier_timeout_ms = Some(0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_unknown_scope_rejected() {
        let result: std::result::Result<PeerConfig, _> =
            toml::from_str("[coordinator]\nreadiness_scope = \"global\"\n");
        assert!(result.is_err());
    }
}
