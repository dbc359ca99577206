//! Configuration management for the dsync daemon.
//!
//! A single TOML file. On first run, if no config exists at the requested
//! path, a default one is written there.

use crate::broadcaster::{DelayMode, FanoutMode};
use crate::constants::{gossip, ledger, network, rate_limit};
use crate::error::AppError;
use crate::handler_registry::HandlerOptions;
use crate::node::NodeOptions;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Platform-specific data directory (`~/.dsync`, `%APPDATA%\dsync` on Windows)
pub fn get_data_dir() -> PathBuf {
    if cfg!(windows) {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("dsync")
    } else {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".dsync")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Config {
    pub node: NodeConfig,
    pub network: NetworkConfig,
    #[serde(default)]
    pub gossip: GossipConfig,
    pub logging: LoggingConfig,
    /// Built-in handlers the daemon registers at startup
    #[serde(default)]
    pub handlers: Vec<HandlerConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NodeConfig {
    pub name: String,
    /// Endpoint path segment, shared by every peer in the mesh
    #[serde(default = "default_prefix")]
    pub prefix: String,
    /// URL other peers reach this node at. Sent as the `source` of emitted
    /// events when set.
    #[serde(default)]
    pub advertise_address: Option<String>,
}

fn default_prefix() -> String {
    network::DEFAULT_PREFIX.to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NetworkConfig {
    pub listen_address: String,
    #[serde(default)]
    pub bootstrap_peers: Vec<String>,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

fn default_request_timeout() -> u64 {
    gossip::REQUEST_TIMEOUT_SECS
}

impl NetworkConfig {
    /// `listen_address` with the default port appended when it has none.
    pub fn full_listen_address(&self) -> String {
        if self.listen_address.contains(':') {
            self.listen_address.clone()
        } else {
            format!("{}:{}", self.listen_address, network::DEFAULT_PORT)
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GossipConfig {
    #[serde(default = "default_ledger_window")]
    pub ledger_window_secs: u64,
    #[serde(default = "default_rate_window")]
    pub rate_window_secs: u64,
    #[serde(default)]
    pub delay_mode: DelayMode,
    #[serde(default)]
    pub fanout: FanoutMode,
    /// Skip handlers for an event id this node has already seen
    #[serde(default)]
    pub suppress_duplicate_handlers: bool,
}

fn default_ledger_window() -> u64 {
    ledger::WINDOW_SECS
}

fn default_rate_window() -> u64 {
    rate_limit::WINDOW_SECS
}

impl Default for GossipConfig {
    fn default() -> Self {
        Self {
            ledger_window_secs: default_ledger_window(),
            rate_window_secs: default_rate_window(),
            delay_mode: DelayMode::default(),
            fanout: FanoutMode::default(),
            suppress_duplicate_handlers: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LoggingConfig {
    pub level: String,
    /// "pretty" or "json"
    pub format: String,
    /// "stdout" or "file"
    pub output: String,
    pub file_path: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum HandlerAction {
    /// Answer with the handler input (payload plus rate-limit flags)
    Echo,
    /// Answer `{ok: true, node, eventId}`
    Ack,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HandlerConfig {
    pub event: String,
    pub action: HandlerAction,
    #[serde(default)]
    pub ip_request_limit: Option<u32>,
    #[serde(default)]
    pub request_limit: Option<u32>,
    #[serde(default)]
    pub handle_rate_limit: bool,
}

impl HandlerConfig {
    pub fn options(&self) -> HandlerOptions {
        HandlerOptions {
            ip_request_limit: self.ip_request_limit,
            request_limit: self.request_limit,
            handle_rate_limit: self.handle_rate_limit,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            node: NodeConfig {
                name: "dsync node".to_string(),
                prefix: default_prefix(),
                advertise_address: None,
            },
            network: NetworkConfig {
                listen_address: "0.0.0.0".to_string(),
                bootstrap_peers: vec![],
                request_timeout_secs: default_request_timeout(),
            },
            gossip: GossipConfig::default(),
            logging: LoggingConfig {
                level: "info".to_string(),
                format: "pretty".to_string(),
                output: "stdout".to_string(),
                file_path: get_data_dir()
                    .join("logs")
                    .join("dsyncd.log")
                    .to_string_lossy()
                    .to_string(),
            },
            handlers: vec![HandlerConfig {
                event: "echo".to_string(),
                action: HandlerAction::Echo,
                ip_request_limit: Some(60),
                request_limit: None,
                handle_rate_limit: false,
            }],
        }
    }
}

impl Config {
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self, AppError> {
        let contents = fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Load `path`, writing the defaults there first if it doesn't exist.
    pub fn load_or_create(path: impl AsRef<Path>) -> Result<Self, AppError> {
        let path = path.as_ref();
        if path.exists() {
            return Self::load_from_file(path);
        }

        let config = Config::default();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        config.save_to_file(path)?;
        tracing::info!("📝 Wrote default config to {}", path.display());
        Ok(config)
    }

    pub fn save_to_file(&self, path: impl AsRef<Path>) -> Result<(), AppError> {
        let contents = toml::to_string_pretty(self)?;
        fs::write(path, contents)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<(), AppError> {
        if self.node.prefix.trim_matches('/').is_empty() {
            return Err(AppError::Config("node.prefix must not be empty".to_string()));
        }
        if self.gossip.ledger_window_secs == 0 {
            return Err(AppError::Config(
                "gossip.ledger_window_secs must be positive".to_string(),
            ));
        }
        if self.gossip.rate_window_secs == 0 {
            return Err(AppError::Config(
                "gossip.rate_window_secs must be positive".to_string(),
            ));
        }
        if let Some(handler) = self.handlers.iter().find(|h| h.event.is_empty()) {
            return Err(AppError::Config(format!(
                "handler with action {:?} has no event name",
                handler.action
            )));
        }
        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.network.request_timeout_secs)
    }

    pub fn node_options(&self) -> NodeOptions {
        NodeOptions {
            name: self.node.name.clone(),
            ledger_window: Duration::from_secs(self.gossip.ledger_window_secs),
            rate_window: Duration::from_secs(self.gossip.rate_window_secs),
            advertise_address: self
                .node
                .advertise_address
                .clone()
                .filter(|a| !a.trim().is_empty()),
            delay_mode: self.gossip.delay_mode,
            fanout: self.gossip.fanout,
            fixed_delay: None,
            suppress_duplicate_handlers: self.gossip.suppress_duplicate_handlers,
        }
    }
}
