//! Configuration management for the queue coordinator.
//!
//! This module provides TOML-based configuration file loading and saving.
//! The default configuration path is `~/.config/queue-coordinator/config.toml`.

use std::fs;
use std::net::IpAddr;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::clock::DateZone;

/// Configuration validation errors.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("{field} must be a non-zero port")]
    InvalidPort { field: &'static str },

    #[error("broadcast_interval_secs must be between 1 and 3600 seconds, got {0}")]
    InvalidBroadcastInterval(u64),

    #[error("job_ttl_secs must be between 1 and 86400 seconds, got {0}")]
    InvalidJobTtl(u64),

    #[error("sweep_interval_secs must be between 1 and job_ttl_secs ({ttl}), got {got}")]
    InvalidSweepInterval { got: u64, ttl: u64 },

    #[error("station_buffer must be between 1 and 65536, got {0}")]
    InvalidStationBuffer(usize),

    #[error("read_connections must be between 1 and 32, got {0}")]
    InvalidReadConnections(usize),

    #[error("check_interval_secs must be between 60 and 86400 seconds, got {0}")]
    InvalidResetCheckInterval(u64),

    #[error("history_limit must be between 1 and 365, got {0}")]
    InvalidHistoryLimit(u32),

    #[error("log_level must be one of: trace, debug, info, warn, error; got {0}")]
    InvalidLogLevel(String),
}

/// Valid log level values for tracing configuration.
const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// Main configuration structure for the coordinator.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    /// General server configuration.
    pub server: ServerConfig,

    /// Realtime endpoint configuration.
    pub network: NetworkConfig,

    /// UDP discovery configuration.
    pub discovery: DiscoveryConfig,

    /// SQLite store configuration.
    pub database: DatabaseConfig,

    /// Remote print broker configuration.
    pub print: PrintConfig,

    /// Daily reset configuration.
    pub reset: ResetConfig,
}

/// General server configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    /// Directory for the database, device id and log files.
    pub data_dir: PathBuf,

    /// Logging level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Also write logs to a daily rolling file under `<data_dir>/logs`.
    pub log_to_file: bool,

    /// Name advertised to stations in discovery replies.
    pub server_name: String,
}

/// Realtime endpoint configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct NetworkConfig {
    /// Address the realtime endpoint binds to.
    pub bind_address: IpAddr,

    /// Port of the realtime endpoint, also advertised as the API port.
    pub api_port: u16,
}

/// UDP discovery configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DiscoveryConfig {
    /// Run the discovery responder.
    pub enabled: bool,

    /// UDP port to listen and broadcast on.
    pub udp_port: u16,

    /// Seconds between presence broadcasts.
    pub broadcast_interval_secs: u64,
}

/// SQLite store configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DatabaseConfig {
    /// Database file. Defaults to `<data_dir>/queue.db`.
    pub path: Option<PathBuf>,

    /// Number of read-only connections kept open next to the writer.
    pub read_connections: usize,

    /// How long a connection waits on a locked database, in milliseconds.
    pub busy_timeout_ms: u64,
}

/// Remote print broker configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PrintConfig {
    /// Seconds a print request may stay unresolved before it is expired.
    pub job_ttl_secs: u64,

    /// Seconds between expiry sweeps.
    pub sweep_interval_secs: u64,

    /// Outbound events buffered per station before events are dropped.
    pub station_buffer: usize,
}

/// Daily reset configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ResetConfig {
    /// Calendar used to decide the current day.
    pub timezone: DateZone,

    /// Seconds between checks whether the day rolled over.
    pub check_interval_secs: u64,

    /// Default number of entries returned by history queries.
    pub history_limit: u32,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            log_level: "info".to_string(),
            log_to_file: false,
            server_name: protocol::DEFAULT_SERVER_NAME.to_string(),
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            bind_address: IpAddr::from([0, 0, 0, 0]),
            api_port: protocol::API_PORT,
        }
    }
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            udp_port: protocol::DISCOVERY_PORT,
            broadcast_interval_secs: 30,
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: None,
            read_connections: 4,
            busy_timeout_ms: 5000,
        }
    }
}

impl Default for PrintConfig {
    fn default() -> Self {
        Self {
            job_ttl_secs: 300, // 5 minutes
            sweep_interval_secs: 60,
            station_buffer: 256,
        }
    }
}

impl Default for ResetConfig {
    fn default() -> Self {
        Self {
            timezone: DateZone::Utc,
            check_interval_secs: 3600,
            history_limit: 30,
        }
    }
}

/// Returns the default configuration file path.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("queue-coordinator")
        .join("config.toml")
}

/// Returns the default data directory path.
fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("queue-coordinator")
}

impl Config {
    /// Resolved path of the database file.
    pub fn database_path(&self) -> PathBuf {
        self.database
            .path
            .clone()
            .unwrap_or_else(|| self.server.data_dir.join("queue.db"))
    }

    /// Path of the persisted device id.
    pub fn device_id_path(&self) -> PathBuf {
        self.server.data_dir.join("device_id")
    }

    /// Apply environment variable overrides to the configuration.
    ///
    /// Environment variables take precedence over config file values.
    /// Supported variables:
    /// - QUEUE_DATA_DIR: Override the data directory
    /// - QUEUE_LOG_LEVEL: Override log level (trace, debug, info, warn, error)
    pub fn apply_env_overrides(&mut self) {
        if let Ok(dir) = std::env::var("QUEUE_DATA_DIR") {
            if !dir.is_empty() {
                tracing::info!("Overriding data_dir from environment: {}", dir);
                self.server.data_dir = PathBuf::from(dir);
            }
        }

        if let Ok(level) = std::env::var("QUEUE_LOG_LEVEL") {
            if !level.is_empty() {
                tracing::info!("Overriding log_level from environment: {}", level);
                self.server.log_level = level;
            }
        }
    }

    /// Validate the configuration values.
    ///
    /// Returns an error if any configuration value is outside the valid range.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.network.api_port == 0 {
            return Err(ConfigError::InvalidPort { field: "api_port" });
        }
        if self.discovery.udp_port == 0 {
            return Err(ConfigError::InvalidPort { field: "udp_port" });
        }

        let interval = self.discovery.broadcast_interval_secs;
        if !(1..=3600).contains(&interval) {
            return Err(ConfigError::InvalidBroadcastInterval(interval));
        }

        let ttl = self.print.job_ttl_secs;
        if !(1..=86_400).contains(&ttl) {
            return Err(ConfigError::InvalidJobTtl(ttl));
        }
        let sweep = self.print.sweep_interval_secs;
        if sweep == 0 || sweep > ttl {
            return Err(ConfigError::InvalidSweepInterval { got: sweep, ttl });
        }
        if !(1..=65_536).contains(&self.print.station_buffer) {
            return Err(ConfigError::InvalidStationBuffer(self.print.station_buffer));
        }

        if !(1..=32).contains(&self.database.read_connections) {
            return Err(ConfigError::InvalidReadConnections(
                self.database.read_connections,
            ));
        }

        let check = self.reset.check_interval_secs;
        if !(60..=86_400).contains(&check) {
            return Err(ConfigError::InvalidResetCheckInterval(check));
        }
        if !(1..=365).contains(&self.reset.history_limit) {
            return Err(ConfigError::InvalidHistoryLimit(self.reset.history_limit));
        }

        let level = self.server.log_level.to_lowercase();
        if !VALID_LOG_LEVELS.contains(&level.as_str()) {
            return Err(ConfigError::InvalidLogLevel(self.server.log_level.clone()));
        }

        Ok(())
    }

    /// Load configuration from a file.
    ///
    /// If the file does not exist, returns the default configuration.
    /// If the file exists but is invalid TOML, returns an error with
    /// a helpful message.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            tracing::debug!("Config file not found at {:?}, using defaults", path);
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::from_toml(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    /// Load configuration from the default path.
    pub fn load_default() -> Result<Self> {
        Self::load(default_config_path())
    }

    /// Parse configuration from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        toml::from_str(toml_str)
            .map_err(|e| anyhow::anyhow!("Invalid TOML configuration: {}", format_toml_error(&e)))
    }

    /// Save configuration to a file.
    ///
    /// Creates parent directories if they don't exist.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        let contents = self.to_toml()?;
        fs::write(path, contents)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        tracing::debug!("Configuration saved to {:?}", path);
        Ok(())
    }

    /// Serialize configuration to a TOML string.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize configuration to TOML")
    }
}

/// Format a TOML deserialization error for user-friendly display.
fn format_toml_error(error: &toml::de::Error) -> String {
    let mut msg = error.message().to_string();

    if let Some(span) = error.span() {
        msg.push_str(&format!(" (at position {}..{})", span.start, span.end));
    }

    msg
}
