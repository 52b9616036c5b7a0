//! Configuration management for the chat relay.
//!
//! This module provides TOML-based configuration file loading and saving.
//! The default configuration path is `~/.config/chat-relay/config.toml`.

use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Configuration validation errors.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("packet_port must be non-zero")]
    InvalidPacketPort,

    #[error("file_port must be non-zero and differ from packet_port, got {0}")]
    InvalidFilePort(u16),

    #[error("bind_address is not a valid IP address: {0}")]
    InvalidBindAddress(String),

    #[error("io_timeout_secs must be between 1 and 300, got {0}")]
    InvalidIoTimeout(u64),

    #[error("max_frame_size must be between 1024 and 67108864 bytes, got {0}")]
    InvalidMaxFrameSize(usize),

    #[error("max_file_size must be greater than 0, got {0}")]
    InvalidMaxFileSize(u64),

    #[error("retention_secs must be greater than 0, got {0}")]
    InvalidRetention(u64),

    #[error("sweep_interval_secs must be greater than 0, got {0}")]
    InvalidSweepInterval(u64),

    #[error("log_level must be one of: trace, debug, info, warn, error; got {0}")]
    InvalidLogLevel(String),
}

/// Valid log level values for tracing configuration.
const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// Default relay port; the file port defaults to the next port up.
pub const DEFAULT_PACKET_PORT: u16 = 9000;

/// Main configuration structure for the relay.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    /// Listener configuration.
    pub server: ServerConfig,

    /// Bulk transfer configuration.
    pub transfer: TransferConfig,

    /// Logging configuration.
    pub logging: LoggingConfig,
}

/// Listener configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    /// Address both listeners bind to.
    pub bind_address: String,

    /// Port for framed envelopes.
    pub packet_port: u16,

    /// Port for the bulk transfer protocol (default: packet_port + 1).
    pub file_port: Option<u16>,

    /// Deadline for one write to a client, and for each read or write on
    /// the file port before the transfer is abandoned.
    pub io_timeout_secs: u64,

    /// Largest accepted envelope body in bytes.
    pub max_frame_size: usize,
}

/// Bulk transfer configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TransferConfig {
    /// Directory where uploads are staged until downloaded.
    pub staging_dir: PathBuf,

    /// Largest accepted upload in bytes (default: 1GB).
    pub max_file_size: u64,

    /// Staged files older than this are deleted by the sweep.
    pub retention_secs: u64,

    /// How often the sweep runs.
    pub sweep_interval_secs: u64,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    /// Logging level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Optional directory for daily-rotated log files.
    pub log_dir: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            packet_port: DEFAULT_PACKET_PORT,
            file_port: None,
            io_timeout_secs: 10,
            max_frame_size: protocol::MAX_FRAME_SIZE,
        }
    }
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            staging_dir: default_staging_dir(),
            max_file_size: 1024 * 1024 * 1024, // 1GB
            retention_secs: 3600,
            sweep_interval_secs: 300,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_dir: None,
        }
    }
}

/// Returns the default configuration file path.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("chat-relay")
        .join("config.toml")
}

/// Returns the default staging directory path.
fn default_staging_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("chat-relay")
        .join("staging")
}

impl ServerConfig {
    /// The effective file port.
    pub fn file_port(&self) -> u16 {
        self.file_port
            .unwrap_or_else(|| self.packet_port.wrapping_add(1))
    }

    /// Socket address of the packet listener.
    pub fn packet_addr(&self) -> Result<SocketAddr> {
        socket_addr(&self.bind_address, self.packet_port)
    }

    /// Socket address of the file listener.
    pub fn file_addr(&self) -> Result<SocketAddr> {
        socket_addr(&self.bind_address, self.file_port())
    }

    pub fn io_timeout(&self) -> Duration {
        Duration::from_secs(self.io_timeout_secs)
    }
}

impl TransferConfig {
    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

fn socket_addr(host: &str, port: u16) -> Result<SocketAddr> {
    let ip: std::net::IpAddr = host
        .parse()
        .with_context(|| format!("Invalid bind address: {}", host))?;
    Ok(SocketAddr::new(ip, port))
}

impl Config {
    /// Apply environment variable overrides to the configuration.
    ///
    /// Environment variables take precedence over config file values.
    /// Supported variables:
    /// - CHAT_RELAY_PACKET_PORT: Override the packet port
    /// - CHAT_RELAY_FILE_PORT: Override the file port
    /// - CHAT_RELAY_STAGING_DIR: Override the staging directory
    /// - CHAT_RELAY_LOG_LEVEL: Override log level (trace, debug, info, warn, error)
    pub fn apply_env_overrides(&mut self) {
        if let Some(port) = env_value("CHAT_RELAY_PACKET_PORT") {
            match port.parse() {
                Ok(port) => {
                    tracing::info!("Overriding packet_port from environment: {}", port);
                    self.server.packet_port = port;
                }
                Err(_) => tracing::warn!("Ignoring invalid CHAT_RELAY_PACKET_PORT: {}", port),
            }
        }

        if let Some(port) = env_value("CHAT_RELAY_FILE_PORT") {
            match port.parse() {
                Ok(port) => {
                    tracing::info!("Overriding file_port from environment: {}", port);
                    self.server.file_port = Some(port);
                }
                Err(_) => tracing::warn!("Ignoring invalid CHAT_RELAY_FILE_PORT: {}", port),
            }
        }

        if let Some(dir) = env_value("CHAT_RELAY_STAGING_DIR") {
            tracing::info!("Overriding staging_dir from environment: {}", dir);
            self.transfer.staging_dir = PathBuf::from(dir);
        }

        if let Some(level) = env_value("CHAT_RELAY_LOG_LEVEL") {
            tracing::info!("Overriding log_level from environment: {}", level);
            self.logging.log_level = level;
        }
    }

    /// Validate the configuration values.
    ///
    /// Returns an error if any configuration value is outside the valid range.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server.packet_port == 0 {
            return Err(ConfigError::InvalidPacketPort);
        }

        let file_port = self.server.file_port();
        if file_port == 0 || file_port == self.server.packet_port {
            return Err(ConfigError::InvalidFilePort(file_port));
        }

        if self.server.bind_address.parse::<std::net::IpAddr>().is_err() {
            return Err(ConfigError::InvalidBindAddress(
                self.server.bind_address.clone(),
            ));
        }

        // Validate io_timeout_secs: 1-300
        let timeout = self.server.io_timeout_secs;
        if !(1..=300).contains(&timeout) {
            return Err(ConfigError::InvalidIoTimeout(timeout));
        }

        // Validate max_frame_size: 1KB-64MB
        let frame = self.server.max_frame_size;
        if !(1024..=64 * 1024 * 1024).contains(&frame) {
            return Err(ConfigError::InvalidMaxFrameSize(frame));
        }

        if self.transfer.max_file_size == 0 {
            return Err(ConfigError::InvalidMaxFileSize(self.transfer.max_file_size));
        }

        if self.transfer.retention_secs == 0 {
            return Err(ConfigError::InvalidRetention(self.transfer.retention_secs));
        }

        if self.transfer.sweep_interval_secs == 0 {
            return Err(ConfigError::InvalidSweepInterval(
                self.transfer.sweep_interval_secs,
            ));
        }

        // Validate log_level is a known value
        let level = self.logging.log_level.to_lowercase();
        if !VALID_LOG_LEVELS.contains(&level.as_str()) {
            return Err(ConfigError::InvalidLogLevel(
                self.logging.log_level.clone(),
            ));
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

fn env_value(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|value| !value.is_empty())
}

/// Format a TOML deserialization error for user-friendly display.
fn format_toml_error(error: &toml::de::Error) -> String {
    let mut msg = error.message().to_string();

    if let Some(span) = error.span() {
        msg.push_str(&format!(" (at position {}..{})", span.start, span.end));
    }

    msg
}
