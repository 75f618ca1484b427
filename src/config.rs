//! Configuration module for the frame-mux server.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use crate::runtime::codec::ByteOrder;
use clap::Parser;
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Command-line arguments for the server
#[derive(Parser, Debug)]
#[command(name = "frame-mux")]
#[command(version)]
#[command(about = "A length-prefixed request/response server", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Address to bind to (e.g., 0.0.0.0:1234)
    #[arg(short = 'l', long)]
    pub listen: Option<String>,

    /// Maximum number of simultaneous connections
    #[arg(long)]
    pub max_connections: Option<usize>,

    /// Listen backlog
    #[arg(long)]
    pub backlog: Option<i32>,

    /// How long one event loop iteration may block, in milliseconds
    #[arg(long)]
    pub poll_timeout_ms: Option<u64>,

    /// Byte order of the frame length header
    #[arg(long, value_enum)]
    pub byte_order: Option<ByteOrder>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    pub log_level: Option<String>,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub protocol: ProtocolConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server-related configuration
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    /// Address to bind to
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Connection table capacity
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    /// Listen backlog
    #[serde(default = "default_backlog")]
    pub backlog: i32,
    /// Event loop poll timeout in milliseconds
    #[serde(default = "default_poll_timeout_ms")]
    pub poll_timeout_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            max_connections: default_max_connections(),
            backlog: default_backlog(),
            poll_timeout_ms: default_poll_timeout_ms(),
        }
    }
}

/// Wire protocol configuration
#[derive(Debug, Deserialize, Default)]
pub struct ProtocolConfig {
    #[serde(default)]
    pub byte_order: ByteOrder,
}

/// Logging configuration
#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_listen() -> String {
    "0.0.0.0:1234".to_string()
}

fn default_max_connections() -> usize {
    1024
}

fn default_backlog() -> i32 {
    1024
}

fn default_poll_timeout_ms() -> u64 {
    1000
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub listen: SocketAddr,
    pub max_connections: usize,
    pub backlog: i32,
    pub poll_timeout: Duration,
    pub byte_order: ByteOrder,
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([0, 0, 0, 0], 1234)),
            max_connections: default_max_connections(),
            backlog: default_backlog(),
            poll_timeout: Duration::from_millis(default_poll_timeout_ms()),
            byte_order: ByteOrder::default(),
            log_level: default_log_level(),
        }
    }
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_args(CliArgs::parse())
    }

    /// Resolve parsed CLI args, reading the TOML file they point at, if any.
    pub fn from_args(cli: CliArgs) -> Result<Self, ConfigError> {
        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|e| ConfigError::FileRead(config_path.clone(), e))?;
            toml::from_str(&contents)
                .map_err(|e| ConfigError::TomlParse(config_path.clone(), e))?
        } else {
            TomlConfig::default()
        };

        Self::merge(cli, toml_config)
    }

    /// Merge CLI args over TOML values (CLI takes precedence).
    fn merge(cli: CliArgs, toml_config: TomlConfig) -> Result<Self, ConfigError> {
        let listen = cli.listen.unwrap_or(toml_config.server.listen);
        let listen: SocketAddr = listen
            .parse()
            .map_err(|e| ConfigError::InvalidListen(listen.clone(), e))?;

        Ok(Config {
            listen,
            max_connections: cli
                .max_connections
                .unwrap_or(toml_config.server.max_connections),
            backlog: cli.backlog.unwrap_or(toml_config.server.backlog),
            poll_timeout: Duration::from_millis(
                cli.poll_timeout_ms
                    .unwrap_or(toml_config.server.poll_timeout_ms),
            ),
            byte_order: cli.byte_order.unwrap_or(toml_config.protocol.byte_order),
            log_level: cli.log_level.unwrap_or(toml_config.logging.level),
        })
    }
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{}': {}", .0.display(), .1)]
    FileRead(PathBuf, #[source] std::io::Error),
    #[error("Failed to parse config file '{}': {}", .0.display(), .1)]
    TomlParse(PathBuf, #[source] toml::de::Error),
    #[error("Invalid listen address '{0}': {1}")]
    InvalidListen(String, #[source] std::net::AddrParseError),
}
