//! Configuration module for the frame-echo server.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use clap::Parser;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Lowest port accepted from the command line or config file.
pub const MIN_PORT: u16 = 1000;

/// Largest accepted frame length. Every connection allocates one frame.
pub const MAX_FRAME_LENGTH: usize = 16 * 1024 * 1024; // 16MB

/// Command-line arguments for the echo server
#[derive(Parser, Debug)]
#[command(name = "frame-echo")]
#[command(author = "frame-echo authors")]
#[command(version = "0.1.0")]
#[command(about = "Echoes fixed-length frames back to each client", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Port to listen on (>= 1000)
    #[arg(short, long, value_parser = clap::value_parser!(u16).range(MIN_PORT as i64..))]
    pub port: Option<u16>,

    /// Frame length in bytes; every message is exactly this long
    #[arg(short = 'b', long, value_parser = parse_buffer_size)]
    pub buffer_size: Option<usize>,

    /// Host to bind to (defaults to the IPv6 then IPv4 wildcard)
    #[arg(short = 'l', long)]
    pub listen: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    pub log_level: String,
}

fn parse_buffer_size(s: &str) -> Result<usize, String> {
    match s.parse::<usize>() {
        Ok(0) => Err("buffer size must be a positive integer".to_string()),
        Ok(n) if n > MAX_FRAME_LENGTH => Err(format!(
            "buffer size must be at most {MAX_FRAME_LENGTH} bytes"
        )),
        Ok(n) => Ok(n),
        Err(e) => Err(e.to_string()),
    }
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server-related configuration
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    /// Host to bind to
    pub host: Option<String>,
    /// Port to listen on
    #[serde(default = "default_port")]
    pub port: u16,
    /// Frame length in bytes
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
    /// Listen backlog
    #[serde(default = "default_backlog")]
    pub backlog: i32,
    /// Maximum readiness events handled per wake
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Maximum simultaneously open client connections
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    /// How long in-flight frames may finish after shutdown is requested
    #[serde(default)]
    pub drain_timeout_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: None,
            port: default_port(),
            buffer_size: default_buffer_size(),
            backlog: default_backlog(),
            batch_size: default_batch_size(),
            max_connections: default_max_connections(),
            drain_timeout_ms: 0,
        }
    }
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

fn default_port() -> u16 {
    7000
}

fn default_buffer_size() -> usize {
    100
}

fn default_backlog() -> i32 {
    1024
}

fn default_batch_size() -> usize {
    256
}

fn default_max_connections() -> usize {
    10_000
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub host: Option<String>,
    pub port: u16,
    /// Fixed frame length shared by every connection.
    pub frame_length: usize,
    pub backlog: i32,
    pub batch_size: usize,
    pub max_connections: usize,
    pub drain_timeout: Duration,
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        let server = ServerConfig::default();
        Self {
            host: server.host,
            port: server.port,
            frame_length: server.buffer_size,
            backlog: server.backlog,
            batch_size: server.batch_size,
            max_connections: server.max_connections,
            drain_timeout: Duration::from_millis(server.drain_timeout_ms),
            log_level: default_log_level(),
        }
    }
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    /// CLI arguments take precedence over TOML file values.
    pub fn load() -> Result<Self, ConfigError> {
        let cli = CliArgs::try_parse().map_err(ConfigError::Usage)?;
        Self::from_cli(cli)
    }

    /// Merge already-parsed CLI args with the config file they name.
    pub fn from_cli(cli: CliArgs) -> Result<Self, ConfigError> {
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

    fn merge(cli: CliArgs, toml_config: TomlConfig) -> Result<Self, ConfigError> {
        let server = toml_config.server;
        let config = Config {
            host: cli.listen.or(server.host),
            port: cli.port.unwrap_or(server.port),
            frame_length: cli.buffer_size.unwrap_or(server.buffer_size),
            backlog: server.backlog,
            batch_size: server.batch_size,
            max_connections: server.max_connections,
            drain_timeout: Duration::from_millis(server.drain_timeout_ms),
            log_level: if cli.log_level != "info" {
                cli.log_level
            } else {
                toml_config.logging.level
            },
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.port < MIN_PORT {
            return Err(ConfigError::InvalidPort(self.port));
        }
        if self.frame_length == 0 || self.frame_length > MAX_FRAME_LENGTH {
            return Err(ConfigError::InvalidBufferSize);
        }
        if self.batch_size == 0 {
            return Err(ConfigError::InvalidBatchSize);
        }
        Ok(())
    }
}

/// Configuration loading errors
#[derive(Debug)]
pub enum ConfigError {
    /// Bad or unknown command-line flag; carries clap's rendered usage.
    Usage(clap::Error),
    FileRead(PathBuf, std::io::Error),
    TomlParse(PathBuf, toml::de::Error),
    InvalidPort(u16),
    InvalidBufferSize,
    InvalidBatchSize,
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Usage(e) => write!(f, "{e}"),
            ConfigError::FileRead(path, e) => {
                write!(f, "Failed to read config file '{}': {}", path.display(), e)
            }
            ConfigError::TomlParse(path, e) => {
                write!(f, "Failed to parse config file '{}': {}", path.display(), e)
            }
            ConfigError::InvalidPort(port) => {
                write!(f, "Invalid port {port}: must be at least {MIN_PORT}")
            }
            ConfigError::InvalidBufferSize => write!(
                f,
                "Buffer size must be a positive integer no larger than {MAX_FRAME_LENGTH}"
            ),
            ConfigError::InvalidBatchSize => write!(f, "Batch size must be a positive integer"),
        }
    }
}

impl std::error::Error for ConfigError {}
