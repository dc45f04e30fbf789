//! Configuration Module
//!
//! TOML-based configuration for mqrelay with support for:
//! - Log level
//! - Server bind address
//! - Packet and queue limits
//! - Subscription registry behavior
//! - Environment variable overrides (MQRELAY__* prefix)

use std::net::SocketAddr;
use std::path::Path;
use std::sync::OnceLock;

use config::{Environment, File, FileFormat};
use regex::Regex;
use serde::Deserialize;

use crate::broker::BrokerConfig;
use crate::codec::MAX_REMAINING_LENGTH;

/// Substitute environment variables in a string.
/// Supports `${VAR}` and `${VAR:-default}` syntax.
fn substitute_env_vars(content: &str) -> String {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    let re = PATTERN.get_or_init(|| {
        Regex::new(r"\$\{([^}:]+)(?::-([^}]*))?\}").expect("env var pattern is a valid regex")
    });
    re.replace_all(content, |caps: &regex::Captures| {
        let var_name = &caps[1];
        let default = caps.get(2).map(|m| m.as_str()).unwrap_or("");
        std::env::var(var_name).unwrap_or_else(|_| default.to_string())
    })
    .to_string()
}


/// Configuration error types
#[derive(Debug)]
pub enum ConfigError {
    /// IO error reading config file
    Io(std::io::Error),
    /// TOML parsing error
    Parse(toml::de::Error),
    /// Config crate error
    Config(config::ConfigError),
    /// Validation error
    Validation(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "IO error: {}", e),
            ConfigError::Parse(e) => write!(f, "Parse error: {}", e),
            ConfigError::Config(e) => write!(f, "Config error: {}", e),
            ConfigError::Validation(msg) => write!(f, "Validation error: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self {
        ConfigError::Parse(e)
    }
}

impl From<config::ConfigError> for ConfigError {
    fn from(e: config::ConfigError) -> Self {
        ConfigError::Config(e)
    }
}

/// Root configuration structure
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Logging configuration
    pub log: LogConfig,
    /// Server configuration
    pub server: ServerConfig,
    /// Packet and queue limits
    pub limits: LimitsConfig,
    /// Subscription registry behavior
    pub registry: RegistryConfig,
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Log level: error, warn, info, debug, trace
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

/// Server configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// TCP bind address
    #[serde(default = "default_bind")]
    pub bind: SocketAddr,
}

fn default_bind() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 1883))
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

/// Packet and queue limits
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    /// Maximum remaining length of an inbound packet, in bytes.
    /// Values above 268435455 are clamped.
    #[serde(default = "default_max_packet_size")]
    pub max_packet_size: usize,
    /// Per-connection outbound queue capacity. Publishers wait while a
    /// subscriber's queue is full.
    #[serde(default = "default_outbound_queue_capacity")]
    pub outbound_queue_capacity: usize,
    /// Capacity of the queue of client messages awaiting `Broker::receive`
    #[serde(default = "default_inbox_capacity")]
    pub inbox_capacity: usize,
}

fn default_max_packet_size() -> usize {
    MAX_REMAINING_LENGTH
}
fn default_outbound_queue_capacity() -> usize {
    1000
}
fn default_inbox_capacity() -> usize {
    10_000
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_packet_size: default_max_packet_size(),
            outbound_queue_capacity: default_outbound_queue_capacity(),
            inbox_capacity: default_inbox_capacity(),
        }
    }
}

/// Subscription registry configuration
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Drop a connection's subscriptions when it closes.
    /// Off by default: the registry only ever grows.
    pub prune_on_disconnect: bool,
}

impl Config {
    /// Load configuration from a TOML file with environment variable overrides.
    ///
    /// Supports two forms of environment variable usage:
    /// 1. In-file substitution: `${VAR}` or `${VAR:-default}` syntax in the TOML file
    /// 2. Override via env vars: `MQRELAY__` prefix with double underscores for nesting:
    ///    - `MQRELAY__SERVER__BIND=0.0.0.0:1884` overrides `server.bind`
    ///    - `MQRELAY__LIMITS__INBOX_CAPACITY=500` overrides `limits.inbox_capacity`
    ///    - `MQRELAY__REGISTRY__PRUNE_ON_DISCONNECT=true` overrides `registry.prune_on_disconnect`
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut builder = config::Config::builder()
            .set_default("log.level", "info")?
            .set_default("server.bind", "0.0.0.0:1883")?
            .set_default("limits.max_packet_size", MAX_REMAINING_LENGTH as u64)?
            .set_default("limits.outbound_queue_capacity", 1000)?
            .set_default("limits.inbox_capacity", 10_000)?
            .set_default("registry.prune_on_disconnect", false)?;

        // Load from file with env var substitution
        let path = path.as_ref();
        match std::fs::read_to_string(path) {
            Ok(content) => {
                let substituted = substitute_env_vars(&content);
                builder = builder.add_source(File::from_str(&substituted, FileFormat::Toml));
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                // File doesn't exist, use defaults
            }
            Err(e) => return Err(ConfigError::Io(e)),
        }

        // Double underscore separates nested keys, single underscore preserved in field names
        let cfg = builder
            .add_source(
                Environment::with_prefix("MQRELAY")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: Config = cfg.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration with environment variable overrides only (no file).
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::load(Path::new(""))
    }

    /// Parse configuration from a string (no env var support)
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.limits.max_packet_size == 0 {
            return Err(ConfigError::Validation(
                "limits.max_packet_size must be greater than 0".to_string(),
            ));
        }
        if self.limits.outbound_queue_capacity == 0 {
            return Err(ConfigError::Validation(
                "limits.outbound_queue_capacity must be greater than 0".to_string(),
            ));
        }
        if self.limits.inbox_capacity == 0 {
            return Err(ConfigError::Validation(
                "limits.inbox_capacity must be greater than 0".to_string(),
            ));
        }
        if !matches!(
            self.log.level.to_ascii_lowercase().as_str(),
            "error" | "warn" | "info" | "debug" | "trace"
        ) {
            return Err(ConfigError::Validation(format!(
                "unknown log level '{}'",
                self.log.level
            )));
        }
        Ok(())
    }

    /// Broker settings derived from this configuration
    pub fn broker_config(&self) -> BrokerConfig {
        BrokerConfig {
            bind_addr: self.server.bind,
            max_packet_size: self.limits.max_packet_size.min(MAX_REMAINING_LENGTH),
            outbound_queue_capacity: self.limits.outbound_queue_capacity,
            inbox_capacity: self.limits.inbox_capacity,
            prune_on_disconnect: self.registry.prune_on_disconnect,
        }
    }
}
