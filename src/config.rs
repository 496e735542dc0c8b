//! Manager configuration.
//!
//! Loaded from TOML. Every field has a default, so an empty file is a valid
//! configuration.
//!
//! ```toml
//! max_sockets = 4096
//! events_capacity = 1024
//!
//! [socket]
//! use_min_mtu = true
//! timestamps = true
//! packet_info = true
//! receive_dscp = false
//! # packet_dscp = true
//!
//! [logging]
//! level = "info"
//! format = "pretty"
//! ```

use serde::Deserialize;
use std::path::Path;

/// Configuration for a [`SocketManager`](crate::SocketManager).
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ManagerConfig {
    /// Upper bound on sockets in the table at once.
    #[serde(default = "default_max_sockets")]
    pub max_sockets: usize,

    /// Readiness events collected per `wait`.
    #[serde(default = "default_events_capacity")]
    pub events_capacity: usize,

    /// Options applied to every socket the manager creates.
    #[serde(default)]
    pub socket: SocketOptions,

    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            max_sockets: default_max_sockets(),
            events_capacity: default_events_capacity(),
            socket: SocketOptions::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl ManagerConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        contents.parse()
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_sockets == 0 {
            return Err(ConfigError::Invalid("max_sockets must be at least 1".into()));
        }
        if self.max_sockets > u32::MAX as usize {
            return Err(ConfigError::Invalid(format!(
                "max_sockets ({}) exceeds the socket id slot range",
                self.max_sockets
            )));
        }
        if self.events_capacity == 0 {
            return Err(ConfigError::Invalid(
                "events_capacity must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

impl std::str::FromStr for ManagerConfig {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let config: ManagerConfig = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }
}

/// Per-socket options applied at creation.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SocketOptions {
    /// IPv6 stream sockets send at the minimum MTU with a matching MSS
    /// clamp.
    #[serde(default = "default_true")]
    pub use_min_mtu: bool,

    /// Datagram sockets report a receive timestamp.
    #[serde(default = "default_true")]
    pub timestamps: bool,

    /// IPv6 datagram sockets report the destination address and interface.
    #[serde(default = "default_true")]
    pub packet_info: bool,

    /// Datagram sockets report the DSCP of received packets.
    #[serde(default)]
    pub receive_dscp: bool,

    /// Mark DSCP per packet (`true`) or through socket options (`false`).
    /// Unset means per packet for datagram sockets and per socket for
    /// stream sockets.
    #[serde(default)]
    pub packet_dscp: Option<bool>,
}

impl Default for SocketOptions {
    fn default() -> Self {
        Self {
            use_min_mtu: true,
            timestamps: true,
            packet_info: true,
            receive_dscp: false,
            packet_dscp: None,
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
    Compact,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoggingConfig {
    /// Filter directive, e.g. "info" or "sockmgr=trace".
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default)]
    pub format: LogFormat,

    #[serde(default = "default_true")]
    pub timestamps: bool,

    /// Include the event target (module path).
    #[serde(default)]
    pub target: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
            timestamps: true,
            target: false,
        }
    }
}

fn default_max_sockets() -> usize {
    4096
}

fn default_events_capacity() -> usize {
    1024
}

fn default_true() -> bool {
    true
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Configuration error.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("parse error: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}
