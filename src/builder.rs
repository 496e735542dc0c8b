//! Socket manager builder with fluent API.

use crate::config::{ManagerConfig, SocketOptions};
use crate::manager::SocketManager;
use std::io;

/// Builder for creating a socket manager with custom configuration.
///
/// # Example
///
/// ```ignore
/// use sockmgr::SocketManager;
///
/// let manager = SocketManager::builder()
///     .max_sockets(1024)
///     .events_capacity(256)
///     .timestamps(false)
///     .build()?;
/// ```
#[derive(Debug, Clone)]
pub struct SocketManagerBuilder {
    config: ManagerConfig,
}

impl Default for SocketManagerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl SocketManagerBuilder {
    /// Create a new builder with default settings.
    pub fn new() -> Self {
        Self {
            config: ManagerConfig::default(),
        }
    }

    /// Start from a loaded configuration.
    pub fn from_config(config: ManagerConfig) -> Self {
        Self { config }
    }

    /// Set the maximum number of sockets in the table.
    ///
    /// Default: 4096
    pub fn max_sockets(mut self, max: usize) -> Self {
        self.config.max_sockets = max;
        self
    }

    /// Set the number of readiness events collected per `wait`.
    ///
    /// Default: 1024
    pub fn events_capacity(mut self, capacity: usize) -> Self {
        self.config.events_capacity = capacity;
        self
    }

    /// Replace the per-socket options wholesale.
    pub fn socket_options(mut self, options: SocketOptions) -> Self {
        self.config.socket = options;
        self
    }

    /// Minimum MTU hint and MSS clamp for IPv6 stream sockets.
    ///
    /// Default: true
    pub fn use_min_mtu(mut self, enabled: bool) -> Self {
        self.config.socket.use_min_mtu = enabled;
        self
    }

    /// Receive timestamps on datagram sockets.
    ///
    /// Default: true
    pub fn timestamps(mut self, enabled: bool) -> Self {
        self.config.socket.timestamps = enabled;
        self
    }

    /// Destination packet info on IPv6 datagram sockets.
    ///
    /// Default: true
    pub fn packet_info(mut self, enabled: bool) -> Self {
        self.config.socket.packet_info = enabled;
        self
    }

    /// Ingress DSCP reporting on datagram sockets.
    ///
    /// Default: false
    pub fn receive_dscp(mut self, enabled: bool) -> Self {
        self.config.socket.receive_dscp = enabled;
        self
    }

    /// Force per-packet (`true`) or per-socket (`false`) DSCP marking.
    ///
    /// Default: per packet for datagram sockets, per socket for stream
    /// sockets.
    pub fn packet_dscp(mut self, per_packet: bool) -> Self {
        self.config.socket.packet_dscp = Some(per_packet);
        self
    }

    /// Build the manager with the configured settings.
    pub fn build(self) -> io::Result<SocketManager> {
        self.config
            .validate()
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        SocketManager::with_config(self.config)
    }
}
