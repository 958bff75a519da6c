use std::net::IpAddr;

use crate::keepalive::KeepAlivePolicy;

/// First port tried by the listener's port search.
pub const DEFAULT_BASE_PORT: u16 = 11000;

/// Read-buffer size for [`ReadMode::Binary`].
pub const BINARY_BUFFER_SIZE: usize = 256;

/// Read-buffer size for [`ReadMode::Text`].
pub const TEXT_BUFFER_SIZE: usize = 1024;

/// How a [`DuplexConnection`](crate::DuplexConnection) reads its stream.
///
/// Chosen once when the connection is built; a connection never switches
/// modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReadMode {
    /// Raw byte chunks, reported as `ConnectionEvent::Data`.
    #[default]
    Binary,
    /// UTF-8 text chunks, reported as `ConnectionEvent::Text`.
    Text,
}

impl ReadMode {
    /// Size of the fixed read buffer used by this mode.
    pub fn buffer_size(self) -> usize {
        match self {
            ReadMode::Binary => BINARY_BUFFER_SIZE,
            ReadMode::Text => TEXT_BUFFER_SIZE,
        }
    }
}

/// Configuration shared by the server, the dialers and their connections.
///
/// All fields have sensible defaults. Use the builder pattern:
///
/// ```rust
/// use tcpchat_transport::{ReadMode, TransportConfig};
///
/// let config = TransportConfig::new()
///     .base_port(12000)
///     .read_mode(ReadMode::Text)
///     .event_buffer(64);
/// ```
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// First port tried when binding the listener.
    pub(crate) base_port: u16,
    /// Last port tried before giving up with `NoPortAvailable`.
    pub(crate) max_port: u16,
    /// Fixed listen address. `None` means discover the local IPv4 address.
    pub(crate) bind_address: Option<IpAddr>,
    /// Read mode for every connection created with this config.
    pub(crate) read_mode: ReadMode,
    /// Channel capacity for notifications.
    pub(crate) event_buffer: usize,
    /// Keep-alive timings applied to every socket.
    pub(crate) keepalive: KeepAlivePolicy,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl TransportConfig {
    /// Create a new config with defaults.
    pub fn new() -> Self {
        Self {
            base_port: DEFAULT_BASE_PORT,
            max_port: u16::MAX,
            bind_address: None,
            read_mode: ReadMode::Binary,
            event_buffer: 256,
            keepalive: KeepAlivePolicy::default(),
        }
    }

    /// Set the first port of the port search (default: 11000).
    pub fn base_port(mut self, port: u16) -> Self {
        self.base_port = port;
        self
    }

    /// Set the last port of the port search (default: 65535).
    pub fn max_port(mut self, port: u16) -> Self {
        self.max_port = port;
        self
    }

    /// Listen on a fixed address instead of the discovered one.
    ///
    /// ```rust
    /// use tcpchat_transport::TransportConfig;
    ///
    /// let config = TransportConfig::new()
    ///     .bind_address("127.0.0.1".parse().unwrap());
    /// ```
    pub fn bind_address(mut self, addr: IpAddr) -> Self {
        self.bind_address = Some(addr);
        self
    }

    /// Select binary or line-text reading for new connections.
    pub fn read_mode(mut self, mode: ReadMode) -> Self {
        self.read_mode = mode;
        self
    }

    /// Set the notification channel capacity (default: 256).
    pub fn event_buffer(mut self, capacity: usize) -> Self {
        self.event_buffer = capacity.max(1);
        self
    }

    /// Override the keep-alive timings.
    pub fn keepalive(mut self, policy: KeepAlivePolicy) -> Self {
        self.keepalive = policy;
        self
    }
}
