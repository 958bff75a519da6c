use std::io;
use std::net::{IpAddr, SocketAddr};

/// Errors returned by the chat transport layer.
#[derive(Debug, thiserror::Error)]
pub enum ChatTransportError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("address {addr} already in use")]
    AddressInUse {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("host {addr} is unreachable")]
    HostUnreachable {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("connection to {addr} failed: {source}")]
    Connect {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("transport error: {0}")]
    Transport(#[source] io::Error),

    #[error("connection is closed")]
    ConnectionClosed,

    #[error("no available port on {address} in {first}..={last}")]
    NoPortAvailable { address: IpAddr, first: u16, last: u16 },

    #[error("no usable non-loopback IPv4 address found")]
    NoUsableAddress,

    #[error("server was not initialized yet")]
    NotInitialized,

    #[error("server is disposed")]
    Disposed,

    #[error("read loop already started for this connection")]
    ReadLoopActive,

    #[error("dialer is {0} and cannot dial")]
    DialerUnavailable(&'static str),

    #[error("already connected to {0}")]
    AlreadyConnected(SocketAddr),

    #[error("envelope serialization failed: {0}")]
    Serialization(#[source] serde_json::Error),

    #[error("envelope deserialization failed: {0}")]
    Deserialization(#[source] serde_json::Error),
}

impl ChatTransportError {
    /// Whether the caller can reasonably retry or carry on.
    ///
    /// `AddressInUse` is retried internally by the port search;
    /// `HostUnreachable` is reported but leaves the node healthy.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            ChatTransportError::AddressInUse { .. } | ChatTransportError::HostUnreachable { .. }
        )
    }
}
