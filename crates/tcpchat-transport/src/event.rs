use std::net::SocketAddr;

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use crate::connection::DuplexConnection;

/// Sending half of the transport notification channel.
///
/// Held by the server, the pool and every dialer. The subscription ends when
/// all of them are disposed: the receiver then yields `None`.
pub type EventSender = mpsc::Sender<TransportEvent>;

/// Receiving half of the transport notification channel.
pub type EventReceiver = mpsc::Receiver<TransportEvent>;

/// Create a notification channel with the given capacity.
pub fn channel(capacity: usize) -> (EventSender, EventReceiver) {
    mpsc::channel(capacity.max(1))
}

/// Deliver `event`, logging instead of failing when nobody listens anymore.
///
/// Waits for capacity, so only background tasks may use it. Calls made on
/// behalf of the receiver's owner use [`try_emit`].
pub(crate) async fn emit(events: &EventSender, event: TransportEvent) {
    if events.send(event).await.is_err() {
        tracing::debug!("transport event dropped: receiver closed");
    }
}

/// Deliver `event` without waiting for capacity.
///
/// The owner of the receiver is the one calling `start`, `stop`, `connect`
/// or `dispose`; it cannot drain the channel while it awaits them. Returns
/// whether the event was queued.
pub(crate) fn try_emit(events: &EventSender, event: TransportEvent) -> bool {
    match events.try_send(event) {
        Ok(()) => true,
        Err(TrySendError::Full(event)) => {
            tracing::warn!(?event, "transport event dropped: channel full");
            false
        }
        Err(TrySendError::Closed(_)) => {
            tracing::debug!("transport event dropped: receiver closed");
            false
        }
    }
}

/// Server- and dialer-level notifications.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// A link was established, inbound (accepted) or outbound (dialed).
    ///
    /// For inbound links `endpoint` is the server's bound endpoint; for
    /// outbound links it is the dialed endpoint.
    ClientConnected {
        connection: DuplexConnection,
        endpoint: SocketAddr,
    },
    /// The listener started or stopped accepting.
    ServerStatusChanged { available: bool },
    /// A failure the owner should surface.
    Error {
        message: String,
        cause: Option<String>,
    },
}

impl TransportEvent {
    pub(crate) fn error(message: impl Into<String>, cause: impl std::fmt::Display) -> Self {
        TransportEvent::Error {
            message: message.into(),
            cause: Some(cause.to_string()),
        }
    }
}

/// Why a connection's read loop ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// `close()` was called on this side.
    Local,
    /// The peer closed its end (a read returned 0 bytes).
    EndOfStream,
    /// A read failed.
    Failed(String),
}

impl std::fmt::Display for CloseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CloseReason::Local => write!(f, "closed locally"),
            CloseReason::EndOfStream => write!(f, "closed by remote host"),
            CloseReason::Failed(e) => write!(f, "read failed: {e}"),
        }
    }
}

/// Per-connection notifications produced by the read loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// One read's worth of bytes (binary mode), exactly as read.
    Data(Bytes),
    /// One read's worth of decoded text (text mode).
    Text(String),
    /// The read loop ended and the connection is disposed. Always last.
    Closed { reason: CloseReason },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn try_emit_never_waits() {
        let (tx, mut rx) = channel(1);
        assert!(try_emit(&tx, TransportEvent::ServerStatusChanged { available: true }));
        assert!(!try_emit(&tx, TransportEvent::ServerStatusChanged { available: false }));

        assert!(matches!(
            rx.try_recv().unwrap(),
            TransportEvent::ServerStatusChanged { available: true }
        ));
        assert!(rx.try_recv().is_err());

        rx.close();
        assert!(!try_emit(&tx, TransportEvent::ServerStatusChanged { available: true }));
    }
}
