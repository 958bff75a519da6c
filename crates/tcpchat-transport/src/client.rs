use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, MutexGuard};

use tokio::net::TcpStream;
use tokio::sync::Mutex;

use crate::config::TransportConfig;
use crate::connection::DuplexConnection;
use crate::event::{self, EventSender, TransportEvent};
use crate::keepalive::enable_keepalive;
use crate::ChatTransportError;

/// Parse user-supplied address and port strings into a dialable endpoint.
///
/// The port must lie in `1..=65535` and the address must not be
/// unspecified (`0.0.0.0` / `::`).
pub fn parse_endpoint(address: &str, port: &str) -> Result<SocketAddr, ChatTransportError> {
    let ip: IpAddr = address
        .trim()
        .parse()
        .map_err(|_| ChatTransportError::InvalidArgument(format!("invalid IP address: {address}")))?;
    let port: i64 = port
        .trim()
        .parse()
        .map_err(|_| ChatTransportError::InvalidArgument(format!("invalid port: {port}")))?;
    let port = u16::try_from(port)
        .map_err(|_| ChatTransportError::InvalidArgument(format!("port {port} is outside 1..=65535")))?;

    let endpoint = SocketAddr::new(ip, port);
    validate_endpoint(&endpoint)?;
    Ok(endpoint)
}

fn validate_endpoint(endpoint: &SocketAddr) -> Result<(), ChatTransportError> {
    if endpoint.port() == 0 {
        return Err(ChatTransportError::InvalidArgument(
            "port 0 is outside 1..=65535".into(),
        ));
    }
    if endpoint.ip().is_unspecified() {
        return Err(ChatTransportError::InvalidArgument(format!(
            "cannot dial unspecified address {}",
            endpoint.ip()
        )));
    }
    Ok(())
}

fn is_unreachable(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::HostUnreachable | io::ErrorKind::NetworkUnreachable
    )
}

/// Observable status of a [`Dialer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DialerStatus {
    /// Never dialed; may be used once.
    Idle,
    /// A dial is in flight.
    Connecting,
    /// Holds a live outbound connection.
    Connected,
    /// Dial failed, its connection was closed, or it was disposed.
    Dead,
}

enum DialState {
    Idle,
    Connecting,
    Connected(DuplexConnection),
    Dead,
}

/// A single-use outbound connector tracked by the [`ClientPool`].
///
/// A dialer dials at most once. Whatever the outcome, a failed dial leaves
/// it dead, and a dialer whose connection was closed is dead too.
pub struct Dialer {
    id: u64,
    config: TransportConfig,
    events: std::sync::Mutex<Option<EventSender>>,
    state: std::sync::Mutex<DialState>,
}

impl std::fmt::Debug for Dialer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dialer")
            .field("id", &self.id)
            .field("status", &self.status())
            .finish()
    }
}

impl Dialer {
    fn new(id: u64, config: TransportConfig, events: EventSender) -> Self {
        Self {
            id,
            config,
            events: std::sync::Mutex::new(Some(events)),
            state: std::sync::Mutex::new(DialState::Idle),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn status(&self) -> DialerStatus {
        match &*self.lock_state() {
            DialState::Idle => DialerStatus::Idle,
            DialState::Connecting => DialerStatus::Connecting,
            DialState::Connected(conn) if !conn.is_disposed() => DialerStatus::Connected,
            DialState::Connected(_) | DialState::Dead => DialerStatus::Dead,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.status() == DialerStatus::Connected
    }

    pub fn is_dead(&self) -> bool {
        self.status() == DialerStatus::Dead
    }

    /// The outbound connection, if this dialer established one.
    pub fn connection(&self) -> Option<DuplexConnection> {
        match &*self.lock_state() {
            DialState::Connected(conn) => Some(conn.clone()),
            _ => None,
        }
    }

    /// Whether this dialer holds a live connection to `endpoint`.
    pub fn is_connected_to(&self, endpoint: &SocketAddr) -> bool {
        match &*self.lock_state() {
            DialState::Connected(conn) => !conn.is_disposed() && conn.peer() == *endpoint,
            _ => false,
        }
    }

    /// Dial `endpoint` and return the resulting connection.
    ///
    /// On success a [`TransportEvent::ClientConnected`] carrying the new
    /// [`DuplexConnection`] and `endpoint` is also queued, unless the event
    /// channel is full; the dial never waits on the receiver. An unreachable
    /// host is reported as an `Error` event and returned as the recoverable
    /// `HostUnreachable`; any other failure is returned as `Connect`. Either
    /// way the dialer is dead afterwards.
    pub async fn connect(&self, endpoint: SocketAddr) -> Result<DuplexConnection, ChatTransportError> {
        validate_endpoint(&endpoint)?;
        self.begin()?;

        tracing::debug!(dialer = self.id, %endpoint, "connecting");
        let result = TcpStream::connect(endpoint).await;
        self.finish(endpoint, result).await
    }

    /// Close the connection (if any), mark the dialer dead and release its
    /// event sender.
    pub async fn dispose(&self) {
        let previous = std::mem::replace(&mut *self.lock_state(), DialState::Dead);
        if let DialState::Connected(conn) = previous {
            conn.close().await;
        }
        self.take_events();
        tracing::debug!(dialer = self.id, "dialer disposed");
    }

    fn begin(&self) -> Result<(), ChatTransportError> {
        let mut state = self.lock_state();
        match &*state {
            DialState::Idle => {
                *state = DialState::Connecting;
                Ok(())
            }
            DialState::Connecting => Err(ChatTransportError::DialerUnavailable("connecting")),
            DialState::Connected(conn) if !conn.is_disposed() => {
                Err(ChatTransportError::DialerUnavailable("connected"))
            }
            DialState::Connected(_) | DialState::Dead => {
                Err(ChatTransportError::DialerUnavailable("dead"))
            }
        }
    }

    async fn finish(
        &self,
        endpoint: SocketAddr,
        result: io::Result<TcpStream>,
    ) -> Result<DuplexConnection, ChatTransportError> {
        let stream = match result {
            Ok(stream) => stream,
            Err(source) if is_unreachable(&source) => {
                self.mark_dead();
                tracing::info!(dialer = self.id, %endpoint, "tried connecting to an unreachable server");
                if let Some(events) = self.events() {
                    let message = format!("host {endpoint} is unreachable");
                    event::try_emit(&events, TransportEvent::error(message, &source));
                }
                return Err(ChatTransportError::HostUnreachable {
                    addr: endpoint,
                    source,
                });
            }
            Err(source) => {
                self.mark_dead();
                tracing::warn!(dialer = self.id, %endpoint, "socket error: {source}");
                return Err(ChatTransportError::Connect {
                    addr: endpoint,
                    source,
                });
            }
        };

        enable_keepalive(&stream, &self.config.keepalive);
        let connection =
            match DuplexConnection::from_stream(stream, self.config.read_mode, self.config.event_buffer) {
                Ok(connection) => connection,
                Err(e) => {
                    self.mark_dead();
                    return Err(e);
                }
            };

        let accepted = {
            let mut state = self.lock_state();
            if matches!(*state, DialState::Connecting) {
                *state = DialState::Connected(connection.clone());
                true
            } else {
                false
            }
        };
        if !accepted {
            // disposed while the dial was in flight
            connection.close().await;
            return Err(ChatTransportError::ConnectionClosed);
        }

        tracing::info!(dialer = self.id, %endpoint, "connected to server");
        if let Some(events) = self.events() {
            let announce = TransportEvent::ClientConnected {
                connection: connection.clone(),
                endpoint,
            };
            event::try_emit(&events, announce);
        }
        Ok(connection)
    }

    fn mark_dead(&self) {
        *self.lock_state() = DialState::Dead;
    }

    fn events(&self) -> Option<EventSender> {
        self.events
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn take_events(&self) {
        self.events
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
    }

    fn lock_state(&self) -> MutexGuard<'_, DialState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

struct PoolInner {
    dialers: Vec<Arc<Dialer>>,
    events: Option<EventSender>,
}

/// Free list of outbound dialers with lazy reaping.
///
/// Unbounded: the tracked set only shrinks when [`acquire`](Self::acquire)
/// runs into dead entries. The pool does not refuse duplicate links; callers
/// check [`is_connected_to`](Self::is_connected_to) first.
pub struct ClientPool {
    config: TransportConfig,
    inner: Mutex<PoolInner>,
    next_id: AtomicU64,
}

impl std::fmt::Debug for ClientPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientPool").finish_non_exhaustive()
    }
}

impl ClientPool {
    pub fn new(config: TransportConfig, events: EventSender) -> Self {
        Self {
            config,
            inner: Mutex::new(PoolInner {
                dialers: Vec::new(),
                events: Some(events),
            }),
            next_id: AtomicU64::new(1),
        }
    }

    /// Return an idle dialer, or a new one if none is idle.
    ///
    /// Dead dialers met during the scan are disposed and dropped.
    pub async fn acquire(&self) -> Result<Arc<Dialer>, ChatTransportError> {
        let mut inner = self.inner.lock().await;
        let events = inner.events.clone().ok_or(ChatTransportError::Disposed)?;

        let mut i = 0;
        while i < inner.dialers.len() {
            match inner.dialers[i].status() {
                DialerStatus::Idle => return Ok(inner.dialers[i].clone()),
                DialerStatus::Dead => {
                    let dead = inner.dialers.remove(i);
                    tracing::debug!(dialer = dead.id(), "reaping dead dialer");
                    dead.dispose().await;
                }
                DialerStatus::Connecting | DialerStatus::Connected => i += 1,
            }
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let dialer = Arc::new(Dialer::new(id, self.config.clone(), events));
        inner.dialers.push(dialer.clone());
        Ok(dialer)
    }

    /// Whether a tracked dialer holds a live connection to `endpoint`.
    pub async fn is_connected_to(&self, endpoint: &SocketAddr) -> bool {
        let inner = self.inner.lock().await;
        inner.dialers.iter().any(|d| d.is_connected_to(endpoint))
    }

    /// Live outbound connections.
    pub async fn connections(&self) -> Vec<DuplexConnection> {
        let inner = self.inner.lock().await;
        inner
            .dialers
            .iter()
            .filter(|d| d.is_connected())
            .filter_map(|d| d.connection())
            .collect()
    }

    /// Number of tracked dialers, dead ones included.
    pub async fn len(&self) -> usize {
        self.inner.lock().await.dialers.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Dispose every dialer and release the event channel.
    pub async fn dispose(&self) {
        let mut inner = self.inner.lock().await;
        for dialer in inner.dialers.drain(..) {
            dialer.dispose().await;
        }
        inner.events = None;
    }
}
