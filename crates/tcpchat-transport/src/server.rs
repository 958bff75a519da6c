use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::Instrument;

use crate::config::TransportConfig;
use crate::connection::DuplexConnection;
use crate::event::{self, EventSender, TransportEvent};
use crate::keepalive::enable_keepalive;
use crate::resolver::discover_local_ipv4;
use crate::ChatTransportError;

/// Where the listener is in its lifecycle.
///
/// `Unbound → Bound → Listening ⇄ Stopped → Disposed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenState {
    Unbound,
    Bound,
    Listening,
    Stopped,
    Disposed,
}

/// State shared with the accept loop.
struct ServerShared {
    config: TransportConfig,
    available: watch::Sender<bool>,
    connections: Mutex<Vec<DuplexConnection>>,
}

/// Inbound side of a chat peer: binds, accepts, and hands out connections.
///
/// Every accepted socket gets keep-alive, is wrapped in a
/// [`DuplexConnection`], tracked for disposal, and announced as
/// [`TransportEvent::ClientConnected`].
pub struct ChatServer {
    shared: Arc<ServerShared>,
    events: Option<EventSender>,
    endpoint: Option<SocketAddr>,
    /// Bound socket not yet handed to an accept loop.
    listener: Option<TcpListener>,
    accept_task: Option<JoinHandle<()>>,
    disposed: bool,
}

impl std::fmt::Debug for ChatServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChatServer")
            .field("endpoint", &self.endpoint)
            .field("state", &self.state())
            .finish()
    }
}

impl ChatServer {
    /// Create an unbound server that reports through `events`.
    pub fn new(config: TransportConfig, events: EventSender) -> Self {
        let (available, _) = watch::channel(false);
        Self {
            shared: Arc::new(ServerShared {
                config,
                available,
                connections: Mutex::new(Vec::new()),
            }),
            events: Some(events),
            endpoint: None,
            listener: None,
            accept_task: None,
            disposed: false,
        }
    }

    /// The bound endpoint, once `bind_and_listen` succeeded.
    pub fn endpoint(&self) -> Option<SocketAddr> {
        self.endpoint
    }

    /// Whether the accept loop is running.
    pub fn is_available(&self) -> bool {
        *self.shared.available.borrow()
    }

    /// Whether a listening endpoint has been found.
    pub fn is_bound(&self) -> bool {
        self.endpoint.is_some()
    }

    pub fn state(&self) -> ListenState {
        if self.disposed {
            ListenState::Disposed
        } else if self.endpoint.is_none() {
            ListenState::Unbound
        } else if self.is_available() {
            ListenState::Listening
        } else if self.listener.is_some() {
            ListenState::Bound
        } else {
            ListenState::Stopped
        }
    }

    /// Bind a listening socket on the local address.
    ///
    /// Tries `base_port`, then each following port up to `max_port`,
    /// skipping ports already in use. Returns the bound endpoint. Calling it
    /// again on a bound server returns the existing endpoint.
    pub async fn bind_and_listen(&mut self) -> Result<SocketAddr, ChatTransportError> {
        self.ensure_live()?;
        if let Some(endpoint) = self.endpoint {
            return Ok(endpoint);
        }

        let address = match self.shared.config.bind_address {
            Some(addr) => addr,
            None => IpAddr::V4(discover_local_ipv4()?),
        };
        let first = self.shared.config.base_port;
        let last = self.shared.config.max_port;

        tracing::debug!(%address, first, last, "creating server");

        for port in first..=last {
            match TcpListener::bind((address, port)).await {
                Ok(listener) => {
                    let endpoint = listener
                        .local_addr()
                        .map_err(ChatTransportError::Transport)?;
                    tracing::info!(%endpoint, "server bound");
                    self.endpoint = Some(endpoint);
                    self.listener = Some(listener);
                    return Ok(endpoint);
                }
                Err(e) if e.kind() == io::ErrorKind::AddrInUse => {
                    tracing::debug!(port, "port in use, trying next");
                }
                Err(e) => return Err(ChatTransportError::Transport(e)),
            }
        }

        Err(ChatTransportError::NoPortAvailable {
            address,
            first,
            last,
        })
    }

    /// Begin accepting connections.
    ///
    /// After a `stop()` the stored endpoint is bound again.
    pub async fn start(&mut self) -> Result<(), ChatTransportError> {
        self.ensure_live()?;
        let endpoint = self.endpoint.ok_or(ChatTransportError::NotInitialized)?;
        if self.is_available() {
            return Ok(());
        }

        // a loop that died on an accept error has already released its socket
        if let Some(task) = self.accept_task.take() {
            let _ = task.await;
        }

        let listener = match self.listener.take() {
            Some(listener) => listener,
            None => TcpListener::bind(endpoint).await.map_err(|source| {
                if source.kind() == io::ErrorKind::AddrInUse {
                    ChatTransportError::AddressInUse {
                        addr: endpoint,
                        source,
                    }
                } else {
                    ChatTransportError::Transport(source)
                }
            })?,
        };

        let events = self.events.clone().ok_or(ChatTransportError::Disposed)?;
        self.shared.available.send_replace(true);
        tracing::info!(%endpoint, "server started");

        let span = tracing::info_span!("accept_loop", %endpoint);
        self.accept_task = Some(tokio::spawn(
            accept_loop(listener, self.shared.clone(), events.clone(), endpoint).instrument(span),
        ));

        event::try_emit(&events, TransportEvent::ServerStatusChanged { available: true });
        Ok(())
    }

    /// Stop accepting connections and close the listening socket.
    ///
    /// Established connections are left untouched.
    pub async fn stop(&mut self) -> Result<(), ChatTransportError> {
        self.ensure_live()?;
        if self.endpoint.is_none() {
            return Err(ChatTransportError::NotInitialized);
        }
        self.halt().await;
        Ok(())
    }

    /// Start if stopped, stop if listening; bind first if never bound.
    ///
    /// Returns the new availability.
    pub async fn toggle(&mut self) -> Result<bool, ChatTransportError> {
        self.ensure_live()?;
        if !self.is_bound() {
            self.bind_and_listen().await?;
            self.start().await?;
        } else if self.is_available() {
            self.stop().await?;
        } else {
            self.start().await?;
        }
        Ok(self.is_available())
    }

    /// Live inbound connections. Disposed ones are dropped from tracking.
    pub async fn connections(&self) -> Vec<DuplexConnection> {
        let mut conns = self.shared.connections.lock().await;
        conns.retain(|c| !c.is_disposed());
        conns.clone()
    }

    /// Stop accepting, close every tracked connection, and release the
    /// event channel. Idempotent.
    pub async fn dispose(&mut self) {
        if self.disposed {
            return;
        }
        self.halt().await;
        self.listener = None;

        let tracked = std::mem::take(&mut *self.shared.connections.lock().await);
        for conn in tracked {
            conn.close().await;
        }

        self.events = None;
        self.disposed = true;
        tracing::debug!(endpoint = ?self.endpoint, "server disposed");
    }

    fn ensure_live(&self) -> Result<(), ChatTransportError> {
        if self.disposed {
            Err(ChatTransportError::Disposed)
        } else {
            Ok(())
        }
    }

    async fn halt(&mut self) {
        self.listener = None;
        let was_available = self.shared.available.send_replace(false);
        if let Some(task) = self.accept_task.take() {
            let _ = task.await;
        }
        if was_available {
            tracing::info!(endpoint = ?self.endpoint, "server stopped");
            if let Some(events) = &self.events {
                event::try_emit(events, TransportEvent::ServerStatusChanged { available: false });
            }
        }
    }
}

impl Drop for ChatServer {
    fn drop(&mut self) {
        // lets a still-running accept loop release the socket
        self.shared.available.send_replace(false);
    }
}

async fn accept_loop(
    listener: TcpListener,
    shared: Arc<ServerShared>,
    events: EventSender,
    endpoint: SocketAddr,
) {
    let mut available = shared.available.subscribe();

    loop {
        if !*available.borrow_and_update() {
            break;
        }

        let accepted = tokio::select! {
            changed = available.changed() => {
                if changed.is_err() {
                    break;
                }
                continue;
            }
            accepted = listener.accept() => accepted,
        };

        match accepted {
            Ok((stream, peer)) => {
                tracing::debug!(%peer, "server accepted a new client");
                handle_client(stream, peer, &shared, &events, &mut available, endpoint).await;
            }
            Err(e) => {
                tracing::warn!("accept failed, stopping accept loop: {e}");
                shared.available.send_replace(false);
                // the owner may be blocked in stop(); report without waiting on it
                let events = events.clone();
                tokio::spawn(async move {
                    event::emit(&events, TransportEvent::error("server stopped accepting", &e)).await;
                    event::emit(&events, TransportEvent::ServerStatusChanged { available: false }).await;
                });
                break;
            }
        }
    }

    drop(listener);
    tracing::debug!("accept loop ended");
}

async fn handle_client(
    stream: TcpStream,
    peer: SocketAddr,
    shared: &ServerShared,
    events: &EventSender,
    available: &mut watch::Receiver<bool>,
    endpoint: SocketAddr,
) {
    let config = &shared.config;
    enable_keepalive(&stream, &config.keepalive);

    let connection = match DuplexConnection::from_stream(stream, config.read_mode, config.event_buffer) {
        Ok(connection) => connection,
        Err(e) => {
            tracing::warn!(%peer, "could not wrap accepted socket: {e}");
            event::emit(events, TransportEvent::error("failed to set up inbound connection", &e)).await;
            return;
        }
    };

    {
        let mut conns = shared.connections.lock().await;
        conns.retain(|c| !c.is_disposed());
        conns.push(connection.clone());
    }

    let announce = TransportEvent::ClientConnected {
        connection: connection.clone(),
        endpoint,
    };
    let delivered = tokio::select! {
        sent = events.send(announce) => sent.is_ok(),
        _ = available.wait_for(|up| !*up) => false,
    };
    if !delivered {
        tracing::debug!(%peer, "no owner for inbound connection, closing it");
        connection.close().await;
    }
}
