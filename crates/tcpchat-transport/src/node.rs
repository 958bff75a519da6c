use std::net::SocketAddr;

use crate::client::{parse_endpoint, ClientPool};
use crate::config::TransportConfig;
use crate::connection::DuplexConnection;
use crate::event::{self, EventReceiver, TransportEvent};
use crate::server::ChatServer;
use crate::ChatTransportError;

/// A chat peer that listens and dials at the same time.
///
/// This is the main entry point for consumers. It owns one [`ChatServer`],
/// one [`ClientPool`] and the event channel both report into, and it keeps
/// track of every link it has announced so the same endpoint is not dialed
/// twice.
///
/// [`connect`](Self::connect) returns the new link directly. It is also
/// announced as `ClientConnected` through [`recv`](Self::recv) when the
/// channel has room; the two are the same link, tracked once.
#[derive(Debug)]
pub struct ChatNode {
    server: ChatServer,
    pool: ClientPool,
    events_rx: EventReceiver,
    connections: Vec<DuplexConnection>,
}

impl ChatNode {
    pub fn new(config: TransportConfig) -> Self {
        let (events_tx, events_rx) = event::channel(config.event_buffer);
        let server = ChatServer::new(config.clone(), events_tx.clone());
        let pool = ClientPool::new(config, events_tx);

        Self {
            server,
            pool,
            events_rx,
            connections: Vec::new(),
        }
    }

    pub fn server(&self) -> &ChatServer {
        &self.server
    }

    pub fn pool(&self) -> &ClientPool {
        &self.pool
    }

    /// Bind the listener and start accepting. Returns the bound endpoint.
    pub async fn create_server(&mut self) -> Result<SocketAddr, ChatTransportError> {
        let endpoint = self.server.bind_and_listen().await?;
        self.server.start().await?;
        Ok(endpoint)
    }

    pub async fn start_server(&mut self) -> Result<(), ChatTransportError> {
        self.server.start().await
    }

    pub async fn stop_server(&mut self) -> Result<(), ChatTransportError> {
        self.server.stop().await
    }

    /// Become available or unavailable; creates the server on first use.
    pub async fn toggle_availability(&mut self) -> Result<bool, ChatTransportError> {
        self.server.toggle().await
    }

    /// Whether a live announced link or outbound dialer targets `endpoint`.
    pub async fn is_connected_to(&mut self, endpoint: &SocketAddr) -> bool {
        self.connections.retain(|c| !c.is_disposed());
        self.connections.iter().any(|c| c.peer() == *endpoint)
            || self.pool.is_connected_to(endpoint).await
    }

    /// Dial `endpoint` unless a live link to it already exists.
    pub async fn connect(&mut self, endpoint: SocketAddr) -> Result<DuplexConnection, ChatTransportError> {
        if self.is_connected_to(&endpoint).await {
            return Err(ChatTransportError::AlreadyConnected(endpoint));
        }
        let dialer = self.pool.acquire().await?;
        let connection = dialer.connect(endpoint).await?;
        self.track(&connection);
        Ok(connection)
    }

    /// [`connect`](Self::connect) from user-entered address and port text.
    pub async fn connect_to(
        &mut self,
        address: &str,
        port: &str,
    ) -> Result<DuplexConnection, ChatTransportError> {
        let endpoint = parse_endpoint(address, port)?;
        self.connect(endpoint).await
    }

    /// Receive the next transport event. Blocks until one arrives.
    ///
    /// Announced connections are remembered for duplicate checks and
    /// closed on [`shutdown`](Self::shutdown).
    pub async fn recv(&mut self) -> Result<TransportEvent, ChatTransportError> {
        let event = self
            .events_rx
            .recv()
            .await
            .ok_or(ChatTransportError::Disposed)?;
        if let TransportEvent::ClientConnected { connection, .. } = &event {
            self.track(connection);
        }
        Ok(event)
    }

    fn track(&mut self, connection: &DuplexConnection) {
        self.connections.retain(|c| !c.is_disposed());
        if !self.connections.iter().any(|c| c.same_link(connection)) {
            self.connections.push(connection.clone());
        }
    }

    /// Live links dialed by this node or announced through [`recv`](Self::recv).
    pub fn connections(&mut self) -> Vec<DuplexConnection> {
        self.connections.retain(|c| !c.is_disposed());
        self.connections.clone()
    }

    /// Dispose the server and the pool and close every tracked link.
    ///
    /// Events still queued are discarded.
    pub async fn shutdown(mut self) -> Result<(), ChatTransportError> {
        self.events_rx.close();
        self.server.dispose().await;
        self.pool.dispose().await;
        for connection in self.connections.drain(..) {
            connection.close().await;
        }
        Ok(())
    }
}
