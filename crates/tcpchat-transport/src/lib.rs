//! TCP chat transport layer.
//!
//! Each peer listens for inbound links and dials outbound ones at the same
//! time. Links are plain TCP streams with keep-alive, wrapped in
//! [`DuplexConnection`]s that move byte buffers and nothing else: encoding
//! the chat [`envelope`] is the caller's job.
//!
//! # Quick start
//!
//! ```rust,no_run
//! use tcpchat_transport::{ChatNode, TransportConfig, TransportEvent};
//!
//! # async fn example() -> Result<(), tcpchat_transport::ChatTransportError> {
//! let mut node = ChatNode::new(TransportConfig::new());
//! let endpoint = node.create_server().await?;
//! println!("Listening on {endpoint}");
//!
//! node.connect("192.168.0.21:11000".parse().unwrap()).await?;
//!
//! while let Ok(event) = node.recv().await {
//!     if let TransportEvent::ClientConnected { connection, .. } = event {
//!         let mut rx = connection.start_read_loop()?;
//!         connection.send(b"hello").await?;
//!         tokio::spawn(async move {
//!             while let Some(event) = rx.recv().await {
//!                 println!("{event:?}");
//!             }
//!         });
//!     }
//! }
//!
//! node.shutdown().await?;
//! # Ok(())
//! # }
//! ```
//!
//! # Framing
//!
//! Each read is delivered as one event. TCP does not preserve write
//! boundaries, so one `send()` may surface as several events and several
//! sends as one; peers that exchange envelopes rely on small messages
//! arriving whole.

mod client;
mod config;
mod connection;
pub mod envelope;
mod error;
mod event;
mod keepalive;
mod node;
mod resolver;
mod server;

pub use client::{parse_endpoint, ClientPool, Dialer, DialerStatus};
pub use config::{ReadMode, TransportConfig, BINARY_BUFFER_SIZE, DEFAULT_BASE_PORT, TEXT_BUFFER_SIZE};
pub use connection::{ConnectionState, DuplexConnection};
pub use error::ChatTransportError;
pub use event::{channel, CloseReason, ConnectionEvent, EventReceiver, EventSender, TransportEvent};
pub use keepalive::{enable_keepalive, KeepAlivePolicy, KEEPALIVE_IDLE, KEEPALIVE_INTERVAL, KEEPALIVE_RETRIES};
pub use node::ChatNode;
pub use resolver::discover_local_ipv4;
pub use server::{ChatServer, ListenState};
