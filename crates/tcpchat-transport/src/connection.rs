use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::config::ReadMode;
use crate::event::{CloseReason, ConnectionEvent};
use crate::ChatTransportError;

const OPEN: u8 = 0;
const CLOSING: u8 = 1;
const CLOSED: u8 = 2;

/// Lifecycle of a [`DuplexConnection`]. Never goes back to `Open`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Open,
    Closing,
    Closed,
}

struct Shared {
    peer: SocketAddr,
    local: SocketAddr,
    mode: ReadMode,
    event_buffer: usize,
    state: AtomicU8,
    /// Ends the read loop and aborts an in-flight write.
    cancel: CancellationToken,
    /// Present until the read loop takes it (or `close()` releases it).
    reader: std::sync::Mutex<Option<OwnedReadHalf>>,
    writer: Mutex<Option<OwnedWriteHalf>>,
}

/// One established TCP link: a read loop, a write operation, and disposal.
///
/// Cheap to clone; all clones share the same stream. Writes are serialized
/// per `send()` call, but a message spread over several calls may interleave
/// with another task's sends. Callers that need multi-buffer atomicity must
/// serialize their own calls.
#[derive(Clone)]
pub struct DuplexConnection {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for DuplexConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DuplexConnection")
            .field("peer", &self.shared.peer)
            .field("local", &self.shared.local)
            .field("mode", &self.shared.mode)
            .field("state", &self.state())
            .finish()
    }
}

impl DuplexConnection {
    /// Wrap an established stream. The read loop is not started.
    pub(crate) fn from_stream(
        stream: TcpStream,
        mode: ReadMode,
        event_buffer: usize,
    ) -> Result<Self, ChatTransportError> {
        let peer = stream.peer_addr().map_err(ChatTransportError::Transport)?;
        let local = stream.local_addr().map_err(ChatTransportError::Transport)?;
        let (reader, writer) = stream.into_split();

        tracing::debug!(%peer, %local, ?mode, "connection established");

        Ok(Self {
            shared: Arc::new(Shared {
                peer,
                local,
                mode,
                event_buffer: event_buffer.max(1),
                state: AtomicU8::new(OPEN),
                cancel: CancellationToken::new(),
                reader: std::sync::Mutex::new(Some(reader)),
                writer: Mutex::new(Some(writer)),
            }),
        })
    }

    /// Remote endpoint of this link.
    pub fn peer(&self) -> SocketAddr {
        self.shared.peer
    }

    /// Local endpoint of this link.
    pub fn local(&self) -> SocketAddr {
        self.shared.local
    }

    pub fn read_mode(&self) -> ReadMode {
        self.shared.mode
    }

    pub fn state(&self) -> ConnectionState {
        match self.shared.state.load(Ordering::Acquire) {
            OPEN => ConnectionState::Open,
            CLOSING => ConnectionState::Closing,
            _ => ConnectionState::Closed,
        }
    }

    /// True once `close()` has begun, from any caller or the read loop.
    pub fn is_disposed(&self) -> bool {
        self.state() != ConnectionState::Open
    }

    /// Whether two handles refer to the same link.
    pub fn same_link(&self, other: &DuplexConnection) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }

    /// Write `data` to the stream and flush.
    ///
    /// Fails with `ConnectionClosed` once the connection is disposed
    /// (including a close racing with this write). An I/O failure closes the
    /// connection before the error is returned.
    pub async fn send(&self, data: &[u8]) -> Result<(), ChatTransportError> {
        if self.is_disposed() {
            return Err(ChatTransportError::ConnectionClosed);
        }

        let result = {
            let mut guard = self.shared.writer.lock().await;
            let Some(writer) = guard.as_mut() else {
                return Err(ChatTransportError::ConnectionClosed);
            };
            tokio::select! {
                biased;
                _ = self.shared.cancel.cancelled() => {
                    return Err(ChatTransportError::ConnectionClosed);
                }
                result = write_and_flush(writer, data) => result,
            }
        };

        if let Err(e) = result {
            tracing::debug!(peer = %self.shared.peer, "network write error: {e}");
            self.close().await;
            return Err(ChatTransportError::Transport(e));
        }
        Ok(())
    }

    /// Write `text` followed by a newline. Empty text is not sent.
    pub async fn send_line(&self, text: &str) -> Result<(), ChatTransportError> {
        if text.is_empty() {
            return Ok(());
        }
        let mut line = String::with_capacity(text.len() + 1);
        line.push_str(text);
        line.push('\n');
        self.send(line.as_bytes()).await
    }

    /// Start the background read loop and return its event stream.
    ///
    /// Each read is reported as one event, with no accumulation or
    /// re-framing: a sender's single `send()` may arrive split over several
    /// events, and several small sends may arrive as one. The stream always
    /// ends with `ConnectionEvent::Closed`, after which the connection is
    /// disposed. Dropping the receiver closes the connection.
    ///
    /// Must be called from within a tokio runtime. Only one read loop may
    /// ever run per connection.
    pub fn start_read_loop(&self) -> Result<mpsc::Receiver<ConnectionEvent>, ChatTransportError> {
        if self.is_disposed() {
            return Err(ChatTransportError::ConnectionClosed);
        }
        let Some(reader) = self.take_reader() else {
            return Err(if self.is_disposed() {
                ChatTransportError::ConnectionClosed
            } else {
                ChatTransportError::ReadLoopActive
            });
        };

        let (tx, rx) = mpsc::channel(self.shared.event_buffer);
        let span = tracing::debug_span!(
            "read_loop",
            peer = %self.shared.peer,
            mode = ?self.shared.mode
        );
        tokio::spawn(read_loop(self.clone(), reader, tx).instrument(span));
        Ok(rx)
    }

    /// Close the connection. Idempotent; concurrent callers return at once.
    ///
    /// Cancels the read loop, then releases the reader, the writer and
    /// finally the stream. Teardown errors are logged, never returned.
    pub async fn close(&self) {
        if self
            .shared
            .state
            .compare_exchange(OPEN, CLOSING, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }

        self.shared.cancel.cancel();

        // A running read loop drops its own reader when it sees the cancel.
        drop(self.take_reader());

        let writer = self.shared.writer.lock().await.take();
        if let Some(mut writer) = writer {
            if let Err(e) = writer.shutdown().await {
                tracing::debug!(peer = %self.shared.peer, "error closing connection: {e}");
            }
        }

        self.shared.state.store(CLOSED, Ordering::Release);
        tracing::debug!(peer = %self.shared.peer, "connection closed");
    }

    fn take_reader(&self) -> Option<OwnedReadHalf> {
        self.shared
            .reader
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
    }
}

async fn write_and_flush(writer: &mut OwnedWriteHalf, data: &[u8]) -> io::Result<()> {
    writer.write_all(data).await?;
    writer.flush().await
}

async fn read_loop(
    conn: DuplexConnection,
    mut reader: OwnedReadHalf,
    tx: mpsc::Sender<ConnectionEvent>,
) {
    let cancel = conn.shared.cancel.clone();
    let mode = conn.shared.mode;
    let mut buf = vec![0u8; mode.buffer_size()];
    let mut text = Utf8Chunker::default();

    let reason = loop {
        let n = tokio::select! {
            biased;
            _ = cancel.cancelled() => break CloseReason::Local,
            read = reader.read(&mut buf) => match read {
                Ok(0) => {
                    tracing::debug!("connection closed by remote host");
                    break CloseReason::EndOfStream;
                }
                Ok(n) => n,
                Err(e) => {
                    tracing::debug!("network error: {e}");
                    break CloseReason::Failed(e.to_string());
                }
            },
        };

        let event = match mode {
            ReadMode::Binary => ConnectionEvent::Data(Bytes::copy_from_slice(&buf[..n])),
            ReadMode::Text => {
                let chunk = text.push(&buf[..n]);
                let chunk = chunk.trim_end_matches('\0');
                if chunk.is_empty() {
                    continue;
                }
                ConnectionEvent::Text(chunk.to_string())
            }
        };

        tokio::select! {
            biased;
            _ = cancel.cancelled() => break CloseReason::Local,
            sent = tx.send(event) => {
                if sent.is_err() {
                    tracing::debug!("event receiver dropped, closing");
                    break CloseReason::Local;
                }
            }
        }
    };

    drop(reader);
    conn.close().await;
    if let Some(tail) = text.finish() {
        tracing::debug!("stream ended inside a UTF-8 sequence");
        let _ = tx.send(ConnectionEvent::Text(tail)).await;
    }
    let _ = tx.send(ConnectionEvent::Closed { reason }).await;
}

/// Incremental UTF-8 decoder for text mode.
///
/// A multi-byte sequence cut by a read boundary is held back until the rest
/// arrives; invalid bytes become U+FFFD.
#[derive(Debug, Default)]
struct Utf8Chunker {
    pending: Vec<u8>,
}

impl Utf8Chunker {
    fn push(&mut self, bytes: &[u8]) -> String {
        self.pending.extend_from_slice(bytes);

        let mut out = String::with_capacity(self.pending.len());
        let mut consumed = 0;
        loop {
            let rest = &self.pending[consumed..];
            match std::str::from_utf8(rest) {
                Ok(s) => {
                    out.push_str(s);
                    consumed = self.pending.len();
                    break;
                }
                Err(e) => {
                    let valid = e.valid_up_to();
                    out.push_str(&String::from_utf8_lossy(&rest[..valid]));
                    match e.error_len() {
                        Some(bad) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            consumed += valid + bad;
                        }
                        // incomplete sequence at the end
                        None => {
                            consumed += valid;
                            break;
                        }
                    }
                }
            }
        }

        self.pending.drain(..consumed);
        out
    }

    /// Flush a sequence left incomplete when the stream ended.
    fn finish(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }
        self.pending.clear();
        Some(char::REPLACEMENT_CHARACTER.to_string())
    }
}
