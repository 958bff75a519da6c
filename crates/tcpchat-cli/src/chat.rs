use crate::common::{elapsed_s, setup_ctrlc, spawn_stdin_lines};
use crate::events::{
    emit, now_iso, EventClosed, EventConnected, EventError, EventMessage, EventProfile, EventSent,
    EventStatus, EventSummary, EventText,
};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};
use tcpchat_transport::envelope::{ChatMessage, Packet, PacketBody, PacketStream, UserProfile};
use tcpchat_transport::{ChatNode, ConnectionEvent, DuplexConnection, TransportEvent};
use tokio::sync::mpsc;

/// One chat session: every link the node announces gets our profile, its
/// envelopes are printed as JSONL, and stdin lines go out to all of them.
pub struct Session {
    mode: &'static str,
    profile: UserProfile,
    start: Instant,
    /// End the session once the last link closes (outbound chats).
    exit_when_idle: bool,
    links: Vec<DuplexConnection>,
    streams: HashMap<SocketAddr, PacketStream>,
    reads_tx: mpsc::Sender<(SocketAddr, ConnectionEvent)>,
    reads_rx: mpsc::Receiver<(SocketAddr, ConnectionEvent)>,
    total_links: u64,
    received: u64,
    sent: u64,
}

impl Session {
    pub fn new(mode: &'static str, name: &str, start: Instant) -> Self {
        let (reads_tx, reads_rx) = mpsc::channel(256);
        Self {
            mode,
            profile: UserProfile::new(name),
            start,
            exit_when_idle: false,
            links: Vec::new(),
            streams: HashMap::new(),
            reads_tx,
            reads_rx,
            total_links: 0,
            received: 0,
            sent: 0,
        }
    }

    pub fn exit_when_idle(mut self, exit: bool) -> Self {
        self.exit_when_idle = exit;
        self
    }

    /// Take on a link obtained outside the event stream, such as a dial.
    pub async fn adopt(&mut self, connection: DuplexConnection, endpoint: SocketAddr) {
        self.on_connected(connection, endpoint).await;
    }

    pub async fn run(mut self, mut node: ChatNode) -> anyhow::Result<()> {
        let running = setup_ctrlc();
        let mut lines = spawn_stdin_lines();
        let mut stdin_open = true;
        // Short tick so the running flag is checked even when idle.
        let mut tick = tokio::time::interval(Duration::from_millis(500));

        while running.load(Ordering::Relaxed) {
            tokio::select! {
                event = node.recv() => match event {
                    Ok(event) => self.on_transport_event(event).await,
                    Err(e) => {
                        eprintln!("event channel closed: {e}");
                        break;
                    }
                },
                Some((peer, event)) = self.reads_rx.recv() => {
                    if self.on_read(peer, event) {
                        break;
                    }
                }
                line = lines.recv(), if stdin_open => match line {
                    Some(line) => self.broadcast(&line).await,
                    None => {
                        tracing::debug!("stdin closed");
                        stdin_open = false;
                    }
                },
                _ = tick.tick() => {}
            }
        }

        emit(&EventSummary {
            event: "summary",
            mode: self.mode.to_string(),
            links: self.total_links,
            received: self.received,
            sent: self.sent,
            elapsed_s: elapsed_s(self.start),
        });
        node.shutdown().await?;
        Ok(())
    }

    async fn on_transport_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::ClientConnected {
                connection,
                endpoint,
            } => self.on_connected(connection, endpoint).await,
            TransportEvent::ServerStatusChanged { available } => emit(&EventStatus {
                event: "status",
                available,
                elapsed_s: elapsed_s(self.start),
            }),
            TransportEvent::Error { message, cause } => self.report(message, cause),
        }
    }

    async fn on_connected(&mut self, connection: DuplexConnection, endpoint: SocketAddr) {
        if self.links.iter().any(|c| c.same_link(&connection)) {
            return;
        }
        let peer = connection.peer();
        let direction = if peer == endpoint { "outbound" } else { "inbound" };
        emit(&EventConnected {
            event: "connected",
            peer: peer.to_string(),
            local: connection.local().to_string(),
            direction,
            elapsed_s: elapsed_s(self.start),
        });
        self.total_links += 1;

        let mut reads = match connection.start_read_loop() {
            Ok(reads) => reads,
            Err(e) => {
                self.report(format!("cannot read from {peer}"), Some(e.to_string()));
                return;
            }
        };
        let tx = self.reads_tx.clone();
        tokio::spawn(async move {
            while let Some(event) = reads.recv().await {
                if tx.send((peer, event)).await.is_err() {
                    break;
                }
            }
        });

        match Packet::profile(&self.profile).and_then(|p| p.to_bytes()) {
            Ok(bytes) => {
                if let Err(e) = connection.send(&bytes).await {
                    self.report(format!("profile send to {peer} failed"), Some(e.to_string()));
                }
            }
            Err(e) => self.report("profile encoding failed".into(), Some(e.to_string())),
        }

        self.links.push(connection);
    }

    /// Handle one read-loop event. Returns true when the session should end.
    fn on_read(&mut self, peer: SocketAddr, event: ConnectionEvent) -> bool {
        match event {
            ConnectionEvent::Data(chunk) => {
                let packets = match self.streams.entry(peer).or_default().push(&chunk) {
                    Ok(packets) => packets,
                    Err(e) => {
                        self.report(format!("garbled data from {peer}"), Some(e.to_string()));
                        return false;
                    }
                };
                for packet in packets {
                    self.on_packet(peer, &packet);
                }
                false
            }
            ConnectionEvent::Text(text) => {
                emit(&EventText {
                    event: "text",
                    peer: peer.to_string(),
                    text,
                });
                false
            }
            ConnectionEvent::Closed { reason } => {
                self.streams.remove(&peer);
                self.links.retain(|c| !c.is_disposed());
                emit(&EventClosed {
                    event: "closed",
                    peer: peer.to_string(),
                    reason: reason.to_string(),
                    elapsed_s: elapsed_s(self.start),
                });
                self.exit_when_idle && self.links.is_empty()
            }
        }
    }

    fn on_packet(&mut self, peer: SocketAddr, packet: &Packet) {
        match packet.body() {
            Ok(Some(PacketBody::Message(message))) => {
                self.received += 1;
                emit(&EventMessage {
                    event: "message",
                    peer: peer.to_string(),
                    from: message.sender_name().to_string(),
                    content: message.content().to_string(),
                    time: message.time().map(|t| t.to_rfc3339()),
                });
            }
            Ok(Some(PacketBody::Profile(profile))) => emit(&EventProfile {
                event: "profile",
                peer: peer.to_string(),
                username: profile.username().to_string(),
            }),
            Ok(None) => tracing::debug!(%peer, kind = ?packet.kind(), "skipping packet"),
            Err(e) => self.report(format!("bad payload from {peer}"), Some(e.to_string())),
        }
    }

    async fn broadcast(&mut self, line: &str) {
        if !ChatMessage::is_sendable(line) {
            return;
        }
        self.links.retain(|c| !c.is_disposed());
        if self.links.is_empty() {
            eprintln!("no peers connected, message dropped");
            return;
        }

        let message = ChatMessage::new(&self.profile, line);
        let bytes = match Packet::message(&message).and_then(|p| p.to_bytes()) {
            Ok(bytes) => bytes,
            Err(e) => {
                self.report("message encoding failed".into(), Some(e.to_string()));
                return;
            }
        };

        let mut delivered = 0;
        let mut failures = Vec::new();
        for link in &self.links {
            match link.send(&bytes).await {
                Ok(()) => delivered += 1,
                Err(e) => failures.push((link.peer(), e)),
            }
        }
        for (peer, e) in failures {
            self.report(format!("send to {peer} failed"), Some(e.to_string()));
        }

        self.sent += 1;
        emit(&EventSent {
            event: "sent",
            content: line.to_string(),
            peers: delivered,
            timestamp: now_iso(),
        });
    }

    fn report(&self, message: String, cause: Option<String>) {
        emit(&EventError {
            event: "error",
            message,
            cause,
            elapsed_s: elapsed_s(self.start),
        });
    }
}
