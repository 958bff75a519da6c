//! Integration tests: listeners and dialers talking over loopback.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use tcpchat_transport::envelope::{self, ChatMessage, Packet, PacketBody, UserProfile};
use tcpchat_transport::{
    channel, ChatNode, ChatServer, ChatTransportError, ClientPool, CloseReason, ConnectionEvent,
    DuplexConnection, EventReceiver, ListenState, ReadMode, TransportConfig, TransportEvent,
};
use tokio::net::TcpListener;
use tokio::sync::mpsc;

const LOCALHOST: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_env_filter("warn").try_init();
}

/// Loopback config; port 0 lets the OS pick so tests never collide.
fn loopback() -> TransportConfig {
    TransportConfig::new()
        .bind_address(LOCALHOST)
        .base_port(0)
        .max_port(0)
}

async fn next_event(rx: &mut EventReceiver) -> TransportEvent {
    tokio::time::timeout(Duration::from_secs(10), rx.recv())
        .await
        .expect("transport event timed out")
        .expect("transport channel closed")
}

async fn next_read(rx: &mut mpsc::Receiver<ConnectionEvent>) -> ConnectionEvent {
    tokio::time::timeout(Duration::from_secs(10), rx.recv())
        .await
        .expect("read event timed out")
        .expect("read loop ended without Closed")
}

async fn expect_connected(rx: &mut EventReceiver) -> (DuplexConnection, SocketAddr) {
    loop {
        match next_event(rx).await {
            TransportEvent::ClientConnected {
                connection,
                endpoint,
            } => return (connection, endpoint),
            TransportEvent::ServerStatusChanged { .. } => continue,
            other => panic!("expected ClientConnected, got {other:?}"),
        }
    }
}

async fn started_server(config: TransportConfig) -> (ChatServer, EventReceiver, SocketAddr) {
    let (tx, mut rx) = channel(16);
    let mut server = ChatServer::new(config, tx);
    let endpoint = server.bind_and_listen().await.unwrap();
    server.start().await.unwrap();
    match next_event(&mut rx).await {
        TransportEvent::ServerStatusChanged { available } => assert!(available),
        other => panic!("expected ServerStatusChanged, got {other:?}"),
    }
    (server, rx, endpoint)
}

/// Dial a server, send a Message envelope, read it back on the other side,
/// then hang up and watch the server's read loop see end-of-stream.
#[tokio::test]
async fn client_and_server_exchange_envelope() {
    init_tracing();

    let (mut server, mut server_rx, endpoint) = started_server(loopback()).await;
    assert_eq!(server.state(), ListenState::Listening);

    let (client_tx, mut client_rx) = channel(16);
    let pool = ClientPool::new(loopback(), client_tx);
    pool.acquire().await.unwrap().connect(endpoint).await.unwrap();

    let (client_conn, dialed) = expect_connected(&mut client_rx).await;
    assert_eq!(dialed, endpoint);
    let (server_conn, bound) = expect_connected(&mut server_rx).await;
    assert_eq!(bound, endpoint);
    assert_eq!(server_conn.peer(), client_conn.local());

    let mut server_reads = server_conn.start_read_loop().unwrap();

    let message = ChatMessage::new(&UserProfile::new("ana"), "hello over tcp");
    let wire = Packet::message(&message).unwrap().to_bytes().unwrap();
    client_conn.send(&wire).await.unwrap();

    let mut received = Vec::new();
    while received.len() < wire.len() {
        match next_read(&mut server_reads).await {
            ConnectionEvent::Data(chunk) => received.extend_from_slice(&chunk),
            other => panic!("expected data, got {other:?}"),
        }
    }
    assert_eq!(received, wire);
    match envelope::decode(&received).unwrap() {
        Some(PacketBody::Message(decoded)) => {
            assert_eq!(decoded, message);
            assert_eq!(decoded.sender_name(), "ana");
        }
        other => panic!("expected a message, got {other:?}"),
    }

    client_conn.close().await;
    assert_eq!(
        next_read(&mut server_reads).await,
        ConnectionEvent::Closed {
            reason: CloseReason::EndOfStream
        }
    );
    assert!(server_conn.is_disposed());
    assert!(server.connections().await.is_empty());

    server.dispose().await;
    pool.dispose().await;
}

#[tokio::test]
async fn port_search_skips_occupied_ports() {
    init_tracing();

    let base = 47_300;
    let mut occupied = Vec::new();
    for port in base..base + 4 {
        occupied.push(TcpListener::bind((LOCALHOST, port)).await.unwrap());
    }

    let (tx, _rx) = channel(16);
    let config = TransportConfig::new()
        .bind_address(LOCALHOST)
        .base_port(base)
        .max_port(base + 50);
    let mut server = ChatServer::new(config, tx);

    let endpoint = server.bind_and_listen().await.unwrap();
    assert_eq!(endpoint, SocketAddr::new(LOCALHOST, base + 4));
    assert_eq!(server.state(), ListenState::Bound);

    server.dispose().await;
    drop(occupied);
}

#[tokio::test]
async fn exhausted_port_range_fails() {
    init_tracing();

    let occupied = TcpListener::bind((LOCALHOST, 0)).await.unwrap();
    let port = occupied.local_addr().unwrap().port();

    let (tx, _rx) = channel(16);
    let config = TransportConfig::new()
        .bind_address(LOCALHOST)
        .base_port(port)
        .max_port(port);
    let mut server = ChatServer::new(config, tx);

    match server.bind_and_listen().await.unwrap_err() {
        ChatTransportError::NoPortAvailable { first, last, .. } => {
            assert_eq!((first, last), (port, port));
        }
        e => panic!("expected NoPortAvailable, got: {e}"),
    }
    assert_eq!(server.state(), ListenState::Unbound);
}

#[tokio::test]
async fn start_and_stop_require_bind() {
    let (tx, _rx) = channel(16);
    let mut server = ChatServer::new(loopback(), tx);

    assert!(matches!(
        server.start().await.unwrap_err(),
        ChatTransportError::NotInitialized
    ));
    assert!(matches!(
        server.stop().await.unwrap_err(),
        ChatTransportError::NotInitialized
    ));
}

#[tokio::test]
async fn stop_closes_listener_and_start_reopens_it() {
    init_tracing();

    let (mut server, mut server_rx, endpoint) = started_server(loopback()).await;

    server.stop().await.unwrap();
    assert!(!server.is_available());
    assert_eq!(server.state(), ListenState::Stopped);
    match next_event(&mut server_rx).await {
        TransportEvent::ServerStatusChanged { available } => assert!(!available),
        other => panic!("expected ServerStatusChanged, got {other:?}"),
    }

    let (client_tx, _client_rx) = channel(16);
    let pool = ClientPool::new(loopback(), client_tx);
    let err = pool.acquire().await.unwrap().connect(endpoint).await.unwrap_err();
    assert!(matches!(err, ChatTransportError::Connect { .. }));

    server.start().await.unwrap();
    assert_eq!(server.endpoint(), Some(endpoint));
    pool.acquire().await.unwrap().connect(endpoint).await.unwrap();
    let (_conn, bound) = expect_connected(&mut server_rx).await;
    assert_eq!(bound, endpoint);

    server.dispose().await;
    pool.dispose().await;
}

#[tokio::test]
async fn dispose_closes_tracked_connections_and_ends_subscription() {
    init_tracing();

    let (mut server, mut server_rx, endpoint) = started_server(loopback()).await;

    let (client_tx, mut client_rx) = channel(16);
    let pool = ClientPool::new(loopback(), client_tx);
    pool.acquire().await.unwrap().connect(endpoint).await.unwrap();
    let (client_conn, _) = expect_connected(&mut client_rx).await;
    let (_server_conn, _) = expect_connected(&mut server_rx).await;
    assert_eq!(server.connections().await.len(), 1);

    let mut client_reads = client_conn.start_read_loop().unwrap();

    server.dispose().await;
    server.dispose().await;
    assert_eq!(server.state(), ListenState::Disposed);
    assert!(matches!(
        server.start().await.unwrap_err(),
        ChatTransportError::Disposed
    ));

    assert_eq!(
        next_read(&mut client_reads).await,
        ConnectionEvent::Closed {
            reason: CloseReason::EndOfStream
        }
    );

    // the last notification is the availability drop, then the channel ends
    match next_event(&mut server_rx).await {
        TransportEvent::ServerStatusChanged { available } => assert!(!available),
        other => panic!("expected ServerStatusChanged, got {other:?}"),
    }
    let end = tokio::time::timeout(Duration::from_secs(10), server_rx.recv())
        .await
        .expect("subscription did not end");
    assert!(end.is_none());

    pool.dispose().await;
}

#[tokio::test]
async fn text_mode_line_exchange() {
    init_tracing();

    let config = loopback().read_mode(ReadMode::Text);
    let (mut server, mut server_rx, endpoint) = started_server(config.clone()).await;

    let (client_tx, mut client_rx) = channel(16);
    let pool = ClientPool::new(config, client_tx);
    pool.acquire().await.unwrap().connect(endpoint).await.unwrap();
    let (client_conn, _) = expect_connected(&mut client_rx).await;
    let (server_conn, _) = expect_connected(&mut server_rx).await;
    assert_eq!(server_conn.read_mode(), ReadMode::Text);

    let mut server_reads = server_conn.start_read_loop().unwrap();
    client_conn.send_line("bom dia").await.unwrap();

    let mut text = String::new();
    while !text.ends_with('\n') {
        match next_read(&mut server_reads).await {
            ConnectionEvent::Text(chunk) => text.push_str(&chunk),
            other => panic!("expected text, got {other:?}"),
        }
    }
    assert_eq!(text, "bom dia\n");

    server.dispose().await;
    pool.dispose().await;
}

#[tokio::test]
async fn node_refuses_duplicate_connection() {
    init_tracing();

    let mut listener_node = ChatNode::new(loopback());
    let endpoint = listener_node.create_server().await.unwrap();
    assert!(listener_node.server().is_available());

    let mut dialing_node = ChatNode::new(loopback());
    let connected = dialing_node.connect(endpoint).await.unwrap();
    assert_eq!(connected.peer(), endpoint);

    // the announcement is the same link, tracked once
    let announced = loop {
        match tokio::time::timeout(Duration::from_secs(10), dialing_node.recv())
            .await
            .expect("recv timed out")
            .unwrap()
        {
            TransportEvent::ClientConnected { connection, .. } => break connection,
            _ => continue,
        }
    };
    assert!(announced.same_link(&connected));
    assert_eq!(dialing_node.connections().len(), 1);

    let err = dialing_node.connect(endpoint).await.unwrap_err();
    assert!(matches!(err, ChatTransportError::AlreadyConnected(addr) if addr == endpoint));
    let err = dialing_node
        .connect_to(&endpoint.ip().to_string(), &endpoint.port().to_string())
        .await
        .unwrap_err();
    assert!(matches!(err, ChatTransportError::AlreadyConnected(_)));
    let err = dialing_node.connect_to("127.0.0.1", "0").await.unwrap_err();
    assert!(matches!(err, ChatTransportError::InvalidArgument(_)));

    // once the link is gone the endpoint may be dialed again
    connected.close().await;
    dialing_node.connect(endpoint).await.unwrap();

    dialing_node.shutdown().await.unwrap();
    listener_node.shutdown().await.unwrap();
}

#[tokio::test]
async fn node_toggles_availability() {
    init_tracing();

    let mut node = ChatNode::new(loopback());
    assert!(node.toggle_availability().await.unwrap());
    assert!(node.server().is_bound());
    assert!(!node.toggle_availability().await.unwrap());
    assert!(node.toggle_availability().await.unwrap());

    let mut statuses = Vec::new();
    while statuses.len() < 3 {
        if let TransportEvent::ServerStatusChanged { available } =
            tokio::time::timeout(Duration::from_secs(10), node.recv())
                .await
                .expect("recv timed out")
                .unwrap()
        {
            statuses.push(available);
        }
    }
    assert_eq!(statuses, vec![true, false, true]);

    node.shutdown().await.unwrap();
}

#[tokio::test]
async fn shutdown_finishes_with_undrained_events() {
    init_tracing();

    // create_server queues ServerStatusChanged(true) and fills the channel
    let mut node = ChatNode::new(loopback().event_buffer(1));
    node.create_server().await.unwrap();

    tokio::time::timeout(Duration::from_secs(5), node.shutdown())
        .await
        .expect("shutdown waited on its own event channel")
        .unwrap();
}

#[tokio::test]
async fn server_lifecycle_with_full_channel() {
    init_tracing();

    let (tx, mut rx) = channel(1);
    let mut server = ChatServer::new(loopback(), tx);
    server.bind_and_listen().await.unwrap();

    let steps = async {
        server.start().await.unwrap();
        server.stop().await.unwrap();
        assert!(server.toggle().await.unwrap());
        server.dispose().await;
        server.dispose().await;
    };
    tokio::time::timeout(Duration::from_secs(5), steps)
        .await
        .expect("server waited on a full event channel");
    assert_eq!(server.state(), ListenState::Disposed);

    // the first notification fit, the rest were dropped
    match next_event(&mut rx).await {
        TransportEvent::ServerStatusChanged { available } => assert!(available),
        other => panic!("expected ServerStatusChanged, got {other:?}"),
    }
    assert!(rx.recv().await.is_none());
}

#[tokio::test]
async fn connect_with_undrained_events_returns_link() {
    init_tracing();

    let mut listener_node = ChatNode::new(loopback());
    let endpoint = listener_node.create_server().await.unwrap();

    let mut dialing_node = ChatNode::new(loopback().event_buffer(1));
    dialing_node.create_server().await.unwrap();

    let connected = tokio::time::timeout(Duration::from_secs(5), dialing_node.connect(endpoint))
        .await
        .expect("connect waited on its own event channel")
        .unwrap();
    assert_eq!(connected.peer(), endpoint);
    assert!(!connected.is_disposed());

    // tracked even though the announcement did not fit
    assert_eq!(dialing_node.connections().len(), 1);
    assert!(matches!(
        dialing_node.connect(endpoint).await.unwrap_err(),
        ChatTransportError::AlreadyConnected(_)
    ));

    dialing_node.shutdown().await.unwrap();
    listener_node.shutdown().await.unwrap();
}
