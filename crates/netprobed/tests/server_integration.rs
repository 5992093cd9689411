//! Integration tests for the daemon's Unix socket server.
//!
//! These tests verify the complete flow from client connection through the
//! tracker and back.
//!
//! Per CONTRIBUTING.md: Tests CAN use `.unwrap()` and `.expect()` - this is allowed.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use netprobe_core::{ConnectionEvent, ConnectionKey, Direction, Protocol};
use netprobe_protocol::{ClientMessage, DaemonMessage, ErrorCode, ProtocolVersion};
use netprobed::config::TrackerConfig;
use netprobed::gate::{KernelVersion, Supported};
use netprobed::server::DaemonServer;
use netprobed::source::{EventSink, EventSource, SourceError};
use netprobed::tracker::Tracker;
use tempfile::TempDir;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UnixStream;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;

// ============================================================================
// Test Constants
// ============================================================================

/// Maximum time to wait for socket to appear after server spawn.
const SOCKET_WAIT_TIMEOUT: Duration = Duration::from_millis(500);

/// Polling interval when waiting for socket.
const SOCKET_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Upper bound for any single response.
const RESPONSE_TIMEOUT: Duration = Duration::from_secs(2);

// ============================================================================
// Test Helpers
// ============================================================================

struct NullSource;

#[async_trait]
impl EventSource for NullSource {
    fn name(&self) -> &'static str {
        "null"
    }

    async fn attach(&mut self, _sink: EventSink) -> Result<(), SourceError> {
        Ok(())
    }

    async fn detach(&mut self) {}
}

/// Test server wrapper that handles setup and teardown.
struct TestServer {
    socket_path: PathBuf,
    tracker: Arc<Tracker>,
    cancel_token: CancellationToken,
    _temp_dir: TempDir,
}

impl TestServer {
    async fn spawn() -> Self {
        Self::spawn_with(TrackerConfig::default()).await
    }

    async fn spawn_with(config: TrackerConfig) -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let socket_path = temp_dir.path().join("test.sock");

        let tracker = Tracker::start(
            Supported::assume(KernelVersion::new(5, 15, 0)),
            config,
            Box::new(NullSource),
        )
        .await
        .expect("Failed to start tracker");
        let tracker = Arc::new(tracker);

        let cancel_token = CancellationToken::new();
        let server = DaemonServer::new(&socket_path, tracker.handle(), cancel_token.clone());
        tokio::spawn(async move {
            let _ = server.run().await;
        });

        let start = std::time::Instant::now();
        while !socket_path.exists() && start.elapsed() < SOCKET_WAIT_TIMEOUT {
            sleep(SOCKET_POLL_INTERVAL).await;
        }
        assert!(
            socket_path.exists(),
            "Socket file was not created within {SOCKET_WAIT_TIMEOUT:?}"
        );

        Self {
            socket_path,
            tracker,
            cancel_token,
            _temp_dir: temp_dir,
        }
    }

    async fn connect(&self) -> TestClient {
        TestClient::connect(&self.socket_path).await
    }

    /// Feeds events and waits until the tracker has applied them.
    async fn feed(&self, events: Vec<ConnectionEvent>) {
        let target = self.tracker.get_stats().await.unwrap().events_ingested + events.len() as u64;
        let sink = self.tracker.sink();
        for event in events {
            assert!(sink.ingest(event));
        }
        for _ in 0..200 {
            if self.tracker.get_stats().await.unwrap().events_ingested >= target {
                return;
            }
            sleep(Duration::from_millis(5)).await;
        }
        panic!("tracker did not apply events in time");
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.cancel_token.cancel();
    }
}

/// Test client that speaks the daemon protocol.
struct TestClient {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl TestClient {
    async fn connect(socket_path: &PathBuf) -> Self {
        let stream = UnixStream::connect(socket_path)
            .await
            .expect("Failed to connect");
        let (reader, writer) = stream.into_split();
        Self {
            reader: BufReader::new(reader),
            writer,
        }
    }

    async fn send(&mut self, msg: &ClientMessage) {
        let json = serde_json::to_string(msg).expect("Failed to serialize");
        self.send_raw(&json).await;
    }

    async fn send_raw(&mut self, line: &str) {
        self.writer.write_all(line.as_bytes()).await.unwrap();
        self.writer.write_all(b"\n").await.unwrap();
        self.writer.flush().await.unwrap();
    }

    async fn recv(&mut self) -> DaemonMessage {
        let mut line = String::new();
        timeout(RESPONSE_TIMEOUT, self.reader.read_line(&mut line))
            .await
            .expect("Timed out waiting for response")
            .expect("Failed to read");
        serde_json::from_str(&line).expect("Failed to parse response")
    }

    async fn handshake(&mut self, client_id: Option<&str>) -> String {
        self.send(&ClientMessage::connect(client_id.map(str::to_string)))
            .await;
        match self.recv().await {
            DaemonMessage::Connected { client_id, .. } => client_id,
            other => panic!("Expected Connected, got {other:?}"),
        }
    }

    async fn request(&mut self, msg: ClientMessage) -> DaemonMessage {
        self.send(&msg).await;
        self.recv().await
    }
}

fn key(port: u16) -> ConnectionKey {
    ConnectionKey::new(
        format!("192.168.1.10:{port}").parse().unwrap(),
        "93.184.216.34:443".parse().unwrap(),
        Protocol::Tcp,
        0,
    )
}

fn expect_error_code(msg: DaemonMessage, expected: ErrorCode) {
    match msg {
        DaemonMessage::Error { code, .. } => assert_eq!(code, Some(expected)),
        other => panic!("Expected Error({expected}), got {other:?}"),
    }
}

// ============================================================================
// Handshake
// ============================================================================

#[tokio::test]
async fn test_handshake_with_client_id() {
    let server = TestServer::spawn().await;
    let mut client = server.connect().await;
    assert_eq!(client.handshake(Some("agent-1")).await, "agent-1");
}

#[tokio::test]
async fn test_handshake_without_client_id_uses_debug_identity() {
    let server = TestServer::spawn().await;
    let mut client = server.connect().await;
    assert_eq!(client.handshake(None).await, "-1");
}

#[tokio::test]
async fn test_handshake_with_empty_client_id_uses_debug_identity() {
    let server = TestServer::spawn().await;
    let mut client = server.connect().await;
    assert_eq!(client.handshake(Some("")).await, "-1");

    let mut client = server.connect().await;
    assert_eq!(client.handshake(Some("   ")).await, "-1");
}

#[tokio::test]
async fn test_handshake_version_mismatch_rejected() {
    let server = TestServer::spawn().await;
    let mut client = server.connect().await;

    let mut msg = ClientMessage::connect(Some("agent-1".to_string()));
    msg.protocol_version = ProtocolVersion::new(2, 0);
    match client.request(msg).await {
        DaemonMessage::Rejected {
            reason,
            protocol_version,
        } => {
            assert!(reason.contains("2.0"));
            assert_eq!(protocol_version, ProtocolVersion::CURRENT);
        }
        other => panic!("Expected Rejected, got {other:?}"),
    }
}

#[tokio::test]
async fn test_handshake_reserved_client_id_rejected() {
    let server = TestServer::spawn().await;
    let mut client = server.connect().await;

    match client.request(ClientMessage::connect(Some("-1".to_string()))).await {
        DaemonMessage::Rejected { reason, .. } => assert!(reason.contains("-1")),
        other => panic!("Expected Rejected, got {other:?}"),
    }
}

#[tokio::test]
async fn test_first_message_must_be_connect() {
    let server = TestServer::spawn().await;
    let mut client = server.connect().await;
    expect_error_code(
        client.request(ClientMessage::get_stats()).await,
        ErrorCode::BadRequest,
    );
}

// ============================================================================
// Queries
// ============================================================================

#[tokio::test]
async fn test_get_connections_delivers_closed_once() {
    let server = TestServer::spawn().await;
    let mut client = server.connect().await;
    client.handshake(Some("agent-1")).await;

    server
        .feed(vec![
            ConnectionEvent::open(key(40000), Direction::Outgoing, Utc::now()),
            ConnectionEvent::open(key(40001), Direction::Outgoing, Utc::now()),
        ])
        .await;
    // Registers the client before anything closes.
    client.request(ClientMessage::get_connections(None)).await;
    server
        .feed(vec![ConnectionEvent::close(key(40000), Utc::now())])
        .await;

    match client.request(ClientMessage::get_connections(None)).await {
        DaemonMessage::Connections(list) => {
            assert_eq!(list.active().count(), 1);
            let closed: Vec<_> = list.closed().map(|r| r.key).collect();
            assert_eq!(closed, vec![key(40000)]);
            assert_eq!(list.dropped, 0);
        }
        other => panic!("Expected Connections, got {other:?}"),
    }

    match client.request(ClientMessage::get_connections(None)).await {
        DaemonMessage::Connections(list) => assert_eq!(list.closed().count(), 0),
        other => panic!("Expected Connections, got {other:?}"),
    }
}

#[tokio::test]
async fn test_clients_on_separate_connections_have_separate_cursors() {
    let server = TestServer::spawn().await;
    let mut a = server.connect().await;
    let mut b = server.connect().await;
    a.handshake(Some("A")).await;
    b.handshake(Some("B")).await;

    a.request(ClientMessage::get_connections(None)).await;
    server
        .feed(vec![ConnectionEvent::close(key(41000), Utc::now())])
        .await;

    for client in [&mut a, &mut b] {
        match client.request(ClientMessage::get_connections(None)).await {
            DaemonMessage::Connections(list) => assert_eq!(list.closed().count(), 1),
            other => panic!("Expected Connections, got {other:?}"),
        }
    }
}

#[tokio::test]
async fn test_request_client_id_overrides_handshake_identity() {
    let server = TestServer::spawn().await;
    let mut client = server.connect().await;
    client.handshake(Some("agent-1")).await;

    client
        .request(ClientMessage::get_connections(Some("agent-2".to_string())))
        .await;

    match client
        .request(ClientMessage::debug_net_state(Some("agent-2".to_string())))
        .await
    {
        DaemonMessage::NetState(info) => assert_eq!(info.client_id.as_str(), "agent-2"),
        other => panic!("Expected NetState, got {other:?}"),
    }
    expect_error_code(
        client.request(ClientMessage::debug_net_state(None)).await,
        ErrorCode::ClientNotFound,
    );
}

#[tokio::test]
async fn test_empty_request_client_id_uses_handshake_identity() {
    let server = TestServer::spawn().await;
    let mut client = server.connect().await;
    client.handshake(Some("agent-1")).await;

    assert!(matches!(
        client
            .request(ClientMessage::get_connections(Some(String::new())))
            .await,
        DaemonMessage::Connections(_)
    ));

    match client
        .request(ClientMessage::debug_net_state(Some(String::new())))
        .await
    {
        DaemonMessage::NetState(info) => assert_eq!(info.client_id.as_str(), "agent-1"),
        other => panic!("Expected NetState, got {other:?}"),
    }
}

#[tokio::test]
async fn test_invalid_client_id_in_request() {
    let server = TestServer::spawn().await;
    let mut client = server.connect().await;
    client.handshake(Some("agent-1")).await;

    expect_error_code(
        client
            .request(ClientMessage::get_connections(Some("no spaces".to_string())))
            .await,
        ErrorCode::InvalidClientId,
    );

    // Connection remains usable.
    assert!(matches!(
        client.request(ClientMessage::ping(7)).await,
        DaemonMessage::Pong { seq: 7 }
    ));
}

#[tokio::test]
async fn test_too_many_clients() {
    let config = TrackerConfig {
        max_clients: 1,
        ..Default::default()
    };
    let server = TestServer::spawn_with(config).await;
    let mut client = server.connect().await;
    client.handshake(Some("first")).await;

    assert!(matches!(
        client.request(ClientMessage::get_connections(None)).await,
        DaemonMessage::Connections(_)
    ));
    expect_error_code(
        client
            .request(ClientMessage::get_connections(Some("second".to_string())))
            .await,
        ErrorCode::TooManyClients,
    );
}

#[tokio::test]
async fn test_debug_net_maps_and_stats() {
    let server = TestServer::spawn().await;
    let mut client = server.connect().await;
    client.handshake(None).await;

    server
        .feed(vec![ConnectionEvent::open(
            key(42000),
            Direction::Outgoing,
            Utc::now(),
        )])
        .await;

    match client.request(ClientMessage::debug_net_maps()).await {
        DaemonMessage::NetMaps(list) => {
            assert_eq!(list.len(), 1);
            assert_eq!(list.connections[0].key, key(42000));
        }
        other => panic!("Expected NetMaps, got {other:?}"),
    }

    match client.request(ClientMessage::get_stats()).await {
        DaemonMessage::Stats(stats) => {
            assert_eq!(stats.active_connections, 1);
            assert_eq!(stats.registered_clients, 0);
        }
        other => panic!("Expected Stats, got {other:?}"),
    }
}

#[tokio::test]
async fn test_ping_pong() {
    let server = TestServer::spawn().await;
    let mut client = server.connect().await;
    client.handshake(None).await;

    for seq in [1, 2, 42] {
        match client.request(ClientMessage::ping(seq)).await {
            DaemonMessage::Pong { seq: got } => assert_eq!(got, seq),
            other => panic!("Expected Pong, got {other:?}"),
        }
    }
}

#[tokio::test]
async fn test_queries_after_tracker_stop_are_unavailable() {
    let server = TestServer::spawn().await;
    let mut client = server.connect().await;
    client.handshake(Some("agent-1")).await;

    server.tracker.stop().await;

    expect_error_code(
        client.request(ClientMessage::get_connections(None)).await,
        ErrorCode::Unavailable,
    );
    expect_error_code(
        client.request(ClientMessage::get_stats()).await,
        ErrorCode::Unavailable,
    );
}

#[tokio::test]
async fn test_disconnect_closes_connection() {
    let server = TestServer::spawn().await;
    let mut client = server.connect().await;
    client.handshake(None).await;

    client.send(&ClientMessage::disconnect()).await;

    let mut line = String::new();
    let n = timeout(RESPONSE_TIMEOUT, client.reader.read_line(&mut line))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(n, 0, "server should close after disconnect");
}
