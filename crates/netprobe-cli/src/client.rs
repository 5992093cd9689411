//! Daemon connection client.
//!
//! This module provides the `DaemonClient` which handles:
//! - Connection to the daemon via Unix socket, with exponential backoff
//! - The `Connect` handshake and protocol version check
//! - One request/response exchange per query
//!
//! **Panic-Free Policy:** This module follows the project's panic-free guidelines.
//! No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, or `todo!()`.

use std::path::PathBuf;
use std::time::{Duration, Instant};

use netprobe_core::{ClientDebugInfo, ConnectionList, TrackerStats};
use netprobe_protocol::{ClientMessage, DaemonMessage, ProtocolVersion};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UnixStream;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{ClientError, Result};

/// Socket used when neither `--socket` nor `NETPROBE_SOCKET` is given.
pub const DEFAULT_SOCKET_PATH: &str = "/tmp/netprobe.sock";

// ============================================================================
// Configuration
// ============================================================================

/// Configuration for the daemon client.
///
/// # Example
///
/// ```rust
/// use netprobe_cli::client::ClientConfig;
/// use std::time::Duration;
///
/// let config = ClientConfig {
///     socket_path: std::path::PathBuf::from("/run/netprobe.sock"),
///     client_id: Some("dashboard".to_string()),
///     connect_attempts: 5,
///     ..Default::default()
/// };
/// assert_eq!(config.request_timeout, Duration::from_secs(5));
/// ```
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Path to the Unix socket where the daemon listens.
    pub socket_path: PathBuf,

    /// Identity announced in the handshake. `None` uses the debug identity.
    pub client_id: Option<String>,

    /// Upper bound on a single request/response exchange.
    pub request_timeout: Duration,

    /// Connection attempts before giving up (at least one is made).
    pub connect_attempts: u32,

    /// Initial delay before first retry after connection failure.
    pub retry_initial_delay: Duration,

    /// Maximum delay between retry attempts.
    pub retry_max_delay: Duration,

    /// Multiplier for exponential backoff (e.g., 2.0 doubles delay each retry).
    pub retry_multiplier: f64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            socket_path: PathBuf::from(DEFAULT_SOCKET_PATH),
            client_id: None,
            request_timeout: Duration::from_secs(5),
            connect_attempts: 1,
            retry_initial_delay: Duration::from_millis(200),
            retry_max_delay: Duration::from_secs(5),
            retry_multiplier: 2.0,
        }
    }
}

impl ClientConfig {
    /// Delay to wait after a failed attempt that waited `delay`.
    fn next_delay(&self, delay: Duration) -> Duration {
        let next_ms = (delay.as_millis() as f64 * self.retry_multiplier) as u64;
        Duration::from_millis(next_ms).min(self.retry_max_delay)
    }
}

// ============================================================================
// Daemon Client
// ============================================================================

/// A handshaken connection to the netprobe daemon.
///
/// Every query sends one message and waits for one reply. Closed
/// connections returned by [`get_connections`](Self::get_connections) are
/// consumed: the daemon will not send them to this client identity again.
pub struct DaemonClient {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
    client_id: String,
    daemon_version: ProtocolVersion,
    request_timeout: Duration,
}

impl DaemonClient {
    /// Connects and performs the handshake.
    ///
    /// Retries with exponential backoff up to `config.connect_attempts`
    /// times, stopping early if `cancel_token` fires.
    pub async fn connect(config: &ClientConfig, cancel_token: &CancellationToken) -> Result<Self> {
        let stream = connect_with_retry(config, cancel_token).await?;
        let (reader, writer) = stream.into_split();

        let mut client = Self {
            reader: BufReader::new(reader),
            writer,
            client_id: String::new(),
            daemon_version: ProtocolVersion::CURRENT,
            request_timeout: config.request_timeout,
        };
        client.handshake(config.client_id.clone()).await?;
        Ok(client)
    }

    async fn handshake(&mut self, client_id: Option<String>) -> Result<()> {
        let response = self.exchange(&ClientMessage::connect(client_id)).await?;
        match response {
            DaemonMessage::Connected {
                protocol_version,
                client_id,
            } => {
                if !ProtocolVersion::CURRENT.is_compatible_with(&protocol_version) {
                    return Err(ClientError::VersionMismatch {
                        client_version: ProtocolVersion::CURRENT.to_string(),
                        daemon_version: protocol_version.to_string(),
                    });
                }
                info!(
                    client_id = %client_id,
                    protocol_version = %protocol_version,
                    "Handshake complete"
                );
                self.client_id = client_id;
                self.daemon_version = protocol_version;
                Ok(())
            }
            DaemonMessage::Rejected {
                reason,
                protocol_version,
            } => {
                if ProtocolVersion::CURRENT.is_compatible_with(&protocol_version) {
                    Err(ClientError::Rejected(reason))
                } else {
                    Err(ClientError::VersionMismatch {
                        client_version: ProtocolVersion::CURRENT.to_string(),
                        daemon_version: protocol_version.to_string(),
                    })
                }
            }
            DaemonMessage::Error { message, code } => Err(ClientError::Daemon { message, code }),
            other => Err(ClientError::ProtocolError(format!(
                "Unexpected response to connect: {other:?}"
            ))),
        }
    }

    /// Identity the daemon assigned in the handshake.
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn daemon_version(&self) -> ProtocolVersion {
        self.daemon_version
    }

    /// Active connections plus this client's undelivered closed ones.
    pub async fn get_connections(&mut self) -> Result<ConnectionList> {
        match self.request(&ClientMessage::get_connections(None)).await? {
            DaemonMessage::Connections(list) => Ok(list),
            other => Err(unexpected("connections", &other)),
        }
    }

    /// Raw dump of active connections; consumes nothing.
    pub async fn debug_net_maps(&mut self) -> Result<ConnectionList> {
        match self.request(&ClientMessage::debug_net_maps()).await? {
            DaemonMessage::NetMaps(list) => Ok(list),
            other => Err(unexpected("net_maps", &other)),
        }
    }

    /// Delivery bookkeeping for `client_id`, or for this connection's identity.
    pub async fn debug_net_state(&mut self, client_id: Option<String>) -> Result<ClientDebugInfo> {
        match self.request(&ClientMessage::debug_net_state(client_id)).await? {
            DaemonMessage::NetState(info) => Ok(info),
            other => Err(unexpected("net_state", &other)),
        }
    }

    pub async fn get_stats(&mut self) -> Result<TrackerStats> {
        match self.request(&ClientMessage::get_stats()).await? {
            DaemonMessage::Stats(stats) => Ok(stats),
            other => Err(unexpected("stats", &other)),
        }
    }

    /// Round-trips a ping and returns the latency.
    pub async fn ping(&mut self, seq: u64) -> Result<Duration> {
        let started = Instant::now();
        match self.request(&ClientMessage::ping(seq)).await? {
            DaemonMessage::Pong { seq: got } if got == seq => Ok(started.elapsed()),
            DaemonMessage::Pong { seq: got } => Err(ClientError::ProtocolError(format!(
                "Pong sequence mismatch: sent {seq}, got {got}"
            ))),
            other => Err(unexpected("pong", &other)),
        }
    }

    /// Tells the daemon we are leaving. Errors are ignored.
    pub async fn disconnect(mut self) {
        if let Err(e) = self.send(&ClientMessage::disconnect()).await {
            debug!(error = %e, "Disconnect not delivered");
        }
    }

    /// Sends a request and turns a daemon `error` reply into `ClientError::Daemon`.
    async fn request(&mut self, message: &ClientMessage) -> Result<DaemonMessage> {
        match self.exchange(message).await? {
            DaemonMessage::Error { message, code } => Err(ClientError::Daemon { message, code }),
            reply => Ok(reply),
        }
    }

    async fn exchange(&mut self, message: &ClientMessage) -> Result<DaemonMessage> {
        let limit = self.request_timeout;
        match timeout(limit, async {
            self.send(message).await?;
            self.recv().await
        })
        .await
        {
            Ok(result) => result,
            Err(_) => Err(ClientError::Timeout(limit)),
        }
    }

    async fn send(&mut self, message: &ClientMessage) -> Result<()> {
        let json = serde_json::to_string(message)?;
        self.writer.write_all(json.as_bytes()).await?;
        self.writer.write_all(b"\n").await?;
        self.writer.flush().await?;
        debug!(message_type = ?message.message, "Sent message to daemon");
        Ok(())
    }

    async fn recv(&mut self) -> Result<DaemonMessage> {
        let mut line = String::new();
        if self.reader.read_line(&mut line).await? == 0 {
            return Err(ClientError::Disconnected);
        }
        Ok(serde_json::from_str(line.trim())?)
    }
}

fn unexpected(expected: &str, got: &DaemonMessage) -> ClientError {
    ClientError::ProtocolError(format!("Expected {expected}, got {got:?}"))
}

/// Attempts to connect to the daemon with exponential backoff.
async fn connect_with_retry(
    config: &ClientConfig,
    cancel_token: &CancellationToken,
) -> Result<UnixStream> {
    let socket = config.socket_path.display().to_string();
    let attempts = config.connect_attempts.max(1);
    let mut delay = config.retry_initial_delay;

    for attempt in 1..=attempts {
        debug!(attempt, socket = %socket, "Attempting to connect to daemon");

        match UnixStream::connect(&config.socket_path).await {
            Ok(stream) => {
                debug!(attempt, "Connection successful");
                return Ok(stream);
            }
            Err(e) if attempt == attempts => {
                return Err(ClientError::DaemonConnection {
                    socket,
                    reason: e.to_string(),
                });
            }
            Err(e) => {
                if attempt == 1 {
                    warn!(socket = %socket, error = %e, "Daemon not reachable, will retry");
                }
            }
        }

        tokio::select! {
            _ = sleep(delay) => delay = config.next_delay(delay),
            _ = cancel_token.cancelled() => {
                return Err(ClientError::DaemonConnection {
                    socket,
                    reason: "cancelled".to_string(),
                });
            }
        }
    }

    Err(ClientError::DaemonConnection {
        socket,
        reason: "no connection attempts made".to_string(),
    })
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use netprobe_protocol::{ErrorCode, MessageType};
    use std::path::Path;
    use tempfile::TempDir;
    use tokio::net::UnixListener;

    /// Serves one connection, answering each request with `reply(request)`.
    fn spawn_fake_daemon<F>(path: &Path, reply: F)
    where
        F: Fn(ClientMessage) -> Option<DaemonMessage> + Send + 'static,
    {
        let listener = UnixListener::bind(path).unwrap();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (reader, mut writer) = stream.into_split();
            let mut reader = BufReader::new(reader);
            loop {
                let mut line = String::new();
                if reader.read_line(&mut line).await.unwrap() == 0 {
                    return;
                }
                let request: ClientMessage = serde_json::from_str(&line).unwrap();
                let Some(response) = reply(request) else {
                    continue;
                };
                let json = serde_json::to_string(&response).unwrap();
                writer.write_all(json.as_bytes()).await.unwrap();
                writer.write_all(b"\n").await.unwrap();
            }
        });
    }

    fn config_for(dir: &TempDir) -> ClientConfig {
        ClientConfig {
            socket_path: dir.path().join("d.sock"),
            client_id: Some("agent-1".to_string()),
            request_timeout: Duration::from_millis(500),
            ..Default::default()
        }
    }

    fn standard_reply(request: ClientMessage) -> Option<DaemonMessage> {
        Some(match request.message {
            MessageType::Connect { client_id } => {
                DaemonMessage::connected(client_id.unwrap_or_else(|| "-1".to_string()))
            }
            MessageType::GetConnections { .. } => {
                DaemonMessage::Connections(ConnectionList::default())
            }
            MessageType::DebugNetState { .. } => DaemonMessage::error_with_code(
                "Client \"agent-1\" not found",
                ErrorCode::ClientNotFound,
            ),
            MessageType::GetStats => DaemonMessage::Stats(TrackerStats::default()),
            MessageType::Ping { seq } => DaemonMessage::pong(seq),
            _ => return None,
        })
    }

    #[test]
    fn test_client_config_default() {
        let config = ClientConfig::default();
        assert_eq!(config.socket_path, PathBuf::from("/tmp/netprobe.sock"));
        assert_eq!(config.client_id, None);
        assert_eq!(config.connect_attempts, 1);
        assert!((config.retry_multiplier - 2.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_exponential_backoff_capped() {
        let config = ClientConfig {
            retry_initial_delay: Duration::from_secs(1),
            retry_max_delay: Duration::from_secs(10),
            retry_multiplier: 4.0,
            ..Default::default()
        };
        let d2 = config.next_delay(config.retry_initial_delay);
        assert_eq!(d2, Duration::from_secs(4));
        let d3 = config.next_delay(d2);
        assert_eq!(d3, Duration::from_secs(10));
        assert_eq!(config.next_delay(d3), Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_connect_and_query() {
        let dir = TempDir::new().unwrap();
        let config = config_for(&dir);
        spawn_fake_daemon(&config.socket_path, standard_reply);

        let mut client = DaemonClient::connect(&config, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(client.client_id(), "agent-1");
        assert_eq!(client.daemon_version(), ProtocolVersion::CURRENT);

        assert!(client.get_connections().await.unwrap().is_empty());
        assert_eq!(client.get_stats().await.unwrap(), TrackerStats::default());
        client.ping(9).await.unwrap();

        let err = client.debug_net_state(None).await.unwrap_err();
        assert_eq!(err.code(), Some(ErrorCode::ClientNotFound));
    }

    #[tokio::test]
    async fn test_rejected_handshake() {
        let dir = TempDir::new().unwrap();
        let config = config_for(&dir);
        spawn_fake_daemon(&config.socket_path, |_| {
            Some(DaemonMessage::rejected("Client id \"-1\" is reserved"))
        });

        let err = DaemonClient::connect(&config, &CancellationToken::new())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, ClientError::Rejected(reason) if reason.contains("reserved")));
    }

    #[tokio::test]
    async fn test_version_mismatch_detected() {
        let dir = TempDir::new().unwrap();
        let config = config_for(&dir);
        spawn_fake_daemon(&config.socket_path, |_| {
            Some(DaemonMessage::Connected {
                protocol_version: ProtocolVersion::new(9, 0),
                client_id: "agent-1".to_string(),
            })
        });

        let err = DaemonClient::connect(&config, &CancellationToken::new())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, ClientError::VersionMismatch { .. }));
    }

    #[tokio::test]
    async fn test_silent_daemon_times_out() {
        let dir = TempDir::new().unwrap();
        let config = ClientConfig {
            request_timeout: Duration::from_millis(50),
            ..config_for(&dir)
        };
        spawn_fake_daemon(&config.socket_path, |_| None);

        let err = DaemonClient::connect(&config, &CancellationToken::new())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, ClientError::Timeout(_)));
    }

    #[tokio::test]
    async fn test_missing_socket_fails_after_attempts() {
        let dir = TempDir::new().unwrap();
        let config = ClientConfig {
            connect_attempts: 3,
            retry_initial_delay: Duration::from_millis(5),
            ..config_for(&dir)
        };

        let err = DaemonClient::connect(&config, &CancellationToken::new())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, ClientError::DaemonConnection { .. }));
    }

    #[tokio::test]
    async fn test_retry_respects_cancellation() {
        let dir = TempDir::new().unwrap();
        let config = ClientConfig {
            connect_attempts: 100,
            retry_initial_delay: Duration::from_secs(10),
            ..config_for(&dir)
        };
        let cancel_token = CancellationToken::new();
        cancel_token.cancel();

        let start = std::time::Instant::now();
        let err = DaemonClient::connect(&config, &cancel_token)
            .await
            .err()
            .unwrap();
        assert!(start.elapsed() < Duration::from_millis(500));
        assert!(err.to_string().contains("cancelled"));
    }
}
