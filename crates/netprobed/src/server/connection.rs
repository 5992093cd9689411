//! Connection handler for individual client connections.
//!
//! Each client connection gets its own `ConnectionHandler` that:
//! - Performs protocol version negotiation
//! - Resolves the client identity used for delivery cursors
//! - Routes queries to the tracker
//! - Sends responses (query failures are answered, not fatal)
//!
//! # Panic-Free Guarantees
//!
//! This module follows CONTRIBUTING.md panic-free policy:
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - All fallible operations use `?`, pattern matching, or `unwrap_or`
//! - Connection errors are logged and result in graceful disconnect

use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader, BufWriter};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use netprobe_core::{ClientId, DomainError};
use netprobe_protocol::{ClientMessage, DaemonMessage, ErrorCode, MessageType, ProtocolVersion};

use crate::tracker::{TrackerError, TrackerHandle};

/// Maximum message size (1 MB)
pub const MAX_MESSAGE_SIZE: usize = 1_048_576;

/// Read timeout for idle connections (5 minutes)
const READ_TIMEOUT: Duration = Duration::from_secs(300);

/// Write timeout (10 seconds)
const WRITE_TIMEOUT: Duration = Duration::from_secs(10);

/// Connection handler for a single client.
pub struct ConnectionHandler {
    reader: BufReader<OwnedReadHalf>,
    writer: BufWriter<OwnedWriteHalf>,
    tracker: TrackerHandle,

    /// Identity from the handshake; the debug client when none was given
    client_id: ClientId,

    connection_number: u64,
}

impl ConnectionHandler {
    pub fn new(
        reader: OwnedReadHalf,
        writer: OwnedWriteHalf,
        tracker: TrackerHandle,
        connection_number: u64,
    ) -> Self {
        Self {
            reader: BufReader::new(reader),
            writer: BufWriter::new(writer),
            tracker,
            client_id: ClientId::debug(),
            connection_number,
        }
    }

    /// Runs the connection handler until the client goes away.
    pub async fn run(mut self) {
        debug!(connection = self.connection_number, "New client connected");

        if let Err(e) = self.handle_handshake().await {
            warn!(
                connection = self.connection_number,
                error = %e,
                "Handshake failed"
            );
            return;
        }
        info!(
            connection = self.connection_number,
            client_id = %self.client_id,
            "Client handshake completed"
        );

        if let Err(e) = self.process_messages().await {
            debug!(client_id = %self.client_id, error = %e, "Connection closed");
        }

        info!(client_id = %self.client_id, "Client disconnected");
    }

    /// Expects a `Connect` message, checks the protocol version and fixes
    /// the connection's default identity.
    async fn handle_handshake(&mut self) -> Result<(), ConnectionError> {
        let msg = match timeout(READ_TIMEOUT, self.read_message()).await {
            Ok(result) => result?,
            Err(_) => return Err(ConnectionError::Timeout),
        };

        let client_version = msg.protocol_version;
        if !client_version.is_compatible_with(&ProtocolVersion::CURRENT) {
            warn!(
                client_version = %client_version,
                server_version = %ProtocolVersion::CURRENT,
                "Protocol version mismatch"
            );

            self.send_message(DaemonMessage::rejected(&format!(
                "Protocol version {} not compatible with server version {}",
                client_version,
                ProtocolVersion::CURRENT
            )))
            .await?;

            return Err(ConnectionError::VersionMismatch {
                client: client_version,
                server: ProtocolVersion::CURRENT,
            });
        }

        match msg.message {
            MessageType::Connect { client_id } => {
                match ClientId::parse_or_debug(client_id.as_deref()) {
                    Ok(id) => {
                        self.client_id = id;
                        self.send_message(DaemonMessage::connected(self.client_id.to_string()))
                            .await
                    }
                    Err(e) => {
                        self.send_message(DaemonMessage::rejected(&e.to_string()))
                            .await?;
                        Err(ConnectionError::InvalidClientId(e))
                    }
                }
            }
            other => {
                self.send_message(DaemonMessage::error_with_code(
                    "Expected Connect message for handshake",
                    ErrorCode::BadRequest,
                ))
                .await?;

                Err(ConnectionError::UnexpectedMessage(format!("{other:?}")))
            }
        }
    }

    /// Reads and answers messages until EOF, disconnect or an I/O failure.
    async fn process_messages(&mut self) -> Result<(), ConnectionError> {
        loop {
            let msg = match timeout(READ_TIMEOUT, self.read_message()).await {
                Ok(Ok(msg)) => msg,
                Ok(Err(ConnectionError::Eof)) => {
                    debug!(client_id = %self.client_id, "Client sent EOF");
                    return Ok(());
                }
                Ok(Err(ConnectionError::ParseError(e))) => {
                    // A bad line is the client's problem, not the connection's.
                    debug!(client_id = %self.client_id, error = %e, "Unparseable message");
                    self.send_message(DaemonMessage::error_with_code(
                        &format!("Parse error: {e}"),
                        ErrorCode::BadRequest,
                    ))
                    .await?;
                    continue;
                }
                Ok(Err(e)) => return Err(e),
                Err(_) => {
                    debug!(client_id = %self.client_id, "Connection timed out");
                    return Err(ConnectionError::Timeout);
                }
            };

            if !self.handle_message(msg).await? {
                return Ok(());
            }
        }
    }

    /// Answers one message. Returns `false` when the client disconnects.
    async fn handle_message(&mut self, msg: ClientMessage) -> Result<bool, ConnectionError> {
        let response = match msg.message {
            MessageType::Connect { .. } => {
                DaemonMessage::error_with_code("Already connected", ErrorCode::BadRequest)
            }

            MessageType::GetConnections { client_id } => match self.resolve(client_id) {
                Ok(id) => match self.tracker.get_active_connections(id).await {
                    Ok(list) => DaemonMessage::Connections(list),
                    Err(e) => tracker_error(&e),
                },
                Err(e) => invalid_client_id(&e),
            },

            MessageType::DebugNetMaps => match self.tracker.debug_network_maps().await {
                Ok(list) => DaemonMessage::NetMaps(list),
                Err(e) => tracker_error(&e),
            },

            MessageType::DebugNetState { client_id } => match self.resolve(client_id) {
                Ok(id) => match self.tracker.debug_network_state(id).await {
                    Ok(info) => DaemonMessage::NetState(info),
                    Err(e) => tracker_error(&e),
                },
                Err(e) => invalid_client_id(&e),
            },

            MessageType::GetStats => match self.tracker.get_stats().await {
                Ok(stats) => DaemonMessage::Stats(stats),
                Err(e) => tracker_error(&e),
            },

            MessageType::Ping { seq } => DaemonMessage::pong(seq),

            MessageType::Disconnect => {
                debug!(client_id = %self.client_id, "Client requested disconnect");
                return Ok(false);
            }
        };

        self.send_message(response).await?;
        Ok(true)
    }

    /// Identity for a request: the request's own id, else the handshake id.
    fn resolve(&self, requested: Option<String>) -> Result<ClientId, DomainError> {
        match ClientId::given(requested.as_deref()) {
            Some(raw) => ClientId::parse(raw),
            None => Ok(self.client_id.clone()),
        }
    }

    /// Reads a single message from the client.
    async fn read_message(&mut self) -> Result<ClientMessage, ConnectionError> {
        let mut line = String::new();

        // Never buffer more than one byte past the limit.
        let bytes_read = (&mut self.reader)
            .take(MAX_MESSAGE_SIZE as u64 + 1)
            .read_line(&mut line)
            .await
            .map_err(|e| ConnectionError::Io(e.to_string()))?;

        if bytes_read == 0 {
            return Err(ConnectionError::Eof);
        }

        if line.len() > MAX_MESSAGE_SIZE {
            return Err(ConnectionError::MessageTooLarge {
                size: line.len(),
                max: MAX_MESSAGE_SIZE,
            });
        }

        let msg: ClientMessage = serde_json::from_str(&line)
            .map_err(|e| ConnectionError::ParseError(e.to_string()))?;

        debug!(
            client_id = %self.client_id,
            message_type = ?std::mem::discriminant(&msg.message),
            "Received message"
        );

        Ok(msg)
    }

    /// Sends a message to the client.
    async fn send_message(&mut self, msg: DaemonMessage) -> Result<(), ConnectionError> {
        let json =
            serde_json::to_string(&msg).map_err(|e| ConnectionError::ParseError(e.to_string()))?;

        let writer = &mut self.writer;
        match timeout(WRITE_TIMEOUT, async {
            writer.write_all(json.as_bytes()).await?;
            writer.write_all(b"\n").await?;
            writer.flush().await?;
            Ok::<(), std::io::Error>(())
        })
        .await
        {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(ConnectionError::Io(e.to_string())),
            Err(_) => Err(ConnectionError::WriteTimeout),
        }
    }

    pub fn client_id(&self) -> &ClientId {
        &self.client_id
    }
}

fn invalid_client_id(e: &DomainError) -> DaemonMessage {
    DaemonMessage::error_with_code(&e.to_string(), ErrorCode::InvalidClientId)
}

/// Maps a tracker failure onto a wire error.
pub(crate) fn tracker_error(e: &TrackerError) -> DaemonMessage {
    let code = match e {
        TrackerError::Stopped => ErrorCode::Unavailable,
        TrackerError::ClientNotFound(_) => ErrorCode::ClientNotFound,
        TrackerError::TooManyClients { .. } => ErrorCode::TooManyClients,
    };
    DaemonMessage::error_with_code(&e.to_string(), code)
}

/// Errors that can occur during connection handling.
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("Protocol version mismatch: client {client}, server {server}")]
    VersionMismatch {
        client: ProtocolVersion,
        server: ProtocolVersion,
    },

    #[error("Unexpected message: {0}")]
    UnexpectedMessage(String),

    #[error("Invalid client id: {0}")]
    InvalidClientId(DomainError),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("I/O error: {0}")]
    Io(String),

    #[error("Connection closed")]
    Eof,

    #[error("Read timeout")]
    Timeout,

    #[error("Write timeout")]
    WriteTimeout,

    #[error("Message too large: {size} bytes (max: {max})")]
    MessageTooLarge { size: usize, max: usize },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_error_display() {
        let err = ConnectionError::VersionMismatch {
            client: ProtocolVersion::new(2, 0),
            server: ProtocolVersion::new(1, 0),
        };
        assert!(err.to_string().contains("2.0"));
        assert!(err.to_string().contains("1.0"));
    }

    #[test]
    fn test_message_size_error() {
        let err = ConnectionError::MessageTooLarge {
            size: 2_000_000,
            max: MAX_MESSAGE_SIZE,
        };
        assert!(err.to_string().contains("2000000"));
    }

    #[test]
    fn test_tracker_error_codes() {
        let cases = [
            (TrackerError::Stopped, ErrorCode::Unavailable),
            (
                TrackerError::ClientNotFound(ClientId::parse("x").unwrap()),
                ErrorCode::ClientNotFound,
            ),
            (
                TrackerError::TooManyClients { max: 2 },
                ErrorCode::TooManyClients,
            ),
        ];

        for (err, expected) in cases {
            match tracker_error(&err) {
                DaemonMessage::Error { code, message } => {
                    assert_eq!(code, Some(expected));
                    assert_eq!(message, err.to_string());
                }
                other => panic!("Expected Error, got {other:?}"),
            }
        }
    }
}
