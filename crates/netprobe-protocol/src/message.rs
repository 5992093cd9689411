//! Protocol message types for daemon communication.
//!
//! Messages are newline-delimited JSON objects tagged by `type`.

use crate::version::ProtocolVersion;
use netprobe_core::{ClientDebugInfo, ConnectionList, TrackerStats};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Message types that can be sent by clients to the daemon.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MessageType {
    /// Client handshake/connection request
    Connect {
        /// Identity used for later queries that do not name a client
        #[serde(default, skip_serializing_if = "Option::is_none")]
        client_id: Option<String>,
    },

    /// Active connections plus this client's pending closed connections
    GetConnections {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        client_id: Option<String>,
    },

    /// Raw dump of active connections, no cursor bookkeeping
    DebugNetMaps,

    /// Delivery bookkeeping for one client
    DebugNetState {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        client_id: Option<String>,
    },

    /// Aggregate tracker counters
    GetStats,

    /// Ping to check connection
    Ping {
        /// Sequence number for matching pong response
        seq: u64,
    },

    /// Client disconnecting gracefully
    Disconnect,
}

/// Messages sent from client to daemon.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientMessage {
    /// Protocol version
    pub protocol_version: ProtocolVersion,

    /// Message payload
    #[serde(flatten)]
    pub message: MessageType,
}

impl ClientMessage {
    /// Creates a new client message with current protocol version.
    pub fn new(message: MessageType) -> Self {
        Self {
            protocol_version: ProtocolVersion::CURRENT,
            message,
        }
    }

    pub fn connect(client_id: Option<String>) -> Self {
        Self::new(MessageType::Connect { client_id })
    }

    pub fn get_connections(client_id: Option<String>) -> Self {
        Self::new(MessageType::GetConnections { client_id })
    }

    pub fn debug_net_maps() -> Self {
        Self::new(MessageType::DebugNetMaps)
    }

    pub fn debug_net_state(client_id: Option<String>) -> Self {
        Self::new(MessageType::DebugNetState { client_id })
    }

    pub fn get_stats() -> Self {
        Self::new(MessageType::GetStats)
    }

    pub fn ping(seq: u64) -> Self {
        Self::new(MessageType::Ping { seq })
    }

    pub fn disconnect() -> Self {
        Self::new(MessageType::Disconnect)
    }
}

/// Machine-readable error categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// Request could not be parsed or was out of sequence
    BadRequest,
    InvalidClientId,
    ClientNotFound,
    TooManyClients,
    /// Tracker is stopped or shutting down
    Unavailable,
    Internal,
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::BadRequest => "bad_request",
            Self::InvalidClientId => "invalid_client_id",
            Self::ClientNotFound => "client_not_found",
            Self::TooManyClients => "too_many_clients",
            Self::Unavailable => "unavailable",
            Self::Internal => "internal",
        };
        write!(f, "{s}")
    }
}

/// Messages sent from daemon to clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DaemonMessage {
    /// Connection accepted
    Connected {
        /// Daemon's protocol version
        protocol_version: ProtocolVersion,
        /// Identity the daemon will use for this connection
        client_id: String,
    },

    /// Connection rejected (version mismatch, etc.)
    Rejected {
        /// Reason for rejection
        reason: String,
        /// Daemon's protocol version (for client to upgrade)
        protocol_version: ProtocolVersion,
    },

    /// Response to `get_connections`
    Connections(ConnectionList),

    /// Response to `debug_net_maps`
    NetMaps(ConnectionList),

    /// Response to `debug_net_state`
    NetState(ClientDebugInfo),

    /// Response to `get_stats`
    Stats(TrackerStats),

    /// Pong response to ping
    Pong {
        /// Sequence number from ping
        seq: u64,
    },

    /// Error response
    Error {
        /// Error message
        message: String,
        /// Error code (optional)
        #[serde(default, skip_serializing_if = "Option::is_none")]
        code: Option<ErrorCode>,
    },
}

impl DaemonMessage {
    pub fn connected(client_id: String) -> Self {
        Self::Connected {
            protocol_version: ProtocolVersion::CURRENT,
            client_id,
        }
    }

    pub fn rejected(reason: &str) -> Self {
        Self::Rejected {
            reason: reason.to_string(),
            protocol_version: ProtocolVersion::CURRENT,
        }
    }

    pub fn pong(seq: u64) -> Self {
        Self::Pong { seq }
    }

    pub fn error(message: &str) -> Self {
        Self::Error {
            message: message.to_string(),
            code: None,
        }
    }

    pub fn error_with_code(message: &str, code: ErrorCode) -> Self {
        Self::Error {
            message: message.to_string(),
            code: Some(code),
        }
    }
}
