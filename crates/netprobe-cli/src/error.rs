//! Error types for the netprobe client.
//!
//! **Panic-Free Policy:** This module follows the project's panic-free guidelines.
//! No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, or `todo!()`.

use std::io;

use netprobe_protocol::ErrorCode;
use thiserror::Error;

// ============================================================================
// Client Error Type
// ============================================================================

/// Errors raised while talking to the daemon.
///
/// Connection errors suggest checking that `netprobed` is running; version
/// errors mean the client and daemon were built from different releases.
#[derive(Error, Debug)]
pub enum ClientError {
    /// Could not reach the daemon socket.
    #[error("Failed to connect to daemon at {socket}: {reason}")]
    DaemonConnection { socket: String, reason: String },

    /// Protocol version mismatch with daemon
    #[error("Protocol version mismatch (client: {client_version}, daemon: {daemon_version})")]
    VersionMismatch {
        client_version: String,
        daemon_version: String,
    },

    /// The daemon refused the handshake for a reason other than version.
    #[error("Daemon rejected connection: {0}")]
    Rejected(String),

    /// The daemon answered a request with an error.
    #[error("Daemon error{}: {message}", .code.map(|c| format!(" ({c})")).unwrap_or_default())]
    Daemon {
        message: String,
        code: Option<ErrorCode>,
    },

    /// The daemon sent something other than the expected reply.
    #[error("Protocol error: {0}")]
    ProtocolError(String),

    /// No reply within the request timeout.
    #[error("Timed out waiting for daemon after {0:?}")]
    Timeout(std::time::Duration),

    /// The daemon closed the connection.
    #[error("Daemon closed the connection")]
    Disconnected,

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Failed to parse message: {0}")]
    ParseError(#[from] serde_json::Error),
}

impl ClientError {
    /// Error code reported by the daemon, if this is a daemon-side error.
    pub fn code(&self) -> Option<ErrorCode> {
        match self {
            Self::Daemon { code, .. } => *code,
            _ => None,
        }
    }
}

/// Convenience Result type alias for client operations.
pub type Result<T> = std::result::Result<T, ClientError>;

// ============================================================================
// Tests
// ============================================================================
