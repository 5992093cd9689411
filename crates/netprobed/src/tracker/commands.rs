//! Tracker actor commands and errors.
//!
//! This module defines the message types for communicating with the `TrackerActor`:
//! - `TrackerCommand`: Queries and control messages sent to the actor
//! - `TrackerError`: Per-request failures returned to the caller
//! - `IngestError`: Per-event failures (logged and skipped, never surfaced)
//! - `StartError`: Fatal failures while bringing the tracker up

use netprobe_core::{ClientDebugInfo, ClientId, ConnectionKey, ConnectionList, TrackerStats};
use thiserror::Error;
use tokio::sync::oneshot;

use crate::config::ConfigError;
use crate::source::SourceError;

// ============================================================================
// Tracker Commands
// ============================================================================

/// Commands sent to the tracker actor.
///
/// Queries carry a oneshot channel for the response. If the actor has
/// stopped, the channel is dropped and the caller observes
/// `TrackerError::Stopped`.
#[derive(Debug)]
pub enum TrackerCommand {
    /// Active snapshot merged with the client's pending closed connections.
    ///
    /// Registers the client on first use.
    GetActiveConnections {
        client_id: ClientId,
        respond_to: oneshot::Sender<Result<ConnectionList, TrackerError>>,
    },

    /// Raw dump of active connections; no cursor is touched.
    DebugNetworkMaps {
        respond_to: oneshot::Sender<ConnectionList>,
    },

    /// Delivery bookkeeping for one client.
    DebugNetworkState {
        client_id: ClientId,
        respond_to: oneshot::Sender<Result<ClientDebugInfo, TrackerError>>,
    },

    /// Aggregate counters.
    GetStats {
        respond_to: oneshot::Sender<TrackerStats>,
    },

    /// Periodic expiry of inactive clients and idle connections.
    ///
    /// Fire-and-forget, sent by the maintenance task.
    Maintain,

    /// Release all state and exit the actor loop.
    Stop { respond_to: oneshot::Sender<()> },
}

// ============================================================================
// Errors
// ============================================================================

/// Errors returned to the caller of a tracker query.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TrackerError {
    /// The tracker has been stopped (or is stopping).
    #[error("tracker is stopped")]
    Stopped,

    /// No bookkeeping exists for this client.
    #[error("client not found: {0}")]
    ClientNotFound(ClientId),

    /// Registering another client would exceed the limit.
    #[error("too many clients (max: {max})")]
    TooManyClients { max: usize },
}

/// Reasons an individual event is skipped.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IngestError {
    /// Tracking a new connection would exceed the table limit.
    #[error("connection table is full (max: {max}), dropping {key}")]
    TableFull { max: usize, key: ConnectionKey },
}

/// Fatal errors while starting the tracker.
#[derive(Debug, Error)]
pub enum StartError {
    /// The compatibility gate refused this host.
    #[error("environment unsupported: {reason}")]
    Unsupported { reason: String },

    /// The tracker limits are unusable.
    #[error("invalid tracker configuration: {0}")]
    Config(#[from] ConfigError),

    /// The event source could not be attached.
    #[error("resource initialization failed: {0}")]
    Initialization(#[from] SourceError),
}

impl StartError {
    /// Returns true if the host cannot run the tracker at all.
    ///
    /// Callers use this to disable the feature instead of failing hard.
    #[must_use]
    pub fn is_unsupported(&self) -> bool {
        matches!(self, Self::Unsupported { .. })
    }
}
