//! Read-only views returned by tracker queries.
//!
//! These are owned copies, safe to serialize and send over the wire.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{ClientId, ConnectionRecord};

/// Result of a connections query.
///
/// Active connections come first, followed by closed connections in closure
/// order. `dropped` counts closed connections this client lost to buffer
/// eviction since its previous poll.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConnectionList {
    pub connections: Vec<ConnectionRecord>,
    #[serde(default)]
    pub dropped: u64,
}

impl ConnectionList {
    /// Creates a list with no drop signal.
    pub fn new(connections: Vec<ConnectionRecord>) -> Self {
        Self {
            connections,
            dropped: 0,
        }
    }

    /// Iterates over connections that are still open.
    pub fn active(&self) -> impl Iterator<Item = &ConnectionRecord> {
        self.connections.iter().filter(|c| !c.is_closed())
    }

    /// Iterates over connections that closed since the last poll.
    pub fn closed(&self) -> impl Iterator<Item = &ConnectionRecord> {
        self.connections.iter().filter(|c| c.is_closed())
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }
}

/// Delivery bookkeeping for one client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientDebugInfo {
    pub client_id: ClientId,
    /// Sequence number of the next closed connection to deliver
    pub cursor: u64,
    /// Closed connections waiting for this client
    pub pending: usize,
    /// Closed connections lost to eviction over the client's lifetime
    pub dropped_total: u64,
    /// Lost connections not yet reported by a poll
    pub dropped_unreported: u64,
    pub polls: u64,
    pub registered_at: DateTime<Utc>,
    pub last_poll: DateTime<Utc>,
    /// Seconds since the last poll
    pub idle_secs: i64,
    /// The debug client is never expired
    pub expires: bool,
}

/// Aggregate tracker counters, independent of any client.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrackerStats {
    pub active_connections: usize,
    pub buffered_closed: usize,
    pub buffer_capacity: usize,
    pub registered_clients: usize,
    /// Sum of per-client forced drops
    pub client_drops: u64,
    /// Entries evicted from the buffer because of capacity
    pub evicted_entries: u64,
    pub events_ingested: u64,
    pub events_rejected: u64,
    /// Events discarded at the sink because the queue was full
    pub events_lost: u64,
    pub connections_opened: u64,
    pub connections_closed: u64,
    pub connections_expired: u64,
    pub clients_expired: u64,
    /// Events per second over the last maintenance window
    pub ingestion_rate: f64,
    pub uptime_secs: i64,
}
