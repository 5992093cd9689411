//! Connection domain entities and value objects.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{IpAddr, SocketAddr};

// ============================================================================
// Connection Key
// ============================================================================

/// Transport protocol of a tracked connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Tcp,
    Udp,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp => write!(f, "tcp"),
            Self::Udp => write!(f, "udp"),
        }
    }
}

/// Unique identity of a connection on this host.
///
/// Two sockets with the same 5-tuple in different network namespaces are
/// different connections, so the namespace inode is part of the key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConnectionKey {
    pub laddr: IpAddr,
    pub lport: u16,
    pub raddr: IpAddr,
    pub rport: u16,
    pub protocol: Protocol,
    /// Network namespace inode (0 when unknown)
    #[serde(default)]
    pub netns: u32,
}

impl ConnectionKey {
    /// Builds a key from local and remote socket addresses.
    pub fn new(local: SocketAddr, remote: SocketAddr, protocol: Protocol, netns: u32) -> Self {
        Self {
            laddr: local.ip(),
            lport: local.port(),
            raddr: remote.ip(),
            rport: remote.port(),
            protocol,
            netns,
        }
    }

    /// Local endpoint of the connection.
    pub fn local(&self) -> SocketAddr {
        SocketAddr::new(self.laddr, self.lport)
    }

    /// Remote endpoint of the connection.
    pub fn remote(&self) -> SocketAddr {
        SocketAddr::new(self.raddr, self.rport)
    }

    /// Returns true if both endpoints are loopback addresses.
    #[must_use]
    pub fn is_loopback(&self) -> bool {
        self.laddr.is_loopback() && self.raddr.is_loopback()
    }
}

impl fmt::Display for ConnectionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} -> {} [ns {}]",
            self.protocol,
            self.local(),
            self.remote(),
            self.netns
        )
    }
}

// ============================================================================
// Connection Metadata
// ============================================================================

/// Which side initiated the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Incoming,
    Outgoing,
    /// Both endpoints live on this host
    Local,
    #[default]
    Unknown,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Incoming => write!(f, "incoming"),
            Self::Outgoing => write!(f, "outgoing"),
            Self::Local => write!(f, "local"),
            Self::Unknown => write!(f, "unknown"),
        }
    }
}

/// Cumulative traffic counters for a connection.
///
/// Sources report absolute values; the record keeps the most recent snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ConnectionStats {
    #[serde(default)]
    pub bytes_sent: u64,
    #[serde(default)]
    pub bytes_received: u64,
    #[serde(default)]
    pub packets_sent: u64,
    #[serde(default)]
    pub packets_received: u64,
    #[serde(default)]
    pub retransmits: u32,
    /// Smoothed round-trip time in microseconds
    #[serde(default)]
    pub rtt_us: u32,
    /// Round-trip time variance in microseconds
    #[serde(default)]
    pub rtt_var_us: u32,
}

// ============================================================================
// Connection Events
// ============================================================================

/// A single observation pushed by an event source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ConnectionEvent {
    /// A connection was established.
    Open {
        key: ConnectionKey,
        #[serde(default)]
        direction: Direction,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pid: Option<u32>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        container_id: Option<String>,
        timestamp: DateTime<Utc>,
    },

    /// New counters for an active connection.
    Update {
        key: ConnectionKey,
        stats: ConnectionStats,
        timestamp: DateTime<Utc>,
    },

    /// The connection terminated. Final counters are optional.
    Close {
        key: ConnectionKey,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        stats: Option<ConnectionStats>,
        timestamp: DateTime<Utc>,
    },
}

impl ConnectionEvent {
    /// Convenience constructor for an open event without process metadata.
    pub fn open(key: ConnectionKey, direction: Direction, timestamp: DateTime<Utc>) -> Self {
        Self::Open {
            key,
            direction,
            pid: None,
            container_id: None,
            timestamp,
        }
    }

    /// Convenience constructor for a close event without final counters.
    pub fn close(key: ConnectionKey, timestamp: DateTime<Utc>) -> Self {
        Self::Close {
            key,
            stats: None,
            timestamp,
        }
    }

    /// Key of the connection this event refers to.
    pub fn key(&self) -> &ConnectionKey {
        match self {
            Self::Open { key, .. } | Self::Update { key, .. } | Self::Close { key, .. } => key,
        }
    }

    /// Time the source observed the event.
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            Self::Open { timestamp, .. }
            | Self::Update { timestamp, .. }
            | Self::Close { timestamp, .. } => *timestamp,
        }
    }

    /// Short name for logging.
    pub fn kind_name(&self) -> &'static str {
        match self {
            Self::Open { .. } => "open",
            Self::Update { .. } => "update",
            Self::Close { .. } => "close",
        }
    }

    /// Returns true for close events.
    #[must_use]
    pub fn is_close(&self) -> bool {
        matches!(self, Self::Close { .. })
    }
}

// ============================================================================
// Connection Record
// ============================================================================

/// Accumulated state for one connection.
///
/// Active records live in the daemon's connection table. When the connection
/// closes, the record is frozen (`closed_at` set) and handed to the delivery
/// buffer as an immutable snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionRecord {
    pub key: ConnectionKey,
    pub direction: Direction,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container_id: Option<String>,
    pub stats: ConnectionStats,
    pub first_seen: DateTime<Utc>,
    pub last_update: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub closed_at: Option<DateTime<Utc>>,
}

impl ConnectionRecord {
    /// Creates an empty record first seen at `timestamp`.
    pub fn new(key: ConnectionKey, timestamp: DateTime<Utc>) -> Self {
        Self {
            key,
            direction: Direction::Unknown,
            pid: None,
            container_id: None,
            stats: ConnectionStats::default(),
            first_seen: timestamp,
            last_update: timestamp,
            closed_at: None,
        }
    }

    /// Creates a record from the first event observed for its key.
    pub fn from_event(event: &ConnectionEvent) -> Self {
        let mut record = Self::new(*event.key(), event.timestamp());
        record.apply(event);
        record
    }

    /// Applies an event to this record.
    ///
    /// Events older than the last update never move `last_update` backwards
    /// and never overwrite newer counters.
    pub fn apply(&mut self, event: &ConnectionEvent) {
        let timestamp = event.timestamp();
        let is_current = timestamp >= self.last_update;

        match event {
            ConnectionEvent::Open {
                direction,
                pid,
                container_id,
                ..
            } => {
                if *direction != Direction::Unknown {
                    self.direction = *direction;
                }
                if pid.is_some() {
                    self.pid = *pid;
                }
                if container_id.is_some() {
                    self.container_id.clone_from(container_id);
                }
            }
            ConnectionEvent::Update { stats, .. } => {
                if is_current {
                    self.stats = *stats;
                }
            }
            ConnectionEvent::Close { stats, .. } => {
                if let (true, Some(stats)) = (is_current, stats) {
                    self.stats = *stats;
                }
                self.closed_at = Some(timestamp.max(self.first_seen));
            }
        }

        if is_current {
            self.last_update = timestamp;
        }
    }

    /// Returns true once the connection has closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed_at.is_some()
    }
}
