//! Closed-connection delivery buffer and client cursors.
//!
//! Closed connections are appended to a bounded queue and numbered with a
//! monotonically increasing sequence. Each client owns a cursor: the sequence
//! number of the next entry it has not seen. A poll returns everything from
//! the cursor to the tail and moves the cursor to the tail, so every client
//! sees every closed connection exactly once, in closure order, at whatever
//! rate it polls.
//!
//! ```text
//!   head_seq                                   tail_seq
//!      │                                          │
//!      ▼                                          ▼
//!    ┌────┬────┬────┬────┬────┬────┬────┬────┐
//!    │ 17 │ 18 │ 19 │ 20 │ 21 │ 22 │ 23 │ 24 │
//!    └────┴────┴────┴────┴────┴────┴────┴────┘
//!           ▲              ▲                    ▲
//!        client B       client A          debug client
//!        (lagging)                        (caught up)
//! ```
//!
//! # Eviction
//!
//! Entries stay until the queue exceeds its capacity, so a client that
//! registers late still sees the retained history. When an append overflows,
//! the oldest entry is popped. Any cursor still pointing at or below it is
//! moved past it and that client's dropped counters grow by one. Memory is
//! bounded by the capacity no matter how long a client stays silent; the
//! loss is reported to the client on its next poll.
//!
//! # Registration
//!
//! A client is registered on its first poll with its cursor at the oldest
//! retained entry. Entries evicted before that moment count as dropped for
//! the new client.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use netprobe_core::{ClientDebugInfo, ClientId, ConnectionRecord};
use tracing::{debug, info};

use super::commands::TrackerError;

/// Closed connections handed to one client by one poll.
#[derive(Debug, Clone, Default)]
pub struct Delivery {
    pub entries: Vec<Arc<ConnectionRecord>>,
    /// Entries this client lost to eviction since its previous poll
    pub dropped: u64,
}

/// Per-client delivery state.
#[derive(Debug, Clone)]
struct ClientCursor {
    next_seq: u64,
    registered_at: DateTime<Utc>,
    last_poll: DateTime<Utc>,
    polls: u64,
    dropped_total: u64,
    dropped_unreported: u64,
}

/// Bounded multi-consumer queue of closed connections.
#[derive(Debug)]
pub struct DeliveryBuffer {
    entries: VecDeque<Arc<ConnectionRecord>>,
    /// Sequence number of `entries.front()`
    head_seq: u64,
    capacity: usize,
    clients: HashMap<ClientId, ClientCursor>,
    max_clients: usize,
    evicted: u64,
    client_drops: u64,
}

impl DeliveryBuffer {
    /// Creates a buffer holding at most `capacity` entries and tracking at
    /// most `max_clients` clients (the debug client does not count).
    pub fn new(capacity: usize, max_clients: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity.min(1024)),
            head_seq: 0,
            capacity: capacity.max(1),
            clients: HashMap::new(),
            max_clients,
            evicted: 0,
            client_drops: 0,
        }
    }

    /// Sequence number the next appended entry will get.
    pub fn tail_seq(&self) -> u64 {
        self.head_seq + self.entries.len() as u64
    }

    /// Sequence number of the oldest retained entry.
    pub fn head_seq(&self) -> u64 {
        self.head_seq
    }

    /// Appends a closed connection. Never blocks.
    ///
    /// Returns how many entries were evicted to stay within capacity.
    pub fn append(&mut self, record: ConnectionRecord) -> usize {
        self.entries.push_back(Arc::new(record));

        let mut evicted = 0;
        while self.entries.len() > self.capacity {
            if self.entries.pop_front().is_none() {
                break;
            }
            let dropped_seq = self.head_seq;
            self.head_seq += 1;
            self.evicted += 1;
            evicted += 1;

            for (client_id, cursor) in self.clients.iter_mut() {
                if cursor.next_seq <= dropped_seq {
                    cursor.next_seq = dropped_seq + 1;
                    cursor.dropped_total += 1;
                    cursor.dropped_unreported += 1;
                    self.client_drops += 1;
                    debug!(client_id = %client_id, seq = dropped_seq, "Dropped undelivered entry for lagging client");
                }
            }
        }

        evicted
    }

    /// Returns everything the client has not seen and advances its cursor.
    ///
    /// Unknown clients are registered here, starting at the oldest retained
    /// entry.
    pub fn consume(&mut self, client_id: &ClientId, now: DateTime<Utc>) -> Result<Delivery, TrackerError> {
        if !self.clients.contains_key(client_id) {
            self.register(client_id, now)?;
        }

        let head_seq = self.head_seq;
        let tail_seq = self.tail_seq();
        let Some(cursor) = self.clients.get_mut(client_id) else {
            return Err(TrackerError::ClientNotFound(client_id.clone()));
        };

        let start = usize::try_from(cursor.next_seq.saturating_sub(head_seq)).unwrap_or(usize::MAX);
        let entries: Vec<_> = self.entries.iter().skip(start).cloned().collect();

        cursor.next_seq = tail_seq;
        cursor.last_poll = now;
        cursor.polls += 1;
        let dropped = std::mem::take(&mut cursor.dropped_unreported);

        Ok(Delivery { entries, dropped })
    }

    fn register(&mut self, client_id: &ClientId, now: DateTime<Utc>) -> Result<(), TrackerError> {
        if !client_id.is_debug() && self.real_client_count() >= self.max_clients {
            return Err(TrackerError::TooManyClients {
                max: self.max_clients,
            });
        }

        let missed = self.head_seq;
        self.clients.insert(
            client_id.clone(),
            ClientCursor {
                next_seq: self.head_seq,
                registered_at: now,
                last_poll: now,
                polls: 0,
                dropped_total: missed,
                dropped_unreported: missed,
            },
        );

        info!(
            client_id = %client_id,
            cursor = self.head_seq,
            missed,
            clients = self.clients.len(),
            "Client registered"
        );
        Ok(())
    }

    fn real_client_count(&self) -> usize {
        self.clients.keys().filter(|id| !id.is_debug()).count()
    }

    /// Forgets clients that have not polled within `timeout`.
    ///
    /// The debug client is never expired. Returns the removed identifiers.
    pub fn expire(&mut self, now: DateTime<Utc>, timeout: Duration) -> Vec<ClientId> {
        let expired: Vec<ClientId> = self
            .clients
            .iter()
            .filter(|(id, cursor)| !id.is_debug() && now - cursor.last_poll > timeout)
            .map(|(id, _)| id.clone())
            .collect();

        for id in &expired {
            self.clients.remove(id);
            info!(client_id = %id, "Client expired after inactivity");
        }

        if !expired.is_empty() {
            debug!(floor = self.floor(), "Eviction floor after client expiry");
        }

        expired
    }

    /// Lowest cursor across live clients.
    ///
    /// Entries below the floor have been seen by every live client. With no
    /// clients the floor is the tail.
    pub fn floor(&self) -> u64 {
        self.clients
            .values()
            .map(|c| c.next_seq)
            .min()
            .unwrap_or_else(|| self.tail_seq())
    }

    /// Bookkeeping for one client, without side effects.
    pub fn client_info(&self, client_id: &ClientId, now: DateTime<Utc>) -> Option<ClientDebugInfo> {
        let cursor = self.clients.get(client_id)?;
        Some(ClientDebugInfo {
            client_id: client_id.clone(),
            cursor: cursor.next_seq,
            pending: usize::try_from(self.tail_seq().saturating_sub(cursor.next_seq))
                .unwrap_or(usize::MAX),
            dropped_total: cursor.dropped_total,
            dropped_unreported: cursor.dropped_unreported,
            polls: cursor.polls,
            registered_at: cursor.registered_at,
            last_poll: cursor.last_poll,
            idle_secs: (now - cursor.last_poll).num_seconds(),
            expires: !client_id.is_debug(),
        })
    }

    pub fn contains_client(&self, client_id: &ClientId) -> bool {
        self.clients.contains_key(client_id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    /// Entries evicted because of capacity.
    pub fn evicted(&self) -> u64 {
        self.evicted
    }

    /// Sum of forced drops across all clients.
    pub fn client_drops(&self) -> u64 {
        self.client_drops
    }

    /// Releases all entries and cursors.
    pub fn clear(&mut self) {
        self.entries.clear();
        self.entries.shrink_to_fit();
        self.clients.clear();
        self.clients.shrink_to_fit();
    }
}
