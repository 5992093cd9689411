//! Active connection table.
//!
//! The authoritative map of currently open connections. Only the tracker
//! actor mutates it; readers get owned copies.

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use netprobe_core::{ConnectionEvent, ConnectionKey, ConnectionRecord};
use tracing::debug;

use super::commands::IngestError;

/// What an ingested event did to the table.
#[derive(Debug, Clone, PartialEq)]
pub enum Applied {
    /// A new record was created.
    Opened,
    /// An existing record was updated.
    Updated,
    /// The record was closed and removed; the frozen copy is returned.
    Closed(ConnectionRecord),
}

/// Map of active connections keyed by [`ConnectionKey`].
#[derive(Debug)]
pub struct ConnectionTable {
    records: HashMap<ConnectionKey, ConnectionRecord>,
    max_connections: usize,
}

impl ConnectionTable {
    pub fn new(max_connections: usize) -> Self {
        Self {
            records: HashMap::new(),
            max_connections,
        }
    }

    /// Applies one event.
    ///
    /// The first event for a key creates its record, whatever its kind: a
    /// close for an unseen key yields a record that is created and closed in
    /// the same step, so short-lived connections are still delivered.
    pub fn ingest(&mut self, event: &ConnectionEvent) -> Result<Applied, IngestError> {
        let key = *event.key();

        if let Some(record) = self.records.get_mut(&key) {
            record.apply(event);
            if event.is_close() {
                return Ok(self
                    .records
                    .remove(&key)
                    .map(Applied::Closed)
                    .unwrap_or(Applied::Updated));
            }
            return Ok(Applied::Updated);
        }

        let record = ConnectionRecord::from_event(event);
        if record.is_closed() {
            return Ok(Applied::Closed(record));
        }

        if self.records.len() >= self.max_connections {
            return Err(IngestError::TableFull {
                max: self.max_connections,
                key,
            });
        }

        self.records.insert(key, record);
        Ok(Applied::Opened)
    }

    /// Copies every active record.
    pub fn snapshot(&self) -> Vec<ConnectionRecord> {
        self.records.values().cloned().collect()
    }

    pub fn get(&self, key: &ConnectionKey) -> Option<&ConnectionRecord> {
        self.records.get(key)
    }

    /// Drops records that have seen no event for longer than `idle_timeout`.
    ///
    /// Returns the number removed.
    pub fn expire_idle(&mut self, now: DateTime<Utc>, idle_timeout: Duration) -> usize {
        let before = self.records.len();
        self.records.retain(|key, record| {
            let keep = now - record.last_update <= idle_timeout;
            if !keep {
                debug!(key = %key, last_update = %record.last_update, "Expiring idle connection");
            }
            keep
        });
        before - self.records.len()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Releases all records.
    pub fn clear(&mut self) {
        self.records.clear();
        self.records.shrink_to_fit();
    }
}
