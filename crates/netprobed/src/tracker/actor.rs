//! Tracker actor - owns all connection state and processes events and queries.
//!
//! The TrackerActor is the single owner of the connection table, the delivery
//! buffer and the counters. It drains two channels: events from the sources
//! and commands from [`TrackerHandle`](super::TrackerHandle)s. Commands are
//! polled first so a flood of events cannot starve queries.
//!
//! # Panic-Free Guarantees
//!
//! This module follows CONTRIBUTING.md panic-free policy:
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - All fallible operations use `?`, pattern matching, or `unwrap_or`
//! - Responder send failures are ignored (the caller went away)

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use netprobe_core::{
    ClientDebugInfo, ClientId, Clock, ConnectionEvent, ConnectionList, TrackerStats,
};

use super::commands::{TrackerCommand, TrackerError};
use super::delivery::DeliveryBuffer;
use super::table::{Applied, ConnectionTable};
use crate::config::TrackerConfig;

/// Running totals kept by the actor.
#[derive(Debug, Default, Clone)]
struct Counters {
    ingested: u64,
    rejected: u64,
    opened: u64,
    closed: u64,
    expired: u64,
    clients_expired: u64,
}

/// Events-per-second sampled on each maintenance tick.
#[derive(Debug, Clone)]
struct RateSample {
    at: DateTime<Utc>,
    ingested: u64,
    rate: f64,
}

// ============================================================================
// Tracker Actor
// ============================================================================

/// The tracker actor - owns all connection state.
///
/// # Ownership
///
/// The actor owns:
/// - `table`: active connections keyed by `ConnectionKey`
/// - `buffer`: closed connections awaiting delivery, plus per-client cursors
///
/// Replies carry owned copies, so callers never observe a record mid-update.
pub struct TrackerActor {
    events: mpsc::Receiver<ConnectionEvent>,
    commands: mpsc::Receiver<TrackerCommand>,
    table: ConnectionTable,
    buffer: DeliveryBuffer,
    config: TrackerConfig,
    clock: Arc<dyn Clock>,
    /// Shared with every `EventSink`
    lost: Arc<AtomicU64>,
    counters: Counters,
    sample: RateSample,
    started_at: DateTime<Utc>,
}

impl TrackerActor {
    pub fn new(
        events: mpsc::Receiver<ConnectionEvent>,
        commands: mpsc::Receiver<TrackerCommand>,
        config: TrackerConfig,
        clock: Arc<dyn Clock>,
        lost: Arc<AtomicU64>,
    ) -> Self {
        let now = clock.now();
        Self {
            events,
            commands,
            table: ConnectionTable::new(config.max_connections),
            buffer: DeliveryBuffer::new(config.buffer_capacity, config.max_clients),
            config,
            clock,
            lost,
            counters: Counters::default(),
            sample: RateSample {
                at: now,
                ingested: 0,
                rate: 0.0,
            },
            started_at: now,
        }
    }

    /// Runs the actor loop until `Stop` or until every handle is dropped.
    pub async fn run(mut self) {
        info!(
            buffer_capacity = self.config.buffer_capacity,
            max_connections = self.config.max_connections,
            max_clients = self.config.max_clients,
            "Tracker actor starting"
        );

        let mut events_open = true;
        loop {
            tokio::select! {
                biased;

                cmd = self.commands.recv() => match cmd {
                    Some(cmd) => {
                        if !self.handle_command(cmd) {
                            break;
                        }
                    }
                    None => {
                        debug!("All tracker handles dropped");
                        self.release();
                        break;
                    }
                },

                event = self.events.recv(), if events_open => match event {
                    Some(event) => self.ingest(event),
                    None => {
                        debug!("All event sinks dropped");
                        events_open = false;
                    }
                },
            }
        }

        info!(
            events_ingested = self.counters.ingested,
            connections_closed = self.counters.closed,
            "Tracker actor stopped"
        );
    }

    /// Dispatches a command. Returns `false` when the actor should exit.
    pub(crate) fn handle_command(&mut self, cmd: TrackerCommand) -> bool {
        match cmd {
            TrackerCommand::GetActiveConnections {
                client_id,
                respond_to,
            } => {
                let result = self.handle_get_active_connections(&client_id);
                let _ = respond_to.send(result);
            }
            TrackerCommand::DebugNetworkMaps { respond_to } => {
                let _ = respond_to.send(ConnectionList::new(self.table.snapshot()));
            }
            TrackerCommand::DebugNetworkState {
                client_id,
                respond_to,
            } => {
                let result = self.handle_debug_network_state(client_id);
                let _ = respond_to.send(result);
            }
            TrackerCommand::GetStats { respond_to } => {
                let _ = respond_to.send(self.stats());
            }
            TrackerCommand::Maintain => {
                self.handle_maintain();
            }
            TrackerCommand::Stop { respond_to } => {
                self.release();
                let _ = respond_to.send(());
                return false;
            }
        }
        true
    }

    // ========================================================================
    // Ingestion
    // ========================================================================

    /// Applies one event to the table, moving closed records into the buffer.
    pub(crate) fn ingest(&mut self, event: ConnectionEvent) {
        match self.table.ingest(&event) {
            Ok(Applied::Opened) => {
                self.counters.ingested += 1;
                self.counters.opened += 1;
                debug!(key = %event.key(), kind = event.kind_name(), "Connection opened");
            }
            Ok(Applied::Updated) => {
                self.counters.ingested += 1;
            }
            Ok(Applied::Closed(record)) => {
                self.counters.ingested += 1;
                self.counters.closed += 1;
                debug!(key = %record.key, bytes_sent = record.stats.bytes_sent, "Connection closed");
                let evicted = self.buffer.append(record);
                if evicted > 0 {
                    debug!(evicted, buffered = self.buffer.len(), "Delivery buffer at capacity");
                }
            }
            Err(e) => {
                self.counters.rejected += 1;
                if self.counters.rejected.is_power_of_two() {
                    warn!(error = %e, rejected = self.counters.rejected, "Skipping event");
                } else {
                    debug!(error = %e, "Skipping event");
                }
            }
        }
    }

    // ========================================================================
    // Command Handlers
    // ========================================================================

    fn handle_get_active_connections(
        &mut self,
        client_id: &ClientId,
    ) -> Result<ConnectionList, TrackerError> {
        let now = self.clock.now();
        let delivery = self.buffer.consume(client_id, now)?;

        let mut connections = self.table.snapshot();
        let active = connections.len();
        connections.extend(delivery.entries.iter().map(|record| (**record).clone()));

        debug!(
            client_id = %client_id,
            active,
            closed = delivery.entries.len(),
            dropped = delivery.dropped,
            "Served connections"
        );
        if delivery.dropped > 0 {
            warn!(client_id = %client_id, dropped = delivery.dropped, "Client lost closed connections to eviction");
        }

        Ok(ConnectionList {
            connections,
            dropped: delivery.dropped,
        })
    }

    fn handle_debug_network_state(
        &self,
        client_id: ClientId,
    ) -> Result<ClientDebugInfo, TrackerError> {
        self.buffer
            .client_info(&client_id, self.clock.now())
            .ok_or(TrackerError::ClientNotFound(client_id))
    }

    /// Expires inactive clients and idle connections, samples the rate.
    fn handle_maintain(&mut self) {
        let now = self.clock.now();

        let expired_clients = self.buffer.expire(now, self.config.client_timeout());
        self.counters.clients_expired += expired_clients.len() as u64;

        let expired = self
            .table
            .expire_idle(now, self.config.idle_connection_timeout());
        self.counters.expired += expired as u64;
        if expired > 0 {
            info!(expired, active = self.table.len(), "Expired idle connections");
        }

        let elapsed_ms = (now - self.sample.at).num_milliseconds();
        if elapsed_ms > 0 {
            let delta = self.counters.ingested.saturating_sub(self.sample.ingested);
            self.sample = RateSample {
                at: now,
                ingested: self.counters.ingested,
                rate: delta as f64 * 1000.0 / elapsed_ms as f64,
            };
        }
    }

    fn stats(&self) -> TrackerStats {
        TrackerStats {
            active_connections: self.table.len(),
            buffered_closed: self.buffer.len(),
            buffer_capacity: self.buffer.capacity(),
            registered_clients: self.buffer.client_count(),
            client_drops: self.buffer.client_drops(),
            evicted_entries: self.buffer.evicted(),
            events_ingested: self.counters.ingested,
            events_rejected: self.counters.rejected,
            events_lost: self.lost.load(Ordering::Relaxed),
            connections_opened: self.counters.opened,
            connections_closed: self.counters.closed,
            connections_expired: self.counters.expired,
            clients_expired: self.counters.clients_expired,
            ingestion_rate: self.sample.rate,
            uptime_secs: (self.clock.now() - self.started_at).num_seconds(),
        }
    }

    /// Drops every record, entry and cursor.
    fn release(&mut self) {
        info!(
            active = self.table.len(),
            buffered = self.buffer.len(),
            clients = self.buffer.client_count(),
            "Releasing tracker state"
        );
        self.table.clear();
        self.buffer.clear();
    }

    #[cfg(test)]
    fn active_count(&self) -> usize {
        self.table.len()
    }
}
