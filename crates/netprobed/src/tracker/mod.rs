//! Connection tracking engine using the Actor pattern.
//!
//! The tracker keeps the table of active connections and a bounded buffer of
//! closed connections that every polling client receives exactly once.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐ EventSink  ┌──────────────────┐ TrackerCommand ┌───────────────┐
//! │ EventSource  │───────────▶│   TrackerActor   │◀───────────────│ TrackerHandle │
//! └──────────────┘ (bounded,  │                  │  (mpsc + reply │ (server, CLI, │
//!                  lossy)     │ ConnectionTable  │   oneshot)     │  heartbeat)   │
//!                             │ DeliveryBuffer   │                └───────────────┘
//! ┌──────────────┐ Maintain   │                  │
//! │ maintenance  │───────────▶│                  │
//! └──────────────┘ (interval) └──────────────────┘
//! ```
//!
//! # Panic-Free Guarantees
//!
//! All operations in this module follow the panic-free policy:
//! - No `.unwrap()` or `.expect()` in production code
//! - All fallible operations return `Result` or `Option`
//! - Channel operations handle closure gracefully

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};
use tokio::time::{interval_at, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use netprobe_core::{
    ClientDebugInfo, ClientId, Clock, ConnectionList, SystemClock, TrackerStats,
};

mod actor;
mod commands;
mod delivery;
mod handle;
mod table;

pub use actor::TrackerActor;
pub use commands::{IngestError, StartError, TrackerCommand, TrackerError};
pub use delivery::{Delivery, DeliveryBuffer};
pub use handle::TrackerHandle;
pub use table::{Applied, ConnectionTable};

use crate::config::TrackerConfig;
use crate::gate::{self, HostProbe, KernelVersion, Supported};
use crate::source::{EventSink, EventSource};

// ============================================================================
// Tracker
// ============================================================================

/// A running tracking engine.
///
/// Owns the attached event source and the maintenance task. Queries go
/// through [`TrackerHandle`], which this type also exposes directly.
pub struct Tracker {
    handle: TrackerHandle,
    sink: EventSink,
    source: Mutex<Option<Box<dyn EventSource>>>,
    maintenance: CancellationToken,
    stopped: AtomicBool,
    supported: Supported,
}

impl Tracker {
    /// Runs the compatibility gate, then [`start`](Self::start).
    ///
    /// # Errors
    ///
    /// `StartError::Unsupported` if the gate refuses the host; nothing is
    /// constructed in that case.
    pub async fn launch(
        probe: &dyn HostProbe,
        excluded_versions: &[String],
        min_kernel: KernelVersion,
        config: TrackerConfig,
        source: Box<dyn EventSource>,
    ) -> Result<Self, StartError> {
        let supported = gate::check(probe, excluded_versions, min_kernel)
            .map_err(|e| StartError::Unsupported { reason: e.reason })?;
        Self::start(supported, config, source).await
    }

    /// Builds the engine and attaches `source`.
    ///
    /// Requires the [`Supported`] token from the compatibility gate.
    ///
    /// # Errors
    ///
    /// - `StartError::Config` if the limits are invalid
    /// - `StartError::Initialization` if the source fails to attach; the
    ///   actor is stopped before returning
    pub async fn start(
        supported: Supported,
        config: TrackerConfig,
        source: Box<dyn EventSource>,
    ) -> Result<Self, StartError> {
        Self::start_with_clock(supported, config, source, Arc::new(SystemClock)).await
    }

    /// [`start`](Self::start) with an explicit clock.
    pub async fn start_with_clock(
        supported: Supported,
        config: TrackerConfig,
        mut source: Box<dyn EventSource>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, StartError> {
        config.validate()?;

        let (event_tx, event_rx) = mpsc::channel(config.event_queue_capacity);
        let (cmd_tx, cmd_rx) = mpsc::channel(config.command_queue_capacity);
        let lost = Arc::new(AtomicU64::new(0));

        let maintenance_interval = config.maintenance_interval();
        let actor = TrackerActor::new(event_rx, cmd_rx, config, clock, Arc::clone(&lost));
        tokio::spawn(actor.run());

        let handle = TrackerHandle::new(cmd_tx.clone());
        let sink = EventSink::new(event_tx, lost);

        if let Err(e) = source.attach(sink.clone()).await {
            warn!(source = source.name(), error = %e, "Event source failed to attach");
            handle.stop().await;
            return Err(StartError::Initialization(e));
        }

        let maintenance = CancellationToken::new();
        spawn_maintenance_task(cmd_tx, maintenance_interval, maintenance.clone());

        info!(
            source = source.name(),
            kernel = %supported.kernel(),
            "Tracker started"
        );

        Ok(Self {
            handle,
            sink,
            source: Mutex::new(Some(source)),
            maintenance,
            stopped: AtomicBool::new(false),
            supported,
        })
    }

    /// Cheap-to-clone query handle.
    pub fn handle(&self) -> TrackerHandle {
        self.handle.clone()
    }

    /// Ingestion endpoint, for feeding events from outside a source.
    pub fn sink(&self) -> EventSink {
        self.sink.clone()
    }

    pub fn kernel(&self) -> KernelVersion {
        self.supported.kernel()
    }

    pub async fn get_active_connections(
        &self,
        client_id: ClientId,
    ) -> Result<ConnectionList, TrackerError> {
        self.handle.get_active_connections(client_id).await
    }

    pub async fn debug_network_maps(&self) -> Result<ConnectionList, TrackerError> {
        self.handle.debug_network_maps().await
    }

    pub async fn debug_network_state(
        &self,
        client_id: ClientId,
    ) -> Result<ClientDebugInfo, TrackerError> {
        self.handle.debug_network_state(client_id).await
    }

    pub async fn get_stats(&self) -> Result<TrackerStats, TrackerError> {
        self.handle.get_stats().await
    }

    /// Detaches the source, releases all state and stops background work.
    ///
    /// Safe to call more than once; later calls return immediately.
    pub async fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            debug!("Tracker already stopped");
            return;
        }

        if let Some(mut source) = self.source.lock().await.take() {
            source.detach().await;
            debug!(source = source.name(), "Event source detached");
        }

        self.maintenance.cancel();
        self.handle.stop().await;
        info!("Tracker stopped");
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

impl Drop for Tracker {
    fn drop(&mut self) {
        self.maintenance.cancel();
    }
}

/// Spawn a background task that triggers periodic maintenance.
fn spawn_maintenance_task(
    sender: mpsc::Sender<TrackerCommand>,
    period: std::time::Duration,
    cancel: CancellationToken,
) {
    tokio::spawn(async move {
        let mut ticker = interval_at(Instant::now() + period, period);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("Maintenance task cancelled");
                    break;
                }
                _ = ticker.tick() => {
                    // Fire-and-forget
                    if sender.send(TrackerCommand::Maintain).await.is_err() {
                        debug!("Maintenance task stopping: tracker channel closed");
                        break;
                    }
                }
            }
        }
    });
}
