//! Event sources feeding the tracker.
//!
//! A source observes the host and turns what it sees into
//! [`ConnectionEvent`]s pushed into an [`EventSink`]. The tracker attaches a
//! source on start and detaches it on stop.
//!
//! ```text
//! ┌────────────────┐  ingest()   ┌───────────┐  bounded mpsc  ┌──────────────┐
//! │ ProcNetSource  │────────────▶│ EventSink │───────────────▶│ TrackerActor │
//! │ JsonLinesSource│  (never     └───────────┘  (full: drop   └──────────────┘
//! └────────────────┘   blocks)                  + count lost)
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use netprobe_core::ConnectionEvent;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, warn};

mod jsonl;
mod procnet;

pub use jsonl::JsonLinesSource;
pub use procnet::ProcNetSource;

use crate::config::{SourceConfig, SourceKind};

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, Error)]
pub enum SourceError {
    /// The source could not start observing the host.
    #[error("failed to attach {source_name} source: {reason}")]
    Attach {
        source_name: &'static str,
        reason: String,
    },

    /// The source was attached twice without a detach in between.
    #[error("{0} source is already attached")]
    AlreadyAttached(&'static str),

    #[error("source configuration error: {0}")]
    Config(String),
}

// ============================================================================
// Event Sink
// ============================================================================

/// Non-blocking ingestion endpoint handed to sources.
///
/// Cheap to clone. When the tracker's queue is full the event is discarded
/// and counted; sources never wait on the tracker.
#[derive(Debug, Clone)]
pub struct EventSink {
    sender: mpsc::Sender<ConnectionEvent>,
    lost: Arc<AtomicU64>,
}

impl EventSink {
    pub(crate) fn new(sender: mpsc::Sender<ConnectionEvent>, lost: Arc<AtomicU64>) -> Self {
        Self { sender, lost }
    }

    /// Queues an event for the tracker.
    ///
    /// Returns `false` if the event was discarded.
    pub fn ingest(&self, event: ConnectionEvent) -> bool {
        match self.sender.try_send(event) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(event)) => {
                let lost = self.lost.fetch_add(1, Ordering::Relaxed) + 1;
                if lost.is_power_of_two() {
                    warn!(lost, key = %event.key(), "Event queue full, discarding events");
                }
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.lost.fetch_add(1, Ordering::Relaxed);
                debug!("Tracker stopped, discarding event");
                false
            }
        }
    }

    /// Returns true once the tracker has stopped consuming events.
    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }

    /// Events discarded so far.
    pub fn lost(&self) -> u64 {
        self.lost.load(Ordering::Relaxed)
    }
}

// ============================================================================
// Event Source
// ============================================================================

/// Something that produces connection events.
#[async_trait]
pub trait EventSource: Send + Sync {
    /// Short name used in logs and errors.
    fn name(&self) -> &'static str;

    /// Starts producing events into `sink`.
    ///
    /// Must return once the source is running; long-lived work belongs in a
    /// spawned task owned by the source.
    async fn attach(&mut self, sink: EventSink) -> Result<(), SourceError>;

    /// Stops producing events. Calling it on a detached source is a no-op.
    async fn detach(&mut self);
}

/// Builds the source selected in the configuration.
pub fn from_config(config: &SourceConfig) -> Result<Box<dyn EventSource>, SourceError> {
    match config.kind {
        SourceKind::Procnet => Ok(Box::new(ProcNetSource::new(
            config.poll_interval(),
            config.refresh_interval(),
        ))),
        SourceKind::Jsonl => {
            let path = config.path.clone().ok_or_else(|| {
                SourceError::Config("source.path is required for the jsonl source".to_string())
            })?;
            Ok(Box::new(JsonLinesSource::new(path)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use netprobe_core::{ConnectionKey, Protocol};

    fn event(port: u16) -> ConnectionEvent {
        let key = ConnectionKey::new(
            format!("127.0.0.1:{port}").parse().unwrap(),
            "127.0.0.1:80".parse().unwrap(),
            Protocol::Tcp,
            0,
        );
        ConnectionEvent::close(key, Utc::now())
    }

    #[tokio::test]
    async fn test_sink_counts_lost_when_full() {
        let (tx, mut rx) = mpsc::channel(2);
        let sink = EventSink::new(tx, Arc::new(AtomicU64::new(0)));

        assert!(sink.ingest(event(1)));
        assert!(sink.ingest(event(2)));
        assert!(!sink.ingest(event(3)));
        assert_eq!(sink.lost(), 1);

        assert!(rx.recv().await.is_some());
        assert!(sink.ingest(event(4)));
        assert_eq!(sink.lost(), 1);
    }

    #[tokio::test]
    async fn test_sink_closed_after_receiver_dropped() {
        let (tx, rx) = mpsc::channel(2);
        let sink = EventSink::new(tx, Arc::new(AtomicU64::new(0)));
        drop(rx);

        assert!(sink.is_closed());
        assert!(!sink.ingest(event(1)));
        assert_eq!(sink.lost(), 1);
    }

    #[test]
    fn test_from_config() {
        let config = SourceConfig::default();
        assert_eq!(from_config(&config).unwrap().name(), "procnet");

        let config = SourceConfig {
            kind: SourceKind::Jsonl,
            path: Some("/tmp/events.jsonl".into()),
            ..Default::default()
        };
        assert_eq!(from_config(&config).unwrap().name(), "jsonl");

        let config = SourceConfig {
            kind: SourceKind::Jsonl,
            path: None,
            ..Default::default()
        };
        assert!(matches!(from_config(&config), Err(SourceError::Config(_))));
    }
}
