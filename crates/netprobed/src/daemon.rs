//! Daemon lifecycle.
//!
//! ```text
//! Uninitialized ──gate──▶ Gated ──tracker + socket──▶ Running ──cancel──▶ Stopped
//!        │                  │
//!        └──unsupported─────┴──start failure──▶ (error returned, Stopped)
//! ```
//!
//! The current state is published on a `watch` channel so callers (and
//! tests) can wait for the daemon to be ready.

use std::fmt;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::{ConfigError, DaemonConfig};
use crate::gate::{self, HostProbe, SysinfoProbe};
use crate::heartbeat::spawn_heartbeat_task;
use crate::introspection;
use crate::server::{DaemonServer, ServerError};
use crate::source::{self, EventSource, SourceError};
use crate::tracker::{StartError, Tracker};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DaemonState {
    Uninitialized,
    /// The host passed the compatibility gate
    Gated,
    /// Tracker running and socket accepting connections
    Running,
    Stopped,
}

impl fmt::Display for DaemonState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Uninitialized => "uninitialized",
            Self::Gated => "gated",
            Self::Running => "running",
            Self::Stopped => "stopped",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DaemonError {
    #[error(transparent)]
    Start(#[from] StartError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Source(#[from] SourceError),

    #[error(transparent)]
    Server(#[from] ServerError),
}

impl DaemonError {
    /// Returns true if the host cannot run the tracker at all.
    pub fn is_unsupported(&self) -> bool {
        matches!(self, Self::Start(e) if e.is_unsupported())
    }
}

/// The netprobe daemon.
pub struct Daemon {
    config: DaemonConfig,
    probe: Box<dyn HostProbe>,
    state: watch::Sender<DaemonState>,
}

impl Daemon {
    pub fn new(config: DaemonConfig) -> Self {
        Self::with_probe(config, Box::new(SysinfoProbe))
    }

    /// Uses `probe` instead of the real host for the compatibility gate.
    pub fn with_probe(config: DaemonConfig, probe: Box<dyn HostProbe>) -> Self {
        let (state, _) = watch::channel(DaemonState::Uninitialized);
        Self {
            config,
            probe,
            state,
        }
    }

    pub fn config(&self) -> &DaemonConfig {
        &self.config
    }

    /// Subscribes to state transitions.
    pub fn state(&self) -> watch::Receiver<DaemonState> {
        self.state.subscribe()
    }

    /// Runs with the event source named in the configuration.
    pub async fn run(&self, cancel_token: CancellationToken) -> Result<(), DaemonError> {
        self.run_inner(None, cancel_token).await
    }

    /// Runs with an explicitly provided event source.
    pub async fn run_with_source(
        &self,
        source: Box<dyn EventSource>,
        cancel_token: CancellationToken,
    ) -> Result<(), DaemonError> {
        self.run_inner(Some(source), cancel_token).await
    }

    async fn run_inner(
        &self,
        source: Option<Box<dyn EventSource>>,
        cancel_token: CancellationToken,
    ) -> Result<(), DaemonError> {
        let result = self.serve(source, cancel_token).await;
        self.transition(DaemonState::Stopped);
        result
    }

    async fn serve(
        &self,
        source: Option<Box<dyn EventSource>>,
        cancel_token: CancellationToken,
    ) -> Result<(), DaemonError> {
        let min_kernel = self.config.min_kernel()?;
        let supported = gate::check(
            self.probe.as_ref(),
            &self.config.excluded_kernel_versions,
            min_kernel,
        )
        .map_err(|e| StartError::Unsupported { reason: e.reason })?;
        info!(kernel = %supported.kernel(), "Host passed compatibility gate");
        self.transition(DaemonState::Gated);

        let source = match source {
            Some(source) => source,
            None => source::from_config(&self.config.source)?,
        };
        let tracker = Tracker::start(supported, self.config.tracker.clone(), source).await?;

        let server = DaemonServer::new(
            &self.config.socket_path,
            tracker.handle(),
            cancel_token.child_token(),
        );
        let listener = match server.bind() {
            Ok(listener) => listener,
            Err(e) => {
                error!(error = %e, "Failed to bind socket");
                tracker.stop().await;
                return Err(e.into());
            }
        };

        let background = cancel_token.child_token();
        let heartbeat = spawn_heartbeat_task(
            tracker.handle(),
            self.config.heartbeat_interval(),
            background.clone(),
        );

        if let Some(port) = self.config.introspection_port {
            match introspection::bind(port).await {
                Ok(listener) => {
                    tokio::spawn(introspection::serve(
                        listener,
                        tracker.handle(),
                        background.clone(),
                    ));
                }
                Err(e) => warn!(error = %e, "Introspection listener disabled"),
            }
        }

        self.transition(DaemonState::Running);
        server.serve(listener).await;

        background.cancel();
        let _ = heartbeat.await;
        tracker.stop().await;
        Ok(())
    }

    fn transition(&self, to: DaemonState) {
        let from = self.state.send_replace(to);
        if from != to {
            info!(from = %from, to = %to, "Daemon state changed");
        }
    }
}
