//! Unix socket server for the netprobe daemon.
//!
//! The server:
//! - Listens on a Unix socket for client connections
//! - Spawns a ConnectionHandler for each client
//! - Answers queries through the tracker handle
//! - Supports graceful shutdown via CancellationToken
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐
//! │   DaemonServer  │
//! │                 │
//! │  UnixListener   │
//! └───────┬─────────┘
//!         │ accept()
//!         ▼
//! ┌─────────────────┐     ┌─────────────────┐
//! │ConnectionHandler│────▶│  TrackerHandle  │
//! │   (per client)  │     │                 │
//! └─────────────────┘     └─────────────────┘
//! ```
//!
//! # Panic-Free Guarantees
//!
//! This module follows CONTRIBUTING.md panic-free policy:
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - All fallible operations use `?`, pattern matching, or `unwrap_or`
//! - Server errors are logged and allow continued operation

mod connection;

pub use connection::{ConnectionError, ConnectionHandler, MAX_MESSAGE_SIZE};

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::net::UnixListener;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{error, info, warn};

use crate::tracker::TrackerHandle;

pub use crate::config::DEFAULT_SOCKET_PATH;

/// Unix socket server for the netprobe daemon.
pub struct DaemonServer {
    socket_path: PathBuf,
    tracker: TrackerHandle,
    cancel_token: CancellationToken,
    connection_counter: AtomicU64,
    connections: TaskTracker,
}

impl DaemonServer {
    /// Creates a new daemon server.
    ///
    /// # Arguments
    ///
    /// * `socket_path` - Path where the Unix socket will be created
    /// * `tracker` - Handle to the tracking engine
    /// * `cancel_token` - Token for graceful shutdown
    pub fn new(
        socket_path: impl Into<PathBuf>,
        tracker: TrackerHandle,
        cancel_token: CancellationToken,
    ) -> Self {
        Self {
            socket_path: socket_path.into(),
            tracker,
            cancel_token,
            connection_counter: AtomicU64::new(0),
            connections: TaskTracker::new(),
        }
    }

    /// Creates a server with the default socket path.
    pub fn with_default_path(tracker: TrackerHandle, cancel_token: CancellationToken) -> Self {
        Self::new(DEFAULT_SOCKET_PATH, tracker, cancel_token)
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Binds the socket, replacing a stale socket file.
    pub fn bind(&self) -> Result<UnixListener, ServerError> {
        let setup_err = |e: std::io::Error| ServerError::SocketSetup {
            path: self.socket_path.clone(),
            error: e.to_string(),
        };

        if self.socket_path.exists() {
            std::fs::remove_file(&self.socket_path).map_err(setup_err)?;
        }

        if let Some(parent) = self.socket_path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent).map_err(setup_err)?;
            }
        }

        UnixListener::bind(&self.socket_path).map_err(setup_err)
    }

    /// Binds and serves until the cancellation token is triggered.
    pub async fn run(&self) -> Result<(), ServerError> {
        let listener = self.bind()?;
        self.serve(listener).await;
        Ok(())
    }

    /// Accepts connections on an already bound listener until cancelled.
    pub async fn serve(&self, listener: UnixListener) {
        info!(socket = %self.socket_path.display(), "Daemon server listening");

        loop {
            tokio::select! {
                _ = self.cancel_token.cancelled() => {
                    info!("Server shutdown requested");
                    break;
                }

                result = listener.accept() => {
                    match result {
                        Ok((stream, _addr)) => {
                            let conn_num = self.connection_counter.fetch_add(1, Ordering::Relaxed);
                            self.handle_connection(stream, conn_num);
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
            }
        }

        drop(listener);
        self.cleanup().await;
    }

    /// Spawns a handler task for one client.
    ///
    /// Handlers stop at the next message boundary once the server is
    /// cancelled.
    fn handle_connection(&self, stream: tokio::net::UnixStream, connection_number: u64) {
        let (reader, writer) = stream.into_split();
        let handler = ConnectionHandler::new(reader, writer, self.tracker.clone(), connection_number);
        let cancel = self.cancel_token.clone();

        self.connections.spawn(async move {
            tokio::select! {
                _ = handler.run() => {}
                _ = cancel.cancelled() => {}
            }
        });
    }

    /// Number of connections that have been accepted.
    pub fn connections_accepted(&self) -> u64 {
        self.connection_counter.load(Ordering::Relaxed)
    }

    async fn cleanup(&self) {
        self.connections.close();
        self.connections.wait().await;

        if self.socket_path.exists() {
            if let Err(e) = std::fs::remove_file(&self.socket_path) {
                warn!(
                    socket = %self.socket_path.display(),
                    error = %e,
                    "Failed to remove socket file"
                );
            }
        }

        info!("Server cleanup complete");
    }
}

/// Errors that can occur in server operations.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("Failed to setup socket at {path}: {error}")]
    SocketSetup { path: PathBuf, error: String },

    #[error("Connection error: {0}")]
    Connection(#[from] ConnectionError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    #[test]
    fn test_server_error_display() {
        let err = ServerError::SocketSetup {
            path: PathBuf::from("/tmp/test.sock"),
            error: "permission denied".to_string(),
        };
        assert!(err.to_string().contains("/tmp/test.sock"));
        assert!(err.to_string().contains("permission denied"));
    }

    #[tokio::test]
    async fn test_bind_replaces_stale_socket_and_cleans_up() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("np.sock");
        let (tx, _rx) = mpsc::channel(1);
        let cancel = CancellationToken::new();
        let server = DaemonServer::new(&path, TrackerHandle::new(tx), cancel.clone());

        drop(server.bind().unwrap());
        assert!(path.exists());

        // A leftover socket file must not prevent the next bind.
        let listener = server.bind().unwrap();
        cancel.cancel();
        server.serve(listener).await;
        assert!(!path.exists());
    }
}
