//! Localhost stats endpoint.
//!
//! A TCP listener on `127.0.0.1`. Every accepted connection receives one
//! JSON line with the current [`TrackerStats`](netprobe_core::TrackerStats)
//! and is closed, so `nc 127.0.0.1 <port>` is enough to inspect a daemon.

use std::net::{Ipv4Addr, SocketAddr};

use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::tracker::TrackerHandle;

#[derive(Debug, thiserror::Error)]
pub enum IntrospectionError {
    #[error("failed to bind introspection port {port}: {error}")]
    Bind { port: u16, error: String },
}

/// Binds the listener. Port 0 picks a free port.
pub async fn bind(port: u16) -> Result<TcpListener, IntrospectionError> {
    TcpListener::bind(SocketAddr::from((Ipv4Addr::LOCALHOST, port)))
        .await
        .map_err(|e| IntrospectionError::Bind {
            port,
            error: e.to_string(),
        })
}

/// Serves stats until cancelled.
pub async fn serve(listener: TcpListener, tracker: TrackerHandle, cancel_token: CancellationToken) {
    if let Ok(addr) = listener.local_addr() {
        info!(addr = %addr, "Introspection listener started");
    }

    loop {
        tokio::select! {
            _ = cancel_token.cancelled() => {
                debug!("Introspection listener shutting down");
                break;
            }

            result = listener.accept() => match result {
                Ok((stream, peer)) => {
                    let tracker = tracker.clone();
                    tokio::spawn(async move {
                        if let Err(e) = respond(stream, &tracker).await {
                            debug!(peer = %peer, error = %e, "Introspection response failed");
                        }
                    });
                }
                Err(e) => warn!(error = %e, "Failed to accept introspection connection"),
            },
        }
    }
}

async fn respond(mut stream: TcpStream, tracker: &TrackerHandle) -> std::io::Result<()> {
    let body = match tracker.get_stats().await {
        Ok(stats) => serde_json::to_string(&stats)?,
        Err(e) => serde_json::json!({ "error": e.to_string() }).to_string(),
    };
    stream.write_all(body.as_bytes()).await?;
    stream.write_all(b"\n").await?;
    stream.shutdown().await
}
