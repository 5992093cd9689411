//! Client interface for interacting with the TrackerActor.
//!
//! The `TrackerHandle` is a cheap-to-clone interface for sending queries to
//! the tracker actor. Channel errors are mapped to `TrackerError::Stopped`.

use tokio::sync::{mpsc, oneshot};

use netprobe_core::{ClientDebugInfo, ClientId, ConnectionList, TrackerStats};

use super::commands::{TrackerCommand, TrackerError};

// ============================================================================
// Tracker Handle
// ============================================================================

/// Handle for querying the tracker actor.
///
/// ```ignore
/// let handle = tracker.handle();
/// let list = handle.get_active_connections(ClientId::parse("agent")?).await?;
/// for record in list.closed() {
///     // ...
/// }
/// ```
#[derive(Clone)]
pub struct TrackerHandle {
    sender: mpsc::Sender<TrackerCommand>,
}

impl TrackerHandle {
    pub fn new(sender: mpsc::Sender<TrackerCommand>) -> Self {
        Self { sender }
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> TrackerCommand,
    ) -> Result<T, TrackerError> {
        let (tx, rx) = oneshot::channel();

        self.sender
            .send(build(tx))
            .await
            .map_err(|_| TrackerError::Stopped)?;

        rx.await.map_err(|_| TrackerError::Stopped)
    }

    /// Active connections plus the closed connections this client has not
    /// seen yet.
    ///
    /// The first call for an identifier registers it.
    ///
    /// # Errors
    ///
    /// - `TrackerError::TooManyClients` if registering would exceed the limit
    /// - `TrackerError::Stopped` if the tracker has shut down
    pub async fn get_active_connections(
        &self,
        client_id: ClientId,
    ) -> Result<ConnectionList, TrackerError> {
        self.request(|respond_to| TrackerCommand::GetActiveConnections {
            client_id,
            respond_to,
        })
        .await?
    }

    /// Raw dump of active connections.
    pub async fn debug_network_maps(&self) -> Result<ConnectionList, TrackerError> {
        self.request(|respond_to| TrackerCommand::DebugNetworkMaps { respond_to })
            .await
    }

    /// Delivery bookkeeping for one client.
    ///
    /// # Errors
    ///
    /// - `TrackerError::ClientNotFound` if the client never polled or expired
    /// - `TrackerError::Stopped` if the tracker has shut down
    pub async fn debug_network_state(
        &self,
        client_id: ClientId,
    ) -> Result<ClientDebugInfo, TrackerError> {
        self.request(|respond_to| TrackerCommand::DebugNetworkState {
            client_id,
            respond_to,
        })
        .await?
    }

    pub async fn get_stats(&self) -> Result<TrackerStats, TrackerError> {
        self.request(|respond_to| TrackerCommand::GetStats { respond_to })
            .await
    }

    /// Triggers client and idle-connection expiry.
    ///
    /// Fire-and-forget; errors are ignored.
    pub async fn maintain(&self) {
        let _ = self.sender.send(TrackerCommand::Maintain).await;
    }

    /// Asks the actor to release its state and exit.
    ///
    /// Returns once the actor has acknowledged, or immediately if it is
    /// already gone.
    pub(crate) async fn stop(&self) {
        let _ = self
            .request(|respond_to| TrackerCommand::Stop { respond_to })
            .await;
    }

    /// Returns `true` while the actor is running.
    pub fn is_running(&self) -> bool {
        !self.sender.is_closed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_test_handle() -> (TrackerHandle, mpsc::Receiver<TrackerCommand>) {
        let (cmd_tx, cmd_rx) = mpsc::channel(16);
        (TrackerHandle::new(cmd_tx), cmd_rx)
    }

    #[tokio::test]
    async fn test_get_active_connections_sends_command() {
        let (handle, mut rx) = create_test_handle();

        let cmd_handler = tokio::spawn(async move {
            if let Some(TrackerCommand::GetActiveConnections {
                client_id,
                respond_to,
            }) = rx.recv().await
            {
                assert_eq!(client_id.as_str(), "agent-1");
                let _ = respond_to.send(Ok(ConnectionList::default()));
                return true;
            }
            false
        });

        let result = handle
            .get_active_connections(ClientId::parse("agent-1").unwrap())
            .await;
        assert!(result.unwrap().is_empty());
        assert!(cmd_handler.await.unwrap());
    }

    #[tokio::test]
    async fn test_error_from_actor_is_passed_through() {
        let (handle, mut rx) = create_test_handle();

        tokio::spawn(async move {
            if let Some(TrackerCommand::DebugNetworkState {
                client_id,
                respond_to,
            }) = rx.recv().await
            {
                let _ = respond_to.send(Err(TrackerError::ClientNotFound(client_id)));
            }
        });

        let id = ClientId::parse("ghost").unwrap();
        let result = handle.debug_network_state(id.clone()).await;
        assert_eq!(result, Err(TrackerError::ClientNotFound(id)));
    }

    #[tokio::test]
    async fn test_channel_closed_maps_to_stopped() {
        let (handle, rx) = create_test_handle();
        drop(rx);

        assert_eq!(handle.get_stats().await, Err(TrackerError::Stopped));
        assert_eq!(
            handle.debug_network_maps().await,
            Err(TrackerError::Stopped)
        );
        assert!(!handle.is_running());
    }

    #[tokio::test]
    async fn test_dropped_responder_maps_to_stopped() {
        let (handle, mut rx) = create_test_handle();

        tokio::spawn(async move {
            // Receive and drop without answering, as a stopping actor would.
            let _ = rx.recv().await;
        });

        assert_eq!(handle.get_stats().await, Err(TrackerError::Stopped));
    }

    #[tokio::test]
    async fn test_maintain_fire_and_forget() {
        let (handle, mut rx) = create_test_handle();
        handle.maintain().await;
        assert!(matches!(rx.recv().await, Some(TrackerCommand::Maintain)));

        drop(rx);
        handle.maintain().await;
    }
}
