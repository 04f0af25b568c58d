//! WebSocket hub: the client notification transport.
//!
//! Holds one bounded outbound channel per live connection. Delivery is
//! best-effort: a full channel means the client is too slow and the message
//! is dropped, never buffered unboundedly. Room-addressed pushes resolve
//! membership through the subscription manager's room index.

use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::{Arc, OnceLock};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use paddock_core::models::ConnectionId;
use paddock_core::service::{ClientEvent, ClientNotifier, SubscriptionLifecycleManager};
use paddock_core::{Error, Result};

/// Outbound buffer per connection; beyond this the client is too slow and
/// messages are dropped.
const CONNECTION_BUFFER: usize = 1000;

pub struct WsHub {
    connections: DashMap<ConnectionId, mpsc::Sender<String>>,
    rooms: OnceLock<Arc<SubscriptionLifecycleManager>>,
}

impl WsHub {
    #[must_use]
    pub fn new() -> Self {
        Self {
            connections: DashMap::new(),
            rooms: OnceLock::new(),
        }
    }

    /// Wire the room index. Two-phase: the subscription manager is built
    /// before the hub, the hub before the services that notify through it.
    pub fn attach_rooms(&self, subscriptions: Arc<SubscriptionLifecycleManager>) {
        let _ = self.rooms.set(subscriptions);
    }

    /// Register a connection and hand back the receiving end of its
    /// outbound channel.
    #[must_use]
    pub fn register(&self, connection: ConnectionId) -> mpsc::Receiver<String> {
        let (tx, rx) = mpsc::channel(CONNECTION_BUFFER);
        self.connections.insert(connection, tx);
        rx
    }

    pub fn unregister(&self, connection: &ConnectionId) {
        self.connections.remove(connection);
    }

    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Push one event to one connection.
    pub fn send_to_connection(&self, connection: &ConnectionId, event: &ClientEvent) -> Result<()> {
        let payload = serde_json::to_string(event)?;
        self.send_text(connection, payload);
        Ok(())
    }

    /// Push a pre-serialized message to one connection.
    pub fn send_text(&self, connection: &ConnectionId, payload: String) {
        let Some(sender) = self.connections.get(connection) else {
            return;
        };
        if let Err(e) = sender.try_send(payload) {
            // Slow or closed client; the message is dropped, the read loop
            // notices the close separately.
            debug!(connection_id = %connection, error = %e, "client push dropped");
        }
    }
}

#[async_trait]
impl ClientNotifier for WsHub {
    async fn broadcast(&self, event: ClientEvent) -> Result<()> {
        let payload = serde_json::to_string(&event)?;
        for entry in &self.connections {
            if let Err(e) = entry.value().try_send(payload.clone()) {
                debug!(connection_id = %entry.key(), error = %e, "broadcast push dropped");
            }
        }
        Ok(())
    }

    async fn emit_to_room(&self, room: &str, event: ClientEvent) -> Result<()> {
        let Some(subscriptions) = self.rooms.get() else {
            warn!(room, "room index not attached, push dropped");
            return Err(Error::Internal("Room index not attached".to_string()));
        };

        let payload = serde_json::to_string(&event)?;
        for connection in subscriptions.members(room) {
            self.send_text(&connection, payload.clone());
        }
        Ok(())
    }
}

impl Default for WsHub {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for WsHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WsHub")
            .field("connections", &self.connections.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use paddock_core::models::{HorseId, UserId};
    use paddock_core::service::StreamPhase;

    #[tokio::test]
    async fn test_broadcast_reaches_every_connection() {
        let hub = WsHub::new();
        let conn_a = ConnectionId::new();
        let conn_b = ConnectionId::new();
        let mut rx_a = hub.register(conn_a);
        let mut rx_b = hub.register(conn_b);

        hub.broadcast(ClientEvent::StreamStatus {
            horse_id: HorseId::new(),
            status: StreamPhase::Pending,
            stream_url: None,
            error_message: None,
        })
        .await
        .expect("broadcast");

        assert!(rx_a.try_recv().expect("a").contains("STREAM_STATUS"));
        assert!(rx_b.try_recv().expect("b").contains("STREAM_STATUS"));
    }

    #[tokio::test]
    async fn test_unregistered_connection_receives_nothing() {
        let hub = WsHub::new();
        let conn = ConnectionId::new();
        let mut rx = hub.register(conn.clone());
        hub.unregister(&conn);

        hub.broadcast(ClientEvent::AuthSuccess {
            user_id: UserId::new(),
            connection_id: conn,
        })
        .await
        .expect("broadcast");

        assert!(rx.try_recv().is_err());
    }
}
