//! Telemetry subscription rooms and debounced stop dispatch.
//!
//! Rooms are keyed by feeder thing name and exist only while membership is
//! nonzero. A 0->1 membership transition dispatches start-telemetry exactly
//! once; a drop to 0 dispatches stop-telemetry either immediately (explicit
//! logout) or after a grace window (passive disconnect). Deferred stops are
//! explicit cancelable tasks keyed by room, with a membership re-check at
//! fire time as the backstop.
//!
//! The same debounce governs auto-stopping a user's active camera stream
//! once their last connection has been gone for the grace window.
//!
//! All state here is process-local and does not survive restart or
//! coordinate across instances; scale-out needs sticky connection routing.

use dashmap::DashMap;
use std::collections::HashSet;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::models::{ConnectionId, UserId};
use crate::service::stream_session::StreamSessionManager;
use crate::transport::{CommandTransport, DeviceCommand};

pub struct SubscriptionLifecycleManager {
    transport: Arc<dyn CommandTransport>,
    stream_sessions: OnceLock<Arc<StreamSessionManager>>,
    grace: Duration,

    rooms: DashMap<String, HashSet<ConnectionId>>,
    connection_rooms: DashMap<ConnectionId, HashSet<String>>,
    user_connections: DashMap<UserId, HashSet<ConnectionId>>,
    connection_users: DashMap<ConnectionId, UserId>,

    pending_room_stops: DashMap<String, CancellationToken>,
    pending_user_stops: DashMap<UserId, CancellationToken>,
}

impl SubscriptionLifecycleManager {
    #[must_use]
    pub fn new(transport: Arc<dyn CommandTransport>, grace: Duration) -> Self {
        Self {
            transport,
            stream_sessions: OnceLock::new(),
            grace,
            rooms: DashMap::new(),
            connection_rooms: DashMap::new(),
            user_connections: DashMap::new(),
            connection_users: DashMap::new(),
            pending_room_stops: DashMap::new(),
            pending_user_stops: DashMap::new(),
        }
    }

    /// Wire the stream-session manager for deferred stream auto-stop.
    ///
    /// Two-phase wiring: the notifier hub needs this manager's room index
    /// before the stream-session manager can be built.
    pub fn set_stream_sessions(&self, stream_sessions: Arc<StreamSessionManager>) {
        let _ = self.stream_sessions.set(stream_sessions);
    }

    /// Track a fresh client connection.
    ///
    /// A reconnect within the grace window cancels any pending stream
    /// auto-stop for the user.
    pub fn register_connection(&self, connection: ConnectionId, user: UserId) {
        if let Some((_, token)) = self.pending_user_stops.remove(&user) {
            token.cancel();
            debug!(user_id = %user, "stream auto-stop canceled by reconnect");
        }

        self.user_connections
            .entry(user.clone())
            .or_default()
            .insert(connection.clone());
        self.connection_users.insert(connection, user);
    }

    /// Add a connection to a device's telemetry room.
    ///
    /// A 0->1 membership transition dispatches start-telemetry exactly once
    /// and cancels any pending deferred stop for the room.
    pub async fn join(&self, connection: &ConnectionId, thing_name: &str) {
        let was_empty = {
            let mut room = self.rooms.entry(thing_name.to_string()).or_default();
            let was_empty = room.is_empty();
            room.insert(connection.clone());
            was_empty
        };
        self.connection_rooms
            .entry(connection.clone())
            .or_default()
            .insert(thing_name.to_string());

        if !was_empty {
            return;
        }

        if let Some((_, token)) = self.pending_room_stops.remove(thing_name) {
            token.cancel();
            debug!(thing_name, "deferred stop canceled by rejoin");
        }

        if let Err(e) = self
            .transport
            .publish(thing_name, DeviceCommand::WeightStreamStart)
            .await
        {
            warn!(thing_name, error = %e, "start-telemetry dispatch failed");
        } else {
            info!(thing_name, "telemetry started for first watcher");
        }
    }

    /// Explicit logout: remove the connection from all its rooms and stop
    /// telemetry synchronously for every room it was the sole member of.
    ///
    /// Returns the stopped thing names (the LOGOUT acknowledgment payload).
    pub async fn leave_immediate(&self, connection: &ConnectionId) -> Vec<String> {
        let emptied = self.remove_from_rooms(connection);

        let mut stopped = Vec::with_capacity(emptied.len());
        for thing_name in emptied {
            if let Err(e) = self
                .transport
                .publish(&thing_name, DeviceCommand::WeightStreamStop)
                .await
            {
                warn!(thing_name = %thing_name, error = %e, "stop-telemetry dispatch failed");
            }
            stopped.push(thing_name);
        }
        stopped
    }

    /// Passive disconnect: remove the connection from all its rooms and
    /// schedule a deferred stop for every room that dropped to zero members.
    pub fn leave_deferred(self: &Arc<Self>, connection: &ConnectionId) {
        // Immutable snapshot of the emptied rooms; each gets its own
        // cancelable timer.
        let emptied = self.remove_from_rooms(connection);
        for thing_name in emptied {
            self.schedule_room_stop(thing_name);
        }
    }

    /// Untrack a closed connection; when it was the user's last one,
    /// schedule the deferred stream auto-stop.
    pub fn unregister_connection(self: &Arc<Self>, connection: &ConnectionId) {
        let Some((_, user)) = self.connection_users.remove(connection) else {
            return;
        };

        let user_idle = {
            let Some(mut conns) = self.user_connections.get_mut(&user) else {
                return;
            };
            conns.remove(connection);
            conns.is_empty()
        };
        if user_idle {
            self.user_connections.remove(&user);
            self.schedule_stream_auto_stop(user);
        }
    }

    /// Current members of a room; empty when the room does not exist.
    #[must_use]
    pub fn members(&self, thing_name: &str) -> Vec<ConnectionId> {
        self.rooms
            .get(thing_name)
            .map(|room| room.iter().cloned().collect())
            .unwrap_or_default()
    }

    #[must_use]
    pub fn room_size(&self, thing_name: &str) -> usize {
        self.rooms.get(thing_name).map_or(0, |room| room.len())
    }

    /// Remove the connection from every room it belongs to; returns the
    /// rooms it was the sole member of (now removed entirely).
    fn remove_from_rooms(&self, connection: &ConnectionId) -> Vec<String> {
        let Some((_, joined)) = self.connection_rooms.remove(connection) else {
            return Vec::new();
        };

        let mut emptied = Vec::new();
        for thing_name in joined {
            let now_empty = {
                let Some(mut room) = self.rooms.get_mut(&thing_name) else {
                    continue;
                };
                room.remove(connection);
                room.is_empty()
            };
            if now_empty {
                // Rooms exist iff membership > 0
                self.rooms.remove(&thing_name);
                emptied.push(thing_name);
            }
        }
        emptied
    }

    fn schedule_room_stop(self: &Arc<Self>, thing_name: String) {
        let token = CancellationToken::new();
        if let Some(previous) = self
            .pending_room_stops
            .insert(thing_name.clone(), token.clone())
        {
            previous.cancel();
        }

        let this = Arc::clone(self);
        tokio::spawn(async move {
            tokio::select! {
                () = token.cancelled() => {}
                () = tokio::time::sleep(this.grace) => {
                    this.pending_room_stops.remove(&thing_name);
                    // Re-check at fire time: a join that raced the cancel
                    // leaves the room nonempty and the stop is skipped.
                    if this.room_size(&thing_name) > 0 {
                        return;
                    }
                    if let Err(e) = this
                        .transport
                        .publish(&thing_name, DeviceCommand::WeightStreamStop)
                        .await
                    {
                        warn!(thing_name = %thing_name, error = %e, "deferred stop-telemetry dispatch failed");
                    } else {
                        info!(thing_name = %thing_name, "telemetry stopped after grace window");
                    }
                }
            }
        });
    }

    fn schedule_stream_auto_stop(self: &Arc<Self>, user: UserId) {
        let token = CancellationToken::new();
        if let Some(previous) = self.pending_user_stops.insert(user.clone(), token.clone()) {
            previous.cancel();
        }

        let this = Arc::clone(self);
        tokio::spawn(async move {
            tokio::select! {
                () = token.cancelled() => {}
                () = tokio::time::sleep(this.grace) => {
                    this.pending_user_stops.remove(&user);
                    if this.user_connections.contains_key(&user) {
                        return;
                    }
                    let Some(stream_sessions) = this.stream_sessions.get() else {
                        return;
                    };
                    match stream_sessions.stop_active_stream(&user).await {
                        Ok(Some(horse_id)) => {
                            info!(user_id = %user, horse_id = %horse_id, "stream auto-stopped after grace window");
                        }
                        Ok(None) => {}
                        Err(e) => {
                            warn!(user_id = %user, error = %e, "stream auto-stop failed");
                        }
                    }
                }
            }
        });
    }
}

impl std::fmt::Debug for SubscriptionLifecycleManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionLifecycleManager")
            .field("rooms", &self.rooms.len())
            .field("grace", &self.grace)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MockCommandTransport;

    const GRACE: Duration = Duration::from_secs(5);

    fn manager(transport: MockCommandTransport) -> Arc<SubscriptionLifecycleManager> {
        Arc::new(SubscriptionLifecycleManager::new(
            Arc::new(transport),
            GRACE,
        ))
    }

    fn expect_publish(
        mock: &mut MockCommandTransport,
        thing_name: &str,
        command: DeviceCommand,
        times: usize,
    ) {
        let thing_name = thing_name.to_string();
        mock.expect_publish()
            .withf(move |t, c| t == thing_name.as_str() && *c == command)
            .times(times)
            .returning(|_, _| Ok(()));
    }

    async fn settle(duration: Duration) {
        // Paused-clock advance; lets spawned grace timers fire.
        tokio::time::sleep(duration).await;
        tokio::task::yield_now().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_join_dispatches_start_once() {
        let mut mock = MockCommandTransport::new();
        expect_publish(&mut mock, "feeder-01", DeviceCommand::WeightStreamStart, 1);
        let manager = manager(mock);

        let (a, b) = (ConnectionId::new(), ConnectionId::new());
        manager.join(&a, "feeder-01").await;
        // Second watcher: no new start
        manager.join(&b, "feeder-01").await;

        assert_eq!(manager.room_size("feeder-01"), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deferred_stop_fires_after_grace_window() {
        let mut mock = MockCommandTransport::new();
        expect_publish(&mut mock, "feeder-01", DeviceCommand::WeightStreamStart, 1);
        expect_publish(&mut mock, "feeder-01", DeviceCommand::WeightStreamStop, 1);
        let manager = manager(mock);

        let conn = ConnectionId::new();
        manager.join(&conn, "feeder-01").await;
        manager.leave_deferred(&conn);

        settle(GRACE + Duration::from_millis(10)).await;
        assert_eq!(manager.room_size("feeder-01"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejoin_within_grace_cancels_stop() {
        let mut mock = MockCommandTransport::new();
        // Two 0->1 transitions, two starts; zero stops
        expect_publish(&mut mock, "feeder-01", DeviceCommand::WeightStreamStart, 2);
        expect_publish(&mut mock, "feeder-01", DeviceCommand::WeightStreamStop, 0);
        let manager = manager(mock);

        let conn = ConnectionId::new();
        manager.join(&conn, "feeder-01").await;
        manager.leave_deferred(&conn);

        settle(GRACE / 2).await;
        let reconnected = ConnectionId::new();
        manager.join(&reconnected, "feeder-01").await;

        settle(GRACE * 2).await;
        assert_eq!(manager.room_size("feeder-01"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_leave_immediate_stops_sole_member_rooms_synchronously() {
        let mut mock = MockCommandTransport::new();
        expect_publish(&mut mock, "feeder-01", DeviceCommand::WeightStreamStart, 1);
        expect_publish(&mut mock, "feeder-02", DeviceCommand::WeightStreamStart, 1);
        expect_publish(&mut mock, "feeder-01", DeviceCommand::WeightStreamStop, 1);
        // feeder-02 still has a watcher, no stop
        expect_publish(&mut mock, "feeder-02", DeviceCommand::WeightStreamStop, 0);
        let manager = manager(mock);

        let (leaver, stayer) = (ConnectionId::new(), ConnectionId::new());
        manager.join(&leaver, "feeder-01").await;
        manager.join(&leaver, "feeder-02").await;
        manager.join(&stayer, "feeder-02").await;

        let stopped = manager.leave_immediate(&leaver).await;
        assert_eq!(stopped, vec!["feeder-01".to_string()]);
        assert_eq!(manager.room_size("feeder-02"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shared_room_does_not_stop_until_last_member_leaves() {
        let mut mock = MockCommandTransport::new();
        expect_publish(&mut mock, "feeder-01", DeviceCommand::WeightStreamStart, 1);
        expect_publish(&mut mock, "feeder-01", DeviceCommand::WeightStreamStop, 1);
        let manager = manager(mock);

        let (a, b) = (ConnectionId::new(), ConnectionId::new());
        manager.join(&a, "feeder-01").await;
        manager.join(&b, "feeder-01").await;

        manager.leave_deferred(&a);
        settle(GRACE * 2).await;
        // b still watching: nothing stopped
        assert_eq!(manager.room_size("feeder-01"), 1);

        manager.leave_deferred(&b);
        settle(GRACE * 2).await;
        assert_eq!(manager.room_size("feeder-01"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_cancels_pending_user_auto_stop() {
        let manager = manager(MockCommandTransport::new());

        let user = UserId::new();
        let conn = ConnectionId::new();
        manager.register_connection(conn.clone(), user.clone());
        manager.unregister_connection(&conn);
        assert_eq!(manager.pending_user_stops.len(), 1);

        // Reconnect within the window cancels the pending auto-stop
        let conn2 = ConnectionId::new();
        manager.register_connection(conn2, user);
        assert_eq!(manager.pending_user_stops.len(), 0);

        settle(GRACE * 2).await;
    }
}
