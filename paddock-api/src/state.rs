use std::sync::Arc;

use paddock_core::repository::{DeviceRepository, HorseRepository, UserRepository};
use paddock_core::service::{
    FeedingCoordinator, FrameRelay, StreamSessionManager, SubscriptionLifecycleManager,
};
use paddock_core::Config;

use crate::ws::hub::WsHub;

/// Shared handles for HTTP and WebSocket handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub relay: Arc<FrameRelay>,
    pub subscriptions: Arc<SubscriptionLifecycleManager>,
    pub stream_sessions: Arc<StreamSessionManager>,
    pub feeding_coordinator: Arc<FeedingCoordinator>,
    pub hub: Arc<WsHub>,
    pub horses: HorseRepository,
    pub devices: DeviceRepository,
    pub users: UserRepository,
}
