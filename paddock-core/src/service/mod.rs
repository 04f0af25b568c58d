pub mod event_router;
pub mod feeding;
pub mod frame_relay;
pub mod notify;
pub mod stream_session;
pub mod subscription;

pub use event_router::DeviceEventRouter;
pub use feeding::{FeedingCoordinator, StartedFeeding};
pub use frame_relay::FrameRelay;
pub use notify::{ClientEvent, ClientNotifier, StreamPhase};
pub use stream_session::{StreamSessionManager, StreamTokenClaims};
pub use subscription::SubscriptionLifecycleManager;
