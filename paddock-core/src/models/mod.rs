pub mod device;
pub mod feeding;
pub mod horse;
pub mod id;
pub mod user;

pub use device::{Device, DeviceType};
pub use feeding::{Feeding, FeedingStatus};
pub use horse::Horse;
pub use id::{generate_id, ConnectionId, DeviceId, FeedingId, HorseId, UserId};
pub use user::User;
