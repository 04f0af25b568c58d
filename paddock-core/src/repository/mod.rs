pub mod device;
pub mod feeding;
pub mod horse;
pub mod user;

pub use device::DeviceRepository;
pub use feeding::FeedingRepository;
pub use horse::HorseRepository;
pub use user::UserRepository;
