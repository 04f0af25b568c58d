use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::id::{DeviceId, HorseId, UserId};

/// A horse and its device assignments.
///
/// Each device assignment is unique across horses (a feeder or camera serves
/// at most one horse). `owner_id` is None for unowned horses.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Horse {
    pub id: HorseId,
    pub name: String,
    pub owner_id: Option<UserId>,
    pub feeder_id: Option<DeviceId>,
    pub camera_id: Option<DeviceId>,
    pub last_feed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Horse {
    #[must_use]
    pub fn new(name: String, owner_id: Option<UserId>) -> Self {
        let now = Utc::now();
        Self {
            id: HorseId::new(),
            name,
            owner_id,
            feeder_id: None,
            camera_id: None,
            last_feed_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[must_use]
    pub fn is_owned_by(&self, user_id: &UserId) -> bool {
        self.owner_id.as_ref() == Some(user_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::{DeviceFixture, HorseFixture};

    #[test]
    fn test_ownership_check() {
        let owner = UserId::new();
        let horse = HorseFixture::new()
            .with_name("Willow")
            .with_owner(Some(owner.clone()))
            .build();
        assert!(horse.is_owned_by(&owner));
        assert!(!horse.is_owned_by(&UserId::new()));
    }

    #[test]
    fn test_unowned_horse() {
        let horse = HorseFixture::new().with_owner(None).build();
        assert!(!horse.is_owned_by(&UserId::new()));
    }

    #[test]
    fn test_device_assignments() {
        let camera = DeviceFixture::camera().build();
        let feeder = DeviceFixture::feeder().build();
        let horse = HorseFixture::new()
            .with_camera(camera.id.clone())
            .with_feeder(feeder.id.clone())
            .build();
        assert_eq!(horse.camera_id, Some(camera.id));
        assert_eq!(horse.feeder_id, Some(feeder.id));
    }
}
