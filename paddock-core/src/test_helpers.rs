//! Test fixtures shared across paddock-core tests.

use crate::models::{Device, DeviceId, DeviceType, Horse, UserId};

/// Test fixture builder for Horse
pub struct HorseFixture {
    name: String,
    owner_id: Option<UserId>,
    feeder_id: Option<DeviceId>,
    camera_id: Option<DeviceId>,
}

impl HorseFixture {
    pub fn new() -> Self {
        Self {
            name: "Test Horse".to_string(),
            owner_id: Some(UserId::new()),
            feeder_id: None,
            camera_id: None,
        }
    }

    pub fn with_name(mut self, name: &str) -> Self {
        self.name = name.to_string();
        self
    }

    pub fn with_owner(mut self, owner_id: Option<UserId>) -> Self {
        self.owner_id = owner_id;
        self
    }

    pub fn with_feeder(mut self, feeder_id: DeviceId) -> Self {
        self.feeder_id = Some(feeder_id);
        self
    }

    pub fn with_camera(mut self, camera_id: DeviceId) -> Self {
        self.camera_id = Some(camera_id);
        self
    }

    pub fn build(self) -> Horse {
        let mut horse = Horse::new(self.name, self.owner_id);
        horse.feeder_id = self.feeder_id;
        horse.camera_id = self.camera_id;
        horse
    }
}

impl Default for HorseFixture {
    fn default() -> Self {
        Self::new()
    }
}

/// Test fixture builder for Device
pub struct DeviceFixture {
    thing_name: String,
    device_type: DeviceType,
}

impl DeviceFixture {
    pub fn camera() -> Self {
        Self {
            thing_name: "test-camera".to_string(),
            device_type: DeviceType::Camera,
        }
    }

    pub fn feeder() -> Self {
        Self {
            thing_name: "test-feeder".to_string(),
            device_type: DeviceType::Feeder,
        }
    }

    pub fn with_thing_name(mut self, thing_name: &str) -> Self {
        self.thing_name = thing_name.to_string();
        self
    }

    pub fn build(self) -> Device {
        Device::new(self.thing_name, self.device_type)
    }
}

