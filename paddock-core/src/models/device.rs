use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

use super::id::DeviceId;

/// Physical device class.
///
/// A horse may have at most one of each assigned; the type also selects the
/// transport topic family (`feeders/...` vs `cameras/...`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeviceType {
    Feeder,
    Camera,
}

impl DeviceType {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Feeder => "FEEDER",
            Self::Camera => "CAMERA",
        }
    }

    /// Topic prefix for this device class (`feeders` / `cameras`).
    #[must_use]
    pub const fn topic_prefix(&self) -> &'static str {
        match self {
            Self::Feeder => "feeders",
            Self::Camera => "cameras",
        }
    }
}

impl FromStr for DeviceType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "FEEDER" => Ok(Self::Feeder),
            "CAMERA" => Ok(Self::Camera),
            _ => Err(format!("Unknown device type: {s}")),
        }
    }
}

impl std::fmt::Display for DeviceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A registered physical device.
///
/// `thing_name` is the stable physical identifier used as the transport topic
/// key. The stream-token fields are only meaningful for cameras: the token
/// itself is never stored, only its SHA-256 hash plus a validity flag.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Device {
    pub id: DeviceId,
    pub thing_name: String,
    pub device_type: DeviceType,
    #[serde(skip_serializing)]
    pub stream_token_hash: Option<String>,
    pub stream_token_valid: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Device {
    #[must_use]
    pub fn new(thing_name: String, device_type: DeviceType) -> Self {
        let now = Utc::now();
        Self {
            id: DeviceId::new(),
            thing_name,
            device_type,
            stream_token_hash: None,
            stream_token_valid: false,
            created_at: now,
            updated_at: now,
        }
    }

    #[must_use]
    pub const fn is_camera(&self) -> bool {
        matches!(self.device_type, DeviceType::Camera)
    }

    #[must_use]
    pub const fn is_feeder(&self) -> bool {
        matches!(self.device_type, DeviceType::Feeder)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_type_round_trip() {
        assert_eq!("FEEDER".parse::<DeviceType>().ok(), Some(DeviceType::Feeder));
        assert_eq!("camera".parse::<DeviceType>().ok(), Some(DeviceType::Camera));
        assert!("THERMOSTAT".parse::<DeviceType>().is_err());
    }

    #[test]
    fn test_topic_prefix() {
        assert_eq!(DeviceType::Feeder.topic_prefix(), "feeders");
        assert_eq!(DeviceType::Camera.topic_prefix(), "cameras");
    }

    #[test]
    fn test_new_device_has_no_token() {
        let device = crate::test_helpers::DeviceFixture::feeder()
            .with_thing_name("feeder-01")
            .build();
        assert_eq!(device.thing_name, "feeder-01");
        assert!(device.stream_token_hash.is_none());
        assert!(!device.stream_token_valid);
    }
}
