//! Inbound topic parsing.
//!
//! Topic shape: `{feeders|cameras}/{thingName}/{events|weight-events}`.
//! The device class is fixed by the topic before any payload decoding, so an
//! event's type is never inferred from which optional fields happen to be
//! present.

use crate::models::DeviceType;

/// Device class segment of a topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceClass {
    Feeders,
    Cameras,
}

impl DeviceClass {
    /// The registered device type this topic class must match.
    #[must_use]
    pub const fn expected_device_type(&self) -> DeviceType {
        match self {
            Self::Feeders => DeviceType::Feeder,
            Self::Cameras => DeviceType::Camera,
        }
    }

    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Feeders => "feeders",
            Self::Cameras => "cameras",
        }
    }
}

/// Event channel segment of a topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventChannel {
    /// Lifecycle events: `{type, feedingId?, horseId, errorMessage?}` JSON.
    Events,
    /// Telemetry: a JSON `{weight}` or a bare numeric string.
    WeightEvents,
}

/// A parsed inbound topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedTopic {
    pub class: DeviceClass,
    pub thing_name: String,
    pub channel: EventChannel,
}

impl ParsedTopic {
    /// Parse `{deviceClass}/{thingName}/{channel}`; anything else is None.
    #[must_use]
    pub fn parse(topic: &str) -> Option<Self> {
        let mut parts = topic.split('/');
        let class = match parts.next()? {
            "feeders" => DeviceClass::Feeders,
            "cameras" => DeviceClass::Cameras,
            _ => return None,
        };

        let thing_name = parts.next()?;
        if thing_name.is_empty() {
            return None;
        }

        let channel = match parts.next()? {
            "events" => EventChannel::Events,
            "weight-events" if class == DeviceClass::Feeders => EventChannel::WeightEvents,
            _ => return None,
        };

        if parts.next().is_some() {
            return None;
        }

        Some(Self {
            class,
            thing_name: thing_name.to_string(),
            channel,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_feeder_events() {
        let topic = ParsedTopic::parse("feeders/feeder-01/events").expect("parse");
        assert_eq!(topic.class, DeviceClass::Feeders);
        assert_eq!(topic.thing_name, "feeder-01");
        assert_eq!(topic.channel, EventChannel::Events);
    }

    #[test]
    fn test_parse_camera_events() {
        let topic = ParsedTopic::parse("cameras/cam-3/events").expect("parse");
        assert_eq!(topic.class, DeviceClass::Cameras);
        assert_eq!(topic.class.expected_device_type(), DeviceType::Camera);
    }

    #[test]
    fn test_parse_weight_events() {
        let topic = ParsedTopic::parse("feeders/feeder-01/weight-events").expect("parse");
        assert_eq!(topic.channel, EventChannel::WeightEvents);
    }

    #[test]
    fn test_rejects_malformed_topics() {
        assert!(ParsedTopic::parse("thermostats/t1/events").is_none());
        assert!(ParsedTopic::parse("feeders/events").is_none());
        assert!(ParsedTopic::parse("feeders//events").is_none());
        assert!(ParsedTopic::parse("feeders/f1/commands").is_none());
        assert!(ParsedTopic::parse("cameras/cam-1/weight-events").is_none());
        assert!(ParsedTopic::parse("feeders/f1/events/extra").is_none());
        assert!(ParsedTopic::parse("").is_none());
    }
}
