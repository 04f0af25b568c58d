//! Device command/event transport.
//!
//! Outbound commands are published by topic with at-least-once intent and no
//! delivery acknowledgment; publish failures are logged by callers, never
//! retried. Inbound events arrive on the same broker and are handed to an
//! [`EventSink`] (the device event router).

pub mod mqtt;
pub mod topic;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::models::{DeviceType, FeedingId, HorseId};
use crate::Result;

pub use mqtt::{run_event_loop, MqttCommandTransport};
pub use topic::{DeviceClass, EventChannel, ParsedTopic};

/// Commands the server can dispatch to a physical device.
///
/// The variant determines both the wire `type` tag and the topic family the
/// command is published on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum DeviceCommand {
    #[serde(rename = "FEED_COMMAND", rename_all = "camelCase")]
    Feed {
        feeding_id: FeedingId,
        target_kg: f64,
        horse_id: HorseId,
    },
    #[serde(rename = "STREAM_START_COMMAND", rename_all = "camelCase")]
    StreamStart { horse_id: HorseId },
    #[serde(rename = "STREAM_STOP_COMMAND", rename_all = "camelCase")]
    StreamStop { horse_id: HorseId },
    #[serde(rename = "WEIGHT_STREAM_START")]
    WeightStreamStart,
    #[serde(rename = "WEIGHT_STREAM_STOP")]
    WeightStreamStop,
}

impl DeviceCommand {
    /// Topic this command is published on for the given device.
    #[must_use]
    pub fn topic(&self, thing_name: &str) -> String {
        match self {
            Self::Feed { .. } => {
                format!("{}/{thing_name}/commands", DeviceType::Feeder.topic_prefix())
            }
            Self::StreamStart { .. } | Self::StreamStop { .. } => {
                format!("{}/{thing_name}/commands", DeviceType::Camera.topic_prefix())
            }
            Self::WeightStreamStart | Self::WeightStreamStop => format!(
                "{}/{thing_name}/weight-commands",
                DeviceType::Feeder.topic_prefix()
            ),
        }
    }
}

/// Outbound command transport seam.
///
/// At-most-once from the caller's perspective: implementations do not retry
/// and callers do not roll back committed state on failure.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CommandTransport: Send + Sync {
    async fn publish(&self, thing_name: &str, command: DeviceCommand) -> Result<()>;
}

/// Inbound event sink; the device event router implements this.
#[async_trait]
pub trait EventSink: Send + Sync {
    /// Handle one raw broker message. Must never fail: malformed or
    /// mistargeted payloads are dropped with a warning inside.
    async fn handle_message(&self, topic: &str, payload: &[u8]);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_feed_command_wire_format() {
        let cmd = DeviceCommand::Feed {
            feeding_id: FeedingId::from_string("feed00000001".to_string()),
            target_kg: 2.5,
            horse_id: HorseId::from_string("horse0000001".to_string()),
        };

        let json = serde_json::to_value(&cmd).expect("serialize");
        assert_eq!(json["type"], "FEED_COMMAND");
        assert_eq!(json["feedingId"], "feed00000001");
        assert_eq!(json["targetKg"], 2.5);
        assert_eq!(json["horseId"], "horse0000001");
    }

    #[test]
    fn test_command_topics() {
        let horse_id = HorseId::new();
        assert_eq!(
            DeviceCommand::Feed {
                feeding_id: FeedingId::new(),
                target_kg: 1.0,
                horse_id: horse_id.clone(),
            }
            .topic("feeder-01"),
            "feeders/feeder-01/commands"
        );
        assert_eq!(
            DeviceCommand::StreamStart { horse_id: horse_id.clone() }.topic("cam-01"),
            "cameras/cam-01/commands"
        );
        assert_eq!(
            DeviceCommand::StreamStop { horse_id }.topic("cam-01"),
            "cameras/cam-01/commands"
        );
        assert_eq!(
            DeviceCommand::WeightStreamStart.topic("feeder-01"),
            "feeders/feeder-01/weight-commands"
        );
        assert_eq!(
            DeviceCommand::WeightStreamStop.topic("feeder-01"),
            "feeders/feeder-01/weight-commands"
        );
    }
}
