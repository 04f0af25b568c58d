//! Client notification seam.
//!
//! Events pushed to connected web clients. The transport itself (a WebSocket
//! hub) lives outside the core; services depend only on the trait. Delivery
//! is best-effort: a failed notification never rolls back persisted state.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::models::{ConnectionId, FeedingId, FeedingStatus, HorseId, UserId};
use crate::Result;

/// Stream session phase reported to clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StreamPhase {
    Pending,
    Started,
    Error,
}

/// Server->client push events.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ClientEvent {
    #[serde(rename = "FEEDING_STATUS", rename_all = "camelCase")]
    FeedingStatus {
        horse_id: HorseId,
        feeding_id: FeedingId,
        status: FeedingStatus,
        #[serde(skip_serializing_if = "Option::is_none")]
        error_message: Option<String>,
    },
    #[serde(rename = "STREAM_STATUS", rename_all = "camelCase")]
    StreamStatus {
        horse_id: HorseId,
        status: StreamPhase,
        #[serde(skip_serializing_if = "Option::is_none")]
        stream_url: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error_message: Option<String>,
    },
    #[serde(rename = "FEEDER_WEIGHT", rename_all = "camelCase")]
    FeederWeight { thing_name: String, weight: f64 },
    #[serde(rename = "AUTH_SUCCESS", rename_all = "camelCase")]
    AuthSuccess {
        user_id: UserId,
        connection_id: ConnectionId,
    },
    #[serde(rename = "ERROR")]
    Error { message: String },
}

/// Client notification transport.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ClientNotifier: Send + Sync {
    /// Push an event to every connected client.
    async fn broadcast(&self, event: ClientEvent) -> Result<()>;

    /// Push an event to the members of one subscription room.
    async fn emit_to_room(&self, room: &str, event: ClientEvent) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_feeding_status_wire_format() {
        let event = ClientEvent::FeedingStatus {
            horse_id: HorseId::from_string("horse0000001".to_string()),
            feeding_id: FeedingId::from_string("feed00000001".to_string()),
            status: FeedingStatus::Completed,
            error_message: None,
        };

        let json = serde_json::to_value(&event).expect("serialize");
        assert_eq!(json["type"], "FEEDING_STATUS");
        assert_eq!(json["horseId"], "horse0000001");
        assert_eq!(json["feedingId"], "feed00000001");
        assert_eq!(json["status"], "COMPLETED");
        assert!(json.get("errorMessage").is_none());
    }

    #[test]
    fn test_stream_status_wire_format() {
        let event = ClientEvent::StreamStatus {
            horse_id: HorseId::from_string("horse0000001".to_string()),
            status: StreamPhase::Started,
            stream_url: Some("/stream/abc".to_string()),
            error_message: None,
        };

        let json = serde_json::to_value(&event).expect("serialize");
        assert_eq!(json["type"], "STREAM_STATUS");
        assert_eq!(json["status"], "STARTED");
        assert_eq!(json["streamUrl"], "/stream/abc");
    }

    #[test]
    fn test_feeder_weight_wire_format() {
        let event = ClientEvent::FeederWeight {
            thing_name: "feeder-01".to_string(),
            weight: 12.4,
        };

        let json = serde_json::to_value(&event).expect("serialize");
        assert_eq!(json["type"], "FEEDER_WEIGHT");
        assert_eq!(json["thingName"], "feeder-01");
        assert_eq!(json["weight"], 12.4);
    }
}
