//! Inbound device event routing.
//!
//! Single entry point for everything the broker delivers. The topic fixes
//! the device class before any payload decoding, the payload decodes into a
//! tagged event union, and a validation pipeline guards against spoofed or
//! mistargeted messages. Anything malformed is dropped with a warning; no
//! error ever propagates out of [`EventSink::handle_message`], so a bad
//! device cannot take down the event loop.

use async_trait::async_trait;
use serde::Deserialize;
use std::sync::Arc;
use tracing::warn;

use crate::models::{FeedingId, FeedingStatus, HorseId};
use crate::repository::{DeviceRepository, HorseRepository};
use crate::service::feeding::FeedingCoordinator;
use crate::service::notify::{ClientEvent, ClientNotifier};
use crate::service::stream_session::StreamSessionManager;
use crate::transport::{DeviceClass, EventChannel, EventSink, ParsedTopic};
use crate::{Error, Result};

/// Lifecycle events a feeder reports.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type")]
pub enum FeederEvent {
    #[serde(rename = "FEEDING_STARTED", rename_all = "camelCase")]
    Started {
        feeding_id: FeedingId,
        horse_id: HorseId,
    },
    #[serde(rename = "FEEDING_RUNNING", rename_all = "camelCase")]
    Running {
        feeding_id: FeedingId,
        horse_id: HorseId,
    },
    #[serde(rename = "FEEDING_COMPLETED", rename_all = "camelCase")]
    Completed {
        feeding_id: FeedingId,
        horse_id: HorseId,
    },
    #[serde(rename = "FEEDING_ERROR", rename_all = "camelCase")]
    Error {
        feeding_id: FeedingId,
        horse_id: HorseId,
        #[serde(default)]
        error_message: Option<String>,
    },
}

impl FeederEvent {
    const fn feeding_id(&self) -> &FeedingId {
        match self {
            Self::Started { feeding_id, .. }
            | Self::Running { feeding_id, .. }
            | Self::Completed { feeding_id, .. }
            | Self::Error { feeding_id, .. } => feeding_id,
        }
    }

    const fn horse_id(&self) -> &HorseId {
        match self {
            Self::Started { horse_id, .. }
            | Self::Running { horse_id, .. }
            | Self::Completed { horse_id, .. }
            | Self::Error { horse_id, .. } => horse_id,
        }
    }

    const fn target_status(&self) -> FeedingStatus {
        match self {
            Self::Started { .. } => FeedingStatus::Started,
            Self::Running { .. } => FeedingStatus::Running,
            Self::Completed { .. } => FeedingStatus::Completed,
            Self::Error { .. } => FeedingStatus::Failed,
        }
    }
}

/// Lifecycle events a camera reports.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type")]
pub enum CameraEvent {
    #[serde(rename = "STREAM_STARTED", rename_all = "camelCase")]
    StreamStarted { horse_id: HorseId },
    #[serde(rename = "STREAM_ERROR", rename_all = "camelCase")]
    StreamError {
        horse_id: HorseId,
        #[serde(default)]
        error_message: Option<String>,
    },
}

impl CameraEvent {
    const fn horse_id(&self) -> &HorseId {
        match self {
            Self::StreamStarted { horse_id } | Self::StreamError { horse_id, .. } => horse_id,
        }
    }
}

pub struct DeviceEventRouter {
    devices: DeviceRepository,
    horses: HorseRepository,
    feeding_coordinator: Arc<FeedingCoordinator>,
    stream_sessions: Arc<StreamSessionManager>,
    notifier: Arc<dyn ClientNotifier>,
}

impl DeviceEventRouter {
    #[must_use]
    pub fn new(
        devices: DeviceRepository,
        horses: HorseRepository,
        feeding_coordinator: Arc<FeedingCoordinator>,
        stream_sessions: Arc<StreamSessionManager>,
        notifier: Arc<dyn ClientNotifier>,
    ) -> Self {
        Self {
            devices,
            horses,
            feeding_coordinator,
            stream_sessions,
            notifier,
        }
    }

    async fn route(&self, topic: &ParsedTopic, payload: &[u8]) -> Result<()> {
        match topic.channel {
            EventChannel::WeightEvents => self.route_weight(topic, payload).await,
            EventChannel::Events => match topic.class {
                DeviceClass::Feeders => self.route_feeder_event(topic, payload).await,
                DeviceClass::Cameras => self.route_camera_event(topic, payload).await,
            },
        }
    }

    /// Telemetry fan-out: no persistence involved, straight to the room.
    async fn route_weight(&self, topic: &ParsedTopic, payload: &[u8]) -> Result<()> {
        let Some(weight) = parse_weight(payload) else {
            return Err(Error::Validation("Unparsable weight payload".to_string()));
        };

        self.notifier
            .emit_to_room(
                &topic.thing_name,
                ClientEvent::FeederWeight {
                    thing_name: topic.thing_name.clone(),
                    weight,
                },
            )
            .await
    }

    async fn route_feeder_event(&self, topic: &ParsedTopic, payload: &[u8]) -> Result<()> {
        let event: FeederEvent = serde_json::from_slice(payload)?;

        // (1) claimed device exists and is registered as a feeder
        let device = self
            .devices
            .get_by_thing_name(&topic.thing_name)
            .await?
            .filter(|d| d.device_type == topic.class.expected_device_type())
            .ok_or_else(|| Error::NotFound("Not a registered feeder device".to_string()))?;

        // (2) the referenced feeding exists and belongs to this device
        let feeding = self
            .feeding_coordinator
            .get_feeding(event.feeding_id())
            .await?
            .ok_or_else(|| Error::NotFound("Feeding not found".to_string()))?;

        if feeding.device_id != device.id {
            return Err(Error::Forbidden(
                "Feeding does not belong to this device".to_string(),
            ));
        }
        if &feeding.horse_id != event.horse_id() {
            return Err(Error::Validation(
                "Claimed horse does not match the feeding".to_string(),
            ));
        }

        let error_message = match &event {
            FeederEvent::Error { error_message, .. } => error_message.clone(),
            _ => None,
        };

        self.feeding_coordinator
            .apply_event(&feeding, event.target_status(), error_message)
            .await
    }

    async fn route_camera_event(&self, topic: &ParsedTopic, payload: &[u8]) -> Result<()> {
        let event: CameraEvent = serde_json::from_slice(payload)?;

        // (1) claimed device exists and is registered as a camera
        let device = self
            .devices
            .get_by_thing_name(&topic.thing_name)
            .await?
            .filter(|d| d.device_type == topic.class.expected_device_type())
            .ok_or_else(|| Error::NotFound("Not a registered camera device".to_string()))?;

        // (3) a horse is linked to this camera and matches the claim
        let horse = self
            .horses
            .find_by_camera(&device.id)
            .await?
            .filter(|h| &h.id == event.horse_id())
            .ok_or_else(|| Error::NotFound("No matching horse linked to this camera".to_string()))?;

        match event {
            CameraEvent::StreamStarted { .. } => {
                self.stream_sessions
                    .confirm_stream_started(&device, &horse)
                    .await
            }
            CameraEvent::StreamError { error_message, .. } => {
                self.stream_sessions
                    .fail_stream(&device, &horse, error_message)
                    .await
            }
        }
    }
}

#[async_trait]
impl EventSink for DeviceEventRouter {
    async fn handle_message(&self, topic: &str, payload: &[u8]) {
        let Some(parsed) = ParsedTopic::parse(topic) else {
            warn!(topic, "unroutable topic, message dropped");
            return;
        };

        if let Err(e) = self.route(&parsed, payload).await {
            warn!(
                topic,
                thing_name = %parsed.thing_name,
                error = %e,
                "device event dropped"
            );
        }
    }
}

impl std::fmt::Debug for DeviceEventRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceEventRouter").finish()
    }
}

/// Weight payloads arrive as JSON `{weight}` (number or numeric string) or a
/// bare numeric string. Anything non-finite is rejected.
fn parse_weight(payload: &[u8]) -> Option<f64> {
    let text = std::str::from_utf8(payload).ok()?.trim();
    if text.is_empty() {
        return None;
    }

    let value = if text.starts_with('{') {
        let parsed: serde_json::Value = serde_json::from_str(text).ok()?;
        match parsed.get("weight")? {
            serde_json::Value::Number(n) => n.as_f64()?,
            serde_json::Value::String(s) => s.trim().parse().ok()?,
            _ => return None,
        }
    } else {
        text.parse().ok()?
    };

    value.is_finite().then_some(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_weight_accepts_json_number() {
        assert_eq!(parse_weight(br#"{"weight": 12.5}"#), Some(12.5));
    }

    #[test]
    fn test_parse_weight_accepts_json_string() {
        assert_eq!(parse_weight(br#"{"weight": "3.25"}"#), Some(3.25));
    }

    #[test]
    fn test_parse_weight_accepts_bare_numeric_string() {
        assert_eq!(parse_weight(b"7.5"), Some(7.5));
        assert_eq!(parse_weight(b"  42 "), Some(42.0));
    }

    #[test]
    fn test_parse_weight_rejects_garbage() {
        assert_eq!(parse_weight(b"not-a-number"), None);
        assert_eq!(parse_weight(br#"{"weight": null}"#), None);
        assert_eq!(parse_weight(br#"{"mass": 5}"#), None);
        assert_eq!(parse_weight(b"NaN"), None);
        assert_eq!(parse_weight(b"inf"), None);
        assert_eq!(parse_weight(b""), None);
        assert_eq!(parse_weight(&[0xFF, 0xFE]), None);
    }

    #[test]
    fn test_feeder_event_decoding() {
        let event: FeederEvent = serde_json::from_slice(
            br#"{"type": "FEEDING_COMPLETED", "feedingId": "feed00000001", "horseId": "horse0000001"}"#,
        )
        .expect("decode");

        assert_eq!(event.feeding_id().as_str(), "feed00000001");
        assert_eq!(event.horse_id().as_str(), "horse0000001");
        assert_eq!(event.target_status(), FeedingStatus::Completed);
    }

    #[test]
    fn test_feeder_error_event_carries_message() {
        let event: FeederEvent = serde_json::from_slice(
            br#"{"type": "FEEDING_ERROR", "feedingId": "f1", "horseId": "h1", "errorMessage": "jam"}"#,
        )
        .expect("decode");

        assert_eq!(event.target_status(), FeedingStatus::Failed);
        match event {
            FeederEvent::Error { error_message, .. } => {
                assert_eq!(error_message.as_deref(), Some("jam"));
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn test_camera_event_decoding() {
        let event: CameraEvent =
            serde_json::from_slice(br#"{"type": "STREAM_STARTED", "horseId": "h1"}"#)
                .expect("decode");
        assert_eq!(event.horse_id().as_str(), "h1");

        let unknown: std::result::Result<CameraEvent, _> =
            serde_json::from_slice(br#"{"type": "STREAM_PAUSED", "horseId": "h1"}"#);
        assert!(unknown.is_err());
    }
}
