//! Camera uplink WebSocket endpoint.
//!
//! A camera connects at `/ws/camera/{thing_name}`, is greeted, authenticated
//! against its registration (must exist, be a CAMERA, and be linked to a
//! horse), and then pushes binary JPEG frames into the relay. Small binary
//! messages are control chatter, not frames. Disconnect tears the relay
//! subject down immediately; viewers fall back to the placeholder.

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, State,
    },
    response::IntoResponse,
};
use serde_json::json;
use tracing::{debug, info, warn};

use paddock_core::models::{Device, Horse};

use crate::state::AppState;

pub async fn camera_ws_handler(
    State(state): State<AppState>,
    Path(thing_name): Path<String>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_uplink(socket, state, thing_name))
}

async fn handle_uplink(mut socket: WebSocket, state: AppState, thing_name: String) {
    info!(thing_name = %thing_name, "camera connecting");

    send_json(
        &mut socket,
        &json!({ "type": "CONNECTED", "thingName": thing_name }),
    )
    .await;

    let (camera, horse) = match authenticate(&state, &thing_name).await {
        Ok(pair) => pair,
        Err(reason) => {
            warn!(thing_name = %thing_name, reason, "camera authentication failed");
            send_json(
                &mut socket,
                &json!({ "type": "CAMERA_AUTH_FAILED", "error": reason }),
            )
            .await;
            return;
        }
    };

    state.relay.register(&horse.id);

    send_json(
        &mut socket,
        &json!({
            "type": "CAMERA_AUTHENTICATED",
            "message": "Camera stream active",
            "horseId": horse.id,
            "thingName": thing_name,
        }),
    )
    .await;

    info!(
        thing_name = %thing_name,
        device_id = %camera.id,
        horse_id = %horse.id,
        "camera authenticated, waiting for frames"
    );

    let min_frame_bytes = state.config.streaming.min_frame_bytes;
    let mut frame_count: u64 = 0;

    while let Some(message) = socket.recv().await {
        match message {
            Ok(Message::Binary(data)) => {
                if data.len() < min_frame_bytes {
                    // Control chatter from the device firmware, not a frame
                    debug!(thing_name = %thing_name, len = data.len(), "short camera message ignored");
                    continue;
                }
                if let Err(e) = state.relay.ingest_frame(&horse.id, data) {
                    warn!(thing_name = %thing_name, error = %e, "camera frame rejected");
                    continue;
                }
                frame_count += 1;
                if frame_count % 300 == 0 {
                    info!(thing_name = %thing_name, frame_count, "camera frames received");
                }
            }
            Ok(Message::Text(text)) => {
                debug!(thing_name = %thing_name, message = %text, "camera text message");
            }
            Ok(Message::Close(_)) | Err(_) => break,
            Ok(_) => {}
        }
    }

    state.relay.teardown(&horse.id);
    info!(thing_name = %thing_name, frame_count, "camera disconnected");
}

/// Look up the claimed thing name: must be a registered camera linked to a
/// horse. Returns a human-readable rejection reason otherwise.
async fn authenticate(
    state: &AppState,
    thing_name: &str,
) -> Result<(Device, Horse), &'static str> {
    let device = match state.devices.get_by_thing_name(thing_name).await {
        Ok(Some(device)) => device,
        Ok(None) => return Err("Camera not found"),
        Err(_) => return Err("Database error"),
    };

    if !device.is_camera() {
        return Err("Device is not a camera");
    }

    let horse = match state.horses.find_by_camera(&device.id).await {
        Ok(Some(horse)) => horse,
        Ok(None) => return Err("Camera not linked to any horse"),
        Err(_) => return Err("Database error"),
    };

    Ok((device, horse))
}

async fn send_json(socket: &mut WebSocket, value: &serde_json::Value) {
    if let Err(e) = socket.send(Message::Text(value.to_string().into())).await {
        debug!(error = %e, "camera control message not delivered");
    }
}
