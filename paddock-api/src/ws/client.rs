//! Client WebSocket endpoint.
//!
//! Carries the operator-facing request/notification protocol: FEED_NOW,
//! START_STREAM, STOP_STREAM, LOGOUT in; FEEDING_STATUS, STREAM_STATUS,
//! FEEDER_WEIGHT and friends out. Session authentication is an external
//! collaborator; the endpoint trusts the caller-supplied user id.
//!
//! Rejected requests answer ERROR; requests that indicate invalid or
//! malicious usage additionally drop the connection. A passive disconnect
//! leaves telemetry rooms on a grace timer, an explicit LOGOUT stops them
//! synchronously and acknowledges with the stopped device list.

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    response::IntoResponse,
};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tracing::{error, info, warn};

use paddock_core::models::{ConnectionId, HorseId, UserId};
use paddock_core::service::ClientEvent;
use paddock_core::{Error, Result};

use crate::http::AppError;
use crate::state::AppState;

/// Query parameters for the client WebSocket connection
#[derive(Debug, Deserialize)]
pub struct ClientWsQuery {
    /// Authenticated user id, supplied by the session layer in front of us.
    pub user_id: Option<String>,
}

/// Client->server requests.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type")]
enum ClientRequest {
    #[serde(rename = "FEED_NOW", rename_all = "camelCase")]
    FeedNow { horse_id: HorseId, amount_kg: f64 },
    #[serde(rename = "START_STREAM", rename_all = "camelCase")]
    StartStream { horse_id: HorseId },
    #[serde(rename = "STOP_STREAM", rename_all = "camelCase")]
    StopStream { horse_id: HorseId },
    #[serde(rename = "LOGOUT")]
    Logout,
}

pub async fn client_ws_handler(
    State(state): State<AppState>,
    Query(query): Query<ClientWsQuery>,
    ws: WebSocketUpgrade,
) -> std::result::Result<impl IntoResponse, AppError> {
    let user_id = query
        .user_id
        .filter(|id| !id.is_empty())
        .map(UserId::from_string)
        .ok_or_else(|| AppError::unauthorized("Missing user_id query parameter"))?;

    // Session validation is the auth layer's job; we still refuse ids that
    // do not resolve to an account.
    let user = state.users.get_by_id(&user_id).await.map_err(AppError::from)?;
    if user.is_none() {
        return Err(AppError::unauthorized("Unknown user"));
    }

    Ok(ws.on_upgrade(move |socket| handle_socket(socket, state, user_id)))
}

async fn handle_socket(socket: WebSocket, state: AppState, user_id: UserId) {
    let connection_id = ConnectionId::new();
    let mut outbound = state.hub.register(connection_id.clone());
    state
        .subscriptions
        .register_connection(connection_id.clone(), user_id.clone());

    info!(user_id = %user_id, connection_id = %connection_id, "client connected");

    // Every feeder of a horse this user owns gets a telemetry watcher;
    // rooms transitioning 0->1 dispatch start-telemetry.
    match state.horses.owned_feeder_thing_names(&user_id).await {
        Ok(thing_names) => {
            for thing_name in thing_names {
                state.subscriptions.join(&connection_id, &thing_name).await;
            }
        }
        Err(e) => {
            error!(user_id = %user_id, error = %e, "telemetry enrollment failed");
        }
    }

    if let Err(e) = state.hub.send_to_connection(
        &connection_id,
        &ClientEvent::AuthSuccess {
            user_id: user_id.clone(),
            connection_id: connection_id.clone(),
        },
    ) {
        warn!(connection_id = %connection_id, error = %e, "greeting failed");
    }

    let (mut ws_sender, mut ws_receiver) = socket.split();

    // Outbound pump: hub channel -> socket
    let mut writer = tokio::spawn(async move {
        while let Some(payload) = outbound.recv().await {
            if ws_sender.send(Message::Text(payload.into())).await.is_err() {
                break;
            }
        }
    });

    let mut logged_out = false;

    while let Some(message) = ws_receiver.next().await {
        let text = match message {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) | Err(_) => break,
            // Binary, ping, pong: nothing to do
            Ok(_) => continue,
        };

        let request: ClientRequest = match serde_json::from_str(&text) {
            Ok(request) => request,
            Err(e) => {
                punish(
                    &state,
                    &connection_id,
                    &user_id,
                    &Error::Validation(format!("Malformed request: {e}")),
                );
                break;
            }
        };

        if matches!(request, ClientRequest::Logout) {
            let stopped = state.subscriptions.leave_immediate(&connection_id).await;
            let ack = serde_json::json!({
                "type": "LOGOUT_ACK",
                "ok": true,
                "stopped": stopped,
            });
            state.hub.send_text(&connection_id, ack.to_string());
            logged_out = true;
            break;
        }

        if let Err(e) = dispatch(&state, &user_id, &request).await {
            let drop_connection = e.is_client_fault();
            punish(&state, &connection_id, &user_id, &e);
            if drop_connection {
                break;
            }
        }
    }

    if !logged_out {
        // Passive disconnect: deferred stops absorb quick reconnects
        state.subscriptions.leave_deferred(&connection_id);
    }
    state.subscriptions.unregister_connection(&connection_id);

    // Closing the hub channel lets the writer drain queued messages (the
    // LOGOUT ack in particular) before exiting.
    state.hub.unregister(&connection_id);
    if tokio::time::timeout(std::time::Duration::from_secs(5), &mut writer)
        .await
        .is_err()
    {
        writer.abort();
    }

    info!(user_id = %user_id, connection_id = %connection_id, "client disconnected");
}

async fn dispatch(state: &AppState, user_id: &UserId, request: &ClientRequest) -> Result<()> {
    match request {
        ClientRequest::FeedNow {
            horse_id,
            amount_kg,
        } => {
            state
                .feeding_coordinator
                .start_feeding(horse_id, *amount_kg, user_id)
                .await?;
            Ok(())
        }
        ClientRequest::StartStream { horse_id } => {
            state.stream_sessions.start_streaming(horse_id, user_id).await
        }
        ClientRequest::StopStream { horse_id } => {
            state.stream_sessions.stop_streaming(horse_id, user_id).await
        }
        ClientRequest::Logout => Ok(()),
    }
}

/// Tell the client once, log the violation, and let the caller decide
/// whether the connection survives.
fn punish(state: &AppState, connection_id: &ConnectionId, user_id: &UserId, error: &Error) {
    warn!(
        user_id = %user_id,
        connection_id = %connection_id,
        error = %error,
        "client request rejected"
    );

    let _ = state.hub.send_to_connection(
        connection_id,
        &ClientEvent::Error {
            message: error.to_string(),
        },
    );
}
