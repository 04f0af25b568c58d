pub mod error;
pub mod stream;

pub use error::{AppError, AppResult};

use axum::{routing::get, Router};
use tower_http::trace::TraceLayer;

use crate::state::AppState;
use crate::ws;

/// Assemble the HTTP/WebSocket surface.
///
/// CRUD and auth endpoints live in a separate service; this router carries
/// only the device-coordination surface.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/stream/{token}", get(stream::serve_stream))
        .route("/ws/client", get(ws::client::client_ws_handler))
        .route("/ws/camera/{thing_name}", get(ws::camera::camera_ws_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
