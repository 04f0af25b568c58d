//! Live-frame HTTP surface.
//!
//! `GET /stream/{token}`: resolve the token, then hold the connection open
//! with a `multipart/x-mixed-replace` body, one JPEG part per frame. The
//! body is fed by the frame relay's viewer stream, so consumer backpressure
//! suspends production; dropping the connection drops the stream.

use axum::{
    body::Body,
    extract::{Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
};
use bytes::{BufMut, Bytes, BytesMut};
use futures::StreamExt;
use std::convert::Infallible;
use tracing::info;

use crate::http::error::{AppError, AppResult};
use crate::state::AppState;

const BOUNDARY: &str = "frame";

/// Wrap one JPEG frame as a multipart part.
fn mjpeg_part(frame: &Bytes) -> Bytes {
    let mut part = BytesMut::with_capacity(frame.len() + 64);
    part.put_slice(format!("--{BOUNDARY}\r\nContent-Type: image/jpeg\r\n\r\n").as_bytes());
    part.put_slice(frame);
    part.put_slice(b"\r\n");
    part.freeze()
}

pub async fn serve_stream(
    State(state): State<AppState>,
    Path(token): Path<String>,
) -> AppResult<Response> {
    let claims = state
        .stream_sessions
        .validate_stream_token(&token)
        .await?
        .ok_or_else(|| AppError::gone("Stream expired"))?;

    info!(
        horse_id = %claims.horse_id,
        thing_name = %claims.thing_name,
        "viewer stream opened"
    );

    let frames = state
        .relay
        .clone()
        .serve(claims.horse_id)
        .map(|frame| Ok::<_, Infallible>(mjpeg_part(&frame)));

    let response = Response::builder()
        .status(StatusCode::OK)
        .header(
            header::CONTENT_TYPE,
            format!("multipart/x-mixed-replace; boundary={BOUNDARY}"),
        )
        .header(header::CACHE_CONTROL, "no-cache, no-store")
        .header("X-Accel-Buffering", "no")
        .body(Body::from_stream(frames))
        .map_err(|_| AppError::internal_server_error("Failed to build response"))?;

    Ok(response.into_response())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mjpeg_part_framing() {
        let frame = Bytes::from_static(&[0xFF, 0xD8, 0xFF, 0x01]);
        let part = mjpeg_part(&frame);

        let text = part.as_ref();
        assert!(text.starts_with(b"--frame\r\nContent-Type: image/jpeg\r\n\r\n"));
        assert!(text.ends_with(b"\x01\r\n"));
    }
}
