//! Camera stream-session management.
//!
//! Owns camera activation, the single-active-stream-per-viewer invariant,
//! and the stream-token lifecycle. Token issuance is two-phase: a start
//! request only dispatches a start command; the token is minted when the
//! device confirms activation, so its lifetime is tied to device-confirmed
//! readiness rather than to the request.

use rand::RngCore;
use sha2::{Digest, Sha256};
use sqlx::{PgPool, Row};
use std::str::FromStr;
use std::sync::Arc;
use tracing::{info, warn};

use crate::models::{Device, DeviceId, DeviceType, Horse, HorseId, UserId};
use crate::repository::{DeviceRepository, UserRepository};
use crate::service::notify::{ClientEvent, ClientNotifier, StreamPhase};
use crate::transport::{CommandTransport, DeviceCommand};
use crate::{Error, Result};

/// Resolution of a valid stream token.
#[derive(Debug, Clone)]
pub struct StreamTokenClaims {
    pub device_id: DeviceId,
    pub thing_name: String,
    pub horse_id: HorseId,
}

pub struct StreamSessionManager {
    pool: PgPool,
    devices: DeviceRepository,
    users: UserRepository,
    transport: Arc<dyn CommandTransport>,
    notifier: Arc<dyn ClientNotifier>,
}

impl StreamSessionManager {
    #[must_use]
    pub fn new(
        pool: PgPool,
        transport: Arc<dyn CommandTransport>,
        notifier: Arc<dyn ClientNotifier>,
    ) -> Self {
        let devices = DeviceRepository::new(pool.clone());
        let users = UserRepository::new(pool.clone());
        Self {
            pool,
            devices,
            users,
            transport,
            notifier,
        }
    }

    /// Begin streaming a horse's camera for a viewer.
    ///
    /// If the viewer is already watching a different horse, that stream is
    /// stopped first (stop command dispatched before the new start command).
    /// The active-target switch is one transaction; commands go out after
    /// commit and their failure is logged, not surfaced.
    pub async fn start_streaming(&self, horse_id: &HorseId, viewer_id: &UserId) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        let horse_row = sqlx::query("SELECT id, camera_id FROM horses WHERE id = $1 AND owner_id = $2 FOR UPDATE")
            .bind(horse_id.as_str())
            .bind(viewer_id.as_str())
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| Error::Forbidden("Horse not found or not owned by you".to_string()))?;

        let camera_id: Option<String> = horse_row.try_get("camera_id")?;
        let camera_id =
            camera_id.ok_or_else(|| Error::NotFound("Horse has no camera assigned".to_string()))?;

        let camera_row = sqlx::query("SELECT id, thing_name, device_type FROM devices WHERE id = $1")
            .bind(&camera_id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| Error::NotFound("Camera device not found".to_string()))?;

        let device_type: String = camera_row.try_get("device_type")?;
        if DeviceType::from_str(&device_type).ok() != Some(DeviceType::Camera) {
            return Err(Error::Validation(
                "Assigned device is not a camera".to_string(),
            ));
        }
        let camera_thing_name: String = camera_row.try_get("thing_name")?;

        let active: Option<String> = sqlx::query_scalar::<_, Option<String>>(
            "SELECT active_stream_horse_id FROM users WHERE id = $1 FOR UPDATE",
        )
        .bind(viewer_id.as_str())
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| Error::NotFound("User not found".to_string()))?;

        if active.as_deref() == Some(horse_id.as_str()) {
            return Err(Error::Conflict(
                "Stream already active for this horse".to_string(),
            ));
        }

        // Previous camera, if the viewer is switching horses
        let previous = match &active {
            Some(prev_horse_id) => sqlx::query(
                r"
                SELECT h.id AS horse_id, d.thing_name
                FROM horses h
                JOIN devices d ON d.id = h.camera_id
                WHERE h.id = $1
                ",
            )
            .bind(prev_horse_id)
            .fetch_optional(&mut *tx)
            .await?
            .map(|row| -> Result<(HorseId, String)> {
                Ok((
                    HorseId::from_string(row.try_get("horse_id")?),
                    row.try_get("thing_name")?,
                ))
            })
            .transpose()?,
            None => None,
        };

        sqlx::query("UPDATE users SET active_stream_horse_id = $2, updated_at = NOW() WHERE id = $1")
            .bind(viewer_id.as_str())
            .bind(horse_id.as_str())
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        // Stop the previous stream before starting the new one; a failed
        // stop is logged and does not block the switch.
        if let Some((prev_horse_id, prev_thing_name)) = previous {
            if let Err(e) = self
                .transport
                .publish(
                    &prev_thing_name,
                    DeviceCommand::StreamStop {
                        horse_id: prev_horse_id.clone(),
                    },
                )
                .await
            {
                warn!(horse_id = %prev_horse_id, error = %e, "stop command for previous stream failed");
            }
        }

        if let Err(e) = self
            .transport
            .publish(
                &camera_thing_name,
                DeviceCommand::StreamStart {
                    horse_id: horse_id.clone(),
                },
            )
            .await
        {
            warn!(horse_id = %horse_id, error = %e, "stream start command failed");
        }

        // No token yet: issuance completes when the device confirms
        let event = ClientEvent::StreamStatus {
            horse_id: horse_id.clone(),
            status: StreamPhase::Pending,
            stream_url: None,
            error_message: None,
        };
        if let Err(e) = self.notifier.broadcast(event).await {
            warn!(horse_id = %horse_id, error = %e, "stream pending notification failed");
        }

        info!(horse_id = %horse_id, viewer_id = %viewer_id, "stream session starting");
        Ok(())
    }

    /// Stop the viewer's stream for a horse.
    ///
    /// Rejects with Conflict when this horse is not the viewer's recorded
    /// active target. Clears the target and invalidates the camera's token
    /// in one transaction; the stop command goes out after commit.
    pub async fn stop_streaming(&self, horse_id: &HorseId, viewer_id: &UserId) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        let horse_row = sqlx::query("SELECT id, camera_id FROM horses WHERE id = $1 AND owner_id = $2 FOR UPDATE")
            .bind(horse_id.as_str())
            .bind(viewer_id.as_str())
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| Error::Forbidden("Horse not found or not owned by you".to_string()))?;

        let camera_id: Option<String> = horse_row.try_get("camera_id")?;
        let camera_id =
            camera_id.ok_or_else(|| Error::NotFound("Horse has no camera assigned".to_string()))?;

        let camera_row = sqlx::query("SELECT id, thing_name, device_type FROM devices WHERE id = $1")
            .bind(&camera_id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| Error::NotFound("Camera device not found".to_string()))?;

        let device_type: String = camera_row.try_get("device_type")?;
        if DeviceType::from_str(&device_type).ok() != Some(DeviceType::Camera) {
            return Err(Error::Validation(
                "Assigned device is not a camera".to_string(),
            ));
        }
        let camera_thing_name: String = camera_row.try_get("thing_name")?;

        let active: Option<String> = sqlx::query_scalar::<_, Option<String>>(
            "SELECT active_stream_horse_id FROM users WHERE id = $1 FOR UPDATE",
        )
        .bind(viewer_id.as_str())
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| Error::NotFound("User not found".to_string()))?;

        if active.as_deref() != Some(horse_id.as_str()) {
            return Err(Error::Conflict(
                "This horse is not currently streaming".to_string(),
            ));
        }

        sqlx::query("UPDATE users SET active_stream_horse_id = NULL, updated_at = NOW() WHERE id = $1")
            .bind(viewer_id.as_str())
            .execute(&mut *tx)
            .await?;

        // Invalidate the token so /stream/{token} stops working
        sqlx::query(
            "UPDATE devices SET stream_token_hash = NULL, stream_token_valid = FALSE, updated_at = NOW() WHERE id = $1",
        )
        .bind(&camera_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        if let Err(e) = self
            .transport
            .publish(
                &camera_thing_name,
                DeviceCommand::StreamStop {
                    horse_id: horse_id.clone(),
                },
            )
            .await
        {
            warn!(horse_id = %horse_id, error = %e, "stream stop command failed");
        }

        info!(horse_id = %horse_id, viewer_id = %viewer_id, "stream session stopped");
        Ok(())
    }

    /// Stop whatever stream the user has active, if any.
    ///
    /// Used by the deferred auto-stop after the user's last connection drops.
    pub async fn stop_active_stream(&self, viewer_id: &UserId) -> Result<Option<HorseId>> {
        let Some(horse_id) = self.users.active_stream_horse(viewer_id).await? else {
            return Ok(None);
        };

        match self.stop_streaming(&horse_id, viewer_id).await {
            Ok(()) => Ok(Some(horse_id)),
            // Lost a race with an explicit stop or a new start; nothing to do
            Err(Error::Conflict(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Mint a fresh stream token for a camera.
    ///
    /// Persists only the SHA-256 hash plus validity; returns the plaintext
    /// exactly once. Replacing the hash permanently invalidates any prior
    /// token.
    pub async fn generate_stream_token(&self, device_id: &DeviceId) -> Result<String> {
        let mut raw = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut raw);
        let token = hex::encode(raw);

        self.devices
            .set_stream_token(device_id, &hash_token(&token))
            .await?;

        info!(device_id = %device_id, "stream token generated");
        Ok(token)
    }

    /// Resolve a presented token to its camera and horse, if still valid.
    pub async fn validate_stream_token(&self, token: &str) -> Result<Option<StreamTokenClaims>> {
        let lookup = self
            .devices
            .find_camera_by_token_hash(&hash_token(token))
            .await?;

        Ok(lookup.map(|(device, horse_id)| StreamTokenClaims {
            device_id: device.id,
            thing_name: device.thing_name,
            horse_id,
        }))
    }

    /// Invalidate a camera's stream token. Idempotent.
    pub async fn invalidate_stream_token(&self, device_id: &DeviceId) -> Result<()> {
        self.devices.clear_stream_token(device_id).await?;
        info!(device_id = %device_id, "stream token invalidated");
        Ok(())
    }

    /// Device confirmed stream activation: complete the two-phase issuance.
    ///
    /// Mints the token and pushes the stream URL to clients; the
    /// notification is best-effort.
    pub async fn confirm_stream_started(&self, camera: &Device, horse: &Horse) -> Result<()> {
        let token = self.generate_stream_token(&camera.id).await?;

        let event = ClientEvent::StreamStatus {
            horse_id: horse.id.clone(),
            status: StreamPhase::Started,
            stream_url: Some(format!("/stream/{token}")),
            error_message: None,
        };
        if let Err(e) = self.notifier.broadcast(event).await {
            warn!(horse_id = %horse.id, error = %e, "stream started notification failed");
        }

        Ok(())
    }

    /// Device reported a stream error: invalidate the token and tell clients.
    pub async fn fail_stream(
        &self,
        camera: &Device,
        horse: &Horse,
        error_message: Option<String>,
    ) -> Result<()> {
        self.invalidate_stream_token(&camera.id).await?;

        let event = ClientEvent::StreamStatus {
            horse_id: horse.id.clone(),
            status: StreamPhase::Error,
            stream_url: None,
            error_message: Some(
                error_message.unwrap_or_else(|| "Unknown stream error".to_string()),
            ),
        };
        if let Err(e) = self.notifier.broadcast(event).await {
            warn!(horse_id = %horse.id, error = %e, "stream error notification failed");
        }

        Ok(())
    }
}

/// SHA-256 hex digest of a token; the only form that ever touches storage.
fn hash_token(token: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    hex::encode(hasher.finalize())
}

impl std::fmt::Debug for StreamSessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamSessionManager").finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_token_is_stable_and_opaque() {
        let token = "deadbeef";
        let hash = hash_token(token);
        assert_eq!(hash, hash_token(token));
        assert_ne!(hash, token);
        // SHA-256 hex digest
        assert_eq!(hash.len(), 64);
        assert!(hash.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_different_tokens_hash_differently() {
        assert_ne!(hash_token("token-a"), hash_token("token-b"));
    }

    #[tokio::test]
    #[ignore = "Requires database"]
    async fn test_token_round_trip() {
        // generate_stream_token(d) -> T; validate_stream_token(T) resolves
        // d's horse while valid; after invalidate_stream_token(d) it
        // resolves to None.
    }

    #[tokio::test]
    #[ignore = "Requires database"]
    async fn test_switching_horses_stops_previous_stream_first() {
        // start_streaming(H2) while H1 active: STOP to H1's camera precedes
        // START to H2's camera; active target becomes H2.
    }
}
