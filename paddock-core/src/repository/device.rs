use chrono::Utc;
use sqlx::{postgres::PgRow, PgPool, Row};
use std::str::FromStr;

use crate::{
    models::{Device, DeviceId, DeviceType, HorseId},
    Error, Result,
};

const DEVICE_COLUMNS: &str = "id, thing_name, device_type, stream_token_hash, \
     stream_token_valid, created_at, updated_at";

/// Device repository for database operations
#[derive(Clone)]
pub struct DeviceRepository {
    pool: PgPool,
}

impl DeviceRepository {
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Get device by its physical thing name
    pub async fn get_by_thing_name(&self, thing_name: &str) -> Result<Option<Device>> {
        let row = sqlx::query(&format!(
            "SELECT {DEVICE_COLUMNS} FROM devices WHERE thing_name = $1"
        ))
        .bind(thing_name)
        .fetch_optional(&self.pool)
        .await?;

        row.map(row_to_device).transpose()
    }

    /// Store a fresh stream-token hash and mark it valid.
    ///
    /// Replaces any previous hash, which permanently invalidates the old
    /// token.
    pub async fn set_stream_token(&self, device_id: &DeviceId, token_hash: &str) -> Result<()> {
        let result = sqlx::query(
            r"
            UPDATE devices
            SET stream_token_hash = $2, stream_token_valid = TRUE, updated_at = $3
            WHERE id = $1
            ",
        )
        .bind(device_id.as_str())
        .bind(token_hash)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(Error::NotFound(format!("Device not found: {device_id}")));
        }
        Ok(())
    }

    /// Clear the stream-token hash and validity flag. Idempotent.
    pub async fn clear_stream_token(&self, device_id: &DeviceId) -> Result<()> {
        sqlx::query(
            r"
            UPDATE devices
            SET stream_token_hash = NULL, stream_token_valid = FALSE, updated_at = $2
            WHERE id = $1
            ",
        )
        .bind(device_id.as_str())
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Resolve a token hash to the camera it belongs to and the horse that
    /// camera is assigned to. Only valid tokens on CAMERA devices match.
    pub async fn find_camera_by_token_hash(
        &self,
        token_hash: &str,
    ) -> Result<Option<(Device, HorseId)>> {
        let row = sqlx::query(
            r"
            SELECT d.id, d.thing_name, d.device_type, d.stream_token_hash,
                   d.stream_token_valid, d.created_at, d.updated_at,
                   h.id AS horse_id
            FROM devices d
            JOIN horses h ON h.camera_id = d.id
            WHERE d.stream_token_hash = $1
              AND d.stream_token_valid = TRUE
              AND d.device_type = $2
            ",
        )
        .bind(token_hash)
        .bind(DeviceType::Camera.as_str())
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => {
                let horse_id = HorseId::from_string(row.try_get("horse_id")?);
                Ok(Some((row_to_device(row)?, horse_id)))
            }
            None => Ok(None),
        }
    }
}

pub(crate) fn row_to_device(row: PgRow) -> Result<Device> {
    let type_str: String = row.try_get("device_type")?;
    let device_type = DeviceType::from_str(&type_str).map_err(Error::Internal)?;

    Ok(Device {
        id: DeviceId::from_string(row.try_get("id")?),
        thing_name: row.try_get("thing_name")?,
        device_type,
        stream_token_hash: row.try_get("stream_token_hash")?,
        stream_token_valid: row.try_get("stream_token_valid")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

#[cfg(test)]
mod tests {

    // Integration tests would require a real database

    #[tokio::test]
    #[ignore = "Requires database"]
    async fn test_clear_stream_token_is_idempotent() {
        // Clearing twice must not error; validity stays FALSE.
    }
}
