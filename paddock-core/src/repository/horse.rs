use sqlx::{postgres::PgRow, PgPool, Row};

use crate::{
    models::{DeviceId, DeviceType, Horse, HorseId, UserId},
    Result,
};

const HORSE_COLUMNS: &str =
    "id, name, owner_id, feeder_id, camera_id, last_feed_at, created_at, updated_at";

/// Horse repository for database operations
#[derive(Clone)]
pub struct HorseRepository {
    pool: PgPool,
}

impl HorseRepository {
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Find the horse a camera device is assigned to.
    ///
    /// `camera_id` is unique across horses, so there is at most one.
    pub async fn find_by_camera(&self, camera_id: &DeviceId) -> Result<Option<Horse>> {
        let row = sqlx::query(&format!(
            "SELECT {HORSE_COLUMNS} FROM horses WHERE camera_id = $1"
        ))
        .bind(camera_id.as_str())
        .fetch_optional(&self.pool)
        .await?;

        row.map(row_to_horse).transpose()
    }

    /// Thing names of all feeder devices assigned to horses owned by a user.
    ///
    /// Used to enroll a fresh client connection into its telemetry rooms.
    pub async fn owned_feeder_thing_names(&self, owner_id: &UserId) -> Result<Vec<String>> {
        let names = sqlx::query_scalar::<_, String>(
            r"
            SELECT d.thing_name
            FROM horses h
            JOIN devices d ON d.id = h.feeder_id
            WHERE h.owner_id = $1 AND d.device_type = $2
            ",
        )
        .bind(owner_id.as_str())
        .bind(DeviceType::Feeder.as_str())
        .fetch_all(&self.pool)
        .await?;

        Ok(names)
    }
}

pub(crate) fn row_to_horse(row: PgRow) -> Result<Horse> {
    Ok(Horse {
        id: HorseId::from_string(row.try_get("id")?),
        name: row.try_get("name")?,
        owner_id: row
            .try_get::<Option<String>, _>("owner_id")?
            .map(UserId::from_string),
        feeder_id: row
            .try_get::<Option<String>, _>("feeder_id")?
            .map(DeviceId::from_string),
        camera_id: row
            .try_get::<Option<String>, _>("camera_id")?
            .map(DeviceId::from_string),
        last_feed_at: row.try_get("last_feed_at")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

#[cfg(test)]
mod tests {

    // Integration tests would require a real database

    #[tokio::test]
    #[ignore = "Requires database"]
    async fn test_owned_feeder_thing_names_scopes_to_owner() {
        // Only feeders of horses owned by the queried user come back.
    }
}
