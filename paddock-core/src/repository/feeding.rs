use chrono::{DateTime, Utc};
use sqlx::{postgres::PgRow, PgPool, Row};
use std::str::FromStr;

use crate::{
    models::{DeviceId, Feeding, FeedingId, FeedingStatus, HorseId},
    Error, Result,
};

const FEEDING_COLUMNS: &str = "id, horse_id, device_id, requested_kg, status, \
     error_message, created_at, started_at, completed_at";

/// Feeding repository for database operations
#[derive(Clone)]
pub struct FeedingRepository {
    pool: PgPool,
}

impl FeedingRepository {
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Get feeding by ID
    pub async fn get_by_id(&self, feeding_id: &FeedingId) -> Result<Option<Feeding>> {
        let row = sqlx::query(&format!(
            "SELECT {FEEDING_COLUMNS} FROM feedings WHERE id = $1"
        ))
        .bind(feeding_id.as_str())
        .fetch_optional(&self.pool)
        .await?;

        row.map(row_to_feeding).transpose()
    }

    /// The horse's current non-terminal feeding, if any.
    ///
    /// The partial unique index on (horse_id) over non-terminal statuses
    /// guarantees at most one row.
    pub async fn find_active_for_horse(&self, horse_id: &HorseId) -> Result<Option<Feeding>> {
        let row = sqlx::query(&format!(
            "SELECT {FEEDING_COLUMNS} FROM feedings \
             WHERE horse_id = $1 AND status IN ('PENDING', 'STARTED', 'RUNNING')"
        ))
        .bind(horse_id.as_str())
        .fetch_optional(&self.pool)
        .await?;

        row.map(row_to_feeding).transpose()
    }

    /// Compare-and-swap status transition.
    ///
    /// Applies `expected -> next` in one statement; returns false when the
    /// row was not in `expected` anymore (a concurrent or duplicate device
    /// event won), in which case nothing is written. `started_at` is stamped
    /// on STARTED, `completed_at` on terminal states.
    pub async fn transition(
        &self,
        feeding_id: &FeedingId,
        expected: FeedingStatus,
        next: FeedingStatus,
        error_message: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let result = sqlx::query(
            r"
            UPDATE feedings
            SET status = $3,
                error_message = COALESCE($4, error_message),
                started_at = CASE WHEN $3 = 'STARTED' THEN $5 ELSE started_at END,
                completed_at = CASE WHEN $3 IN ('COMPLETED', 'FAILED') THEN $5 ELSE completed_at END
            WHERE id = $1 AND status = $2
            ",
        )
        .bind(feeding_id.as_str())
        .bind(expected.as_str())
        .bind(next.as_str())
        .bind(error_message)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Terminal COMPLETED transition plus the horse's `last_feed_at` stamp,
    /// applied in one transaction.
    pub async fn complete(
        &self,
        feeding_id: &FeedingId,
        horse_id: &HorseId,
        expected: FeedingStatus,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let mut tx = self.pool.begin().await?;

        let result = sqlx::query(
            r"
            UPDATE feedings
            SET status = $3, completed_at = $4
            WHERE id = $1 AND status = $2
            ",
        )
        .bind(feeding_id.as_str())
        .bind(expected.as_str())
        .bind(FeedingStatus::Completed.as_str())
        .bind(now)
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(false);
        }

        sqlx::query("UPDATE horses SET last_feed_at = $2, updated_at = $2 WHERE id = $1")
            .bind(horse_id.as_str())
            .bind(now)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(true)
    }
}

pub(crate) fn row_to_feeding(row: PgRow) -> Result<Feeding> {
    let status_str: String = row.try_get("status")?;
    let status = FeedingStatus::from_str(&status_str).map_err(Error::Internal)?;

    Ok(Feeding {
        id: FeedingId::from_string(row.try_get("id")?),
        horse_id: HorseId::from_string(row.try_get("horse_id")?),
        device_id: DeviceId::from_string(row.try_get("device_id")?),
        requested_kg: row.try_get("requested_kg")?,
        status,
        error_message: row.try_get("error_message")?,
        created_at: row.try_get("created_at")?,
        started_at: row.try_get("started_at")?,
        completed_at: row.try_get("completed_at")?,
    })
}

#[cfg(test)]
mod tests {

    // Integration tests would require a real database

    #[tokio::test]
    #[ignore = "Requires database"]
    async fn test_transition_cas_rejects_stale_expected() {
        // transition(id, PENDING, STARTED) after the row moved to RUNNING
        // must return false and write nothing.
    }

    #[tokio::test]
    #[ignore = "Requires database"]
    async fn test_complete_stamps_horse_last_feed_at() {
        // complete() must update both tables or neither.
    }
}
