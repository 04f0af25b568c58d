use sqlx::{postgres::PgRow, PgPool, Row};

use crate::{
    models::{HorseId, User, UserId},
    Result,
};

const USER_COLUMNS: &str = "id, username, active_stream_horse_id, created_at, updated_at";

/// User repository for database operations
///
/// Account management lives outside the coordination core; this repository
/// only covers the fields the core touches.
#[derive(Clone)]
pub struct UserRepository {
    pool: PgPool,
}

impl UserRepository {
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Get user by ID
    pub async fn get_by_id(&self, user_id: &UserId) -> Result<Option<User>> {
        let row = sqlx::query(&format!("SELECT {USER_COLUMNS} FROM users WHERE id = $1"))
            .bind(user_id.as_str())
            .fetch_optional(&self.pool)
            .await?;

        row.map(row_to_user).transpose()
    }

    /// The horse this user is actively viewing, if any.
    pub async fn active_stream_horse(&self, user_id: &UserId) -> Result<Option<HorseId>> {
        let horse_id = sqlx::query_scalar::<_, Option<String>>(
            "SELECT active_stream_horse_id FROM users WHERE id = $1",
        )
        .bind(user_id.as_str())
        .fetch_optional(&self.pool)
        .await?
        .flatten();

        Ok(horse_id.map(HorseId::from_string))
    }
}

pub(crate) fn row_to_user(row: PgRow) -> Result<User> {
    Ok(User {
        id: UserId::from_string(row.try_get("id")?),
        username: row.try_get("username")?,
        active_stream_horse_id: row
            .try_get::<Option<String>, _>("active_stream_horse_id")?
            .map(HorseId::from_string),
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

#[cfg(test)]
mod tests {

    // Integration tests would require a real database

    #[tokio::test]
    #[ignore = "Requires database"]
    async fn test_active_stream_horse_none_when_idle() {
        // A user with NULL active_stream_horse_id resolves to None.
    }
}
