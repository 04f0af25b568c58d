use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::id::{HorseId, UserId};

/// An operator account, reduced to what the coordination core touches.
///
/// `active_stream_horse_id` is the single horse this user is currently
/// viewing via camera stream, if any. Account management and authentication
/// live outside this core.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: UserId,
    pub username: String,
    pub active_stream_horse_id: Option<HorseId>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl User {
    #[must_use]
    pub fn new(username: String) -> Self {
        let now = Utc::now();
        Self {
            id: UserId::new(),
            username,
            active_stream_horse_id: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[must_use]
    pub const fn is_streaming(&self) -> bool {
        self.active_stream_horse_id.is_some()
    }
}
