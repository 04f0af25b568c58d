//! Feeding lifecycle coordination.
//!
//! `start_feeding` runs its precondition checks and the PENDING insert in a
//! single transaction; the partial unique index on non-terminal feedings
//! backstops the check so two near-simultaneous starts cannot both pass.
//! Subsequent transitions come only from validated device events and must
//! clear the explicit transition table.

use chrono::Utc;
use sqlx::{PgPool, Row};
use std::str::FromStr;
use std::sync::Arc;
use tracing::{info, warn};

use crate::models::{generate_id, DeviceType, Feeding, FeedingId, FeedingStatus, HorseId, UserId};
use crate::repository::FeedingRepository;
use crate::service::notify::{ClientEvent, ClientNotifier};
use crate::transport::{CommandTransport, DeviceCommand};
use crate::{Error, Result};

/// Result of a successful start-feeding request.
#[derive(Debug, Clone)]
pub struct StartedFeeding {
    pub feeding_id: FeedingId,
    pub device_thing_name: String,
}

pub struct FeedingCoordinator {
    pool: PgPool,
    feedings: FeedingRepository,
    transport: Arc<dyn CommandTransport>,
    notifier: Arc<dyn ClientNotifier>,
}

impl FeedingCoordinator {
    #[must_use]
    pub fn new(
        pool: PgPool,
        transport: Arc<dyn CommandTransport>,
        notifier: Arc<dyn ClientNotifier>,
    ) -> Self {
        let feedings = FeedingRepository::new(pool.clone());
        Self {
            pool,
            feedings,
            transport,
            notifier,
        }
    }

    /// Start a feeding for a horse.
    ///
    /// Preconditions (ownership, assigned feeder of the right type, no
    /// active feeding) and the PENDING insert are one atomic unit. The
    /// PENDING notification and the feed command go out after commit and
    /// are not retried or rolled back on failure.
    pub async fn start_feeding(
        &self,
        horse_id: &HorseId,
        amount_kg: f64,
        requester_id: &UserId,
    ) -> Result<StartedFeeding> {
        if !amount_kg.is_finite() || amount_kg <= 0.0 {
            return Err(Error::Validation(
                "Feed amount must be a positive number of kilograms".to_string(),
            ));
        }

        let mut tx = self.pool.begin().await?;

        let horse_row = sqlx::query("SELECT id, name, feeder_id FROM horses WHERE id = $1 AND owner_id = $2 FOR UPDATE")
            .bind(horse_id.as_str())
            .bind(requester_id.as_str())
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| Error::Forbidden("Horse not found or not owned by you".to_string()))?;

        let horse_name: String = horse_row.try_get("name")?;
        let feeder_id: Option<String> = horse_row.try_get("feeder_id")?;
        let feeder_id =
            feeder_id.ok_or_else(|| Error::NotFound("Horse has no assigned feeder".to_string()))?;

        let feeder_row = sqlx::query("SELECT id, thing_name, device_type FROM devices WHERE id = $1")
            .bind(&feeder_id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| Error::NotFound("Feeder device not found".to_string()))?;

        let device_type: String = feeder_row.try_get("device_type")?;
        if DeviceType::from_str(&device_type).ok() != Some(DeviceType::Feeder) {
            return Err(Error::Validation(
                "Assigned device is not a feeder".to_string(),
            ));
        }
        let feeder_thing_name: String = feeder_row.try_get("thing_name")?;

        let active_status: Option<String> = sqlx::query_scalar(
            "SELECT status FROM feedings WHERE horse_id = $1 AND status IN ('PENDING', 'STARTED', 'RUNNING')",
        )
        .bind(horse_id.as_str())
        .fetch_optional(&mut *tx)
        .await?;

        if let Some(status) = active_status {
            return Err(Error::Conflict(format!(
                "Feeding already in progress ({status})"
            )));
        }

        // The partial unique index on non-terminal feedings turns the race
        // between two concurrent starts into a 23505, mapped to Conflict.
        let feeding_id = FeedingId::from_string(generate_id());
        sqlx::query(
            r"
            INSERT INTO feedings (id, horse_id, device_id, requested_kg, status, created_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            ",
        )
        .bind(feeding_id.as_str())
        .bind(horse_id.as_str())
        .bind(&feeder_id)
        .bind(amount_kg)
        .bind(FeedingStatus::Pending.as_str())
        .bind(Utc::now())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        let event = ClientEvent::FeedingStatus {
            horse_id: horse_id.clone(),
            feeding_id: feeding_id.clone(),
            status: FeedingStatus::Pending,
            error_message: None,
        };
        if let Err(e) = self.notifier.broadcast(event).await {
            warn!(feeding_id = %feeding_id, error = %e, "pending notification failed");
        }

        let command = DeviceCommand::Feed {
            feeding_id: feeding_id.clone(),
            target_kg: amount_kg,
            horse_id: horse_id.clone(),
        };
        if let Err(e) = self.transport.publish(&feeder_thing_name, command).await {
            warn!(feeding_id = %feeding_id, error = %e, "feed command dispatch failed");
        }

        info!(
            horse = %horse_name,
            amount_kg,
            thing_name = %feeder_thing_name,
            "feeding started"
        );

        Ok(StartedFeeding {
            feeding_id,
            device_thing_name: feeder_thing_name,
        })
    }

    /// Apply a device-reported lifecycle transition.
    ///
    /// The caller (the event router) has already verified that the event's
    /// device owns this feeding. Transitions outside the table, and races
    /// lost to a concurrent event (CAS miss), are logged and dropped.
    pub async fn apply_event(
        &self,
        feeding: &Feeding,
        next: FeedingStatus,
        error_message: Option<String>,
    ) -> Result<()> {
        if !feeding.status.can_transition_to(next) {
            warn!(
                feeding_id = %feeding.id,
                from = %feeding.status,
                to = %next,
                "transition not in table, event dropped"
            );
            return Ok(());
        }

        let now = Utc::now();
        let applied = if next == FeedingStatus::Completed {
            self.feedings
                .complete(&feeding.id, &feeding.horse_id, feeding.status, now)
                .await?
        } else {
            self.feedings
                .transition(
                    &feeding.id,
                    feeding.status,
                    next,
                    error_message.as_deref(),
                    now,
                )
                .await?
        };

        if !applied {
            warn!(
                feeding_id = %feeding.id,
                to = %next,
                "concurrent event won, transition skipped"
            );
            return Ok(());
        }

        let event = ClientEvent::FeedingStatus {
            horse_id: feeding.horse_id.clone(),
            feeding_id: feeding.id.clone(),
            status: next,
            error_message: if next == FeedingStatus::Failed {
                Some(error_message.unwrap_or_else(|| "Unknown feeder error".to_string()))
            } else {
                None
            },
        };
        if let Err(e) = self.notifier.broadcast(event).await {
            warn!(feeding_id = %feeding.id, error = %e, "feeding status notification failed");
        }

        Ok(())
    }

    /// Look up a feeding for event validation.
    pub async fn get_feeding(&self, feeding_id: &FeedingId) -> Result<Option<Feeding>> {
        self.feedings.get_by_id(feeding_id).await
    }
}

impl std::fmt::Debug for FeedingCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FeedingCoordinator").finish()
    }
}

#[cfg(test)]
mod tests {

    // The transition table itself is covered in models::feeding; the
    // remaining coordinator behavior needs a database.

    #[tokio::test]
    #[ignore = "Requires database"]
    async fn test_concurrent_starts_yield_one_success_one_conflict() {
        // Two simultaneous start_feeding calls for one horse: exactly one
        // Ok, the other Conflict, one PENDING row total.
    }

    #[tokio::test]
    #[ignore = "Requires database"]
    async fn test_completed_event_stamps_last_feed_at() {
        // FEEDING_COMPLETED moves status and sets horse.last_feed_at in the
        // same transaction.
    }
}
