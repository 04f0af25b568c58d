use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

use super::id::{DeviceId, FeedingId, HorseId};

/// Feeding lifecycle state.
///
/// The status field is the authoritative lifecycle state of a feeding.
/// Transitions are driven only by validated inbound device events and must be
/// present in the transition table (`can_transition_to`); anything else is
/// rejected, which covers duplicate and out-of-order device messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FeedingStatus {
    /// Created by a start-feeding request; the feed command has been (or is
    /// about to be) dispatched to the device.
    Pending,
    /// The device acknowledged the command and began dispensing.
    Started,
    /// The device reported dispensing in progress.
    Running,
    /// Terminal: the requested amount was dispensed.
    Completed,
    /// Terminal: the device reported an error from any non-terminal state.
    Failed,
}

impl FeedingStatus {
    /// Statuses counted against the one-active-feeding-per-horse invariant.
    pub const NON_TERMINAL: [Self; 3] = [Self::Pending, Self::Started, Self::Running];

    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Started => "STARTED",
            Self::Running => "RUNNING",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
        }
    }

    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Explicit transition table: state × target -> allowed.
    #[must_use]
    pub const fn can_transition_to(&self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Started)
                | (Self::Started, Self::Running)
                | (Self::Running, Self::Completed)
                | (Self::Pending | Self::Started | Self::Running, Self::Failed)
        )
    }
}

impl FromStr for FeedingStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "PENDING" => Ok(Self::Pending),
            "STARTED" => Ok(Self::Started),
            "RUNNING" => Ok(Self::Running),
            "COMPLETED" => Ok(Self::Completed),
            "FAILED" => Ok(Self::Failed),
            _ => Err(format!("Unknown feeding status: {s}")),
        }
    }
}

impl std::fmt::Display for FeedingStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One discrete feed-dispensing operation and its persisted lifecycle record.
///
/// Append-only history: rows are created by start-feeding requests, mutated
/// only by validated device events, and never deleted except via horse
/// cascade.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Feeding {
    pub id: FeedingId,
    pub horse_id: HorseId,
    pub device_id: DeviceId,
    pub requested_kg: f64,
    pub status: FeedingStatus,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Feeding {
    #[must_use]
    pub fn new(horse_id: HorseId, device_id: DeviceId, requested_kg: f64) -> Self {
        Self {
            id: FeedingId::new(),
            horse_id,
            device_id,
            requested_kg,
            status: FeedingStatus::Pending,
            error_message: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }

    #[must_use]
    pub const fn is_active(&self) -> bool {
        !self.status.is_terminal()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_forward_transitions_allowed() {
        use FeedingStatus::*;
        assert!(Pending.can_transition_to(Started));
        assert!(Started.can_transition_to(Running));
        assert!(Running.can_transition_to(Completed));
    }

    #[test]
    fn test_failed_reachable_from_every_non_terminal_state() {
        use FeedingStatus::*;
        for status in FeedingStatus::NON_TERMINAL {
            assert!(status.can_transition_to(Failed), "{status} -> FAILED");
        }
    }

    #[test]
    fn test_terminal_states_accept_nothing() {
        use FeedingStatus::*;
        for terminal in [Completed, Failed] {
            for next in [Pending, Started, Running, Completed, Failed] {
                assert!(!terminal.can_transition_to(next), "{terminal} -> {next}");
            }
        }
    }

    #[test]
    fn test_backward_and_skipping_transitions_rejected() {
        use FeedingStatus::*;
        // A stray STARTED after COMPLETED, a RUNNING rewinding to STARTED,
        // and a PENDING jumping straight to COMPLETED are all dropped.
        assert!(!Running.can_transition_to(Started));
        assert!(!Started.can_transition_to(Pending));
        assert!(!Pending.can_transition_to(Completed));
        assert!(!Pending.can_transition_to(Running));
    }

    #[test]
    fn test_status_round_trip() {
        for status in [
            FeedingStatus::Pending,
            FeedingStatus::Started,
            FeedingStatus::Running,
            FeedingStatus::Completed,
            FeedingStatus::Failed,
        ] {
            assert_eq!(status.as_str().parse::<FeedingStatus>().ok(), Some(status));
        }
    }

    #[test]
    fn test_new_feeding_is_pending() {
        let feeding = Feeding::new(HorseId::new(), DeviceId::new(), 2.5);
        assert_eq!(feeding.status, FeedingStatus::Pending);
        assert!(feeding.is_active());
        assert!(feeding.started_at.is_none());
        assert!(feeding.completed_at.is_none());
    }
}
