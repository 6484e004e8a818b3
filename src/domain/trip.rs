//! Trips and their status lifecycle.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{TripId, UserId};
use crate::error::AppError;

/// Lifecycle status of a trip.
///
/// Transitions form a DAG: `PLANNING → ACTIVE → COMPLETED`, and any
/// non-terminal status may move to `CANCELLED`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TripStatus {
    /// Trip is being planned.
    Planning,
    /// Trip is under way.
    Active,
    /// Trip has finished.
    Completed,
    /// Trip was called off.
    Cancelled,
}

impl TripStatus {
    /// Returns the canonical upper-case name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Planning => "PLANNING",
            Self::Active => "ACTIVE",
            Self::Completed => "COMPLETED",
            Self::Cancelled => "CANCELLED",
        }
    }

    /// Returns `true` if no further transition is possible.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled)
    }

    /// Returns `true` if `self → next` is an edge of the status DAG.
    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Planning, Self::Active)
                | (Self::Active, Self::Completed)
                | (Self::Planning | Self::Active, Self::Cancelled)
        )
    }

    /// Validates a transition and returns the new status.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::InvalidTransition`] for any edge outside the DAG,
    /// including same-state transitions.
    pub fn transition(self, next: Self) -> Result<Self, AppError> {
        if self.can_transition_to(next) {
            Ok(next)
        } else {
            Err(AppError::InvalidTransition {
                from: self.as_str().to_string(),
                to: next.as_str().to_string(),
            })
        }
    }
}

impl fmt::Display for TripStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TripStatus {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "PLANNING" => Ok(Self::Planning),
            "ACTIVE" => Ok(Self::Active),
            "COMPLETED" => Ok(Self::Completed),
            "CANCELLED" => Ok(Self::Cancelled),
            other => Err(AppError::Validation(format!("unknown trip status: {other}"))),
        }
    }
}

/// Where a trip is headed.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Destination {
    /// Place identifier from the maps provider.
    pub place_id: Option<String>,
    /// Formatted street address.
    pub address: Option<String>,
    /// Latitude in degrees.
    pub latitude: Option<f64>,
    /// Longitude in degrees.
    pub longitude: Option<f64>,
}

/// A trip: the top-level collaboration context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Trip {
    /// Trip identifier.
    pub id: TripId,
    /// Display name.
    pub name: String,
    /// Free-form description.
    pub description: String,
    /// Destination details.
    pub destination: Destination,
    /// Planned start.
    pub start_date: DateTime<Utc>,
    /// Planned end.
    pub end_date: DateTime<Utc>,
    /// Current lifecycle status.
    pub status: TripStatus,
    /// User who created the trip.
    pub created_by: UserId,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Last modification timestamp.
    pub updated_at: DateTime<Utc>,
}

impl Trip {
    /// Creates a trip in `PLANNING` status.
    #[must_use]
    pub fn new(name: impl Into<String>, created_by: UserId) -> Self {
        let now = Utc::now();
        Self {
            id: TripId::new(),
            name: name.into(),
            description: String::new(),
            destination: Destination::default(),
            start_date: now,
            end_date: now,
            status: TripStatus::Planning,
            created_by,
            created_at: now,
            updated_at: now,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn forward_path_is_allowed() {
        assert!(TripStatus::Planning.can_transition_to(TripStatus::Active));
        assert!(TripStatus::Active.can_transition_to(TripStatus::Completed));
    }

    #[test]
    fn cancel_from_non_terminal() {
        assert!(TripStatus::Planning.can_transition_to(TripStatus::Cancelled));
        assert!(TripStatus::Active.can_transition_to(TripStatus::Cancelled));
        assert!(!TripStatus::Completed.can_transition_to(TripStatus::Cancelled));
    }

    #[test]
    fn backwards_and_same_state_fail() {
        assert!(TripStatus::Active.transition(TripStatus::Planning).is_err());
        assert!(TripStatus::Planning.transition(TripStatus::Completed).is_err());
        assert!(TripStatus::Active.transition(TripStatus::Active).is_err());
        let err = TripStatus::Cancelled.transition(TripStatus::Active);
        assert!(matches!(err, Err(AppError::InvalidTransition { .. })));
    }

    #[test]
    fn parses_case_insensitively() {
        assert_eq!("active".parse::<TripStatus>().ok(), Some(TripStatus::Active));
        assert!("paused".parse::<TripStatus>().is_err());
    }
}
