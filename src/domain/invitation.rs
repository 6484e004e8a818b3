//! Trip invitations and their lifecycle.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{InvitationId, MemberRole, TripId, UserId};

/// Invitation lifecycle status. Everything but `PENDING` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InvitationStatus {
    /// Awaiting a response.
    Pending,
    /// Invitee joined the trip.
    Accepted,
    /// Invitee declined, or an admin revoked it.
    Declined,
    /// Expiry passed while pending.
    Expired,
}

impl InvitationStatus {
    /// Canonical upper-case name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Accepted => "ACCEPTED",
            Self::Declined => "DECLINED",
            Self::Expired => "EXPIRED",
        }
    }

    /// Terminal states absorb every further transition.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        !matches!(self, Self::Pending)
    }
}

impl fmt::Display for InvitationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for InvitationStatus {
    type Err = crate::error::AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(Self::Pending),
            "ACCEPTED" => Ok(Self::Accepted),
            "DECLINED" => Ok(Self::Declined),
            "EXPIRED" => Ok(Self::Expired),
            other => Err(crate::error::AppError::Internal(format!(
                "unknown invitation status: {other}"
            ))),
        }
    }
}

/// An invitation for an email address to join a trip.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Invitation {
    /// Invitation identifier.
    pub id: InvitationId,
    /// Trip being joined.
    pub trip_id: TripId,
    /// User who sent it.
    pub inviter_id: UserId,
    /// Lower-cased invitee email.
    pub invitee_email: String,
    /// Set when the email belonged to a registered user at creation time.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub invitee_id: Option<UserId>,
    /// Role granted on acceptance.
    pub role: MemberRole,
    /// Current status.
    pub status: InvitationStatus,
    /// Signed bearer token for out-of-band flows.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    /// Expiry instant.
    pub expires_at: DateTime<Utc>,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Last status change.
    pub updated_at: DateTime<Utc>,
}

impl Invitation {
    /// Returns `true` if the invitation is pending but past its expiry.
    #[must_use]
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.status == InvitationStatus::Pending && self.expires_at < now
    }

    /// Normalizes an email for storage and comparison.
    #[must_use]
    pub fn normalize_email(email: &str) -> String {
        email.trim().to_lowercase()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn pending(expires_at: DateTime<Utc>) -> Invitation {
        let now = Utc::now();
        Invitation {
            id: InvitationId::new(),
            trip_id: TripId::new(),
            inviter_id: UserId::new(),
            invitee_email: "alice@example.com".to_string(),
            invitee_id: None,
            role: MemberRole::Member,
            status: InvitationStatus::Pending,
            token: None,
            expires_at,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn only_pending_is_non_terminal() {
        assert!(!InvitationStatus::Pending.is_terminal());
        assert!(InvitationStatus::Accepted.is_terminal());
        assert!(InvitationStatus::Declined.is_terminal());
        assert!(InvitationStatus::Expired.is_terminal());
    }

    #[test]
    fn expiry_applies_only_to_pending() {
        let now = Utc::now();
        let mut inv = pending(now - Duration::minutes(1));
        assert!(inv.is_expired_at(now));
        inv.status = InvitationStatus::Accepted;
        assert!(!inv.is_expired_at(now));
        assert!(!pending(now + Duration::days(1)).is_expired_at(now));
    }

    #[test]
    fn normalizes_email() {
        assert_eq!(Invitation::normalize_email("  Bob@Example.COM "), "bob@example.com");
    }
}
