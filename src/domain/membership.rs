//! Trip membership: roles, status and the last-owner invariant.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{TripId, UserId};
use crate::error::AppError;

/// Role of a user within a trip.
///
/// Ordered by privilege: `OWNER > ADMIN > MEMBER > NONE`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MemberRole {
    /// Full control, including ownership transfer.
    Owner,
    /// May invite, revoke and manage members.
    Admin,
    /// Regular participant.
    Member,
    /// No privileges; treated as not a member.
    None,
}

impl MemberRole {
    /// Hierarchical privilege level; higher means more permissions.
    #[must_use]
    pub const fn level(self) -> u8 {
        match self {
            Self::Owner => 3,
            Self::Admin => 2,
            Self::Member => 1,
            Self::None => 0,
        }
    }

    /// Returns `true` if this role grants at least `required`.
    #[must_use]
    pub const fn is_authorized_for(self, required: Self) -> bool {
        self.level() > 0 && self.level() >= required.level()
    }

    /// Returns `true` for `ADMIN` and `OWNER`.
    #[must_use]
    pub const fn is_admin(self) -> bool {
        matches!(self, Self::Owner | Self::Admin)
    }

    /// Canonical upper-case name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Owner => "OWNER",
            Self::Admin => "ADMIN",
            Self::Member => "MEMBER",
            Self::None => "NONE",
        }
    }
}

impl fmt::Display for MemberRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for MemberRole {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "OWNER" => Ok(Self::Owner),
            "ADMIN" => Ok(Self::Admin),
            "MEMBER" => Ok(Self::Member),
            "NONE" => Ok(Self::None),
            other => Err(AppError::Validation(format!("unknown role: {other}"))),
        }
    }
}

/// Whether a membership is currently in effect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MembershipStatus {
    /// Membership is in effect.
    Active,
    /// Membership was removed or suspended.
    Inactive,
}

impl MembershipStatus {
    /// Canonical upper-case name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Active => "ACTIVE",
            Self::Inactive => "INACTIVE",
        }
    }
}

/// A user's role and status within one trip.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Membership {
    /// Trip the membership belongs to.
    pub trip_id: TripId,
    /// Member user.
    pub user_id: UserId,
    /// Granted role.
    pub role: MemberRole,
    /// Active or not.
    pub status: MembershipStatus,
    /// When the membership was created.
    pub created_at: DateTime<Utc>,
    /// Last role/status change.
    pub updated_at: DateTime<Utc>,
}

impl Membership {
    /// Creates an active membership.
    #[must_use]
    pub fn active(trip_id: TripId, user_id: UserId, role: MemberRole) -> Self {
        let now = Utc::now();
        Self {
            trip_id,
            user_id,
            role,
            status: MembershipStatus::Active,
            created_at: now,
            updated_at: now,
        }
    }

    /// Active with a real role. This is what attach and chat require.
    #[must_use]
    pub fn is_effective(&self) -> bool {
        self.status == MembershipStatus::Active && self.role != MemberRole::None
    }

    /// Active owner; counts toward the last-owner invariant.
    #[must_use]
    pub fn is_active_owner(&self) -> bool {
        self.status == MembershipStatus::Active && self.role == MemberRole::Owner
    }
}

/// Checks that replacing `target`'s membership with `(new_role, new_status)`
/// keeps at least one active owner among `members`.
///
/// # Errors
///
/// Returns [`AppError::LastOwner`] if the change would leave the trip
/// without an active owner.
pub fn ensure_owner_survives(
    members: &[Membership],
    target: UserId,
    new_role: MemberRole,
    new_status: MembershipStatus,
) -> Result<(), AppError> {
    let remaining = members
        .iter()
        .filter(|m| {
            if m.user_id == target {
                new_status == MembershipStatus::Active && new_role == MemberRole::Owner
            } else {
                m.is_active_owner()
            }
        })
        .count();
    if remaining == 0 {
        return Err(AppError::LastOwner);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn role_hierarchy() {
        assert!(MemberRole::Owner.is_authorized_for(MemberRole::Admin));
        assert!(MemberRole::Admin.is_authorized_for(MemberRole::Member));
        assert!(!MemberRole::Member.is_authorized_for(MemberRole::Admin));
        assert!(!MemberRole::None.is_authorized_for(MemberRole::None));
    }

    #[test]
    fn none_role_is_not_effective() {
        let mut m = Membership::active(TripId::new(), UserId::new(), MemberRole::None);
        assert!(!m.is_effective());
        m.role = MemberRole::Member;
        assert!(m.is_effective());
        m.status = MembershipStatus::Inactive;
        assert!(!m.is_effective());
    }

    #[test]
    fn demoting_the_only_owner_fails() {
        let trip = TripId::new();
        let owner = UserId::new();
        let members = vec![
            Membership::active(trip, owner, MemberRole::Owner),
            Membership::active(trip, UserId::new(), MemberRole::Admin),
        ];
        let result =
            ensure_owner_survives(&members, owner, MemberRole::Member, MembershipStatus::Active);
        assert_eq!(result, Err(AppError::LastOwner));
    }

    #[test]
    fn demoting_one_of_two_owners_succeeds() {
        let trip = TripId::new();
        let a = UserId::new();
        let members = vec![
            Membership::active(trip, a, MemberRole::Owner),
            Membership::active(trip, UserId::new(), MemberRole::Owner),
        ];
        assert!(
            ensure_owner_survives(&members, a, MemberRole::Member, MembershipStatus::Active)
                .is_ok()
        );
    }

    #[test]
    fn removing_the_only_owner_fails() {
        let trip = TripId::new();
        let owner = UserId::new();
        let members = vec![Membership::active(trip, owner, MemberRole::Owner)];
        assert_eq!(
            ensure_owner_survives(&members, owner, MemberRole::Owner, MembershipStatus::Inactive),
            Err(AppError::LastOwner)
        );
    }

    #[test]
    fn role_parses_case_insensitively() {
        assert_eq!("admin".parse::<MemberRole>().ok(), Some(MemberRole::Admin));
        assert!("superuser".parse::<MemberRole>().is_err());
    }
}
