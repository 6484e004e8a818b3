//! Shared DTO types used across multiple endpoints.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::{IntoParams, ToSchema};

use crate::domain::{Membership, Trip, TripId, User, UserId};

/// Pagination query parameters for list endpoints.
#[derive(Debug, Clone, Default, Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct PaginationParams {
    /// Page size; defaults to 50, capped at 100.
    pub limit: Option<u32>,
    /// Items to skip.
    pub offset: Option<u32>,
}

/// Pagination metadata included in list responses.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct PaginationMeta {
    /// Effective page size.
    pub limit: u32,
    /// Items skipped.
    pub offset: u32,
    /// Items in this page.
    pub count: usize,
}

/// A membership row.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct MembershipDto {
    /// Trip.
    #[schema(value_type = String)]
    pub trip_id: TripId,
    /// Member.
    #[schema(value_type = String)]
    pub user_id: UserId,
    /// `OWNER`, `ADMIN`, `MEMBER` or `NONE`.
    pub role: String,
    /// `ACTIVE` or `INACTIVE`.
    pub status: String,
    /// Last role or status change.
    pub updated_at: DateTime<Utc>,
}

impl From<Membership> for MembershipDto {
    fn from(m: Membership) -> Self {
        Self {
            trip_id: m.trip_id,
            user_id: m.user_id,
            role: m.role.to_string(),
            status: m.status.as_str().to_string(),
            updated_at: m.updated_at,
        }
    }
}

/// Trip summary.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct TripDto {
    /// Trip identifier.
    #[schema(value_type = String)]
    pub id: TripId,
    /// Display name.
    pub name: String,
    /// Description.
    pub description: String,
    /// Destination address, if known.
    pub destination: Option<String>,
    /// Planned start.
    pub start_date: DateTime<Utc>,
    /// Planned end.
    pub end_date: DateTime<Utc>,
    /// Lifecycle status.
    pub status: String,
    /// Last modification.
    pub updated_at: DateTime<Utc>,
}

impl From<Trip> for TripDto {
    fn from(t: Trip) -> Self {
        Self {
            id: t.id,
            name: t.name,
            description: t.description,
            destination: t.destination.address,
            start_date: t.start_date,
            end_date: t.end_date,
            status: t.status.to_string(),
            updated_at: t.updated_at,
        }
    }
}

/// Public user profile.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct UserSummaryDto {
    /// User identifier.
    #[schema(value_type = String)]
    pub id: UserId,
    /// Handle.
    pub username: String,
    /// Display name.
    pub display_name: Option<String>,
    /// Avatar URL.
    pub avatar_url: Option<String>,
}

impl From<User> for UserSummaryDto {
    fn from(u: User) -> Self {
        Self {
            id: u.id,
            username: u.username,
            display_name: u.display_name,
            avatar_url: u.avatar_url,
        }
    }
}
