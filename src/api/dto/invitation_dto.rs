//! Invitation DTOs: create, accept/decline, details, listing.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::{IntoParams, ToSchema};

use super::common_dto::{TripDto, UserSummaryDto};
use crate::domain::{Invitation, InvitationId, TripId, UserId};
use crate::invitation::InvitationDetails;

/// Request body for `POST /trips/{trip_id}/invitations`.
#[derive(Debug, Deserialize, ToSchema)]
pub struct CreateInvitationRequest {
    /// Invitee email address.
    pub email: String,
    /// `ADMIN` or `MEMBER`; defaults to `MEMBER`.
    #[serde(default)]
    pub role: Option<String>,
}

/// Body carrying an invitation token.
#[derive(Debug, Deserialize, ToSchema)]
pub struct TokenRequest {
    /// Signed invitation token.
    pub token: String,
}

/// Query carrying an optional invitation token.
#[derive(Debug, Default, Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct TokenQuery {
    /// Signed invitation token.
    pub token: Option<String>,
}

/// An invitation as returned by the API.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct InvitationDto {
    /// Invitation identifier.
    #[schema(value_type = String)]
    pub id: InvitationId,
    /// Trip.
    #[schema(value_type = String)]
    pub trip_id: TripId,
    /// Sender.
    #[schema(value_type = String)]
    pub inviter_id: UserId,
    /// Lower-cased invitee email.
    pub invitee_email: String,
    /// Invitee account, when the email was registered.
    #[schema(value_type = Option<String>)]
    pub invitee_id: Option<UserId>,
    /// Role granted on acceptance.
    pub role: String,
    /// `PENDING`, `ACCEPTED`, `DECLINED` or `EXPIRED`.
    pub status: String,
    /// Expiry.
    pub expires_at: DateTime<Utc>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Signed token; only shown to trip admins.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

impl From<Invitation> for InvitationDto {
    fn from(inv: Invitation) -> Self {
        Self {
            id: inv.id,
            trip_id: inv.trip_id,
            inviter_id: inv.inviter_id,
            invitee_email: inv.invitee_email,
            invitee_id: inv.invitee_id,
            role: inv.role.to_string(),
            status: inv.status.to_string(),
            expires_at: inv.expires_at,
            created_at: inv.created_at,
            token: inv.token,
        }
    }
}

/// List response for `GET /trips/{trip_id}/invitations`.
#[derive(Debug, Serialize, ToSchema)]
pub struct InvitationListResponse {
    /// Invitations, newest first.
    pub data: Vec<InvitationDto>,
}

/// Response for `GET /invitations/details`.
#[derive(Debug, Serialize, ToSchema)]
pub struct InvitationDetailsResponse {
    /// The invitation.
    pub invitation: InvitationDto,
    /// Trip being joined.
    pub trip: TripDto,
    /// Sender profile.
    pub inviter: Option<UserSummaryDto>,
    /// Active members.
    pub member_count: usize,
}

impl From<InvitationDetails> for InvitationDetailsResponse {
    fn from(d: InvitationDetails) -> Self {
        Self {
            invitation: d.invitation.into(),
            trip: d.trip.into(),
            inviter: d.inviter.map(Into::into),
            member_count: d.member_count,
        }
    }
}
