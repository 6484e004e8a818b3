//! Member management and trip status DTOs.

use serde::Deserialize;
use utoipa::ToSchema;

/// Request body for `PUT /trips/{trip_id}/members/{user_id}/role`.
#[derive(Debug, Deserialize, ToSchema)]
pub struct ChangeRoleRequest {
    /// `OWNER`, `ADMIN` or `MEMBER`.
    pub role: String,
}

/// Request body for `PATCH /trips/{trip_id}/status`.
#[derive(Debug, Deserialize, ToSchema)]
pub struct UpdateTripStatusRequest {
    /// `ACTIVE`, `COMPLETED` or `CANCELLED`.
    pub status: String,
}
