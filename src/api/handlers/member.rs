//! Member management and trip status handlers.

use axum::extract::{Path, State};
use axum::response::IntoResponse;
use axum::routing::{delete, patch, put};
use axum::{Json, Router};

use crate::api::dto::{ChangeRoleRequest, MembershipDto, TripDto, UpdateTripStatusRequest};
use crate::app_state::AppState;
use crate::auth::AuthUser;
use crate::domain::{MemberRole, TripId, TripStatus, UserId};
use crate::error::{AppError, ErrorResponse};

/// `PUT /trips/{trip_id}/members/{user_id}/role` — Change a member's role.
///
/// # Errors
///
/// Returns [`AppError`] if the caller lacks the role, the target is not a
/// member, or the trip would lose its last owner.
#[utoipa::path(
    put,
    path = "/api/v1/trips/{trip_id}/members/{user_id}/role",
    tag = "Members",
    summary = "Change member role",
    params(
        ("trip_id" = String, Path, description = "Trip UUID"),
        ("user_id" = String, Path, description = "Member user UUID"),
    ),
    request_body = ChangeRoleRequest,
    responses(
        (status = 200, description = "Updated membership", body = MembershipDto),
        (status = 403, description = "Caller may not change roles", body = ErrorResponse),
        (status = 404, description = "Not a member", body = ErrorResponse),
        (status = 409, description = "Last owner", body = ErrorResponse),
    )
)]
pub async fn change_role(
    State(state): State<AppState>,
    Path((trip_id, user_id)): Path<(TripId, UserId)>,
    AuthUser(actor): AuthUser,
    Json(req): Json<ChangeRoleRequest>,
) -> Result<impl IntoResponse, AppError> {
    let role: MemberRole = req.role.parse()?;
    let membership = state
        .members
        .change_role(trip_id, &actor, user_id, role)
        .await?;
    Ok(Json(MembershipDto::from(membership)))
}

/// `DELETE /trips/{trip_id}/members/{user_id}` — Remove a member or leave.
///
/// # Errors
///
/// Returns [`AppError`] if the caller may not remove the target or the trip
/// would lose its last owner.
#[utoipa::path(
    delete,
    path = "/api/v1/trips/{trip_id}/members/{user_id}",
    tag = "Members",
    summary = "Remove member",
    description = "Removes a member. Members may remove themselves; removing others needs ADMIN, removing an owner needs OWNER. Live connections of the removed user lose the trip.",
    params(
        ("trip_id" = String, Path, description = "Trip UUID"),
        ("user_id" = String, Path, description = "Member user UUID"),
    ),
    responses(
        (status = 200, description = "Membership deactivated", body = MembershipDto),
        (status = 403, description = "Caller may not remove this member", body = ErrorResponse),
        (status = 409, description = "Last owner", body = ErrorResponse),
    )
)]
pub async fn remove_member(
    State(state): State<AppState>,
    Path((trip_id, user_id)): Path<(TripId, UserId)>,
    AuthUser(actor): AuthUser,
) -> Result<impl IntoResponse, AppError> {
    let membership = state.members.remove_member(trip_id, &actor, user_id).await?;
    Ok(Json(MembershipDto::from(membership)))
}

/// `PATCH /trips/{trip_id}/status` — Move the trip along its lifecycle.
///
/// # Errors
///
/// Returns [`AppError::InvalidTransition`] for an illegal edge.
#[utoipa::path(
    patch,
    path = "/api/v1/trips/{trip_id}/status",
    tag = "Trips",
    summary = "Update trip status",
    params(("trip_id" = String, Path, description = "Trip UUID")),
    request_body = UpdateTripStatusRequest,
    responses(
        (status = 200, description = "Updated trip", body = TripDto),
        (status = 403, description = "Caller is not an admin", body = ErrorResponse),
        (status = 409, description = "Transition not allowed", body = ErrorResponse),
    )
)]
pub async fn update_trip_status(
    State(state): State<AppState>,
    Path(trip_id): Path<TripId>,
    AuthUser(actor): AuthUser,
    Json(req): Json<UpdateTripStatusRequest>,
) -> Result<impl IntoResponse, AppError> {
    let next: TripStatus = req.status.parse()?;
    let trip = state
        .members
        .update_trip_status(trip_id, &actor, next)
        .await?;
    Ok(Json(TripDto::from(trip)))
}

/// Member and trip routes.
pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/trips/{trip_id}/members/{user_id}/role", put(change_role))
        .route("/trips/{trip_id}/members/{user_id}", delete(remove_member))
        .route("/trips/{trip_id}/status", patch(update_trip_status))
}
