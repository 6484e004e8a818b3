//! Invitation handlers: create, list, revoke, accept, decline, details and
//! the deep-link redirect.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::http::header::LOCATION;
use axum::response::IntoResponse;
use axum::routing::{delete, get, post};
use axum::{Json, Router};

use crate::api::dto::{
    CreateInvitationRequest, InvitationDetailsResponse, InvitationDto, InvitationListResponse,
    MembershipDto, TokenQuery, TokenRequest,
};
use crate::app_state::AppState;
use crate::auth::AuthUser;
use crate::domain::{InvitationId, MemberRole, TripId};
use crate::error::{AppError, ErrorResponse};

/// `POST /trips/{trip_id}/invitations` — Invite someone by email.
///
/// # Errors
///
/// Returns [`AppError`] if the caller may not invite, the email or role is
/// invalid, or a pending invitation already exists.
#[utoipa::path(
    post,
    path = "/api/v1/trips/{trip_id}/invitations",
    tag = "Invitations",
    summary = "Create an invitation",
    description = "Invites an email address to the trip. Only ADMIN and OWNER may invite; the role defaults to MEMBER.",
    params(("trip_id" = String, Path, description = "Trip UUID")),
    request_body = CreateInvitationRequest,
    responses(
        (status = 201, description = "Invitation created", body = InvitationDto),
        (status = 400, description = "Invalid email or role", body = ErrorResponse),
        (status = 403, description = "Caller may not invite", body = ErrorResponse),
        (status = 409, description = "Pending invitation or membership exists", body = ErrorResponse),
    )
)]
pub async fn create_invitation(
    State(state): State<AppState>,
    Path(trip_id): Path<TripId>,
    AuthUser(user): AuthUser,
    Json(req): Json<CreateInvitationRequest>,
) -> Result<impl IntoResponse, AppError> {
    let role = match req.role.as_deref() {
        Some(role) => role.parse::<MemberRole>()?,
        None => MemberRole::Member,
    };
    let invitation = state
        .invitations
        .create(trip_id, &user, &req.email, role)
        .await?;
    Ok((StatusCode::CREATED, Json(InvitationDto::from(invitation))))
}

/// `GET /trips/{trip_id}/invitations` — List a trip's invitations.
///
/// # Errors
///
/// Returns [`AppError::NotMember`] if the caller is not a member.
#[utoipa::path(
    get,
    path = "/api/v1/trips/{trip_id}/invitations",
    tag = "Invitations",
    summary = "List invitations",
    params(("trip_id" = String, Path, description = "Trip UUID")),
    responses(
        (status = 200, description = "Invitations of the trip", body = InvitationListResponse),
        (status = 403, description = "Not a member", body = ErrorResponse),
    )
)]
pub async fn list_invitations(
    State(state): State<AppState>,
    Path(trip_id): Path<TripId>,
    AuthUser(user): AuthUser,
) -> Result<impl IntoResponse, AppError> {
    let invitations = state.invitations.list_for_trip(trip_id, &user).await?;
    Ok(Json(InvitationListResponse {
        data: invitations.into_iter().map(Into::into).collect(),
    }))
}

/// `DELETE /trips/{trip_id}/invitations/{invitation_id}` — Revoke.
///
/// # Errors
///
/// Returns [`AppError`] if the invitation is not in the trip, the caller is
/// not an admin, or it is no longer pending.
#[utoipa::path(
    delete,
    path = "/api/v1/trips/{trip_id}/invitations/{invitation_id}",
    tag = "Invitations",
    summary = "Revoke an invitation",
    params(
        ("trip_id" = String, Path, description = "Trip UUID"),
        ("invitation_id" = String, Path, description = "Invitation UUID"),
    ),
    responses(
        (status = 200, description = "Invitation revoked", body = InvitationDto),
        (status = 404, description = "Invitation not found", body = ErrorResponse),
        (status = 409, description = "Invitation not pending", body = ErrorResponse),
    )
)]
pub async fn revoke_invitation(
    State(state): State<AppState>,
    Path((trip_id, invitation_id)): Path<(TripId, InvitationId)>,
    AuthUser(user): AuthUser,
) -> Result<impl IntoResponse, AppError> {
    let invitation = state
        .invitations
        .revoke(trip_id, invitation_id, &user)
        .await?;
    Ok(Json(InvitationDto::from(invitation)))
}

/// `POST /invitations/accept` — Accept by token.
///
/// # Errors
///
/// Returns [`AppError`] with `AUTHN_FAILED`, `NOT_FOUND`, `NOT_PENDING`,
/// `AUTH_MISMATCH`, `EMAIL_MISMATCH` or `ALREADY_MEMBER`.
#[utoipa::path(
    post,
    path = "/api/v1/invitations/accept",
    tag = "Invitations",
    summary = "Accept an invitation",
    request_body = TokenRequest,
    responses(
        (status = 200, description = "Membership created", body = MembershipDto),
        (status = 401, description = "Invalid token", body = ErrorResponse),
        (status = 403, description = "Invitation belongs to someone else", body = ErrorResponse),
        (status = 409, description = "Not pending or already a member", body = ErrorResponse),
    )
)]
pub async fn accept_invitation(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Json(req): Json<TokenRequest>,
) -> Result<impl IntoResponse, AppError> {
    let membership = state.invitations.accept(&req.token, &user).await?;
    Ok(Json(MembershipDto::from(membership)))
}

/// `POST /invitations/{invitation_id}/accept` — Accept by id.
///
/// # Errors
///
/// As [`accept_invitation`], without the token check.
#[utoipa::path(
    post,
    path = "/api/v1/invitations/{invitation_id}/accept",
    tag = "Invitations",
    summary = "Accept an invitation by id",
    params(("invitation_id" = String, Path, description = "Invitation UUID")),
    responses(
        (status = 200, description = "Membership created", body = MembershipDto),
        (status = 404, description = "Invitation not found", body = ErrorResponse),
        (status = 409, description = "Not pending or already a member", body = ErrorResponse),
    )
)]
pub async fn accept_invitation_by_id(
    State(state): State<AppState>,
    Path(invitation_id): Path<InvitationId>,
    AuthUser(user): AuthUser,
) -> Result<impl IntoResponse, AppError> {
    let membership = state.invitations.accept_by_id(invitation_id, &user).await?;
    Ok(Json(MembershipDto::from(membership)))
}

/// `POST /invitations/decline` — Decline by token.
///
/// # Errors
///
/// Returns [`AppError`] with `AUTHN_FAILED`, `NOT_FOUND`, `NOT_PENDING`,
/// `AUTH_MISMATCH` or `EMAIL_MISMATCH`.
#[utoipa::path(
    post,
    path = "/api/v1/invitations/decline",
    tag = "Invitations",
    summary = "Decline an invitation",
    request_body = TokenRequest,
    responses(
        (status = 200, description = "Invitation declined", body = InvitationDto),
        (status = 401, description = "Invalid token", body = ErrorResponse),
        (status = 409, description = "Not pending", body = ErrorResponse),
    )
)]
pub async fn decline_invitation(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Json(req): Json<TokenRequest>,
) -> Result<impl IntoResponse, AppError> {
    let invitation = state.invitations.decline(&req.token, &user).await?;
    Ok(Json(InvitationDto::from(invitation)))
}

/// `POST /invitations/{invitation_id}/decline` — Decline by id.
///
/// # Errors
///
/// As [`decline_invitation`], without the token check.
#[utoipa::path(
    post,
    path = "/api/v1/invitations/{invitation_id}/decline",
    tag = "Invitations",
    summary = "Decline an invitation by id",
    params(("invitation_id" = String, Path, description = "Invitation UUID")),
    responses(
        (status = 200, description = "Invitation declined", body = InvitationDto),
        (status = 404, description = "Invitation not found", body = ErrorResponse),
        (status = 409, description = "Not pending", body = ErrorResponse),
    )
)]
pub async fn decline_invitation_by_id(
    State(state): State<AppState>,
    Path(invitation_id): Path<InvitationId>,
    AuthUser(user): AuthUser,
) -> Result<impl IntoResponse, AppError> {
    let invitation = state.invitations.decline_by_id(invitation_id, &user).await?;
    Ok(Json(InvitationDto::from(invitation)))
}

/// `GET /invitations/details?token=` — Public invitation preview.
///
/// # Errors
///
/// Returns [`AppError::Validation`] without a token, otherwise as the
/// token lookup fails.
#[utoipa::path(
    get,
    path = "/api/v1/invitations/details",
    tag = "Invitations",
    summary = "Invitation details",
    description = "Returns the invitation, its trip, the inviter and the member count for the join page. No bearer token required.",
    params(TokenQuery),
    responses(
        (status = 200, description = "Invitation details", body = InvitationDetailsResponse),
        (status = 400, description = "Missing token", body = ErrorResponse),
        (status = 401, description = "Invalid token", body = ErrorResponse),
        (status = 404, description = "Invitation not found", body = ErrorResponse),
    )
)]
pub async fn invitation_details(
    State(state): State<AppState>,
    Query(query): Query<TokenQuery>,
) -> Result<impl IntoResponse, AppError> {
    let token = query
        .token
        .filter(|t| !t.trim().is_empty())
        .ok_or_else(|| AppError::Validation("token is required".to_string()))?;
    let details = state.invitations.details(&token).await?;
    Ok(Json(InvitationDetailsResponse::from(details)))
}

/// `GET /invitations/join?token=` — Deep link into the frontend.
#[utoipa::path(
    get,
    path = "/api/v1/invitations/join",
    tag = "Invitations",
    summary = "Resolve an invitation link",
    description = "Redirects (302) to the frontend join page, the trip page if already joined, or an error page.",
    params(TokenQuery),
    responses(
        (status = 302, description = "Redirect to the frontend"),
    )
)]
pub async fn join_redirect(
    State(state): State<AppState>,
    Query(query): Query<TokenQuery>,
) -> impl IntoResponse {
    let target = state
        .invitations
        .resolve_deep_link(query.token.as_deref())
        .await;
    (StatusCode::FOUND, [(LOCATION, target)])
}

/// Invitation routes.
pub fn routes() -> Router<AppState> {
    Router::new()
        .route(
            "/trips/{trip_id}/invitations",
            post(create_invitation).get(list_invitations),
        )
        .route(
            "/trips/{trip_id}/invitations/{invitation_id}",
            delete(revoke_invitation),
        )
        .route("/invitations/accept", post(accept_invitation))
        .route("/invitations/decline", post(decline_invitation))
        .route("/invitations/details", get(invitation_details))
        .route("/invitations/join", get(join_redirect))
        .route(
            "/invitations/{invitation_id}/accept",
            post(accept_invitation_by_id),
        )
        .route(
            "/invitations/{invitation_id}/decline",
            post(decline_invitation_by_id),
        )
}
