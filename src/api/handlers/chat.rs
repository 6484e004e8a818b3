//! Chat handlers: history, send, reactions and read cursor.
//!
//! These go through the same pipeline as WebSocket frames, so an HTTP
//! send is persisted, sequenced and published exactly like a socket one.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{delete, get, post};
use axum::{Json, Router};

use crate::api::dto::{
    MessageDto, MessageListResponse, PaginationMeta, PaginationParams, ReactionRequest,
    ReactionResponse, ReadCursorRequest, ReadCursorResponse, SendMessageRequest,
};
use crate::app_state::AppState;
use crate::auth::AuthUser;
use crate::chat::pipeline::{DEFAULT_PAGE_SIZE, MAX_PAGE_SIZE};
use crate::domain::{MessageId, ReactionAction, TripId, UserId};
use crate::error::{AppError, ErrorResponse};

/// `GET /trips/{trip_id}/chat/messages` — Message history, newest first.
///
/// # Errors
///
/// Returns [`AppError::NotMember`] if the caller is not a member.
#[utoipa::path(
    get,
    path = "/api/v1/trips/{trip_id}/chat/messages",
    tag = "Chat",
    summary = "List messages",
    params(("trip_id" = String, Path, description = "Trip UUID"), PaginationParams),
    responses(
        (status = 200, description = "Page of messages", body = MessageListResponse),
        (status = 403, description = "Not a member", body = ErrorResponse),
    )
)]
pub async fn list_messages(
    State(state): State<AppState>,
    Path(trip_id): Path<TripId>,
    AuthUser(user): AuthUser,
    Query(params): Query<PaginationParams>,
) -> Result<impl IntoResponse, AppError> {
    let messages = state
        .chat
        .list_messages(trip_id, user.id, params.limit, params.offset)
        .await?;
    let pagination = PaginationMeta {
        limit: params
            .limit
            .unwrap_or(DEFAULT_PAGE_SIZE)
            .clamp(1, MAX_PAGE_SIZE),
        offset: params.offset.unwrap_or(0),
        count: messages.len(),
    };
    Ok(Json(MessageListResponse {
        data: messages.into_iter().map(Into::into).collect(),
        pagination,
    }))
}

/// `POST /trips/{trip_id}/chat/messages` — Send a message.
///
/// # Errors
///
/// Returns [`AppError`] for non-members, invalid content or store failure.
#[utoipa::path(
    post,
    path = "/api/v1/trips/{trip_id}/chat/messages",
    tag = "Chat",
    summary = "Send a message",
    params(("trip_id" = String, Path, description = "Trip UUID")),
    request_body = SendMessageRequest,
    responses(
        (status = 201, description = "Message stored and published", body = MessageDto),
        (status = 400, description = "Empty or oversized content", body = ErrorResponse),
        (status = 403, description = "Not a member", body = ErrorResponse),
    )
)]
pub async fn send_message(
    State(state): State<AppState>,
    Path(trip_id): Path<TripId>,
    AuthUser(user): AuthUser,
    Json(req): Json<SendMessageRequest>,
) -> Result<impl IntoResponse, AppError> {
    let message = state
        .chat
        .send_message(trip_id, user.id, &req.content, req.reply_to_id)
        .await?;
    Ok((StatusCode::CREATED, Json(MessageDto::from(message))))
}

/// `POST /trips/{trip_id}/chat/messages/{message_id}/reactions`.
///
/// # Errors
///
/// Returns [`AppError`] for non-members, unknown messages or a bad emoji.
#[utoipa::path(
    post,
    path = "/api/v1/trips/{trip_id}/chat/messages/{message_id}/reactions",
    tag = "Chat",
    summary = "Add a reaction",
    params(
        ("trip_id" = String, Path, description = "Trip UUID"),
        ("message_id" = String, Path, description = "Message UUID"),
    ),
    request_body = ReactionRequest,
    responses(
        (status = 200, description = "Reaction applied", body = ReactionResponse),
        (status = 404, description = "Message not found", body = ErrorResponse),
    )
)]
pub async fn add_reaction(
    State(state): State<AppState>,
    Path((trip_id, message_id)): Path<(TripId, MessageId)>,
    AuthUser(user): AuthUser,
    Json(req): Json<ReactionRequest>,
) -> Result<impl IntoResponse, AppError> {
    react(&state, trip_id, message_id, user.id, req.emoji, ReactionAction::Add).await
}

/// `DELETE /trips/{trip_id}/chat/messages/{message_id}/reactions/{emoji}`.
///
/// # Errors
///
/// Returns [`AppError`] for non-members or unknown messages.
#[utoipa::path(
    delete,
    path = "/api/v1/trips/{trip_id}/chat/messages/{message_id}/reactions/{emoji}",
    tag = "Chat",
    summary = "Remove a reaction",
    params(
        ("trip_id" = String, Path, description = "Trip UUID"),
        ("message_id" = String, Path, description = "Message UUID"),
        ("emoji" = String, Path, description = "Emoji, URL-encoded"),
    ),
    responses(
        (status = 200, description = "Reaction removed", body = ReactionResponse),
        (status = 404, description = "Message not found", body = ErrorResponse),
    )
)]
pub async fn remove_reaction(
    State(state): State<AppState>,
    Path((trip_id, message_id, emoji)): Path<(TripId, MessageId, String)>,
    AuthUser(user): AuthUser,
) -> Result<impl IntoResponse, AppError> {
    react(&state, trip_id, message_id, user.id, emoji, ReactionAction::Remove).await
}

async fn react(
    state: &AppState,
    trip_id: TripId,
    message_id: MessageId,
    user: UserId,
    emoji: String,
    action: ReactionAction,
) -> Result<Json<ReactionResponse>, AppError> {
    let changed = state
        .chat
        .react(trip_id, user, message_id, &emoji, action)
        .await?;
    Ok(Json(ReactionResponse {
        message_id,
        emoji: emoji.trim().to_string(),
        action: match action {
            ReactionAction::Add => "add",
            ReactionAction::Remove => "remove",
        }
        .to_string(),
        changed,
    }))
}

/// `POST /trips/{trip_id}/chat/read` — Advance the read cursor.
///
/// # Errors
///
/// Returns [`AppError`] for non-members or messages outside the trip.
#[utoipa::path(
    post,
    path = "/api/v1/trips/{trip_id}/chat/read",
    tag = "Chat",
    summary = "Update read cursor",
    description = "Moves the caller's read cursor forward. Older targets are accepted and leave the cursor where it is.",
    params(("trip_id" = String, Path, description = "Trip UUID")),
    request_body = ReadCursorRequest,
    responses(
        (status = 200, description = "Cursor after the update", body = ReadCursorResponse),
        (status = 404, description = "Message not found", body = ErrorResponse),
    )
)]
pub async fn update_read_cursor(
    State(state): State<AppState>,
    Path(trip_id): Path<TripId>,
    AuthUser(user): AuthUser,
    Json(req): Json<ReadCursorRequest>,
) -> Result<impl IntoResponse, AppError> {
    let update = state.chat.mark_read(trip_id, user.id, req.message_id).await?;
    Ok(Json(ReadCursorResponse::from(update)))
}

/// Chat routes.
pub fn routes() -> Router<AppState> {
    Router::new()
        .route(
            "/trips/{trip_id}/chat/messages",
            get(list_messages).post(send_message),
        )
        .route(
            "/trips/{trip_id}/chat/messages/{message_id}/reactions",
            post(add_reaction),
        )
        .route(
            "/trips/{trip_id}/chat/messages/{message_id}/reactions/{emoji}",
            delete(remove_reaction),
        )
        .route("/trips/{trip_id}/chat/read", post(update_read_cursor))
}
