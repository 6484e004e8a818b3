//! Routes inbound client frames to the chat pipeline.
//!
//! Every chat request is validated, then admission-checked against the rate
//! limiter before it reaches the pipeline, and answered with exactly one
//! [`Ack`]. Malformed requests never consume quota. Typing
//! indicators are fire-and-forget and silently dropped when over quota.

use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde_json::Value;

use super::connection::{Connection, ConnectionScope};
use super::messages::{
    Ack, AckKind, ChatMessagePayload, InboundFrame, InboundKind, ReactionPayload,
    ReadReceiptPayload, ServerFrame, TypingPayload,
};
use crate::app_state::AppState;
use crate::chat::{validate_content, validate_reaction};
use crate::domain::{MessageId, TripId};
use crate::error::AppError;
use crate::limiter::Action;

/// Handles one text frame from `conn`.
pub async fn handle_text(state: &AppState, conn: &Arc<Connection>, text: &str) {
    let frame: InboundFrame = match serde_json::from_str(text) {
        Ok(frame) => frame,
        Err(e) => {
            tracing::debug!(connection = %conn.id(), error = %e, "malformed frame");
            conn.send_error(&AppError::Validation(format!("malformed frame: {e}")))
                .await;
            return;
        }
    };
    let Some(kind) = InboundKind::parse(&frame.kind) else {
        conn.send_error(&AppError::Validation(format!(
            "unknown message type: {}",
            frame.kind
        )))
        .await;
        return;
    };

    match kind {
        InboundKind::Ping => {
            let _ = conn.send_json(&ServerFrame::pong()).await;
        }
        InboundKind::ChatMessage => {
            let ack = chat_message(state, conn, frame.payload).await;
            let _ = conn.send_json(&ack).await;
        }
        InboundKind::ChatReaction => {
            let ack = chat_reaction(state, conn, frame.payload).await;
            let _ = conn.send_json(&ack).await;
        }
        InboundKind::ReadReceipt => {
            let ack = read_receipt(state, conn, frame.payload).await;
            let _ = conn.send_json(&ack).await;
        }
        InboundKind::Typing => typing(state, conn, frame.payload).await,
    }
}

async fn chat_message(state: &AppState, conn: &Arc<Connection>, payload: Value) -> Ack {
    let kind = AckKind::MessageAck;
    let payload: ChatMessagePayload = match decode(payload) {
        Ok(p) => p,
        Err(e) => return Ack::failed(kind, None, &e),
    };
    let result = async {
        let trip = resolve_trip(conn, payload.trip_id)?;
        validate_content(&payload.text)?;
        admit(state, conn, Action::ChatMessage).await?;
        state
            .chat
            .send_message(trip, conn.user_id(), &payload.text, payload.reply_to_id)
            .await
    }
    .await;
    match result {
        Ok(message) => Ack::ok(kind, Some(message.id)),
        Err(e) => Ack::failed(kind, None, &e),
    }
}

async fn chat_reaction(state: &AppState, conn: &Arc<Connection>, payload: Value) -> Ack {
    let kind = AckKind::ReactionAck;
    let payload: ReactionPayload = match decode(payload) {
        Ok(p) => p,
        Err(e) => return Ack::failed(kind, None, &e),
    };
    let message_id = Some(payload.message_id);
    let result = async {
        let trip = resolve_trip(conn, payload.trip_id)?;
        validate_reaction(&payload.reaction)?;
        admit(state, conn, Action::ChatReaction).await?;
        state
            .chat
            .react(
                trip,
                conn.user_id(),
                payload.message_id,
                &payload.reaction,
                payload.action,
            )
            .await
    }
    .await;
    ack(kind, message_id, result.map(|_| ()))
}

async fn read_receipt(state: &AppState, conn: &Arc<Connection>, payload: Value) -> Ack {
    let kind = AckKind::ReadReceiptAck;
    let payload: ReadReceiptPayload = match decode(payload) {
        Ok(p) => p,
        Err(e) => return Ack::failed(kind, None, &e),
    };
    let message_id = Some(payload.last_read_message_id);
    let result = async {
        let trip = resolve_trip(conn, payload.trip_id)?;
        admit(state, conn, Action::ChatReadReceipt).await?;
        state
            .chat
            .mark_read(trip, conn.user_id(), payload.last_read_message_id)
            .await
    }
    .await;
    ack(kind, message_id, result.map(|_| ()))
}

async fn typing(state: &AppState, conn: &Arc<Connection>, payload: Value) {
    let payload: TypingPayload = match decode(payload) {
        Ok(p) => p,
        Err(e) => {
            conn.send_error(&e).await;
            return;
        }
    };
    let trip = match resolve_trip(conn, payload.trip_id) {
        Ok(trip) => trip,
        Err(e) => {
            conn.send_error(&e).await;
            return;
        }
    };
    if admit(state, conn, Action::ChatTyping).await.is_err() {
        return;
    }
    state
        .chat
        .typing(trip, conn.user_id(), payload.is_typing)
        .await;
}

fn ack(kind: AckKind, message_id: Option<MessageId>, result: Result<(), AppError>) -> Ack {
    match result {
        Ok(()) => Ack::ok(kind, message_id),
        Err(e) => Ack::failed(kind, message_id, &e),
    }
}

fn decode<T: DeserializeOwned>(payload: Value) -> Result<T, AppError> {
    serde_json::from_value(payload).map_err(|e| AppError::Validation(format!("invalid payload: {e}")))
}

/// Picks the trip a request targets. A trip-bound connection may omit
/// `trip_id` but not name another trip; the multi-trip endpoint must name
/// one of its attached trips.
fn resolve_trip(conn: &Connection, requested: Option<TripId>) -> Result<TripId, AppError> {
    let trip = match (conn.scope(), requested) {
        (ConnectionScope::Trip(bound), None) => bound,
        (ConnectionScope::Trip(bound), Some(trip)) if trip == bound => bound,
        (ConnectionScope::Trip(_), Some(_)) => return Err(AppError::NotMember),
        (ConnectionScope::AllTrips, Some(trip)) => trip,
        (ConnectionScope::AllTrips, None) => {
            return Err(AppError::Validation("payload.trip_id is required".to_string()));
        }
    };
    if conn.role_in(trip).is_none() {
        return Err(AppError::NotMember);
    }
    Ok(trip)
}

async fn admit(state: &AppState, conn: &Connection, action: Action) -> Result<(), AppError> {
    let decision = state.limiter.check_action(action, conn.user_id()).await;
    if decision.allowed {
        Ok(())
    } else {
        Err(AppError::RateLimited {
            retry_after_secs: decision.retry_after_secs(),
        })
    }
}
