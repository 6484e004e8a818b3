//! REST endpoint handlers organized by resource.

pub mod chat;
pub mod invitation;
pub mod member;
pub mod system;

use axum::Router;
use axum::routing::get;

use crate::app_state::AppState;
use crate::ws::handler::{trip_events_handler, ws_handler};

/// Composes all resource routes under `/api/v1`.
pub fn routes() -> Router<AppState> {
    Router::new()
        .merge(invitation::routes())
        .merge(chat::routes())
        .merge(member::routes())
        .route("/ws", get(ws_handler))
        .route("/trips/{trip_id}/ws/events", get(trip_events_handler))
}
