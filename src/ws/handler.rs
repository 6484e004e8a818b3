//! Axum WebSocket upgrade handlers.
//!
//! Authentication, origin policy, admission and (for trip-bound sockets)
//! the membership check all happen before the upgrade, so a rejected
//! client gets a plain HTTP status instead of a socket that closes at once.

use std::sync::Arc;

use axum::extract::ws::{WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::http::HeaderMap;
use axum::http::header::ORIGIN;
use axum::response::{IntoResponse, Response};

use super::connection::{
    self, CloseReason, Connection, ConnectionScope, ConnectionState, attach_trip,
};
use super::messages::ServerFrame;
use crate::app_state::AppState;
use crate::auth::AuthUser;
use crate::config::WsConfig;
use crate::domain::{TripId, User};
use crate::error::AppError;
use crate::limiter::Action;
use crate::retry::with_deadline;
use crate::store::require_member;

/// `GET /ws`: one socket for every trip the caller belongs to.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    upgrade(ws, state, user, &headers, ConnectionScope::AllTrips).await
}

/// `GET /trips/{trip_id}/ws/events`: a socket bound to one trip.
pub async fn trip_events_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Path(trip_id): Path<TripId>,
    AuthUser(user): AuthUser,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    upgrade(ws, state, user, &headers, ConnectionScope::Trip(trip_id)).await
}

async fn upgrade(
    ws: WebSocketUpgrade,
    state: AppState,
    user: User,
    headers: &HeaderMap,
    scope: ConnectionScope,
) -> Result<Response, AppError> {
    let handshake = state.config.ws.handshake_timeout;
    with_deadline(handshake, "websocket handshake", admit(&state, &user, headers, scope)).await?;

    let max = state.config.ws.max_message_bytes;
    Ok(ws
        .max_message_size(max)
        .max_frame_size(max)
        .on_upgrade(move |socket| session(socket, state, user, scope))
        .into_response())
}

async fn admit(
    state: &AppState,
    user: &User,
    headers: &HeaderMap,
    scope: ConnectionScope,
) -> Result<(), AppError> {
    check_origin(&state.config.ws, headers)?;
    if !state.supervisor.is_accepting() {
        return Err(AppError::Unavailable("server is shutting down".to_string()));
    }
    let decision = state.limiter.check_action(Action::Connect, user.id).await;
    if !decision.allowed {
        return Err(AppError::RateLimited {
            retry_after_secs: decision.retry_after_secs(),
        });
    }
    if let ConnectionScope::Trip(trip) = scope {
        if state.store.get_trip(trip).await?.is_none() {
            return Err(AppError::NotFound("trip".to_string()));
        }
        require_member(state.store.as_ref(), trip, user.id, state.config.ws.lookup_timeout).await?;
    }
    Ok(())
}

/// An empty allow-list accepts everything. Requests without an `Origin`
/// header are not browsers and are always accepted.
fn check_origin(config: &WsConfig, headers: &HeaderMap) -> Result<(), AppError> {
    if config.allowed_origins.is_empty() {
        return Ok(());
    }
    let Some(origin) = headers.get(ORIGIN).and_then(|v| v.to_str().ok()) else {
        return Ok(());
    };
    if config
        .allowed_origins
        .iter()
        .any(|allowed| allowed == "*" || allowed.eq_ignore_ascii_case(origin))
    {
        return Ok(());
    }
    if config.strict_origins {
        return Err(AppError::Forbidden(format!("origin {origin} is not allowed")));
    }
    tracing::warn!(origin, "websocket from unlisted origin");
    Ok(())
}

async fn session(socket: WebSocket, state: AppState, user: User, scope: ConnectionScope) {
    let ws_cfg = &state.config.ws;
    let (conn, outbound) = Connection::new(user.id, scope, ws_cfg.outbound_queue, ws_cfg.write_wait);
    if let Err(e) = state.supervisor.register(&conn).await {
        tracing::info!(user_id = %user.id, error = %e, "refusing websocket");
        conn.close(CloseReason::ServerShutdown);
        connection::drive(socket, conn, outbound, state).await;
        return;
    }
    conn.advance(ConnectionState::Authenticating);

    let welcome = match attach(&state, &conn, &user, scope).await {
        Ok(welcome) => welcome,
        Err(reason) => {
            conn.close(reason);
            connection::drive(socket, conn, outbound, state).await;
            return;
        }
    };
    conn.advance(ConnectionState::Attached);
    tracing::info!(
        connection = %conn.id(),
        user_id = %user.id,
        trips = conn.attached_trips().len(),
        "ws connection attached"
    );
    let _ = conn.send_json(&welcome).await;
    connection::drive(socket, conn, outbound, state).await;
}

async fn attach(
    state: &AppState,
    conn: &Arc<Connection>,
    user: &User,
    scope: ConnectionScope,
) -> Result<ServerFrame, CloseReason> {
    match scope {
        ConnectionScope::Trip(trip) => match attach_trip(state, conn, trip).await {
            Ok(role) => Ok(ServerFrame::welcome(Some(trip), Some(role))),
            Err(AppError::NotMember) => Err(CloseReason::NotMember),
            Err(e) => {
                tracing::warn!(user_id = %user.id, %trip, error = %e, "attach failed");
                Err(CloseReason::TransportError)
            }
        },
        ConnectionScope::AllTrips => {
            let trips = match state.store.list_active_trips(user.id).await {
                Ok(trips) => trips,
                Err(e) => {
                    tracing::warn!(user_id = %user.id, error = %e, "could not list trips");
                    return Err(CloseReason::TransportError);
                }
            };
            for trip in trips {
                // Membership may have ended since the listing.
                if let Err(e) = attach_trip(state, conn, trip).await {
                    tracing::debug!(user_id = %user.id, %trip, error = %e, "skipping trip");
                }
            }
            Ok(ServerFrame::welcome(None, None))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn headers(origin: Option<&'static str>) -> HeaderMap {
        let mut h = HeaderMap::new();
        if let Some(o) = origin {
            h.insert(ORIGIN, HeaderValue::from_static(o));
        }
        h
    }

    #[test]
    fn origin_policy() {
        let open = WsConfig::default();
        assert!(check_origin(&open, &headers(Some("https://evil.test"))).is_ok());

        let listed = WsConfig {
            allowed_origins: vec!["https://app.test".to_string()],
            ..WsConfig::default()
        };
        assert!(check_origin(&listed, &headers(Some("https://APP.test"))).is_ok());
        assert!(check_origin(&listed, &headers(Some("https://evil.test"))).is_ok());
        assert!(check_origin(&listed, &headers(None)).is_ok());

        let strict = WsConfig {
            strict_origins: true,
            ..listed
        };
        assert!(matches!(
            check_origin(&strict, &headers(Some("https://evil.test"))),
            Err(AppError::Forbidden(_))
        ));
        assert!(check_origin(&strict, &headers(Some("https://app.test"))).is_ok());
    }
}
