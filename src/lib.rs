//! # tripwire
//!
//! Real-time backend for collaborative trip planning.
//!
//! Members of a trip share one event stream: chat messages, reactions,
//! read receipts, typing indicators, presence and membership changes all
//! travel as [`domain::Event`]s through a per-trip [`bus::EventBus`] and
//! out to every attached WebSocket. Invitations move people into a trip;
//! a rate limiter keeps any single user from flooding it.
//!
//! ## Architecture
//!
//! ```text
//! Clients (HTTP, WebSocket)
//!     │
//!     ├── REST Handlers (api/)
//!     ├── WS Upgrade + Supervisor (ws/)
//!     │       └── RateLimiter (limiter/)
//!     │
//!     ├── ChatPipeline (chat/)
//!     ├── InvitationService (invitation/)
//!     ├── MembershipService (service/)
//!     │
//!     ├── SessionRegistry (session/)
//!     ├── EventBus (bus/) ── optional Redis broker
//!     │
//!     └── Store (store/): memory or PostgreSQL
//! ```

pub mod api;
pub mod app_state;
pub mod auth;
pub mod bus;
pub mod chat;
pub mod config;
pub mod domain;
pub mod error;
pub mod invitation;
pub mod limiter;
pub mod retry;
pub mod service;
pub mod session;
pub mod store;
pub mod ws;

use std::time::Duration;

use axum::Router;
use axum::http::StatusCode;
use tower_http::cors::CorsLayer;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

use crate::app_state::AppState;
use crate::config::LogFormat;

/// Builds the HTTP application: routes, tracing, CORS and request timeout.
pub fn build_app(state: AppState) -> Router {
    let timeout = Duration::from_secs(state.config.request_timeout_secs);
    api::build_router()
        .layer(TimeoutLayer::with_status_code(StatusCode::REQUEST_TIMEOUT, timeout))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Installs the global tracing subscriber. `RUST_LOG` overrides the
/// default `info` filter.
pub fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Text => builder.init(),
    }
}
