//! REST API layer: route handlers, DTOs, and router composition.
//!
//! Resource endpoints and the WebSocket upgrades are mounted under
//! `/api/v1`; `/health` and a bare `/ws` alias sit at the root.

pub mod dto;
pub mod handlers;

use axum::Router;
use axum::routing::get;
use utoipa::OpenApi;

use crate::app_state::AppState;
use crate::ws::handler::ws_handler;

/// OpenAPI document for the REST surface.
#[derive(Debug, OpenApi)]
#[openapi(
    info(
        title = "tripwire",
        description = "Real-time trip collaboration: chat, invitations and membership"
    ),
    paths(
        handlers::system::health_handler,
        handlers::invitation::create_invitation,
        handlers::invitation::list_invitations,
        handlers::invitation::revoke_invitation,
        handlers::invitation::accept_invitation,
        handlers::invitation::accept_invitation_by_id,
        handlers::invitation::decline_invitation,
        handlers::invitation::decline_invitation_by_id,
        handlers::invitation::invitation_details,
        handlers::invitation::join_redirect,
        handlers::chat::list_messages,
        handlers::chat::send_message,
        handlers::chat::add_reaction,
        handlers::chat::remove_reaction,
        handlers::chat::update_read_cursor,
        handlers::member::change_role,
        handlers::member::remove_member,
        handlers::member::update_trip_status,
    ),
    components(schemas(
        crate::error::ErrorResponse,
        handlers::system::HealthResponse,
        dto::PaginationMeta,
        dto::MembershipDto,
        dto::TripDto,
        dto::UserSummaryDto,
        dto::CreateInvitationRequest,
        dto::TokenRequest,
        dto::InvitationDto,
        dto::InvitationListResponse,
        dto::InvitationDetailsResponse,
        dto::SendMessageRequest,
        dto::MessageDto,
        dto::MessageListResponse,
        dto::ReactionRequest,
        dto::ReactionResponse,
        dto::ReadCursorRequest,
        dto::ReadCursorResponse,
        dto::ChangeRoleRequest,
        dto::UpdateTripStatusRequest,
    )),
    tags(
        (name = "System", description = "Health"),
        (name = "Invitations", description = "Invitation lifecycle"),
        (name = "Chat", description = "Trip chat"),
        (name = "Members", description = "Roles and removal"),
        (name = "Trips", description = "Trip lifecycle"),
    )
)]
pub struct ApiDoc;

/// Builds the complete API router with all REST and WebSocket endpoints.
pub fn build_router() -> Router<AppState> {
    let router = Router::new()
        .nest("/api/v1", handlers::routes())
        .route("/ws", get(ws_handler))
        .merge(handlers::system::routes());

    #[cfg(feature = "swagger-ui")]
    let router = router.merge(
        utoipa_swagger_ui::SwaggerUi::new("/swagger-ui")
            .url("/api-docs/openapi.json", ApiDoc::openapi()),
    );

    router
}

#[cfg(test)]
#[allow(clippy::panic)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use axum::body::Body;
    use axum::http::{Request, StatusCode, header};
    use tower::ServiceExt;

    use crate::config::AppConfig;
    use crate::store::MemoryStore;

    fn app() -> Router {
        let state = AppState::with_store(AppConfig::default(), Arc::new(MemoryStore::new()));
        build_router().with_state(state)
    }

    async fn send(uri: &str) -> axum::response::Response {
        let Ok(request) = Request::builder().uri(uri).body(Body::empty()) else {
            panic!("request should build");
        };
        let Ok(response) = app().oneshot(request).await else {
            panic!("router is infallible");
        };
        response
    }

    #[tokio::test]
    async fn health_is_mounted_at_root() {
        assert_eq!(send("/health").await.status(), StatusCode::OK);
        assert_eq!(send("/api/v1/health").await.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn full_middleware_stack_serves_requests() {
        let state = AppState::with_store(AppConfig::default(), Arc::new(MemoryStore::new()));
        let Ok(request) = Request::builder().uri("/health").body(Body::empty()) else {
            panic!("request should build");
        };
        let Ok(response) = crate::build_app(state).oneshot(request).await else {
            panic!("app is infallible");
        };
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn join_without_token_redirects_to_error_page() {
        let response = send("/api/v1/invitations/join").await;
        assert_eq!(response.status(), StatusCode::FOUND);
        let location = response
            .headers()
            .get(header::LOCATION)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default();
        assert_eq!(location, "http://localhost:3000/join-trip?error=missing_token");

        let response = send("/api/v1/invitations/join?token=garbage").await;
        let location = response
            .headers()
            .get(header::LOCATION)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default();
        assert!(location.ends_with("error=invalid_token"));
    }

    #[tokio::test]
    async fn protected_routes_need_a_bearer() {
        let trip = crate::domain::TripId::new();
        let response = send(&format!("/api/v1/trips/{trip}/chat/messages")).await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        let Ok(body) = axum::body::to_bytes(response.into_body(), 4096).await else {
            panic!("body should be readable");
        };
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap_or_default();
        assert_eq!(json["code"], "AUTHN_FAILED");
    }

    #[test]
    fn openapi_lists_every_resource() {
        let doc = ApiDoc::openapi();
        for path in [
            "/health",
            "/api/v1/trips/{trip_id}/invitations",
            "/api/v1/invitations/accept",
            "/api/v1/invitations/join",
            "/api/v1/trips/{trip_id}/chat/messages",
            "/api/v1/trips/{trip_id}/chat/read",
            "/api/v1/trips/{trip_id}/members/{user_id}/role",
            "/api/v1/trips/{trip_id}/status",
        ] {
            assert!(doc.paths.paths.contains_key(path), "missing {path}");
        }
    }
}
