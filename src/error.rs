//! Application error type with HTTP status and machine-code mapping.
//!
//! [`AppError`] is the one error type that crosses component boundaries.
//! Each variant maps to an HTTP status code and a stable machine code; the
//! HTTP edge renders it through [`IntoResponse`] and the WebSocket edge
//! renders it as a failed acknowledgement or an error frame. Components
//! never pick status codes themselves.

use axum::http::StatusCode;
use axum::http::header::RETRY_AFTER;
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use utoipa::ToSchema;

use crate::domain::InvitationStatus;

/// Structured JSON error response body.
///
/// ```json
/// { "error": "invitation is not pending (status ACCEPTED)", "code": "NOT_PENDING" }
/// ```
#[derive(Debug, Serialize, ToSchema)]
pub struct ErrorResponse {
    /// Human-readable message.
    pub error: String,
    /// Machine-readable code.
    pub code: String,
    /// Seconds until a rate-limited caller may retry.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<u64>,
}

/// Server-side error enum.
///
/// # Translation table
///
/// | Kind            | Variants                                              | HTTP |
/// |-----------------|-------------------------------------------------------|------|
/// | Validation      | `Validation`                                          | 400  |
/// | Authentication  | `AuthnFailed`                                         | 401  |
/// | Authorization   | `Forbidden`, `NotMember`, `AuthMismatch`, `EmailMismatch` | 403 |
/// | Not found       | `NotFound`                                            | 404  |
/// | Conflict        | `Conflict`, `NotPending`, `AlreadyMember`, `LastOwner`, `InvalidTransition` | 409 |
/// | Rate limited    | `RateLimited`                                         | 429  |
/// | Transient infra | `Unavailable`                                         | 503  |
/// | Server          | `Persistence`, `Internal`                             | 500  |
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AppError {
    /// Request shape or content violates a rule.
    #[error("invalid request: {0}")]
    Validation(String),

    /// Missing or bad bearer token, or an invalid invitation token.
    #[error("authentication failed: {0}")]
    AuthnFailed(String),

    /// Caller lacks the role required for the operation.
    #[error("forbidden: {0}")]
    Forbidden(String),

    /// Caller holds no active membership in the trip.
    #[error("not a member of this trip")]
    NotMember,

    /// Invitation is bound to a different user.
    #[error("you are not authorized to act on this invitation")]
    AuthMismatch,

    /// Acting user's email differs from the invitation email.
    #[error("you can only act on invitations sent to your email address")]
    EmailMismatch,

    /// Identified resource does not exist.
    #[error("{0} not found")]
    NotFound(String),

    /// Generic state-precondition failure.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Invitation has already left the PENDING state.
    #[error("invitation is not pending (status {0})")]
    NotPending(InvitationStatus),

    /// User already holds a membership in the trip.
    #[error("user is already a member of this trip")]
    AlreadyMember,

    /// Operation would leave the trip without an active owner.
    #[error("trip must keep at least one active owner")]
    LastOwner,

    /// Trip status transition is not allowed.
    #[error("cannot transition trip from {from} to {to}")]
    InvalidTransition {
        /// Current status.
        from: String,
        /// Requested status.
        to: String,
    },

    /// Quota exceeded.
    #[error("rate limit exceeded; retry after {retry_after_secs} s")]
    RateLimited {
        /// Seconds until the caller may retry.
        retry_after_secs: u64,
    },

    /// Store, bus or limiter temporarily unavailable (after retries).
    #[error("service unavailable: {0}")]
    Unavailable(String),

    /// Persistence layer failure.
    #[error("persistence error: {0}")]
    Persistence(String),

    /// Internal server error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl AppError {
    /// Returns the machine-readable code for this variant.
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::Validation(_) => "VALIDATION",
            Self::AuthnFailed(_) => "AUTHN_FAILED",
            Self::Forbidden(_) | Self::NotMember => "AUTHZ_FAILED",
            Self::AuthMismatch => "AUTH_MISMATCH",
            Self::EmailMismatch => "EMAIL_MISMATCH",
            Self::NotFound(_) => "NOT_FOUND",
            Self::Conflict(_) => "CONFLICT",
            Self::NotPending(_) => "NOT_PENDING",
            Self::AlreadyMember => "ALREADY_MEMBER",
            Self::LastOwner => "last_owner",
            Self::InvalidTransition { .. } => "INVALID_TRANSITION",
            Self::RateLimited { .. } => "RATE_LIMITED",
            Self::Unavailable(_) => "UNAVAILABLE",
            Self::Persistence(_) | Self::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// Returns the HTTP status code for this variant.
    #[must_use]
    pub const fn status_code(&self) -> StatusCode {
        match self {
            Self::Validation(_) => StatusCode::BAD_REQUEST,
            Self::AuthnFailed(_) => StatusCode::UNAUTHORIZED,
            Self::Forbidden(_) | Self::NotMember | Self::AuthMismatch | Self::EmailMismatch => {
                StatusCode::FORBIDDEN
            }
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Conflict(_)
            | Self::NotPending(_)
            | Self::AlreadyMember
            | Self::LastOwner
            | Self::InvalidTransition { .. } => StatusCode::CONFLICT,
            Self::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            Self::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Persistence(_) | Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Returns `true` for transient infrastructure failures worth retrying.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable(_) | Self::Persistence(_))
    }

    /// Builds the JSON body for this error.
    #[must_use]
    pub fn to_body(&self) -> ErrorResponse {
        let retry_after = match self {
            Self::RateLimited { retry_after_secs } => Some(*retry_after_secs),
            _ => None,
        };
        ErrorResponse {
            error: self.to_string(),
            code: self.code().to_string(),
            retry_after,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!(code = self.code(), error = %self, "request failed");
        } else {
            tracing::debug!(code = self.code(), error = %self, "request rejected");
        }
        let body = self.to_body();
        let mut response = axum::Json(body).into_response();
        *response.status_mut() = status;
        if let Self::RateLimited { retry_after_secs } = self {
            response
                .headers_mut()
                .insert(RETRY_AFTER, axum::http::HeaderValue::from(retry_after_secs));
        }
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invitation_errors_have_distinct_codes() {
        let codes = [
            AppError::AuthnFailed("bad".to_string()).code(),
            AppError::NotFound("invitation".to_string()).code(),
            AppError::NotPending(InvitationStatus::Accepted).code(),
            AppError::AuthMismatch.code(),
            AppError::EmailMismatch.code(),
            AppError::AlreadyMember.code(),
        ];
        let unique: std::collections::HashSet<_> = codes.iter().collect();
        assert_eq!(unique.len(), codes.len());
    }

    #[test]
    fn status_mapping() {
        assert_eq!(AppError::EmailMismatch.status_code(), StatusCode::FORBIDDEN);
        assert_eq!(AppError::LastOwner.status_code(), StatusCode::CONFLICT);
        assert_eq!(
            AppError::RateLimited { retry_after_secs: 3 }.status_code(),
            StatusCode::TOO_MANY_REQUESTS
        );
        assert_eq!(
            AppError::Persistence("down".to_string()).status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn last_owner_code_is_stable() {
        assert_eq!(AppError::LastOwner.code(), "last_owner");
    }

    #[test]
    fn rate_limited_response_carries_retry_after() {
        let response = AppError::RateLimited { retry_after_secs: 42 }.into_response();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(
            response.headers().get(RETRY_AFTER).and_then(|v| v.to_str().ok()),
            Some("42")
        );
    }

    #[test]
    fn body_serializes_code() {
        let body = AppError::AlreadyMember.to_body();
        let json = serde_json::to_value(&body).unwrap_or_default();
        assert_eq!(json["code"], "ALREADY_MEMBER");
        assert!(json.get("retry_after").is_none());
    }
}
