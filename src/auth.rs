//! Bearer-token identity.
//!
//! Tokens are HS256 JWTs issued by the external identity provider. The
//! `sub` claim names the provider subject, which is resolved to a local
//! [`User`] through the store. Browsers cannot set headers on a WebSocket
//! handshake, so the token is also accepted as a `token` query parameter.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::extract::{FromRequestParts, Query};
use axum::http::header::AUTHORIZATION;
use axum::http::request::Parts;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode};
use serde::{Deserialize, Serialize};

use crate::app_state::AppState;
use crate::domain::User;
use crate::error::AppError;
use crate::retry::with_deadline;
use crate::store::Store;

/// Claims carried by an identity token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentityClaims {
    /// Provider subject.
    pub sub: String,
    /// Expiry, seconds since the epoch.
    pub exp: i64,
    /// Issued-at, seconds since the epoch.
    #[serde(default)]
    pub iat: i64,
    /// Issuer.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iss: Option<String>,
}

/// Resolves a bearer token to a user.
#[async_trait]
pub trait IdentityVerifier: Send + Sync + fmt::Debug {
    /// Validates `token` and returns the user it names.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::AuthnFailed`] for bad, expired or unknown tokens.
    async fn verify(&self, token: &str) -> Result<User, AppError>;
}

/// HS256 verifier backed by the user store.
pub struct JwtVerifier {
    key: DecodingKey,
    validation: Validation,
    store: Arc<dyn Store>,
    lookup_timeout: Duration,
}

impl fmt::Debug for JwtVerifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JwtVerifier")
            .field("issuer", &self.validation.iss)
            .finish_non_exhaustive()
    }
}

impl JwtVerifier {
    /// Creates a verifier for tokens signed with `secret`, optionally
    /// pinned to `issuer`.
    #[must_use]
    pub fn new(
        secret: &str,
        issuer: Option<&str>,
        store: Arc<dyn Store>,
        lookup_timeout: Duration,
    ) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_required_spec_claims(&["exp", "sub"]);
        if let Some(iss) = issuer {
            validation.set_issuer(&[iss]);
        }
        Self {
            key: DecodingKey::from_secret(secret.as_bytes()),
            validation,
            store,
            lookup_timeout,
        }
    }

    /// Checks signature and claims without touching the store.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::AuthnFailed`] if the token does not validate.
    pub fn claims(&self, token: &str) -> Result<IdentityClaims, AppError> {
        decode::<IdentityClaims>(token, &self.key, &self.validation)
            .map(|data| data.claims)
            .map_err(|e| AppError::AuthnFailed(format!("invalid bearer token: {e}")))
    }
}

#[async_trait]
impl IdentityVerifier for JwtVerifier {
    async fn verify(&self, token: &str) -> Result<User, AppError> {
        let claims = self.claims(token)?;
        let user = with_deadline(
            self.lookup_timeout,
            "user lookup",
            self.store.find_user_by_subject(&claims.sub),
        )
        .await?;
        user.ok_or_else(|| AppError::AuthnFailed("unknown subject".to_string()))
    }
}

/// Signs an identity token. Used by development tooling and tests; in
/// production tokens come from the identity provider.
///
/// # Errors
///
/// Returns [`AppError::Internal`] if signing fails.
pub fn sign_identity_token(
    secret: &str,
    issuer: Option<&str>,
    subject: &str,
    ttl: chrono::Duration,
) -> Result<String, AppError> {
    let now = chrono::Utc::now();
    let claims = IdentityClaims {
        sub: subject.to_string(),
        exp: (now + ttl).timestamp(),
        iat: now.timestamp(),
        iss: issuer.map(str::to_string),
    };
    encode(
        &Header::new(Algorithm::HS256),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )
    .map_err(|e| AppError::Internal(format!("token signing failed: {e}")))
}

/// Extracts the raw bearer token from the `Authorization` header or the
/// `token` query parameter.
fn bearer_token(parts: &Parts) -> Option<String> {
    if let Some(token) = parts
        .headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|t| !t.is_empty())
    {
        return Some(token.to_string());
    }
    Query::<HashMap<String, String>>::try_from_uri(&parts.uri)
        .ok()
        .and_then(|Query(mut q)| q.remove("token"))
        .filter(|t| !t.is_empty())
}

/// The authenticated caller.
#[derive(Debug, Clone)]
pub struct AuthUser(pub User);

impl FromRequestParts<AppState> for AuthUser {
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let token = bearer_token(parts)
            .ok_or_else(|| AppError::AuthnFailed("missing bearer token".to_string()))?;
        let user = state.identity.verify(&token).await?;
        Ok(Self(user))
    }
}
