//! Signed invitation tokens.
//!
//! A token is an HS256 JWT naming the invitation, its trip and the invited
//! email. Its `exp` equals the invitation expiry. Expiry is not enforced
//! here: an expired token still identifies its invitation, and the service
//! reports it as `NOT_PENDING` (status `EXPIRED`) after expiring the
//! record lazily.

use std::fmt;

use chrono::{DateTime, Utc};
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode};
use serde::{Deserialize, Serialize};

use crate::domain::{Invitation, InvitationId, TripId};
use crate::error::AppError;

/// Issuer written into every invitation token.
pub const TOKEN_ISSUER: &str = "tripwire-invitation";

/// Claims of an invitation token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvitationClaims {
    /// Invitation the token refers to.
    pub invitation_id: InvitationId,
    /// Trip of the invitation.
    pub trip_id: TripId,
    /// Lowercased invitee email.
    pub invitee_email: String,
    /// Expiry, seconds since the epoch.
    pub exp: i64,
    /// Issued-at, seconds since the epoch.
    pub iat: i64,
    /// Not-before, seconds since the epoch.
    pub nbf: i64,
    /// Always [`TOKEN_ISSUER`].
    pub iss: String,
}

/// Token failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TokenError {
    /// Malformed, tampered, foreign or not-yet-valid token.
    #[error("invalid invitation token: {0}")]
    Invalid(String),
    /// Signing failed.
    #[error("failed to sign invitation token: {0}")]
    Signing(String),
}

impl From<TokenError> for AppError {
    fn from(err: TokenError) -> Self {
        match err {
            TokenError::Invalid(_) => Self::AuthnFailed(err.to_string()),
            TokenError::Signing(_) => Self::Internal(err.to_string()),
        }
    }
}

/// Issues and verifies invitation tokens with one shared secret.
pub struct InvitationTokens {
    encoding: EncodingKey,
    decoding: DecodingKey,
    validation: Validation,
}

impl fmt::Debug for InvitationTokens {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InvitationTokens").finish_non_exhaustive()
    }
}

impl InvitationTokens {
    /// Creates a codec for `secret`.
    #[must_use]
    pub fn new(secret: &str) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_issuer(&[TOKEN_ISSUER]);
        validation.set_required_spec_claims(&["exp", "iss"]);
        validation.validate_exp = false;
        validation.validate_nbf = true;
        Self {
            encoding: EncodingKey::from_secret(secret.as_bytes()),
            decoding: DecodingKey::from_secret(secret.as_bytes()),
            validation,
        }
    }

    /// Signs a token for `invitation`, valid until its expiry.
    ///
    /// # Errors
    ///
    /// Returns [`TokenError::Signing`] if encoding fails.
    pub fn issue(&self, invitation: &Invitation, now: DateTime<Utc>) -> Result<String, TokenError> {
        let claims = InvitationClaims {
            invitation_id: invitation.id,
            trip_id: invitation.trip_id,
            invitee_email: invitation.invitee_email.clone(),
            exp: invitation.expires_at.timestamp(),
            iat: now.timestamp(),
            nbf: now.timestamp(),
            iss: TOKEN_ISSUER.to_string(),
        };
        encode(&Header::new(Algorithm::HS256), &claims, &self.encoding)
            .map_err(|e| TokenError::Signing(e.to_string()))
    }

    /// Verifies signature, issuer and `nbf`, and returns the claims.
    ///
    /// # Errors
    ///
    /// Returns [`TokenError::Invalid`] for anything that does not verify.
    pub fn verify(&self, token: &str) -> Result<InvitationClaims, TokenError> {
        let token = token.trim();
        if token.is_empty() {
            return Err(TokenError::Invalid("empty token".to_string()));
        }
        decode::<InvitationClaims>(token, &self.decoding, &self.validation)
            .map(|data| data.claims)
            .map_err(|e| match e.kind() {
                ErrorKind::InvalidSignature => TokenError::Invalid("bad signature".to_string()),
                ErrorKind::InvalidIssuer => TokenError::Invalid("wrong issuer".to_string()),
                ErrorKind::ImmatureSignature => TokenError::Invalid("not yet valid".to_string()),
                _ => TokenError::Invalid(e.to_string()),
            })
    }
}
