//! Invitation tokens, lifecycle and notifications.

pub mod notifier;
pub mod service;
pub mod token;

pub use notifier::{Notifier, TracingNotifier};
pub use service::{InvitationDetails, InvitationService, InvitationSettings};
pub use token::{InvitationClaims, InvitationTokens, TokenError};
