//! Registered users as seen by the collaboration core.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::UserId;

/// A registered user.
///
/// Only the fields the core reads are modelled; profile editing lives
/// outside this crate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    /// User identifier.
    pub id: UserId,
    /// Subject claim issued by the identity provider.
    pub subject: String,
    /// Email address; unique case-insensitively.
    pub email: String,
    /// Unique handle.
    pub username: String,
    /// Name shown in the UI.
    pub display_name: Option<String>,
    /// Avatar image URL.
    pub avatar_url: Option<String>,
    /// Last time the user was seen online.
    pub last_seen_at: Option<DateTime<Utc>>,
    /// Whether the user currently holds a live connection.
    pub is_online: bool,
}

impl User {
    /// Creates a user whose subject equals its id.
    #[must_use]
    pub fn new(email: impl Into<String>, username: impl Into<String>) -> Self {
        let id = UserId::new();
        Self {
            id,
            subject: id.to_string(),
            email: email.into(),
            username: username.into(),
            display_name: None,
            avatar_url: None,
            last_seen_at: None,
            is_online: false,
        }
    }

    /// Case-insensitive email comparison.
    #[must_use]
    pub fn email_matches(&self, other: &str) -> bool {
        self.email.trim().eq_ignore_ascii_case(other.trim())
    }

    /// Name to show next to messages.
    #[must_use]
    pub fn label(&self) -> &str {
        self.display_name.as_deref().unwrap_or(&self.username)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn email_match_ignores_case_and_whitespace() {
        let user = User::new("Alice@Example.com", "alice");
        assert!(user.email_matches("alice@example.com "));
        assert!(!user.email_matches("bob@example.com"));
    }

    #[test]
    fn label_prefers_display_name() {
        let mut user = User::new("a@example.com", "alice");
        assert_eq!(user.label(), "alice");
        user.display_name = Some("Alice A.".to_string());
        assert_eq!(user.label(), "Alice A.");
    }
}
