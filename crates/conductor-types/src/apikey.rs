//! API key and authenticated-identity types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A stored API key record. The secret itself is stored as a SHA-256 hash;
/// plaintext keys are shown once at creation and never persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiKey {
    /// Stable id for the key record.
    pub id: String,
    /// SHA-256 hash of the key material (lowercase hex).
    pub key_hash: String,
    /// Human-readable label.
    pub name: String,
    pub created_at: DateTime<Utc>,
    /// Expired keys never authenticate.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    /// Scope patterns. An empty list grants access to all endpoints
    /// (admin key).
    #[serde(default)]
    pub scopes: Vec<String>,
}

impl ApiKey {
    /// Whether the key has expired as of `now`.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// Identity attached to an authenticated request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthenticatedUser {
    pub id: String,
    pub name: String,
    /// Empty scopes grant access to everything.
    pub scopes: Vec<String>,
}

impl AuthenticatedUser {
    /// The anonymous identity used for unauthenticated (public/local) access.
    pub fn anonymous() -> Self {
        Self {
            id: "anonymous".to_string(),
            name: "anonymous".to_string(),
            scopes: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_key_without_expiry_never_expires() {
        let key = ApiKey {
            id: "k1".to_string(),
            key_hash: "ab".repeat(32),
            name: "ci".to_string(),
            created_at: Utc::now(),
            expires_at: None,
            scopes: vec![],
        };
        assert!(!key.is_expired(Utc::now() + Duration::days(3650)));
    }

    #[test]
    fn test_expired_key_detected() {
        let now = Utc::now();
        let key = ApiKey {
            id: "k2".to_string(),
            key_hash: "cd".repeat(32),
            name: "old".to_string(),
            created_at: now - Duration::days(30),
            expires_at: Some(now - Duration::seconds(1)),
            scopes: vec!["deploy-*".to_string()],
        };
        assert!(key.is_expired(now));
    }
}
