//! API-key validation and security overrides.
//!
//! Keys are stored as SHA-256 hashes; validation hashes the presented
//! secret and compares in constant time. Expired keys never authenticate.
//!
//! The override manager holds operator-declared, time-bounded bypasses of
//! security controls. Only `disable-enforcement` may be declared;
//! `disable-audit` is refused at the boundary. Override checks sit on the
//! request hot path and every bypassed request is audited at WARN.

use chrono::{DateTime, Duration, Utc};
use conductor_types::apikey::{ApiKey, AuthenticatedUser};
use conductor_types::error::{CoreError, CoreResult};
use dashmap::DashMap;
use secrecy::{ExposeSecret, SecretString};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::backend::ApiKeyStore;
use crate::webhook::constant_time_eq;

/// Override kind permitting requests to skip auth enforcement.
pub const DISABLE_ENFORCEMENT: &str = "disable-enforcement";

/// Override kind that is never accepted.
pub const DISABLE_AUDIT: &str = "disable-audit";

/// Compute the SHA-256 hash of an API key (lowercase hex).
pub fn hash_api_key(key: &str) -> String {
    let digest = Sha256::digest(key.as_bytes());
    format!("{digest:x}")
}

/// Generate a fresh API key. The plaintext is shown once; only the hash
/// is stored.
pub fn generate_api_key() -> SecretString {
    let material = format!(
        "{}{}",
        Uuid::new_v4().simple(),
        Uuid::new_v4().simple()
    );
    SecretString::from(format!("cnd_{material}"))
}

/// Create and persist a key record, returning the plaintext secret.
pub async fn mint_api_key<S: ApiKeyStore>(
    store: &S,
    name: &str,
    scopes: Vec<String>,
    expires_at: Option<DateTime<Utc>>,
) -> CoreResult<SecretString> {
    let secret = generate_api_key();
    let key = ApiKey {
        id: Uuid::now_v7().to_string(),
        key_hash: hash_api_key(secret.expose_secret()),
        name: name.to_string(),
        created_at: Utc::now(),
        expires_at,
        scopes,
    };
    store.insert_api_key(&key).await?;
    Ok(secret)
}

/// Validate a presented API key against the store.
///
/// The lookup is by hash; the stored hash is additionally compared in
/// constant time. Returns the authenticated identity.
pub async fn validate_api_key<S: ApiKeyStore>(
    store: &S,
    presented: &str,
) -> CoreResult<AuthenticatedUser> {
    let presented_hash = hash_api_key(presented);
    let key = store
        .get_api_key_by_hash(&presented_hash)
        .await?
        .ok_or_else(|| CoreError::unauthorized("invalid API key"))?;

    if !constant_time_eq(key.key_hash.as_bytes(), presented_hash.as_bytes()) {
        return Err(CoreError::unauthorized("invalid API key"));
    }
    if key.is_expired(Utc::now()) {
        return Err(CoreError::unauthorized("API key expired"));
    }

    Ok(AuthenticatedUser {
        id: key.id,
        name: key.name,
        scopes: key.scopes,
    })
}

// ---------------------------------------------------------------------------
// Overrides
// ---------------------------------------------------------------------------

/// An active, time-bounded security override.
#[derive(Debug, Clone)]
pub struct SecurityOverride {
    pub kind: String,
    pub reason: String,
    pub declared_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// Process-wide override state with explicit lifecycle: declare with TTL
/// and reason, implicit expiry on read.
pub struct OverrideManager {
    overrides: DashMap<String, SecurityOverride>,
}

impl OverrideManager {
    pub fn new() -> Self {
        Self {
            overrides: DashMap::new(),
        }
    }

    /// Declare an override. `disable-audit` is refused.
    pub fn declare(&self, kind: &str, reason: &str, ttl: Duration) -> CoreResult<()> {
        if kind == DISABLE_AUDIT {
            return Err(CoreError::forbidden(
                "the disable-audit override is not permitted",
            ));
        }
        if reason.trim().is_empty() {
            return Err(CoreError::invalid_input("override reason is required"));
        }
        let now = Utc::now();
        let entry = SecurityOverride {
            kind: kind.to_string(),
            reason: reason.to_string(),
            declared_at: now,
            expires_at: now + ttl,
        };
        tracing::warn!(
            kind,
            reason,
            expires_at = %entry.expires_at,
            "security override declared"
        );
        self.overrides.insert(kind.to_string(), entry);
        Ok(())
    }

    /// The active override of this kind, if any. Expired entries are
    /// removed on read.
    pub fn active(&self, kind: &str) -> Option<SecurityOverride> {
        let entry = self.overrides.get(kind)?.clone();
        if entry.expires_at <= Utc::now() {
            drop(entry);
            self.overrides.remove(kind);
            return None;
        }
        Some(entry)
    }

    /// Whether auth enforcement is currently bypassed.
    pub fn enforcement_disabled(&self) -> Option<SecurityOverride> {
        self.active(DISABLE_ENFORCEMENT)
    }

    pub fn clear(&self, kind: &str) {
        self.overrides.remove(kind);
    }
}

impl Default for OverrideManager {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::memory::MemoryBackend;
    use conductor_types::error::ErrorKind;

    #[test]
    fn test_hash_is_stable_lowercase_hex() {
        let hash = hash_api_key("cnd_test");
        assert_eq!(hash.len(), 64);
        assert_eq!(hash, hash_api_key("cnd_test"));
        assert!(hash.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[test]
    fn test_generated_keys_are_unique_and_prefixed() {
        let a = generate_api_key();
        let b = generate_api_key();
        assert!(a.expose_secret().starts_with("cnd_"));
        assert_ne!(a.expose_secret(), b.expose_secret());
    }

    #[tokio::test]
    async fn test_mint_then_validate() {
        let store = MemoryBackend::new();
        let secret = mint_api_key(&store, "ci", vec!["deploy-*".to_string()], None)
            .await
            .unwrap();

        let user = validate_api_key(&store, secret.expose_secret())
            .await
            .unwrap();
        assert_eq!(user.name, "ci");
        assert_eq!(user.scopes, vec!["deploy-*"]);
    }

    #[tokio::test]
    async fn test_unknown_key_is_unauthorized() {
        let store = MemoryBackend::new();
        let err = validate_api_key(&store, "cnd_nope").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Unauthorized);
    }

    #[tokio::test]
    async fn test_expired_key_never_authenticates() {
        let store = MemoryBackend::new();
        let secret = mint_api_key(
            &store,
            "old",
            vec![],
            Some(Utc::now() - Duration::seconds(1)),
        )
        .await
        .unwrap();
        let err = validate_api_key(&store, secret.expose_secret())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Unauthorized);
        assert!(err.message().contains("expired"));
    }

    #[test]
    fn test_declare_enforcement_override() {
        let manager = OverrideManager::new();
        assert!(manager.enforcement_disabled().is_none());

        manager
            .declare(DISABLE_ENFORCEMENT, "incident 4711", Duration::minutes(5))
            .unwrap();
        let active = manager.enforcement_disabled().unwrap();
        assert_eq!(active.reason, "incident 4711");
    }

    #[test]
    fn test_disable_audit_is_refused() {
        let manager = OverrideManager::new();
        let err = manager
            .declare(DISABLE_AUDIT, "nope", Duration::minutes(5))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Forbidden);
        assert!(manager.active(DISABLE_AUDIT).is_none());
    }

    #[test]
    fn test_override_requires_reason() {
        let manager = OverrideManager::new();
        assert!(manager
            .declare(DISABLE_ENFORCEMENT, "  ", Duration::minutes(5))
            .is_err());
    }

    #[test]
    fn test_override_expires_implicitly() {
        let manager = OverrideManager::new();
        manager
            .declare(DISABLE_ENFORCEMENT, "brief", Duration::seconds(-1))
            .unwrap();
        assert!(manager.enforcement_disabled().is_none());
    }

    #[test]
    fn test_clear_removes_override() {
        let manager = OverrideManager::new();
        manager
            .declare(DISABLE_ENFORCEMENT, "ops", Duration::minutes(5))
            .unwrap();
        manager.clear(DISABLE_ENFORCEMENT);
        assert!(manager.enforcement_disabled().is_none());
    }
}
