//! Authenticator (C2) — bearer credential extraction, constant-time secret
//! verification, and permission enforcement.
//!
//! Timing discipline: a lookup miss still runs a dummy Argon2id verification
//! against a fixed constant so that key-id enumeration via response timing
//! is not possible.

pub mod store;

use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::sync::Arc;
use tonic::metadata::MetadataMap;

use crate::error::{GatewayError, Result};
pub use store::{ClientKey, KeyStore, Permission};

type HmacSha256 = Hmac<Sha256>;

/// Precomputed Argon2id hash of a fixed constant, used to equalize timing
/// when the supplied key id does not exist in the store.
fn dummy_hash() -> &'static str {
    use std::sync::OnceLock;
    static HASH: OnceLock<String> = OnceLock::new();
    HASH.get_or_init(|| {
        crate::vault::hash_secret("dummy-constant-used-for-timing-equalization")
            .expect("dummy hash must be constructible")
    })
}

/// Compare two byte strings in constant time via HMAC-SHA256, following
/// `auth::constant_time_eq` from the key-pool daemon.
pub fn constant_time_eq(a: &str, b: &str) -> bool {
    let key = b"polyglot-gateway-constant-time-comparison-key";
    let mut mac_a = HmacSha256::new_from_slice(key).unwrap();
    let mut mac_b = HmacSha256::new_from_slice(key).unwrap();
    mac_a.update(a.as_bytes());
    mac_b.update(b.as_bytes());
    mac_a.finalize().into_bytes() == mac_b.finalize().into_bytes()
}

pub struct Authenticator {
    store: Arc<KeyStore>,
}

impl Authenticator {
    pub fn new(store: Arc<KeyStore>) -> Self {
        Self { store }
    }

    /// Extract `(key_id, secret)` from request metadata: prefer
    /// `authorization: Bearer <keyId>.<secret>`, fall back to `x-api-key:
    /// <keyId>.<secret>`.
    fn extract_credential(metadata: &MetadataMap) -> Result<(String, String)> {
        let raw = metadata
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .map(|s| s.to_string())
            .or_else(|| {
                metadata
                    .get("x-api-key")
                    .and_then(|v| v.to_str().ok())
                    .map(|s| s.to_string())
            })
            .ok_or(GatewayError::Unauthenticated)?;

        let (key_id, secret) = raw
            .split_once('.')
            .ok_or(GatewayError::Unauthenticated)?;
        if key_id.is_empty() || secret.is_empty() {
            return Err(GatewayError::Unauthenticated);
        }
        Ok((key_id.to_string(), secret.to_string()))
    }

    /// Authenticate the request, returning the bound `ClientKey` on success.
    pub async fn authenticate(&self, metadata: &MetadataMap) -> Result<ClientKey> {
        let (key_id, secret) = Self::extract_credential(metadata)?;

        let found = self.store.get_key(&key_id)?;
        let Some(client_key) = found else {
            // Dummy verification — equalize timing with the found path.
            crate::vault::verify_secret(&secret, dummy_hash());
            return Err(GatewayError::Unauthenticated);
        };

        if client_key.is_expired() {
            return Err(GatewayError::Unauthenticated);
        }

        if !crate::vault::verify_secret(&secret, &client_key.secret_hash) {
            return Err(GatewayError::Unauthenticated);
        }

        Ok(client_key)
    }

    pub fn require_permission(client_key: &ClientKey, perm: Permission) -> Result<()> {
        if client_key.has_permission(perm) {
            Ok(())
        } else {
            Err(GatewayError::PermissionDenied(format!(
                "key '{}' lacks required permission",
                client_key.key_id
            )))
        }
    }
}

/// Rate limiter built atop C1's atomic counters.
pub struct RateLimiter {
    store: Arc<KeyStore>,
}

impl RateLimiter {
    pub fn new(store: Arc<KeyStore>) -> Self {
        Self { store }
    }

    /// Evaluate per-minute and per-day request counters. Both increments
    /// happen even if the minute counter alone would already reject, since
    /// the invariant is "every request counts", not "only admitted requests
    /// count".
    pub fn allow(&self, client: &ClientKey) -> Result<()> {
        let minute_key = format!("{}:rpm", client.key_id);
        let day_key = format!("{}:rpd", client.key_id);

        let minute_count = self.store.atomic_increment_with_ttl(&minute_key, 1, 60)?;
        let day_count = self.store.atomic_increment_with_ttl(&day_key, 1, 86_400)?;

        if minute_count > client.rpm_limit as u64 {
            return Err(GatewayError::RateLimited { retry_after_secs: 60 });
        }
        if day_count > client.rpd_limit as u64 {
            return Err(GatewayError::RateLimited {
                retry_after_secs: 86_400,
            });
        }
        Ok(())
    }

    /// Record token usage against the tokens-per-minute counter. Best
    /// effort: failures are logged, never propagated — the RPC has already
    /// succeeded by the time usage is known.
    pub fn record_tokens(&self, client: &ClientKey, tokens: u64) {
        self.record_tokens_for_key(&client.key_id, tokens);
    }

    /// Same as `record_tokens`, for callers that only have the key id on
    /// hand (e.g. after the owning `ClientKey` has been moved elsewhere).
    pub fn record_tokens_for_key(&self, key_id: &str, tokens: u64) {
        if tokens == 0 {
            return;
        }
        let key = format!("{key_id}:tpm");
        if let Err(e) = self.store.atomic_increment_with_ttl(&key, tokens, 60) {
            tracing::warn!(key_id, error = %e, "failed to record token usage");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use tonic::metadata::MetadataValue;

    fn store_with_key(key_id: &str, secret: &str) -> Arc<KeyStore> {
        let store = Arc::new(KeyStore::in_memory().unwrap());
        let client_key = ClientKey {
            key_id: key_id.into(),
            display_name: "test".into(),
            secret_hash: crate::vault::hash_secret(secret).unwrap(),
            permissions: HashSet::from([Permission::Chat]),
            rpm_limit: 2,
            rpd_limit: 100,
            tpm_limit: 10_000,
            expires_at: None,
            tenant_binding: None,
        };
        store.put_key(&client_key).unwrap();
        store
    }

    #[tokio::test]
    async fn authenticate_accepts_valid_credential() {
        let store = store_with_key("k1", "s3cret");
        let auth = Authenticator::new(Arc::clone(&store));

        let mut metadata = MetadataMap::new();
        metadata.insert(
            "authorization",
            MetadataValue::try_from("Bearer k1.s3cret").unwrap(),
        );

        let client = auth.authenticate(&metadata).await.unwrap();
        assert_eq!(client.key_id, "k1");
    }

    #[tokio::test]
    async fn authenticate_rejects_wrong_secret() {
        let store = store_with_key("k1", "s3cret");
        let auth = Authenticator::new(store);

        let mut metadata = MetadataMap::new();
        metadata.insert(
            "authorization",
            MetadataValue::try_from("Bearer k1.wrong").unwrap(),
        );

        assert!(auth.authenticate(&metadata).await.is_err());
    }

    #[tokio::test]
    async fn authenticate_rejects_unknown_key_without_panicking() {
        let store = store_with_key("k1", "s3cret");
        let auth = Authenticator::new(store);

        let mut metadata = MetadataMap::new();
        metadata.insert(
            "authorization",
            MetadataValue::try_from("Bearer nonexistent.whatever").unwrap(),
        );

        assert!(auth.authenticate(&metadata).await.is_err());
    }

    #[test]
    fn rate_limiter_blocks_over_rpm_limit() {
        let store = store_with_key("k1", "s3cret");
        let client = store.get_key("k1").unwrap().unwrap();
        let limiter = RateLimiter::new(store);

        assert!(limiter.allow(&client).is_ok());
        assert!(limiter.allow(&client).is_ok());
        assert!(limiter.allow(&client).is_err());
    }

    #[test]
    fn record_tokens_ignores_zero() {
        let store = store_with_key("k1", "s3cret");
        let client = store.get_key("k1").unwrap().unwrap();
        let limiter = RateLimiter::new(Arc::clone(&store));
        limiter.record_tokens(&client, 0);
        // No counter should have been created for a zero-token record.
        let n = store.atomic_increment_with_ttl(&format!("{}:tpm", client.key_id), 1, 60).unwrap();
        assert_eq!(n, 1);
    }

    #[test]
    fn constant_time_eq_matches_and_differs() {
        assert!(constant_time_eq("abc", "abc"));
        assert!(!constant_time_eq("abc", "abd"));
    }
}
