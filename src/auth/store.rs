//! Key & rate-limit store — SQLite-backed, guarded by a single connection
//! mutex, following `vault::store::KeyStore`'s pattern from the key-pool
//! lineage. Holds `ClientKey` records and atomic token-bucket counters.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::sync::Mutex;

use crate::error::{GatewayError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Permission {
    Chat,
    ChatStream,
    Files,
    Admin,
}

impl Permission {
    fn as_str(&self) -> &'static str {
        match self {
            Permission::Chat => "chat",
            Permission::ChatStream => "chat-stream",
            Permission::Files => "files",
            Permission::Admin => "admin",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "chat" => Some(Permission::Chat),
            "chat-stream" => Some(Permission::ChatStream),
            "files" => Some(Permission::Files),
            "admin" => Some(Permission::Admin),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ClientKey {
    pub key_id: String,
    pub display_name: String,
    pub secret_hash: String,
    pub permissions: HashSet<Permission>,
    pub rpm_limit: u32,
    pub rpd_limit: u32,
    pub tpm_limit: u64,
    pub expires_at: Option<DateTime<Utc>>,
    pub tenant_binding: Option<String>,
}

impl ClientKey {
    pub fn has_permission(&self, perm: Permission) -> bool {
        self.permissions.contains(&Permission::Admin) || self.permissions.contains(&perm)
    }

    pub fn is_expired(&self) -> bool {
        self.expires_at.map(|e| Utc::now() > e).unwrap_or(false)
    }
}

/// The key & rate-limit store.
pub struct KeyStore {
    db: Mutex<Connection>,
}

impl KeyStore {
    pub fn open(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let db = Connection::open(db_path)
            .map_err(|e| GatewayError::internal(format!("failed to open key store: {e}")))?;

        db.pragma_update(None, "journal_mode", "WAL")?;
        db.pragma_update(None, "foreign_keys", "ON")?;

        db.execute_batch(
            "CREATE TABLE IF NOT EXISTS client_keys (
                key_id TEXT PRIMARY KEY,
                display_name TEXT NOT NULL,
                secret_hash TEXT NOT NULL,
                permissions TEXT NOT NULL,
                rpm_limit INTEGER NOT NULL,
                rpd_limit INTEGER NOT NULL,
                tpm_limit INTEGER NOT NULL,
                expires_at TEXT,
                tenant_binding TEXT
            );

            CREATE TABLE IF NOT EXISTS rate_counters (
                counter_key TEXT PRIMARY KEY,
                count INTEGER NOT NULL,
                expires_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS usage_log (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                request_id TEXT NOT NULL,
                key_id TEXT NOT NULL,
                tenant_id TEXT NOT NULL,
                provider TEXT NOT NULL,
                model TEXT NOT NULL,
                timestamp TEXT NOT NULL,
                input_tokens INTEGER,
                output_tokens INTEGER,
                status TEXT NOT NULL
            );
            ",
        )?;

        Ok(Self { db: Mutex::new(db) })
    }

    pub fn in_memory() -> Result<Self> {
        let db = Connection::open_in_memory()
            .map_err(|e| GatewayError::internal(format!("failed to open in-memory store: {e}")))?;
        db.execute_batch(
            "CREATE TABLE client_keys (
                key_id TEXT PRIMARY KEY, display_name TEXT NOT NULL, secret_hash TEXT NOT NULL,
                permissions TEXT NOT NULL, rpm_limit INTEGER NOT NULL, rpd_limit INTEGER NOT NULL,
                tpm_limit INTEGER NOT NULL, expires_at TEXT, tenant_binding TEXT
            );
            CREATE TABLE rate_counters (counter_key TEXT PRIMARY KEY, count INTEGER NOT NULL, expires_at TEXT NOT NULL);
            CREATE TABLE usage_log (
                id INTEGER PRIMARY KEY AUTOINCREMENT, request_id TEXT NOT NULL, key_id TEXT NOT NULL,
                tenant_id TEXT NOT NULL, provider TEXT NOT NULL, model TEXT NOT NULL, timestamp TEXT NOT NULL,
                input_tokens INTEGER, output_tokens INTEGER, status TEXT NOT NULL
            );",
        )?;
        Ok(Self { db: Mutex::new(db) })
    }

    pub fn put_key(&self, key: &ClientKey) -> Result<()> {
        let perms = key
            .permissions
            .iter()
            .map(|p| p.as_str())
            .collect::<Vec<_>>()
            .join(",");
        let db = self.db.lock().expect("key store lock poisoned");
        db.execute(
            "INSERT OR REPLACE INTO client_keys
                (key_id, display_name, secret_hash, permissions, rpm_limit, rpd_limit, tpm_limit, expires_at, tenant_binding)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                key.key_id,
                key.display_name,
                key.secret_hash,
                perms,
                key.rpm_limit,
                key.rpd_limit,
                key.tpm_limit as i64,
                key.expires_at.map(|d| d.to_rfc3339()),
                key.tenant_binding,
            ],
        )?;
        Ok(())
    }

    pub fn get_key(&self, key_id: &str) -> Result<Option<ClientKey>> {
        let db = self.db.lock().expect("key store lock poisoned");
        let row = db
            .query_row(
                "SELECT key_id, display_name, secret_hash, permissions, rpm_limit, rpd_limit, tpm_limit, expires_at, tenant_binding
                 FROM client_keys WHERE key_id = ?1",
                params![key_id],
                |row| {
                    let perms_str: String = row.get(3)?;
                    let expires_str: Option<String> = row.get(7)?;
                    Ok(ClientKey {
                        key_id: row.get(0)?,
                        display_name: row.get(1)?,
                        secret_hash: row.get(2)?,
                        permissions: perms_str
                            .split(',')
                            .filter_map(Permission::parse)
                            .collect(),
                        rpm_limit: row.get::<_, i64>(4)? as u32,
                        rpd_limit: row.get::<_, i64>(5)? as u32,
                        tpm_limit: row.get::<_, i64>(6)? as u64,
                        expires_at: expires_str
                            .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
                            .map(|d| d.with_timezone(&Utc)),
                        tenant_binding: row.get(8)?,
                    })
                },
            )
            .optional()?;
        Ok(row)
    }

    pub fn delete_key(&self, key_id: &str) -> Result<bool> {
        let db = self.db.lock().expect("key store lock poisoned");
        let rows = db.execute("DELETE FROM client_keys WHERE key_id = ?1", params![key_id])?;
        Ok(rows > 0)
    }

    /// `AtomicIncrementWithTTL`: increments `counter_key` by `delta`, and if
    /// this call created the counter (post-increment count == delta) or the
    /// prior entry had already expired, resets its TTL to `window_secs`.
    /// The entire read-check-write sequence runs under one lock acquisition
    /// — never a read, then an await, then a write.
    pub fn atomic_increment_with_ttl(
        &self,
        counter_key: &str,
        delta: u64,
        window_secs: u64,
    ) -> Result<u64> {
        let db = self.db.lock().expect("key store lock poisoned");
        let now = Utc::now();

        let existing: Option<(i64, String)> = db
            .query_row(
                "SELECT count, expires_at FROM rate_counters WHERE counter_key = ?1",
                params![counter_key],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        let expired = existing
            .as_ref()
            .and_then(|(_, exp)| DateTime::parse_from_rfc3339(exp).ok())
            .map(|exp| now > exp.with_timezone(&Utc))
            .unwrap_or(true);

        let new_count = if expired {
            let new_expiry = now + chrono::Duration::seconds(window_secs as i64);
            db.execute(
                "INSERT OR REPLACE INTO rate_counters (counter_key, count, expires_at) VALUES (?1, ?2, ?3)",
                params![counter_key, delta as i64, new_expiry.to_rfc3339()],
            )?;
            delta
        } else {
            db.execute(
                "UPDATE rate_counters SET count = count + ?2 WHERE counter_key = ?1",
                params![counter_key, delta as i64],
            )?;
            (existing.unwrap().0 as u64) + delta
        };

        Ok(new_count)
    }

    pub fn record_usage(
        &self,
        request_id: &str,
        key_id: &str,
        tenant_id: &str,
        provider: &str,
        model: &str,
        input_tokens: u64,
        output_tokens: u64,
        status: &str,
    ) -> Result<()> {
        let db = self.db.lock().expect("key store lock poisoned");
        db.execute(
            "INSERT INTO usage_log (request_id, key_id, tenant_id, provider, model, timestamp, input_tokens, output_tokens, status)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                request_id,
                key_id,
                tenant_id,
                provider,
                model,
                Utc::now().to_rfc3339(),
                input_tokens as i64,
                output_tokens as i64,
                status,
            ],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_key(id: &str) -> ClientKey {
        ClientKey {
            key_id: id.into(),
            display_name: "test".into(),
            secret_hash: crate::vault::hash_secret("s3cret").unwrap(),
            permissions: [Permission::Chat].into_iter().collect(),
            rpm_limit: 60,
            rpd_limit: 1000,
            tpm_limit: 100_000,
            expires_at: None,
            tenant_binding: None,
        }
    }

    #[test]
    fn put_then_get_roundtrips() {
        let store = KeyStore::in_memory().unwrap();
        let key = sample_key("k1");
        store.put_key(&key).unwrap();
        let fetched = store.get_key("k1").unwrap().unwrap();
        assert_eq!(fetched.key_id, "k1");
        assert!(fetched.has_permission(Permission::Chat));
        assert!(!fetched.has_permission(Permission::Admin));
    }

    #[test]
    fn missing_key_returns_none() {
        let store = KeyStore::in_memory().unwrap();
        assert!(store.get_key("nope").unwrap().is_none());
    }

    #[test]
    fn atomic_increment_creates_counter_with_ttl() {
        let store = KeyStore::in_memory().unwrap();
        let n = store.atomic_increment_with_ttl("k1:minute", 1, 60).unwrap();
        assert_eq!(n, 1);
        let n2 = store.atomic_increment_with_ttl("k1:minute", 1, 60).unwrap();
        assert_eq!(n2, 2);
    }

    #[test]
    fn atomic_increment_resets_after_expiry() {
        let store = KeyStore::in_memory().unwrap();
        store.atomic_increment_with_ttl("k1:minute", 5, 0).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(5));
        let n = store.atomic_increment_with_ttl("k1:minute", 1, 60).unwrap();
        assert_eq!(n, 1, "counter must reset once its TTL has elapsed");
    }

    #[test]
    fn admin_permission_implies_all() {
        let mut key = sample_key("k1");
        key.permissions = [Permission::Admin].into_iter().collect();
        assert!(key.has_permission(Permission::Files));
        assert!(key.has_permission(Permission::Admin));
    }
}
