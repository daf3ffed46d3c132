//! Process-scope configuration and tenant configuration loading.
//!
//! Two-stage precedence, mirroring the key-pool daemon's `Config::from_env()`:
//! a YAML document (with `${VAR}` expansion) is loaded first, then specific
//! fields are overridden from environment variables.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use crate::error::{GatewayError, Result};

// ── Process-scope configuration ─────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_grpc_port")]
    pub grpc_port: u16,
    #[serde(default)]
    pub tls_enabled: bool,
    #[serde(default)]
    pub tls_cert_file: Option<PathBuf>,
    #[serde(default)]
    pub tls_key_file: Option<PathBuf>,
    #[serde(default = "default_db_path")]
    pub key_store_path: PathBuf,
    #[serde(default)]
    pub key_store_password: Option<String>,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default = "default_log_format")]
    pub log_format: String,
    #[serde(default = "default_tenants_dir")]
    pub tenants_dir: PathBuf,
    #[serde(default = "default_pricing_dir")]
    pub pricing_dir: PathBuf,
}

fn default_grpc_port() -> u16 {
    50051
}
fn default_db_path() -> PathBuf {
    data_dir().join("gateway.db")
}
fn default_log_level() -> String {
    "info".into()
}
fn default_log_format() -> String {
    "pretty".into()
}
fn default_tenants_dir() -> PathBuf {
    data_dir().join("tenants")
}
fn default_pricing_dir() -> PathBuf {
    data_dir().join("pricing")
}

fn data_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".polyglot-gateway")
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            grpc_port: default_grpc_port(),
            tls_enabled: false,
            tls_cert_file: None,
            tls_key_file: None,
            key_store_path: default_db_path(),
            key_store_password: None,
            log_level: default_log_level(),
            log_format: default_log_format(),
            tenants_dir: default_tenants_dir(),
            pricing_dir: default_pricing_dir(),
        }
    }
}

impl GatewayConfig {
    /// Load from an optional YAML document, then apply environment overrides.
    pub fn load(config_path: Option<&Path>) -> Result<Self> {
        let mut cfg = match config_path {
            Some(path) if path.exists() => {
                let raw = std::fs::read_to_string(path)?;
                let expanded = expand_env_vars(&raw);
                serde_yaml::from_str(&expanded)?
            }
            _ => GatewayConfig::default(),
        };

        if let Ok(port) = std::env::var("GRPC_PORT") {
            cfg.grpc_port = port
                .parse()
                .map_err(|_| GatewayError::invalid_input("GRPC_PORT must be a u16"))?;
        }
        if let Ok(v) = std::env::var("TLS_ENABLED") {
            cfg.tls_enabled = v == "1" || v.eq_ignore_ascii_case("true");
        }
        if let Ok(v) = std::env::var("TLS_CERT_FILE") {
            cfg.tls_cert_file = Some(PathBuf::from(v));
        }
        if let Ok(v) = std::env::var("TLS_KEY_FILE") {
            cfg.tls_key_file = Some(PathBuf::from(v));
        }
        if let Ok(v) = std::env::var("KEY_STORE_PATH") {
            cfg.key_store_path = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("KEY_STORE_PASSWORD") {
            cfg.key_store_password = Some(v);
        }
        if let Ok(v) = std::env::var("LOG_LEVEL") {
            cfg.log_level = v;
        }
        if let Ok(v) = std::env::var("LOG_FORMAT") {
            cfg.log_format = v;
        }
        if let Ok(v) = std::env::var("TENANTS_DIR") {
            cfg.tenants_dir = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("PRICING_DIR") {
            cfg.pricing_dir = PathBuf::from(v);
        }

        Ok(cfg)
    }
}

/// Expand `${VAR}` references against the process environment.
fn expand_env_vars(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '$' && chars.peek() == Some(&'{') {
            chars.next();
            let mut name = String::new();
            for c2 in chars.by_ref() {
                if c2 == '}' {
                    break;
                }
                name.push(c2);
            }
            match std::env::var(&name) {
                Ok(val) => out.push_str(&val),
                Err(_) => out.push_str(&format!("${{{name}}}")),
            }
        } else {
            out.push(c);
        }
    }
    out
}

// ── Tenant configuration ────────────────────────────────────────────

pub const KNOWN_PROVIDERS: &[&str] = &["openai", "gemini", "anthropic"];

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ProviderSettings {
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    pub api_key: String,
    pub default_model: String,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub top_p: Option<f32>,
    #[serde(default)]
    pub max_output_tokens: Option<u32>,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub extra_options: HashMap<String, String>,
}

fn default_enabled() -> bool {
    true
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct FailoverPolicy {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub order: Vec<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TenantConfig {
    pub tenant_id: String,
    pub providers: HashMap<String, ProviderSettings>,
    #[serde(default)]
    pub failover: FailoverPolicy,
}

impl TenantConfig {
    /// Normalize a tenant id: trim whitespace, lower-case.
    pub fn normalize_id(id: &str) -> String {
        id.trim().to_lowercase()
    }

    pub fn validate(&self) -> Result<()> {
        for p in &self.failover.order {
            match self.providers.get(p) {
                Some(settings) if settings.enabled => {}
                Some(_) => {
                    return Err(GatewayError::invalid_input(format!(
                        "failover order references disabled provider '{p}'"
                    )))
                }
                None => {
                    return Err(GatewayError::invalid_input(format!(
                        "failover order references unknown provider '{p}'"
                    )))
                }
            }
        }
        Ok(())
    }
}

/// An immutable snapshot of all tenant configuration, loaded at startup.
#[derive(Debug, Default)]
pub struct TenantTable {
    tenants: HashMap<String, TenantConfig>,
}

impl TenantTable {
    pub fn get(&self, tenant_id: &str) -> Option<&TenantConfig> {
        self.tenants.get(&TenantConfig::normalize_id(tenant_id))
    }

    pub fn single_tenant(&self) -> Option<&TenantConfig> {
        if self.tenants.len() == 1 {
            self.tenants.values().next()
        } else {
            None
        }
    }

    pub fn len(&self) -> usize {
        self.tenants.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tenants.is_empty()
    }

    /// Load every `*.yaml`/`*.yml`/`*.json` document in `dir` as a tenant.
    /// Documents lacking a `tenant_id` field are skipped (shared overlays).
    /// `passphrase`, when set, decrypts any provider `api_key` stored with
    /// the `enc:` prefix (see `resolve_api_key`); plaintext keys pass
    /// through untouched either way.
    pub fn load_dir(dir: &Path, passphrase: Option<&[u8]>) -> Result<Self> {
        let mut tenants = HashMap::new();
        if !dir.exists() {
            return Ok(Self { tenants });
        }
        for entry in std::fs::read_dir(dir)? {
            let entry = entry?;
            let path = entry.path();
            let Some(ext) = path.extension().and_then(|e| e.to_str()) else {
                continue;
            };
            if !matches!(ext, "yaml" | "yml" | "json") {
                continue;
            }
            let raw = std::fs::read_to_string(&path)?;
            let expanded = expand_env_vars(&raw);
            let value: serde_yaml::Value = serde_yaml::from_str(&expanded)?;
            if value.get("tenant_id").is_none() {
                tracing::warn!(path = %path.display(), "skipping tenant document with no tenant_id (shared overlay)");
                continue;
            }
            let mut tenant: TenantConfig = serde_yaml::from_value(value)?;
            tenant.tenant_id = TenantConfig::normalize_id(&tenant.tenant_id);
            for settings in tenant.providers.values_mut() {
                settings.api_key = resolve_api_key(&settings.api_key, passphrase)?;
            }
            tenant.validate()?;
            tenants.insert(tenant.tenant_id.clone(), tenant);
        }
        Ok(Self { tenants })
    }
}

const ENCRYPTED_PREFIX: &str = "enc:";

/// Decrypt an `enc:<base64>`-prefixed provider API key using
/// `crate::vault`'s AES-256-GCM envelope; keys without the prefix are
/// returned unchanged (plaintext is still supported for local/dev use).
fn resolve_api_key(raw: &str, passphrase: Option<&[u8]>) -> Result<String> {
    let Some(encoded) = raw.strip_prefix(ENCRYPTED_PREFIX) else {
        return Ok(raw.to_string());
    };
    let passphrase = passphrase.ok_or_else(|| {
        GatewayError::invalid_input("tenant config has an encrypted api_key but no key_store_password is configured")
    })?;
    use base64::Engine;
    let ciphertext = base64::engine::general_purpose::STANDARD
        .decode(encoded)
        .map_err(|e| GatewayError::invalid_input(format!("invalid base64 in encrypted api_key: {e}")))?;
    let plaintext = crate::vault::decrypt(&ciphertext, passphrase)?;
    String::from_utf8(plaintext).map_err(|_| GatewayError::invalid_input("decrypted api_key is not valid UTF-8"))
}

/// Reloadable handle to the tenant table: readers hold the snapshot they
/// fetched; `reload` swaps the pointer without disturbing them.
#[derive(Clone)]
pub struct TenantTableHandle(Arc<RwLock<Arc<TenantTable>>>);

impl TenantTableHandle {
    pub fn new(table: TenantTable) -> Self {
        Self(Arc::new(RwLock::new(Arc::new(table))))
    }

    pub fn snapshot(&self) -> Arc<TenantTable> {
        Arc::clone(&self.0.read().expect("tenant table lock poisoned"))
    }

    pub fn reload(&self, table: TenantTable) {
        let mut guard = self.0.write().expect("tenant table lock poisoned");
        *guard = Arc::new(table);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_id_is_idempotent() {
        let once = TenantConfig::normalize_id("  ACME ");
        let twice = TenantConfig::normalize_id(&once);
        assert_eq!(once, twice);
        assert_eq!(once, "acme");
    }

    #[test]
    fn expand_env_vars_substitutes_known_and_preserves_unknown() {
        std::env::set_var("GATEWAY_TEST_VAR", "hello");
        let out = expand_env_vars("value: ${GATEWAY_TEST_VAR}, other: ${GATEWAY_TEST_UNSET_VAR}");
        assert_eq!(out, "value: hello, other: ${GATEWAY_TEST_UNSET_VAR}");
    }

    #[test]
    fn load_dir_skips_overlay_without_tenant_id() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("acme.yaml"),
            "tenant_id: Acme\nproviders:\n  gemini:\n    api_key: k1\n    default_model: gemini-2.5-flash\n",
        )
        .unwrap();
        std::fs::write(dir.path().join("shared.yaml"), "shared_note: hi\n").unwrap();

        let table = TenantTable::load_dir(dir.path(), None).unwrap();
        assert_eq!(table.len(), 1);
        assert!(table.get("ACME").is_some());
        assert!(table.get("acme").is_some());
    }

    #[test]
    fn load_dir_decrypts_enc_prefixed_api_keys() {
        let passphrase = b"correct horse battery staple";
        let ciphertext = crate::vault::encrypt(b"sk-live-secret", passphrase);
        use base64::Engine;
        let encoded = base64::engine::general_purpose::STANDARD.encode(ciphertext);

        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("acme.yaml"),
            format!(
                "tenant_id: acme\nproviders:\n  gemini:\n    api_key: \"enc:{encoded}\"\n    default_model: gemini-2.5-flash\n"
            ),
        )
        .unwrap();

        let table = TenantTable::load_dir(dir.path(), Some(passphrase)).unwrap();
        let tenant = table.get("acme").unwrap();
        assert_eq!(tenant.providers["gemini"].api_key, "sk-live-secret");
    }

    #[test]
    fn load_dir_errors_on_encrypted_key_without_passphrase() {
        let passphrase = b"correct horse battery staple";
        let ciphertext = crate::vault::encrypt(b"sk-live-secret", passphrase);
        use base64::Engine;
        let encoded = base64::engine::general_purpose::STANDARD.encode(ciphertext);

        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("acme.yaml"),
            format!(
                "tenant_id: acme\nproviders:\n  gemini:\n    api_key: \"enc:{encoded}\"\n    default_model: gemini-2.5-flash\n"
            ),
        )
        .unwrap();

        let err = TenantTable::load_dir(dir.path(), None).unwrap_err();
        assert!(matches!(err, GatewayError::InvalidInput(_)));
    }

    #[test]
    fn validate_rejects_failover_to_unknown_provider() {
        let mut providers = HashMap::new();
        providers.insert(
            "gemini".to_string(),
            ProviderSettings {
                enabled: true,
                api_key: "k".into(),
                default_model: "gemini-2.5-flash".into(),
                temperature: None,
                top_p: None,
                max_output_tokens: None,
                base_url: None,
                extra_options: HashMap::new(),
            },
        );
        let tenant = TenantConfig {
            tenant_id: "acme".into(),
            providers,
            failover: FailoverPolicy {
                enabled: true,
                order: vec!["openai".into()],
            },
        };
        assert!(tenant.validate().is_err());
    }

    #[test]
    fn single_tenant_shortcut() {
        let mut tenants = HashMap::new();
        tenants.insert(
            "acme".to_string(),
            TenantConfig {
                tenant_id: "acme".into(),
                providers: HashMap::new(),
                failover: FailoverPolicy::default(),
            },
        );
        let table = TenantTable { tenants };
        assert!(table.single_tenant().is_some());
    }
}
