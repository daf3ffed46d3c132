//! Config Merger (C5) — composes the effective per-request provider
//! configuration from tenant defaults and per-request overrides.

use std::collections::HashMap;
use std::net::IpAddr;

use crate::auth::{ClientKey, Permission};
use crate::config::ProviderSettings;
use crate::error::{GatewayError, Result};

/// Effective, per-request configuration handed to a provider adapter.
/// Deep-copied from tenant state — never shares mutable state with it.
#[derive(Debug, Clone)]
pub struct EffectiveProviderConfig {
    pub api_key: String,
    pub model: String,
    pub temperature: Option<f32>,
    pub top_p: Option<f32>,
    pub max_output_tokens: Option<u32>,
    pub base_url: Option<String>,
    pub extra_options: HashMap<String, String>,
}

/// Per-request overrides parsed from the wire request. `base_url` is the
/// only field requiring the `admin` permission.
#[derive(Debug, Clone, Default)]
pub struct RequestOverrides {
    pub model: Option<String>,
    pub temperature: Option<f32>,
    pub top_p: Option<f32>,
    pub max_output_tokens: Option<u32>,
    pub base_url: Option<String>,
    pub extra_options: HashMap<String, String>,
}

/// Merge tenant provider settings with request overrides under the
/// security policy: the API key is never request-overridable, and a
/// custom `base_url` requires the `admin` permission plus SSRF validation.
pub fn merge(
    tenant_settings: &ProviderSettings,
    overrides: &RequestOverrides,
    client: &ClientKey,
    allow_http: bool,
) -> Result<EffectiveProviderConfig> {
    let mut effective = EffectiveProviderConfig {
        api_key: tenant_settings.api_key.clone(),
        model: tenant_settings.default_model.clone(),
        temperature: tenant_settings.temperature,
        top_p: tenant_settings.top_p,
        max_output_tokens: tenant_settings.max_output_tokens,
        base_url: tenant_settings.base_url.clone(),
        extra_options: tenant_settings.extra_options.clone(),
    };

    if let Some(model) = &overrides.model {
        effective.model = model.clone();
    }
    if overrides.temperature.is_some() {
        effective.temperature = overrides.temperature;
    }
    if overrides.top_p.is_some() {
        effective.top_p = overrides.top_p;
    }
    if overrides.max_output_tokens.is_some() {
        effective.max_output_tokens = overrides.max_output_tokens;
    }
    for (k, v) in &overrides.extra_options {
        effective.extra_options.insert(k.clone(), v.clone());
    }

    if let Some(base_url) = &overrides.base_url {
        if !base_url.is_empty() {
            if !client.has_permission(Permission::Admin) {
                return Err(GatewayError::PermissionDenied(
                    "custom base_url requires the admin permission".into(),
                ));
            }
            validate_base_url(base_url, allow_http)?;
            effective.base_url = Some(base_url.clone());
        }
    }

    Ok(effective)
}

/// Reject schemes outside an allow-list and any private/loopback/link-local
/// target, to prevent server-side request forgery via a tenant- or
/// admin-supplied base URL.
fn validate_base_url(url: &str, allow_http: bool) -> Result<()> {
    let parsed = url::Url::parse(url)
        .map_err(|e| GatewayError::invalid_input(format!("invalid base_url: {e}")))?;

    match parsed.scheme() {
        "https" => {}
        "http" if allow_http => {}
        other => {
            return Err(GatewayError::invalid_input(format!(
                "base_url scheme '{other}' is not allowed"
            )))
        }
    }

    let Some(host) = parsed.host_str() else {
        return Err(GatewayError::invalid_input("base_url has no host"));
    };

    if host.eq_ignore_ascii_case("localhost") {
        return Err(GatewayError::invalid_input(
            "base_url may not target localhost",
        ));
    }

    if let Ok(ip) = host.parse::<IpAddr>() {
        if is_disallowed_ip(&ip) {
            return Err(GatewayError::invalid_input(
                "base_url may not target a private, loopback, or link-local address",
            ));
        }
    }

    Ok(())
}

fn is_disallowed_ip(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            v4.is_loopback() || v4.is_private() || v4.is_link_local() || v4.is_unspecified()
        }
        IpAddr::V6(v6) => v6.is_loopback() || v6.is_unspecified() || (v6.segments()[0] & 0xfe00) == 0xfc00,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn settings() -> ProviderSettings {
        ProviderSettings {
            enabled: true,
            api_key: "tenant-secret-key".into(),
            default_model: "gpt-4o".into(),
            temperature: Some(0.7),
            top_p: None,
            max_output_tokens: Some(1024),
            base_url: None,
            extra_options: HashMap::new(),
        }
    }

    fn client(admin: bool) -> ClientKey {
        let mut perms = HashSet::from([Permission::Chat]);
        if admin {
            perms.insert(Permission::Admin);
        }
        ClientKey {
            key_id: "k1".into(),
            display_name: "t".into(),
            secret_hash: String::new(),
            permissions: perms,
            rpm_limit: 100,
            rpd_limit: 1000,
            tpm_limit: 100_000,
            expires_at: None,
            tenant_binding: None,
        }
    }

    #[test]
    fn api_key_is_never_overridable() {
        let mut overrides = RequestOverrides::default();
        overrides
            .extra_options
            .insert("api_key".into(), "attacker-supplied".into());
        let merged = merge(&settings(), &overrides, &client(false), false).unwrap();
        assert_eq!(merged.api_key, "tenant-secret-key");
    }

    #[test]
    fn request_model_override_wins() {
        let overrides = RequestOverrides {
            model: Some("gpt-4o-mini".into()),
            ..Default::default()
        };
        let merged = merge(&settings(), &overrides, &client(false), false).unwrap();
        assert_eq!(merged.model, "gpt-4o-mini");
    }

    #[test]
    fn base_url_without_admin_is_denied() {
        let overrides = RequestOverrides {
            base_url: Some("https://proxy.example.com".into()),
            ..Default::default()
        };
        let err = merge(&settings(), &overrides, &client(false), false).unwrap_err();
        assert!(matches!(err, GatewayError::PermissionDenied(_)));
    }

    #[test]
    fn base_url_with_admin_and_valid_host_is_accepted() {
        let overrides = RequestOverrides {
            base_url: Some("https://proxy.example.com".into()),
            ..Default::default()
        };
        let merged = merge(&settings(), &overrides, &client(true), false).unwrap();
        assert_eq!(merged.base_url.as_deref(), Some("https://proxy.example.com"));
    }

    #[test]
    fn base_url_targeting_loopback_is_rejected_even_for_admin() {
        let overrides = RequestOverrides {
            base_url: Some("https://127.0.0.1:8080".into()),
            ..Default::default()
        };
        let err = merge(&settings(), &overrides, &client(true), false).unwrap_err();
        assert!(matches!(err, GatewayError::InvalidInput(_)));
    }

    #[test]
    fn base_url_targeting_private_network_is_rejected() {
        let overrides = RequestOverrides {
            base_url: Some("https://10.0.0.5".into()),
            ..Default::default()
        };
        assert!(merge(&settings(), &overrides, &client(true), false).is_err());
    }

    #[test]
    fn plain_http_rejected_unless_allowed() {
        let overrides = RequestOverrides {
            base_url: Some("http://proxy.example.com".into()),
            ..Default::default()
        };
        assert!(merge(&settings(), &overrides, &client(true), false).is_err());
        assert!(merge(&settings(), &overrides, &client(true), true).is_ok());
    }
}
