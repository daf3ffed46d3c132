//! Tenant Resolver (C3) — resolves a normalized `tenant_id` to a
//! `TenantConfig` and enforces the client/tenant binding invariant.

use crate::auth::{ClientKey, Permission};
use crate::config::{TenantConfig, TenantTableHandle};
use crate::error::{GatewayError, Result};

/// Fully-qualified method names exempt from tenant resolution — they use
/// the authenticated client's scope directly.
pub const TENANT_EXEMPT_METHODS: &[&str] = &[
    "/gateway.v1.AdminService/Health",
    "/gateway.v1.AdminService/Ready",
    "/gateway.v1.AdminService/Version",
];

pub struct TenantResolver {
    tenants: TenantTableHandle,
}

impl TenantResolver {
    pub fn new(tenants: TenantTableHandle) -> Self {
        Self { tenants }
    }

    /// Resolve `raw_tenant_id` (as read from the request body or a metadata
    /// header, possibly empty) against the authenticated client.
    pub fn resolve(&self, raw_tenant_id: &str, client: &ClientKey) -> Result<TenantConfig> {
        let snapshot = self.tenants.snapshot();
        let normalized = TenantConfig::normalize_id(raw_tenant_id);

        let tenant = if normalized.is_empty() {
            match snapshot.single_tenant() {
                Some(t) => t.clone(),
                None if snapshot.is_empty() => {
                    return Err(GatewayError::NotFound("no tenants configured".into()))
                }
                None => {
                    return Err(GatewayError::invalid_input(
                        "tenant_id is required when multiple tenants are configured",
                    ))
                }
            }
        } else {
            snapshot
                .get(&normalized)
                .cloned()
                .ok_or_else(|| GatewayError::NotFound(format!("unknown tenant '{normalized}'")))?
        };

        if let Some(binding) = &client.tenant_binding {
            let normalized_binding = TenantConfig::normalize_id(binding);
            if !normalized_binding.is_empty()
                && normalized_binding != tenant.tenant_id
                && !client.has_permission(Permission::Admin)
            {
                return Err(GatewayError::PermissionDenied(format!(
                    "key is bound to tenant '{normalized_binding}'"
                )));
            }
        }

        Ok(tenant)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{FailoverPolicy, TenantTable};
    use std::collections::HashSet;

    fn tenant(id: &str) -> TenantConfig {
        TenantConfig {
            tenant_id: id.into(),
            providers: Default::default(),
            failover: FailoverPolicy::default(),
        }
    }

    fn client(tenant_binding: Option<&str>, admin: bool) -> ClientKey {
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
            tenant_binding: tenant_binding.map(|s| s.to_string()),
        }
    }

    #[test]
    fn single_tenant_shortcut_resolves_empty_id() {
        let handle = TenantTableHandle::new(build_table(vec![tenant("acme")]));
        let resolver = TenantResolver::new(handle);
        let resolved = resolver.resolve("", &client(None, false)).unwrap();
        assert_eq!(resolved.tenant_id, "acme");
    }

    #[test]
    fn mixed_case_tenant_id_normalizes() {
        let handle = TenantTableHandle::new(build_table(vec![tenant("acme"), tenant("globex")]));
        let resolver = TenantResolver::new(handle);
        let resolved = resolver.resolve("ACME", &client(None, false)).unwrap();
        assert_eq!(resolved.tenant_id, "acme");
    }

    #[test]
    fn empty_id_with_multiple_tenants_is_invalid() {
        let handle = TenantTableHandle::new(build_table(vec![tenant("acme"), tenant("globex")]));
        let resolver = TenantResolver::new(handle);
        assert!(resolver.resolve("", &client(None, false)).is_err());
    }

    #[test]
    fn binding_mismatch_is_permission_denied() {
        let handle = TenantTableHandle::new(build_table(vec![tenant("acme"), tenant("globex")]));
        let resolver = TenantResolver::new(handle);
        let err = resolver
            .resolve("globex", &client(Some("acme"), false))
            .unwrap_err();
        assert!(matches!(err, GatewayError::PermissionDenied(_)));
    }

    #[test]
    fn admin_bypasses_binding_mismatch() {
        let handle = TenantTableHandle::new(build_table(vec![tenant("acme"), tenant("globex")]));
        let resolver = TenantResolver::new(handle);
        let resolved = resolver
            .resolve("globex", &client(Some("acme"), true))
            .unwrap();
        assert_eq!(resolved.tenant_id, "globex");
    }

    fn build_table(tenants: Vec<TenantConfig>) -> TenantTable {
        // Exercised only through the public load path in config.rs tests;
        // here we build directly via serde round-trip through a temp dir
        // to avoid depending on TenantTable's private fields.
        let dir = tempfile::tempdir().unwrap();
        for t in &tenants {
            let doc = serde_yaml::to_string(t).unwrap();
            std::fs::write(dir.path().join(format!("{}.yaml", t.tenant_id)), doc).unwrap();
        }
        TenantTable::load_dir(dir.path(), None).unwrap()
    }
}
