//! Shared request-scope setup used by every service handler: credential
//! check, rate-limit admission, tenant resolution, and request id
//! extraction. Not a tonic `Interceptor` (those run before the handler
//! has access to the parsed body, and tenant id here can live in the
//! body as well as metadata) — each handler calls this directly as its
//! first step, matching the interceptor-chain order from the spec (C2
//! then C3).

use tonic::metadata::MetadataMap;
use tonic::Status;

use crate::auth::{Authenticator, ClientKey, RateLimiter};
use crate::config::TenantConfig;
use crate::error::Result;
use crate::tenant::TenantResolver;

const REQUEST_ID_HEADER: &str = "x-request-id";

pub fn request_id_from_metadata(metadata: &MetadataMap) -> Option<String> {
    metadata
        .get(REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
}

/// Authenticate the caller and apply request-rate admission. Returns the
/// resolved `ClientKey` on success.
pub async fn authenticate(
    metadata: &MetadataMap,
    authenticator: &Authenticator,
    rate_limiter: &RateLimiter,
) -> Result<ClientKey> {
    let client = authenticator.authenticate(metadata).await?;
    rate_limiter.allow(&client)?;
    Ok(client)
}

/// Resolve the effective tenant for this call.
pub fn resolve_tenant(resolver: &TenantResolver, raw_tenant_id: &str, client: &ClientKey) -> Result<TenantConfig> {
    resolver.resolve(raw_tenant_id, client)
}

pub fn into_status(e: crate::error::GatewayError) -> Status {
    e.into()
}
