//! `AdminService` — unauthenticated liveness/readiness/version probes,
//! mirroring the health endpoints the load balancer and orchestrator poll.

use std::sync::Arc;
use tonic::{Request, Response, Status};

use super::pb;
use crate::auth::KeyStore;
use crate::config::TenantTableHandle;

pub struct AdminServiceImpl {
    pub key_store: Arc<KeyStore>,
    pub tenants: TenantTableHandle,
}

#[tonic::async_trait]
impl pb::admin_service_server::AdminService for AdminServiceImpl {
    async fn health(&self, _request: Request<pb::HealthRequest>) -> Result<Response<pb::HealthReply>, Status> {
        Ok(Response::new(pb::HealthReply { ok: true }))
    }

    async fn ready(&self, _request: Request<pb::ReadyRequest>) -> Result<Response<pb::ReadyReply>, Status> {
        let mut reasons = Vec::new();

        if let Err(e) = self.key_store.get_key("__readiness_probe__") {
            reasons.push(format!("credential store unreachable: {e}"));
        }

        let tenants = self.tenants.snapshot();
        if tenants.is_empty() {
            reasons.push("no tenants loaded".to_string());
        }

        Ok(Response::new(pb::ReadyReply {
            ready: reasons.is_empty(),
            not_ready_reasons: reasons,
        }))
    }

    async fn version(&self, _request: Request<pb::VersionRequest>) -> Result<Response<pb::VersionReply>, Status> {
        Ok(Response::new(pb::VersionReply {
            version: env!("CARGO_PKG_VERSION").to_string(),
            build: option_env!("GATEWAY_BUILD_SHA").unwrap_or("unknown").to_string(),
        }))
    }
}
