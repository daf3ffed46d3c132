//! `ChatService` — unary and streaming generation, plus a dry-run
//! provider-selection preview.

use futures_util::StreamExt;
use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tonic::{Request, Response, Status, Streaming};

use super::pb;
use super::interceptors::{authenticate, request_id_from_metadata, resolve_tenant};
use crate::auth::{Authenticator, ClientKey, KeyStore, RateLimiter};
use crate::config::TenantConfig;
use crate::config_merge::RequestOverrides;
use crate::dispatch::{DispatchEngine, DispatchRequest, FileSearchOptions};
use crate::error::GatewayError;
use crate::providers::ChatTurn;
use crate::tenant::TenantResolver;

const DEFAULT_DEADLINE: Duration = Duration::from_secs(60);

pub struct ChatServiceImpl {
    pub authenticator: Arc<Authenticator>,
    pub rate_limiter: Arc<RateLimiter>,
    pub tenant_resolver: Arc<TenantResolver>,
    pub dispatch: Arc<DispatchEngine>,
    pub key_store: Arc<KeyStore>,
}

impl ChatServiceImpl {
    async fn authenticate_and_resolve(
        &self,
        metadata: &tonic::metadata::MetadataMap,
        tenant_id: &str,
    ) -> Result<(ClientKey, TenantConfig), Status> {
        let client = authenticate(metadata, &self.authenticator, &self.rate_limiter)
            .await
            .map_err(Into::<Status>::into)?;
        let tenant = resolve_tenant(&self.tenant_resolver, tenant_id, &client).map_err(Into::<Status>::into)?;
        Ok((client, tenant))
    }
}

fn split_messages(messages: Vec<pb::ChatMessage>) -> Result<(Option<String>, Vec<ChatTurn>, String), Status> {
    let mut system_parts = Vec::new();
    let mut rest = Vec::new();
    for m in messages {
        if m.role == "system" {
            system_parts.push(m.content);
        } else {
            rest.push(ChatTurn { role: m.role, content: m.content });
        }
    }
    let last = rest
        .pop()
        .ok_or_else(|| Status::invalid_argument("at least one non-system message is required"))?;
    let instructions = if system_parts.is_empty() {
        None
    } else {
        Some(system_parts.join("\n\n"))
    };
    Ok((instructions, rest, last.content))
}

fn overrides_from_pb(overrides: Option<pb::ProviderOverrides>) -> RequestOverrides {
    let Some(o) = overrides else {
        return RequestOverrides::default();
    };
    RequestOverrides {
        model: o.model,
        temperature: o.temperature.map(|t| t as f32),
        top_p: None,
        max_output_tokens: o.max_tokens,
        base_url: o.base_url,
        extra_options: HashMap::new(),
    }
}

fn build_dispatch_request(
    req: pb::GenerateRequest,
    client: ClientKey,
    tenant: TenantConfig,
    request_id: Option<String>,
) -> Result<DispatchRequest, Status> {
    let failover_enabled = tenant.failover.enabled;
    let (instructions, history, user_input) = split_messages(req.messages)?;

    Ok(DispatchRequest {
        request_id,
        tenant,
        client,
        instructions,
        user_input,
        history,
        metadata: req.metadata,
        preferred_provider: req.provider,
        fallback_provider: req.fallback_provider,
        failover_enabled,
        overrides: overrides_from_pb(req.overrides),
        file_search: FileSearchOptions {
            enabled: req.use_retrieval,
            store_id: req.store_id,
        },
        allow_http_base_url: false,
        deadline: DEFAULT_DEADLINE,
    })
}

#[tonic::async_trait]
impl pb::chat_service_server::ChatService for ChatServiceImpl {
    async fn generate_reply(
        &self,
        request: Request<pb::GenerateRequest>,
    ) -> Result<Response<pb::GenerateReply>, Status> {
        let request_id = request_id_from_metadata(request.metadata());
        let (client, tenant) = self.authenticate_and_resolve(request.metadata(), &request.get_ref().tenant_id).await?;

        let req = request.into_inner();
        let tenant_id = tenant.tenant_id.clone();
        let key_id = client.key_id.clone();
        let dispatch_req = build_dispatch_request(req, client, tenant, request_id.clone())?;

        let result = self
            .dispatch
            .generate(dispatch_req)
            .await
            .map_err(Into::<Status>::into)?;

        self.rate_limiter
            .record_tokens_for_key(&key_id, result.inner.usage.total_tokens());
        if let Err(e) = self.key_store.record_usage(
            request_id.as_deref().unwrap_or_default(),
            &key_id,
            &tenant_id,
            &result.provider,
            &result.inner.model,
            result.inner.usage.input_tokens,
            result.inner.usage.output_tokens,
            "ok",
        ) {
            tracing::warn!(error = %e, "failed to record usage log entry");
        }

        Ok(Response::new(pb::GenerateReply {
            text: result.inner.text,
            model: result.inner.model,
            provider: result.provider,
            input_tokens: result.inner.usage.input_tokens,
            output_tokens: result.inner.usage.output_tokens,
            latency_ms: 0,
            citations: citations_to_pb(result.inner.citations),
            used_fallback: result.failed_over,
            original_provider: result.original_provider,
            original_error: result.original_error,
            cost_usd: result.cost_usd,
        }))
    }

    type GenerateReplyStreamStream = Pin<Box<dyn futures_core::Stream<Item = Result<pb::StreamEvent, Status>> + Send>>;

    async fn generate_reply_stream(
        &self,
        request: Request<pb::GenerateRequest>,
    ) -> Result<Response<Self::GenerateReplyStreamStream>, Status> {
        let request_id = request_id_from_metadata(request.metadata());
        let (client, tenant) = self.authenticate_and_resolve(request.metadata(), &request.get_ref().tenant_id).await?;

        let req = request.into_inner();
        let dispatch_req = build_dispatch_request(req, client, tenant, request_id)?;

        let (_provider, stream) = self
            .dispatch
            .generate_stream(dispatch_req)
            .await
            .map_err(Into::<Status>::into)?;

        let mapped = stream.map(|event| Ok(event_to_pb(event)));
        Ok(Response::new(Box::pin(mapped)))
    }

    async fn select_provider(
        &self,
        request: Request<pb::SelectProviderRequest>,
    ) -> Result<Response<pb::SelectProviderReply>, Status> {
        let (client, tenant) = self
            .authenticate_and_resolve(request.metadata(), &request.get_ref().tenant_id)
            .await?;
        let req = request.into_inner();

        if !client.has_permission(crate::auth::Permission::Chat) {
            return Err(GatewayError::PermissionDenied("key lacks the 'Chat' permission".into()).into());
        }

        let provider = req
            .provider
            .filter(|p| !p.is_empty())
            .or_else(|| {
                if tenant.failover.enabled {
                    tenant.failover.order.first().cloned()
                } else {
                    None
                }
            })
            .or_else(|| tenant.providers.iter().find(|(_, s)| s.enabled).map(|(n, _)| n.clone()))
            .ok_or_else(|| Status::invalid_argument("tenant has no enabled provider"))?;

        let model = tenant
            .providers
            .get(&provider)
            .map(|s| s.default_model.clone())
            .unwrap_or_default();

        Ok(Response::new(pb::SelectProviderReply {
            provider,
            model,
            failover_order: tenant.failover.order,
        }))
    }
}

fn citations_to_pb(citations: Vec<crate::providers::Citation>) -> Vec<pb::Citation> {
    citations
        .into_iter()
        .map(|c| match c {
            crate::providers::Citation::Url { uri, .. } => pb::Citation {
                source_id: uri,
                snippet: String::new(),
                score: 0.0,
                chunk_index: None,
            },
            crate::providers::Citation::File { file_id, snippet, chunk_index, .. } => pb::Citation {
                source_id: file_id,
                snippet,
                score: 0.0,
                chunk_index,
            },
        })
        .collect()
}

fn event_to_pb(event: crate::providers::StreamEvent) -> pb::StreamEvent {
    use crate::providers::StreamEvent as E;
    let inner = match event {
        E::TextDelta { text, .. } => pb::stream_event::Event::TextDelta(pb::TextDelta { text }),
        E::UsageUpdate(usage) => pb::stream_event::Event::UsageUpdate(pb::UsageUpdate {
            input_tokens: usage.input_tokens,
            output_tokens: usage.output_tokens,
        }),
        E::CitationUpdate(citation) => pb::stream_event::Event::CitationUpdate(pb::CitationUpdate {
            citations: citations_to_pb(vec![citation]),
        }),
        E::Complete { response_id, model, provider, usage } => pb::stream_event::Event::Complete(pb::Complete {
            model,
            provider: provider.to_string(),
            latency_ms: 0,
            used_fallback: false,
            response_id: response_id.unwrap_or_default(),
            input_tokens: usage.input_tokens,
            output_tokens: usage.output_tokens,
        }),
        E::Error { code, message, retryable } => pb::stream_event::Event::Error(pb::StreamError {
            code: code.to_string(),
            message,
            retryable,
        }),
    };
    pb::StreamEvent { event: Some(inner) }
}
