//! Dispatch Engine (C7) — orchestrates one request end to end: validate,
//! select a provider, merge configuration, optionally retrieve RAG context,
//! call the provider, fail over on a retryable error, and return a
//! normalized result.

use futures_core::stream::BoxStream;
use futures_util::StreamExt;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::auth::{ClientKey, Permission};
use crate::config::TenantConfig;
use crate::config_merge::{self, RequestOverrides};
use crate::error::{GatewayError, Result};
use crate::providers::{ChatProvider, ChatTurn, GenerateParams, GenerateResult, RequestContext, StreamEvent};
use crate::rag::{self, RetrievalClient, RetrievalRequest};

const MAX_USER_INPUT_BYTES: usize = 100_000;
const MAX_INSTRUCTIONS_BYTES: usize = 50_000;
const MAX_HISTORY_TURNS: usize = 200;
const MAX_METADATA_ENTRIES: usize = 32;
const MAX_METADATA_KEY_BYTES: usize = 128;
const MAX_METADATA_VALUE_BYTES: usize = 2_048;
const MAX_REQUEST_ID_LEN: usize = 128;
const DEFAULT_TOP_K: u32 = 5;
const RETRIEVAL_TIMEOUT: Duration = Duration::from_secs(5);

/// A named registry of configured provider adapters, keyed by provider id.
#[derive(Clone)]
pub struct ProviderRegistry {
    providers: HashMap<String, Arc<dyn ChatProvider>>,
}

impl ProviderRegistry {
    pub fn new(providers: HashMap<String, Arc<dyn ChatProvider>>) -> Self {
        Self { providers }
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn ChatProvider>> {
        self.providers.get(name)
    }
}

#[derive(Debug, Clone, Default)]
pub struct FileSearchOptions {
    pub enabled: bool,
    pub store_id: Option<String>,
}

pub struct DispatchRequest {
    pub request_id: Option<String>,
    pub tenant: TenantConfig,
    pub client: ClientKey,
    pub instructions: Option<String>,
    pub user_input: String,
    pub history: Vec<ChatTurn>,
    pub metadata: HashMap<String, String>,
    pub preferred_provider: Option<String>,
    pub fallback_provider: Option<String>,
    pub failover_enabled: bool,
    pub overrides: RequestOverrides,
    pub file_search: FileSearchOptions,
    pub allow_http_base_url: bool,
    pub deadline: Duration,
}

#[derive(Debug, Clone)]
pub struct DispatchResult {
    pub inner: GenerateResult,
    pub provider: String,
    pub failed_over: bool,
    pub original_provider: Option<String>,
    pub original_error: Option<String>,
    pub cost_usd: Option<f64>,
}

pub struct DispatchEngine {
    registry: ProviderRegistry,
    retrieval: Arc<dyn RetrievalClient>,
    pricing: Arc<crate::pricing::PricingTable>,
}

impl DispatchEngine {
    pub fn new(
        registry: ProviderRegistry,
        retrieval: Arc<dyn RetrievalClient>,
        pricing: Arc<crate::pricing::PricingTable>,
    ) -> Self {
        Self { registry, retrieval, pricing }
    }

    /// Steps 1-6, shared by the unary and streaming paths: permission,
    /// validation, provider selection, effective config, RAG injection.
    async fn prepare(
        &self,
        req: &DispatchRequest,
        perm: Permission,
    ) -> Result<(String, GenerateParams, Vec<rag::RetrievalChunk>)> {
        if !req.client.has_permission(perm) {
            return Err(GatewayError::PermissionDenied(format!(
                "key lacks the '{perm:?}' permission"
            )));
        }

        validate_request_id(req.request_id.as_deref())?;
        validate_text(&req.user_input, MAX_USER_INPUT_BYTES, "user_input", false)?;
        if let Some(instr) = &req.instructions {
            validate_text(instr, MAX_INSTRUCTIONS_BYTES, "instructions", true)?;
        }
        if req.history.len() > MAX_HISTORY_TURNS {
            return Err(GatewayError::invalid_input("history exceeds the maximum turn count"));
        }
        validate_metadata(&req.metadata)?;

        let provider_name = select_provider(req)?;
        let settings = req
            .tenant
            .providers
            .get(&provider_name)
            .filter(|s| s.enabled)
            .ok_or_else(|| GatewayError::invalid_input(format!("provider '{provider_name}' is not enabled for this tenant")))?;

        let effective = config_merge::merge(settings, &req.overrides, &req.client, req.allow_http_base_url)?;

        let mut instructions = req.instructions.clone();
        let mut chunks = Vec::new();

        let should_retrieve =
            req.file_search.enabled && req.file_search.store_id.is_some() && provider_name != "openai";
        if should_retrieve {
            let store_id = req.file_search.store_id.clone().unwrap();
            let retrieval_req = RetrievalRequest {
                tenant_id: req.tenant.tenant_id.clone(),
                store_id,
                query: req.user_input.clone(),
                top_k: DEFAULT_TOP_K,
                deadline: RETRIEVAL_TIMEOUT.min(req.deadline),
            };
            chunks = rag::retrieve_or_empty(self.retrieval.as_ref(), &retrieval_req).await;
            if !chunks.is_empty() {
                let appended = render_context_block(&chunks);
                let merged = format!("{}\n\n{}", instructions.clone().unwrap_or_default(), appended);
                validate_text(&merged, MAX_INSTRUCTIONS_BYTES, "instructions", true)?;
                instructions = Some(merged);
            }
        }

        let params = GenerateParams {
            instructions,
            user_input: req.user_input.clone(),
            history: req.history.clone(),
            previous_response_id: None,
            config: effective,
        };

        Ok((provider_name, params, chunks))
    }

    pub async fn generate(&self, req: DispatchRequest) -> Result<DispatchResult> {
        let ctx = RequestContext::new(
            req.request_id.clone().unwrap_or_else(|| Uuid::new_v4().to_string()),
            req.deadline,
        );
        let (provider_name, params, chunks) = self.prepare(&req, Permission::Chat).await?;

        let provider = self
            .registry
            .get(&provider_name)
            .ok_or_else(|| GatewayError::invalid_input(format!("unknown provider '{provider_name}'")))?;

        match provider.generate(&ctx, &params).await {
            Ok(mut result) => {
                append_citations(&mut result, &chunks);
                let cost_usd = self.pricing.cost(
                    &provider_name,
                    &result.model,
                    result.usage.input_tokens,
                    result.usage.output_tokens,
                );
                Ok(DispatchResult {
                    inner: result,
                    provider: provider_name,
                    failed_over: false,
                    original_provider: None,
                    original_error: None,
                    cost_usd,
                })
            }
            Err(primary_err) if req.failover_enabled && primary_err.is_retryable() => {
                let Some(fallback_name) = pick_fallback(&req, &provider_name) else {
                    return Err(primary_err);
                };
                let Some(fallback_settings) = req.tenant.providers.get(&fallback_name).filter(|s| s.enabled) else {
                    return Err(primary_err);
                };
                let fallback_provider = match self.registry.get(&fallback_name) {
                    Some(p) => p,
                    None => return Err(primary_err),
                };
                let fallback_config =
                    match config_merge::merge(fallback_settings, &req.overrides, &req.client, req.allow_http_base_url) {
                        Ok(c) => c,
                        Err(_) => return Err(primary_err),
                    };
                let fallback_params = GenerateParams {
                    config: fallback_config,
                    ..params
                };

                match fallback_provider.generate(&ctx, &fallback_params).await {
                    Ok(mut result) => {
                        append_citations(&mut result, &chunks);
                        let cost_usd = self.pricing.cost(
                            &fallback_name,
                            &result.model,
                            result.usage.input_tokens,
                            result.usage.output_tokens,
                        );
                        Ok(DispatchResult {
                            inner: result,
                            provider: fallback_name,
                            failed_over: true,
                            original_provider: Some(provider_name),
                            original_error: Some(sanitize_error(&primary_err)),
                            cost_usd,
                        })
                    }
                    Err(_) => Err(primary_err),
                }
            }
            Err(e) => Err(e),
        }
    }

    pub async fn generate_stream(
        &self,
        req: DispatchRequest,
    ) -> Result<(String, BoxStream<'static, StreamEvent>)> {
        let ctx = RequestContext::new(
            req.request_id.clone().unwrap_or_else(|| Uuid::new_v4().to_string()),
            req.deadline,
        );
        let (provider_name, params, chunks) = self.prepare(&req, Permission::ChatStream).await?;

        let provider = self
            .registry
            .get(&provider_name)
            .ok_or_else(|| GatewayError::invalid_input(format!("unknown provider '{provider_name}'")))?;

        let primary_attempt = provider.generate_stream(&ctx, &params).await;

        let (used_provider, upstream) = match primary_attempt {
            Ok(stream) => (provider_name, stream),
            Err(primary_err) if req.failover_enabled && primary_err.is_retryable() => {
                let fallback_name = pick_fallback(&req, &provider_name).ok_or(primary_err)?;
                let fallback_settings = req
                    .tenant
                    .providers
                    .get(&fallback_name)
                    .filter(|s| s.enabled)
                    .ok_or_else(|| GatewayError::internal("fallback provider has no settings"))?;
                let fallback_provider = self
                    .registry
                    .get(&fallback_name)
                    .ok_or_else(|| GatewayError::internal("fallback provider not registered"))?;
                let fallback_config =
                    config_merge::merge(fallback_settings, &req.overrides, &req.client, req.allow_http_base_url)?;
                let fallback_params = GenerateParams {
                    config: fallback_config,
                    ..params
                };
                let stream = fallback_provider.generate_stream(&ctx, &fallback_params).await?;
                (fallback_name, stream)
            }
            Err(e) => return Err(e),
        };

        let citation_events = chunks.into_iter().map(rag_chunk_to_citation_event);
        let combined = futures_util::stream::iter(citation_events).chain(upstream);
        Ok((used_provider, combined.boxed()))
    }
}

fn select_provider(req: &DispatchRequest) -> Result<String> {
    if let Some(p) = &req.preferred_provider {
        if !p.is_empty() {
            return Ok(p.clone());
        }
    }
    if req.tenant.failover.enabled {
        if let Some(first) = req.tenant.failover.order.first() {
            return Ok(first.clone());
        }
    }
    req.tenant
        .providers
        .iter()
        .find(|(_, s)| s.enabled)
        .map(|(name, _)| name.clone())
        .ok_or_else(|| GatewayError::invalid_input("tenant has no enabled provider"))
}

fn pick_fallback(req: &DispatchRequest, primary: &str) -> Option<String> {
    if let Some(explicit) = &req.fallback_provider {
        if !explicit.is_empty() && explicit != primary {
            return Some(explicit.clone());
        }
    }
    if let Some(from_order) = req
        .tenant
        .failover
        .order
        .iter()
        .find(|p| p.as_str() != primary && req.tenant.providers.get(*p).map(|s| s.enabled).unwrap_or(false))
    {
        return Some(from_order.clone());
    }
    crate::providers::hardcoded_sibling(primary)
        .map(|s| s.to_string())
        .filter(|s| req.tenant.providers.get(s).map(|set| set.enabled).unwrap_or(false))
}

fn validate_request_id(id: Option<&str>) -> Result<()> {
    let Some(id) = id else { return Ok(()) };
    if id.is_empty() {
        return Ok(());
    }
    if id.len() > MAX_REQUEST_ID_LEN
        || !id.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    {
        return Err(GatewayError::invalid_input(
            "request_id must match [A-Za-z0-9_-]{1,128}",
        ));
    }
    Ok(())
}

fn validate_text(text: &str, max_bytes: usize, field: &str, allow_empty: bool) -> Result<()> {
    if !allow_empty && text.is_empty() {
        return Err(GatewayError::invalid_input(format!("{field} must not be empty")));
    }
    if text.len() > max_bytes {
        return Err(GatewayError::invalid_input(format!("{field} exceeds the maximum size")));
    }
    Ok(())
}

fn validate_metadata(metadata: &HashMap<String, String>) -> Result<()> {
    if metadata.len() > MAX_METADATA_ENTRIES {
        return Err(GatewayError::invalid_input("metadata has too many entries"));
    }
    for (k, v) in metadata {
        if k.len() > MAX_METADATA_KEY_BYTES || v.len() > MAX_METADATA_VALUE_BYTES {
            return Err(GatewayError::invalid_input("metadata entry exceeds the size bound"));
        }
    }
    Ok(())
}

fn render_context_block(chunks: &[rag::RetrievalChunk]) -> String {
    let mut out = String::from("Use the following retrieved context if relevant:\n```\n");
    for (i, chunk) in chunks.iter().enumerate() {
        out.push_str(&format!("[{}] ({}): {}\n", i + 1, chunk.source, chunk.text));
    }
    out.push_str("```");
    out
}

fn append_citations(result: &mut GenerateResult, chunks: &[rag::RetrievalChunk]) {
    for chunk in chunks {
        result.citations.push(crate::providers::Citation::File {
            file_id: chunk.source.clone(),
            filename: chunk.source.clone(),
            snippet: chunk.text.clone(),
            provider: "retrieval".into(),
            span: None,
            broken: false,
            chunk_index: Some(chunk.chunk_index),
        });
    }
}

fn rag_chunk_to_citation_event(chunk: rag::RetrievalChunk) -> StreamEvent {
    StreamEvent::CitationUpdate(crate::providers::Citation::File {
        file_id: chunk.source.clone(),
        filename: chunk.source,
        snippet: chunk.text,
        provider: "retrieval".into(),
        span: None,
        broken: false,
        chunk_index: Some(chunk.chunk_index),
    })
}

fn sanitize_error(err: &GatewayError) -> String {
    let full = err.to_string();
    full.chars().take(300).collect()
}
