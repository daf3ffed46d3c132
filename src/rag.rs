//! RAG Retrieval Client (C6) — a thin, sanitized client over an external,
//! black-box vector-store service. A retrieval failure never fails the
//! overall request: callers log it and proceed with no injected context.

use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;

use crate::error::{GatewayError, Result};

const MAX_IDENTIFIER_LEN: usize = 128;

#[derive(Debug, Clone)]
pub struct RetrievalChunk {
    pub text: String,
    pub source: String,
    pub score: f32,
    pub chunk_index: u32,
}

#[derive(Debug, Clone)]
pub struct RetrievalRequest {
    pub tenant_id: String,
    pub store_id: String,
    pub query: String,
    pub top_k: u32,
    pub deadline: Duration,
}

#[async_trait]
pub trait RetrievalClient: Send + Sync {
    async fn retrieve(&self, req: &RetrievalRequest) -> Result<Vec<RetrievalChunk>>;
}

/// Alphanumeric + `_`/`-` only, within a length bound. Applied to every
/// identifier that ends up in a retrieval wire path.
pub fn sanitize_identifier(id: &str) -> Result<String> {
    if id.is_empty() || id.len() > MAX_IDENTIFIER_LEN {
        return Err(GatewayError::invalid_input("identifier length out of bounds"));
    }
    if !id.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-') {
        return Err(GatewayError::invalid_input(
            "identifier may only contain alphanumerics, '_', and '-'",
        ));
    }
    Ok(id.to_string())
}

#[derive(Debug, Deserialize)]
struct ChunkResponse {
    chunks: Vec<WireChunk>,
}

#[derive(Debug, Deserialize)]
struct WireChunk {
    text: String,
    source: String,
    #[serde(default)]
    score: f32,
    #[serde(default, rename = "chunkIndex")]
    chunk_index: u32,
}

/// HTTP-backed retrieval client over the external vector-store service.
pub struct HttpRetrievalClient {
    client: reqwest::Client,
    base_url: String,
}

impl HttpRetrievalClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
        }
    }
}

#[async_trait]
impl RetrievalClient for HttpRetrievalClient {
    async fn retrieve(&self, req: &RetrievalRequest) -> Result<Vec<RetrievalChunk>> {
        let tenant_id = sanitize_identifier(&req.tenant_id)?;
        let store_id = sanitize_identifier(&req.store_id)?;

        let url = format!("{}/stores/{}/query", self.base_url, store_id);
        let resp = self
            .client
            .post(&url)
            .timeout(req.deadline)
            .json(&serde_json::json!({
                "tenantId": tenant_id,
                "query": req.query,
                "topK": req.top_k,
            }))
            .send()
            .await?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            return Err(GatewayError::UpstreamTransient(format!(
                "retrieval store returned {status}"
            )));
        }

        let parsed: ChunkResponse = resp.json().await?;
        Ok(parsed
            .chunks
            .into_iter()
            .map(|c| RetrievalChunk {
                text: c.text,
                source: c.source,
                score: c.score,
                chunk_index: c.chunk_index,
            })
            .collect())
    }
}

/// Best-effort wrapper: logs and swallows any retrieval failure so the
/// dispatcher can always proceed, per §4.6.
pub async fn retrieve_or_empty(
    client: &dyn RetrievalClient,
    req: &RetrievalRequest,
) -> Vec<RetrievalChunk> {
    match client.retrieve(req).await {
        Ok(chunks) => chunks,
        Err(e) => {
            tracing::warn!(
                tenant_id = %req.tenant_id,
                store_id = %req.store_id,
                error = %e,
                "retrieval failed, proceeding without context"
            );
            Vec::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_empty_identifier() {
        assert!(sanitize_identifier("").is_err());
    }

    #[test]
    fn rejects_identifier_with_path_separators() {
        assert!(sanitize_identifier("../etc/passwd").is_err());
        assert!(sanitize_identifier("store/1").is_err());
    }

    #[test]
    fn rejects_overlong_identifier() {
        let long = "a".repeat(MAX_IDENTIFIER_LEN + 1);
        assert!(sanitize_identifier(&long).is_err());
    }

    #[test]
    fn accepts_alphanumeric_with_dash_and_underscore() {
        assert_eq!(sanitize_identifier("store-1_abc").unwrap(), "store-1_abc");
    }

    struct FailingClient;

    #[async_trait]
    impl RetrievalClient for FailingClient {
        async fn retrieve(&self, _req: &RetrievalRequest) -> Result<Vec<RetrievalChunk>> {
            Err(GatewayError::UpstreamTransient("store down".into()))
        }
    }

    #[tokio::test]
    async fn retrieve_or_empty_swallows_failures() {
        let req = RetrievalRequest {
            tenant_id: "t1".into(),
            store_id: "s1".into(),
            query: "q".into(),
            top_k: 3,
            deadline: Duration::from_secs(5),
        };
        let chunks = retrieve_or_empty(&FailingClient, &req).await;
        assert!(chunks.is_empty());
    }
}
