//! Provider Adapters (C4) — unified interface over OpenAI, Anthropic, and
//! Gemini, generalizing the key-pool daemon's `LLMAdapter` trait to this
//! gateway's request/response/stream shapes.

pub mod anthropic;
pub mod gemini;
pub mod openai;
pub mod retry;

use async_trait::async_trait;
use futures_core::stream::BoxStream;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::config_merge::EffectiveProviderConfig;
use crate::error::Result;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatTurn {
    pub role: String, // "system" | "user" | "assistant"
    pub content: String,
}

/// Request-scoped context threaded through every downstream call: a
/// deadline and a cancellation token, per the concurrency model.
#[derive(Clone)]
pub struct RequestContext {
    pub request_id: String,
    pub deadline: Duration,
    pub cancel: tokio_util::sync::CancellationToken,
}

impl RequestContext {
    pub fn new(request_id: String, deadline: Duration) -> Self {
        Self {
            request_id,
            deadline,
            cancel: tokio_util::sync::CancellationToken::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct GenerateParams {
    pub instructions: Option<String>,
    pub user_input: String,
    pub history: Vec<ChatTurn>,
    pub previous_response_id: Option<String>,
    pub config: EffectiveProviderConfig,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

impl Usage {
    pub fn total_tokens(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }
}

#[derive(Debug, Clone)]
pub enum Citation {
    Url {
        uri: String,
        title: Option<String>,
        provider: String,
        span: Option<(u32, u32)>,
        broken: bool,
    },
    File {
        file_id: String,
        filename: String,
        snippet: String,
        provider: String,
        span: Option<(u32, u32)>,
        broken: bool,
        chunk_index: Option<u32>,
    },
}

#[derive(Debug, Clone)]
pub struct GenerateResult {
    pub text: String,
    pub response_id: Option<String>,
    pub model: String,
    pub usage: Usage,
    pub citations: Vec<Citation>,
}

/// A single normalized wire event (C8's output shape).
#[derive(Debug, Clone)]
pub enum StreamEvent {
    TextDelta { text: String, index: u64 },
    UsageUpdate(Usage),
    CitationUpdate(Citation),
    Complete {
        response_id: Option<String>,
        model: String,
        provider: &'static str,
        usage: Usage,
    },
    Error {
        code: &'static str,
        message: String,
        retryable: bool,
    },
}

#[async_trait]
pub trait ChatProvider: Send + Sync {
    fn name(&self) -> &'static str;

    async fn generate(&self, ctx: &RequestContext, params: &GenerateParams) -> Result<GenerateResult>;

    async fn generate_stream(
        &self,
        ctx: &RequestContext,
        params: &GenerateParams,
    ) -> Result<BoxStream<'static, StreamEvent>>;

    fn supports_file_search(&self) -> bool {
        false
    }
    fn supports_web_search(&self) -> bool {
        false
    }
    fn supports_continuity(&self) -> bool {
        false
    }
    fn supports_streaming(&self) -> bool {
        true
    }
}

/// Hard-coded sibling pairing used as the last resort of the failover
/// order (§4.7 step 8), when neither an explicit override nor the
/// tenant's failover list names a fallback.
pub fn hardcoded_sibling(provider: &str) -> Option<&'static str> {
    match provider {
        "openai" => Some("gemini"),
        "gemini" => Some("openai"),
        "anthropic" => Some("openai"),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn usage_total_sums_input_and_output() {
        let usage = Usage {
            input_tokens: 10,
            output_tokens: 5,
        };
        assert_eq!(usage.total_tokens(), 15);
    }

    #[test]
    fn hardcoded_sibling_pairs_openai_and_gemini() {
        assert_eq!(hardcoded_sibling("openai"), Some("gemini"));
        assert_eq!(hardcoded_sibling("gemini"), Some("openai"));
        assert_eq!(hardcoded_sibling("anthropic"), Some("openai"));
        assert_eq!(hardcoded_sibling("unknown"), None);
    }
}
