//! OpenAI adapter — chat completions, unary and streamed.

use async_trait::async_trait;
use futures_core::stream::BoxStream;
use futures_util::StreamExt;
use serde_json::json;
use tokio::sync::mpsc;

use super::retry::{calculate_retry_delay, should_retry, MAX_ATTEMPTS};
use super::{ChatProvider, GenerateParams, GenerateResult, RequestContext, StreamEvent, Usage};
use crate::error::{GatewayError, Result};
use crate::stream::{drain_sse_lines, is_sse_done, parse_sse_data};

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

pub struct OpenAIProvider {
    client: reqwest::Client,
}

impl OpenAIProvider {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }

    fn base_url(&self, params: &GenerateParams) -> String {
        params
            .config
            .base_url
            .clone()
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_string())
    }

    fn build_messages(&self, params: &GenerateParams) -> Vec<serde_json::Value> {
        let mut messages = Vec::new();
        if let Some(sys) = &params.instructions {
            messages.push(json!({"role": "system", "content": sys}));
        }
        for turn in &params.history {
            messages.push(json!({"role": &turn.role, "content": &turn.content}));
        }
        messages.push(json!({"role": "user", "content": &params.user_input}));
        messages
    }

    fn body(&self, params: &GenerateParams, stream: bool) -> serde_json::Value {
        let mut body = json!({
            "model": params.config.model,
            "messages": self.build_messages(params),
            "temperature": params.config.temperature.unwrap_or(0.7),
        });
        if let Some(max) = params.config.max_output_tokens {
            body["max_tokens"] = json!(max);
        }
        if stream {
            body["stream"] = json!(true);
            body["stream_options"] = json!({"include_usage": true});
        }
        body
    }
}

impl Default for OpenAIProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ChatProvider for OpenAIProvider {
    fn name(&self) -> &'static str {
        "openai"
    }

    fn supports_file_search(&self) -> bool {
        true
    }

    async fn generate(&self, ctx: &RequestContext, params: &GenerateParams) -> Result<GenerateResult> {
        let url = format!("{}/chat/completions", self.base_url(params));
        let body = self.body(params, false);

        let mut last_err = GatewayError::internal("no attempt made");
        for attempt in 1..=MAX_ATTEMPTS {
            let resp = self
                .client
                .post(&url)
                .bearer_auth(&params.config.api_key)
                .timeout(ctx.deadline)
                .json(&body)
                .send()
                .await;

            let resp = match resp {
                Ok(r) => r,
                Err(e) => {
                    last_err = e.into();
                    if attempt < MAX_ATTEMPTS {
                        tokio::time::sleep(calculate_retry_delay(attempt)).await;
                        continue;
                    }
                    return Err(last_err);
                }
            };

            let status = resp.status().as_u16();
            if status != 200 {
                let text = resp.text().await.unwrap_or_default();
                if should_retry(status) && attempt < MAX_ATTEMPTS {
                    last_err = GatewayError::UpstreamTransient(format!("openai http {status}"));
                    tracing::warn!(status, body = %truncate(&text), "openai retryable error");
                    tokio::time::sleep(calculate_retry_delay(attempt)).await;
                    continue;
                }
                return Err(GatewayError::UpstreamPermanent(format!(
                    "openai rejected the request ({status})"
                )));
            }

            let value: serde_json::Value = resp
                .json()
                .await
                .map_err(|e| GatewayError::UpstreamTransient(format!("invalid openai response: {e}")))?;

            let text = value["choices"][0]["message"]["content"]
                .as_str()
                .unwrap_or_default()
                .to_string();
            let usage = Usage {
                input_tokens: value["usage"]["prompt_tokens"].as_u64().unwrap_or(0),
                output_tokens: value["usage"]["completion_tokens"].as_u64().unwrap_or(0),
            };

            return Ok(GenerateResult {
                text,
                response_id: value["id"].as_str().map(|s| s.to_string()),
                model: params.config.model.clone(),
                usage,
                citations: vec![],
            });
        }

        Err(last_err)
    }

    async fn generate_stream(
        &self,
        ctx: &RequestContext,
        params: &GenerateParams,
    ) -> Result<BoxStream<'static, StreamEvent>> {
        let url = format!("{}/chat/completions", self.base_url(params));
        let body = self.body(params, true);

        let resp = self
            .client
            .post(&url)
            .bearer_auth(&params.config.api_key)
            .timeout(ctx.deadline)
            .json(&body)
            .send()
            .await?;

        if resp.status().as_u16() != 200 {
            let status = resp.status().as_u16();
            return Err(GatewayError::UpstreamPermanent(format!(
                "openai stream init failed ({status})"
            )));
        }

        let (tx, rx) = mpsc::channel(32);
        let cancel = ctx.cancel.clone();

        tokio::spawn(async move {
            let mut byte_stream = resp.bytes_stream();
            let mut buf = String::new();
            let mut index: u64 = 0;
            let mut terminal_sent = false;

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    chunk = byte_stream.next() => {
                        let Some(chunk) = chunk else { break };
                        let Ok(bytes) = chunk else { break };
                        buf.push_str(&String::from_utf8_lossy(&bytes));

                        for line in drain_sse_lines(&mut buf) {
                            let Some(data) = parse_sse_data(&line) else { continue };
                            if is_sse_done(data) {
                                if !terminal_sent {
                                    let _ = tx.send(StreamEvent::Complete {
                                        response_id: None,
                                        model: String::new(),
                                        provider: "openai",
                                        usage: Usage::default(),
                                    }).await;
                                    terminal_sent = true;
                                }
                                return;
                            }
                            let Ok(value) = serde_json::from_str::<serde_json::Value>(data) else { continue };
                            if let Some(usage) = value.get("usage").filter(|u| !u.is_null()) {
                                let _ = tx.send(StreamEvent::UsageUpdate(Usage {
                                    input_tokens: usage["prompt_tokens"].as_u64().unwrap_or(0),
                                    output_tokens: usage["completion_tokens"].as_u64().unwrap_or(0),
                                })).await;
                            }
                            if let Some(delta) = value["choices"][0]["delta"]["content"].as_str() {
                                if !delta.is_empty() {
                                    let _ = tx.send(StreamEvent::TextDelta { text: delta.to_string(), index }).await;
                                    index += 1;
                                }
                            }
                        }
                    }
                }
            }

            if !terminal_sent {
                let _ = tx.send(StreamEvent::Error {
                    code: "upstream_transient",
                    message: "openai stream ended without a terminal event".into(),
                    retryable: true,
                }).await;
            }
        });

        Ok(tokio_stream::wrappers::ReceiverStream::new(rx).boxed())
    }
}

fn truncate(s: &str) -> &str {
    &s[..s.len().min(500)]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config_merge::EffectiveProviderConfig;
    use std::collections::HashMap;

    fn params() -> GenerateParams {
        GenerateParams {
            instructions: Some("be terse".into()),
            user_input: "hi".into(),
            history: vec![],
            previous_response_id: None,
            config: EffectiveProviderConfig {
                api_key: "sk-test".into(),
                model: "gpt-4o-mini".into(),
                temperature: Some(0.5),
                top_p: None,
                max_output_tokens: Some(256),
                base_url: None,
                extra_options: HashMap::new(),
            },
        }
    }

    #[test]
    fn builds_system_then_history_then_user() {
        let provider = OpenAIProvider::new();
        let messages = provider.build_messages(&params());
        assert_eq!(messages[0]["role"], "system");
        assert_eq!(messages.last().unwrap()["role"], "user");
        assert_eq!(messages.last().unwrap()["content"], "hi");
    }

    #[test]
    fn default_base_url_used_when_not_overridden() {
        let provider = OpenAIProvider::new();
        assert_eq!(provider.base_url(&params()), DEFAULT_BASE_URL);
    }

    #[test]
    fn stream_body_requests_usage() {
        let provider = OpenAIProvider::new();
        let body = provider.body(&params(), true);
        assert_eq!(body["stream_options"]["include_usage"], true);
    }
}
