//! Anthropic adapter — messages API, unary and streamed.

use async_trait::async_trait;
use futures_core::stream::BoxStream;
use futures_util::StreamExt;
use serde_json::json;
use tokio::sync::mpsc;

use super::retry::{calculate_retry_delay, should_retry, MAX_ATTEMPTS};
use super::{ChatProvider, GenerateParams, GenerateResult, RequestContext, StreamEvent, Usage};
use crate::error::{GatewayError, Result};
use crate::stream::{drain_sse_lines, parse_sse_data};

const DEFAULT_BASE_URL: &str = "https://api.anthropic.com/v1";
const ANTHROPIC_VERSION: &str = "2023-06-01";

pub struct AnthropicProvider {
    client: reqwest::Client,
}

impl AnthropicProvider {
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

    fn body(&self, params: &GenerateParams, stream: bool) -> serde_json::Value {
        let messages: Vec<serde_json::Value> = params
            .history
            .iter()
            .map(|t| json!({"role": &t.role, "content": &t.content}))
            .chain(std::iter::once(json!({"role": "user", "content": &params.user_input})))
            .collect();

        let mut body = json!({
            "model": params.config.model,
            "max_tokens": params.config.max_output_tokens.unwrap_or(4096),
            "messages": messages,
        });
        if let Some(sys) = &params.instructions {
            body["system"] = json!(sys);
        }
        if let Some(t) = params.config.temperature {
            body["temperature"] = json!(t);
        }
        if stream {
            body["stream"] = json!(true);
        }
        body
    }
}

impl Default for AnthropicProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ChatProvider for AnthropicProvider {
    fn name(&self) -> &'static str {
        "anthropic"
    }

    async fn generate(&self, ctx: &RequestContext, params: &GenerateParams) -> Result<GenerateResult> {
        let url = format!("{}/messages", self.base_url(params));
        let body = self.body(params, false);

        let mut last_err = GatewayError::internal("no attempt made");
        for attempt in 1..=MAX_ATTEMPTS {
            let resp = self
                .client
                .post(&url)
                .header("x-api-key", &params.config.api_key)
                .header("anthropic-version", ANTHROPIC_VERSION)
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
                if should_retry(status) && attempt < MAX_ATTEMPTS {
                    last_err = GatewayError::UpstreamTransient(format!("anthropic http {status}"));
                    tokio::time::sleep(calculate_retry_delay(attempt)).await;
                    continue;
                }
                return Err(GatewayError::UpstreamPermanent(format!(
                    "anthropic rejected the request ({status})"
                )));
            }

            let value: serde_json::Value = resp
                .json()
                .await
                .map_err(|e| GatewayError::UpstreamTransient(format!("invalid anthropic response: {e}")))?;

            let text = value["content"][0]["text"].as_str().unwrap_or_default().to_string();
            let usage = Usage {
                input_tokens: value["usage"]["input_tokens"].as_u64().unwrap_or(0),
                output_tokens: value["usage"]["output_tokens"].as_u64().unwrap_or(0),
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
        let url = format!("{}/messages", self.base_url(params));
        let body = self.body(params, true);

        let resp = self
            .client
            .post(&url)
            .header("x-api-key", &params.config.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .timeout(ctx.deadline)
            .json(&body)
            .send()
            .await?;

        if resp.status().as_u16() != 200 {
            let status = resp.status().as_u16();
            return Err(GatewayError::UpstreamPermanent(format!(
                "anthropic stream init failed ({status})"
            )));
        }

        let (tx, rx) = mpsc::channel(32);
        let cancel = ctx.cancel.clone();

        tokio::spawn(async move {
            let mut byte_stream = resp.bytes_stream();
            let mut buf = String::new();
            let mut index: u64 = 0;
            let mut response_id: Option<String> = None;
            let mut usage = Usage::default();
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
                            let Ok(value) = serde_json::from_str::<serde_json::Value>(data) else { continue };
                            match value["type"].as_str().unwrap_or_default() {
                                "message_start" => {
                                    response_id = value["message"]["id"].as_str().map(|s| s.to_string());
                                    usage.input_tokens = value["message"]["usage"]["input_tokens"].as_u64().unwrap_or(0);
                                }
                                "content_block_delta" => {
                                    if let Some(text) = value["delta"]["text"].as_str() {
                                        if !text.is_empty() {
                                            let _ = tx.send(StreamEvent::TextDelta { text: text.to_string(), index }).await;
                                            index += 1;
                                        }
                                    }
                                }
                                "message_delta" => {
                                    if let Some(out) = value["usage"]["output_tokens"].as_u64() {
                                        usage.output_tokens = out;
                                    }
                                    let _ = tx.send(StreamEvent::UsageUpdate(usage.clone())).await;
                                }
                                "message_stop" => {
                                    let _ = tx.send(StreamEvent::Complete {
                                        response_id: response_id.clone(),
                                        model: String::new(),
                                        provider: "anthropic",
                                        usage: usage.clone(),
                                    }).await;
                                    terminal_sent = true;
                                    return;
                                }
                                "error" => {
                                    let message = value["error"]["message"].as_str().unwrap_or("anthropic stream error").to_string();
                                    let _ = tx.send(StreamEvent::Error { code: "upstream_transient", message, retryable: true }).await;
                                    terminal_sent = true;
                                    return;
                                }
                                _ => {}
                            }
                        }
                    }
                }
            }

            if !terminal_sent {
                let _ = tx.send(StreamEvent::Error {
                    code: "upstream_transient",
                    message: "anthropic stream ended without a terminal event".into(),
                    retryable: true,
                }).await;
            }
        });

        Ok(tokio_stream::wrappers::ReceiverStream::new(rx).boxed())
    }
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
                api_key: "sk-ant-test".into(),
                model: "claude-sonnet-4-20250514".into(),
                temperature: Some(0.5),
                top_p: None,
                max_output_tokens: Some(256),
                base_url: None,
                extra_options: HashMap::new(),
            },
        }
    }

    #[test]
    fn system_prompt_is_a_top_level_field_not_a_message() {
        let provider = AnthropicProvider::new();
        let body = provider.body(&params(), false);
        assert_eq!(body["system"], "be terse");
        assert!(body["messages"]
            .as_array()
            .unwrap()
            .iter()
            .all(|m| m["role"] != "system"));
    }

    #[test]
    fn default_base_url_used_when_not_overridden() {
        let provider = AnthropicProvider::new();
        assert_eq!(provider.base_url(&params()), DEFAULT_BASE_URL);
    }

    #[test]
    fn max_tokens_defaults_when_unset() {
        let provider = AnthropicProvider::new();
        let mut p = params();
        p.config.max_output_tokens = None;
        let body = provider.body(&p, false);
        assert_eq!(body["max_tokens"], 4096);
    }
}
