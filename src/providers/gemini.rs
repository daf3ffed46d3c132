//! Gemini adapter — generateContent / streamGenerateContent over the
//! generativelanguage REST API.

use async_trait::async_trait;
use futures_core::stream::BoxStream;
use futures_util::StreamExt;
use serde_json::json;
use tokio::sync::mpsc;

use super::retry::{calculate_retry_delay, should_retry, MAX_ATTEMPTS};
use super::{ChatProvider, GenerateParams, GenerateResult, RequestContext, StreamEvent, Usage};
use crate::error::{GatewayError, Result};
use crate::stream::{drain_sse_lines, parse_sse_data};

const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";

pub struct GeminiProvider {
    client: reqwest::Client,
}

impl GeminiProvider {
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

    fn body(&self, params: &GenerateParams) -> serde_json::Value {
        let contents: Vec<serde_json::Value> = params
            .history
            .iter()
            .map(|t| {
                let role = if t.role == "assistant" { "model" } else { "user" };
                json!({"role": role, "parts": [{"text": &t.content}]})
            })
            .chain(std::iter::once(
                json!({"role": "user", "parts": [{"text": &params.user_input}]}),
            ))
            .collect();

        let mut body = json!({ "contents": contents });
        if let Some(sys) = &params.instructions {
            body["systemInstruction"] = json!({"parts": [{"text": sys}]});
        }

        let mut gen_config = json!({});
        if let Some(t) = params.config.temperature {
            gen_config["temperature"] = json!(t);
        }
        if let Some(top_p) = params.config.top_p {
            gen_config["topP"] = json!(top_p);
        }
        if let Some(max) = params.config.max_output_tokens {
            gen_config["maxOutputTokens"] = json!(max);
        }
        body["generationConfig"] = gen_config;
        body
    }
}

impl Default for GeminiProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ChatProvider for GeminiProvider {
    fn name(&self) -> &'static str {
        "gemini"
    }

    fn supports_web_search(&self) -> bool {
        true
    }

    async fn generate(&self, ctx: &RequestContext, params: &GenerateParams) -> Result<GenerateResult> {
        let url = format!(
            "{}/models/{}:generateContent?key={}",
            self.base_url(params),
            params.config.model,
            params.config.api_key
        );
        let body = self.body(params);

        let mut last_err = GatewayError::internal("no attempt made");
        for attempt in 1..=MAX_ATTEMPTS {
            let resp = self.client.post(&url).timeout(ctx.deadline).json(&body).send().await;

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
                    last_err = GatewayError::UpstreamTransient(format!("gemini http {status}"));
                    tokio::time::sleep(calculate_retry_delay(attempt)).await;
                    continue;
                }
                return Err(GatewayError::UpstreamPermanent(format!(
                    "gemini rejected the request ({status})"
                )));
            }

            let value: serde_json::Value = resp
                .json()
                .await
                .map_err(|e| GatewayError::UpstreamTransient(format!("invalid gemini response: {e}")))?;

            let text = value["candidates"][0]["content"]["parts"][0]["text"]
                .as_str()
                .unwrap_or_default()
                .to_string();
            let usage_node = &value["usageMetadata"];
            let usage = Usage {
                input_tokens: usage_node["promptTokenCount"].as_u64().unwrap_or(0),
                output_tokens: usage_node["candidatesTokenCount"].as_u64().unwrap_or(0),
            };

            return Ok(GenerateResult {
                text,
                response_id: None,
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
        let url = format!(
            "{}/models/{}:streamGenerateContent?alt=sse&key={}",
            self.base_url(params),
            params.config.model,
            params.config.api_key
        );
        let body = self.body(params);

        let resp = self.client.post(&url).timeout(ctx.deadline).json(&body).send().await?;

        if resp.status().as_u16() != 200 {
            let status = resp.status().as_u16();
            return Err(GatewayError::UpstreamPermanent(format!(
                "gemini stream init failed ({status})"
            )));
        }

        let (tx, rx) = mpsc::channel(32);
        let cancel = ctx.cancel.clone();

        tokio::spawn(async move {
            let mut byte_stream = resp.bytes_stream();
            let mut buf = String::new();
            let mut index: u64 = 0;
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

                            if let Some(text) = value["candidates"][0]["content"]["parts"][0]["text"].as_str() {
                                if !text.is_empty() {
                                    let _ = tx.send(StreamEvent::TextDelta { text: text.to_string(), index }).await;
                                    index += 1;
                                }
                            }
                            let usage_node = &value["usageMetadata"];
                            if !usage_node.is_null() {
                                usage.input_tokens = usage_node["promptTokenCount"].as_u64().unwrap_or(usage.input_tokens);
                                usage.output_tokens = usage_node["candidatesTokenCount"].as_u64().unwrap_or(usage.output_tokens);
                                let _ = tx.send(StreamEvent::UsageUpdate(usage.clone())).await;
                            }
                            if value["candidates"][0]["finishReason"].as_str().is_some() {
                                let _ = tx.send(StreamEvent::Complete {
                                    response_id: None,
                                    model: String::new(),
                                    provider: "gemini",
                                    usage: usage.clone(),
                                }).await;
                                terminal_sent = true;
                                return;
                            }
                        }
                    }
                }
            }

            if !terminal_sent {
                let _ = tx.send(StreamEvent::Error {
                    code: "upstream_transient",
                    message: "gemini stream ended without a terminal event".into(),
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
                api_key: "gm-test".into(),
                model: "gemini-2.5-flash".into(),
                temperature: Some(0.5),
                top_p: Some(0.9),
                max_output_tokens: Some(256),
                base_url: None,
                extra_options: HashMap::new(),
            },
        }
    }

    #[test]
    fn assistant_role_is_mapped_to_model() {
        use super::super::ChatTurn;
        let provider = GeminiProvider::new();
        let mut p = params();
        p.history.push(ChatTurn {
            role: "assistant".into(),
            content: "prior reply".into(),
        });
        let body = provider.body(&p);
        assert_eq!(body["contents"][0]["role"], "model");
    }

    #[test]
    fn system_instruction_is_a_separate_field() {
        let provider = GeminiProvider::new();
        let body = provider.body(&params());
        assert_eq!(body["systemInstruction"]["parts"][0]["text"], "be terse");
    }

    #[test]
    fn default_base_url_used_when_not_overridden() {
        let provider = GeminiProvider::new();
        assert_eq!(provider.base_url(&params()), DEFAULT_BASE_URL);
    }
}
