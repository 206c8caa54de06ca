//! Aggregator adapter (OpenRouter-style): wire-compatible with the
//! OpenAI-style request/response/stream shape, `Authorization: Bearer`.

use async_trait::async_trait;
use futures::stream;
use futures::StreamExt;
use serde_json::{json, Value};
use std::time::Instant;
use tracing::warn;

use crate::core::providers::{
    classify_http_error, extract_error_message, generate_completion_id, ChunkStream, Provider,
    StreamItem,
};
use crate::core::sse::SseDecoder;
use crate::core::types::{
    ChatRequest, ContentPart, Message, ModelFeatures, ModelInfo, Role, StandardChunk,
    StandardResponse, Usage,
};
use crate::utils::error::{GatewayError, Result};

#[derive(Debug, Clone)]
pub struct OpenRouterConfig {
    pub api_key: String,
    pub base_url: String,
    pub default_model: String,
}

impl OpenRouterConfig {
    pub fn from_env() -> Self {
        Self {
            api_key: std::env::var("OPENROUTER_API_KEY").unwrap_or_default(),
            base_url: std::env::var("OPENROUTER_BASE_URL")
                .unwrap_or_else(|_| "https://openrouter.ai/api/v1".to_string()),
            default_model: std::env::var("OPENROUTER_DEFAULT_MODEL")
                .unwrap_or_else(|_| "openrouter/auto".to_string()),
        }
    }
}

pub struct OpenRouterProvider {
    config: OpenRouterConfig,
    http1: reqwest::Client,
    http2: reqwest::Client,
}

impl OpenRouterProvider {
    pub fn new(config: OpenRouterConfig) -> Self {
        let http1 = reqwest::Client::builder()
            .http1_only()
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        let http2 = reqwest::Client::builder()
            .http2_prior_knowledge()
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            config,
            http1,
            http2,
        }
    }

    fn message_to_json(message: &Message) -> Value {
        let role = match message.role {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        };
        match &message.content {
            crate::core::types::Content::Text(text) => json!({"role": role, "content": text}),
            crate::core::types::Content::Parts(parts) => {
                let parts_json: Vec<Value> = parts
                    .iter()
                    .map(|p| match p {
                        ContentPart::Text { text } => json!({"type": "text", "text": text}),
                        ContentPart::ImageUrl { image_url } => {
                            json!({"type": "image_url", "image_url": {"url": image_url.url}})
                        }
                    })
                    .collect();
                json!({"role": role, "content": parts_json})
            }
        }
    }

    fn build_body(&self, model: &str, request: &ChatRequest, stream: bool) -> Value {
        let messages: Vec<Value> = request.messages.iter().map(Self::message_to_json).collect();
        let mut body = json!({
            "model": model,
            "messages": messages,
            "temperature": request.temperature,
            "max_tokens": request.max_tokens,
        });
        if stream {
            body.as_object_mut().unwrap().insert("stream".into(), json!(true));
        }
        body
    }

    fn parse_response(&self, model: &str, latency: u64, body: Value) -> Result<StandardResponse> {
        let choice = body.get("choices").and_then(|c| c.get(0)).cloned().unwrap_or(Value::Null);
        let content = choice
            .get("message")
            .and_then(|m| m.get("content"))
            .and_then(|c| c.as_str())
            .map(|s| s.to_string());
        let finish_reason = choice
            .get("finish_reason")
            .and_then(|f| f.as_str())
            .map(|s| s.to_string());
        let usage = body
            .get("usage")
            .map(|u| Usage {
                prompt_tokens: u.get("prompt_tokens").and_then(|v| v.as_u64()).unwrap_or(0) as u32,
                completion_tokens: u
                    .get("completion_tokens")
                    .and_then(|v| v.as_u64())
                    .unwrap_or(0) as u32,
                total_tokens: u.get("total_tokens").and_then(|v| v.as_u64()).unwrap_or(0) as u32,
            })
            .unwrap_or_default();
        let id = body
            .get("id")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
            .unwrap_or_else(generate_completion_id);

        Ok(StandardResponse {
            id,
            model: model.to_string(),
            provider: self.name().to_string(),
            created_at: chrono::Utc::now().to_rfc3339(),
            content,
            tool_calls: None,
            usage,
            latency: Some(latency),
            finish_reason,
            raw: Some(body),
            cached: None,
            error: None,
        })
    }
}

fn standard_models() -> Vec<ModelInfo> {
    vec![ModelInfo {
        id: "openrouter/auto".into(),
        name: "OpenRouter Auto".into(),
        provider: "openrouter".into(),
        token_limit: 128_000,
        features: ModelFeatures {
            streaming: true,
            vision: false,
            tools: true,
            json: true,
            system: true,
            function_calling: true,
        },
        description: Some("Automatic model selection across OpenRouter's catalog".into()),
    }]
}

#[async_trait]
impl Provider for OpenRouterProvider {
    fn name(&self) -> &'static str {
        "openrouter"
    }

    fn default_model(&self) -> &str {
        &self.config.default_model
    }

    fn is_configured(&self) -> bool {
        !self.config.api_key.is_empty()
    }

    fn known_models(&self) -> Vec<ModelInfo> {
        standard_models()
    }

    async fn chat_completion(&self, model: &str, request: &ChatRequest) -> Result<StandardResponse> {
        let body = self.build_body(model, request, false);
        let start = Instant::now();
        let response = self
            .http1
            .post(format!("{}/chat/completions", self.config.base_url))
            .bearer_auth(&self.config.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| GatewayError::Provider(e.to_string()))?;

        let status = response.status().as_u16();
        let text = response
            .text()
            .await
            .map_err(|e| GatewayError::Provider(e.to_string()))?;
        let latency = start.elapsed().as_millis() as u64;

        if !(200..300).contains(&status) {
            let message = extract_error_message(&text);
            return Err(classify_http_error(status, &message));
        }

        let json_body: Value =
            serde_json::from_str(&text).map_err(|e| GatewayError::Provider(e.to_string()))?;
        self.parse_response(model, latency, json_body)
    }

    async fn chat_completion_stream(&self, model: &str, request: &ChatRequest) -> Result<ChunkStream> {
        let body = self.build_body(model, request, true);
        let response = self
            .http2
            .post(format!("{}/chat/completions", self.config.base_url))
            .bearer_auth(&self.config.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| GatewayError::Provider(e.to_string()))?;

        let status = response.status().as_u16();
        if !(200..300).contains(&status) {
            let text = response.text().await.unwrap_or_default();
            let message = extract_error_message(&text);
            return Err(classify_http_error(status, &message));
        }

        let completion_id = generate_completion_id();
        let provider_name = self.name().to_string();
        let model_name = model.to_string();
        let byte_stream = response.bytes_stream();

        let item_stream = stream::unfold(
            (byte_stream, SseDecoder::new()),
            move |(mut byte_stream, mut decoder)| {
                let completion_id = completion_id.clone();
                let provider_name = provider_name.clone();
                let model_name = model_name.clone();
                async move {
                    loop {
                        let chunk = match byte_stream.next().await {
                            Some(Ok(bytes)) => bytes,
                            Some(Err(err)) => {
                                return Some((
                                    StreamItem::Error(err.to_string()),
                                    (byte_stream, decoder),
                                ));
                            }
                            None => return None,
                        };
                        let frames = decoder.push(&chunk);
                        for frame in frames {
                            if frame.data == crate::core::sse::DONE {
                                return None;
                            }
                            if frame.event.as_deref() == Some("error") {
                                return Some((
                                    StreamItem::Error(frame.data.clone()),
                                    (byte_stream, decoder),
                                ));
                            }
                            let Ok(value) = serde_json::from_str::<Value>(&frame.data) else {
                                warn!(provider = "openrouter", "skipping unparseable SSE chunk");
                                continue;
                            };
                            let choice = value.get("choices").and_then(|c| c.get(0));
                            let content = choice
                                .and_then(|c| c.get("delta"))
                                .and_then(|d| d.get("content"))
                                .and_then(|c| c.as_str())
                                .map(|s| s.to_string());
                            let finish_reason = choice
                                .and_then(|c| c.get("finish_reason"))
                                .and_then(|f| f.as_str())
                                .map(|s| s.to_string());
                            let usage = value
                                .get("usage")
                                .map(|u| Usage {
                                    prompt_tokens: u
                                        .get("prompt_tokens")
                                        .and_then(|v| v.as_u64())
                                        .unwrap_or(0) as u32,
                                    completion_tokens: u
                                        .get("completion_tokens")
                                        .and_then(|v| v.as_u64())
                                        .unwrap_or(0) as u32,
                                    total_tokens: u
                                        .get("total_tokens")
                                        .and_then(|v| v.as_u64())
                                        .unwrap_or(0) as u32,
                                })
                                .unwrap_or_default();
                            let item = StandardChunk {
                                id: completion_id.clone(),
                                model: model_name.clone(),
                                provider: provider_name.clone(),
                                created_at: chrono::Utc::now().to_rfc3339(),
                                content,
                                tool_calls: None,
                                usage,
                                latency: None,
                                finish_reason,
                                raw: Some(value),
                            };
                            return Some((StreamItem::Chunk(item), (byte_stream, decoder)));
                        }
                    }
                }
            },
        );

        Ok(Box::pin(item_stream))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::Content;

    #[test]
    fn passes_messages_through_like_openai() {
        let provider = OpenRouterProvider::new(OpenRouterConfig {
            api_key: "k".into(),
            base_url: "https://openrouter.ai/api/v1".into(),
            default_model: "openrouter/auto".into(),
        });
        let request = ChatRequest {
            model: "openrouter/auto".into(),
            messages: vec![Message {
                role: Role::User,
                content: Content::Text("hi".into()),
            }],
            temperature: 0.7,
            max_tokens: 100,
            top_p: None,
            frequency_penalty: None,
            presence_penalty: None,
            stop: None,
            response_format: None,
            request_id: None,
            nocache: None,
        };
        let body = provider.build_body("openrouter/auto", &request, false);
        assert_eq!(body["messages"][0]["content"], json!("hi"));
        assert!(body.get("stream").is_none());
    }
}
