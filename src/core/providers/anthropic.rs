//! Anthropic-style adapter: `X-API-Key` + `anthropic-version`, system
//! prompt lifted to a top-level field, user/assistant alternation enforced,
//! base64 data-URL images converted to `{type:image,source:{...}}` (plain
//! URLs are dropped with a warning since the upstream has no URL-fetch form).

use async_trait::async_trait;
use futures::stream;
use futures::StreamExt;
use serde_json::{json, Value};
use std::time::Instant;
use tracing::warn;

use crate::core::providers::{
    classify_http_error, extract_error_message, generate_completion_id, lift_system_prompt,
    normalize_alternation, ChunkStream, Provider, StreamItem,
};
use crate::core::sse::SseDecoder;
use crate::core::types::{
    ChatRequest, Content, ContentPart, Message, ModelFeatures, ModelInfo, Role, StandardChunk,
    StandardResponse, Usage,
};
use crate::utils::error::{GatewayError, Result};

const ANTHROPIC_VERSION: &str = "2023-06-01";

#[derive(Debug, Clone)]
pub struct AnthropicConfig {
    pub api_key: String,
    pub base_url: String,
    pub default_model: String,
}

impl AnthropicConfig {
    pub fn from_env() -> Self {
        Self {
            api_key: std::env::var("ANTHROPIC_API_KEY").unwrap_or_default(),
            base_url: std::env::var("ANTHROPIC_BASE_URL")
                .unwrap_or_else(|_| "https://api.anthropic.com/v1".to_string()),
            default_model: std::env::var("ANTHROPIC_DEFAULT_MODEL")
                .unwrap_or_else(|_| "claude-3-5-sonnet-20241022".to_string()),
        }
    }
}

pub struct AnthropicProvider {
    config: AnthropicConfig,
    http1: reqwest::Client,
    http2: reqwest::Client,
}

impl AnthropicProvider {
    pub fn new(config: AnthropicConfig) -> Self {
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

    /// Converts a base64 data-URL image part to Anthropic's `{type:image,
    /// source:{type:base64,media_type,data}}` shape; non-base64 URLs have
    /// no equivalent and are dropped with a warning.
    fn image_part_to_json(image_url: &str) -> Option<Value> {
        if let Some(rest) = image_url.strip_prefix("data:") {
            if let Some((media_type, data)) = rest.split_once(";base64,") {
                return Some(json!({
                    "type": "image",
                    "source": {
                        "type": "base64",
                        "media_type": media_type,
                        "data": data,
                    }
                }));
            }
        }
        warn!(provider = "anthropic", url = %image_url, "dropping non-base64 image url; anthropic requires base64 source");
        None
    }

    fn message_to_json(message: &Message) -> Value {
        let role = match message.role {
            Role::Assistant => "assistant",
            _ => "user",
        };
        match &message.content {
            Content::Text(text) => json!({"role": role, "content": text}),
            Content::Parts(parts) => {
                let parts_json: Vec<Value> = parts
                    .iter()
                    .filter_map(|p| match p {
                        ContentPart::Text { text } => Some(json!({"type": "text", "text": text})),
                        ContentPart::ImageUrl { image_url } => {
                            Self::image_part_to_json(&image_url.url)
                        }
                    })
                    .collect();
                json!({"role": role, "content": parts_json})
            }
        }
    }

    fn build_body(&self, model: &str, request: &ChatRequest, stream: bool) -> Value {
        let (system, rest) = lift_system_prompt(&request.messages);
        let normalized = normalize_alternation(rest, Role::User);
        let messages: Vec<Value> = normalized.iter().map(Self::message_to_json).collect();

        let mut body = json!({
            "model": model,
            "messages": messages,
            "max_tokens": request.max_tokens,
            "temperature": request.temperature,
        });
        let obj = body.as_object_mut().unwrap();
        if let Some(system) = system {
            obj.insert("system".into(), json!(system));
        }
        if let Some(top_p) = request.top_p {
            obj.insert("top_p".into(), json!(top_p));
        }
        if let Some(stop) = &request.stop {
            let sequences = match stop {
                crate::core::types::StopSequence::One(s) => vec![s.clone()],
                crate::core::types::StopSequence::Many(v) => v.clone(),
            };
            obj.insert("stop_sequences".into(), json!(sequences));
        }
        if stream {
            obj.insert("stream".into(), json!(true));
        }
        body
    }

    fn parse_response(&self, model: &str, latency: u64, body: Value) -> Result<StandardResponse> {
        let content = body
            .get("content")
            .and_then(|c| c.as_array())
            .and_then(|parts| parts.iter().find(|p| p.get("type").and_then(|t| t.as_str()) == Some("text")))
            .and_then(|p| p.get("text"))
            .and_then(|t| t.as_str())
            .map(|s| s.to_string());
        let finish_reason = body
            .get("stop_reason")
            .and_then(|f| f.as_str())
            .map(|s| s.to_string());
        let usage = body
            .get("usage")
            .map(|u| {
                let input = u.get("input_tokens").and_then(|v| v.as_u64()).unwrap_or(0) as u32;
                let output = u.get("output_tokens").and_then(|v| v.as_u64()).unwrap_or(0) as u32;
                Usage {
                    prompt_tokens: input,
                    completion_tokens: output,
                    total_tokens: input + output,
                }
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
        id: "claude-3-5-sonnet-20241022".into(),
        name: "Claude 3.5 Sonnet".into(),
        provider: "anthropic".into(),
        token_limit: 200_000,
        features: ModelFeatures {
            streaming: true,
            vision: true,
            tools: true,
            json: false,
            system: true,
            function_calling: true,
        },
        description: Some("Anthropic's mid-tier model".into()),
    }]
}

#[async_trait]
impl Provider for AnthropicProvider {
    fn name(&self) -> &'static str {
        "anthropic"
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
            .post(format!("{}/messages", self.config.base_url))
            .header("X-API-Key", &self.config.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
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
            .post(format!("{}/messages", self.config.base_url))
            .header("X-API-Key", &self.config.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
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
            (byte_stream, SseDecoder::new(), Usage::default()),
            move |(mut byte_stream, mut decoder, mut usage)| {
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
                                    (byte_stream, decoder, usage),
                                ));
                            }
                            None => return None,
                        };
                        let frames = decoder.push(&chunk);
                        for frame in frames {
                            let event = frame.event.as_deref().unwrap_or("message");
                            if event == "error" {
                                return Some((
                                    StreamItem::Error(frame.data.clone()),
                                    (byte_stream, decoder, usage),
                                ));
                            }
                            let Ok(value) = serde_json::from_str::<Value>(&frame.data) else {
                                continue;
                            };
                            match event {
                                "message_start" => {
                                    if let Some(u) = value.get("message").and_then(|m| m.get("usage")) {
                                        usage.prompt_tokens = u
                                            .get("input_tokens")
                                            .and_then(|v| v.as_u64())
                                            .unwrap_or(0) as u32;
                                    }
                                    continue;
                                }
                                "content_block_delta" => {
                                    let content = value
                                        .get("delta")
                                        .and_then(|d| d.get("text"))
                                        .and_then(|t| t.as_str())
                                        .map(|s| s.to_string());
                                    let item = StandardChunk {
                                        id: completion_id.clone(),
                                        model: model_name.clone(),
                                        provider: provider_name.clone(),
                                        created_at: chrono::Utc::now().to_rfc3339(),
                                        content,
                                        tool_calls: None,
                                        usage: usage.clone(),
                                        latency: None,
                                        finish_reason: None,
                                        raw: Some(value),
                                    };
                                    return Some((
                                        StreamItem::Chunk(item),
                                        (byte_stream, decoder, usage),
                                    ));
                                }
                                "message_delta" => {
                                    if let Some(out) = value
                                        .get("usage")
                                        .and_then(|u| u.get("output_tokens"))
                                        .and_then(|v| v.as_u64())
                                    {
                                        usage.completion_tokens = out as u32;
                                        usage.total_tokens =
                                            usage.prompt_tokens + usage.completion_tokens;
                                    }
                                    let finish_reason = value
                                        .get("delta")
                                        .and_then(|d| d.get("stop_reason"))
                                        .and_then(|f| f.as_str())
                                        .map(|s| s.to_string());
                                    let item = StandardChunk {
                                        id: completion_id.clone(),
                                        model: model_name.clone(),
                                        provider: provider_name.clone(),
                                        created_at: chrono::Utc::now().to_rfc3339(),
                                        content: None,
                                        tool_calls: None,
                                        usage: usage.clone(),
                                        latency: None,
                                        finish_reason,
                                        raw: Some(value),
                                    };
                                    return Some((
                                        StreamItem::Chunk(item),
                                        (byte_stream, decoder, usage),
                                    ));
                                }
                                "message_stop" => return None,
                                _ => continue,
                            }
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
    use crate::core::types::{Content, ImageUrl};

    fn provider() -> AnthropicProvider {
        AnthropicProvider::new(AnthropicConfig {
            api_key: "k".into(),
            base_url: "https://api.anthropic.com/v1".into(),
            default_model: "claude-3-5-sonnet-20241022".into(),
        })
    }

    fn req_with(messages: Vec<Message>) -> ChatRequest {
        ChatRequest {
            model: "claude-3-5-sonnet-20241022".into(),
            messages,
            temperature: 0.7,
            max_tokens: 100,
            top_p: None,
            frequency_penalty: None,
            presence_penalty: None,
            stop: None,
            response_format: None,
            request_id: None,
            nocache: None,
        }
    }

    #[test]
    fn lifts_system_prompt_to_top_level_field() {
        let messages = vec![
            Message {
                role: Role::System,
                content: Content::Text("be terse".into()),
            },
            Message {
                role: Role::User,
                content: Content::Text("hi".into()),
            },
        ];
        let body = provider().build_body("claude-3-5-sonnet-20241022", &req_with(messages), false);
        assert_eq!(body["system"], json!("be terse"));
        assert_eq!(body["messages"].as_array().unwrap().len(), 1);
    }

    #[test]
    fn enforces_alternation_with_synthetic_empty_user() {
        let messages = vec![Message {
            role: Role::Assistant,
            content: Content::Text("hi".into()),
        }];
        let body = provider().build_body("claude-3-5-sonnet-20241022", &req_with(messages), false);
        let messages = body["messages"].as_array().unwrap();
        assert_eq!(messages[0]["role"], json!("user"));
        assert_eq!(messages[0]["content"], json!(""));
        assert_eq!(messages[1]["role"], json!("assistant"));
    }

    #[test]
    fn converts_base64_image_to_anthropic_source() {
        let messages = vec![Message {
            role: Role::User,
            content: Content::Parts(vec![ContentPart::ImageUrl {
                image_url: ImageUrl {
                    url: "data:image/png;base64,AAA".into(),
                },
            }]),
        }];
        let body = provider().build_body("claude-3-5-sonnet-20241022", &req_with(messages), false);
        let part = &body["messages"][0]["content"][0];
        assert_eq!(part["type"], json!("image"));
        assert_eq!(part["source"]["media_type"], json!("image/png"));
        assert_eq!(part["source"]["data"], json!("AAA"));
    }

    #[test]
    fn drops_non_base64_image_urls() {
        let messages = vec![Message {
            role: Role::User,
            content: Content::Parts(vec![ContentPart::ImageUrl {
                image_url: ImageUrl {
                    url: "https://example.com/cat.png".into(),
                },
            }]),
        }];
        let body = provider().build_body("claude-3-5-sonnet-20241022", &req_with(messages), false);
        assert_eq!(body["messages"][0]["content"].as_array().unwrap().len(), 0);
    }
}
