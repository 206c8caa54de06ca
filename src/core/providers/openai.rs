//! OpenAI-style adapter: `Authorization: Bearer`, content passed through
//! unchanged (image parts retained as URLs/data URLs), system messages kept
//! in-line, no alternation enforcement, `stream_options.include_usage` for
//! the terminal usage chunk on streams.

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
pub struct OpenAiConfig {
    pub api_key: String,
    pub base_url: String,
    pub default_model: String,
}

impl OpenAiConfig {
    pub fn from_env() -> Self {
        Self {
            api_key: std::env::var("OPENAI_API_KEY").unwrap_or_default(),
            base_url: std::env::var("OPENAI_BASE_URL")
                .unwrap_or_else(|_| "https://api.openai.com/v1".to_string()),
            default_model: std::env::var("OPENAI_DEFAULT_MODEL")
                .unwrap_or_else(|_| "gpt-4o-mini".to_string()),
        }
    }
}

pub struct OpenAiProvider {
    config: OpenAiConfig,
    http1: reqwest::Client,
    http2: reqwest::Client,
}

impl OpenAiProvider {
    pub fn new(config: OpenAiConfig) -> Self {
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

    fn headers(&self) -> Vec<(&'static str, String)> {
        vec![("Authorization", format!("Bearer {}", self.config.api_key))]
    }

    fn message_to_json(message: &Message) -> Value {
        let role = role_str(message.role);
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
        let obj = body.as_object_mut().unwrap();
        if let Some(top_p) = request.top_p {
            obj.insert("top_p".into(), json!(top_p));
        }
        if let Some(fp) = request.frequency_penalty {
            obj.insert("frequency_penalty".into(), json!(fp));
        }
        if let Some(pp) = request.presence_penalty {
            obj.insert("presence_penalty".into(), json!(pp));
        }
        if let Some(stop) = &request.stop {
            obj.insert("stop".into(), serde_json::to_value(stop).unwrap());
        }
        if let Some(rf) = &request.response_format {
            obj.insert(
                "response_format".into(),
                json!({"type": rf.kind.clone()}),
            );
        }
        if stream {
            obj.insert("stream".into(), json!(true));
            obj.insert(
                "stream_options".into(),
                json!({"include_usage": true}),
            );
        }
        body
    }

    fn parse_response(&self, model: &str, latency: u64, body: Value) -> Result<StandardResponse> {
        let choice = body
            .get("choices")
            .and_then(|c| c.get(0))
            .cloned()
            .unwrap_or(Value::Null);
        let content = choice
            .get("message")
            .and_then(|m| m.get("content"))
            .and_then(|c| c.as_str())
            .map(|s| s.to_string());
        let tool_calls = choice
            .get("message")
            .and_then(|m| m.get("tool_calls"))
            .cloned();
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
            tool_calls,
            usage,
            latency: Some(latency),
            finish_reason,
            raw: Some(body),
            cached: None,
            error: None,
        })
    }
}

fn role_str(role: Role) -> &'static str {
    match role {
        Role::System => "system",
        Role::User => "user",
        Role::Assistant => "assistant",
    }
}

fn standard_models() -> Vec<ModelInfo> {
    vec![
        ModelInfo {
            id: "gpt-4o".into(),
            name: "GPT-4o".into(),
            provider: "openai".into(),
            token_limit: 128_000,
            features: ModelFeatures {
                streaming: true,
                vision: true,
                tools: true,
                json: true,
                system: true,
                function_calling: true,
            },
            description: Some("Flagship multimodal model".into()),
        },
        ModelInfo {
            id: "gpt-4o-mini".into(),
            name: "GPT-4o mini".into(),
            provider: "openai".into(),
            token_limit: 128_000,
            features: ModelFeatures {
                streaming: true,
                vision: true,
                tools: true,
                json: true,
                system: true,
                function_calling: true,
            },
            description: Some("Smaller, faster GPT-4o variant".into()),
        },
    ]
}

#[async_trait]
impl Provider for OpenAiProvider {
    fn name(&self) -> &'static str {
        "openai"
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
            .header("Authorization", self.headers()[0].1.clone())
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
            .header("Authorization", self.headers()[0].1.clone())
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
            (byte_stream, SseDecoder::new(), false),
            move |(mut byte_stream, mut decoder, mut done)| {
                let completion_id = completion_id.clone();
                let provider_name = provider_name.clone();
                let model_name = model_name.clone();
                async move {
                    if done {
                        return None;
                    }
                    loop {
                        let chunk = match byte_stream.next().await {
                            Some(Ok(bytes)) => bytes,
                            Some(Err(err)) => {
                                return Some((
                                    StreamItem::Error(err.to_string()),
                                    (byte_stream, decoder, true),
                                ));
                            }
                            None => return None,
                        };
                        let frames = decoder.push(&chunk);
                        for frame in frames {
                            if frame.data == crate::core::sse::DONE {
                                done = true;
                                return None;
                            }
                            if frame.event.as_deref() == Some("error") {
                                return Some((
                                    StreamItem::Error(frame.data.clone()),
                                    (byte_stream, decoder, true),
                                ));
                            }
                            let Ok(value) = serde_json::from_str::<Value>(&frame.data) else {
                                warn!(provider = "openai", "skipping unparseable SSE chunk");
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
                            return Some((StreamItem::Chunk(item), (byte_stream, decoder, done)));
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
    use crate::core::types::{Content, StopSequence};

    fn req() -> ChatRequest {
        ChatRequest {
            model: "gpt-4o".into(),
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
        }
    }

    #[test]
    fn builds_body_with_stream_options_when_streaming() {
        let provider = OpenAiProvider::new(OpenAiConfig {
            api_key: "k".into(),
            base_url: "https://api.openai.com/v1".into(),
            default_model: "gpt-4o".into(),
        });
        let body = provider.build_body("gpt-4o", &req(), true);
        assert_eq!(body["stream"], json!(true));
        assert_eq!(body["stream_options"]["include_usage"], json!(true));
    }

    #[test]
    fn image_parts_pass_through_as_urls() {
        let provider = OpenAiProvider::new(OpenAiConfig {
            api_key: "k".into(),
            base_url: "https://api.openai.com/v1".into(),
            default_model: "gpt-4o".into(),
        });
        let mut request = req();
        request.messages.push(Message {
            role: Role::User,
            content: crate::core::types::Content::Parts(vec![ContentPart::ImageUrl {
                image_url: crate::core::types::ImageUrl {
                    url: "data:image/png;base64,AAA".into(),
                },
            }]),
        });
        let body = provider.build_body("gpt-4o", &request, false);
        let messages = body["messages"].as_array().unwrap();
        let last = &messages[messages.len() - 1];
        assert_eq!(last["content"][0]["image_url"]["url"], json!("data:image/png;base64,AAA"));
    }

    #[test]
    fn stop_sequence_serializes_through() {
        let provider = OpenAiProvider::new(OpenAiConfig {
            api_key: "k".into(),
            base_url: "https://api.openai.com/v1".into(),
            default_model: "gpt-4o".into(),
        });
        let mut request = req();
        request.stop = Some(StopSequence::Many(vec!["\\n".into()]));
        let body = provider.build_body("gpt-4o", &request, false);
        assert_eq!(body["stop"], json!(["\\n"]));
    }

    #[test]
    fn not_configured_without_api_key() {
        let provider = OpenAiProvider::new(OpenAiConfig {
            api_key: "".into(),
            base_url: "https://api.openai.com/v1".into(),
            default_model: "gpt-4o".into(),
        });
        assert!(!provider.is_configured());
    }
}
