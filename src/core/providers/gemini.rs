//! Google-style adapter: REST `generateContent`/`streamGenerateContent`
//! endpoints, API key as a query parameter, system prompt lifted into
//! `systemInstruction`, user/model alternation enforced, base64 data-URL
//! images converted to `inline_data` (non-base64 dropped with a warning).

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

#[derive(Debug, Clone)]
pub struct GeminiConfig {
    pub api_key: String,
    pub base_url: String,
    pub default_model: String,
    pub api_version: String,
}

impl GeminiConfig {
    pub fn from_env() -> Self {
        Self {
            api_key: std::env::var("GEMINI_API_KEY").unwrap_or_default(),
            base_url: std::env::var("GEMINI_BASE_URL")
                .unwrap_or_else(|_| "https://generativelanguage.googleapis.com".to_string()),
            default_model: std::env::var("GEMINI_DEFAULT_MODEL")
                .unwrap_or_else(|_| "gemini-1.5-flash".to_string()),
            api_version: std::env::var("GEMINI_API_VERSION").unwrap_or_else(|_| "v1beta".to_string()),
        }
    }
}

pub struct GeminiProvider {
    config: GeminiConfig,
    http1: reqwest::Client,
    http2: reqwest::Client,
}

impl GeminiProvider {
    pub fn new(config: GeminiConfig) -> Self {
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

    fn image_part_to_json(image_url: &str) -> Option<Value> {
        if let Some(rest) = image_url.strip_prefix("data:") {
            if let Some((media_type, data)) = rest.split_once(";base64,") {
                return Some(json!({
                    "inline_data": {
                        "mime_type": media_type,
                        "data": data,
                    }
                }));
            }
        }
        warn!(provider = "gemini", url = %image_url, "dropping non-base64 image url; gemini requires inline base64 data");
        None
    }

    fn message_to_json(message: &Message) -> Value {
        let role = match message.role {
            Role::Assistant => "model",
            _ => "user",
        };
        let parts: Vec<Value> = match &message.content {
            Content::Text(text) => vec![json!({"text": text})],
            Content::Parts(parts) => parts
                .iter()
                .filter_map(|p| match p {
                    ContentPart::Text { text } => Some(json!({"text": text})),
                    ContentPart::ImageUrl { image_url } => Self::image_part_to_json(&image_url.url),
                })
                .collect(),
        };
        json!({"role": role, "parts": parts})
    }

    fn build_body(&self, request: &ChatRequest) -> Value {
        let (system, rest) = lift_system_prompt(&request.messages);
        let normalized = normalize_alternation(rest, Role::User);
        let contents: Vec<Value> = normalized.iter().map(Self::message_to_json).collect();

        let mut body = json!({
            "contents": contents,
            "generationConfig": {
                "temperature": request.temperature,
                "maxOutputTokens": request.max_tokens,
            },
        });
        if let Some(system) = system {
            body.as_object_mut().unwrap().insert(
                "systemInstruction".into(),
                json!({"parts": [{"text": system}]}),
            );
        }
        if let Some(top_p) = request.top_p {
            body["generationConfig"]
                .as_object_mut()
                .unwrap()
                .insert("topP".into(), json!(top_p));
        }
        if let Some(stop) = &request.stop {
            let sequences = match stop {
                crate::core::types::StopSequence::One(s) => vec![s.clone()],
                crate::core::types::StopSequence::Many(v) => v.clone(),
            };
            body["generationConfig"]
                .as_object_mut()
                .unwrap()
                .insert("stopSequences".into(), json!(sequences));
        }
        body
    }

    fn endpoint(&self, model: &str, method: &str) -> String {
        format!(
            "{}/{}/models/{}:{}?key={}",
            self.config.base_url, self.config.api_version, model, method, self.config.api_key
        )
    }

    fn parse_candidate(value: &Value) -> (Option<String>, Option<String>) {
        let candidate = value.get("candidates").and_then(|c| c.get(0));
        let content = candidate
            .and_then(|c| c.get("content"))
            .and_then(|c| c.get("parts"))
            .and_then(|p| p.get(0))
            .and_then(|p| p.get("text"))
            .and_then(|t| t.as_str())
            .map(|s| s.to_string());
        let finish_reason = candidate
            .and_then(|c| c.get("finishReason"))
            .and_then(|f| f.as_str())
            .map(|s| s.to_string());
        (content, finish_reason)
    }

    fn parse_usage(value: &Value) -> Usage {
        value
            .get("usageMetadata")
            .map(|u| Usage {
                prompt_tokens: u.get("promptTokenCount").and_then(|v| v.as_u64()).unwrap_or(0) as u32,
                completion_tokens: u
                    .get("candidatesTokenCount")
                    .and_then(|v| v.as_u64())
                    .unwrap_or(0) as u32,
                total_tokens: u.get("totalTokenCount").and_then(|v| v.as_u64()).unwrap_or(0) as u32,
            })
            .unwrap_or_default()
    }
}

fn standard_models() -> Vec<ModelInfo> {
    vec![ModelInfo {
        id: "gemini-1.5-flash".into(),
        name: "Gemini 1.5 Flash".into(),
        provider: "gemini".into(),
        token_limit: 1_000_000,
        features: ModelFeatures {
            streaming: true,
            vision: true,
            tools: true,
            json: true,
            system: true,
            function_calling: true,
        },
        description: Some("Fast, long-context Gemini model".into()),
    }]
}

#[async_trait]
impl Provider for GeminiProvider {
    fn name(&self) -> &'static str {
        "gemini"
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
        let body = self.build_body(request);
        let start = Instant::now();
        let response = self
            .http1
            .post(self.endpoint(model, "generateContent"))
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
        let (content, finish_reason) = Self::parse_candidate(&json_body);
        let usage = Self::parse_usage(&json_body);

        Ok(StandardResponse {
            id: generate_completion_id(),
            model: model.to_string(),
            provider: self.name().to_string(),
            created_at: chrono::Utc::now().to_rfc3339(),
            content,
            tool_calls: None,
            usage,
            latency: Some(latency),
            finish_reason,
            raw: Some(json_body),
            cached: None,
            error: None,
        })
    }

    async fn chat_completion_stream(&self, model: &str, request: &ChatRequest) -> Result<ChunkStream> {
        let body = self.build_body(request);
        let url = format!(
            "{}/{}/models/{}:streamGenerateContent?alt=sse&key={}",
            self.config.base_url, self.config.api_version, model, self.config.api_key
        );
        let response = self
            .http2
            .post(url)
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
                            let Ok(value) = serde_json::from_str::<Value>(&frame.data) else {
                                continue;
                            };
                            let (content, finish_reason) = Self::parse_candidate(&value);
                            let usage = Self::parse_usage(&value);
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
    use crate::core::types::{Content, ImageUrl};

    fn provider() -> GeminiProvider {
        GeminiProvider::new(GeminiConfig {
            api_key: "k".into(),
            base_url: "https://generativelanguage.googleapis.com".into(),
            default_model: "gemini-1.5-flash".into(),
            api_version: "v1beta".into(),
        })
    }

    fn req_with(messages: Vec<Message>) -> ChatRequest {
        ChatRequest {
            model: "gemini-1.5-flash".into(),
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
    fn lifts_system_prompt_into_system_instruction() {
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
        let body = provider().build_body(&req_with(messages));
        assert_eq!(body["systemInstruction"]["parts"][0]["text"], json!("be terse"));
    }

    #[test]
    fn maps_assistant_role_to_model() {
        let messages = vec![
            Message {
                role: Role::User,
                content: Content::Text("hi".into()),
            },
            Message {
                role: Role::Assistant,
                content: Content::Text("hello".into()),
            },
        ];
        let body = provider().build_body(&req_with(messages));
        assert_eq!(body["contents"][1]["role"], json!("model"));
    }

    #[test]
    fn prepends_synthetic_user_when_first_is_not_user() {
        let messages = vec![Message {
            role: Role::Assistant,
            content: Content::Text("hi".into()),
        }];
        let body = provider().build_body(&req_with(messages));
        assert_eq!(body["contents"][0]["role"], json!("user"));
    }

    #[test]
    fn converts_base64_image_to_inline_data() {
        let messages = vec![Message {
            role: Role::User,
            content: Content::Parts(vec![ContentPart::ImageUrl {
                image_url: ImageUrl {
                    url: "data:image/jpeg;base64,ZZZ".into(),
                },
            }]),
        }];
        let body = provider().build_body(&req_with(messages));
        let part = &body["contents"][0]["parts"][0];
        assert_eq!(part["inline_data"]["mime_type"], json!("image/jpeg"));
        assert_eq!(part["inline_data"]["data"], json!("ZZZ"));
    }
}
