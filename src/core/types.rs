//! Uniform data model shared by every provider adapter and the lifecycle
//! engine: messages, the incoming `ChatRequest`, and the normalized
//! `StandardResponse`/`StandardChunk` schemas returned to clients.

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Content {
    Text(String),
    Parts(Vec<ContentPart>),
}

impl Content {
    /// Flattens the content to a plain string, used for cache-key
    /// stringification and for providers that don't support multimodal parts.
    pub fn as_text(&self) -> String {
        match self {
            Content::Text(t) => t.clone(),
            Content::Parts(parts) => parts
                .iter()
                .filter_map(|p| match p {
                    ContentPart::Text { text } => Some(text.clone()),
                    ContentPart::ImageUrl { .. } => None,
                })
                .collect::<Vec<_>>()
                .join(" "),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text { text: String },
    ImageUrl { image_url: ImageUrl },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageUrl {
    pub url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: Content,
}

fn default_temperature() -> f32 {
    0.7
}
fn default_max_tokens() -> u32 {
    1000
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StopSequence {
    One(String),
    Many(Vec<String>),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseFormat {
    #[serde(rename = "type")]
    pub kind: String,
}

/// Incoming chat-completion request as received from the client, before
/// provider-specific normalization.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<Message>,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default)]
    pub top_p: Option<f32>,
    #[serde(default)]
    pub frequency_penalty: Option<f32>,
    #[serde(default)]
    pub presence_penalty: Option<f32>,
    #[serde(default)]
    pub stop: Option<StopSequence>,
    #[serde(default)]
    pub response_format: Option<ResponseFormat>,
    #[serde(default, rename = "requestId")]
    pub request_id: Option<String>,
    #[serde(default)]
    pub nocache: Option<bool>,
}

impl ChatRequest {
    /// Splits `model` at the first `/`: provider name on the left, model
    /// name on the right. No slash means the default provider and the whole
    /// string is the model name.
    pub fn parse_model(&self) -> (Option<&str>, &str) {
        match self.model.split_once('/') {
            Some((provider, model)) => (Some(provider), model),
            None => (None, self.model.as_str()),
        }
    }

    /// Validates `{model, messages}` non-empty and that every message
    /// carries non-empty text content, per this gateway's provider
    /// contract. Called before any upstream adapter touches the request.
    pub fn validate(&self) -> crate::utils::error::Result<()> {
        use crate::utils::error::GatewayError;

        if self.model.trim().is_empty() {
            return Err(GatewayError::Validation("model must not be empty".to_string()));
        }
        if self.messages.is_empty() {
            return Err(GatewayError::Validation(
                "messages must contain at least one entry".to_string(),
            ));
        }
        for (index, message) in self.messages.iter().enumerate() {
            let has_content = match &message.content {
                Content::Text(text) => !text.is_empty(),
                Content::Parts(parts) => !parts.is_empty(),
            };
            if !has_content {
                return Err(GatewayError::Validation(format!(
                    "messages[{}] must carry non-empty content",
                    index
                )));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

/// Error detail carried in the 200-OK envelope path some deployments choose
/// for non-stream provider errors (see DESIGN.md Open Question #1). This
/// deployment defaults to typed HTTP statuses instead, but keeps this shape
/// available since callers may pass through an upstream error payload here
/// inside `StandardResponse::error`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StandardError {
    pub message: String,
    pub code: String,
    #[serde(rename = "type")]
    pub kind: String,
}

/// Non-streaming normalized chat-completion response.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StandardResponse {
    pub id: String,
    pub model: String,
    pub provider: String,
    pub created_at: String,
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Value>,
    pub usage: Usage,
    pub latency: Option<u64>,
    pub finish_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cached: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<StandardError>,
}

/// One streamed delta; chunks carry the latest cumulative usage and a null
/// `finish_reason` until the terminal event.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StandardChunk {
    pub id: String,
    pub model: String,
    pub provider: String,
    pub created_at: String,
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Value>,
    pub usage: Usage,
    pub latency: Option<u64>,
    pub finish_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw: Option<Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelFeatures {
    pub streaming: bool,
    pub vision: bool,
    pub tools: bool,
    pub json: bool,
    pub system: bool,
    pub function_calling: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelInfo {
    pub id: String,
    pub name: String,
    pub provider: String,
    pub token_limit: u32,
    pub features: ModelFeatures,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderDescriptor {
    pub name: String,
    pub default_model: String,
    pub config: Value,
    pub models: Vec<ModelInfo>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_model_with_provider_prefix() {
        let req = ChatRequest {
            model: "openai/gpt-4o".into(),
            messages: vec![],
            temperature: 0.7,
            max_tokens: 1000,
            top_p: None,
            frequency_penalty: None,
            presence_penalty: None,
            stop: None,
            response_format: None,
            request_id: None,
            nocache: None,
        };
        assert_eq!(req.parse_model(), (Some("openai"), "gpt-4o"));
    }

    #[test]
    fn parses_model_without_provider_prefix() {
        let req = ChatRequest {
            model: "gpt-4o".into(),
            messages: vec![],
            temperature: 0.7,
            max_tokens: 1000,
            top_p: None,
            frequency_penalty: None,
            presence_penalty: None,
            stop: None,
            response_format: None,
            request_id: None,
            nocache: None,
        };
        assert_eq!(req.parse_model(), (None, "gpt-4o"));
    }

    #[test]
    fn defaults_apply_when_fields_absent() {
        let json = r#"{"model":"gpt-4o","messages":[{"role":"user","content":"hi"}]}"#;
        let req: ChatRequest = serde_json::from_str(json).unwrap();
        assert_eq!(req.temperature, 0.7);
        assert_eq!(req.max_tokens, 1000);
    }

    #[test]
    fn request_id_field_is_camel_case_on_the_wire() {
        let json = r#"{"model":"gpt-4o","messages":[{"role":"user","content":"hi"}],"requestId":"abc"}"#;
        let req: ChatRequest = serde_json::from_str(json).unwrap();
        assert_eq!(req.request_id.as_deref(), Some("abc"));
    }

    #[test]
    fn standard_response_serializes_with_camel_case_keys() {
        let response = StandardResponse {
            id: "chatcmpl-1".into(),
            model: "gpt-4o".into(),
            provider: "openai".into(),
            created_at: "2026-01-01T00:00:00Z".into(),
            content: Some("hi".into()),
            tool_calls: None,
            usage: Usage {
                prompt_tokens: 1,
                completion_tokens: 2,
                total_tokens: 3,
            },
            latency: Some(10),
            finish_reason: Some("stop".into()),
            raw: None,
            cached: None,
            error: None,
        };
        let value = serde_json::to_value(&response).unwrap();
        assert_eq!(value["createdAt"], json!("2026-01-01T00:00:00Z"));
        assert_eq!(value["finishReason"], json!("stop"));
        assert_eq!(value["usage"]["promptTokens"], json!(1));
        assert_eq!(value["usage"]["totalTokens"], json!(3));
        assert!(value.get("created_at").is_none());
    }

    fn valid_req() -> ChatRequest {
        ChatRequest {
            model: "gpt-4o".into(),
            messages: vec![Message {
                role: Role::User,
                content: Content::Text("hi".into()),
            }],
            temperature: 0.7,
            max_tokens: 1000,
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
    fn validate_accepts_well_formed_request() {
        assert!(valid_req().validate().is_ok());
    }

    #[test]
    fn validate_rejects_empty_model() {
        let mut req = valid_req();
        req.model = "".into();
        assert!(matches!(
            req.validate(),
            Err(crate::utils::error::GatewayError::Validation(_))
        ));
    }

    #[test]
    fn validate_rejects_empty_messages() {
        let mut req = valid_req();
        req.messages.clear();
        assert!(matches!(
            req.validate(),
            Err(crate::utils::error::GatewayError::Validation(_))
        ));
    }

    #[test]
    fn validate_rejects_message_with_empty_text_content() {
        let mut req = valid_req();
        req.messages.push(Message {
            role: Role::User,
            content: Content::Text("".into()),
        });
        assert!(matches!(
            req.validate(),
            Err(crate::utils::error::GatewayError::Validation(_))
        ));
    }

    #[test]
    fn content_as_text_joins_text_parts_only() {
        let content = Content::Parts(vec![
            ContentPart::Text {
                text: "hello".into(),
            },
            ContentPart::ImageUrl {
                image_url: ImageUrl {
                    url: "https://x/y.png".into(),
                },
            },
            ContentPart::Text {
                text: "world".into(),
            },
        ]);
        assert_eq!(content.as_text(), "hello world");
    }
}
