//! Uniform provider contract implemented by each upstream adapter, plus the
//! shared normalization helpers every adapter calls into (system-prompt
//! lifting, message-alternation repair).

pub mod anthropic;
pub mod gemini;
pub mod openai;
pub mod openrouter;

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde_json::Value;

use crate::core::types::{ChatRequest, Message, ModelInfo, Role, StandardChunk, StandardResponse};
use crate::utils::error::Result;

/// One chunk of a live stream: either a normalized delta or a terminal
/// error to be surfaced as an `event: error` SSE frame before `[DONE]`.
pub enum StreamItem {
    Chunk(StandardChunk),
    Error(String),
}

pub type ChunkStream = BoxStream<'static, StreamItem>;

/// Contract every upstream adapter implements. `name()` doubles as the
/// provider's cache-key and circuit-breaker namespace component.
#[async_trait]
pub trait Provider: Send + Sync {
    fn name(&self) -> &'static str;

    fn default_model(&self) -> &str;

    /// Whether this adapter has the credentials it needs to make calls.
    fn is_configured(&self) -> bool;

    /// Static model catalog this adapter knows about without a network call.
    fn known_models(&self) -> Vec<ModelInfo>;

    async fn chat_completion(&self, model: &str, request: &ChatRequest) -> Result<StandardResponse>;

    async fn chat_completion_stream(&self, model: &str, request: &ChatRequest) -> Result<ChunkStream>;
}

/// Lifts leading `system` messages out of the message list, returning the
/// combined system prompt (joined with `\n\n`) and the remaining messages.
/// Anthropic- and Gemini-style APIs take the system prompt as a sibling
/// field rather than a message with `role: "system"`.
pub fn lift_system_prompt(messages: &[Message]) -> (Option<String>, Vec<Message>) {
    let mut system_parts = Vec::new();
    let mut rest = Vec::new();
    for message in messages {
        match message.role {
            Role::System => system_parts.push(message.content.as_text()),
            _ => rest.push(message.clone()),
        }
    }
    let system = if system_parts.is_empty() {
        None
    } else {
        Some(system_parts.join("\n\n"))
    };
    (system, rest)
}

/// Some upstream APIs (Anthropic, Gemini) require turns to strictly
/// alternate starting from a specific role. Collapses consecutive
/// same-role messages by joining their text with a newline, then prepends
/// a synthetic empty message of `first_role` if the sequence doesn't
/// already start with it.
pub fn normalize_alternation(messages: Vec<Message>, first_role: Role) -> Vec<Message> {
    let mut out: Vec<Message> = Vec::with_capacity(messages.len());
    for message in messages {
        match out.last_mut() {
            Some(prev) if prev.role == message.role => {
                let joined = format!("{}\n{}", prev.content.as_text(), message.content.as_text());
                prev.content = crate::core::types::Content::Text(joined);
            }
            _ => out.push(message),
        }
    }
    if out.first().map(|m| m.role) != Some(first_role) {
        out.insert(
            0,
            Message {
                role: first_role,
                content: crate::core::types::Content::Text(String::new()),
            },
        );
    }
    out
}

/// Builds the uniform `chatcmpl-<uuid>` style identifier used across
/// providers for `StandardResponse::id` / `StandardChunk::id`.
pub fn generate_completion_id() -> String {
    format!("chatcmpl-{}", uuid::Uuid::new_v4())
}

/// Wraps a raw upstream error body that doesn't fit `map_provider_error`'s
/// string heuristics with an explicit HTTP status, when the adapter already
/// knows the response status code.
pub fn classify_http_error(status: u16, body: &str) -> crate::utils::error::GatewayError {
    crate::utils::error::map_provider_error(body, Some(status))
}

/// Extracts a JSON error message field with common provider shapes
/// (`{"error":{"message":...}}`, `{"error":"..."}`, `{"message":"..."}`),
/// falling back to the raw body.
pub fn extract_error_message(body: &str) -> String {
    if let Ok(value) = serde_json::from_str::<Value>(body) {
        if let Some(msg) = value
            .get("error")
            .and_then(|e| e.get("message"))
            .and_then(|m| m.as_str())
        {
            return msg.to_string();
        }
        if let Some(msg) = value.get("error").and_then(|e| e.as_str()) {
            return msg.to_string();
        }
        if let Some(msg) = value.get("message").and_then(|m| m.as_str()) {
            return msg.to_string();
        }
    }
    body.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::Content;

    fn msg(role: Role, text: &str) -> Message {
        Message {
            role,
            content: Content::Text(text.to_string()),
        }
    }

    #[test]
    fn lifts_leading_system_messages() {
        let messages = vec![
            msg(Role::System, "be terse"),
            msg(Role::System, "no markdown"),
            msg(Role::User, "hi"),
        ];
        let (system, rest) = lift_system_prompt(&messages);
        assert_eq!(system, Some("be terse\n\nno markdown".to_string()));
        assert_eq!(rest.len(), 1);
    }

    #[test]
    fn lift_system_prompt_handles_no_system_messages() {
        let messages = vec![msg(Role::User, "hi")];
        let (system, rest) = lift_system_prompt(&messages);
        assert_eq!(system, None);
        assert_eq!(rest.len(), 1);
    }

    #[test]
    fn normalize_alternation_collapses_consecutive_same_role() {
        let messages = vec![
            msg(Role::User, "a"),
            msg(Role::User, "b"),
            msg(Role::Assistant, "c"),
        ];
        let normalized = normalize_alternation(messages, Role::User);
        assert_eq!(normalized.len(), 2);
        assert_eq!(normalized[0].content.as_text(), "a\nb");
    }

    #[test]
    fn normalize_alternation_prepends_synthetic_first_turn() {
        let messages = vec![msg(Role::Assistant, "hi")];
        let normalized = normalize_alternation(messages, Role::User);
        assert_eq!(normalized.len(), 2);
        assert_eq!(normalized[0].role, Role::User);
        assert_eq!(normalized[0].content.as_text(), "");
        assert_eq!(normalized[1].role, Role::Assistant);
    }

    #[test]
    fn extract_error_message_handles_nested_shape() {
        let body = r#"{"error":{"message":"Invalid API key","type":"invalid_request_error"}}"#;
        assert_eq!(extract_error_message(body), "Invalid API key");
    }

    #[test]
    fn extract_error_message_falls_back_to_raw_body() {
        let body = "plain text error";
        assert_eq!(extract_error_message(body), "plain text error");
    }
}
