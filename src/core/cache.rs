//! In-memory response cache: a fingerprint-keyed TTL map with a background
//! sweep. `generate_key` produces stable keys across property-insertion
//! order and bounds key size to the last `MAX_KEY_MESSAGES` messages.

use dashmap::DashMap;
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::debug;

use crate::core::types::{ChatRequest, Message};

/// Only the last N messages participate in the cache fingerprint, bounding
/// key size for long conversations.
pub const MAX_KEY_MESSAGES: usize = 10;

pub const DEFAULT_TTL_SECS: u64 = 60;
pub const DEFAULT_SWEEP_INTERVAL_MS: u64 = 300_000;

struct Entry {
    value: Value,
    expires_at: Instant,
    category: String,
}

#[derive(Debug, Clone, Default)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub size: usize,
    pub categories: Vec<String>,
    pub hit_rate: f64,
}

pub struct ResponseCache {
    entries: DashMap<String, Entry>,
    hits: AtomicU64,
    misses: AtomicU64,
    enabled: bool,
}

impl ResponseCache {
    pub fn new(enabled: bool) -> Self {
        Self {
            entries: DashMap::new(),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            enabled,
        }
    }

    /// `CACHE_ENABLED` gates the cache; any value other than the literal
    /// string `"false"` enables it (including the variable being unset).
    pub fn from_env() -> Self {
        let enabled = std::env::var("CACHE_ENABLED")
            .map(|v| v != "false")
            .unwrap_or(true);
        Self::new(enabled)
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        if !self.enabled {
            return None;
        }
        match self.entries.get(key) {
            Some(entry) if entry.expires_at > Instant::now() => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(entry.value.clone())
            }
            Some(_) => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                self.entries.remove(key);
                None
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    pub fn set(&self, key: String, value: Value, ttl_seconds: u64, category: &str) {
        if !self.enabled {
            return;
        }
        self.entries.insert(
            key,
            Entry {
                value,
                expires_at: Instant::now() + Duration::from_secs(ttl_seconds),
                category: category.to_string(),
            },
        );
    }

    pub async fn get_or_set<F, Fut>(
        &self,
        key: &str,
        ttl_seconds: u64,
        category: &str,
        factory: F,
    ) -> Value
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Value>,
    {
        if let Some(value) = self.get(key) {
            return value;
        }
        let value = factory().await;
        self.set(key.to_string(), value.clone(), ttl_seconds, category);
        value
    }

    pub fn stats(&self) -> CacheStats {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        let mut categories: Vec<String> = self
            .entries
            .iter()
            .map(|e| e.category.clone())
            .collect::<std::collections::HashSet<_>>()
            .into_iter()
            .collect();
        categories.sort();
        CacheStats {
            hits,
            misses,
            size: self.entries.len(),
            categories,
            hit_rate: if total == 0 {
                0.0
            } else {
                hits as f64 / total as f64
            },
        }
    }

    /// Removes expired entries without blocking request handling; intended
    /// to run on a periodic `tokio::time::interval` task.
    pub fn sweep(&self) {
        let before = self.entries.len();
        let now = Instant::now();
        self.entries.retain(|_, entry| entry.expires_at > now);
        let removed = before - self.entries.len();
        if removed > 0 {
            debug!(removed, "swept expired cache entries");
        }
    }

    pub fn spawn_sweeper(self: std::sync::Arc<Self>, interval_ms: u64) {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_millis(interval_ms));
            loop {
                ticker.tick().await;
                self.sweep();
            }
        });
    }
}

/// Canonicalizes a `serde_json::Value` to a string with object keys sorted
/// at every level, so property-insertion order never affects the result.
fn canonicalize(value: &Value) -> String {
    match value {
        Value::Object(map) => {
            let sorted: BTreeMap<&String, &Value> = map.iter().collect();
            let mut out = String::from("{");
            for (i, (k, v)) in sorted.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&format!("{:?}:{}", k, canonicalize(v)));
            }
            out.push('}');
            out
        }
        Value::Array(items) => {
            let mut out = String::from("[");
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&canonicalize(item));
            }
            out.push(']');
            out
        }
        other => other.to_string(),
    }
}

fn message_to_kv(message: &Message) -> String {
    let role = match message.role {
        crate::core::types::Role::System => "system",
        crate::core::types::Role::User => "user",
        crate::core::types::Role::Assistant => "assistant",
    };
    format!("{}:{}", role, message.content.as_text())
}

/// Builds the `{provider, modelName, messages, temperature, max_tokens}`
/// fingerprint used to key non-streaming completion responses.
pub fn generate_request_key(provider: &str, model_name: &str, request: &ChatRequest) -> String {
    let trimmed: Vec<&Message> = request
        .messages
        .iter()
        .rev()
        .take(MAX_KEY_MESSAGES)
        .collect::<Vec<_>>()
        .into_iter()
        .rev()
        .collect();
    let messages_str: Vec<String> = trimmed.iter().map(|m| message_to_kv(m)).collect();

    let mut obj = Map::new();
    obj.insert("provider".into(), Value::String(provider.to_string()));
    obj.insert("modelName".into(), Value::String(model_name.to_string()));
    obj.insert(
        "messages".into(),
        Value::Array(messages_str.into_iter().map(Value::String).collect()),
    );
    obj.insert(
        "temperature".into(),
        serde_json::Number::from_f64(request.temperature as f64)
            .map(Value::Number)
            .unwrap_or(Value::Null),
    );
    obj.insert(
        "max_tokens".into(),
        Value::Number(request.max_tokens.into()),
    );

    generate_key(&Value::Object(obj), &[])
}

/// General-purpose fingerprint generator. If `input` is an object/array it
/// is canonicalized (sorted keys at every level) then SHA-256 hashed; if
/// it's a primitive it is stringified and joined to `extras` with `-`.
pub fn generate_key(input: &Value, extras: &[&str]) -> String {
    match input {
        Value::Object(_) | Value::Array(_) => {
            let canonical = canonicalize(input);
            let mut hasher = Sha256::new();
            hasher.update(canonical.as_bytes());
            format!("sha256-{}", hex::encode(hasher.finalize()))
        }
        primitive => {
            let mut parts = vec![primitive_to_string(primitive)];
            parts.extend(extras.iter().map(|s| s.to_string()));
            parts.join("-")
        }
    }
}

fn primitive_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        Value::Null => "null".to_string(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn key_stable_under_property_reorder() {
        let a = json!({"a": 1, "b": {"x": 1, "y": 2}});
        let b = json!({"b": {"y": 2, "x": 1}, "a": 1});
        assert_eq!(generate_key(&a, &[]), generate_key(&b, &[]));
    }

    #[test]
    fn key_depends_only_on_last_n_messages() {
        use crate::core::types::{ChatRequest, Content, Message, Role};

        fn req_with(n: usize, prefix_garbage: usize) -> ChatRequest {
            let mut messages = Vec::new();
            for i in 0..prefix_garbage {
                messages.push(Message {
                    role: Role::User,
                    content: Content::Text(format!("garbage-{}", i)),
                });
            }
            for i in 0..n {
                messages.push(Message {
                    role: Role::User,
                    content: Content::Text(format!("keep-{}", i)),
                });
            }
            ChatRequest {
                model: "gpt-4o".into(),
                messages,
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

        let a = req_with(MAX_KEY_MESSAGES, 0);
        let b = req_with(MAX_KEY_MESSAGES, 5);
        assert_eq!(
            generate_request_key("openai", "gpt-4o", &a),
            generate_request_key("openai", "gpt-4o", &b)
        );
    }

    #[tokio::test]
    async fn round_trips_within_ttl() {
        let cache = ResponseCache::new(true);
        cache.set("k".into(), json!({"v": 1}), 60, "general");
        assert_eq!(cache.get("k"), Some(json!({"v": 1})));
    }

    #[tokio::test]
    async fn expires_after_ttl() {
        let cache = ResponseCache::new(true);
        cache.set("k".into(), json!({"v": 1}), 0, "general");
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(cache.get("k"), None);
    }

    #[test]
    fn disabled_cache_never_hits() {
        let cache = ResponseCache::new(false);
        cache.set("k".into(), json!(1), 60, "general");
        assert_eq!(cache.get("k"), None);
    }

    #[tokio::test]
    async fn get_or_set_calls_factory_once_on_miss() {
        use std::sync::atomic::{AtomicU32, Ordering};
        let cache = ResponseCache::new(true);
        let calls = std::sync::Arc::new(AtomicU32::new(0));
        let calls2 = calls.clone();
        let v = cache
            .get_or_set("k", 60, "general", || async move {
                calls2.fetch_add(1, Ordering::SeqCst);
                json!(42)
            })
            .await;
        assert_eq!(v, json!(42));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
