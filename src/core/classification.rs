//! External Classification Client (C7) plus the two-tier read-through cache
//! (C8) that fronts it. `reqwest` JSON-over-HTTP is the transport: no crate
//! in this repo or the wider retrieval pack uses `tonic`/`prost`, and the
//! spec's RPC message shapes are carried verbatim as serde types instead
//! (see DESIGN.md's transport decision).

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::core::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig};
use crate::utils::error::{GatewayError, Result};

/// One model entry flattened from the registry's `providersInfo` into the
/// classifier's wire shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassificationModel {
    pub id: String,
    pub name: String,
    pub context_size: u32,
    pub max_tokens: u32,
    pub provider: String,
    pub display_name: String,
    pub description: String,
    pub cost_per_token: f64,
    pub capabilities: Vec<String>,
    pub family: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub series: String,
    pub variant: String,
    pub is_default: bool,
    pub is_multimodal: bool,
    pub is_experimental: bool,
    pub version: String,
    pub metadata: HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoadedModelList {
    pub models: Vec<ClassificationModel>,
    pub default_provider: String,
    pub default_model: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClassificationCriteria {
    pub properties: Vec<String>,
    #[serde(default)]
    pub include_experimental: bool,
    #[serde(default)]
    pub include_deprecated: bool,
    #[serde(default)]
    pub min_context_size: Option<u32>,
    #[serde(default)]
    pub hierarchical: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassifiedModelGroup {
    pub property_name: String,
    pub property_value: String,
    pub models: Vec<ClassificationModel>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HierarchicalModelGroup {
    pub group_name: String,
    pub group_value: String,
    pub models: Vec<ClassificationModel>,
    pub children: Vec<HierarchicalModelGroup>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClassifiedModelResponse {
    pub classified_groups: Vec<ClassifiedModelGroup>,
    pub available_properties: Vec<String>,
    #[serde(default)]
    pub error_message: Option<String>,
    #[serde(default)]
    pub hierarchical_groups: Vec<HierarchicalModelGroup>,
}

/// Builds the classifier's `ModelList` request from the registry's
/// `providers_info()` output. Entries with no `id` are skipped with a
/// warning rather than failing the whole call; non-string metadata values
/// are JSON-serialized into the string map.
pub fn build_model_list(providers_info: &Value, default_provider: &str, default_model: &str) -> LoadedModelList {
    let mut models = Vec::new();
    if let Value::Object(providers) = providers_info {
        for (provider_name, info) in providers {
            let Some(entries) = info.get("models").and_then(|m| m.as_array()) else {
                continue;
            };
            for entry in entries {
                let Some(id) = entry.get("id").and_then(|v| v.as_str()) else {
                    warn!(provider = %provider_name, "skipping model with no id in classification request");
                    continue;
                };
                models.push(ClassificationModel {
                    id: id.to_string(),
                    name: entry
                        .get("name")
                        .and_then(|v| v.as_str())
                        .unwrap_or(id)
                        .to_string(),
                    context_size: entry
                        .get("tokenLimit")
                        .and_then(|v| v.as_u64())
                        .unwrap_or(0) as u32,
                    max_tokens: entry
                        .get("tokenLimit")
                        .and_then(|v| v.as_u64())
                        .unwrap_or(0) as u32,
                    provider: provider_name.clone(),
                    display_name: entry
                        .get("name")
                        .and_then(|v| v.as_str())
                        .unwrap_or(id)
                        .to_string(),
                    description: entry
                        .get("description")
                        .and_then(|v| v.as_str())
                        .unwrap_or_default()
                        .to_string(),
                    cost_per_token: 0.0,
                    capabilities: model_capabilities(entry),
                    family: provider_name.clone(),
                    kind: "chat".to_string(),
                    series: provider_name.clone(),
                    variant: id.to_string(),
                    is_default: id == default_model && provider_name == default_provider,
                    is_multimodal: entry
                        .get("features")
                        .and_then(|f| f.get("vision"))
                        .and_then(|v| v.as_bool())
                        .unwrap_or(false),
                    is_experimental: false,
                    version: "1".to_string(),
                    metadata: metadata_map(entry),
                });
            }
        }
    }
    LoadedModelList {
        models,
        default_provider: default_provider.to_string(),
        default_model: default_model.to_string(),
    }
}

fn model_capabilities(entry: &Value) -> Vec<String> {
    let Some(features) = entry.get("features").and_then(|f| f.as_object()) else {
        return Vec::new();
    };
    features
        .iter()
        .filter(|(_, v)| v.as_bool().unwrap_or(false))
        .map(|(k, _)| k.clone())
        .collect()
}

fn metadata_map(entry: &Value) -> HashMap<String, String> {
    let mut map = HashMap::new();
    if let Some(description) = entry.get("description").and_then(|v| v.as_str()) {
        map.insert("description".to_string(), description.to_string());
    }
    map
}

#[derive(Debug, Clone)]
pub struct ClassificationConfig {
    pub enabled: bool,
    pub base_url: String,
}

/// Resilient RPC client to the external model-classification service.
/// Each operation is wrapped in its own circuit breaker (3 failures / 30s
/// reset per spec.md) and retries transient upstream errors with capped,
/// jittered exponential backoff.
pub struct ClassificationClient {
    config: ClassificationConfig,
    http: reqwest::Client,
    models_breaker: Arc<CircuitBreaker>,
    criteria_breaker: Arc<CircuitBreaker>,
}

const CLASSIFY_DEADLINE: Duration = Duration::from_secs(15);
const CRITERIA_DEADLINE: Duration = Duration::from_secs(10);
const CLASSIFY_MAX_ATTEMPTS: u32 = 3;
const CRITERIA_MAX_ATTEMPTS: u32 = 2;

fn breaker_config() -> CircuitBreakerConfig {
    CircuitBreakerConfig {
        failure_threshold: 3,
        reset_timeout: Duration::from_millis(30_000),
    }
}

/// `UNAVAILABLE`/`DEADLINE_EXCEEDED`-shaped transient failures are the only
/// ones retried; anything else (validation, not-found) fails immediately.
fn is_transient(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect() || err.status().map(|s| s.as_u16() == 503).unwrap_or(false)
}

fn backoff(attempt: u32) -> Duration {
    let base_ms = 2u64.saturating_pow(attempt).saturating_mul(500);
    let jitter_ms: u64 = rand::random::<u64>() % 200;
    Duration::from_millis((base_ms + jitter_ms).min(5000))
}

impl ClassificationClient {
    pub fn new(config: ClassificationConfig) -> Self {
        Self {
            config,
            http: reqwest::Client::new(),
            models_breaker: Arc::new(CircuitBreaker::new("classification-classify", breaker_config())),
            criteria_breaker: Arc::new(CircuitBreaker::new("classification-criteria", breaker_config())),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    pub async fn classify_models(&self, models: &LoadedModelList) -> Result<ClassifiedModelResponse> {
        if !self.config.enabled {
            return Err(GatewayError::NotFound("classification service disabled".to_string()));
        }
        let url = format!("{}/classify", self.config.base_url);
        let models = models.clone();
        let http = self.http.clone();
        self.models_breaker
            .call(
                || async move {
                    Self::post_with_retry(&http, &url, &models, CLASSIFY_DEADLINE, CLASSIFY_MAX_ATTEMPTS).await
                },
                None::<fn(&GatewayError) -> Result<ClassifiedModelResponse>>,
            )
            .await
    }

    pub async fn classify_models_with_criteria(
        &self,
        criteria: &ClassificationCriteria,
    ) -> Result<ClassifiedModelResponse> {
        if !self.config.enabled {
            return Err(GatewayError::NotFound("classification service disabled".to_string()));
        }
        let url = format!("{}/classify/criteria", self.config.base_url);
        let criteria = criteria.clone();
        let http = self.http.clone();
        self.criteria_breaker
            .call(
                || async move {
                    Self::post_with_retry(&http, &url, &criteria, CRITERIA_DEADLINE, CRITERIA_MAX_ATTEMPTS).await
                },
                None::<fn(&GatewayError) -> Result<ClassifiedModelResponse>>,
            )
            .await
    }

    async fn post_with_retry<T: Serialize>(
        http: &reqwest::Client,
        url: &str,
        body: &T,
        deadline: Duration,
        max_attempts: u32,
    ) -> std::result::Result<ClassifiedModelResponse, GatewayError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let result = tokio::time::timeout(deadline, http.post(url).json(body).send()).await;

            match result {
                Ok(Ok(response)) => {
                    let status = response.status();
                    if status.is_success() {
                        return response
                            .json::<ClassifiedModelResponse>()
                            .await
                            .map_err(|e| GatewayError::Provider(e.to_string()));
                    }
                    if status.as_u16() == 503 && attempt < max_attempts {
                        debug!(attempt, "classification call got 503, retrying");
                        tokio::time::sleep(backoff(attempt)).await;
                        continue;
                    }
                    return Err(GatewayError::ProviderHttp {
                        status: status.as_u16(),
                        message: "classification service error".to_string(),
                    });
                }
                Ok(Err(err)) => {
                    if is_transient(&err) && attempt < max_attempts {
                        debug!(attempt, error = %err, "classification call failed transiently, retrying");
                        tokio::time::sleep(backoff(attempt)).await;
                        continue;
                    }
                    return Err(GatewayError::Provider(err.to_string()));
                }
                Err(_) => {
                    if attempt < max_attempts {
                        debug!(attempt, "classification call timed out, retrying");
                        tokio::time::sleep(backoff(attempt)).await;
                        continue;
                    }
                    return Err(GatewayError::Timeout("classification service deadline exceeded".to_string()));
                }
            }
        }
    }
}

/// Durable-store seam for the two-tier cache. The actual backing store
/// (Firestore per spec.md's env vars) is an external collaborator out of
/// scope for the core; this trait is what a real implementation would
/// plug in behind, and `InMemoryDurableCache` stands in for it here.
pub trait DurableCache: Send + Sync {
    fn read(&self, key: &str) -> Option<DurableEntry>;
    fn write(&self, key: String, entry: DurableEntry);
}

#[derive(Debug, Clone)]
pub struct DurableEntry {
    pub payload: Value,
    pub compressed: bool,
    pub hash: String,
    pub created_at: Instant,
    pub expires_at: Instant,
}

pub struct InMemoryDurableCache {
    entries: DashMap<String, DurableEntry>,
}

impl InMemoryDurableCache {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }
}

impl Default for InMemoryDurableCache {
    fn default() -> Self {
        Self::new()
    }
}

impl DurableCache for InMemoryDurableCache {
    fn read(&self, key: &str) -> Option<DurableEntry> {
        self.entries.get(key).map(|e| e.clone())
    }

    fn write(&self, key: String, entry: DurableEntry) {
        self.entries.insert(key, entry);
    }
}

fn content_hash(value: &Value) -> String {
    let bytes = serde_json::to_vec(value).unwrap_or_default();
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    hex::encode(hasher.finalize())
}

/// Stale-while-revalidate cache wrapper used for expensive classification
/// responses. `userId="anonymous"` is a first-class partition, not a mere
/// fallback label (see DESIGN.md Open Question #2): omitting it would
/// silently collapse every unauthenticated caller onto one cache entry.
pub struct TwoTierCache<S: DurableCache> {
    store: Arc<S>,
    enabled: bool,
    ttl: Duration,
}

pub const ANONYMOUS_USER: &str = "anonymous";

impl<S: DurableCache + 'static> TwoTierCache<S> {
    pub fn new(store: Arc<S>, enabled: bool, ttl_secs: u64) -> Self {
        Self {
            store,
            enabled,
            ttl: Duration::from_secs(ttl_secs),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    fn partition_key(user_id: &str, cache_key: &str) -> String {
        format!("{}:{}", user_id, cache_key)
    }

    /// Read-through with stale-while-revalidate: a cache hit responds
    /// immediately with the stored payload, then spawns a background task
    /// that calls `upstream` and refreshes the entry only if the computed
    /// content hash differs. A miss calls `upstream` synchronously and
    /// writes the result in the background so the caller isn't blocked on
    /// the cache write.
    pub async fn get_or_refresh<F, Fut>(&self, user_id: &str, cache_key: &str, upstream: F) -> Result<Value>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: std::future::Future<Output = Result<Value>> + Send,
    {
        if !self.enabled {
            return upstream().await;
        }

        let key = Self::partition_key(user_id, cache_key);
        let now = Instant::now();

        if let Some(entry) = self.store.read(&key) {
            if entry.expires_at > now {
                let store = self.store.clone();
                let key_for_refresh = key.clone();
                let stale_hash = entry.hash.clone();
                let ttl = self.ttl;
                tokio::spawn(async move {
                    match upstream().await {
                        Ok(fresh) => {
                            let fresh_hash = content_hash(&fresh);
                            if fresh_hash != stale_hash {
                                debug!(key = %key_for_refresh, "two-tier cache refreshing stale entry");
                                store.write(
                                    key_for_refresh,
                                    DurableEntry {
                                        payload: fresh,
                                        compressed: false,
                                        hash: fresh_hash,
                                        created_at: Instant::now(),
                                        expires_at: Instant::now() + ttl,
                                    },
                                );
                            }
                        }
                        Err(err) => {
                            warn!(key = %key_for_refresh, error = %err, "two-tier cache background refresh failed");
                        }
                    }
                });
                return Ok(entry.payload);
            }
        }

        let value = upstream().await?;
        let store = self.store.clone();
        let ttl = self.ttl;
        let value_for_cache = value.clone();
        let hash = content_hash(&value_for_cache);
        tokio::spawn(async move {
            store.write(
                key,
                DurableEntry {
                    payload: value_for_cache,
                    compressed: false,
                    hash,
                    created_at: Instant::now(),
                    expires_at: Instant::now() + ttl,
                },
            );
        });
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn build_model_list_skips_entries_without_id() {
        let providers_info = json!({
            "openai": {
                "models": [
                    {"id": "gpt-4o", "name": "GPT-4o", "tokenLimit": 128000, "features": {"vision": true}},
                    {"name": "no-id-model"},
                ],
                "defaultModel": "gpt-4o",
            }
        });
        let list = build_model_list(&providers_info, "openai", "gpt-4o");
        assert_eq!(list.models.len(), 1);
        assert_eq!(list.models[0].id, "gpt-4o");
        assert!(list.models[0].is_multimodal);
        assert!(list.models[0].is_default);
    }

    #[tokio::test]
    async fn two_tier_cache_miss_calls_upstream_and_writes_back() {
        let store = Arc::new(InMemoryDurableCache::new());
        let cache = TwoTierCache::new(store.clone(), true, 3600);
        let result = cache
            .get_or_refresh(ANONYMOUS_USER, "key1", || async { Ok(json!({"v": 1})) })
            .await
            .unwrap();
        assert_eq!(result, json!({"v": 1}));
        tokio::task::yield_now().await;
    }

    #[tokio::test]
    async fn two_tier_cache_hit_returns_immediately_without_awaiting_upstream() {
        let store = Arc::new(InMemoryDurableCache::new());
        store.write(
            format!("{}:key1", ANONYMOUS_USER),
            DurableEntry {
                payload: json!({"v": 1}),
                compressed: false,
                hash: content_hash(&json!({"v": 1})),
                created_at: Instant::now(),
                expires_at: Instant::now() + Duration::from_secs(60),
            },
        );
        let cache = TwoTierCache::new(store, true, 3600);
        let result = cache
            .get_or_refresh(ANONYMOUS_USER, "key1", || async {
                panic!("upstream should not be awaited before the response is produced")
            })
            .await
            .unwrap();
        assert_eq!(result, json!({"v": 1}));
    }

    #[tokio::test]
    async fn stale_refresh_honors_configured_ttl_not_the_default() {
        let store = Arc::new(InMemoryDurableCache::new());
        let key = format!("{}:key1", ANONYMOUS_USER);
        store.write(
            key.clone(),
            DurableEntry {
                payload: json!({"v": 1}),
                compressed: false,
                hash: content_hash(&json!({"v": 1})),
                created_at: Instant::now(),
                expires_at: Instant::now() + Duration::from_secs(60),
            },
        );
        let custom_ttl_secs = 120;
        let cache = TwoTierCache::new(store.clone(), true, custom_ttl_secs);

        let result = cache
            .get_or_refresh(ANONYMOUS_USER, "key1", || async { Ok(json!({"v": 2})) })
            .await
            .unwrap();
        assert_eq!(result, json!({"v": 1}));

        tokio::task::yield_now().await;
        tokio::task::yield_now().await;

        let refreshed = store.read(&key).expect("background refresh should have written an entry");
        let remaining = refreshed.expires_at.saturating_duration_since(Instant::now());
        assert!(
            remaining > Duration::from_secs(60),
            "refreshed entry should expire per the configured {custom_ttl_secs}s ttl, not the old 3600s default"
        );
    }

    #[tokio::test]
    async fn disabled_cache_forwards_synchronously() {
        let store = Arc::new(InMemoryDurableCache::new());
        let cache = TwoTierCache::new(store, false, 3600);
        let result = cache
            .get_or_refresh(ANONYMOUS_USER, "key1", || async { Ok(json!({"v": 2})) })
            .await
            .unwrap();
        assert_eq!(result, json!({"v": 2}));
    }

    #[test]
    fn anonymous_users_share_one_partition_key() {
        assert_eq!(
            TwoTierCache::<InMemoryDurableCache>::partition_key(ANONYMOUS_USER, "k"),
            "anonymous:k"
        );
    }
}
