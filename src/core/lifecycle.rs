//! Request Lifecycle Engine (C6): in-flight registry, request-id
//! derivation, non-stream and streaming completion orchestration, SSE
//! emission with heartbeat/inactivity timers, and `/chat/stop` cancellation.

use dashmap::DashMap;
use futures::StreamExt;
use serde_json::json;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, warn};

use crate::core::cache::{generate_request_key, ResponseCache};
use crate::core::circuit_breaker::{CircuitBreakerConfig, BREAKERS};
use crate::core::providers::StreamItem;
use crate::core::registry::ProviderRegistry;
use crate::core::sse::{encode_data, encode_done, encode_event, encode_heartbeat};
use crate::core::types::{ChatRequest, StandardResponse};
use crate::utils::error::{GatewayError, Result};

pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);
pub const INACTIVITY_CHECK_INTERVAL: Duration = Duration::from_secs(60);
pub const INACTIVITY_TIMEOUT: Duration = Duration::from_secs(120);

/// A cooperative cancellation handle for one in-flight generation. Cheap to
/// clone; `cancel()` is idempotent.
#[derive(Clone)]
pub struct CancellationHandle {
    cancelled: Arc<AtomicBool>,
}

impl CancellationHandle {
    fn new() -> Self {
        Self {
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// Process-wide map of active generations to cancellation handles, keyed by
/// `requestId`. Concurrent map; readers on unrelated keys never block.
#[derive(Default)]
pub struct InFlightRegistry {
    handles: DashMap<String, CancellationHandle>,
}

impl InFlightRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, request_id: String) -> CancellationHandle {
        let handle = CancellationHandle::new();
        self.handles.insert(request_id, handle.clone());
        handle
    }

    pub fn remove(&self, request_id: &str) {
        self.handles.remove(request_id);
    }

    /// Cancels and removes the entry for `request_id`. Returns `true` iff a
    /// generation was actually found; callers must still report success for
    /// a missing id to avoid leaking generation existence.
    pub fn cancel(&self, request_id: &str) -> bool {
        if let Some((_, handle)) = self.handles.remove(request_id) {
            handle.cancel();
            true
        } else {
            false
        }
    }

    pub fn contains(&self, request_id: &str) -> bool {
        self.handles.contains_key(request_id)
    }
}

/// Derives the request id for a new generation: client-supplied
/// `body.requestId` wins, otherwise a transport-supplied id, otherwise a
/// generated `"req_<ts>_<rand>"`.
pub fn derive_request_id(body_request_id: Option<&str>, transport_request_id: Option<&str>) -> String {
    if let Some(id) = body_request_id {
        if !id.is_empty() {
            return id.to_string();
        }
    }
    if let Some(id) = transport_request_id {
        if !id.is_empty() {
            return id.to_string();
        }
    }
    let ts = chrono::Utc::now().timestamp_millis();
    let rand: u32 = rand::random();
    format!("req_{}_{:08x}", ts, rand)
}

/// Splits `model` at the first `/`; no slash means the default provider.
pub fn parse_model(model: &str) -> (Option<&str>, &str) {
    match model.split_once('/') {
        Some((provider, name)) => (Some(provider), name),
        None => (None, model),
    }
}

pub struct LifecycleEngine {
    pub registry: Arc<ProviderRegistry>,
    pub cache: Arc<ResponseCache>,
    pub in_flight: Arc<InFlightRegistry>,
}

impl LifecycleEngine {
    pub fn new(registry: Arc<ProviderRegistry>, cache: Arc<ResponseCache>) -> Self {
        Self {
            registry,
            cache,
            in_flight: Arc::new(InFlightRegistry::new()),
        }
    }

    /// Non-streaming chat completion: cache lookup, breaker-wrapped
    /// upstream call, cache write-back. Returns `Err(GatewayError::Aborted)`
    /// when the handle was cancelled mid-call (mapped to HTTP 499 by
    /// callers).
    pub async fn complete(
        &self,
        request_id: String,
        request: ChatRequest,
    ) -> Result<StandardResponse> {
        request.validate()?;
        let handle = self.in_flight.register(request_id.clone());
        let (provider_name, model_name) = parse_model(&request.model);
        let provider = match self.registry.get_provider(provider_name) {
            Ok(p) => p,
            Err(err) => {
                self.in_flight.remove(&request_id);
                return Err(err);
            }
        };
        let resolved_provider = provider.name().to_string();
        let model_name = if model_name.is_empty() {
            provider.default_model().to_string()
        } else {
            model_name.to_string()
        };

        let nocache = request.nocache.unwrap_or(false);
        if self.cache.is_enabled() && !nocache {
            let key = generate_request_key(&resolved_provider, &model_name, &request);
            if let Some(cached) = self.cache.get(&key) {
                self.in_flight.remove(&request_id);
                if let Ok(mut response) = serde_json::from_value::<StandardResponse>(cached) {
                    response.cached = Some(true);
                    return Ok(response);
                }
            }
        }

        let breaker_name = format!("{}-completion", resolved_provider);
        let breaker = BREAKERS.get_or_create(&breaker_name, CircuitBreakerConfig::default());

        let model_for_call = model_name.clone();
        let result = breaker
            .call(
                || async { provider.chat_completion(&model_for_call, &request).await },
                None::<fn(&GatewayError) -> Result<StandardResponse>>,
            )
            .await;

        if handle.is_cancelled() {
            self.in_flight.remove(&request_id);
            return Err(GatewayError::Aborted);
        }

        self.in_flight.remove(&request_id);

        match result {
            Ok(response) => {
                if self.cache.is_enabled() && !nocache {
                    let key = generate_request_key(&resolved_provider, &model_name, &request);
                    if let Ok(value) = serde_json::to_value(&response) {
                        self.cache.set(key, value, crate::core::cache::DEFAULT_TTL_SECS, "completion");
                    }
                }
                Ok(response)
            }
            Err(err) => Err(err),
        }
    }

    /// Idempotent stop: cancels and removes the handle if present. Returns
    /// success regardless so callers never learn whether a generation
    /// actually existed.
    pub fn stop(&self, request_id: &str) {
        self.in_flight.cancel(request_id);
    }

    /// Starts a streaming completion and returns a byte stream of fully
    /// framed SSE data ready to write to the response body. The returned
    /// stream bridges the provider's `ChunkStream` (itself driven on a
    /// background task) through an mpsc channel so heartbeat/inactivity
    /// timers can interleave writes without holding a lock on the
    /// provider iterator.
    pub async fn stream(
        &self,
        request_id: String,
        request: ChatRequest,
    ) -> Result<ReceiverStream<std::result::Result<bytes::Bytes, std::io::Error>>> {
        request.validate()?;
        let handle = self.in_flight.register(request_id.clone());
        let (provider_name, model_name) = parse_model(&request.model);
        let provider = match self.registry.get_provider(provider_name) {
            Ok(p) => p,
            Err(err) => {
                self.in_flight.remove(&request_id);
                return Err(err);
            }
        };
        let model_name = if model_name.is_empty() {
            provider.default_model().to_string()
        } else {
            model_name.to_string()
        };

        let chunk_stream = match provider.chat_completion_stream(&model_name, &request).await {
            Ok(s) => s,
            Err(err) => {
                self.in_flight.remove(&request_id);
                return Err(err);
            }
        };

        let (tx, rx) = mpsc::channel::<std::result::Result<bytes::Bytes, std::io::Error>>(64);
        let in_flight = self.in_flight.clone();
        let provider_label = provider.name();
        let model_label = model_name.clone();

        tokio::spawn(async move {
            tokio::pin!(chunk_stream);
            let mut ticker = tokio::time::interval(HEARTBEAT_INTERVAL);
            let mut inactivity_checker = tokio::time::interval(INACTIVITY_CHECK_INTERVAL);
            let mut last_activity = Instant::now();
            let mut ttfb_recorded = false;
            let start = Instant::now();

            loop {
                if handle.is_cancelled() {
                    let _ = tx
                        .send(Ok(encode_event(
                            "abort",
                            &json!({"type": "abort", "message": "Request aborted by client"}),
                        )))
                        .await;
                    break;
                }

                tokio::select! {
                    biased;

                    item = chunk_stream.next() => {
                        match item {
                            Some(StreamItem::Chunk(mut chunk)) => {
                                last_activity = Instant::now();
                                if !ttfb_recorded {
                                    chunk.latency = Some(start.elapsed().as_millis() as u64);
                                    ttfb_recorded = true;
                                }
                                if tx.send(Ok(encode_data(&chunk))).await.is_err() {
                                    break;
                                }
                            }
                            Some(StreamItem::Error(message)) => {
                                warn!(request_id = %request_id, error = %message, "upstream stream error");
                                let _ = tx
                                    .send(Ok(encode_event(
                                        "error",
                                        &json!({
                                            "code": "PROVIDER_SSE_ERROR",
                                            "message": message,
                                            "status": 502,
                                            "provider": provider_label,
                                            "model": model_label,
                                        }),
                                    )))
                                    .await;
                                let _ = tx.send(Ok(encode_done())).await;
                                break;
                            }
                            None => {
                                let _ = tx.send(Ok(encode_done())).await;
                                break;
                            }
                        }
                    }

                    _ = ticker.tick() => {
                        if tx.send(Ok(encode_heartbeat())).await.is_err() {
                            break;
                        }
                    }

                    _ = inactivity_checker.tick() => {
                        if last_activity.elapsed() > INACTIVITY_TIMEOUT {
                            warn!(request_id = %request_id, "stream closed: inactivity timeout");
                            let _ = tx
                                .send(Ok(encode_event(
                                    "error",
                                    &json!({
                                        "code": "TIMEOUT",
                                        "message": "inactivity timeout",
                                        "status": 504,
                                        "provider": provider_label,
                                        "model": model_label,
                                    }),
                                )))
                                .await;
                            let _ = tx.send(Ok(encode_done())).await;
                            break;
                        }
                    }
                }
            }

            in_flight.remove(&request_id);
            debug!(request_id = %request_id, "stream closed");
        });

        Ok(ReceiverStream::new(rx))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derives_request_id_from_body_first() {
        let id = derive_request_id(Some("client-id"), Some("transport-id"));
        assert_eq!(id, "client-id");
    }

    #[test]
    fn derives_request_id_from_transport_when_body_absent() {
        let id = derive_request_id(None, Some("transport-id"));
        assert_eq!(id, "transport-id");
    }

    #[test]
    fn generates_request_id_when_both_absent() {
        let id = derive_request_id(None, None);
        assert!(id.starts_with("req_"));
    }

    #[test]
    fn parses_model_with_and_without_provider() {
        assert_eq!(parse_model("openai/gpt-4o"), (Some("openai"), "gpt-4o"));
        assert_eq!(parse_model("gpt-4o"), (None, "gpt-4o"));
    }

    #[test]
    fn stop_on_unknown_request_id_is_a_noop_success() {
        let registry = InFlightRegistry::new();
        assert!(!registry.cancel("never-registered"));
    }

    #[test]
    fn stop_is_idempotent() {
        let registry = InFlightRegistry::new();
        registry.register("r1".to_string());
        assert!(registry.cancel("r1"));
        assert!(!registry.cancel("r1"));
    }

    #[test]
    fn register_then_remove_clears_entry() {
        let registry = InFlightRegistry::new();
        registry.register("r1".to_string());
        assert!(registry.contains("r1"));
        registry.remove("r1");
        assert!(!registry.contains("r1"));
    }

    #[test]
    fn cancellation_handle_is_idempotent() {
        let handle = CancellationHandle::new();
        assert!(!handle.is_cancelled());
        handle.cancel();
        handle.cancel();
        assert!(handle.is_cancelled());
    }

    #[tokio::test]
    async fn complete_rejects_empty_messages_without_registering_a_handle() {
        use crate::core::registry::ProviderRegistry;
        use crate::core::types::ChatRequest;

        let engine = LifecycleEngine::new(
            Arc::new(ProviderRegistry::from_env()),
            Arc::new(ResponseCache::new(false)),
        );
        let request = ChatRequest {
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
        let result = engine.complete("r1".to_string(), request).await;
        assert!(matches!(result, Err(GatewayError::Validation(_))));
        assert!(!engine.in_flight.contains("r1"));
    }
}
