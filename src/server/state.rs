//! Application state shared across HTTP handlers.

use std::sync::Arc;

use crate::config::AppConfig;
use crate::core::cache::ResponseCache;
use crate::core::classification::{ClassificationClient, ClassificationConfig, InMemoryDurableCache, TwoTierCache};
use crate::core::lifecycle::LifecycleEngine;
use crate::core::registry::ProviderRegistry;

/// Shared resources every route handler needs. Cheap to clone: every field
/// is an `Arc`.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub lifecycle: Arc<LifecycleEngine>,
    pub classification: Arc<ClassificationClient>,
    pub classification_cache: Arc<TwoTierCache<InMemoryDurableCache>>,
}

impl AppState {
    pub fn new(config: AppConfig) -> Self {
        let registry = Arc::new(ProviderRegistry::from_env());
        let cache = Arc::new(ResponseCache::new(config.cache.enabled));
        cache.clone().spawn_sweeper(config.cache.sweep_interval_ms);

        let lifecycle = Arc::new(LifecycleEngine::new(registry, cache));

        let classification = Arc::new(ClassificationClient::new(ClassificationConfig {
            enabled: config.classification.enabled,
            base_url: config.classification.base_url(),
        }));
        let durable_store = Arc::new(InMemoryDurableCache::new());
        let classification_cache = Arc::new(TwoTierCache::new(
            durable_store,
            config.cache.firestore_enabled,
            config.cache.firestore_ttl_secs,
        ));

        Self {
            config: Arc::new(config),
            lifecycle,
            classification,
            classification_cache,
        }
    }
}
