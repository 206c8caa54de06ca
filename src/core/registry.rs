//! Provider registry (C5): reads `<PROVIDER>_API_KEY` from the environment,
//! lazily instantiates adapters, and picks the default provider by the
//! fixed priority `openai -> anthropic -> gemini -> openrouter -> first
//! available -> "none"`.

use async_trait::async_trait;
use dashmap::DashMap;
use futures::future::join_all;
use serde_json::Value;
use std::sync::Arc;

use crate::core::providers::anthropic::{AnthropicConfig, AnthropicProvider};
use crate::core::providers::gemini::{GeminiConfig, GeminiProvider};
use crate::core::providers::openai::{OpenAiConfig, OpenAiProvider};
use crate::core::providers::openrouter::{OpenRouterConfig, OpenRouterProvider};
use crate::core::providers::{ChunkStream, Provider};
use crate::core::types::{ChatRequest, ModelInfo, StandardChunk, StandardResponse};
use crate::utils::error::{GatewayError, Result};

/// Always-instantiable placeholder used when no real provider is configured.
/// Never forwards a completion; its model list is empty.
pub struct NoneProvider;

#[async_trait]
impl Provider for NoneProvider {
    fn name(&self) -> &'static str {
        "none"
    }

    fn default_model(&self) -> &str {
        ""
    }

    fn is_configured(&self) -> bool {
        true
    }

    fn known_models(&self) -> Vec<ModelInfo> {
        Vec::new()
    }

    async fn chat_completion(&self, _model: &str, _request: &ChatRequest) -> Result<StandardResponse> {
        Err(GatewayError::ProviderNotConfigured(
            "no provider is configured".to_string(),
        ))
    }

    async fn chat_completion_stream(&self, _model: &str, _request: &ChatRequest) -> Result<ChunkStream> {
        Err(GatewayError::ProviderNotConfigured(
            "no provider is configured".to_string(),
        ))
    }
}

/// Priority order used to pick the default provider when the client doesn't
/// specify one.
const DEFAULT_PRIORITY: &[&str] = &["openai", "anthropic", "gemini", "openrouter"];

pub struct ProviderRegistry {
    providers: DashMap<String, Arc<dyn Provider>>,
    default_name: String,
}

impl ProviderRegistry {
    /// Builds every configured adapter from the environment up front (cheap:
    /// each adapter is just a client + static config) and computes the
    /// default provider name per the fixed priority list.
    pub fn from_env() -> Self {
        let providers: DashMap<String, Arc<dyn Provider>> = DashMap::new();

        let openai = Arc::new(OpenAiProvider::new(OpenAiConfig::from_env()));
        let anthropic = Arc::new(AnthropicProvider::new(AnthropicConfig::from_env()));
        let gemini = Arc::new(GeminiProvider::new(GeminiConfig::from_env()));
        let openrouter = Arc::new(OpenRouterProvider::new(OpenRouterConfig::from_env()));

        providers.insert("openai".to_string(), openai as Arc<dyn Provider>);
        providers.insert("anthropic".to_string(), anthropic as Arc<dyn Provider>);
        providers.insert("gemini".to_string(), gemini as Arc<dyn Provider>);
        providers.insert("openrouter".to_string(), openrouter as Arc<dyn Provider>);
        providers.insert("none".to_string(), Arc::new(NoneProvider) as Arc<dyn Provider>);

        let default_name = DEFAULT_PRIORITY
            .iter()
            .find(|name| {
                providers
                    .get(**name)
                    .map(|p| p.is_configured())
                    .unwrap_or(false)
            })
            .map(|s| s.to_string())
            .or_else(|| {
                providers
                    .iter()
                    .find(|entry| entry.key() != "none" && entry.value().is_configured())
                    .map(|entry| entry.key().clone())
            })
            .unwrap_or_else(|| "none".to_string());

        Self {
            providers,
            default_name,
        }
    }

    pub fn default_name(&self) -> &str {
        &self.default_name
    }

    /// Returns the named provider, or the default when `name` is `None`.
    /// Fails for a name the registry doesn't know, or one that isn't
    /// configured (no API key).
    pub fn get_provider(&self, name: Option<&str>) -> Result<Arc<dyn Provider>> {
        let resolved = name.unwrap_or(&self.default_name);
        match self.providers.get(resolved) {
            Some(provider) if provider.is_configured() || resolved == "none" => {
                Ok(provider.clone())
            }
            Some(_) => Err(GatewayError::ProviderNotConfigured(resolved.to_string())),
            None => Err(GatewayError::ProviderNotConfigured(resolved.to_string())),
        }
    }

    pub fn providers(&self) -> Vec<(String, Arc<dyn Provider>)> {
        self.providers
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect()
    }

    /// Runs each configured provider's `known_models()` (no network call in
    /// this implementation; stays in step with the upstream `getModels()`
    /// contract for providers backed by a live catalog endpoint) in
    /// parallel, capturing per-provider failures instead of failing the
    /// whole call.
    pub async fn providers_info(&self) -> Value {
        let entries: Vec<(String, Arc<dyn Provider>)> = self
            .providers
            .iter()
            .filter(|e| e.key() != "none")
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();

        let futures = entries.into_iter().map(|(name, provider)| async move {
            if !provider.is_configured() {
                return (
                    name,
                    serde_json::json!({"error": "not configured"}),
                );
            }
            let models = provider.known_models();
            (
                name,
                serde_json::json!({
                    "models": models,
                    "defaultModel": provider.default_model(),
                }),
            )
        });

        let results = join_all(futures).await;
        let mut map = serde_json::Map::new();
        for (name, value) in results {
            map.insert(name, value);
        }
        Value::Object(map)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    static ENV_LOCK: Mutex<()> = Mutex::new(());

    fn clear_provider_env() {
        for var in [
            "OPENAI_API_KEY",
            "ANTHROPIC_API_KEY",
            "GEMINI_API_KEY",
            "OPENROUTER_API_KEY",
        ] {
            std::env::remove_var(var);
        }
    }

    #[test]
    fn defaults_to_none_when_nothing_configured() {
        let _guard = ENV_LOCK.lock().unwrap();
        clear_provider_env();
        let registry = ProviderRegistry::from_env();
        assert_eq!(registry.default_name(), "none");
    }

    #[test]
    fn prefers_openai_over_other_configured_providers() {
        let _guard = ENV_LOCK.lock().unwrap();
        clear_provider_env();
        std::env::set_var("OPENAI_API_KEY", "k");
        std::env::set_var("ANTHROPIC_API_KEY", "k");
        let registry = ProviderRegistry::from_env();
        assert_eq!(registry.default_name(), "openai");
        clear_provider_env();
    }

    #[test]
    fn falls_back_to_first_available_outside_priority_order() {
        let _guard = ENV_LOCK.lock().unwrap();
        clear_provider_env();
        std::env::set_var("OPENROUTER_API_KEY", "k");
        let registry = ProviderRegistry::from_env();
        assert_eq!(registry.default_name(), "openrouter");
        clear_provider_env();
    }

    #[test]
    fn none_provider_is_always_gettable() {
        let _guard = ENV_LOCK.lock().unwrap();
        clear_provider_env();
        let registry = ProviderRegistry::from_env();
        assert!(registry.get_provider(Some("none")).is_ok());
    }

    #[test]
    fn unconfigured_named_provider_errors() {
        let _guard = ENV_LOCK.lock().unwrap();
        clear_provider_env();
        let registry = ProviderRegistry::from_env();
        assert!(registry.get_provider(Some("openai")).is_err());
    }
}
