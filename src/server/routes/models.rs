//! Model catalog endpoints (spec.md §6): aggregated/per-provider listings,
//! capability info, and the classifier-backed category views.

use actix_web::{web, HttpResponse, ResponseError};
use serde_json::{json, Value};

use crate::core::classification::{build_model_list, ANONYMOUS_USER};
use crate::server::state::AppState;
use crate::utils::error::{ErrorDetail, ErrorResponse, GatewayError};

/// `{models:{provider:{models,defaultModel}}, providers:[...], default:{provider,model}}`
pub async fn list_all(state: web::Data<AppState>) -> HttpResponse {
    let registry = &state.lifecycle.registry;
    let models = registry.providers_info().await;
    let providers: Vec<String> = registry
        .providers()
        .into_iter()
        .map(|(name, _)| name)
        .filter(|name| name != "none")
        .collect();
    let default_provider = registry.default_name().to_string();
    let default_model = registry
        .get_provider(Some(&default_provider))
        .map(|p| p.default_model().to_string())
        .unwrap_or_default();

    HttpResponse::Ok().json(json!({
        "models": models,
        "providers": providers,
        "default": {"provider": default_provider, "model": default_model},
    }))
}

pub async fn one_provider(state: web::Data<AppState>, path: web::Path<String>) -> HttpResponse {
    let provider_name = path.into_inner();
    let registry = &state.lifecycle.registry;
    match registry.get_provider(Some(&provider_name)) {
        Ok(provider) if provider_name != "none" => HttpResponse::Ok().json(json!({
            "models": provider.known_models(),
            "defaultModel": provider.default_model(),
        })),
        _ => GatewayError::NotFound(format!("unknown provider: {}", provider_name)).error_response(),
    }
}

pub async fn providers(state: web::Data<AppState>) -> HttpResponse {
    let registry = &state.lifecycle.registry;
    let info: Vec<Value> = registry
        .providers()
        .into_iter()
        .filter(|(name, _)| name != "none")
        .map(|(name, provider)| {
            json!({
                "name": name,
                "configured": provider.is_configured(),
                "defaultModel": provider.default_model(),
                "modelCount": provider.known_models().len(),
            })
        })
        .collect();
    HttpResponse::Ok().json(json!({ "providers": info }))
}

/// Hardcoded fallback list used when the classification service is disabled
/// or unreachable; keeps this endpoint useful without the external
/// dependency, per spec.md's "delegates to classified if service available,
/// else hardcoded fallback list."
fn hardcoded_categories() -> Value {
    json!({
        "classifiedGroups": [
            {"propertyName": "capability", "propertyValue": "vision", "models": []},
            {"propertyName": "capability", "propertyValue": "tools", "models": []},
        ],
        "availableProperties": ["capability", "provider"],
        "errorMessage": null,
        "hierarchicalGroups": [],
        "source": "fallback",
    })
}

pub async fn categories(state: web::Data<AppState>) -> HttpResponse {
    if !state.classification.is_enabled() {
        return HttpResponse::Ok().json(hardcoded_categories());
    }
    match classify_all(&state).await {
        Ok(value) => HttpResponse::Ok().json(value),
        Err(_) => HttpResponse::Ok().json(hardcoded_categories()),
    }
}

pub async fn classified(state: web::Data<AppState>) -> HttpResponse {
    if !state.classification.is_enabled() {
        return classification_disabled_response();
    }
    match classify_all(&state).await {
        Ok(value) => HttpResponse::Ok().json(value),
        Err(err) => classification_error_response(err),
    }
}

async fn classify_all(state: &AppState) -> Result<Value, GatewayError> {
    let registry = &state.lifecycle.registry;
    let providers_info = registry.providers_info().await;
    let default_provider = registry.default_name().to_string();
    let default_model = registry
        .get_provider(Some(&default_provider))
        .map(|p| p.default_model().to_string())
        .unwrap_or_default();
    let model_list = build_model_list(&providers_info, &default_provider, &default_model);

    let classification = state.classification.clone();
    let value = state
        .classification_cache
        .get_or_refresh(ANONYMOUS_USER, "classified-models", move || async move {
            let response = classification.classify_models(&model_list).await?;
            serde_json::to_value(response).map_err(|e| GatewayError::Internal(e.to_string()))
        })
        .await?;
    Ok(value)
}

#[derive(serde::Deserialize)]
pub struct CriteriaBody {
    #[serde(default)]
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

pub async fn classified_criteria(state: web::Data<AppState>, body: web::Json<CriteriaBody>) -> HttpResponse {
    if !state.classification.is_enabled() {
        return classification_disabled_response();
    }
    let body = body.into_inner();
    if body.properties.is_empty() {
        return GatewayError::Validation("criteria.properties must not be empty".to_string()).error_response();
    }

    let criteria = crate::core::classification::ClassificationCriteria {
        properties: body.properties,
        include_experimental: body.include_experimental,
        include_deprecated: body.include_deprecated,
        min_context_size: body.min_context_size,
        hierarchical: body.hierarchical,
    };
    let cache_key = crate::core::cache::generate_key(&serde_json::to_value(&criteria).unwrap_or(Value::Null), &[]);

    let classification = state.classification.clone();
    let result = state
        .classification_cache
        .get_or_refresh(ANONYMOUS_USER, &cache_key, move || async move {
            let response = classification.classify_models_with_criteria(&criteria).await?;
            serde_json::to_value(response).map_err(|e| GatewayError::Internal(e.to_string()))
        })
        .await;

    match result {
        Ok(value) => HttpResponse::Ok().json(value),
        Err(err) => classification_error_response(err),
    }
}

/// Classification errors otherwise use `GatewayError`'s own status/code
/// mapping (`CircuitOpen` -> 503, `Timeout` -> 504, everything else -> its
/// taxonomy entry, typically `Provider`/`ProviderHttp` -> 502/upstream
/// status). "Disabled" has no `GatewayError` counterpart since it's a
/// gateway-side feature flag rather than an upstream failure, so it's built
/// from the same `ErrorResponse` envelope directly.
fn classification_error_response(err: GatewayError) -> HttpResponse {
    err.error_response()
}

fn classification_disabled_response() -> HttpResponse {
    HttpResponse::NotImplemented().json(ErrorResponse {
        error: ErrorDetail {
            code: "NOT_IMPLEMENTED".to_string(),
            message: "classification service disabled".to_string(),
            status: 501,
            details: None,
            timestamp: chrono::Utc::now().to_rfc3339(),
            path: None,
        },
    })
}
