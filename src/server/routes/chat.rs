//! Chat completion endpoints (spec.md §4.6, §6): non-streaming and SSE
//! streaming completions, cooperative stop, and a capabilities probe.

use actix_web::{web, HttpRequest, HttpResponse};
use serde_json::json;

use crate::core::circuit_breaker::BREAKERS;
use crate::core::lifecycle::derive_request_id;
use crate::core::types::ChatRequest;
use crate::server::state::AppState;
use crate::utils::error::GatewayError;

const REQUEST_ID_HEADER: &str = "x-request-id";

fn transport_request_id(req: &HttpRequest) -> Option<String> {
    req.headers()
        .get(REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
}

/// Non-streaming `/api/chat/completions`. Provider errors surface as typed
/// HTTP statuses (401/404/429/502/503/...), never as a 200-OK error
/// envelope, per this gateway's error-taxonomy contract.
pub async fn completions(state: web::Data<AppState>, req: HttpRequest, body: web::Json<ChatRequest>) -> HttpResponse {
    let body = body.into_inner();
    let request_id = derive_request_id(body.request_id.as_deref(), transport_request_id(&req).as_deref());

    match state.lifecycle.complete(request_id.clone(), body).await {
        Ok(response) => HttpResponse::Ok()
            .insert_header((REQUEST_ID_HEADER, request_id))
            .json(response),
        Err(err) => error_response(err, &request_id),
    }
}

fn error_response(err: GatewayError, request_id: &str) -> HttpResponse {
    use actix_web::ResponseError;
    let mut response = err.error_response();
    response.headers_mut().insert(
        actix_web::http::header::HeaderName::from_static("x-request-id"),
        actix_web::http::header::HeaderValue::from_str(request_id)
            .unwrap_or_else(|_| actix_web::http::header::HeaderValue::from_static("invalid")),
    );
    response
}

/// Streaming `/api/chat/stream`. Headers disable proxy buffering so SSE
/// frames reach the client as they're produced; the body itself is the byte
/// stream the lifecycle engine assembles (data/heartbeat/event/done frames
/// already encoded).
pub async fn stream(state: web::Data<AppState>, req: HttpRequest, body: web::Json<ChatRequest>) -> HttpResponse {
    let body = body.into_inner();
    let request_id = derive_request_id(body.request_id.as_deref(), transport_request_id(&req).as_deref());

    match state.lifecycle.stream(request_id.clone(), body).await {
        Ok(byte_stream) => HttpResponse::Ok()
            .content_type("text/event-stream")
            .insert_header(("Cache-Control", "no-cache, no-transform"))
            .insert_header(("X-Accel-Buffering", "no"))
            .insert_header(("Connection", "keep-alive"))
            .insert_header((REQUEST_ID_HEADER, request_id))
            .streaming(byte_stream),
        Err(err) => error_response(err, &request_id),
    }
}

#[derive(serde::Deserialize)]
pub struct StopBody {
    #[serde(rename = "requestId")]
    pub request_id: String,
}

/// Idempotent `/api/chat/stop`: always reports success so callers can't
/// probe for the existence of a generation they don't own.
pub async fn stop(state: web::Data<AppState>, body: web::Json<StopBody>) -> HttpResponse {
    state.lifecycle.stop(&body.request_id);
    HttpResponse::Ok().json(json!({ "success": true, "requestId": body.request_id }))
}

/// `/api/chat/capabilities`: static completion capabilities plus live
/// breaker and cache stats, so clients can decide whether to fall back
/// before issuing a completion.
pub async fn capabilities(state: web::Data<AppState>) -> HttpResponse {
    let registry = &state.lifecycle.registry;
    let providers: Vec<String> = registry
        .providers()
        .into_iter()
        .map(|(name, _)| name)
        .filter(|name| name != "none")
        .collect();

    let breakers: Vec<_> = BREAKERS
        .names()
        .into_iter()
        .filter_map(|name| {
            BREAKERS.get(&name).map(|breaker| {
                let metrics = breaker.metrics();
                json!({
                    "name": name,
                    "state": metrics.state.map(|s| s.to_string()),
                    "failures": metrics.failures,
                    "successes": metrics.successes,
                })
            })
        })
        .collect();

    let cache_stats = state.lifecycle.cache.stats();

    HttpResponse::Ok().json(json!({
        "providers": providers,
        "defaultProvider": registry.default_name(),
        "streaming": true,
        "vision": true,
        "tools": false,
        "maxRequestBodyBytes": 10 * 1024 * 1024,
        "circuitBreakers": breakers,
        "cache": {
            "enabled": state.lifecycle.cache.is_enabled(),
            "hits": cache_stats.hits,
            "misses": cache_stats.misses,
            "size": cache_stats.size,
            "hitRate": cache_stats.hit_rate,
        },
    }))
}
