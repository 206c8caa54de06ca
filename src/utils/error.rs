//! Error taxonomy for the gateway.
//!
//! Every public boundary returns `Result<T>` rather than panicking; typed
//! variants map onto the HTTP status codes described in the spec's error
//! taxonomy and are the single place that decides what a client sees.

use actix_web::{HttpResponse, ResponseError, http::StatusCode};
use serde::Serialize;
use thiserror::Error;

/// Result type alias used throughout the crate.
pub type Result<T> = std::result::Result<T, GatewayError>;

/// Typed error taxonomy for the gateway.
#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Authentication error: {0}")]
    Authentication(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Rate limit exceeded: {0}")]
    RateLimit(String),

    #[error("Circuit breaker open for {0}")]
    CircuitOpen(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Provider error: {0}")]
    Provider(String),

    /// Upstream returned a concrete HTTP status we pass through verbatim.
    #[error("Provider HTTP error ({status}): {message}")]
    ProviderHttp { status: u16, message: String },

    #[error("Provider rate limited: {0}")]
    ProviderRateLimit(String),

    #[error("Provider authentication failed: {0}")]
    ProviderAuthentication(String),

    /// Raised while decoding an upstream SSE stream; only ever surfaced
    /// inside an `event: error` SSE frame, never as an HTTP status.
    #[error("Provider SSE error: {0}")]
    ProviderSse(String),

    /// Raised after response headers have already been flushed to the
    /// client; surfaced as an SSE error frame followed by `[DONE]`.
    #[error("Stream read error: {0}")]
    StreamRead(String),

    #[error("Provider not configured: {0}")]
    ProviderNotConfigured(String),

    #[error("Request aborted")]
    Aborted,

    #[error("Internal error: {0}")]
    Internal(String),
}

impl GatewayError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            GatewayError::Validation(_) => StatusCode::BAD_REQUEST,
            GatewayError::Authentication(_) => StatusCode::UNAUTHORIZED,
            GatewayError::Forbidden(_) => StatusCode::FORBIDDEN,
            GatewayError::NotFound(_) => StatusCode::NOT_FOUND,
            GatewayError::Conflict(_) => StatusCode::CONFLICT,
            GatewayError::RateLimit(_) => StatusCode::TOO_MANY_REQUESTS,
            GatewayError::CircuitOpen(_) => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            GatewayError::Provider(_) => StatusCode::BAD_GATEWAY,
            GatewayError::ProviderHttp { status, .. } => {
                StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_GATEWAY)
            }
            GatewayError::ProviderRateLimit(_) => StatusCode::TOO_MANY_REQUESTS,
            GatewayError::ProviderAuthentication(_) => StatusCode::UNAUTHORIZED,
            GatewayError::ProviderSse(_) => StatusCode::BAD_GATEWAY,
            GatewayError::StreamRead(_) => StatusCode::INTERNAL_SERVER_ERROR,
            GatewayError::ProviderNotConfigured(_) => StatusCode::BAD_REQUEST,
            GatewayError::Aborted => StatusCode::from_u16(499).unwrap(),
            GatewayError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            GatewayError::Validation(_) => "VALIDATION_ERROR",
            GatewayError::Authentication(_) => "AUTHENTICATION_ERROR",
            GatewayError::Forbidden(_) => "FORBIDDEN",
            GatewayError::NotFound(_) => "NOT_FOUND",
            GatewayError::Conflict(_) => "CONFLICT",
            GatewayError::RateLimit(_) => "RATE_LIMIT_EXCEEDED",
            GatewayError::CircuitOpen(_) => "CIRCUIT_OPEN",
            GatewayError::Timeout(_) => "TIMEOUT",
            GatewayError::Provider(_) => "PROVIDER_ERROR",
            GatewayError::ProviderHttp { .. } => "PROVIDER_HTTP_ERROR",
            GatewayError::ProviderRateLimit(_) => "PROVIDER_RATE_LIMIT",
            GatewayError::ProviderAuthentication(_) => "PROVIDER_AUTH_ERROR",
            GatewayError::ProviderSse(_) => "PROVIDER_SSE_ERROR",
            GatewayError::StreamRead(_) => "STREAM_READ_ERROR",
            GatewayError::ProviderNotConfigured(_) => "PROVIDER_NOT_CONFIGURED",
            GatewayError::Aborted => "REQUEST_ABORTED",
            GatewayError::Internal(_) => "INTERNAL_ERROR",
        }
    }
}

impl ResponseError for GatewayError {
    fn status_code(&self) -> StatusCode {
        GatewayError::status_code(self)
    }

    fn error_response(&self) -> HttpResponse {
        let body = ErrorResponse {
            error: ErrorDetail {
                code: self.code().to_string(),
                message: self.to_string(),
                status: self.status_code().as_u16(),
                details: None,
                timestamp: chrono::Utc::now().to_rfc3339(),
                path: None,
            },
        };
        HttpResponse::build(self.status_code()).json(body)
    }
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: ErrorDetail,
}

#[derive(Debug, Serialize)]
pub struct ErrorDetail {
    pub code: String,
    pub message: String,
    pub status: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Vec<FieldError>>,
    pub timestamp: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct FieldError {
    pub field: String,
    pub message: String,
}

/// Maps a raw upstream error string (HTTP body text, SDK error message) to a
/// typed `GatewayError`, per the case-insensitive rules in the spec's
/// mapper table. `status` is the upstream HTTP status when known.
pub fn map_provider_error(raw: &str, status: Option<u16>) -> GatewayError {
    let lower = raw.to_lowercase();

    if lower.contains("authentication")
        || lower.contains("api key")
        || (lower.contains("invalid_request_error") && lower.contains("api_key"))
    {
        return GatewayError::ProviderAuthentication(raw.to_string());
    }
    if lower.contains("rate limit") || lower.contains("quota exceeded") {
        return GatewayError::ProviderRateLimit(raw.to_string());
    }
    if lower.contains("model not found") || lower.contains("deployment does not exist") {
        return GatewayError::NotFound(raw.to_string());
    }
    if let Some(status) = status {
        return GatewayError::ProviderHttp {
            status,
            message: raw.to_string(),
        };
    }
    GatewayError::Provider(raw.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_authentication_errors() {
        let err = map_provider_error("Invalid API key provided", None);
        assert!(matches!(err, GatewayError::ProviderAuthentication(_)));
    }

    #[test]
    fn maps_rate_limit_errors() {
        let err = map_provider_error("Rate limit reached for requests", None);
        assert!(matches!(err, GatewayError::ProviderRateLimit(_)));
    }

    #[test]
    fn maps_not_found_errors() {
        let err = map_provider_error("The model `gpt-9` does not exist", None);
        // Doesn't match "model not found" literally; falls through to status.
        assert!(matches!(
            err,
            GatewayError::ProviderHttp { .. } | GatewayError::Provider(_)
        ));

        let err2 = map_provider_error("Model not found: gpt-9", None);
        assert!(matches!(err2, GatewayError::NotFound(_)));
    }

    #[test]
    fn falls_back_to_http_status_then_provider_error() {
        let err = map_provider_error("something odd happened", Some(503));
        assert!(matches!(err, GatewayError::ProviderHttp { status: 503, .. }));

        let err2 = map_provider_error("something odd happened", None);
        assert!(matches!(err2, GatewayError::Provider(_)));
    }

    #[test]
    fn status_codes_match_taxonomy() {
        assert_eq!(
            GatewayError::Validation("x".into()).status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            GatewayError::CircuitOpen("x".into()).status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(GatewayError::Aborted.status_code().as_u16(), 499);
    }
}
