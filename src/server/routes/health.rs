//! Liveness, status, and version endpoints (spec.md §6).

use actix_web::{web, HttpResponse};
use serde_json::json;

use crate::server::state::AppState;

pub async fn health(_state: web::Data<AppState>) -> HttpResponse {
    HttpResponse::Ok().json(json!({
        "status": "OK",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

pub async fn status(_state: web::Data<AppState>) -> HttpResponse {
    HttpResponse::Ok().json(json!({
        "status": "ok",
        "timestamp": chrono::Utc::now().to_rfc3339(),
    }))
}

pub async fn version(_state: web::Data<AppState>) -> HttpResponse {
    HttpResponse::Ok().json(json!({
        "version": env!("CARGO_PKG_VERSION"),
        "apiVersion": "v1",
        "timestamp": chrono::Utc::now().to_rfc3339(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::body::to_bytes;

    #[tokio::test]
    async fn health_reports_ok_status() {
        let state = web::Data::new(AppState::new(crate::config::AppConfig::from_env()));
        let response = health(state).await;
        assert_eq!(response.status(), actix_web::http::StatusCode::OK);
        let body = to_bytes(response.into_body()).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["status"], "OK");
    }
}
