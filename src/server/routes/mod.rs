//! HTTP route handlers, one module per resource family from spec.md §6.

pub mod chat;
pub mod health;
pub mod models;

use actix_web::web;

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.route("/health", web::get().to(health::health))
        .service(
            web::scope("/api")
                .route("/status", web::get().to(health::status))
                .route("/version", web::get().to(health::version))
                .route("/models", web::get().to(models::list_all))
                .route("/models/categories", web::get().to(models::categories))
                .route("/models/providers", web::get().to(models::providers))
                .route("/models/classified", web::get().to(models::classified))
                .route(
                    "/models/classified/criteria",
                    web::get().to(models::classified_criteria),
                )
                .route("/models/{provider}", web::get().to(models::one_provider))
                .route("/chat/completions", web::post().to(chat::completions))
                .route("/chat/stream", web::post().to(chat::stream))
                .route("/chat/stop", web::post().to(chat::stop))
                .route("/chat/capabilities", web::get().to(chat::capabilities)),
        );
}
