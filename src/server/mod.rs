//! HTTP server assembly: middleware stack, route wiring, app state.

pub mod middleware;
pub mod routes;
pub mod state;

use actix_cors::Cors;
use actix_web::middleware::DefaultHeaders;
use actix_web::{web, App};
use tracing_actix_web::TracingLogger;

use self::middleware::request_id::RequestIdMiddleware;
use self::state::AppState;

/// Request bodies above this size are rejected with 413 before they reach a
/// handler; chat completion payloads can carry multiple base64-encoded
/// images so the limit is generous.
pub const MAX_JSON_BODY_BYTES: usize = 10 * 1024 * 1024;

/// Builds the Actix-web application: CORS, request tracing, a process
/// identifier header, request-id propagation, and every route family.
pub fn create_app(
    state: web::Data<AppState>,
) -> App<
    impl actix_web::dev::ServiceFactory<
        actix_web::dev::ServiceRequest,
        Config = (),
        Response = actix_web::dev::ServiceResponse<impl actix_web::body::MessageBody>,
        Error = actix_web::Error,
        InitError = (),
    >,
> {
    let cors = Cors::permissive();

    App::new()
        .app_data(state)
        .app_data(web::JsonConfig::default().limit(MAX_JSON_BODY_BYTES))
        .wrap(cors)
        .wrap(RequestIdMiddleware)
        .wrap(TracingLogger::default())
        .wrap(DefaultHeaders::new().add(("Server", "chat-gateway")))
        .configure(routes::configure)
}
