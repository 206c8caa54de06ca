//! chat-gateway - multi-provider chat-completion gateway
//!
//! Async HTTP service normalizing OpenAI-style, Anthropic-style,
//! Google-style and aggregator chat APIs behind one streaming interface.

use actix_web::{web, HttpServer};
use chat_gateway::config::AppConfig;
use chat_gateway::server::{self, state::AppState};
use tracing::info;
use tracing_subscriber::EnvFilter;

fn init_logging(is_production: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = tracing_subscriber::fmt().with_env_filter(filter);
    if is_production {
        subscriber.json().init();
    } else {
        subscriber.init();
    }
}

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    let config = AppConfig::from_env();
    init_logging(config.server.is_production());

    let bind_addr = format!("0.0.0.0:{}", config.server.port);
    let port = config.server.port;

    info!(%bind_addr, "starting chat-gateway");

    let state = web::Data::new(AppState::new(config));

    HttpServer::new(move || server::create_app(state.clone()))
        .bind(&bind_addr)?
        .run()
        .await?;

    info!(port, "chat-gateway stopped");
    Ok(())
}
