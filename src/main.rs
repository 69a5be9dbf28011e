use actix_cors::Cors;
use actix_web::{web, App, HttpServer};
use anyhow::Context;
use dotenv::dotenv;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{EnvFilter, FmtSubscriber};
use transcendence_realtime::config::CorsConfig;
use transcendence_realtime::{health_check, AppState, Settings};

fn cors(config: &CorsConfig) -> Cors {
    if !config.enabled {
        // CORS disabled - use most restrictive settings
        return Cors::default();
    }

    let cors = if config.allow_any_origin {
        Cors::default().allow_any_origin()
    } else {
        config
            .allowed_origins
            .iter()
            .fold(Cors::default(), |cors, origin| cors.allowed_origin(origin))
    };

    cors.allowed_methods(vec!["GET"])
        .allowed_headers(vec!["Authorization", "Content-Type"])
        .max_age(config.max_age as usize)
}

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenv().ok();

    // Initialize logging
    FmtSubscriber::builder()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .init();

    let config = Settings::new().context("failed to load configuration")?;
    info!("Configuration loaded successfully ({})", config.environment);

    let state = AppState::new(config.clone());

    let ws_listener = tokio::net::TcpListener::bind(config.websocket_addr())
        .await
        .with_context(|| format!("failed to bind WebSocket listener on {}", config.websocket_addr()))?;
    info!(
        "WebSocket endpoints ready at ws://{}{} and ws://{}{}<receiver>/",
        config.websocket_addr(),
        config.websocket.presence_path,
        config.websocket_addr(),
        config.websocket.chat_path_prefix,
    );
    let ws_server = Arc::new(state.websocket_server());
    tokio::spawn(ws_server.run(ws_listener));

    let listener = std::net::TcpListener::bind(config.http_addr())
        .with_context(|| format!("failed to bind HTTP listener on {}", config.http_addr()))?;
    info!("Starting HTTP server at {}", config.http_addr());

    let state = web::Data::new(state);
    let cors_config = config.cors.clone();
    HttpServer::new(move || {
        App::new()
            .wrap(cors(&cors_config))
            .app_data(state.clone())
            .route("/health", web::get().to(health_check))
    })
    .listen(listener)?
    .workers(config.server.workers as usize)
    .run()
    .await
    .context("HTTP server failed")?;

    Ok(())
}
