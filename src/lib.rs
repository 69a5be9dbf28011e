pub mod auth;
pub mod config;
pub mod error;
pub mod websocket;

use std::sync::Arc;
use actix_web::{web, HttpResponse};

pub use error::AppError;
pub type Result<T> = std::result::Result<T, AppError>;
pub use config::Settings;

pub use auth::{AuthService, Identity};
pub use websocket::{ChatRelay, PresenceHub, WebSocketServer};

/// Health check endpoint handler
/// Returns a JSON response with server status, timestamp and live counts
pub async fn health_check(state: web::Data<AppState>) -> HttpResponse {
    HttpResponse::Ok().json(serde_json::json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "online_users": state.presence.online_count().await,
        "connections": state.presence.connection_count().await + state.chat.connection_count().await,
    }))
}

/// Application state shared across all components.
///
/// Built once at start-up; the hub and relay live as long as the process.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Settings>,
    pub presence: Arc<PresenceHub>,
    pub chat: Arc<ChatRelay>,
    pub auth_service: Arc<AuthService>,
}

impl AppState {
    pub fn new(config: Settings) -> Self {
        let auth_service = AuthService::new(
            config.auth.jwt_secret.clone(),
            config.auth.token_expiry_hours,
        );

        Self {
            config: Arc::new(config),
            presence: Arc::new(PresenceHub::new()),
            chat: Arc::new(ChatRelay::new()),
            auth_service: Arc::new(auth_service),
        }
    }

    pub fn websocket_server(&self) -> WebSocketServer {
        WebSocketServer::new(
            self.presence.clone(),
            self.chat.clone(),
            self.auth_service.clone(),
            self.config.websocket.clone(),
        )
    }
}
