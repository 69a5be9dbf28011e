use config::{Config, ConfigBuilder, ConfigError, Environment, File};
use config::builder::DefaultState;
use serde::Deserialize;
use std::env;
use std::time::Duration;

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub workers: u32,
}

#[derive(Debug, Deserialize, Clone)]
pub struct WebSocketConfig {
    pub host: String,
    pub port: u16,
    pub heartbeat_interval_secs: u64,
    pub client_timeout_secs: u64,
    pub presence_path: String,
    pub chat_path_prefix: String,
}

impl WebSocketConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn client_timeout(&self) -> Duration {
        Duration::from_secs(self.client_timeout_secs)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct AuthConfig {
    pub jwt_secret: String,
    pub token_expiry_hours: i64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct CorsConfig {
    pub enabled: bool,
    pub allow_any_origin: bool,
    pub allowed_origins: Vec<String>,
    pub max_age: u32,
}

#[derive(Debug, Deserialize, Clone)]
pub struct Settings {
    pub environment: String,
    pub server: ServerConfig,
    pub websocket: WebSocketConfig,
    pub auth: AuthConfig,
    pub cors: CorsConfig,
}

/// Default values shared by the runtime and test loaders.
fn with_defaults(
    builder: ConfigBuilder<DefaultState>,
    environment: &str,
    jwt_secret: &str,
) -> Result<ConfigBuilder<DefaultState>, ConfigError> {
    builder
        .set_default("environment", environment)?
        .set_default("server.host", "127.0.0.1")?
        .set_default("server.port", 8080)?
        .set_default("server.workers", num_cpus::get() as i64)?
        .set_default("websocket.host", "127.0.0.1")?
        .set_default("websocket.port", 8081)?
        .set_default("websocket.heartbeat_interval_secs", 30)?
        .set_default("websocket.client_timeout_secs", 60)?
        .set_default("websocket.presence_path", "/ws/online_users/")?
        .set_default("websocket.chat_path_prefix", "/ws/chat/")?
        .set_default("auth.jwt_secret", jwt_secret)?
        .set_default("auth.token_expiry_hours", 24)?
        .set_default("cors.enabled", true)?
        .set_default("cors.allow_any_origin", false)?
        .set_default("cors.allowed_origins", vec!["http://localhost:5173", "http://127.0.0.1:5173"])?
        .set_default("cors.max_age", 3600)
}

fn env_source(prefix: &str) -> Environment {
    // E.g., `APP_WEBSOCKET__PORT=9001` would set `Settings.websocket.port`
    Environment::with_prefix(prefix)
        .separator("__")
        .list_separator(",")
        .with_list_parse_key("cors.allowed_origins")
        .try_parsing(true)
}

impl Settings {
    pub fn new() -> Result<Self, ConfigError> {
        let run_mode = env::var("RUN_MODE").unwrap_or_else(|_| "development".into());

        with_defaults(Config::builder(), "development", "development_secret")?
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name(&format!("config/{}", run_mode)).required(false))
            .add_source(env_source("app"))
            .build()?
            .try_deserialize()
    }

    pub fn new_for_test() -> Result<Self, ConfigError> {
        Self::with_env_prefix("app")
    }

    /// Defaults overlaid with environment variables under `prefix` only.
    pub fn with_env_prefix(prefix: &str) -> Result<Self, ConfigError> {
        with_defaults(Config::builder(), "test", "test_secret")?
            .add_source(env_source(prefix))
            .build()?
            .try_deserialize()
    }

    pub fn websocket_addr(&self) -> String {
        format!("{}:{}", self.websocket.host, self.websocket.port)
    }

    pub fn http_addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}
