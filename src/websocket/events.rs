use serde::{Deserialize, Serialize};
use crate::error::WebSocketError;

/// Events pushed from the server to connected clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEvent {
    UserLogin { username: String },
    UserLogout { username: String },
    OnlineUsersList { users: Vec<String> },
    ChatMessage { username: String, message: String },
    Error { message: String },
}

impl ServerEvent {
    pub fn to_text(&self) -> Result<String, WebSocketError> {
        serde_json::to_string(self)
            .map_err(|e| WebSocketError::InvalidFormat(format!("Failed to serialize event: {}", e)))
    }
}

/// Inbound chat payload as sent by the browser. Every field is optional
/// on the wire so that a missing field is reported as a validation
/// failure instead of a parse failure.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ChatPayload {
    pub message: Option<String>,
    pub username: Option<String>,
    pub receiver: Option<String>,
}

/// A chat payload that passed validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidChat {
    pub message: String,
    pub username: String,
    pub receiver: String,
}

impl ChatPayload {
    pub fn parse(raw: &str) -> Result<ValidChat, WebSocketError> {
        let payload: ChatPayload = serde_json::from_str(raw)
            .map_err(|e| WebSocketError::InvalidFormat(e.to_string()))?;
        payload.validate()
    }

    pub fn validate(self) -> Result<ValidChat, WebSocketError> {
        let message = self.message
            .filter(|m| !m.trim().is_empty())
            .ok_or_else(|| WebSocketError::InvalidFormat("message must not be empty".to_string()))?;
        let username = non_empty(self.username, "username")?;
        let receiver = non_empty(self.receiver, "receiver")?;

        Ok(ValidChat { message, username, receiver })
    }
}

fn non_empty(value: Option<String>, field: &str) -> Result<String, WebSocketError> {
    value
        .filter(|v| !v.is_empty())
        .ok_or_else(|| WebSocketError::InvalidFormat(format!("missing field `{}`", field)))
}
