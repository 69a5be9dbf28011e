use std::fmt;
use async_trait::async_trait;
use uuid::Uuid;
use crate::error::WebSocketError;
use super::events::ServerEvent;
use super::pool::Outbound;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Open,
    Closed,
}

/// What a hub or relay gets to see of a connection: who owns it and
/// where to push frames.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    id: ConnectionId,
    identity: String,
    tx: Outbound,
}

impl ConnectionHandle {
    pub fn new(identity: impl Into<String>, tx: Outbound) -> Self {
        Self {
            id: ConnectionId::new(),
            identity: identity.into(),
            tx,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn sender(&self) -> Outbound {
        self.tx.clone()
    }

    pub fn send_event(&self, event: &ServerEvent) -> Result<(), WebSocketError> {
        let text = event.to_text()?;
        self.tx
            .send(text)
            .map_err(|e| WebSocketError::SendError(format!("connection {}: {}", self.id, e)))
    }

    pub fn send_error(&self, message: &str) -> Result<(), WebSocketError> {
        self.send_event(&ServerEvent::Error {
            message: message.to_string(),
        })
    }
}

/// Per-connection handlers for one endpoint.
#[async_trait]
pub trait Session: Send + Sync {
    async fn on_connect(&self, conn: &ConnectionHandle);
    async fn on_message(&self, conn: &ConnectionHandle, text: &str);
    async fn on_disconnect(&self, conn: &ConnectionHandle);
}

/// Drives a session through `Connecting -> Open -> Closed`, guaranteeing
/// one `on_connect`, any number of `on_message` while open, and one
/// terminal `on_disconnect`.
pub struct Connection<S: Session> {
    handle: ConnectionHandle,
    session: S,
    state: ConnectionState,
}

impl<S: Session> Connection<S> {
    pub fn new(handle: ConnectionHandle, session: S) -> Self {
        Self {
            handle,
            session,
            state: ConnectionState::Connecting,
        }
    }

    pub async fn open(&mut self) -> Result<(), WebSocketError> {
        if self.state != ConnectionState::Connecting {
            return Err(WebSocketError::ConnectionError(format!(
                "connection {} cannot open from {:?}",
                self.handle.id, self.state
            )));
        }
        self.state = ConnectionState::Open;
        info!("Connection {} opened for {}", self.handle.id, self.handle.identity);
        self.session.on_connect(&self.handle).await;
        Ok(())
    }

    pub async fn receive(&mut self, text: &str) {
        if self.state != ConnectionState::Open {
            warn!("Dropping frame on connection {} in state {:?}", self.handle.id, self.state);
            return;
        }
        debug!("Received frame on connection {} from {}", self.handle.id, self.handle.identity);
        self.session.on_message(&self.handle, text).await;
    }

    /// Returns `true` only for the call that performed the transition.
    pub async fn close(&mut self) -> bool {
        match self.state {
            ConnectionState::Closed => false,
            ConnectionState::Connecting => {
                self.state = ConnectionState::Closed;
                true
            }
            ConnectionState::Open => {
                self.state = ConnectionState::Closed;
                self.session.on_disconnect(&self.handle).await;
                info!("Connection {} closed for {}", self.handle.id, self.handle.identity);
                true
            }
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn handle(&self) -> &ConnectionHandle {
        &self.handle
    }
}
