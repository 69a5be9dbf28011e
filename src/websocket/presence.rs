use std::sync::Arc;
use async_trait::async_trait;
use tokio::sync::Mutex;
use crate::error::WebSocketError;
use super::connection::{ConnectionHandle, Session};
use super::events::ServerEvent;
use super::pool::{ConnectionPool, Removal};
use tracing::{debug, info, warn};

/// Tracks who is online and tells everybody else when that changes.
///
/// The registry maps a username to its open connections (one per tab or
/// device). A username is present iff it has at least one connection.
/// Every mutation and the broadcast it causes happen under one lock, so
/// racing connects and disconnects for the same user produce exactly one
/// `user_login` / `user_logout` per transition.
#[derive(Debug, Default)]
pub struct PresenceHub {
    registry: Mutex<ConnectionPool<String>>,
}

impl PresenceHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `conn` under `identity`. Announces the login to every other
    /// user if this is the identity's first connection, then sends the
    /// caller the full roster (including itself). The roster is always the
    /// first frame the connection receives.
    ///
    /// Returns whether the identity came online with this connection.
    pub async fn on_connect(&self, identity: &str, conn: &ConnectionHandle) -> Result<bool, WebSocketError> {
        let login = ServerEvent::UserLogin { username: identity.to_string() }.to_text()?;

        let mut registry = self.registry.lock().await;
        let came_online = registry.add(identity.to_string(), conn.id(), conn.sender());
        if came_online {
            let notified = registry.broadcast(&login, Some(&identity.to_string()));
            info!("{} is online, notified {} connection(s)", identity, notified);
        } else {
            debug!("{} opened another connection ({} total)", identity, registry.group_size(&identity.to_string()));
        }

        // Queued before the lock is released so no later login/logout can
        // overtake the snapshot.
        let roster = ServerEvent::OnlineUsersList { users: registry.keys() };
        conn.send_event(&roster)?;
        Ok(came_online)
    }

    /// Removes `conn`. Announces the logout if it was the identity's last
    /// connection. Unknown or already removed connections are a no-op.
    ///
    /// Returns whether the identity went offline with this call.
    pub async fn on_disconnect(&self, identity: &str, conn: &ConnectionHandle) -> bool {
        let mut registry = self.registry.lock().await;
        match registry.remove(&identity.to_string(), &conn.id()) {
            Removal::NotFound => {
                debug!("Ignoring disconnect of unregistered connection {}", conn.id());
                false
            }
            Removal::Removed => {
                debug!("{} closed one of several connections", identity);
                false
            }
            Removal::GroupEmptied => {
                match (ServerEvent::UserLogout { username: identity.to_string() }).to_text() {
                    Ok(logout) => {
                        let notified = registry.broadcast(&logout, None);
                        info!("{} is offline, notified {} connection(s)", identity, notified);
                    }
                    Err(e) => warn!("Could not announce logout of {}: {}", identity, e),
                }
                true
            }
        }
    }

    /// The presence channel carries no client messages; anything received
    /// is logged and dropped.
    pub async fn on_message(&self, identity: &str, raw: &str) {
        debug!("Ignoring {} byte(s) sent by {} on the presence channel", raw.len(), identity);
    }

    /// Delivers `event` to every registered connection except those of
    /// `exclude`. Returns the number of connections reached.
    pub async fn broadcast(&self, event: &ServerEvent, exclude: Option<&str>) -> Result<usize, WebSocketError> {
        let text = event.to_text()?;
        let exclude = exclude.map(str::to_string);
        let registry = self.registry.lock().await;
        Ok(registry.broadcast(&text, exclude.as_ref()))
    }

    /// Sorted snapshot of online usernames.
    pub async fn roster(&self) -> Vec<String> {
        self.registry.lock().await.keys()
    }

    pub async fn is_online(&self, identity: &str) -> bool {
        self.registry.lock().await.contains(&identity.to_string())
    }

    pub async fn online_count(&self) -> usize {
        self.registry.lock().await.group_count()
    }

    pub async fn connection_count(&self) -> usize {
        self.registry.lock().await.connection_count()
    }
}

/// Presence endpoint bound to one connection.
pub struct PresenceSession {
    hub: Arc<PresenceHub>,
}

impl PresenceSession {
    pub fn new(hub: Arc<PresenceHub>) -> Self {
        Self { hub }
    }
}

#[async_trait]
impl Session for PresenceSession {
    async fn on_connect(&self, conn: &ConnectionHandle) {
        if let Err(e) = self.hub.on_connect(conn.identity(), conn).await {
            warn!("Could not send roster to connection {}: {}", conn.id(), e);
        }
    }

    async fn on_message(&self, conn: &ConnectionHandle, text: &str) {
        self.hub.on_message(conn.identity(), text).await;
    }

    async fn on_disconnect(&self, conn: &ConnectionHandle) {
        self.hub.on_disconnect(conn.identity(), conn).await;
    }
}
