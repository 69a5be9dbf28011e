use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use async_trait::async_trait;
use tokio::sync::Mutex;
use crate::error::WebSocketError;
use super::connection::{ConnectionHandle, ConnectionId, Session};
use super::events::{ChatPayload, ServerEvent};
use super::pool::{ConnectionPool, Removal};
use super::store::{MessageStore, NoopStore};
use tracing::{debug, info, warn};

/// Addresses the conversation between two users. The pair is unordered:
/// alice→bob and bob→alice share one group.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PairKey {
    low: String,
    high: String,
}

impl PairKey {
    pub fn new(a: &str, b: &str) -> Self {
        let (low, high) = if a <= b { (a, b) } else { (b, a) };
        Self {
            low: low.to_string(),
            high: high.to_string(),
        }
    }

    pub fn contains(&self, identity: &str) -> bool {
        self.low == identity || self.high == identity
    }
}

impl fmt::Display for PairKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "chat_{}-{}", self.low, self.high)
    }
}

#[derive(Debug)]
struct Member {
    key: PairKey,
    identity: String,
}

#[derive(Debug, Default)]
struct RelayState {
    groups: ConnectionPool<PairKey>,
    members: HashMap<ConnectionId, Member>,
}

/// Forwards chat messages to every connection of a sender/receiver pair
/// and hands each delivered message to a [`MessageStore`].
pub struct ChatRelay {
    state: Mutex<RelayState>,
    store: Arc<dyn MessageStore>,
}

impl Default for ChatRelay {
    fn default() -> Self {
        Self::new()
    }
}

impl ChatRelay {
    pub fn new() -> Self {
        Self::with_store(Arc::new(NoopStore))
    }

    pub fn with_store(store: Arc<dyn MessageStore>) -> Self {
        Self {
            state: Mutex::new(RelayState::default()),
            store,
        }
    }

    pub async fn on_connect(&self, sender: &str, receiver: &str, conn: &ConnectionHandle) -> PairKey {
        let key = PairKey::new(sender, receiver);

        let mut state = self.state.lock().await;
        state.groups.add(key.clone(), conn.id(), conn.sender());
        state.members.insert(conn.id(), Member {
            key: key.clone(),
            identity: sender.to_string(),
        });
        info!("{} joined {} on connection {} ({} in group)", sender, key, conn.id(), state.groups.group_size(&key));

        key
    }

    /// Validates `payload` and relays it to the connection's pair group,
    /// the sender's own connections included, then records it. Returns the
    /// number of connections reached. Nothing is delivered or recorded on
    /// error; a store failure is only logged.
    pub async fn on_message(&self, conn: &ConnectionHandle, payload: &str) -> Result<usize, WebSocketError> {
        let chat = ChatPayload::parse(payload)?;

        let state = self.state.lock().await;
        let member = state.members
            .get(&conn.id())
            .ok_or_else(|| WebSocketError::NotRegistered(conn.id().to_string()))?;

        if chat.username != member.identity {
            return Err(WebSocketError::IdentityMismatch(format!(
                "connection belongs to {}, message claims {}",
                member.identity, chat.username
            )));
        }
        if PairKey::new(&chat.username, &chat.receiver) != member.key {
            return Err(WebSocketError::IdentityMismatch(format!(
                "receiver {} is not part of {}",
                chat.receiver, member.key
            )));
        }

        let key = member.key.clone();
        let event = ServerEvent::ChatMessage {
            username: chat.username.clone(),
            message: chat.message.clone(),
        }
        .to_text()?;

        let delivered = state.groups.send_to_group(&key, &event);
        debug!("Relayed message from {} in {} to {} connection(s)", chat.username, key, delivered);
        drop(state);

        if let Err(e) = self.store.record(&key, &chat.username, &chat.receiver, &chat.message).await {
            warn!("Could not record message from {} in {}: {}", chat.username, key, e);
        }
        Ok(delivered)
    }

    /// Returns whether the connection was registered.
    pub async fn on_disconnect(&self, conn: &ConnectionHandle) -> bool {
        let mut state = self.state.lock().await;
        let Some(member) = state.members.remove(&conn.id()) else {
            debug!("Ignoring disconnect of unregistered connection {}", conn.id());
            return false;
        };

        if state.groups.remove(&member.key, &conn.id()) == Removal::GroupEmptied {
            debug!("{} has no connections left", member.key);
        }
        info!("{} left {} on connection {}", member.identity, member.key, conn.id());
        true
    }

    pub async fn group_size(&self, key: &PairKey) -> usize {
        self.state.lock().await.groups.group_size(key)
    }

    pub async fn connection_count(&self) -> usize {
        self.state.lock().await.members.len()
    }
}

/// Chat endpoint bound to one connection and the peer named in its path.
pub struct ChatSession {
    relay: Arc<ChatRelay>,
    receiver: String,
}

impl ChatSession {
    pub fn new(relay: Arc<ChatRelay>, receiver: impl Into<String>) -> Self {
        Self {
            relay,
            receiver: receiver.into(),
        }
    }
}

#[async_trait]
impl Session for ChatSession {
    async fn on_connect(&self, conn: &ConnectionHandle) {
        self.relay.on_connect(conn.identity(), &self.receiver, conn).await;
    }

    async fn on_message(&self, conn: &ConnectionHandle, text: &str) {
        if let Err(e) = self.relay.on_message(conn, text).await {
            warn!("Dropped chat message from {} on connection {}: {}", conn.identity(), conn.id(), e);
            if let Err(e) = conn.send_error(&e.to_string()) {
                debug!("Could not report error to connection {}: {}", conn.id(), e);
            }
        }
    }

    async fn on_disconnect(&self, conn: &ConnectionHandle) {
        self.relay.on_disconnect(conn).await;
    }
}
