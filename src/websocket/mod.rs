//! WebSocket module for the realtime server
//!
//! Presence hub, chat relay and its message store hook, the
//! per-connection state machine that drives them, and the
//! tokio-tungstenite transport in front.

mod chat;
mod connection;
mod events;
mod pool;
mod presence;
mod server;
mod store;

pub use chat::{ChatRelay, ChatSession, PairKey};
pub use connection::{Connection, ConnectionHandle, ConnectionId, ConnectionState, Session};
pub use events::{ChatPayload, ServerEvent, ValidChat};
pub use pool::{ConnectionPool, Outbound, Removal};
pub use presence::{PresenceHub, PresenceSession};
pub use server::{Route, WebSocketServer};
pub use store::{MessageStore, NoopStore};
