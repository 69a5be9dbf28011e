//! Authentication module for the realtime server
//!
//! Resolves the caller identity of a WebSocket upgrade from the JWT in
//! its `token` query parameter. Login and token refresh live in the HTTP
//! backend; this module only verifies.

mod service;

pub use service::{AuthService, Claims, Identity, token_from_query};
