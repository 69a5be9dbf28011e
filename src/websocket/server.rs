use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use actix_web::ResponseError;
use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::{interval, timeout, MissedTickBehavior};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, error, info, warn};

use crate::auth::{AuthService, Identity};
use crate::config::WebSocketConfig;
use crate::error::{AppError, WebSocketError};
use super::chat::{ChatRelay, ChatSession};
use super::connection::{Connection, ConnectionHandle, Session};
use super::presence::{PresenceHub, PresenceSession};

const CLOSE_GRACE: Duration = Duration::from_secs(2);

/// Endpoint addressed by a WebSocket upgrade path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    Presence,
    Chat { receiver: String },
}

impl Route {
    pub fn parse(path: &str, config: &WebSocketConfig) -> Result<Self, WebSocketError> {
        let unknown = || WebSocketError::UnknownRoute(path.to_string());

        if path.trim_end_matches('/') == config.presence_path.trim_end_matches('/') {
            return Ok(Route::Presence);
        }

        let rest = path
            .strip_prefix(config.chat_path_prefix.as_str())
            .ok_or_else(unknown)?;
        let segment = rest.strip_suffix('/').unwrap_or(rest);
        if segment.is_empty() || segment.contains('/') {
            return Err(unknown());
        }

        let receiver = urlencoding::decode(segment).map_err(|_| unknown())?;
        Ok(Route::Chat { receiver: receiver.into_owned() })
    }
}

pub struct WebSocketServer {
    presence: Arc<PresenceHub>,
    chat: Arc<ChatRelay>,
    auth_service: Arc<AuthService>,
    config: WebSocketConfig,
}

impl WebSocketServer {
    pub fn new(
        presence: Arc<PresenceHub>,
        chat: Arc<ChatRelay>,
        auth_service: Arc<AuthService>,
        config: WebSocketConfig,
    ) -> Self {
        Self {
            presence,
            chat,
            auth_service,
            config,
        }
    }

    /// Resolves route and caller identity from an upgrade request.
    pub fn resolve(&self, req: &Request) -> crate::Result<(Route, Identity)> {
        let route = Route::parse(req.uri().path(), &self.config)?;
        let identity = self.auth_service.identity_from_query(req.uri().query())?;
        Ok((route, identity))
    }

    pub async fn run(self: Arc<Self>, listener: TcpListener) {
        info!("WebSocket server listening on {:?}", listener.local_addr());
        loop {
            match listener.accept().await {
                Ok((stream, addr)) => {
                    let server = self.clone();
                    tokio::spawn(async move {
                        server.handle_connection(stream, addr).await;
                    });
                }
                Err(e) => {
                    error!("Failed to accept connection: {}", e);
                }
            }
        }
    }

    pub async fn handle_connection(self: Arc<Self>, raw_stream: TcpStream, addr: SocketAddr) {
        debug!("New TCP connection from: {}", addr);

        let mut resolved = None;
        let callback = |req: &Request, response: Response| -> Result<Response, ErrorResponse> {
            match self.resolve(req) {
                Ok(found) => {
                    resolved = Some(found);
                    Ok(response)
                }
                Err(e) => {
                    warn!("Rejected WebSocket upgrade from {} for {}: {}", addr, req.uri().path(), e);
                    Err(reject(&e))
                }
            }
        };

        let ws_stream = match tokio_tungstenite::accept_hdr_async(raw_stream, callback).await {
            Ok(ws) => ws,
            Err(e) => {
                debug!("WebSocket handshake with {} failed: {}", addr, e);
                return;
            }
        };
        let Some((route, identity)) = resolved else {
            return;
        };

        info!("{} connected from {} to {:?}", identity.username, addr, route);
        match route {
            Route::Presence => {
                let session = PresenceSession::new(self.presence.clone());
                self.serve(ws_stream, identity, session).await;
            }
            Route::Chat { receiver } => {
                let session = ChatSession::new(self.chat.clone(), receiver);
                self.serve(ws_stream, identity, session).await;
            }
        }
    }

    async fn serve<S: Session>(&self, ws_stream: WebSocketStream<TcpStream>, identity: Identity, session: S) {
        let (mut ws_sink, mut ws_stream) = ws_stream.split();
        let (tx, mut rx) = mpsc::unbounded_channel::<String>();
        let (control_tx, mut control_rx) = mpsc::unbounded_channel::<Message>();

        let handle = ConnectionHandle::new(identity.username, tx);
        let connection_id = handle.id();
        let mut connection = Connection::new(handle, session);

        let heartbeat = self.config.heartbeat_interval();
        let mut send_task = tokio::spawn(async move {
            let mut ticker = interval(heartbeat);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;

            loop {
                let message = tokio::select! {
                    biased;
                    text = rx.recv() => match text {
                        Some(text) => Message::Text(text),
                        None => break,
                    },
                    control = control_rx.recv() => match control {
                        Some(message) => message,
                        None => break,
                    },
                    _ = ticker.tick() => Message::Ping(Vec::new()),
                };

                if let Err(e) = ws_sink.send(message).await {
                    debug!("Error sending on connection {}: {}", connection_id, e);
                    break;
                }
            }

            if let Err(e) = ws_sink.close().await {
                debug!("Error closing connection {}: {}", connection_id, e);
            }
        });

        if let Err(e) = connection.open().await {
            error!("Could not open connection {}: {}", connection_id, e);
            send_task.abort();
            return;
        }

        let client_timeout = self.config.client_timeout();
        let receive = async {
            loop {
                let message = match timeout(client_timeout, ws_stream.next()).await {
                    Ok(Some(Ok(message))) => message,
                    Ok(Some(Err(e))) => {
                        debug!("Error receiving on connection {}: {}", connection_id, e);
                        break;
                    }
                    Ok(None) => break,
                    Err(_) => {
                        warn!("Connection {} idle for {:?}, closing", connection_id, client_timeout);
                        break;
                    }
                };

                match message {
                    Message::Text(text) => connection.receive(&text).await,
                    Message::Ping(data) => {
                        if let Err(e) = control_tx.send(Message::Pong(data)) {
                            debug!("Could not queue pong on connection {}: {}", connection_id, e);
                        }
                    }
                    Message::Pong(_) => {}
                    Message::Close(frame) => {
                        debug!("Client closed connection {}: {:?}", connection_id, frame);
                        break;
                    }
                    Message::Binary(bin) => {
                        debug!("Ignoring {} byte binary frame on connection {}", bin.len(), connection_id);
                        if let Err(e) = connection.handle().send_error("Binary messages are not supported") {
                            debug!("Could not report error to connection {}: {}", connection_id, e);
                        }
                    }
                    Message::Frame(_) => {}
                }
            }
        };

        let writer_done = tokio::select! {
            _ = receive => {
                debug!("Receive loop completed for connection {}", connection_id);
                false
            }
            _ = &mut send_task => {
                debug!("Send task completed for connection {}", connection_id);
                true
            }
        };

        connection.close().await;

        // Dropping the last senders lets the writer flush and send a close frame.
        drop(connection);
        drop(control_tx);
        if !writer_done && timeout(CLOSE_GRACE, &mut send_task).await.is_err() {
            send_task.abort();
        }
    }
}

/// Handshake rejection carrying the same status the HTTP API would use.
fn reject(err: &AppError) -> ErrorResponse {
    let status = StatusCode::from_u16(err.status_code().as_u16()).unwrap_or(StatusCode::BAD_REQUEST);
    let mut response = ErrorResponse::new(Some(err.to_string()));
    *response.status_mut() = status;
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Settings;
    use crate::error::AuthError;

    fn config() -> WebSocketConfig {
        Settings::new_for_test().expect("Failed to load test config").websocket
    }

    fn server() -> (WebSocketServer, Arc<AuthService>) {
        let auth = Arc::new(AuthService::new("test_secret".to_string(), 1));
        let server = WebSocketServer::new(
            Arc::new(PresenceHub::new()),
            Arc::new(ChatRelay::new()),
            auth.clone(),
            config(),
        );
        (server, auth)
    }

    fn request(uri: &str) -> Request {
        Request::builder().uri(uri).body(()).unwrap()
    }

    #[test]
    fn test_route_parse() {
        let config = config();
        assert_eq!(Route::parse("/ws/online_users/", &config).unwrap(), Route::Presence);
        assert_eq!(Route::parse("/ws/online_users", &config).unwrap(), Route::Presence);
        assert_eq!(
            Route::parse("/ws/chat/bob/", &config).unwrap(),
            Route::Chat { receiver: "bob".to_string() }
        );
        assert_eq!(
            Route::parse("/ws/chat/jean%20luc", &config).unwrap(),
            Route::Chat { receiver: "jean luc".to_string() }
        );
    }

    #[test]
    fn test_route_parse_rejects_unknown() {
        let config = config();
        for path in ["/", "/ws/", "/ws/chat/", "/ws/chat/a/b/", "/health"] {
            assert!(
                matches!(Route::parse(path, &config), Err(WebSocketError::UnknownRoute(_))),
                "expected {} to be rejected",
                path
            );
        }
    }

    #[test]
    fn test_resolve_request() {
        let (server, auth) = server();
        let token = auth.issue_token("1", "alice").unwrap();

        let (route, identity) = server
            .resolve(&request(&format!("/ws/chat/bob/?token={}", token)))
            .unwrap();
        assert_eq!(route, Route::Chat { receiver: "bob".to_string() });
        assert_eq!(identity.username, "alice");

        let err = server.resolve(&request("/ws/online_users/")).unwrap_err();
        assert!(matches!(err, AppError::AuthError(AuthError::MissingToken)));
        assert_eq!(reject(&err).status(), StatusCode::UNAUTHORIZED);

        let err = server.resolve(&request(&format!("/nope?token={}", token))).unwrap_err();
        assert_eq!(reject(&err).status(), StatusCode::NOT_FOUND);
    }
}
