use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{sleep, timeout};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use transcendence_realtime::websocket::PairKey;
use transcendence_realtime::{AppState, Settings};

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

const EVENT_TIMEOUT: Duration = Duration::from_secs(5);
const POLL_INTERVAL: Duration = Duration::from_millis(20);

async fn start_server() -> (SocketAddr, AppState) {
    let config = Settings::new_for_test().expect("Failed to load test config");
    let state = AppState::new(config);

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(Arc::new(state.websocket_server()).run(listener));

    (addr, state)
}

fn url(addr: SocketAddr, path: &str, state: &AppState, username: &str) -> String {
    let token = state.auth_service.issue_token(username, username).unwrap();
    format!("ws://{}{}?token={}", addr, path, token)
}

async fn connect(addr: SocketAddr, path: &str, state: &AppState, username: &str) -> Client {
    let (client, _) = connect_async(url(addr, path, state, username))
        .await
        .expect("WebSocket handshake failed");
    client
}

async fn next_event(client: &mut Client) -> Value {
    loop {
        let message = timeout(EVENT_TIMEOUT, client.next())
            .await
            .expect("timed out waiting for an event")
            .expect("connection ended")
            .expect("WebSocket error");
        if let Message::Text(text) = message {
            return serde_json::from_str(&text).unwrap();
        }
    }
}

async fn assert_silent(client: &mut Client) {
    let quiet = timeout(Duration::from_millis(200), async {
        loop {
            match client.next().await {
                Some(Ok(Message::Text(text))) => return text,
                Some(Ok(_)) => continue,
                _ => return String::new(),
            }
        }
    })
    .await;
    assert!(quiet.is_err(), "expected no event, got {:?}", quiet);
}

async fn wait_until<F, Fut>(mut condition: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    timeout(EVENT_TIMEOUT, async {
        while !condition().await {
            sleep(POLL_INTERVAL).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

#[test_log::test(tokio::test)]
async fn test_presence_end_to_end() {
    let (addr, state) = start_server().await;
    let state = &state;

    let mut alice = connect(addr, "/ws/online_users/", state, "alice").await;
    assert_eq!(next_event(&mut alice).await, json!({"type": "online_users_list", "users": ["alice"]}));

    let mut bob = connect(addr, "/ws/online_users/", state, "bob").await;
    assert_eq!(next_event(&mut bob).await, json!({"type": "online_users_list", "users": ["alice", "bob"]}));
    assert_eq!(next_event(&mut alice).await, json!({"type": "user_login", "username": "bob"}));

    let mut carol = connect(addr, "/ws/online_users/", state, "carol").await;
    assert_eq!(
        next_event(&mut carol).await,
        json!({"type": "online_users_list", "users": ["alice", "bob", "carol"]})
    );
    assert_eq!(next_event(&mut alice).await, json!({"type": "user_login", "username": "carol"}));
    assert_eq!(next_event(&mut bob).await, json!({"type": "user_login", "username": "carol"}));

    bob.close(None).await.unwrap();
    assert_eq!(next_event(&mut alice).await, json!({"type": "user_logout", "username": "bob"}));
    assert_eq!(next_event(&mut carol).await, json!({"type": "user_logout", "username": "bob"}));

    wait_until(|| async move { state.presence.connection_count().await == 2 }).await;
    assert_eq!(state.presence.roster().await, vec!["alice", "carol"]);
}

#[test_log::test(tokio::test)]
async fn test_presence_second_tab_and_dropped_socket() {
    let (addr, state) = start_server().await;
    let state = &state;

    let mut watcher = connect(addr, "/ws/online_users/", state, "watcher").await;
    next_event(&mut watcher).await;

    let mut tab1 = connect(addr, "/ws/online_users/", state, "alice").await;
    next_event(&mut tab1).await;
    assert_eq!(next_event(&mut watcher).await, json!({"type": "user_login", "username": "alice"}));

    let mut tab2 = connect(addr, "/ws/online_users/", state, "alice").await;
    assert_eq!(
        next_event(&mut tab2).await,
        json!({"type": "online_users_list", "users": ["alice", "watcher"]})
    );
    assert_silent(&mut watcher).await;

    // Messages on the presence channel are ignored and do not close it.
    tab1.send(Message::Text("hello?".to_string())).await.unwrap();
    assert_silent(&mut tab1).await;

    tab1.close(None).await.unwrap();
    wait_until(|| async move { state.presence.connection_count().await == 2 }).await;
    assert_silent(&mut watcher).await;

    // Dropping without a close frame still counts as a disconnect.
    drop(tab2);
    assert_eq!(next_event(&mut watcher).await, json!({"type": "user_logout", "username": "alice"}));
    assert!(!state.presence.is_online("alice").await);
}

#[test_log::test(tokio::test)]
async fn test_chat_relay_end_to_end() {
    let (addr, state) = start_server().await;
    let state = &state;
    let pair = &PairKey::new("alice", "bob");

    let mut alice = connect(addr, "/ws/chat/bob/", state, "alice").await;
    let mut bob = connect(addr, "/ws/chat/alice/", state, "bob").await;
    let mut carol = connect(addr, "/ws/chat/alice/", state, "carol").await;
    wait_until(|| async move { state.chat.group_size(pair).await == 2 }).await;
    wait_until(|| async move { state.chat.connection_count().await == 3 }).await;

    let hi = json!({"message": "hi", "username": "alice", "receiver": "bob"});
    alice.send(Message::Text(hi.to_string())).await.unwrap();

    let expected = json!({"type": "chat_message", "username": "alice", "message": "hi"});
    assert_eq!(next_event(&mut bob).await, expected);
    assert_eq!(next_event(&mut alice).await, expected);
    assert_silent(&mut carol).await;

    // Malformed: only the sender hears about it and the socket stays open.
    let missing_message = json!({"username": "alice", "receiver": "bob"});
    alice.send(Message::Text(missing_message.to_string())).await.unwrap();
    assert_eq!(next_event(&mut alice).await["type"], "error");
    assert_silent(&mut bob).await;

    let reply = json!({"message": "hey", "username": "bob", "receiver": "alice"});
    bob.send(Message::Text(reply.to_string())).await.unwrap();
    assert_eq!(next_event(&mut alice).await["message"], "hey");
    assert_eq!(next_event(&mut bob).await["message"], "hey");

    alice.close(None).await.unwrap();
    wait_until(|| async move { state.chat.group_size(pair).await == 1 }).await;
}

#[test_log::test(tokio::test)]
async fn test_chat_preserves_order() {
    let (addr, state) = start_server().await;
    let state = &state;
    let pair = &PairKey::new("alice", "bob");

    let mut alice = connect(addr, "/ws/chat/bob/", state, "alice").await;
    let mut bob = connect(addr, "/ws/chat/alice/", state, "bob").await;
    wait_until(|| async move { state.chat.group_size(pair).await == 2 }).await;

    for i in 0..25 {
        let payload = json!({"message": format!("m{}", i), "username": "alice", "receiver": "bob"});
        alice.send(Message::Text(payload.to_string())).await.unwrap();
    }
    for i in 0..25 {
        assert_eq!(next_event(&mut bob).await["message"], format!("m{}", i));
    }
}

#[test_log::test(tokio::test)]
async fn test_client_ping_is_answered() {
    let (addr, state) = start_server().await;
    let mut alice = connect(addr, "/ws/online_users/", &state, "alice").await;
    next_event(&mut alice).await;

    alice.send(Message::Ping(b"are you there".to_vec())).await.unwrap();
    let pong = timeout(EVENT_TIMEOUT, async {
        loop {
            match alice.next().await {
                Some(Ok(Message::Pong(data))) => return data,
                Some(Ok(_)) => continue,
                other => panic!("connection ended before pong: {:?}", other),
            }
        }
    })
    .await
    .expect("timed out waiting for pong");
    assert_eq!(pong, b"are you there".to_vec());
}

#[test_log::test(tokio::test)]
async fn test_rejected_handshakes() {
    let (addr, state) = start_server().await;
    let state = &state;

    let err = connect_async(format!("ws://{}/ws/online_users/", addr)).await.unwrap_err();
    assert!(
        matches!(&err, WsError::Http(resp) if resp.status() == StatusCode::UNAUTHORIZED),
        "unexpected error: {:?}",
        err
    );

    let err = connect_async(format!("ws://{}/ws/online_users/?token=garbage", addr)).await.unwrap_err();
    assert!(
        matches!(&err, WsError::Http(resp) if resp.status() == StatusCode::UNAUTHORIZED),
        "unexpected error: {:?}",
        err
    );

    let err = connect_async(url(addr, "/ws/elsewhere/", state, "alice")).await.unwrap_err();
    assert!(
        matches!(&err, WsError::Http(resp) if resp.status() == StatusCode::NOT_FOUND),
        "unexpected error: {:?}",
        err
    );

    assert_eq!(state.presence.connection_count().await, 0);
    assert_eq!(state.chat.connection_count().await, 0);
}
