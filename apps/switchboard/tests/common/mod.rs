#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::time;
use tokio_tungstenite::{tungstenite, MaybeTlsStream, WebSocketStream};

use switchboard::auth::StaticAuthService;
use switchboard::bus::LocalBus;
use switchboard::config::Config;
use switchboard::AppState;

pub type WsClient = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub const ALICE: &str = "ses_alice";
pub const BOB: &str = "ses_bob";

/// Config with short timers so lifecycle tests finish quickly.
pub fn test_config() -> Config {
    Config {
        static_sessions: format!("{ALICE}:usr_alice:ctx_1,{BOB}:usr_bob:ctx_1"),
        long_poll_hold: Duration::from_millis(500),
        poll_reconnect_window: Duration::from_millis(500),
        grace_period: Duration::from_secs(1),
        handshake_timeout: Duration::from_secs(2),
        heartbeat_interval: Duration::from_secs(5),
        sweep_interval: Duration::from_millis(100),
        ..Config::default()
    }
}

/// Build a state backed by the static session table and an in-process bus.
pub fn test_state(config: Config) -> (AppState, LocalBus) {
    let auth = StaticAuthService::from_list(&config.static_sessions);
    let bus = LocalBus::new();
    let state = AppState::new(config, Arc::new(auth), Arc::new(bus.clone()));
    (state, bus)
}

pub fn test_app(config: Config) -> (Router, AppState, LocalBus) {
    let (state, bus) = test_state(config);
    let app = switchboard::routes::router().with_state(state.clone());
    (app, state, bus)
}

/// Start an actual TCP server with the background tasks running.
/// Returns (addr, state, bus). The server runs in the background.
pub async fn start_server(config: Config) -> (SocketAddr, AppState, LocalBus) {
    let (app, state, bus) = test_app(config);
    state.spawn_background_tasks();

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind");
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    (addr, state, bus)
}

pub async fn ws_connect(addr: SocketAddr, session: &str) -> WsClient {
    let url = format!("ws://{addr}/transport/websocket?session={session}");
    let (ws, _) = tokio_tungstenite::connect_async(&url)
        .await
        .expect("ws connect");
    ws
}

pub async fn ws_send(ws: &mut WsClient, value: serde_json::Value) {
    ws.send(tungstenite::Message::Text(value.to_string().into()))
        .await
        .expect("ws send");
}

/// Next text frame parsed as JSON. Panics after five seconds.
pub async fn ws_recv(ws: &mut WsClient) -> serde_json::Value {
    loop {
        let msg = time::timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("timeout waiting for message")
            .expect("stream ended")
            .expect("ws read error");
        match msg {
            tungstenite::Message::Text(text) => {
                return serde_json::from_str(text.as_str()).expect("parse message")
            }
            tungstenite::Message::Close(frame) => panic!("socket closed: {frame:?}"),
            _ => continue,
        }
    }
}

/// Wait for the close frame and return its code.
pub async fn ws_close_code(ws: &mut WsClient) -> u16 {
    loop {
        let msg = time::timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("timeout waiting for close");
        match msg {
            Some(Ok(tungstenite::Message::Close(Some(frame)))) => return frame.code.into(),
            Some(Ok(tungstenite::Message::Close(None))) | None => return 1005,
            Some(Ok(_)) => continue,
            Some(Err(e)) => panic!("ws read error: {e}"),
        }
    }
}

/// Connect over WebSocket and complete the handshake. Returns the socket and
/// the acknowledgement.
pub async fn ws_handshake(
    addr: SocketAddr,
    session: &str,
    resource: &str,
) -> (WsClient, serde_json::Value) {
    let mut ws = ws_connect(addr, session).await;
    ws_send(
        &mut ws,
        serde_json::json!({ "ns": "handshake", "data": { "resource": resource } }),
    )
    .await;
    let ack = ws_recv(&mut ws).await;
    assert_eq!(ack["ns"], "handshake", "expected handshake ack, got {ack}");
    assert_eq!(ack["data"]["status"], "ok");
    (ws, ack)
}

/// Open a pull connection of `kind` for `session`; returns its connection id.
pub async fn open_pull(addr: SocketAddr, kind: &str, session: &str) -> String {
    let body: serde_json::Value = reqwest::Client::new()
        .post(format!("http://{addr}/transport/open"))
        .query(&[("kind", kind), ("session", session)])
        .send()
        .await
        .expect("open request")
        .json()
        .await
        .expect("parse open response");
    body["connection_id"]
        .as_str()
        .expect("connection_id present")
        .to_string()
}

/// Post a frame on the side-channel of `connection_id`.
pub async fn side_send(addr: SocketAddr, connection_id: &str, value: serde_json::Value) -> u16 {
    reqwest::Client::new()
        .post(format!("http://{addr}/transport/{connection_id}/send"))
        .header("content-type", "application/json")
        .body(value.to_string())
        .send()
        .await
        .expect("send request")
        .status()
        .as_u16()
}

/// Poll until at least one message arrives or `attempts` polls came back empty.
pub async fn poll_messages(
    addr: SocketAddr,
    connection_id: &str,
    attempts: usize,
) -> Vec<serde_json::Value> {
    for _ in 0..attempts {
        let body: serde_json::Value = reqwest::Client::new()
            .get(format!("http://{addr}/transport/{connection_id}/poll"))
            .send()
            .await
            .expect("poll request")
            .json()
            .await
            .expect("parse poll response");
        let messages = body["messages"].as_array().cloned().unwrap_or_default();
        if !messages.is_empty() {
            return messages;
        }
    }
    Vec::new()
}
