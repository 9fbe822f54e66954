mod common;

use std::time::Duration;

use serde_json::json;
use tokio::time;

use switchboard::gateway::envelope::Envelope;

use common::{ALICE, BOB};

// ---------------------------------------------------------------------------
// Handshake
// ---------------------------------------------------------------------------

#[tokio::test]
async fn websocket_handshake_registers_one_endpoint() {
    let (addr, state, _bus) = common::start_server(common::test_config()).await;

    let (_ws, ack) = common::ws_handshake(addr, ALICE, "Browser").await;
    assert_eq!(ack["data"]["user_id"], "usr_alice");
    assert_eq!(ack["data"]["context_id"], "ctx_1");
    assert_eq!(ack["data"]["transport"], "websocket");
    assert_eq!(ack["data"]["resumed"], false);
    assert!(ack["data"]["endpoint_id"].as_str().unwrap().starts_with("ep_"));

    let endpoints = state.directory.lookup(ALICE);
    assert_eq!(endpoints.len(), 1);
    assert_eq!(endpoints[0].resource, "Browser");
}

#[tokio::test]
async fn invalid_session_gets_error_and_close() {
    let (addr, state, _bus) = common::start_server(common::test_config()).await;

    let mut ws = common::ws_connect(addr, "ses_nobody").await;
    common::ws_send(&mut ws, json!({ "ns": "handshake", "data": { "resource": "Browser" } })).await;

    let err = common::ws_recv(&mut ws).await;
    assert_eq!(err["ns"], "error");
    assert_eq!(err["data"]["code"], "HANDSHAKE_INVALID");
    assert_eq!(common::ws_close_code(&mut ws).await, 4004);
    assert!(state.directory.all().is_empty());
    assert_eq!(state.diagnostics.snapshot().handshake_invalid, 1);
}

#[tokio::test]
async fn message_before_handshake_is_rejected_but_socket_stays_open() {
    let (addr, _state, _bus) = common::start_server(common::test_config()).await;

    let mut ws = common::ws_connect(addr, ALICE).await;
    common::ws_send(&mut ws, json!({ "ns": "chat", "data": { "text": "hi" } })).await;
    let err = common::ws_recv(&mut ws).await;
    assert_eq!(err["data"]["code"], "UNAUTHENTICATED_MESSAGE");

    common::ws_send(&mut ws, json!({ "ns": "handshake", "data": { "resource": "Browser" } })).await;
    let ack = common::ws_recv(&mut ws).await;
    assert_eq!(ack["ns"], "handshake");
    assert_eq!(ack["data"]["status"], "ok");
}

#[tokio::test]
async fn missing_handshake_closes_with_timeout_code() {
    let (addr, _state, _bus) = common::start_server(common::test_config()).await;

    let mut ws = common::ws_connect(addr, ALICE).await;
    let err = common::ws_recv(&mut ws).await;
    assert_eq!(err["data"]["code"], "HANDSHAKE_TIMEOUT");
    assert_eq!(common::ws_close_code(&mut ws).await, 4009);
}

#[tokio::test]
async fn ping_gets_pong() {
    let (addr, _state, _bus) = common::start_server(common::test_config()).await;
    let (mut ws, _) = common::ws_handshake(addr, ALICE, "Browser").await;

    common::ws_send(&mut ws, json!({ "ns": "ping", "data": { "t": 42 } })).await;
    let pong = common::ws_recv(&mut ws).await;
    assert_eq!(pong["ns"], "pong");
    assert_eq!(pong["data"]["t"], 42);
}

// ---------------------------------------------------------------------------
// Routing
// ---------------------------------------------------------------------------

#[tokio::test]
async fn session_message_fans_out_to_every_resource() {
    let (addr, _state, _bus) = common::start_server(common::test_config()).await;
    let (mut browser, _) = common::ws_handshake(addr, ALICE, "Browser").await;
    let (mut phone, _) = common::ws_handshake(addr, ALICE, "Phone").await;
    let (mut bob, _) = common::ws_handshake(addr, BOB, "Desk").await;

    common::ws_send(&mut bob, json!({ "ns": "chat", "to": ALICE, "data": { "text": "hello" } })).await;

    for ws in [&mut browser, &mut phone] {
        let msg = common::ws_recv(ws).await;
        assert_eq!(msg["ns"], "chat");
        assert_eq!(msg["from"], "ses_bob/Desk");
        assert_eq!(msg["data"]["text"], "hello");
    }
}

#[tokio::test]
async fn messages_to_one_endpoint_arrive_in_order() {
    let (addr, _state, _bus) = common::start_server(common::test_config()).await;
    let (mut alice, _) = common::ws_handshake(addr, ALICE, "Browser").await;
    let (mut bob, _) = common::ws_handshake(addr, BOB, "Desk").await;

    for n in 0..20 {
        common::ws_send(
            &mut bob,
            json!({ "ns": "chat", "to": "ses_alice/Browser", "data": { "n": n } }),
        )
        .await;
    }

    let mut last_seq = 0;
    for n in 0..20 {
        let msg = common::ws_recv(&mut alice).await;
        assert_eq!(msg["data"]["n"], n);
        let seq = msg["seq"].as_u64().unwrap();
        assert!(seq > last_seq);
        last_seq = seq;
    }
}

#[tokio::test]
async fn message_without_recipient_goes_to_backend() {
    let (addr, _state, bus) = common::start_server(common::test_config()).await;
    let mut backend = bus.consume();
    let (mut alice, _) = common::ws_handshake(addr, ALICE, "Browser").await;

    common::ws_send(&mut alice, json!({ "ns": "chat", "data": { "text": "to backend" } })).await;

    let forwarded = time::timeout(Duration::from_secs(5), backend.recv())
        .await
        .expect("timeout waiting for backend")
        .expect("bus closed");
    assert_eq!(forwarded.ns, "chat");
    assert_eq!(forwarded.from.as_deref(), Some("ses_alice/Browser"));
    assert_eq!(forwarded.session.as_deref(), Some(ALICE));
}

#[tokio::test]
async fn backend_emitted_message_reaches_client() {
    let (addr, _state, bus) = common::start_server(common::test_config()).await;
    let (mut alice, _) = common::ws_handshake(addr, ALICE, "Browser").await;

    bus.emit(Envelope::new("notice", json!({ "text": "from backend" })).to(ALICE));

    let msg = common::ws_recv(&mut alice).await;
    assert_eq!(msg["ns"], "notice");
    assert_eq!(msg["data"]["text"], "from backend");
}

#[tokio::test]
async fn message_to_absent_session_reports_no_route() {
    let (addr, state, _bus) = common::start_server(common::test_config()).await;
    let (mut alice, _) = common::ws_handshake(addr, ALICE, "Browser").await;

    common::ws_send(&mut alice, json!({ "ns": "chat", "to": BOB, "data": {} })).await;
    let err = common::ws_recv(&mut alice).await;
    assert_eq!(err["data"]["code"], "NO_ROUTE");

    // The gateway keeps serving the sender.
    common::ws_send(&mut alice, json!({ "ns": "ping" })).await;
    assert_eq!(common::ws_recv(&mut alice).await["ns"], "pong");
    assert_eq!(state.diagnostics.snapshot().no_route, 1);
}

// ---------------------------------------------------------------------------
// Failover and grace period
// ---------------------------------------------------------------------------

#[tokio::test]
async fn reconnect_within_grace_resumes_and_flushes_queue() {
    let config = switchboard::config::Config {
        grace_period: Duration::from_secs(30),
        ..common::test_config()
    };
    let (addr, state, bus) = common::start_server(config).await;
    let (first, ack) = common::ws_handshake(addr, ALICE, "Browser").await;
    let endpoint_id = ack["data"]["endpoint_id"].clone();
    drop(first);

    // Wait for the endpoint to notice the socket is gone.
    time::timeout(Duration::from_secs(5), async {
        while state.directory.counts().degraded == 0 {
            time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("endpoint never degraded");

    for n in 1..=3 {
        bus.emit(Envelope::new("chat", json!({ "n": n })).to(ALICE));
    }
    time::timeout(Duration::from_secs(5), async {
        while state.directory.lookup(ALICE)[0].outbox().len() < 3 {
            time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("messages never queued");

    let (mut second, ack) = common::ws_handshake(addr, ALICE, "Browser").await;
    assert_eq!(ack["data"]["endpoint_id"], endpoint_id);
    assert_eq!(ack["data"]["resumed"], true);
    assert_eq!(ack["data"]["pending"], 3);

    for n in 1..=3 {
        let msg = common::ws_recv(&mut second).await;
        assert_eq!(msg["data"]["n"], n);
    }
}

#[tokio::test]
async fn endpoint_is_removed_after_grace_period() {
    let (addr, state, _bus) = common::start_server(common::test_config()).await;
    let (first, _) = common::ws_handshake(addr, ALICE, "Browser").await;
    drop(first);

    time::timeout(Duration::from_secs(5), async {
        while !state.directory.lookup(ALICE).is_empty() {
            time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await
    .expect("endpoint never expired");
    assert_eq!(state.diagnostics.snapshot().expired, 1);
}

#[tokio::test]
async fn second_socket_for_same_resource_supersedes_first() {
    let (addr, state, _bus) = common::start_server(common::test_config()).await;
    let (mut first, _) = common::ws_handshake(addr, ALICE, "Browser").await;
    let (_second, ack) = common::ws_handshake(addr, ALICE, "Browser").await;
    assert_eq!(ack["data"]["resumed"], true);

    assert_eq!(common::ws_close_code(&mut first).await, 4010);
    assert_eq!(state.directory.lookup(ALICE).len(), 1);
}

#[tokio::test]
async fn close_message_removes_endpoint_immediately() {
    let (addr, state, _bus) = common::start_server(common::test_config()).await;
    let (mut ws, _) = common::ws_handshake(addr, ALICE, "Browser").await;

    common::ws_send(&mut ws, json!({ "ns": "close" })).await;
    assert_eq!(common::ws_close_code(&mut ws).await, 1000);
    assert!(state.directory.lookup(ALICE).is_empty());
}
