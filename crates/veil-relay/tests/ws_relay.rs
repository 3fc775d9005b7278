//! End-to-end scenarios over real WebSockets.
//!
//! Each test binds the router on an ephemeral port and drives it with
//! tokio-tungstenite clients authenticating via session tokens, so no
//! identity-provider traffic is involved.

use chrono::Utc;
use futures::{SinkExt, StreamExt};
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use veil_core::identity::{email_hash, pair_session_id};
use veil_core::token::SessionKey;
use veil_relay::config::Config;
use veil_relay::frame::Frame;
use veil_relay::relay::{router, ConnectionLog, RelayState};
use veil_relay::storage::Storage;

const SEED: &str = "integration-test-seed";

type WsClient = WebSocketStream<MaybeTlsStream<TcpStream>>;

async fn start_server() -> (SocketAddr, Arc<RelayState>) {
    let config = Config::new("turn-secret", "turn.example.org", SEED);
    let db = Storage::open_in_memory().expect("in-memory database");
    let log_path = std::env::temp_dir().join("veil-relay-test-connections.log");
    let conn_log = ConnectionLog::open(&log_path).expect("connection log");
    let state = Arc::new(RelayState::new(db, config, conn_log));

    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");
    let app = router(state.clone());
    tokio::spawn(async move {
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
        .expect("serve");
    });
    (addr, state)
}

async fn connect(addr: SocketAddr) -> WsClient {
    let (ws, _) = connect_async(format!("ws://{addr}/"))
        .await
        .expect("websocket connect");
    ws
}

fn session_token(email: &str) -> String {
    SessionKey::from_seed(SEED).mint(email, Utc::now().timestamp())
}

async fn send_frame(ws: &mut WsClient, frame: &Frame) {
    let text = serde_json::to_string(frame).expect("encode");
    ws.send(Message::Text(text.into())).await.expect("send");
}

/// Read the next non-PING frame.
async fn next_frame(ws: &mut WsClient) -> Frame {
    loop {
        let msg = tokio::time::timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("timed out waiting for frame")
            .expect("stream ended")
            .expect("websocket error");
        if let Message::Text(text) = msg {
            let frame: Frame = serde_json::from_str(&text).expect("decode");
            if frame.t == "PING" {
                continue;
            }
            return frame;
        }
    }
}

/// Skip frames until one of the given type arrives.
async fn wait_for(ws: &mut WsClient, t: &str) -> Frame {
    for _ in 0..32 {
        let frame = next_frame(ws).await;
        if frame.t == t {
            return frame;
        }
    }
    panic!("never received {t}");
}

/// AUTH with a session token and return the server's first response
/// (`AUTH_SUCCESS` or `AUTH_PENDING`).
async fn authenticate(ws: &mut WsClient, email: &str, public_key: &str) -> Frame {
    send_frame(
        ws,
        &Frame::with_data(
            "AUTH",
            json!({ "token": session_token(email), "publicKey": public_key }),
        ),
    )
    .await;
    next_frame(ws).await
}

#[tokio::test]
async fn first_device_onboarding() {
    let (addr, state) = start_server().await;
    let mut ws = connect(addr).await;

    let resp = authenticate(&mut ws, "user@x", "k1").await;
    assert_eq!(resp.t, "AUTH_SUCCESS");
    let data = resp.data.expect("payload");
    assert_eq!(data["email"], "user@x");

    // The token in the response is a freshly minted session token.
    let token = data["token"].as_str().expect("token");
    let verified = SessionKey::from_seed(SEED)
        .verify(token, Utc::now().timestamp())
        .expect("reissued token verifies");
    assert_eq!(verified, "user@x");

    // First-ever device becomes the approved trust anchor.
    let auth = state
        .db
        .device_auth(&email_hash("user@x"), "k1")
        .unwrap()
        .expect("device row");
    assert_eq!(auth, ("approved".to_string(), true));

    // No friendships yet: hydration sends an empty SESSION_LIST.
    let list = wait_for(&mut ws, "SESSION_LIST").await;
    assert_eq!(list.data.expect("payload"), json!([]));
}

#[tokio::test]
async fn second_device_is_gated_until_approved() {
    let (addr, _state) = start_server().await;
    let mut master = connect(addr).await;
    assert_eq!(authenticate(&mut master, "user@x", "k1").await.t, "AUTH_SUCCESS");

    let mut second = connect(addr).await;
    let resp = authenticate(&mut second, "user@x", "k2").await;
    assert_eq!(resp.t, "AUTH_PENDING");
    let data = resp.data.expect("payload");
    assert_eq!(data["masterPubKey"], "k1");
    assert_eq!(data["email"], "user@x");

    // A pending device may not relay.
    let mut msg = Frame::with_data("MSG", json!({ "payloads": { "k1": "x" } }));
    msg.sid = Some("deadbeef".to_string());
    send_frame(&mut second, &msg).await;
    let err = next_frame(&mut second).await;
    assert_eq!(err.t, "ERROR");
    let message = err.data.expect("payload")["message"]
        .as_str()
        .expect("message")
        .to_string();
    assert!(message.contains("pending approval"), "{message}");
}

#[tokio::test]
async fn master_approves_second_device() {
    let (addr, state) = start_server().await;
    let mut master = connect(addr).await;
    assert_eq!(authenticate(&mut master, "user@x", "k1").await.t, "AUTH_SUCCESS");
    let mut second = connect(addr).await;
    assert_eq!(authenticate(&mut second, "user@x", "k2").await.t, "AUTH_PENDING");

    send_frame(
        &mut master,
        &Frame::with_data("DEVICE_LINK_ACCEPT", json!({ "targetPubKey": "k2" })),
    )
    .await;

    wait_for(&mut second, "DEVICE_LINK_ACCEPTED").await;

    // Both sockets get the refreshed device list.
    for ws in [&mut master, &mut second] {
        let list = wait_for(ws, "DEVICE_LIST").await;
        let devices = list.data.expect("payload")["devices"]
            .as_array()
            .expect("devices")
            .clone();
        assert_eq!(devices.len(), 2);
        for device in &devices {
            assert_eq!(device["status"], "approved");
            let is_master = device["publicKey"] == "k1";
            assert_eq!(device["isMaster"], is_master);
        }
    }

    let auth = state
        .db
        .device_auth(&email_hash("user@x"), "k2")
        .unwrap()
        .expect("device row");
    assert_eq!(auth, ("approved".to_string(), false));
}

#[tokio::test]
async fn friendship_bootstrap() {
    let (addr, state) = start_server().await;
    let mut alice = connect(addr).await;
    assert_eq!(authenticate(&mut alice, "alice@x", "ka").await.t, "AUTH_SUCCESS");
    let mut bob = connect(addr).await;
    assert_eq!(authenticate(&mut bob, "bob@x", "kb").await.t, "AUTH_SUCCESS");

    send_frame(
        &mut alice,
        &Frame::with_data(
            "FRIEND_REQUEST",
            json!({ "targetEmail": "bob@x", "encryptedPacket": "p" }),
        ),
    )
    .await;
    wait_for(&mut alice, "REQUEST_SENT").await;

    // Bob is online and sees the request immediately.
    let live = wait_for(&mut bob, "FRIEND_REQUEST").await;
    let live_data = live.data.expect("payload");
    assert_eq!(live_data["senderHash"], email_hash("alice@x"));
    assert_eq!(live_data["encryptedPacket"], "p");

    // And it is also durably pending.
    send_frame(&mut bob, &Frame::of("GET_PENDING_REQUESTS")).await;
    let pending = wait_for(&mut bob, "PENDING_REQUESTS").await;
    let entries = pending.data.expect("payload");
    let entries = entries.as_array().expect("array");
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0]["senderHash"], email_hash("alice@x"));

    send_frame(
        &mut bob,
        &Frame::with_data(
            "FRIEND_ACCEPT",
            json!({ "targetEmail": "alice@x", "encryptedPacket": "q" }),
        ),
    )
    .await;
    let ack = wait_for(&mut bob, "FRIEND_ACCEPTED_ACK").await;
    assert_eq!(ack.data.expect("payload")["targetEmail"], "alice@x");

    let accepted = wait_for(&mut alice, "FRIEND_ACCEPTED").await;
    assert_eq!(accepted.data.expect("payload")["senderHash"], email_hash("bob@x"));

    let sid = pair_session_id("alice@x", "bob@x");
    assert!(state.db.friendship_exists(&sid, &email_hash("alice@x")).unwrap());
    assert!(state.db.friendship_exists(&sid, &email_hash("bob@x")).unwrap());
    // The accepted request is gone.
    assert!(state
        .db
        .pending_requests_for(&email_hash("bob@x"))
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn message_relay_with_delivery_ack() {
    let (addr, _state) = start_server().await;
    let mut alice = connect(addr).await;
    assert_eq!(authenticate(&mut alice, "alice@x", "ka").await.t, "AUTH_SUCCESS");
    let mut bob = connect(addr).await;
    assert_eq!(authenticate(&mut bob, "bob@x", "kb").await.t, "AUTH_SUCCESS");

    // Establish the friendship.
    send_frame(
        &mut alice,
        &Frame::with_data(
            "FRIEND_REQUEST",
            json!({ "targetEmail": "bob@x", "encryptedPacket": "p" }),
        ),
    )
    .await;
    wait_for(&mut bob, "FRIEND_REQUEST").await;
    send_frame(
        &mut bob,
        &Frame::with_data(
            "FRIEND_ACCEPT",
            json!({ "targetEmail": "alice@x", "encryptedPacket": "q" }),
        ),
    )
    .await;
    wait_for(&mut alice, "FRIEND_ACCEPTED").await;

    // Attach both to the session.
    let sid = pair_session_id("alice@x", "bob@x");
    send_frame(&mut alice, &Frame::in_session("REATTACH", &sid)).await;
    send_frame(&mut bob, &Frame::in_session("REATTACH", &sid)).await;
    wait_for(&mut alice, "PEER_ONLINE").await;

    let mut msg = Frame::with_data("MSG", json!({ "payloads": { "kb": "ct" } }));
    msg.sid = Some(sid.clone());
    msg.c = true;
    send_frame(&mut alice, &msg).await;

    let relayed = wait_for(&mut bob, "MSG").await;
    assert_eq!(relayed.sid.as_deref(), Some(sid.as_str()));
    assert_eq!(relayed.sh.as_deref(), Some(email_hash("alice@x").as_str()));
    assert_eq!(relayed.data.expect("payload")["payloads"]["kb"], "ct");

    let ack = wait_for(&mut alice, "DELIVERED").await;
    assert_eq!(ack.sid.as_deref(), Some(sid.as_str()));
}

#[tokio::test]
async fn relay_refused_without_friendship() {
    let (addr, _state) = start_server().await;
    let mut alice = connect(addr).await;
    assert_eq!(authenticate(&mut alice, "alice@x", "ka").await.t, "AUTH_SUCCESS");

    let mut msg = Frame::with_data("MSG", json!({ "payloads": { "kb": "ct" } }));
    msg.sid = Some("0123456789abcdef".to_string());
    send_frame(&mut alice, &msg).await;

    let err = wait_for(&mut alice, "ERROR").await;
    let message = err.data.expect("payload")["message"]
        .as_str()
        .expect("message")
        .to_string();
    assert!(message.contains("not connected"), "{message}");
}

#[tokio::test]
async fn block_event_queues_for_offline_target() {
    let (addr, state) = start_server().await;
    let mut alice = connect(addr).await;
    assert_eq!(authenticate(&mut alice, "alice@x", "ka").await.t, "AUTH_SUCCESS");

    // Bob is offline: the event must queue durably.
    send_frame(
        &mut alice,
        &Frame::with_data("BLOCK_USER", json!({ "targetEmail": "bob@x" })),
    )
    .await;
    wait_for(&mut alice, "USER_BLOCKED").await;

    let queued = state.db.offline_notifications(&email_hash("bob@x")).unwrap();
    assert_eq!(queued.len(), 1);

    // Bob's next authentication drains the queue.
    let mut bob = connect(addr).await;
    assert_eq!(authenticate(&mut bob, "bob@x", "kb").await.t, "AUTH_SUCCESS");
    let event = wait_for(&mut bob, "USER_BLOCKED_EVENT").await;
    assert_eq!(event.data.expect("payload")["senderHash"], email_hash("alice@x"));

    // Delivered exactly once: the row is gone.
    for _ in 0..50 {
        if state
            .db
            .offline_notifications(&email_hash("bob@x"))
            .unwrap()
            .is_empty()
        {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("offline notification row was not removed");
}

#[tokio::test]
async fn turn_creds_require_auth() {
    let (addr, _state) = start_server().await;
    let mut ws = connect(addr).await;

    send_frame(&mut ws, &Frame::of("GET_TURN_CREDS")).await;
    let err = next_frame(&mut ws).await;
    assert_eq!(err.t, "ERROR");
    assert_eq!(err.data.expect("payload")["message"], "Auth required");

    assert_eq!(authenticate(&mut ws, "user@x", "k1").await.t, "AUTH_SUCCESS");
    send_frame(&mut ws, &Frame::of("GET_TURN_CREDS")).await;
    let creds = wait_for(&mut ws, "TURN_CREDS").await;
    let data = creds.data.expect("payload");
    assert_eq!(data["ttl"], 600);
    let username = data["username"].as_str().expect("username");
    assert!(username.ends_with(":user@x"), "{username}");
    let urls = data["urls"].as_array().expect("urls");
    assert!(urls[0]
        .as_str()
        .unwrap()
        .starts_with("turn:turn.example.org:3478"));
}

#[tokio::test]
async fn disconnect_removes_socket_row_and_notifies_peers() {
    let (addr, state) = start_server().await;
    let mut alice = connect(addr).await;
    assert_eq!(authenticate(&mut alice, "alice@x", "ka").await.t, "AUTH_SUCCESS");
    let mut bob = connect(addr).await;
    assert_eq!(authenticate(&mut bob, "bob@x", "kb").await.t, "AUTH_SUCCESS");

    let sid = "f00dface".to_string();
    send_frame(&mut alice, &Frame::in_session("REATTACH", &sid)).await;
    send_frame(&mut bob, &Frame::in_session("REATTACH", &sid)).await;
    wait_for(&mut alice, "PEER_ONLINE").await;

    assert_eq!(state.db.socket_ids_for_user(&email_hash("bob@x")).unwrap().len(), 1);

    bob.close(None).await.expect("close");
    let offline = wait_for(&mut alice, "PEER_OFFLINE").await;
    assert_eq!(offline.sid.as_deref(), Some(sid.as_str()));

    // The socket row follows the connection down.
    for _ in 0..50 {
        if state
            .db
            .socket_ids_for_user(&email_hash("bob@x"))
            .unwrap()
            .is_empty()
        {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("socket row survived disconnect");
}
