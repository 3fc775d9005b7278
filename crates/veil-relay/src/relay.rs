//! Core relay logic: connection lifecycle, registries, and frame
//! handlers.
//!
//! Each WebSocket connection gets one receive task (the only reader)
//! and a transient socket id. Authenticated connections are mirrored
//! into the `sockets` table; in-memory sessions hold the live members
//! of each friendship. Writes to a connection go through its write
//! mutex under a two-second deadline, so a stalled recipient can delay
//! a fan-out but never wedge it, and frames from one sender reach one
//! recipient in send order.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, State};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use chrono::Utc;
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use rand::Rng;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::io::Write;
use std::net::SocketAddr;
use std::ops::ControlFlow;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, error, info, warn};

use veil_core::identity::{email_hash, normalize_email, pair_session_id};
use veil_core::turn;

use crate::auth;
use crate::config::Config;
use crate::frame::Frame;
use crate::limiter::{AuthRateLimiter, MessageWindow};
use crate::storage::Storage;

/// Per-frame read cap.
pub const MAX_FRAME_BYTES: usize = 1024 * 1024;

/// Total ciphertext bytes allowed across one MSG's payload map.
pub const MAX_ENCRYPTED_DATA_BYTES: usize = 400 * 1024;

/// Session ids longer than this are rejected outright.
pub const MAX_SID_LENGTH: usize = 128;

/// Deadline for a single frame write.
const WRITE_DEADLINE: Duration = Duration::from_secs(2);

/// Interval between server PING frames.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(10);

/// Failure modes of a single frame write.
#[derive(Debug, Error)]
pub enum SendError {
    #[error("frame encoding failed: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("write timed out")]
    Timeout,

    #[error(transparent)]
    Transport(#[from] axum::Error),
}

struct ClientState {
    email: String,
    approved: bool,
    window: MessageWindow,
}

/// One live connection. Created on transport upgrade, destroyed on
/// close.
pub struct Client {
    pub id: String,
    writer: Mutex<SplitSink<WebSocket, Message>>,
    state: std::sync::Mutex<ClientState>,
}

impl Client {
    fn new(id: String, writer: SplitSink<WebSocket, Message>) -> Self {
        Self {
            id,
            writer: Mutex::new(writer),
            state: std::sync::Mutex::new(ClientState {
                email: String::new(),
                approved: false,
                window: MessageWindow::default(),
            }),
        }
    }

    /// Email bound at AUTH, or None before authentication.
    pub fn email(&self) -> Option<String> {
        let state = self.state.lock().unwrap();
        if state.email.is_empty() {
            None
        } else {
            Some(state.email.clone())
        }
    }

    fn set_email(&self, email: &str) {
        self.state.lock().unwrap().email = email.to_string();
    }

    fn is_approved(&self) -> bool {
        self.state.lock().unwrap().approved
    }

    fn set_approved(&self) {
        self.state.lock().unwrap().approved = true;
    }

    fn allow_message(&self) -> bool {
        self.state.lock().unwrap().window.allow(Instant::now())
    }

    /// Write one frame under the write mutex and deadline.
    pub async fn send(&self, frame: &Frame) -> Result<(), SendError> {
        let json = serde_json::to_string(frame)?;
        let mut writer = self.writer.lock().await;
        match tokio::time::timeout(WRITE_DEADLINE, writer.send(Message::Text(json.into()))).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(SendError::Transport(e)),
            Err(_) => Err(SendError::Timeout),
        }
    }

    async fn close(&self) {
        let _ = self.writer.lock().await.close().await;
    }
}

/// Live members of one session, keyed by socket id.
pub struct Session {
    pub id: String,
    pub members: Mutex<HashMap<String, Arc<Client>>>,
}

impl Session {
    fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            members: Mutex::new(HashMap::new()),
        }
    }
}

/// Append-only log of redacted connection events. Both endpoints are
/// recorded as email hashes, never as addresses.
pub struct ConnectionLog {
    file: std::sync::Mutex<std::fs::File>,
}

impl ConnectionLog {
    pub fn open(path: &Path) -> std::io::Result<Self> {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)?;
        Ok(Self {
            file: std::sync::Mutex::new(file),
        })
    }

    pub fn record(&self, initiator_email: &str, target_email: &str) {
        let line = format!(
            "CONNECTION: {} requested connection to {} on {}\n",
            email_hash(initiator_email),
            email_hash(target_email),
            Utc::now().to_rfc3339()
        );
        let mut file = self.file.lock().unwrap();
        if let Err(e) = file.write_all(line.as_bytes()) {
            warn!("connection log write failed: {e}");
        }
    }
}

/// Shared server state.
pub struct RelayState {
    /// Socket id → live connection.
    pub clients: RwLock<HashMap<String, Arc<Client>>>,
    /// Session id → live session.
    pub sessions: RwLock<HashMap<String, Arc<Session>>>,
    pub db: Storage,
    pub config: Config,
    pub auth_limiter: AuthRateLimiter,
    pub conn_log: ConnectionLog,
    http: reqwest::Client,
}

impl RelayState {
    pub fn new(db: Storage, config: Config, conn_log: ConnectionLog) -> Self {
        Self {
            clients: RwLock::new(HashMap::new()),
            sessions: RwLock::new(HashMap::new()),
            db,
            config,
            auth_limiter: AuthRateLimiter::new(),
            conn_log,
            http: reqwest::Client::new(),
        }
    }
}

/// Build the single-endpoint router.
pub fn router(state: Arc<RelayState>) -> Router {
    Router::new().route("/", get(ws_handler)).with_state(state)
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    State(state): State<Arc<RelayState>>,
) -> impl IntoResponse {
    let ip = addr.ip().to_string();
    ws.max_message_size(MAX_FRAME_BYTES)
        .on_upgrade(move |socket| handle_connection(socket, ip, state))
}

fn new_socket_id() -> String {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis();
    let suffix: [u8; 8] = rand::rng().random();
    format!("{}_{}", millis, hex::encode(suffix))
}

fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

fn rfc3339_millis(millis: i64) -> String {
    chrono::DateTime::from_timestamp_millis(millis)
        .map(|t| t.to_rfc3339())
        .unwrap_or_default()
}

/// Decode a frame's payload, tolerating absent or partial data the way
/// the handlers expect: missing fields default.
fn payload<T: DeserializeOwned + Default>(frame: &Frame) -> T {
    frame
        .data
        .clone()
        .and_then(|v| serde_json::from_value(v).ok())
        .unwrap_or_default()
}

async fn require_auth(client: &Client, message: &str) -> Option<String> {
    match client.email() {
        Some(email) => Some(email),
        None => {
            let _ = client.send(&Frame::error(message)).await;
            None
        }
    }
}

/// Handle one WebSocket connection for its whole lifetime.
pub async fn handle_connection(socket: WebSocket, ip: String, state: Arc<RelayState>) {
    let (ws_tx, mut ws_rx) = socket.split();
    let client = Arc::new(Client::new(new_socket_id(), ws_tx));
    state
        .clients
        .write()
        .await
        .insert(client.id.clone(), client.clone());
    debug!("client {} connected from {}", client.id, ip);

    spawn_heartbeat(state.clone(), client.clone());

    // Strict single-reader loop. Reading is the only backpressure on
    // this connection; a malformed frame ends it.
    while let Some(Ok(msg)) = ws_rx.next().await {
        let text = match msg {
            Message::Text(text) => text,
            Message::Close(_) => break,
            _ => continue,
        };
        let Ok(frame) = serde_json::from_str::<Frame>(&text) else {
            break;
        };
        if dispatch(&state, &client, frame, &ip).await.is_break() {
            break;
        }
    }

    disconnect(&state, &client).await;
}

fn spawn_heartbeat(state: Arc<RelayState>, client: Arc<Client>) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(HEARTBEAT_INTERVAL);
        ticker.tick().await; // the first tick is immediate
        loop {
            ticker.tick().await;
            if !state.clients.read().await.contains_key(&client.id) {
                return;
            }
            let _ = client.send(&Frame::of("PING")).await;
        }
    });
}

/// Deregister a connection: drop the socket row, leave every session,
/// and tell the remaining members.
async fn disconnect(state: &Arc<RelayState>, client: &Arc<Client>) {
    state.clients.write().await.remove(&client.id);

    if client.email().is_some() {
        if let Err(e) = state.db.delete_socket(&client.id) {
            warn!("socket row cleanup for {} failed: {e}", client.id);
        }
    }

    let sessions: Vec<Arc<Session>> = state.sessions.read().await.values().cloned().collect();
    for session in sessions {
        let mut members = session.members.lock().await;
        if members.remove(&client.id).is_some() {
            for peer in members.values() {
                if let Err(e) = peer.send(&Frame::in_session("PEER_OFFLINE", &session.id)).await {
                    warn!("PEER_OFFLINE to {} failed: {e}", peer.id);
                }
            }
        }
    }

    client.close().await;
    debug!("client {} disconnected", client.id);
}

async fn dispatch(
    state: &Arc<RelayState>,
    client: &Arc<Client>,
    frame: Frame,
    ip: &str,
) -> ControlFlow<()> {
    match frame.t.as_str() {
        "AUTH" => return handle_auth(state, client, &frame, ip).await,
        "UPDATE_PUBKEY" => handle_update_pubkey(state, client, &frame).await,
        "GET_DEVICES" => handle_get_devices(state, client).await,
        "DEVICE_LINK_REQUEST" => handle_device_link_request(state, client, &frame).await,
        "DEVICE_LINK_ACCEPT" => handle_device_link_accept(state, client, &frame).await,
        "DEVICE_LINK_REJECT" => handle_device_link_reject(state, client, &frame).await,
        "FRIEND_REQUEST" => handle_friend_request(state, client, &frame).await,
        "FRIEND_ACCEPT" => handle_friend_accept(state, client, &frame).await,
        "FRIEND_DENY" => handle_friend_deny(state, client, &frame).await,
        "BLOCK_USER" => handle_block_user(state, client, &frame).await,
        "UNBLOCK_USER" => handle_unblock_user(state, client, &frame).await,
        "GET_PENDING_REQUESTS" => handle_get_pending_requests(state, client).await,
        "JOIN_ACCEPT" => handle_join_accept(state, client, &frame).await,
        "JOIN_DENY" => handle_join_deny(state, client, &frame).await,
        "REATTACH" => handle_reattach(state, client, &frame).await,
        "MSG" => handle_msg(state, client, &frame).await,
        "RTC_OFFER" | "RTC_ANSWER" | "RTC_ICE" => handle_rtc(state, client, &frame).await,
        "GET_TURN_CREDS" => handle_get_turn_creds(state, client).await,
        "DELETE_ACCOUNT" => return handle_delete_account(state, client).await,
        _ => {}
    }
    ControlFlow::Continue(())
}

// ── AUTH ──

async fn handle_auth(
    state: &Arc<RelayState>,
    client: &Arc<Client>,
    frame: &Frame,
    ip: &str,
) -> ControlFlow<()> {
    #[derive(Deserialize, Default)]
    #[serde(default, rename_all = "camelCase")]
    struct AuthRequest {
        token: String,
        public_key: String,
    }

    let req: AuthRequest = payload(frame);
    let token = req.token.trim();

    // Bearer-token attempts are IP-limited; session tokens are exempt.
    if !veil_core::token::is_session_token(token) && !state.auth_limiter.check(ip) {
        let _ = client
            .send(&Frame::error("Too many login attempts. Try again later."))
            .await;
        client.close().await;
        return ControlFlow::Break(());
    }

    let now = Utc::now().timestamp();
    let resolved = auth::resolve_token(&state.http, &state.config.session_key, token, now).await;
    let (email, session_token) = match resolved {
        Ok(pair) => pair,
        Err(e) => {
            debug!("auth failed for {}: {e}", client.id);
            let _ = client.send(&Frame::error("Auth failed")).await;
            return ControlFlow::Continue(());
        }
    };
    client.set_email(&email);

    let eh = email_hash(&email);
    let now_ms = now_millis();

    // Resolve the device: first-ever device becomes the approved trust
    // anchor, unknown keys of an existing account start pending.
    let device_count = state.db.device_count(&eh).unwrap_or_else(|e| {
        error!("device count for {eh} failed: {e}");
        0
    });
    let status = if device_count == 0 {
        if !req.public_key.is_empty() {
            if let Err(e) = state
                .db
                .insert_device(&eh, &req.public_key, now_ms, true, "approved")
            {
                error!("device insert for {eh} failed: {e}");
            }
        }
        "approved".to_string()
    } else {
        match state.db.device_auth(&eh, &req.public_key) {
            Ok(Some((status, _))) => {
                if let Err(e) = state.db.touch_device(&eh, &req.public_key, now_ms) {
                    warn!("device touch for {eh} failed: {e}");
                }
                status
            }
            Ok(None) => {
                if !req.public_key.is_empty() {
                    if let Err(e) = state
                        .db
                        .insert_device(&eh, &req.public_key, now_ms, false, "pending")
                    {
                        error!("device insert for {eh} failed: {e}");
                    }
                }
                "pending".to_string()
            }
            Err(e) => {
                error!("device lookup for {eh} failed: {e}");
                "pending".to_string()
            }
        }
    };

    if let Err(e) = state.db.insert_socket(&eh, &client.id, &req.public_key) {
        error!("socket insert for {} failed: {e}", client.id);
    }

    if status == "approved" {
        client.set_approved();
        let _ = client
            .send(&Frame::with_data(
                "AUTH_SUCCESS",
                json!({ "email": email, "token": session_token }),
            ))
            .await;

        let drain_state = state.clone();
        let drain_client = client.clone();
        let drain_hash = eh.clone();
        tokio::spawn(async move {
            drain_offline(&drain_state, &drain_client, &drain_hash).await;
        });

        let hydrate_state = state.clone();
        let hydrate_client = client.clone();
        tokio::spawn(async move {
            hydrate_sessions(&hydrate_state, &hydrate_client, &eh).await;
        });
    } else {
        let master = state.db.master_public_key(&eh).ok().flatten().unwrap_or_default();
        let _ = client
            .send(&Frame::with_data(
                "AUTH_PENDING",
                json!({ "masterPubKey": master, "email": email, "token": session_token }),
            ))
            .await;
    }
    ControlFlow::Continue(())
}

/// Emit queued offline notifications, deleting each one once sent.
async fn drain_offline(state: &Arc<RelayState>, client: &Arc<Client>, eh: &str) {
    let rows = match state.db.offline_notifications(eh) {
        Ok(rows) => rows,
        Err(e) => {
            error!("offline queue read for {eh} failed: {e}");
            return;
        }
    };
    for (id, raw) in rows {
        let Ok(frame) = serde_json::from_str::<Frame>(&raw) else {
            warn!("dropping unparseable offline notification {id}");
            continue;
        };
        if let Err(e) = client.send(&frame).await {
            warn!("offline notification {id} delivery failed: {e}");
        }
        if let Err(e) = state.db.delete_offline(id) {
            warn!("offline notification {id} cleanup failed: {e}");
        }
    }
}

/// Look up every friendship of the freshly authenticated user, join the
/// in-memory sessions, announce presence, and send SESSION_LIST.
async fn hydrate_sessions(state: &Arc<RelayState>, client: &Arc<Client>, eh: &str) {
    let friendships = match state.db.friendships_for(eh) {
        Ok(friendships) => friendships,
        Err(e) => {
            error!("friendship lookup for {eh} failed: {e}");
            return;
        }
    };
    let own_keys = state.db.connected_approved_keys(eh).unwrap_or_default();

    let mut entries = Vec::new();
    for friendship in friendships {
        let peer_hash = if friendship.user1_hash == eh {
            friendship.user2_hash.clone()
        } else {
            friendship.user1_hash.clone()
        };
        let online = state.db.online_approved_count(&peer_hash).unwrap_or(0) > 0;
        let peer_keys = if online {
            state.db.connected_approved_keys(&peer_hash).unwrap_or_default()
        } else {
            Vec::new()
        };
        entries.push(json!({
            "sid": friendship.sid,
            "online": online,
            "peerHash": peer_hash,
            "peerPubKeys": peer_keys,
            "ownPubKeys": own_keys,
        }));

        let session = get_or_create_session(state, &friendship.sid).await;
        let mut members = session.members.lock().await;
        members.insert(client.id.clone(), client.clone());
        let mut online_frame = Frame::in_session("PEER_ONLINE", &friendship.sid);
        online_frame.data = Some(json!({ "peerPubKeys": own_keys }));
        for peer in members.values() {
            if peer.id != client.id {
                if let Err(e) = peer.send(&online_frame).await {
                    warn!("PEER_ONLINE to {} failed: {e}", peer.id);
                }
            }
        }
    }

    let _ = client
        .send(&Frame::with_data("SESSION_LIST", Value::Array(entries)))
        .await;
}

async fn get_or_create_session(state: &Arc<RelayState>, sid: &str) -> Arc<Session> {
    let mut sessions = state.sessions.write().await;
    if let Some(session) = sessions.get(sid) {
        return session.clone();
    }
    let session = Arc::new(Session::new(sid));
    sessions.insert(sid.to_string(), session.clone());
    session
}

async fn client_by_socket(state: &Arc<RelayState>, socket_id: &str) -> Option<Arc<Client>> {
    state.clients.read().await.get(socket_id).cloned()
}

/// Send a frame to every listed socket. Returns true if at least one
/// write succeeded; failures are logged per recipient.
async fn send_to_sockets(state: &Arc<RelayState>, socket_ids: &[String], frame: &Frame) -> bool {
    let mut delivered = false;
    for socket_id in socket_ids {
        if let Some(target) = client_by_socket(state, socket_id).await {
            match target.send(frame).await {
                Ok(()) => delivered = true,
                Err(e) => warn!("send to {socket_id} failed: {e}"),
            }
        }
    }
    delivered
}

/// Deliver to every live socket of the target, or queue once for their
/// next authentication if none exist.
async fn deliver_or_queue(state: &Arc<RelayState>, target_hash: &str, frame: &Frame) {
    let socket_ids = state.db.socket_ids_for_user(target_hash).unwrap_or_default();
    if socket_ids.is_empty() {
        if let Ok(raw) = serde_json::to_string(frame) {
            if let Err(e) = state.db.enqueue_offline(target_hash, &raw, now_millis()) {
                warn!("offline enqueue for {target_hash} failed: {e}");
            }
        }
    } else {
        send_to_sockets(state, &socket_ids, frame).await;
    }
}

// ── Device management ──

async fn handle_update_pubkey(state: &Arc<RelayState>, client: &Arc<Client>, frame: &Frame) {
    #[derive(Deserialize, Default)]
    #[serde(default, rename_all = "camelCase")]
    struct UpdateKey {
        public_key: String,
    }

    let Some(email) = require_auth(client, "Auth required").await else {
        return;
    };
    let req: UpdateKey = payload(frame);
    if req.public_key.is_empty() {
        return;
    }
    let eh = email_hash(&email);
    let Ok(Some(old_key)) = state.db.socket_public_key(&client.id) else {
        return;
    };
    if let Err(e) = state.db.rotate_device_key(&eh, &old_key, &req.public_key) {
        error!("key rotation for {eh} failed: {e}");
    }
}

async fn handle_get_devices(state: &Arc<RelayState>, client: &Arc<Client>) {
    let Some(email) = require_auth(client, "Auth required").await else {
        return;
    };
    let eh = email_hash(&email);
    let devices = match state.db.list_devices(&eh) {
        Ok(devices) => devices,
        Err(e) => {
            error!("device listing for {eh} failed: {e}");
            let _ = client.send(&Frame::error("Failed to get devices")).await;
            return;
        }
    };
    let _ = client
        .send(&Frame::with_data("DEVICE_LIST", device_list_json(&devices)))
        .await;
}

fn device_list_json(devices: &[crate::storage::DeviceRecord]) -> Value {
    let list: Vec<Value> = devices
        .iter()
        .map(|d| {
            json!({
                "publicKey": d.public_key,
                "lastActive": rfc3339_millis(d.last_active),
                "isMaster": d.is_master,
                "status": d.status,
            })
        })
        .collect();
    json!({ "devices": list })
}

/// Push a fresh device list to every connected socket of the user.
async fn broadcast_device_list(state: &Arc<RelayState>, eh: &str) {
    let devices = match state.db.list_devices(eh) {
        Ok(devices) => devices,
        Err(e) => {
            error!("device listing for {eh} failed: {e}");
            return;
        }
    };
    if devices.is_empty() {
        return;
    }
    let frame = Frame::with_data("DEVICE_LIST", device_list_json(&devices));
    let socket_ids = state.db.socket_ids_for_user(eh).unwrap_or_default();
    send_to_sockets(state, &socket_ids, &frame).await;
}

async fn handle_device_link_request(state: &Arc<RelayState>, client: &Arc<Client>, frame: &Frame) {
    #[derive(Deserialize, Default)]
    #[serde(default, rename_all = "camelCase")]
    struct LinkRequest {
        encrypted_specs: String,
        target_pub_key: String,
    }

    let Some(email) = require_auth(client, "Auth required").await else {
        return;
    };
    let req: LinkRequest = payload(frame);
    let eh = email_hash(&email);
    let sender_key = state
        .db
        .socket_public_key(&client.id)
        .ok()
        .flatten()
        .unwrap_or_default();

    let socket_ids = state
        .db
        .socket_ids_for_key(&eh, &req.target_pub_key)
        .unwrap_or_default();
    let forward = Frame::with_data(
        "DEVICE_LINK_REQUEST",
        json!({ "encryptedSpecs": req.encrypted_specs, "senderPubKey": sender_key }),
    );
    send_to_sockets(state, &socket_ids, &forward).await;
}

/// Re-read the caller's device status through its live socket; only an
/// approved device may decide a link request.
async fn caller_is_approved_device(state: &Arc<RelayState>, client: &Arc<Client>) -> bool {
    matches!(
        state.db.device_status_for_socket(&client.id),
        Ok(Some(ref status)) if status == "approved"
    )
}

async fn handle_device_link_accept(state: &Arc<RelayState>, client: &Arc<Client>, frame: &Frame) {
    #[derive(Deserialize, Default)]
    #[serde(default, rename_all = "camelCase")]
    struct LinkTarget {
        target_pub_key: String,
    }

    let Some(email) = require_auth(client, "Auth required").await else {
        return;
    };
    if !caller_is_approved_device(state, client).await {
        return;
    }
    let req: LinkTarget = payload(frame);
    let eh = email_hash(&email);

    if let Err(e) = state.db.approve_device(&eh, &req.target_pub_key) {
        error!("device approval for {eh} failed: {e}");
        return;
    }
    let socket_ids = state
        .db
        .socket_ids_for_key(&eh, &req.target_pub_key)
        .unwrap_or_default();
    send_to_sockets(state, &socket_ids, &Frame::of("DEVICE_LINK_ACCEPTED")).await;

    broadcast_device_list(state, &eh).await;
}

async fn handle_device_link_reject(state: &Arc<RelayState>, client: &Arc<Client>, frame: &Frame) {
    #[derive(Deserialize, Default)]
    #[serde(default, rename_all = "camelCase")]
    struct LinkTarget {
        target_pub_key: String,
    }

    let Some(email) = require_auth(client, "Auth required").await else {
        return;
    };
    if !caller_is_approved_device(state, client).await {
        return;
    }
    let req: LinkTarget = payload(frame);
    let eh = email_hash(&email);

    let socket_ids = state
        .db
        .socket_ids_for_key(&eh, &req.target_pub_key)
        .unwrap_or_default();
    if let Err(e) = state.db.delete_device(&eh, &req.target_pub_key) {
        error!("device removal for {eh} failed: {e}");
    }
    for socket_id in &socket_ids {
        if let Some(target) = client_by_socket(state, socket_id).await {
            let _ = target.send(&Frame::of("DEVICE_LINK_REJECTED")).await;
            target.close().await;
        }
    }

    broadcast_device_list(state, &eh).await;
}

// ── Friendship lifecycle ──

async fn handle_friend_request(state: &Arc<RelayState>, client: &Arc<Client>, frame: &Frame) {
    #[derive(Deserialize, Default)]
    #[serde(default, rename_all = "camelCase")]
    struct FriendRequest {
        target_email: String,
        encrypted_packet: String,
    }

    if !client.is_approved() {
        let _ = client
            .send(&Frame::error(
                "Device pending approval. Please sync your device in Settings.",
            ))
            .await;
        return;
    }
    let Some(email) = require_auth(client, "Auth required").await else {
        return;
    };
    let req: FriendRequest = payload(frame);
    let target_email = normalize_email(&req.target_email);
    let target_hash = email_hash(&target_email);
    let sender_hash = email_hash(&email);

    if let Err(e) =
        state
            .db
            .upsert_friend_request(&sender_hash, &target_hash, &req.encrypted_packet, now_millis())
    {
        error!("friend request store failed: {e}");
        let _ = client.send(&Frame::error("Failed to store request")).await;
        return;
    }
    state.conn_log.record(&email, &target_email);

    let sender_keys = state.db.connected_public_keys(&sender_hash).unwrap_or_default();
    let forward = Frame::with_data(
        "FRIEND_REQUEST",
        json!({
            "senderHash": sender_hash,
            "encryptedPacket": req.encrypted_packet,
            "publicKeys": sender_keys,
        }),
    );
    let socket_ids = state.db.socket_ids_for_user(&target_hash).unwrap_or_default();
    send_to_sockets(state, &socket_ids, &forward).await;

    let _ = client
        .send(&Frame::with_data("REQUEST_SENT", json!({ "success": true })))
        .await;
}

async fn handle_friend_accept(state: &Arc<RelayState>, client: &Arc<Client>, frame: &Frame) {
    #[derive(Deserialize, Default)]
    #[serde(default, rename_all = "camelCase")]
    struct FriendAccept {
        target_email: String,
        encrypted_packet: String,
    }

    let Some(email) = require_auth(client, "Auth required").await else {
        return;
    };
    let req: FriendAccept = payload(frame);
    let target_email = normalize_email(&req.target_email);
    let target_hash = email_hash(&target_email);
    let sender_hash = email_hash(&email);

    let (user1, user2) = if sender_hash <= target_hash {
        (sender_hash.clone(), target_hash.clone())
    } else {
        (target_hash.clone(), sender_hash.clone())
    };
    let sid = pair_session_id(&email, &target_email);

    if let Err(e) = state.db.insert_friendship(&user1, &user2, now_millis(), &sid) {
        error!("friendship insert failed: {e}");
    }
    // The accepted request ran target → me.
    if let Err(e) = state.db.delete_friend_request(&target_hash, &sender_hash) {
        warn!("request cleanup failed: {e}");
    }

    let my_keys = state.db.connected_public_keys(&sender_hash).unwrap_or_default();
    let forward = Frame::with_data(
        "FRIEND_ACCEPTED",
        json!({
            "senderHash": sender_hash,
            "encryptedPacket": req.encrypted_packet,
            "publicKeys": my_keys,
        }),
    );
    let socket_ids = state.db.socket_ids_for_user(&target_hash).unwrap_or_default();
    send_to_sockets(state, &socket_ids, &forward).await;

    let _ = client
        .send(&Frame::with_data(
            "FRIEND_ACCEPTED_ACK",
            json!({ "targetEmail": target_email }),
        ))
        .await;
}

async fn handle_friend_deny(state: &Arc<RelayState>, client: &Arc<Client>, frame: &Frame) {
    #[derive(Deserialize, Default)]
    #[serde(default, rename_all = "camelCase")]
    struct TargetEmail {
        target_email: String,
    }

    let Some(email) = require_auth(client, "Auth required").await else {
        return;
    };
    let req: TargetEmail = payload(frame);
    let target_hash = email_hash(&req.target_email);
    let sender_hash = email_hash(&email);

    if let Err(e) = state.db.delete_friend_request(&target_hash, &sender_hash) {
        warn!("request cleanup failed: {e}");
    }
    let denied = Frame::with_data("FRIEND_DENIED", json!({ "senderHash": sender_hash }));
    deliver_or_queue(state, &target_hash, &denied).await;
}

async fn handle_block_user(state: &Arc<RelayState>, client: &Arc<Client>, frame: &Frame) {
    #[derive(Deserialize, Default)]
    #[serde(default, rename_all = "camelCase")]
    struct TargetEmail {
        target_email: String,
    }

    let Some(email) = require_auth(client, "Auth required").await else {
        return;
    };
    let req: TargetEmail = payload(frame);
    let target_hash = email_hash(&req.target_email);
    let sender_hash = email_hash(&email);

    if let Err(e) = state.db.delete_friend_request(&target_hash, &sender_hash) {
        warn!("request cleanup failed: {e}");
    }
    if let Err(e) = state.db.delete_friend_request(&sender_hash, &target_hash) {
        warn!("request cleanup failed: {e}");
    }
    if let Err(e) = state.db.delete_friendship_pair(&sender_hash, &target_hash) {
        warn!("friendship cleanup failed: {e}");
    }

    let event = Frame::with_data("USER_BLOCKED_EVENT", json!({ "senderHash": sender_hash }));
    deliver_or_queue(state, &target_hash, &event).await;

    let _ = client
        .send(&Frame::with_data(
            "USER_BLOCKED",
            json!({ "success": true, "targetEmail": req.target_email }),
        ))
        .await;
}

async fn handle_unblock_user(state: &Arc<RelayState>, client: &Arc<Client>, frame: &Frame) {
    #[derive(Deserialize, Default)]
    #[serde(default, rename_all = "camelCase")]
    struct TargetEmail {
        target_email: String,
    }

    let Some(email) = require_auth(client, "Auth required").await else {
        return;
    };
    let req: TargetEmail = payload(frame);
    let target_hash = email_hash(&req.target_email);
    let sender_hash = email_hash(&email);

    let event = Frame::with_data("USER_UNBLOCKED_EVENT", json!({ "senderHash": sender_hash }));
    deliver_or_queue(state, &target_hash, &event).await;

    let _ = client
        .send(&Frame::with_data(
            "USER_UNBLOCKED",
            json!({ "success": true, "targetEmail": req.target_email }),
        ))
        .await;
}

async fn handle_get_pending_requests(state: &Arc<RelayState>, client: &Arc<Client>) {
    let Some(email) = require_auth(client, "Auth required").await else {
        return;
    };
    let my_hash = email_hash(&email);
    let requests = match state.db.pending_requests_for(&my_hash) {
        Ok(requests) => requests,
        Err(e) => {
            error!("pending request lookup failed: {e}");
            return;
        }
    };
    let entries: Vec<Value> = requests
        .iter()
        .map(|r| {
            json!({
                "senderHash": r.sender_hash,
                "encryptedPacket": r.encrypted_packet,
                "timestamp": rfc3339_millis(r.timestamp),
            })
        })
        .collect();
    let _ = client
        .send(&Frame::with_data("PENDING_REQUESTS", Value::Array(entries)))
        .await;
}

// ── Session attach ──

async fn handle_join_accept(state: &Arc<RelayState>, client: &Arc<Client>, frame: &Frame) {
    #[derive(Deserialize, Default)]
    #[serde(default, rename_all = "camelCase")]
    struct JoinPayload {
        public_key: String,
        sender_name: String,
        sender_avatar: String,
        sender_name_ver: i64,
        sender_avatar_ver: i64,
    }

    let Some(email) = require_auth(client, "Auth required").await else {
        return;
    };
    let Some(sid) = frame.sid.as_deref() else {
        return;
    };
    let session = { state.sessions.read().await.get(sid).cloned() };
    let Some(session) = session else {
        return;
    };

    let req: JoinPayload = payload(frame);
    let mut join = Frame::in_session("JOIN_ACCEPT", sid);
    join.data = Some(json!({
        "publicKey": req.public_key,
        "email": normalize_email(&email),
        "emailHash": email_hash(&email),
        "name": req.sender_name,
        "avatar": req.sender_avatar,
        "nameVersion": req.sender_name_ver,
        "avatarVersion": req.sender_avatar_ver,
    }));

    let mut members = session.members.lock().await;
    members.insert(client.id.clone(), client.clone());
    for peer in members.values() {
        if peer.id != client.id {
            if let Err(e) = peer.send(&join).await {
                warn!("JOIN_ACCEPT to {} failed: {e}", peer.id);
            }
        }
    }
}

async fn handle_join_deny(state: &Arc<RelayState>, client: &Arc<Client>, frame: &Frame) {
    if require_auth(client, "Auth required").await.is_none() {
        return;
    }
    let Some(sid) = frame.sid.as_deref() else {
        return;
    };
    let session = { state.sessions.read().await.get(sid).cloned() };
    let Some(session) = session else {
        return;
    };
    let members = session.members.lock().await;
    for peer in members.values() {
        if peer.id != client.id {
            let _ = peer.send(&Frame::in_session("JOIN_DENIED", sid)).await;
        }
    }
}

async fn handle_reattach(state: &Arc<RelayState>, client: &Arc<Client>, frame: &Frame) {
    if require_auth(client, "Authentication required").await.is_none() {
        return;
    }
    let sid = frame.sid.clone().unwrap_or_default();
    let session = get_or_create_session(state, &sid).await;

    let mut members = session.members.lock().await;
    members.insert(client.id.clone(), client.clone());
    let online = Frame::in_session("PEER_ONLINE", &sid);
    for peer in members.values() {
        if peer.id != client.id {
            let _ = peer.send(&online).await;
            let _ = client.send(&online).await;
        }
    }
    drop(members);

    debug!("client {} reattached to session {}", client.id, sid);
}

// ── Message relay ──

async fn handle_msg(state: &Arc<RelayState>, client: &Arc<Client>, frame: &Frame) {
    #[derive(Deserialize)]
    struct MsgPayload {
        #[serde(default)]
        payloads: HashMap<String, String>,
    }

    if !client.is_approved() {
        let _ = client
            .send(&Frame::error(
                "Device pending approval. Please sync your device in Settings.",
            ))
            .await;
        return;
    }
    let Some(email) = require_auth(client, "Auth required").await else {
        return;
    };
    let sid = frame.sid.clone().unwrap_or_default();
    if sid.is_empty() || sid.len() > MAX_SID_LENGTH {
        let _ = client.send(&Frame::error("Invalid session id")).await;
        return;
    }
    if !client.allow_message() {
        let _ = client
            .send(&Frame::error(
                "Rate limit exceeded: Too many messages per second",
            ))
            .await;
        return;
    }
    let parsed = frame
        .data
        .clone()
        .and_then(|v| serde_json::from_value::<MsgPayload>(v).ok());
    let Some(msg) = parsed else {
        let _ = client.send(&Frame::error("Invalid message format")).await;
        return;
    };
    if msg.payloads.is_empty() {
        let _ = client.send(&Frame::error("Message payloads missing")).await;
        return;
    }
    let total_size: usize = msg.payloads.values().map(|p| p.len()).sum();
    if total_size > MAX_ENCRYPTED_DATA_BYTES {
        let _ = client.send(&Frame::error("Message payload too large")).await;
        return;
    }

    let sender_hash = email_hash(&email);
    let is_friend = state.db.friendship_exists(&sid, &sender_hash).unwrap_or(false);
    if !is_friend {
        let _ = client
            .send(&Frame::error(
                "You cannot send messages to this user because you are not connected.",
            ))
            .await;
        return;
    }

    // Autovivify the session with the sender as sole member; if it
    // already existed the sender must have attached to it.
    let (session, created) = {
        let mut sessions = state.sessions.write().await;
        match sessions.get(&sid) {
            Some(session) => (session.clone(), false),
            None => {
                let session = Arc::new(Session::new(&sid));
                sessions.insert(sid.clone(), session.clone());
                debug!("auto-created session {sid} from MSG");
                (session, true)
            }
        }
    };

    let mut members = session.members.lock().await;
    if created {
        members.insert(client.id.clone(), client.clone());
    } else if !members.contains_key(&client.id) {
        drop(members);
        let _ = client.send(&Frame::error("Not a member of this session")).await;
        return;
    }

    let relay = Frame {
        t: "MSG".to_string(),
        sid: Some(sid.clone()),
        sh: Some(sender_hash),
        data: Some(json!({ "payloads": msg.payloads })),
        ..Default::default()
    };
    let mut delivered = false;
    let mut recipients = 0;
    for peer in members.values() {
        if peer.id != client.id {
            recipients += 1;
            match peer.send(&relay).await {
                Ok(()) => delivered = true,
                Err(e) => warn!("relay to {} failed: {e}", peer.id),
            }
        }
    }
    drop(members);
    debug!("relayed MSG in {sid} to {recipients} recipients (delivered: {delivered})");

    if frame.c {
        let ack = if delivered { "DELIVERED" } else { "DELIVERED_FAILED" };
        let _ = client.send(&Frame::in_session(ack, &sid)).await;
    }
}

// ── WebRTC signaling ──

async fn handle_rtc(state: &Arc<RelayState>, client: &Arc<Client>, frame: &Frame) {
    if require_auth(client, "Auth required").await.is_none() {
        return;
    }
    let sid = frame.sid.clone().unwrap_or_default();
    let session = { state.sessions.read().await.get(&sid).cloned() };
    let Some(session) = session else {
        return;
    };

    // With a target key, restrict to that device's current sockets; a
    // stale target silently matches nothing. Without one, forward to
    // the whole session.
    let target_socket_ids = match frame.target_pub_key.as_deref() {
        Some(key) if !key.is_empty() => {
            Some(state.db.socket_ids_for_public_key(key).unwrap_or_default())
        }
        _ => None,
    };

    let members = session.members.lock().await;
    for peer in members.values() {
        if peer.id == client.id {
            continue;
        }
        if let Some(ref targets) = target_socket_ids {
            if !targets.contains(&peer.id) {
                continue;
            }
        }
        if let Err(e) = peer.send(frame).await {
            warn!("signaling forward to {} failed: {e}", peer.id);
        }
    }
}

// ── TURN credentials ──

async fn handle_get_turn_creds(state: &Arc<RelayState>, client: &Arc<Client>) {
    let Some(email) = require_auth(client, "Auth required").await else {
        return;
    };
    let creds = turn::issue(&email, &state.config.turn_secret, Utc::now().timestamp());
    let host = &state.config.turn_host;
    let _ = client
        .send(&Frame::with_data(
            "TURN_CREDS",
            json!({
                "urls": [
                    format!("turn:{host}:3478?transport=udp"),
                    format!("turn:{host}:3478?transport=tcp"),
                ],
                "username": creds.username,
                "credential": creds.credential,
                "ttl": turn::TURN_TTL_SECS,
            }),
        ))
        .await;
}

// ── Account deletion ──

async fn handle_delete_account(state: &Arc<RelayState>, client: &Arc<Client>) -> ControlFlow<()> {
    let Some(email) = require_auth(client, "Authentication required").await else {
        return ControlFlow::Continue(());
    };
    let eh = email_hash(&email);

    let sids = state.db.friend_session_ids(&eh).unwrap_or_default();

    if let Err(e) = state.db.delete_devices_for(&eh) {
        error!("device cleanup for {eh} failed: {e}");
    }
    if let Err(e) = state.db.delete_sockets_for(&eh) {
        error!("socket cleanup for {eh} failed: {e}");
    }
    if let Err(e) = state.db.delete_requests_for(&eh) {
        warn!("request cleanup for {eh} failed: {e}");
    }
    if let Err(e) = state.db.delete_offline_for(&eh) {
        warn!("offline queue cleanup for {eh} failed: {e}");
    }

    for sid in &sids {
        let session = { state.sessions.read().await.get(sid).cloned() };
        if let Some(session) = session {
            let members = session.members.lock().await;
            for peer in members.values() {
                if peer.id != client.id {
                    let _ = peer.send(&Frame::in_session("PEER_OFFLINE", sid)).await;
                }
            }
        }
    }

    if let Err(e) = state.db.delete_friendships_for(&eh) {
        error!("friendship cleanup for {eh} failed: {e}");
    }

    info!("deleted account {eh}");
    client.close().await;
    ControlFlow::Break(())
}
