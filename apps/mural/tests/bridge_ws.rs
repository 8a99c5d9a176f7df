//! Bridge tests against a live in-process relay stub. The stub verifies the
//! same HMAC material a real relay would, so these cover the whole path from
//! keychain secret to acknowledged socket.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc, oneshot, Mutex as AsyncMutex};
use tokio::time::timeout;
use tracing_subscriber::{fmt::SubscriberBuilder, EnvFilter};
use url::Url;

use mural_client_core::config::RelayEnv;
use mural_client_core::identity::secrets::{MemorySecretStore, SecretStore};
use mural_client_core::identity::PcIdentity;
use mural_client_core::relay::bridge::{
    BridgeEvent, BridgeStatus, BridgeTuning, MobileControl, PcBridge,
};
use mural_client_core::relay::http::RelayHttpClient;
use mural_client_core::relay::signing::{
    payload_hash, RequestSigner, EMPTY_PAYLOAD_HASH, HEADER_IAT, HEADER_NONCE, HEADER_SIGNATURE,
    WS_AUTH_OP,
};

const EVENT_ID: &str = "demo";
const PC_ID: &str = "booth-01";
const EVENT_SECRET: &str = "shared-event-secret";
const SKEWED_SERVER_TIME: i64 = 1_700_000_000;

#[derive(Clone, Copy, PartialEq, Eq)]
enum AuthBehavior {
    /// Verify the signature and ack, as a healthy relay would.
    AckWhenValid,
    /// Swallow auth frames so hello and timeout paths fire.
    StaySilent,
    /// Reject the first attempt with a clock skew error, ack a valid retry.
    SkewFirst,
    /// Close the first socket before auth, behave normally afterwards.
    DropFirstConnection,
}

struct RelayStub {
    behavior: AuthBehavior,
    register_calls: AtomicUsize,
    connections: AtomicUsize,
    auth_attempts: AsyncMutex<Vec<Value>>,
    from_pc: mpsc::UnboundedSender<Value>,
    to_pc: broadcast::Sender<String>,
}

impl RelayStub {
    fn new(behavior: AuthBehavior) -> (Arc<Self>, mpsc::UnboundedReceiver<Value>) {
        let (from_pc, frames) = mpsc::unbounded_channel();
        let (to_pc, _) = broadcast::channel(32);
        (
            Arc::new(Self {
                behavior,
                register_calls: AtomicUsize::new(0),
                connections: AtomicUsize::new(0),
                auth_attempts: AsyncMutex::new(Vec::new()),
                from_pc,
                to_pc,
            }),
            frames,
        )
    }

    fn inject(&self, frame: Value) {
        let _ = self.to_pc.send(frame.to_string());
    }
}

fn ws_path() -> String {
    format!("/e/{EVENT_ID}/ws")
}

fn signature_valid(frame: &Value) -> bool {
    let (Some(op), Some(path), Some(hash), Some(iat), Some(nonce), Some(sig), Some(pcid)) = (
        frame.get("op").and_then(Value::as_str),
        frame.get("path").and_then(Value::as_str),
        frame.get("payloadHash").and_then(Value::as_str),
        frame.get("iat").and_then(Value::as_i64),
        frame.get("nonce").and_then(Value::as_str),
        frame.get("sig").and_then(Value::as_str),
        frame.get("pcid").and_then(Value::as_str),
    ) else {
        return false;
    };
    op == WS_AUTH_OP
        && path == ws_path()
        && hash == EMPTY_PAYLOAD_HASH
        && pcid == PC_ID
        && RequestSigner::new(EVENT_SECRET).sign(op, path, hash, iat, nonce) == sig
}

fn http_signature_valid(headers: &HeaderMap, path: &str, body: &[u8]) -> bool {
    let header = |name: &str| headers.get(name).and_then(|value| value.to_str().ok());
    let (Some(iat), Some(nonce), Some(sig)) = (
        header(HEADER_IAT),
        header(HEADER_NONCE),
        header(HEADER_SIGNATURE),
    ) else {
        return false;
    };
    let Ok(iat) = iat.parse::<i64>() else {
        return false;
    };
    RequestSigner::new(EVENT_SECRET).sign("POST", path, &payload_hash(body), iat, nonce) == sig
}

async fn register_pc(
    State(stub): State<Arc<RelayStub>>,
    Path(event): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> (StatusCode, Json<Value>) {
    if event != EVENT_ID {
        return (StatusCode::NOT_FOUND, Json(json!({})));
    }
    stub.register_calls.fetch_add(1, Ordering::SeqCst);
    if !http_signature_valid(&headers, &format!("/e/{event}/register-pc"), &body) {
        return (
            StatusCode::UNAUTHORIZED,
            Json(json!({ "code": "E_BAD_TOKEN" })),
        );
    }
    (StatusCode::OK, Json(json!({})))
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(stub): State<Arc<RelayStub>>,
    Path(event): Path<String>,
) -> impl IntoResponse {
    if event != EVENT_ID {
        return (StatusCode::NOT_FOUND, "unknown event").into_response();
    }
    ws.protocols(["v1"])
        .on_upgrade(move |socket| handle_socket(socket, stub))
}

async fn handle_socket(mut socket: WebSocket, stub: Arc<RelayStub>) {
    let connection = stub.connections.fetch_add(1, Ordering::SeqCst);
    if stub.behavior == AuthBehavior::DropFirstConnection && connection == 0 {
        let _ = socket.send(WsMessage::Close(None)).await;
        return;
    }
    let (mut sender, mut receiver) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<WsMessage>();

    let send_task = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            if sender.send(message).await.is_err() {
                break;
            }
        }
    });

    let mut inject = stub.to_pc.subscribe();
    let inject_tx = tx.clone();
    let inject_task = tokio::spawn(async move {
        while let Ok(text) = inject.recv().await {
            if inject_tx.send(WsMessage::Text(text)).is_err() {
                break;
            }
        }
    });

    while let Some(result) = receiver.next().await {
        let msg = match result {
            Ok(msg) => msg,
            Err(_) => break,
        };
        let WsMessage::Text(text) = msg else {
            if matches!(msg, WsMessage::Close(_)) {
                break;
            }
            continue;
        };
        let Ok(frame) = serde_json::from_str::<Value>(&text) else {
            continue;
        };
        let _ = stub.from_pc.send(frame.clone());
        if frame.get("type").and_then(Value::as_str) != Some("pc-auth") {
            continue;
        }
        let attempt = {
            let mut attempts = stub.auth_attempts.lock().await;
            attempts.push(frame.clone());
            attempts.len()
        };
        let reply = match stub.behavior {
            AuthBehavior::StaySilent => None,
            AuthBehavior::SkewFirst if attempt == 1 => Some(json!({
                "v": 1,
                "type": "pc-err",
                "code": "E_CLOCK_SKEW",
                "serverTime": SKEWED_SERVER_TIME,
            })),
            AuthBehavior::SkewFirst => {
                if frame.get("iat").and_then(Value::as_i64) == Some(SKEWED_SERVER_TIME)
                    && signature_valid(&frame)
                {
                    Some(json!({ "v": 1, "type": "pc-ack" }))
                } else {
                    Some(json!({ "v": 1, "type": "pc-err", "code": "E_BAD_TOKEN" }))
                }
            }
            AuthBehavior::AckWhenValid | AuthBehavior::DropFirstConnection => {
                if signature_valid(&frame) {
                    Some(json!({ "v": 1, "type": "pc-ack" }))
                } else {
                    Some(json!({ "v": 1, "type": "pc-err", "code": "E_BAD_TOKEN" }))
                }
            }
        };
        if let Some(reply) = reply {
            let _ = tx.send(WsMessage::Text(reply.to_string()));
        }
    }

    send_task.abort();
    inject_task.abort();
}

async fn spawn_relay(stub: Arc<RelayStub>) -> (SocketAddr, oneshot::Sender<()>) {
    let router = Router::new()
        .route("/e/:event/register-pc", post(register_pc))
        .route("/e/:event/ws", get(ws_handler))
        .with_state(stub);
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("listener bind");
    let addr = listener.local_addr().expect("local addr");
    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    tokio::spawn(async move {
        axum::serve(listener, router)
            .with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
            })
            .await
            .ok();
    });
    (addr, shutdown_tx)
}

fn bridge_for(addr: SocketAddr, secret: &str, tuning: BridgeTuning) -> PcBridge {
    let secrets = Arc::new(MemorySecretStore::new());
    secrets
        .set_event_secret(RelayEnv::Production, secret)
        .expect("store secret");
    let base = Url::parse(&format!("http://{addr}")).expect("base url");
    let http = Arc::new(
        RelayHttpClient::new(base, RelayEnv::Production, secrets.clone()).expect("http client"),
    );
    let identity = PcIdentity::new(EVENT_ID, PC_ID).expect("identity");
    let ws_url = Url::parse(&format!("ws://{addr}{}", ws_path())).expect("ws url");
    PcBridge::with_tuning(http, secrets, identity, ws_url, tuning)
}

fn fast_tuning() -> BridgeTuning {
    BridgeTuning {
        auth_ack_timeout: Duration::from_millis(2_000),
        hello_fallback: Duration::from_millis(1_000),
        heartbeat_interval: Duration::from_millis(200),
        restart_delay: Duration::from_millis(150),
        restart_jitter: Duration::ZERO,
    }
}

fn init_tracing() {
    let _ = SubscriberBuilder::default()
        .with_test_writer()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init();
}

async fn wait_for_status(rx: &mut broadcast::Receiver<BridgeStatus>, want: BridgeStatus) {
    loop {
        let status = timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("status timeout")
            .expect("status channel closed");
        if status == want {
            return;
        }
    }
}

async fn next_frame_of(rx: &mut mpsc::UnboundedReceiver<Value>, kind: &str) -> Value {
    loop {
        let frame = timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("frame timeout")
            .expect("relay stub gone");
        if frame.get("type").and_then(Value::as_str) == Some(kind) {
            return frame;
        }
    }
}

async fn next_event(rx: &mut broadcast::Receiver<BridgeEvent>) -> BridgeEvent {
    timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("event timeout")
        .expect("event channel closed")
}

#[test_timeout::tokio_timeout_test]
async fn bridge_authenticates_heartbeats_and_routes_input() {
    init_tracing();
    let (stub, mut frames) = RelayStub::new(AuthBehavior::AckWhenValid);
    let (addr, shutdown) = spawn_relay(stub.clone()).await;

    let bridge = bridge_for(addr, EVENT_SECRET, fast_tuning());
    let mut status_rx = bridge.subscribe_status();
    let mut event_rx = bridge.subscribe_events();
    bridge.start();

    wait_for_status(&mut status_rx, BridgeStatus::Open).await;
    assert_eq!(stub.register_calls.load(Ordering::SeqCst), 1);

    // Heartbeats start flowing once the relay has acked.
    next_frame_of(&mut frames, "hb").await;
    next_frame_of(&mut frames, "hb").await;

    stub.inject(json!({
        "v": 1,
        "type": "cmd",
        "payload": { "cmd": "move", "args": { "direction": "left" }, "imageId": "img-7" },
    }));
    match next_event(&mut event_rx).await {
        BridgeEvent::Control(MobileControl::Move {
            direction,
            image_id,
        }) => {
            assert_eq!(direction, "left");
            assert_eq!(image_id.as_deref(), Some("img-7"));
        }
        other => panic!("unexpected event: {other:?}"),
    }

    stub.inject(json!({ "v": 1, "type": "evt", "evt": "mobile-connected", "sid": "ABCDEFGHJK" }));
    match next_event(&mut event_rx).await {
        BridgeEvent::MobileConnected { sid } => assert_eq!(sid, "ABCDEFGHJK"),
        other => panic!("unexpected event: {other:?}"),
    }

    bridge.stop();
    shutdown.send(()).ok();
}

#[test_timeout::tokio_timeout_test]
async fn quiet_relay_gets_hello_and_late_ack_still_opens() {
    init_tracing();
    let (stub, mut frames) = RelayStub::new(AuthBehavior::StaySilent);
    let (addr, shutdown) = spawn_relay(stub.clone()).await;

    let tuning = BridgeTuning {
        auth_ack_timeout: Duration::from_millis(400),
        hello_fallback: Duration::from_millis(150),
        heartbeat_interval: Duration::from_secs(30),
        restart_delay: Duration::from_secs(5),
        restart_jitter: Duration::ZERO,
    };
    let bridge = bridge_for(addr, EVENT_SECRET, tuning);
    let mut status_rx = bridge.subscribe_status();
    bridge.start();

    next_frame_of(&mut frames, "pc-auth").await;
    let hello = next_frame_of(&mut frames, "pc-hello").await;
    assert_eq!(hello.get("pcid").and_then(Value::as_str), Some(PC_ID));

    wait_for_status(&mut status_rx, BridgeStatus::AuthTimeout).await;

    // The socket stayed up, so a slow relay can still complete the handshake.
    stub.inject(json!({ "v": 1, "type": "pc-ack" }));
    wait_for_status(&mut status_rx, BridgeStatus::Open).await;

    bridge.stop();
    shutdown.send(()).ok();
}

#[test_timeout::tokio_timeout_test]
async fn clock_skew_reauth_uses_relay_time() {
    init_tracing();
    let (stub, _frames) = RelayStub::new(AuthBehavior::SkewFirst);
    let (addr, shutdown) = spawn_relay(stub.clone()).await;

    let bridge = bridge_for(addr, EVENT_SECRET, fast_tuning());
    let mut status_rx = bridge.subscribe_status();
    bridge.start();

    wait_for_status(&mut status_rx, BridgeStatus::Open).await;

    let attempts = stub.auth_attempts.lock().await;
    assert_eq!(attempts.len(), 2);
    assert_eq!(
        attempts[1].get("iat").and_then(Value::as_i64),
        Some(SKEWED_SERVER_TIME)
    );
    assert_ne!(
        attempts[0].get("nonce").and_then(Value::as_str),
        attempts[1].get("nonce").and_then(Value::as_str)
    );
    drop(attempts);

    bridge.stop();
    shutdown.send(()).ok();
}

#[test_timeout::tokio_timeout_test]
async fn bridge_reconnects_after_socket_drop() {
    init_tracing();
    let (stub, _frames) = RelayStub::new(AuthBehavior::DropFirstConnection);
    let (addr, shutdown) = spawn_relay(stub.clone()).await;

    let bridge = bridge_for(addr, EVENT_SECRET, fast_tuning());
    let mut status_rx = bridge.subscribe_status();
    bridge.start();

    wait_for_status(&mut status_rx, BridgeStatus::Open).await;
    assert_eq!(stub.connections.load(Ordering::SeqCst), 2);
    // Registration is cached across the reconnect.
    assert_eq!(stub.register_calls.load(Ordering::SeqCst), 1);

    bridge.stop();
    shutdown.send(()).ok();
}

#[test_timeout::tokio_timeout_test]
async fn wrong_secret_is_fatal_before_any_socket() {
    init_tracing();
    let (stub, _frames) = RelayStub::new(AuthBehavior::AckWhenValid);
    let (addr, shutdown) = spawn_relay(stub.clone()).await;

    let bridge = bridge_for(addr, "not-the-event-secret", fast_tuning());
    let mut status_rx = bridge.subscribe_status();
    bridge.start();

    // Registration is rejected as a credential failure, so the bridge never
    // opens a socket and does not spin on reconnects.
    wait_for_status(&mut status_rx, BridgeStatus::Error).await;
    assert_eq!(stub.connections.load(Ordering::SeqCst), 0);
    assert_eq!(stub.register_calls.load(Ordering::SeqCst), 1);
    assert!(stub.auth_attempts.lock().await.is_empty());

    bridge.stop();
    shutdown.send(()).ok();
}
