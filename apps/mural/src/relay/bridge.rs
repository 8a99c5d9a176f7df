//! Persistent websocket to the relay: authenticates as this PC, forwards
//! phone input into the app, and restarts itself after drops.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use rand::Rng;
use serde::Serialize;
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::error::ProtocolError;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::tungstenite::Error as WsError;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use url::Url;

use super::http::RelayHttpClient;
use super::signing::{self, RequestSigner, EMPTY_PAYLOAD_HASH, WS_AUTH_OP};
use super::{codes, RelayError};
use crate::identity::secrets::SecretStore;
use crate::identity::PcIdentity;

/// Negotiated via the `Sec-WebSocket-Protocol` header.
pub const WS_SUBPROTOCOL: &str = "v1";
/// The `v` field carried in every frame.
pub const WS_FRAME_VERSION: u8 = 1;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;
type WsSource = SplitStream<WsStream>;

/// Connection lifecycle, in the order it normally progresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum BridgeStatus {
    Idle,
    Starting,
    AuthSent,
    Ack,
    Open,
    AuthTimeout,
    Error,
    Closed,
}

impl BridgeStatus {
    /// True once the relay has acknowledged our signature.
    pub fn is_healthy(self) -> bool {
        matches!(self, BridgeStatus::Ack | BridgeStatus::Open)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            BridgeStatus::Idle => "idle",
            BridgeStatus::Starting => "starting",
            BridgeStatus::AuthSent => "auth-sent",
            BridgeStatus::Ack => "ack",
            BridgeStatus::Open => "open",
            BridgeStatus::AuthTimeout => "auth-timeout",
            BridgeStatus::Error => "error",
            BridgeStatus::Closed => "closed",
        }
    }
}

impl fmt::Display for BridgeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Phone input, normalized from the relay's command vocabulary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "lowercase", rename_all_fields = "camelCase")]
pub enum MobileControl {
    Move {
        direction: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        image_id: Option<String>,
    },
    Action {
        action_type: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        image_id: Option<String>,
    },
    Emote {
        emote_type: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        image_id: Option<String>,
    },
}

/// What the bridge surfaces to the rest of the app.
#[derive(Debug, Clone)]
pub enum BridgeEvent {
    Control(MobileControl),
    MobileConnected { sid: String },
    PreviewRequested { sid: Option<String>, image_id: Option<String> },
}

/// Timing knobs, overridable in tests.
#[derive(Debug, Clone, Copy)]
pub struct BridgeTuning {
    /// How long to wait for `pc-ack` before reporting `AuthTimeout`.
    pub auth_ack_timeout: Duration,
    /// When to nudge an unresponsive relay with `pc-hello`.
    pub hello_fallback: Duration,
    pub heartbeat_interval: Duration,
    pub restart_delay: Duration,
    pub restart_jitter: Duration,
}

impl Default for BridgeTuning {
    fn default() -> Self {
        Self {
            auth_ack_timeout: Duration::from_millis(4_000),
            hello_fallback: Duration::from_millis(1_500),
            heartbeat_interval: Duration::from_secs(30),
            restart_delay: Duration::from_millis(2_000),
            restart_jitter: Duration::from_millis(1_000),
        }
    }
}

/// Handle to the background connection task. Cheap to share via `Arc`.
pub struct PcBridge {
    inner: Arc<BridgeInner>,
}

struct BridgeInner {
    http: Arc<RelayHttpClient>,
    secrets: Arc<dyn SecretStore>,
    identity: PcIdentity,
    ws_url: Url,
    tuning: BridgeTuning,
    status: Mutex<BridgeStatus>,
    status_tx: broadcast::Sender<BridgeStatus>,
    event_tx: broadcast::Sender<BridgeEvent>,
    stopping: AtomicBool,
    task: Mutex<Option<JoinHandle<()>>>,
}

enum ServeOutcome {
    /// Socket ended or never came up; the supervisor reconnects.
    Closed,
    /// Credentials are unusable; reconnecting cannot help.
    Fatal(RelayError),
}

enum FrameAction {
    None,
    Authed,
    SkewRetry { server_time: i64 },
    AuthFailed,
}

impl PcBridge {
    pub fn new(
        http: Arc<RelayHttpClient>,
        secrets: Arc<dyn SecretStore>,
        identity: PcIdentity,
        ws_url: Url,
    ) -> Self {
        Self::with_tuning(http, secrets, identity, ws_url, BridgeTuning::default())
    }

    pub fn with_tuning(
        http: Arc<RelayHttpClient>,
        secrets: Arc<dyn SecretStore>,
        identity: PcIdentity,
        ws_url: Url,
        tuning: BridgeTuning,
    ) -> Self {
        let (status_tx, _) = broadcast::channel(32);
        let (event_tx, _) = broadcast::channel(256);
        Self {
            inner: Arc::new(BridgeInner {
                http,
                secrets,
                identity,
                ws_url,
                tuning,
                status: Mutex::new(BridgeStatus::Idle),
                status_tx,
                event_tx,
                stopping: AtomicBool::new(false),
                task: Mutex::new(None),
            }),
        }
    }

    pub fn status(&self) -> BridgeStatus {
        *self.inner.status.lock()
    }

    pub fn is_healthy(&self) -> bool {
        self.status().is_healthy()
    }

    pub fn subscribe_status(&self) -> broadcast::Receiver<BridgeStatus> {
        self.inner.status_tx.subscribe()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<BridgeEvent> {
        self.inner.event_tx.subscribe()
    }

    /// Spawn the connection task. Calling again while it runs is a no-op;
    /// calling after `stop` (or a fatal error) starts a fresh one.
    pub fn start(&self) {
        let mut task = self.inner.task.lock();
        if task.as_ref().is_some_and(|t| !t.is_finished()) {
            return;
        }
        self.inner.stopping.store(false, Ordering::SeqCst);
        let inner = Arc::clone(&self.inner);
        *task = Some(tokio::spawn(async move {
            run(inner).await;
        }));
    }

    pub fn stop(&self) {
        self.inner.stopping.store(true, Ordering::SeqCst);
        if let Some(handle) = self.inner.task.lock().take() {
            handle.abort();
        }
        self.inner.set_status(BridgeStatus::Closed);
    }
}

impl BridgeInner {
    fn set_status(&self, status: BridgeStatus) {
        {
            let mut current = self.status.lock();
            if *current == status {
                return;
            }
            tracing::debug!(
                target: "mural::bridge",
                from = ?*current,
                to = ?status,
                "bridge status"
            );
            *current = status;
        }
        let _ = self.status_tx.send(status);
    }

    fn emit(&self, event: BridgeEvent) {
        let _ = self.event_tx.send(event);
    }
}

async fn run(inner: Arc<BridgeInner>) {
    loop {
        if inner.stopping.load(Ordering::SeqCst) {
            break;
        }
        inner.set_status(BridgeStatus::Starting);
        match serve_once(&inner).await {
            ServeOutcome::Fatal(err) => {
                tracing::error!(
                    target: "mural::bridge",
                    error = %err,
                    "bridge cannot authenticate; giving up until restarted"
                );
                inner.set_status(BridgeStatus::Error);
                return;
            }
            ServeOutcome::Closed => {
                if inner.stopping.load(Ordering::SeqCst) {
                    break;
                }
                let jitter = if inner.tuning.restart_jitter.is_zero() {
                    Duration::ZERO
                } else {
                    rand::thread_rng().gen_range(Duration::ZERO..inner.tuning.restart_jitter)
                };
                let delay = inner.tuning.restart_delay + jitter;
                tracing::debug!(
                    target: "mural::bridge",
                    delay_ms = delay.as_millis() as u64,
                    "bridge reconnecting after close"
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
    inner.set_status(BridgeStatus::Closed);
}

async fn serve_once(inner: &BridgeInner) -> ServeOutcome {
    // The relay only accepts sockets for PCs it has seen register.
    match inner
        .http
        .register_pc(&inner.identity.event_id, &inner.identity.pc_id)
        .await
    {
        Ok(()) => {}
        Err(err) if err.is_identity() => return ServeOutcome::Fatal(err),
        Err(err) => {
            tracing::warn!(
                target: "mural::bridge",
                error = %err,
                "pc registration failed; will reconnect"
            );
            return ServeOutcome::Closed;
        }
    }

    let signer = match inner.secrets.event_secret(inner.http.env()) {
        Ok(Some(secret)) => RequestSigner::new(secret),
        Ok(None) => return ServeOutcome::Fatal(RelayError::MissingSecret),
        Err(err) => return ServeOutcome::Fatal(err.into()),
    };

    let mut request = match inner.ws_url.as_str().into_client_request() {
        Ok(request) => request,
        Err(err) => {
            tracing::warn!(target: "mural::bridge", error = %err, "invalid websocket url");
            return ServeOutcome::Closed;
        }
    };
    request
        .headers_mut()
        .insert("Sec-WebSocket-Protocol", HeaderValue::from_static(WS_SUBPROTOCOL));

    let (stream, _) = match connect_async(request).await {
        Ok(pair) => pair,
        Err(err) => {
            tracing::warn!(target: "mural::bridge", error = %err, "websocket connect failed");
            return ServeOutcome::Closed;
        }
    };
    tracing::info!(
        target: "mural::bridge",
        url = %inner.ws_url,
        pcid = %inner.identity.pc_id,
        "websocket connected"
    );
    let (mut ws_write, ws_read) = stream.split();

    let path = inner.ws_url.path().to_string();
    let fields = signer.signed_fields(WS_AUTH_OP, &path, EMPTY_PAYLOAD_HASH, signing::now_unix());
    let frame = auth_frame(&inner.identity.pc_id, &path, fields.iat, &fields.nonce, &fields.sig);
    if send_json(&mut ws_write, &frame).await.is_err() {
        return ServeOutcome::Closed;
    }
    inner.set_status(BridgeStatus::AuthSent);

    drive(inner, &signer, &path, ws_write, ws_read).await
}

async fn drive(
    inner: &BridgeInner,
    signer: &RequestSigner,
    path: &str,
    mut ws_write: WsSink,
    mut ws_read: WsSource,
) -> ServeOutcome {
    let mut authed = false;
    let mut skew_retried = false;
    let mut hello_sent = false;
    let mut auth_timed_out = false;

    let hello_at = tokio::time::sleep(inner.tuning.hello_fallback);
    tokio::pin!(hello_at);
    let auth_deadline = tokio::time::sleep(inner.tuning.auth_ack_timeout);
    tokio::pin!(auth_deadline);
    let mut heartbeat = tokio::time::interval(inner.tuning.heartbeat_interval);
    heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = &mut hello_at, if !authed && !hello_sent => {
                hello_sent = true;
                tracing::debug!(target: "mural::bridge", "ack is slow; sending pc-hello");
                let hello = json!({
                    "v": WS_FRAME_VERSION,
                    "type": "pc-hello",
                    "pcid": inner.identity.pc_id,
                });
                if send_json(&mut ws_write, &hello).await.is_err() {
                    return ServeOutcome::Closed;
                }
            }
            _ = &mut auth_deadline, if !authed && !auth_timed_out => {
                auth_timed_out = true;
                tracing::warn!(
                    target: "mural::bridge",
                    timeout_ms = inner.tuning.auth_ack_timeout.as_millis() as u64,
                    "no auth ack from relay"
                );
                inner.set_status(BridgeStatus::AuthTimeout);
            }
            _ = heartbeat.tick(), if authed => {
                let hb = json!({ "v": WS_FRAME_VERSION, "type": "hb" });
                if send_json(&mut ws_write, &hb).await.is_err() {
                    tracing::debug!(target: "mural::bridge", "heartbeat write failed");
                    return ServeOutcome::Closed;
                }
            }
            message = ws_read.next() => {
                let Some(message) = message else {
                    return ServeOutcome::Closed;
                };
                let text = match message {
                    Ok(Message::Text(text)) => text,
                    Ok(Message::Binary(data)) => match String::from_utf8(data) {
                        Ok(text) => text,
                        Err(_) => continue,
                    },
                    Ok(Message::Close(_)) => return ServeOutcome::Closed,
                    Ok(_) => continue,
                    Err(err) => {
                        match &err {
                            WsError::ConnectionClosed
                            | WsError::AlreadyClosed
                            | WsError::Protocol(ProtocolError::ResetWithoutClosingHandshake) => {
                                tracing::debug!(
                                    target: "mural::bridge",
                                    "websocket closed: {err}"
                                );
                            }
                            _ => {
                                tracing::warn!(
                                    target: "mural::bridge",
                                    error = %err,
                                    "websocket read error"
                                );
                            }
                        }
                        return ServeOutcome::Closed;
                    }
                };
                match process_frame(inner, &text, authed) {
                    FrameAction::None => {}
                    FrameAction::Authed => {
                        if !authed {
                            authed = true;
                            inner.set_status(BridgeStatus::Ack);
                            inner.set_status(BridgeStatus::Open);
                            heartbeat.reset();
                        }
                    }
                    FrameAction::SkewRetry { server_time } => {
                        if authed {
                            continue;
                        }
                        if skew_retried {
                            inner.set_status(BridgeStatus::Error);
                            continue;
                        }
                        skew_retried = true;
                        tracing::debug!(
                            target: "mural::bridge",
                            server_time,
                            "re-authenticating with relay-provided clock"
                        );
                        let fields =
                            signer.signed_fields(WS_AUTH_OP, path, EMPTY_PAYLOAD_HASH, server_time);
                        let frame = auth_frame(
                            &inner.identity.pc_id,
                            path,
                            fields.iat,
                            &fields.nonce,
                            &fields.sig,
                        );
                        if send_json(&mut ws_write, &frame).await.is_err() {
                            return ServeOutcome::Closed;
                        }
                    }
                    FrameAction::AuthFailed => {
                        inner.set_status(BridgeStatus::Error);
                    }
                }
            }
        }
    }
}

fn process_frame(inner: &BridgeInner, text: &str, authed: bool) -> FrameAction {
    let Ok(value) = serde_json::from_str::<Value>(text) else {
        tracing::trace!(target: "mural::bridge", len = text.len(), "unparseable frame");
        return FrameAction::None;
    };
    match value.get("type").and_then(Value::as_str) {
        Some("pc-ack") => {
            if !authed {
                tracing::info!(target: "mural::bridge", "relay acknowledged pc auth");
            }
            FrameAction::Authed
        }
        Some("pc-err") => {
            let code = value
                .get("code")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            if code == codes::CLOCK_SKEW {
                if let Some(server_time) = value.get("serverTime").and_then(Value::as_i64) {
                    return FrameAction::SkewRetry { server_time };
                }
            }
            tracing::warn!(target: "mural::bridge", code = %code, "relay rejected pc auth");
            FrameAction::AuthFailed
        }
        Some("cmd") => {
            match normalize_control(&value) {
                Some(control) => inner.emit(BridgeEvent::Control(control)),
                None => {
                    tracing::debug!(target: "mural::bridge", "dropping unrecognized command")
                }
            }
            FrameAction::None
        }
        Some("evt") => {
            if value.get("evt").and_then(Value::as_str) == Some("mobile-connected") {
                if let Some(sid) = value.get("sid").and_then(Value::as_str) {
                    tracing::info!(target: "mural::bridge", sid = %sid, "mobile connected");
                    inner.emit(BridgeEvent::MobileConnected {
                        sid: sid.to_string(),
                    });
                }
            } else if let Some(control) = normalize_control(&value) {
                // Some relay builds echo the mobile command wrapped in an evt.
                inner.emit(BridgeEvent::Control(control));
            }
            FrameAction::None
        }
        Some("req") => {
            if value.get("req").and_then(Value::as_str) == Some("preview") {
                inner.emit(BridgeEvent::PreviewRequested {
                    sid: value.get("sid").and_then(Value::as_str).map(str::to_string),
                    image_id: value
                        .get("imageId")
                        .and_then(Value::as_str)
                        .map(str::to_string),
                });
            }
            FrameAction::None
        }
        Some("hb") | Some("hb-ack") => FrameAction::None,
        other => {
            tracing::trace!(target: "mural::bridge", kind = ?other, "ignoring frame");
            FrameAction::None
        }
    }
}

/// Command payloads arrive either nested under `payload` or inline, and
/// their parameters either sit inside an `args` object or as sibling keys.
fn normalize_control(value: &Value) -> Option<MobileControl> {
    let body = value.get("payload").unwrap_or(value);
    let kind = body
        .get("cmd")
        .or_else(|| body.get("type"))
        .and_then(Value::as_str)?;
    let params = match body.get("args") {
        Some(args) if args.is_object() => args,
        _ => body,
    };
    let field = |key: &str| params.get(key).and_then(Value::as_str).map(str::to_string);
    let image_id = body
        .get("imageId")
        .or_else(|| params.get("imageId"))
        .and_then(Value::as_str)
        .map(str::to_string);
    match kind {
        "move" => Some(MobileControl::Move {
            direction: field("direction")?,
            image_id,
        }),
        "action" => Some(MobileControl::Action {
            action_type: field("actionType").or_else(|| field("action"))?,
            image_id,
        }),
        "emote" => Some(MobileControl::Emote {
            emote_type: field("emoteType").or_else(|| field("emote"))?,
            image_id,
        }),
        _ => None,
    }
}

fn auth_frame(pcid: &str, path: &str, iat: i64, nonce: &str, sig: &str) -> Value {
    json!({
        "v": WS_FRAME_VERSION,
        "type": "pc-auth",
        "op": WS_AUTH_OP,
        "path": path,
        "payloadHash": EMPTY_PAYLOAD_HASH,
        "iat": iat,
        "nonce": nonce,
        "sig": sig,
        "pcid": pcid,
    })
}

async fn send_json(sink: &mut WsSink, value: &Value) -> Result<(), WsError> {
    sink.send(Message::Text(value.to_string())).await
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bridge_for_tests() -> PcBridge {
        let secrets = Arc::new(crate::identity::secrets::MemorySecretStore::new());
        let http = Arc::new(
            RelayHttpClient::with_backend(
                Url::parse("https://relay.mural.test").unwrap(),
                crate::config::RelayEnv::Production,
                secrets.clone(),
                Arc::new(crate::relay::http::testing::MockRelayBackend::new()),
            ),
        );
        PcBridge::new(
            http,
            secrets,
            PcIdentity::new("demo", "booth-01").unwrap(),
            Url::parse("wss://relay.mural.test/e/demo/ws").unwrap(),
        )
    }

    #[test]
    fn status_health_covers_ack_and_open() {
        assert!(BridgeStatus::Ack.is_healthy());
        assert!(BridgeStatus::Open.is_healthy());
        assert!(!BridgeStatus::AuthSent.is_healthy());
        assert!(!BridgeStatus::Error.is_healthy());
    }

    #[test]
    fn auth_frame_carries_signature_fields() {
        let frame = auth_frame("booth-01", "/e/demo/ws", 1_700_000_000, "n0nce", "s1g");
        assert_eq!(frame["v"], 1);
        assert_eq!(frame["type"], "pc-auth");
        assert_eq!(frame["op"], WS_AUTH_OP);
        assert_eq!(frame["path"], "/e/demo/ws");
        assert_eq!(frame["payloadHash"], EMPTY_PAYLOAD_HASH);
        assert_eq!(frame["iat"], 1_700_000_000);
        assert_eq!(frame["nonce"], "n0nce");
        assert_eq!(frame["sig"], "s1g");
        assert_eq!(frame["pcid"], "booth-01");
    }

    #[test]
    fn normalizes_nested_move_command() {
        let frame = json!({
            "type": "cmd",
            "payload": { "type": "move", "direction": "left", "imageId": "img-7" },
        });
        assert_eq!(
            normalize_control(&frame),
            Some(MobileControl::Move {
                direction: "left".into(),
                image_id: Some("img-7".into()),
            })
        );
    }

    #[test]
    fn normalizes_inline_action_command() {
        let frame = json!({ "type": "cmd", "cmd": "action", "action": "jump" });
        assert_eq!(
            normalize_control(&frame),
            Some(MobileControl::Action {
                action_type: "jump".into(),
                image_id: None,
            })
        );
    }

    #[test]
    fn move_without_direction_is_dropped() {
        let frame = json!({ "type": "cmd", "payload": { "type": "move" } });
        assert_eq!(normalize_control(&frame), None);
    }

    #[test]
    fn normalizes_command_with_args_object() {
        let frame = json!({
            "v": 1,
            "type": "cmd",
            "payload": { "cmd": "move", "args": { "direction": "left" }, "imageId": "img-7" },
        });
        assert_eq!(
            normalize_control(&frame),
            Some(MobileControl::Move {
                direction: "left".into(),
                image_id: Some("img-7".into()),
            })
        );
    }

    #[test]
    fn image_id_may_live_inside_args() {
        let frame = json!({
            "type": "cmd",
            "payload": { "cmd": "emote", "args": { "emoteType": "wave", "imageId": "img-3" } },
        });
        assert_eq!(
            normalize_control(&frame),
            Some(MobileControl::Emote {
                emote_type: "wave".into(),
                image_id: Some("img-3".into()),
            })
        );
    }

    #[tokio::test]
    async fn echoed_command_inside_evt_still_routes() {
        let bridge = bridge_for_tests();
        let mut events = bridge.subscribe_events();

        process_frame(
            &bridge.inner,
            r#"{"type":"evt","payload":{"cmd":"action","args":{"actionType":"jump"},"imageId":"img-2"}}"#,
            true,
        );
        match events.recv().await.unwrap() {
            BridgeEvent::Control(MobileControl::Action {
                action_type,
                image_id,
            }) => {
                assert_eq!(action_type, "jump");
                assert_eq!(image_id.as_deref(), Some("img-2"));
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn frames_route_to_event_subscribers() {
        let bridge = bridge_for_tests();
        let mut events = bridge.subscribe_events();

        let ack = process_frame(&bridge.inner, r#"{"type":"pc-ack"}"#, false);
        assert!(matches!(ack, FrameAction::Authed));

        process_frame(
            &bridge.inner,
            r#"{"type":"evt","evt":"mobile-connected","sid":"ABCDEFGHJK"}"#,
            true,
        );
        match events.recv().await.unwrap() {
            BridgeEvent::MobileConnected { sid } => assert_eq!(sid, "ABCDEFGHJK"),
            other => panic!("unexpected event: {other:?}"),
        }

        process_frame(
            &bridge.inner,
            r#"{"type":"req","req":"preview","sid":"ABCDEFGHJK","imageId":"img-2"}"#,
            true,
        );
        match events.recv().await.unwrap() {
            BridgeEvent::PreviewRequested { sid, image_id } => {
                assert_eq!(sid.as_deref(), Some("ABCDEFGHJK"));
                assert_eq!(image_id.as_deref(), Some("img-2"));
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn skew_error_requests_retry_with_server_time() {
        let bridge = bridge_for_tests();
        let action = process_frame(
            &bridge.inner,
            r#"{"type":"pc-err","code":"E_CLOCK_SKEW","serverTime":1700000123}"#,
            false,
        );
        match action {
            FrameAction::SkewRetry { server_time } => assert_eq!(server_time, 1_700_000_123),
            _ => panic!("expected skew retry"),
        }
    }

    #[test]
    fn other_auth_errors_are_terminal_for_the_attempt() {
        let bridge = bridge_for_tests();
        let action = process_frame(
            &bridge.inner,
            r#"{"type":"pc-err","code":"E_BAD_TOKEN"}"#,
            false,
        );
        assert!(matches!(action, FrameAction::AuthFailed));
    }
}
