//! Per-image QR sessions: path selection, the relay reservation flow with
//! local fallback, and connection tracking.

pub mod events;
pub mod link;
pub mod sid;
pub mod store;

pub use events::{BlockedReason, SessionEvent, SessionPath};
pub use link::{LanLinkProvider, LocalLinkProvider, QrError};
pub use sid::{generate_sid, is_valid_sid};
pub use store::{PollerGuard, SessionStore};

use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::config::{env_key, OperationMode, RelayConfig};
use crate::identity::PcIdentity;
use crate::relay::bridge::{BridgeEvent, PcBridge};
use crate::relay::http::RelayHttpClient;
use crate::relay::probe::probe_relay;
use crate::relay::RelayError;
use link::{qr_svg_data_uri, relay_join_link};

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("relay session unavailable: {0}")]
    Relay(#[from] RelayError),
    #[error("event id and pc id must be configured for relay mode")]
    IdentityRequired,
    #[error("could not reserve a session code after {0} attempts")]
    SidExhausted(u32),
}

/// One QR session, as shown to the UI.
///
/// Blocked sessions carry empty `link`/`qr_code` strings plus a reason; the
/// UI renders a call to action instead of a code.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QrSession {
    pub image_id: String,
    pub session_id: String,
    pub path: SessionPath,
    pub link: String,
    pub qr_code: String,
    pub connected: bool,
    pub env_key: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub blocked_reason: Option<BlockedReason>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

/// Timing and bound knobs, overridable in tests.
#[derive(Debug, Clone, Copy)]
pub struct SessionTuning {
    /// Requested pending sid lifetime; the HTTP client clamps it again.
    pub pending_ttl: u32,
    /// Delay before the first fallback poll while the bridge looks healthy.
    pub poll_grace: Duration,
    pub poll_base: Duration,
    pub poll_cap: Duration,
    pub poll_attempts: u32,
    /// Fresh sids to try when the relay reports collisions.
    pub sid_retries: u32,
}

impl Default for SessionTuning {
    fn default() -> Self {
        Self {
            pending_ttl: 90,
            poll_grace: Duration::from_millis(8_000),
            poll_base: Duration::from_millis(2_000),
            poll_cap: Duration::from_millis(15_000),
            poll_attempts: 6,
            sid_retries: 3,
        }
    }
}

/// Owns every live session. One per process, injected wherever sessions are
/// opened or observed.
pub struct SessionManager {
    http: Arc<RelayHttpClient>,
    config: RelayConfig,
    identity: Option<PcIdentity>,
    local_links: Arc<dyn LocalLinkProvider>,
    bridge: Option<Arc<PcBridge>>,
    store: Arc<SessionStore>,
    tuning: SessionTuning,
    events_tx: broadcast::Sender<SessionEvent>,
}

impl SessionManager {
    pub fn new(
        http: Arc<RelayHttpClient>,
        config: RelayConfig,
        identity: Option<PcIdentity>,
        local_links: Arc<dyn LocalLinkProvider>,
        bridge: Option<Arc<PcBridge>>,
    ) -> Self {
        let (events_tx, _) = broadcast::channel(64);
        Self {
            http,
            config,
            identity,
            local_links,
            bridge,
            store: Arc::new(SessionStore::new()),
            tuning: SessionTuning::default(),
            events_tx,
        }
    }

    pub fn with_tuning(mut self, tuning: SessionTuning) -> Self {
        self.tuning = tuning;
        self
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events_tx.subscribe()
    }

    pub fn session_for_image(&self, image_id: &str) -> Option<QrSession> {
        self.store.get_by_image(image_id)
    }

    pub fn sessions(&self) -> Vec<QrSession> {
        self.store.sessions()
    }

    /// Opens (or replaces) the session for `image_id`. The displaced
    /// session's poller is cancelled before the new one becomes visible.
    pub async fn open_session(&self, image_id: &str) -> Result<QrSession, SessionError> {
        let session = match self.decide_path().await {
            SessionPath::Local => self.open_local_session(image_id),
            SessionPath::Relay => match self.open_relay_session(image_id).await {
                Ok(session) => session,
                Err(err)
                    if self.config.mode == OperationMode::Auto && !is_identity_failure(&err) =>
                {
                    tracing::warn!(
                        target: "mural::session",
                        image_id,
                        error = %err,
                        "relay path failed; using the local path"
                    );
                    let session = self.open_local_session(image_id);
                    self.emit(SessionEvent::DegradedToLocal {
                        image_id: image_id.to_string(),
                        message: err.to_string(),
                    });
                    session
                }
                Err(err) => return Err(err),
            },
        };
        Ok(self.install(session))
    }

    /// Drops the session for an image (image removed, or regeneration).
    pub fn close_session(&self, image_id: &str) -> Option<QrSession> {
        let session = self.store.remove_by_image(image_id)?;
        self.emit(SessionEvent::SessionClosed {
            image_id: session.image_id.clone(),
            session_id: session.session_id.clone(),
        });
        Some(session)
    }

    pub async fn regenerate(&self, image_id: &str) -> Result<QrSession, SessionError> {
        self.close_session(image_id);
        self.open_session(image_id).await
    }

    /// Closes sessions minted under a different connectivity configuration.
    /// Returns the affected image ids so the caller can reopen them.
    pub fn invalidate_stale(&self) -> Vec<String> {
        let key = self.current_env_key();
        let stale: Vec<String> = self
            .store
            .sessions()
            .into_iter()
            .filter(|session| session.env_key != key)
            .map(|session| session.image_id)
            .collect();
        for image_id in &stale {
            tracing::info!(
                target: "mural::session",
                image_id = %image_id,
                "connectivity changed; dropping stale session"
            );
            self.close_session(image_id);
        }
        stale
    }

    /// Called by the embedded web server when a phone hits the LAN join
    /// endpoint. Marks the session connected and reports which image the
    /// phone now controls; repeat joins (page reloads) keep working.
    pub fn note_local_join(&self, session_id: &str) -> Option<String> {
        let (image_id, fresh) = self.store.mark_connected(session_id)?;
        if fresh {
            tracing::info!(
                target: "mural::session",
                session_id,
                image_id = %image_id,
                "mobile connected over lan"
            );
            self.emit(SessionEvent::SessionConnected {
                image_id: image_id.clone(),
                session_id: session_id.to_string(),
            });
        }
        Some(image_id)
    }

    /// Marks the session behind a relay sid connected. No-op for sids the
    /// store no longer maps (displaced by regeneration).
    pub fn note_relay_join(&self, sid: &str) {
        if let Some((image_id, fresh)) = self.store.mark_connected(sid) {
            if fresh {
                tracing::info!(
                    target: "mural::session",
                    sid,
                    image_id = %image_id,
                    "mobile connected over relay"
                );
                self.emit(SessionEvent::SessionConnected {
                    image_id,
                    session_id: sid.to_string(),
                });
            }
        }
    }

    /// Forwards bridge `mobile-connected` signals into the store. Returns
    /// `None` when no bridge is attached.
    pub fn spawn_bridge_listener(self: &Arc<Self>) -> Option<JoinHandle<()>> {
        let bridge = self.bridge.clone()?;
        let manager = Arc::clone(self);
        Some(tokio::spawn(async move {
            let mut events = bridge.subscribe_events();
            loop {
                match events.recv().await {
                    Ok(BridgeEvent::MobileConnected { sid }) => manager.note_relay_join(&sid),
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(
                            target: "mural::session",
                            skipped,
                            "bridge event stream lagged"
                        );
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }))
    }

    async fn decide_path(&self) -> SessionPath {
        match self.config.mode {
            OperationMode::Local => SessionPath::Local,
            OperationMode::Relay => SessionPath::Relay,
            OperationMode::Auto => {
                if self.identity.is_none() {
                    tracing::debug!(
                        target: "mural::session",
                        "no event identity configured; staying local"
                    );
                    return SessionPath::Local;
                }
                let report = probe_relay(&self.http).await;
                if report.usable() {
                    SessionPath::Relay
                } else {
                    tracing::debug!(
                        target: "mural::session",
                        reachable = report.reachable,
                        version = ?report.version,
                        "relay probe failed; staying local"
                    );
                    SessionPath::Local
                }
            }
        }
    }

    async fn open_relay_session(&self, image_id: &str) -> Result<QrSession, SessionError> {
        let identity = self.identity.as_ref().ok_or(SessionError::IdentityRequired)?;
        let env_key = self.current_env_key();

        let mut sid = generate_sid();

        match self
            .http
            .register_pc(&identity.event_id, &identity.pc_id)
            .await
        {
            Ok(()) => {}
            Err(err) if err.is_identity() => {
                return Ok(self.blocked_session(image_id, sid, env_key, &err));
            }
            Err(err) => return Err(err.into()),
        }

        let mut attempt = 0;
        loop {
            attempt += 1;
            match self
                .http
                .pending_sid(
                    &identity.event_id,
                    &identity.pc_id,
                    &sid,
                    self.tuning.pending_ttl,
                )
                .await
            {
                Ok(()) => break,
                Err(RelayError::SidTaken) if attempt < self.tuning.sid_retries => {
                    tracing::debug!(
                        target: "mural::session",
                        sid = %sid,
                        "sid collision; retrying with a fresh code"
                    );
                    sid = generate_sid();
                }
                Err(RelayError::SidTaken) => return Err(SessionError::SidExhausted(attempt)),
                Err(err) if err.is_identity() => {
                    return Ok(self.blocked_session(image_id, sid, env_key, &err));
                }
                Err(err) => return Err(err.into()),
            }
        }

        let link = relay_join_link(&self.config.base_url, &identity.event_id, &sid, image_id);
        match qr_svg_data_uri(&link) {
            Ok(qr_code) => Ok(QrSession {
                image_id: image_id.to_string(),
                session_id: sid,
                path: SessionPath::Relay,
                link,
                qr_code,
                connected: false,
                env_key,
                blocked_reason: None,
                error_message: None,
            }),
            Err(err) => {
                tracing::error!(target: "mural::session", error = %err, "qr rendering failed");
                Ok(QrSession {
                    image_id: image_id.to_string(),
                    session_id: sid,
                    path: SessionPath::Relay,
                    link,
                    qr_code: String::new(),
                    connected: false,
                    env_key,
                    blocked_reason: Some(BlockedReason::Error),
                    error_message: Some(err.to_string()),
                })
            }
        }
    }

    fn open_local_session(&self, image_id: &str) -> QrSession {
        let session_id = Uuid::new_v4().to_string();
        let link = self.local_links.join_link(&session_id, image_id);
        let env_key = self.current_env_key();
        match qr_svg_data_uri(&link) {
            Ok(qr_code) => QrSession {
                image_id: image_id.to_string(),
                session_id,
                path: SessionPath::Local,
                link,
                qr_code,
                connected: false,
                env_key,
                blocked_reason: None,
                error_message: None,
            },
            Err(err) => {
                tracing::error!(target: "mural::session", error = %err, "qr rendering failed");
                QrSession {
                    image_id: image_id.to_string(),
                    session_id,
                    path: SessionPath::Local,
                    link,
                    qr_code: String::new(),
                    connected: false,
                    env_key,
                    blocked_reason: Some(BlockedReason::Error),
                    error_message: Some(err.to_string()),
                }
            }
        }
    }

    fn blocked_session(
        &self,
        image_id: &str,
        sid: String,
        env_key: String,
        err: &RelayError,
    ) -> QrSession {
        let reason = classify_blocked(err);
        tracing::warn!(
            target: "mural::session",
            image_id,
            reason = ?reason,
            error = %err,
            "relay session blocked"
        );
        QrSession {
            image_id: image_id.to_string(),
            session_id: sid,
            path: SessionPath::Relay,
            link: String::new(),
            qr_code: String::new(),
            connected: false,
            env_key,
            blocked_reason: Some(reason),
            error_message: Some(err.to_string()),
        }
    }

    fn install(&self, session: QrSession) -> QrSession {
        self.store.insert(session.clone());
        match session.blocked_reason {
            Some(reason) => {
                self.emit(SessionEvent::SessionBlocked {
                    image_id: session.image_id.clone(),
                    reason,
                    message: session.error_message.clone(),
                });
            }
            None => {
                self.emit(SessionEvent::SessionOpened {
                    image_id: session.image_id.clone(),
                    session_id: session.session_id.clone(),
                    path: session.path,
                });
                if session.path == SessionPath::Relay {
                    self.spawn_poller(&session);
                }
            }
        }
        session
    }

    /// Backstop for a missed websocket `mobile-connected`: polls sid-status
    /// until the phone shows up or the attempts run out.
    fn spawn_poller(&self, session: &QrSession) {
        let Some(identity) = self.identity.clone() else {
            return;
        };
        let stopped = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&stopped);
        let http = Arc::clone(&self.http);
        let store = Arc::clone(&self.store);
        let events_tx = self.events_tx.clone();
        let tuning = self.tuning;
        let bridge_healthy = self
            .bridge
            .as_ref()
            .is_some_and(|bridge| bridge.is_healthy());
        let sid = session.session_id.clone();
        let handle = tokio::spawn(async move {
            poll_sid_status(http, store, events_tx, tuning, identity, sid, bridge_healthy, flag)
                .await;
        });
        self.store
            .attach_poller(&session.session_id, PollerGuard::new(stopped, handle));
    }

    fn current_env_key(&self) -> String {
        let (event_id, pc_id) = match &self.identity {
            Some(identity) => (identity.event_id.as_str(), identity.pc_id.as_str()),
            None => (
                self.config.event_id.as_deref().unwrap_or(""),
                self.config.pc_id.as_deref().unwrap_or(""),
            ),
        };
        env_key(&self.config.base_url, event_id, pc_id, self.config.mode)
    }

    fn emit(&self, event: SessionEvent) {
        let _ = self.events_tx.send(event);
    }
}

#[allow(clippy::too_many_arguments)]
async fn poll_sid_status(
    http: Arc<RelayHttpClient>,
    store: Arc<SessionStore>,
    events_tx: broadcast::Sender<SessionEvent>,
    tuning: SessionTuning,
    identity: PcIdentity,
    sid: String,
    bridge_healthy: bool,
    stopped: Arc<AtomicBool>,
) {
    // A healthy bridge usually delivers the connected signal itself; give it
    // a head start before burning requests.
    let first_delay = if bridge_healthy {
        tuning.poll_grace
    } else {
        Duration::ZERO
    };
    tokio::time::sleep(first_delay).await;

    for attempt in 1..=tuning.poll_attempts {
        if stopped.load(Ordering::SeqCst) {
            return;
        }
        match http.sid_status(&identity.event_id, &sid).await {
            Ok(true) => {
                if stopped.load(Ordering::SeqCst) {
                    return;
                }
                if let Some((image_id, fresh)) = store.mark_connected(&sid) {
                    if fresh {
                        tracing::info!(
                            target: "mural::session",
                            sid = %sid,
                            image_id = %image_id,
                            "mobile connected (status poll)"
                        );
                        let _ = events_tx.send(SessionEvent::SessionConnected {
                            image_id,
                            session_id: sid.clone(),
                        });
                    }
                }
                return;
            }
            Ok(false) => {}
            Err(err) => {
                tracing::debug!(
                    target: "mural::session",
                    sid = %sid,
                    error = %err,
                    "sid status check failed"
                );
            }
        }
        if attempt == tuning.poll_attempts {
            break;
        }
        let exp = 2u32.saturating_pow(attempt - 1);
        let delay = tuning.poll_base.saturating_mul(exp).min(tuning.poll_cap);
        tokio::time::sleep(delay).await;
    }
    tracing::debug!(target: "mural::session", sid = %sid, "giving up on sid status polling");
}

fn classify_blocked(err: &RelayError) -> BlockedReason {
    match err {
        RelayError::BadToken => BlockedReason::Invalid,
        RelayError::MissingToken | RelayError::TokenRequired | RelayError::MissingSecret => {
            BlockedReason::Missing
        }
        _ => BlockedReason::Error,
    }
}

fn is_identity_failure(err: &SessionError) -> bool {
    match err {
        SessionError::Relay(inner) => inner.is_identity(),
        SessionError::IdentityRequired => true,
        SessionError::SidExhausted(_) => false,
    }
}
