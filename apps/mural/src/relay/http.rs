use async_trait::async_trait;
use parking_lot::Mutex;
use reqwest::{Method, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use time::macros::format_description;
use time::{OffsetDateTime, PrimitiveDateTime};
use url::Url;

use super::retry::{retry_with_backoff, RetryPolicy};
use super::signing::{self, RequestSigner, EMPTY_PAYLOAD_HASH};
use super::{codes, RelayError};
use crate::config::RelayEnv;
use crate::identity::secrets::{DeviceToken, SecretStore};

pub const PENDING_TTL_MIN: u32 = 30;
pub const PENDING_TTL_MAX: u32 = 120;

/// How long a successful registration suppresses re-registration.
const REGISTRATION_CACHE_TTL: Duration = Duration::from_secs(15 * 60);

#[derive(Debug, Clone)]
pub struct BackendRequest {
    pub method: Method,
    pub url: Url,
    pub headers: Vec<(&'static str, String)>,
    pub body: Option<Vec<u8>>,
}

#[derive(Debug, Clone)]
pub struct BackendResponse {
    pub status: StatusCode,
    pub retry_after: Option<String>,
    pub server_time: Option<String>,
    pub body: Vec<u8>,
}

impl BackendResponse {
    /// The relay's clock, from the `X-Server-Time` header or the
    /// `serverTime` body field, as Unix seconds.
    pub fn server_time_unix(&self) -> Option<i64> {
        if let Some(raw) = &self.server_time {
            if let Ok(seconds) = raw.trim().parse::<i64>() {
                return Some(seconds);
            }
        }
        serde_json::from_slice::<Value>(&self.body)
            .ok()?
            .get("serverTime")?
            .as_i64()
    }
}

#[async_trait]
pub trait RelayBackend: Send + Sync {
    async fn execute(&self, request: BackendRequest) -> Result<BackendResponse, RelayError>;
}

pub struct ReqwestBackend {
    client: reqwest::Client,
}

impl ReqwestBackend {
    pub fn new() -> Result<Self, RelayError> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(3))
            .timeout(Duration::from_secs(8))
            .no_proxy()
            .build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl RelayBackend for ReqwestBackend {
    async fn execute(&self, request: BackendRequest) -> Result<BackendResponse, RelayError> {
        let mut builder = self.client.request(request.method, request.url);
        for (name, value) in request.headers {
            builder = builder.header(name, value);
        }
        if let Some(body) = request.body {
            builder = builder
                .header(reqwest::header::CONTENT_TYPE, "application/json")
                .body(body);
        }
        let response = builder.send().await?;
        let status = response.status();
        let retry_after = response
            .headers()
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string);
        let server_time = response
            .headers()
            .get(signing::HEADER_SERVER_TIME)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string);
        let body = response.bytes().await?.to_vec();
        Ok(BackendResponse {
            status,
            retry_after,
            server_time,
            body,
        })
    }
}

enum RequestAuth {
    Bearer(DeviceToken),
    Signed(RequestSigner),
}

/// HTTP half of the relay protocol. One instance per relay environment.
pub struct RelayHttpClient {
    base_url: Url,
    env: RelayEnv,
    secrets: Arc<dyn SecretStore>,
    backend: Arc<dyn RelayBackend>,
    retry: RetryPolicy,
    registered: Mutex<HashMap<(String, String), Instant>>,
}

impl RelayHttpClient {
    pub fn new(
        base_url: Url,
        env: RelayEnv,
        secrets: Arc<dyn SecretStore>,
    ) -> Result<Self, RelayError> {
        Ok(Self::with_backend(
            base_url,
            env,
            secrets,
            Arc::new(ReqwestBackend::new()?),
        ))
    }

    pub fn with_backend(
        base_url: Url,
        env: RelayEnv,
        secrets: Arc<dyn SecretStore>,
        backend: Arc<dyn RelayBackend>,
    ) -> Self {
        Self {
            base_url,
            env,
            secrets,
            backend,
            retry: RetryPolicy::default(),
            registered: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    pub fn env(&self) -> RelayEnv {
        self.env
    }

    /// Registers this PC for the event. Success is cached briefly so bridge
    /// restarts and batches of QR generations do not hammer the relay.
    pub async fn register_pc(&self, event_id: &str, pc_id: &str) -> Result<(), RelayError> {
        let key = (event_id.to_string(), pc_id.to_string());
        if let Some(registered_at) = self.registered.lock().get(&key) {
            if registered_at.elapsed() < REGISTRATION_CACHE_TTL {
                return Ok(());
            }
        }
        retry_with_backoff(&self.retry, "register-pc", |_| {
            self.register_pc_once(event_id, pc_id)
        })
        .await?;
        self.registered.lock().insert(key, Instant::now());
        Ok(())
    }

    async fn register_pc_once(&self, event_id: &str, pc_id: &str) -> Result<(), RelayError> {
        let body = encode_body(&RegisterPcRequest { pcid: pc_id })?;
        let path = format!("/e/{event_id}/register-pc");
        let response = self.send_authed(Method::POST, &path, Some(body)).await?;
        if response.status == StatusCode::CONFLICT {
            let (code, _) = extract_error(&response.body);
            if code.as_deref() == Some(codes::ALREADY_REGISTERED) {
                tracing::debug!(target: "mural::relay", event_id, pc_id, "pc already registered");
                return Ok(());
            }
        }
        self.classify(response).map(drop)
    }

    /// Publishes a pending sid the mobile can claim. The requested ttl is
    /// clamped into the relay's accepted window before it goes on the wire.
    pub async fn pending_sid(
        &self,
        event_id: &str,
        pc_id: &str,
        sid: &str,
        ttl_seconds: u32,
    ) -> Result<(), RelayError> {
        let ttl = ttl_seconds.clamp(PENDING_TTL_MIN, PENDING_TTL_MAX);
        if ttl != ttl_seconds {
            tracing::debug!(
                target: "mural::relay",
                requested = ttl_seconds,
                ttl,
                "clamped pending sid ttl"
            );
        }
        retry_with_backoff(&self.retry, "pending-sid", |_| {
            self.pending_sid_once(event_id, pc_id, sid, ttl)
        })
        .await
    }

    async fn pending_sid_once(
        &self,
        event_id: &str,
        pc_id: &str,
        sid: &str,
        ttl: u32,
    ) -> Result<(), RelayError> {
        let body = encode_body(&PendingSidRequest {
            pcid: pc_id,
            sid,
            ttl,
        })?;
        let path = format!("/e/{event_id}/pending-sid");
        let response = self.send_authed(Method::POST, &path, Some(body)).await?;
        if response.status == StatusCode::CONFLICT {
            return Err(RelayError::SidTaken);
        }
        self.classify(response).map(drop)
    }

    /// Trades a scanned sid for a session token. This is the same exchange
    /// the mobile page performs; the sid itself is the proof, so the call is
    /// unauthenticated.
    pub async fn exchange_sid_for_token(
        &self,
        event_id: &str,
        sid: &str,
    ) -> Result<SessionToken, RelayError> {
        retry_with_backoff(&self.retry, "session-token", |_| {
            self.exchange_once(event_id, sid)
        })
        .await
    }

    async fn exchange_once(&self, event_id: &str, sid: &str) -> Result<SessionToken, RelayError> {
        let body = encode_body(&SessionTokenRequest { sid })?;
        let url = self.endpoint(&format!("/e/{event_id}/session"))?;
        let response = self
            .backend
            .execute(BackendRequest {
                method: Method::POST,
                url,
                headers: Vec::new(),
                body: Some(body),
            })
            .await?;
        let body = self.classify(response)?;
        decode_body(&body)
    }

    /// One poll of a pending sid. The fallback poller owns the cadence, so
    /// this deliberately skips the retry scheduler.
    pub async fn sid_status(&self, event_id: &str, sid: &str) -> Result<bool, RelayError> {
        let mut url = self.endpoint(&format!("/e/{event_id}/sid-status"))?;
        url.query_pairs_mut().append_pair("sid", sid);
        let response = self
            .backend
            .execute(BackendRequest {
                method: Method::GET,
                url,
                headers: Vec::new(),
                body: None,
            })
            .await?;
        let body = self.classify(response)?;
        let status: SidStatusResponse = decode_body(&body)?;
        Ok(status.connected)
    }

    /// Single-shot health check. The connectivity probe decides what a
    /// failure means, so no retries here either.
    pub async fn healthz(&self) -> Result<Healthz, RelayError> {
        let url = self.endpoint("/healthz")?;
        let response = self
            .backend
            .execute(BackendRequest {
                method: Method::GET,
                url,
                headers: Vec::new(),
                body: None,
            })
            .await?;
        let body = self.classify(response)?;
        decode_body(&body)
    }

    /// Picks the credential for a mutating call: a live device token wins,
    /// otherwise the event signing secret, otherwise fail fast.
    fn resolve_auth(&self) -> Result<RequestAuth, RelayError> {
        if let Some(raw) = self.secrets.device_token()? {
            let token = DeviceToken::parse(&raw).map_err(|err| {
                tracing::warn!(target: "mural::relay", error = %err, "stored device token is malformed");
                RelayError::BadToken
            })?;
            if token.is_expired() {
                return Err(RelayError::MissingToken);
            }
            return Ok(RequestAuth::Bearer(token));
        }
        if let Some(secret) = self.secrets.event_secret(self.env)? {
            return Ok(RequestAuth::Signed(RequestSigner::new(secret)));
        }
        Err(RelayError::MissingToken)
    }

    async fn send_authed(
        &self,
        method: Method,
        path: &str,
        body: Option<Vec<u8>>,
    ) -> Result<BackendResponse, RelayError> {
        let auth = self.resolve_auth()?;
        let url = self.endpoint(path)?;
        let payload_hash = match &body {
            Some(bytes) => signing::payload_hash(bytes),
            None => EMPTY_PAYLOAD_HASH.to_string(),
        };
        match auth {
            RequestAuth::Bearer(token) => {
                self.backend
                    .execute(BackendRequest {
                        method,
                        url,
                        headers: vec![("Authorization", format!("Bearer {}", token.as_str()))],
                        body,
                    })
                    .await
            }
            RequestAuth::Signed(signer) => {
                let first = self
                    .send_signed(
                        &signer,
                        method.clone(),
                        url.clone(),
                        &payload_hash,
                        body.clone(),
                        signing::now_unix(),
                    )
                    .await?;
                // One resync per call: a 401 carrying the relay's clock means
                // our iat was out of its window, so re-sign with that
                // timestamp.
                if first.status == StatusCode::UNAUTHORIZED {
                    if let Some(server_time) = first.server_time_unix() {
                        tracing::debug!(
                            target: "mural::relay",
                            server_time,
                            "re-signing request with relay-provided clock"
                        );
                        return self
                            .send_signed(&signer, method, url, &payload_hash, body, server_time)
                            .await;
                    }
                }
                Ok(first)
            }
        }
    }

    async fn send_signed(
        &self,
        signer: &RequestSigner,
        method: Method,
        url: Url,
        payload_hash: &str,
        body: Option<Vec<u8>>,
        iat: i64,
    ) -> Result<BackendResponse, RelayError> {
        let fields = signer.signed_fields(method.as_str(), url.path(), payload_hash, iat);
        let headers = vec![
            (signing::HEADER_IAT, fields.iat.to_string()),
            (signing::HEADER_NONCE, fields.nonce),
            (signing::HEADER_SIGNATURE, fields.sig),
        ];
        self.backend
            .execute(BackendRequest {
                method,
                url,
                headers,
                body,
            })
            .await
    }

    fn endpoint(&self, path: &str) -> Result<Url, RelayError> {
        self.base_url
            .join(path.trim_start_matches('/'))
            .map_err(|err| RelayError::InvalidRequest(format!("invalid endpoint {path}: {err}")))
    }

    fn classify(&self, response: BackendResponse) -> Result<Vec<u8>, RelayError> {
        let status = response.status;
        if status.is_success() {
            return Ok(response.body);
        }
        let retry_after = response.retry_after.as_deref().and_then(parse_retry_after);
        let (code, message) = extract_error(&response.body);
        match status {
            StatusCode::UNAUTHORIZED => match code.as_deref() {
                Some(codes::TOKEN_REQUIRED) => Err(RelayError::TokenRequired),
                Some(codes::CLOCK_SKEW) => Err(RelayError::ClockSkew {
                    server_time: response.server_time_unix(),
                }),
                _ => Err(RelayError::BadToken),
            },
            StatusCode::TOO_MANY_REQUESTS => Err(RelayError::RateLimited { retry_after }),
            StatusCode::SERVICE_UNAVAILABLE => Err(RelayError::Unavailable { retry_after }),
            _ => Err(RelayError::Http {
                status: status.as_u16(),
                code,
                message,
            }),
        }
    }
}

#[derive(Debug, Serialize)]
struct RegisterPcRequest<'a> {
    pcid: &'a str,
}

#[derive(Debug, Serialize)]
struct PendingSidRequest<'a> {
    pcid: &'a str,
    sid: &'a str,
    ttl: u32,
}

#[derive(Debug, Serialize)]
struct SessionTokenRequest<'a> {
    sid: &'a str,
}

#[derive(Debug, Deserialize)]
pub struct SessionToken {
    pub token: String,
    #[serde(default)]
    pub exp: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct Healthz {
    #[serde(default)]
    pub ok: bool,
    #[serde(default)]
    pub version: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SidStatusResponse {
    #[serde(default)]
    connected: bool,
}

fn encode_body<T: Serialize>(value: &T) -> Result<Vec<u8>, RelayError> {
    serde_json::to_vec(value).map_err(|err| RelayError::InvalidRequest(err.to_string()))
}

fn decode_body<T: for<'de> Deserialize<'de>>(body: &[u8]) -> Result<T, RelayError> {
    serde_json::from_slice(body).map_err(|err| RelayError::InvalidResponse(err.to_string()))
}

/// Pulls `code`/`message` out of an error body, tolerating both the flat
/// shape and the nested `{"error": {...}}` shape.
fn extract_error(body: &[u8]) -> (Option<String>, Option<String>) {
    let Ok(value) = serde_json::from_slice::<Value>(body) else {
        return (None, None);
    };
    let nested = value.get("error");
    let code = value
        .get("code")
        .or_else(|| nested.and_then(|e| e.get("code")))
        .and_then(Value::as_str)
        .map(str::to_string);
    let message = value
        .get("message")
        .or_else(|| nested.and_then(|e| e.get("message")))
        .and_then(Value::as_str)
        .map(str::to_string)
        .or_else(|| nested.and_then(Value::as_str).map(str::to_string));
    (code, message)
}

/// Parses a Retry-After value, either delta-seconds or an IMF-fixdate.
fn parse_retry_after(value: &str) -> Option<Duration> {
    let value = value.trim();
    if let Ok(seconds) = value.parse::<u64>() {
        return Some(Duration::from_secs(seconds));
    }
    let format = format_description!(
        "[weekday repr:short], [day] [month repr:short] [year] [hour]:[minute]:[second] GMT"
    );
    let at = PrimitiveDateTime::parse(value, &format).ok()?.assume_utc();
    let now = OffsetDateTime::now_utc();
    if at > now {
        Some((at - now).unsigned_abs())
    } else {
        Some(Duration::ZERO)
    }
}
