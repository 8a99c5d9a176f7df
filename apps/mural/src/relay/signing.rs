use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::{Digest, Sha256};
use std::fmt;

type HmacSha256 = Hmac<Sha256>;

/// SHA-256 of zero bytes. Bodyless requests and the WS auth frame hash to
/// this, so both sides can precompute it.
pub const EMPTY_PAYLOAD_HASH: &str =
    "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";

pub const HEADER_IAT: &str = "X-Relay-Iat";
pub const HEADER_NONCE: &str = "X-Relay-Nonce";
pub const HEADER_SIGNATURE: &str = "X-Relay-Sig";
pub const HEADER_SERVER_TIME: &str = "X-Server-Time";

/// Operation label used when signing the WS auth frame instead of an HTTP
/// method.
pub const WS_AUTH_OP: &str = "ws-auth";

pub fn payload_hash(body: &[u8]) -> String {
    hex::encode(Sha256::digest(body))
}

/// The exact byte string both ends MAC. Field order and the newline joiner
/// are part of the protocol.
pub fn canonical_string(op: &str, path: &str, payload_hash: &str, iat: i64, nonce: &str) -> String {
    [op, path, payload_hash, &iat.to_string(), nonce].join("\n")
}

pub fn fresh_nonce() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Current wall clock as Unix seconds, the `iat` the relay expects.
pub fn now_unix() -> i64 {
    time::OffsetDateTime::now_utc().unix_timestamp()
}

#[derive(Clone)]
pub struct RequestSigner {
    secret: String,
}

impl fmt::Debug for RequestSigner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("RequestSigner { .. }")
    }
}

impl RequestSigner {
    pub fn new(secret: impl Into<String>) -> Self {
        Self {
            secret: secret.into(),
        }
    }

    pub fn sign(&self, op: &str, path: &str, payload_hash: &str, iat: i64, nonce: &str) -> String {
        let canonical = canonical_string(op, path, payload_hash, iat, nonce);
        let mut mac = HmacSha256::new_from_slice(self.secret.as_bytes())
            .expect("hmac accepts keys of any length");
        mac.update(canonical.as_bytes());
        URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes())
    }

    /// Signs with a fresh nonce at the given timestamp.
    pub fn signed_fields(&self, op: &str, path: &str, payload_hash: &str, iat: i64) -> SignedFields {
        let nonce = fresh_nonce();
        let sig = self.sign(op, path, payload_hash, iat, &nonce);
        SignedFields { iat, nonce, sig }
    }
}

#[derive(Debug, Clone)]
pub struct SignedFields {
    pub iat: i64,
    pub nonce: String,
    pub sig: String,
}
