use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use keyring::Entry;
use parking_lot::Mutex;
use serde::Deserialize;
use std::collections::HashMap;
use thiserror::Error;
use time::{Duration, OffsetDateTime};

use crate::config::RelayEnv;

pub const KEYRING_SERVICE: &str = "mural";
const DEVICE_TOKEN_ACCOUNT: &str = "device-token";

/// A token whose expiry is closer than this is treated as already expired so
/// sessions are not minted against a credential about to lapse.
pub const TOKEN_EXPIRY_LEEWAY: Duration = Duration::seconds(30);

#[derive(Debug, Error)]
pub enum SecretError {
    #[error("keyring error: {0}")]
    Keyring(String),
}

#[derive(Debug, Error)]
pub enum TokenError {
    #[error("malformed device token: {0}")]
    Malformed(String),
}

fn event_secret_account(env: RelayEnv) -> String {
    format!("event-secret:{env}")
}

/// Credential storage for the relay. Secrets never land in the settings file.
pub trait SecretStore: Send + Sync {
    fn event_secret(&self, env: RelayEnv) -> Result<Option<String>, SecretError>;
    fn set_event_secret(&self, env: RelayEnv, secret: &str) -> Result<(), SecretError>;
    fn clear_event_secret(&self, env: RelayEnv) -> Result<(), SecretError>;
    fn device_token(&self) -> Result<Option<String>, SecretError>;
    fn set_device_token(&self, token: &str) -> Result<(), SecretError>;
    fn clear_device_token(&self) -> Result<(), SecretError>;
}

/// OS keychain backed store.
#[derive(Debug, Clone, Copy, Default)]
pub struct KeyringSecretStore;

impl KeyringSecretStore {
    pub fn new() -> Self {
        Self
    }

    fn entry(account: &str) -> Result<Entry, SecretError> {
        Entry::new(KEYRING_SERVICE, account).map_err(|err| SecretError::Keyring(err.to_string()))
    }

    fn read(account: &str) -> Result<Option<String>, SecretError> {
        match Self::entry(account)?.get_password() {
            Ok(secret) => Ok(Some(secret)),
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(err) => Err(SecretError::Keyring(err.to_string())),
        }
    }

    fn write(account: &str, value: &str) -> Result<(), SecretError> {
        Self::entry(account)?
            .set_password(value)
            .map_err(|err| SecretError::Keyring(err.to_string()))
    }

    fn delete(account: &str) -> Result<(), SecretError> {
        match Self::entry(account)?.delete_password() {
            Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
            Err(err) => Err(SecretError::Keyring(err.to_string())),
        }
    }
}

impl SecretStore for KeyringSecretStore {
    fn event_secret(&self, env: RelayEnv) -> Result<Option<String>, SecretError> {
        Self::read(&event_secret_account(env))
    }

    fn set_event_secret(&self, env: RelayEnv, secret: &str) -> Result<(), SecretError> {
        Self::write(&event_secret_account(env), secret)
    }

    fn clear_event_secret(&self, env: RelayEnv) -> Result<(), SecretError> {
        Self::delete(&event_secret_account(env))
    }

    fn device_token(&self) -> Result<Option<String>, SecretError> {
        Self::read(DEVICE_TOKEN_ACCOUNT)
    }

    fn set_device_token(&self, token: &str) -> Result<(), SecretError> {
        Self::write(DEVICE_TOKEN_ACCOUNT, token)
    }

    fn clear_device_token(&self) -> Result<(), SecretError> {
        Self::delete(DEVICE_TOKEN_ACCOUNT)
    }
}

/// In-memory store for tests and for embedders without an OS keychain.
#[derive(Default)]
pub struct MemorySecretStore {
    entries: Mutex<HashMap<String, String>>,
}

impl MemorySecretStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SecretStore for MemorySecretStore {
    fn event_secret(&self, env: RelayEnv) -> Result<Option<String>, SecretError> {
        Ok(self.entries.lock().get(&event_secret_account(env)).cloned())
    }

    fn set_event_secret(&self, env: RelayEnv, secret: &str) -> Result<(), SecretError> {
        self.entries
            .lock()
            .insert(event_secret_account(env), secret.to_string());
        Ok(())
    }

    fn clear_event_secret(&self, env: RelayEnv) -> Result<(), SecretError> {
        self.entries.lock().remove(&event_secret_account(env));
        Ok(())
    }

    fn device_token(&self) -> Result<Option<String>, SecretError> {
        Ok(self.entries.lock().get(DEVICE_TOKEN_ACCOUNT).cloned())
    }

    fn set_device_token(&self, token: &str) -> Result<(), SecretError> {
        self.entries
            .lock()
            .insert(DEVICE_TOKEN_ACCOUNT.to_string(), token.to_string());
        Ok(())
    }

    fn clear_device_token(&self) -> Result<(), SecretError> {
        self.entries.lock().remove(DEVICE_TOKEN_ACCOUNT);
        Ok(())
    }
}

/// A stored license token plus the expiry read out of its payload. The
/// signature is the relay's to verify; the client only needs to know whether
/// the token is still worth presenting.
#[derive(Debug, Clone)]
pub struct DeviceToken {
    raw: String,
    expires_at: Option<OffsetDateTime>,
}

#[derive(Debug, Deserialize)]
struct TokenClaims {
    #[serde(default)]
    exp: Option<i64>,
}

impl DeviceToken {
    pub fn parse(raw: &str) -> Result<Self, TokenError> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(TokenError::Malformed("empty token".to_string()));
        }
        let claims = decode_claims(raw)?;
        let expires_at = match claims.exp {
            Some(secs) => Some(
                OffsetDateTime::from_unix_timestamp(secs)
                    .map_err(|err| TokenError::Malformed(err.to_string()))?,
            ),
            None => None,
        };
        Ok(Self {
            raw: raw.to_string(),
            expires_at,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn expires_at(&self) -> Option<OffsetDateTime> {
        self.expires_at
    }

    pub fn is_expired_at(&self, now: OffsetDateTime) -> bool {
        match self.expires_at {
            Some(expires_at) => expires_at <= now + TOKEN_EXPIRY_LEEWAY,
            None => false,
        }
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(OffsetDateTime::now_utc())
    }
}

fn decode_claims(token: &str) -> Result<TokenClaims, TokenError> {
    let parts: Vec<&str> = token.split('.').collect();
    if parts.len() < 2 {
        return Err(TokenError::Malformed("token missing payload".to_string()));
    }
    let payload = URL_SAFE_NO_PAD
        .decode(parts[1])
        .map_err(|err| TokenError::Malformed(err.to_string()))?;
    serde_json::from_slice(&payload).map_err(|err| TokenError::Malformed(err.to_string()))
}
