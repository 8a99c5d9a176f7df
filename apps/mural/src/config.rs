use clap::ValueEnum;
use directories::BaseDirs;
use serde::Deserialize;
use std::env;
use std::fmt;
use std::fs;
use std::path::PathBuf;
use std::str::FromStr;
use thiserror::Error;
use url::Url;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("unable to determine home directory")]
    NoHome,
    #[error("invalid relay base url `{raw}`: {message}")]
    InvalidBaseUrl { raw: String, message: String },
    #[error("invalid operation mode `{0}`")]
    InvalidMode(String),
    #[error("invalid relay environment `{0}`")]
    InvalidEnv(String),
    #[error("failed to read settings: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse settings: {0}")]
    Parse(#[from] toml::de::Error),
}

/// How sessions are allowed to reach mobiles.
///
/// `auto` probes the relay and falls back to the LAN path, `relay` pins the
/// relay (failures surface instead of degrading), `local` never leaves the
/// machine.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationMode {
    #[default]
    Auto,
    Relay,
    Local,
}

impl OperationMode {
    pub fn as_str(self) -> &'static str {
        match self {
            OperationMode::Auto => "auto",
            OperationMode::Relay => "relay",
            OperationMode::Local => "local",
        }
    }
}

impl fmt::Display for OperationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OperationMode {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "auto" => Ok(OperationMode::Auto),
            "relay" => Ok(OperationMode::Relay),
            "local" => Ok(OperationMode::Local),
            other => Err(ConfigError::InvalidMode(other.to_string())),
        }
    }
}

/// Which relay deployment credentials and defaults apply to.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RelayEnv {
    #[default]
    Production,
    Staging,
}

impl RelayEnv {
    pub fn as_str(self) -> &'static str {
        match self {
            RelayEnv::Production => "production",
            RelayEnv::Staging => "staging",
        }
    }

    pub fn default_base_url(self) -> &'static str {
        match self {
            RelayEnv::Production => "https://relay.mural.app",
            RelayEnv::Staging => "https://relay-staging.mural.app",
        }
    }
}

impl fmt::Display for RelayEnv {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RelayEnv {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "production" | "prod" => Ok(RelayEnv::Production),
            "staging" => Ok(RelayEnv::Staging),
            other => Err(ConfigError::InvalidEnv(other.to_string())),
        }
    }
}

/// Resolved relay configuration.
///
/// Precedence per field: explicit override (CLI flag or env var) beats the
/// settings file, which beats the environment preset.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub base_url: Url,
    pub event_id: Option<String>,
    pub pc_id: Option<String>,
    pub mode: OperationMode,
    pub env: RelayEnv,
}

#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub base_url: Option<String>,
    pub event_id: Option<String>,
    pub pc_id: Option<String>,
    pub mode: Option<OperationMode>,
    pub env: Option<RelayEnv>,
}

impl ConfigOverrides {
    /// Reads the `MURAL_*` environment variables. Used by embedders that do
    /// not go through the CLI (clap applies the same variables itself).
    pub fn from_env() -> Result<Self, ConfigError> {
        let mode = match env_var("MURAL_OPERATION_MODE") {
            Some(raw) => Some(raw.parse()?),
            None => None,
        };
        let env = match env_var("MURAL_RELAY_ENV") {
            Some(raw) => Some(raw.parse()?),
            None => None,
        };
        Ok(Self {
            base_url: env_var("MURAL_RELAY_BASE_URL"),
            event_id: env_var("MURAL_EVENT_ID"),
            pc_id: env_var("MURAL_PCID"),
            mode,
            env,
        })
    }
}

impl RelayConfig {
    /// Resolves the effective configuration from overrides plus the settings
    /// file. A missing or unreadable settings file is not fatal.
    pub fn load(overrides: &ConfigOverrides) -> Result<Self, ConfigError> {
        let settings = match SettingsFile::load() {
            Ok(settings) => settings,
            Err(err) => {
                tracing::warn!(target: "mural::config", error = %err, "ignoring unreadable settings file");
                SettingsFile::default()
            }
        };
        Self::from_sources(overrides, &settings)
    }

    pub fn from_sources(
        overrides: &ConfigOverrides,
        settings: &SettingsFile,
    ) -> Result<Self, ConfigError> {
        let env = overrides.env.or(settings.relay.env).unwrap_or_default();
        let mode = overrides
            .mode
            .or(settings.defaults.operation_mode)
            .unwrap_or_default();
        let raw_base = overrides
            .base_url
            .clone()
            .or_else(|| settings.relay.base_url.clone())
            .unwrap_or_else(|| env.default_base_url().to_string());
        let base_url = normalize_base_url(&raw_base)?;
        let event_id = overrides
            .event_id
            .clone()
            .or_else(|| settings.relay.event_id.clone());
        let pc_id = overrides
            .pc_id
            .clone()
            .or_else(|| settings.relay.pc_id.clone());
        Ok(Self {
            base_url,
            event_id,
            pc_id,
            mode,
            env,
        })
    }

    /// WebSocket endpoint for the per-event PC channel.
    pub fn ws_url(&self, event_id: &str) -> Result<Url, ConfigError> {
        let mut url = self.base_url.clone();
        let scheme = match url.scheme() {
            "https" => "wss",
            _ => "ws",
        };
        url.set_scheme(scheme)
            .map_err(|()| ConfigError::InvalidBaseUrl {
                raw: self.base_url.to_string(),
                message: "scheme cannot carry websocket traffic".to_string(),
            })?;
        url.set_path(&format!("/e/{event_id}/ws"));
        url.set_query(None);
        url.set_fragment(None);
        Ok(url)
    }
}

/// Identity of the relay environment a session was minted against. Sessions
/// whose key no longer matches the active configuration are stale.
pub fn env_key(base_url: &Url, event_id: &str, pc_id: &str, mode: OperationMode) -> String {
    format!(
        "{}|{}|{}|{}",
        base_url.as_str().trim_end_matches('/'),
        event_id,
        pc_id,
        mode
    )
}

fn normalize_base_url(raw: &str) -> Result<Url, ConfigError> {
    let trimmed = raw.trim().trim_end_matches('/');
    if trimmed.is_empty() {
        return Err(ConfigError::InvalidBaseUrl {
            raw: raw.to_string(),
            message: "empty url".to_string(),
        });
    }
    // Bare hosts get a scheme inferred: loopback is assumed to be a dev
    // relay without TLS, anything else gets https.
    let with_scheme = if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
        trimmed.to_string()
    } else if trimmed.starts_with("localhost") || trimmed.starts_with("127.") {
        format!("http://{trimmed}")
    } else {
        format!("https://{trimmed}")
    };
    Url::parse(&with_scheme).map_err(|err| ConfigError::InvalidBaseUrl {
        raw: raw.to_string(),
        message: err.to_string(),
    })
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct SettingsFile {
    #[serde(default)]
    pub relay: RelaySettings,
    #[serde(default)]
    pub defaults: DefaultSettings,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct RelaySettings {
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub event_id: Option<String>,
    #[serde(default)]
    pub pc_id: Option<String>,
    #[serde(default)]
    pub env: Option<RelayEnv>,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct DefaultSettings {
    #[serde(default)]
    pub operation_mode: Option<OperationMode>,
}

impl SettingsFile {
    pub fn path() -> Result<PathBuf, ConfigError> {
        let base = BaseDirs::new().ok_or(ConfigError::NoHome)?;
        Ok(base.home_dir().join(".mural").join("config.toml"))
    }

    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::path()?;
        if !path.exists() {
            return Ok(SettingsFile::default());
        }
        let raw = fs::read_to_string(&path)?;
        Ok(toml::from_str(&raw)?)
    }
}

fn env_var(name: &str) -> Option<String> {
    env::var(name).ok().filter(|value| !value.trim().is_empty())
}
