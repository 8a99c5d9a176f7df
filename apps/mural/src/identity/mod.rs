pub mod secrets;

use directories::BaseDirs;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::config::RelayConfig;

pub const ID_MIN_LEN: usize = 3;
pub const ID_MAX_LEN: usize = 32;

const PC_ID_PREFIX: &str = "pc-";
const PC_ID_SUFFIX_LEN: usize = 8;
const PC_ID_CHARSET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";

#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("invalid {field} `{value}`: expected 3-32 chars of [a-z0-9-]")]
    InvalidId { field: &'static str, value: String },
    #[error("unable to determine home directory")]
    NoHome,
    #[error("failed to access identity file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse identity file: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("failed to serialize identity file: {0}")]
    Serialize(#[from] toml::ser::Error),
}

/// The pair that names this machine inside an event on the relay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PcIdentity {
    pub event_id: String,
    pub pc_id: String,
}

impl PcIdentity {
    pub fn new(event_id: impl Into<String>, pc_id: impl Into<String>) -> Result<Self, IdentityError> {
        let event_id = event_id.into();
        let pc_id = pc_id.into();
        validate_id("event id", &event_id)?;
        validate_id("pcid", &pc_id)?;
        Ok(Self { event_id, pc_id })
    }

    /// Resolves the identity from configuration. `None` means the event id was
    /// never provisioned, which keeps the app on the local path.
    pub fn resolve(config: &RelayConfig) -> Result<Option<Self>, IdentityError> {
        let Some(event_id) = config.event_id.clone() else {
            return Ok(None);
        };
        validate_id("event id", &event_id)?;
        let pc_id = resolve_pc_id(config.pc_id.as_deref())?;
        Ok(Some(Self { event_id, pc_id }))
    }
}

/// Ids travel in URLs, QR payloads and keychain accounts, so the accepted
/// shape is deliberately narrow.
pub fn validate_id(field: &'static str, value: &str) -> Result<(), IdentityError> {
    let ok = (ID_MIN_LEN..=ID_MAX_LEN).contains(&value.len())
        && value
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-');
    if ok {
        Ok(())
    } else {
        Err(IdentityError::InvalidId {
            field,
            value: value.to_string(),
        })
    }
}

pub fn generate_pc_id() -> String {
    let mut rng = rand::thread_rng();
    let mut id = String::with_capacity(PC_ID_PREFIX.len() + PC_ID_SUFFIX_LEN);
    id.push_str(PC_ID_PREFIX);
    for _ in 0..PC_ID_SUFFIX_LEN {
        let idx = rng.gen_range(0..PC_ID_CHARSET.len());
        id.push(PC_ID_CHARSET[idx] as char);
    }
    id
}

/// Uses the configured pcid when present, otherwise the one minted on a
/// previous launch, otherwise mints and persists a fresh one.
pub fn resolve_pc_id(configured: Option<&str>) -> Result<String, IdentityError> {
    if let Some(id) = configured {
        validate_id("pcid", id)?;
        return Ok(id.to_string());
    }
    load_or_generate_at(&identity_path()?)
}

fn identity_path() -> Result<PathBuf, IdentityError> {
    let base = BaseDirs::new().ok_or(IdentityError::NoHome)?;
    Ok(base.home_dir().join(".mural").join("identity.toml"))
}

#[derive(Debug, Serialize, Deserialize)]
struct IdentityFile {
    pc_id: String,
}

fn load_or_generate_at(path: &Path) -> Result<String, IdentityError> {
    if path.exists() {
        let raw = fs::read_to_string(path)?;
        let file: IdentityFile = toml::from_str(&raw)?;
        if validate_id("pcid", &file.pc_id).is_ok() {
            return Ok(file.pc_id);
        }
        tracing::warn!(
            target: "mural::identity",
            pc_id = %file.pc_id,
            "stored pcid is malformed; minting a new one"
        );
    }
    let pc_id = generate_pc_id();
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let serialized = toml::to_string(&IdentityFile {
        pc_id: pc_id.clone(),
    })?;
    write_owner_only(path, serialized.as_bytes())?;
    tracing::info!(target: "mural::identity", pc_id = %pc_id, "minted persistent pcid");
    Ok(pc_id)
}

fn write_owner_only(path: &Path, contents: &[u8]) -> Result<(), IdentityError> {
    let mut options = fs::OpenOptions::new();
    options.create(true).write(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let mut file = options.open(path)?;
    file.write_all(contents)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let metadata = file.metadata()?;
        let mut perms = metadata.permissions();
        perms.set_mode(0o600);
        fs::set_permissions(path, perms)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn accepts_well_formed_ids() {
        assert!(validate_id("event id", "spring-fair").is_ok());
        assert!(validate_id("pcid", "pc-a1b2c3d4").is_ok());
        assert!(validate_id("event id", "abc").is_ok());
        assert!(validate_id("event id", &"a".repeat(32)).is_ok());
    }

    #[test]
    fn rejects_malformed_ids() {
        assert!(validate_id("event id", "ab").is_err());
        assert!(validate_id("event id", &"a".repeat(33)).is_err());
        assert!(validate_id("event id", "Spring-Fair").is_err());
        assert!(validate_id("event id", "spring_fair").is_err());
        assert!(validate_id("event id", "spring fair").is_err());
        assert!(validate_id("event id", "").is_err());
    }

    #[test]
    fn generated_pc_ids_are_valid() {
        for _ in 0..50 {
            let id = generate_pc_id();
            assert!(id.starts_with("pc-"));
            assert_eq!(id.len(), PC_ID_PREFIX.len() + PC_ID_SUFFIX_LEN);
            validate_id("pcid", &id).unwrap();
        }
    }

    #[test]
    fn pc_id_persists_across_loads() {
        let path = std::env::temp_dir().join(format!("mural-identity-{}.toml", Uuid::new_v4()));
        let first = load_or_generate_at(&path).unwrap();
        let second = load_or_generate_at(&path).unwrap();
        assert_eq!(first, second);
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn malformed_stored_pc_id_is_replaced() {
        let path = std::env::temp_dir().join(format!("mural-identity-{}.toml", Uuid::new_v4()));
        std::fs::write(&path, "pc_id = \"NOT VALID\"\n").unwrap();
        let minted = load_or_generate_at(&path).unwrap();
        validate_id("pcid", &minted).unwrap();
        let reloaded = load_or_generate_at(&path).unwrap();
        assert_eq!(minted, reloaded);
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn resolve_prefers_configured_pcid() {
        let pc = resolve_pc_id(Some("booth-primary")).unwrap();
        assert_eq!(pc, "booth-primary");
        assert!(resolve_pc_id(Some("Booth Primary")).is_err());
    }
}
