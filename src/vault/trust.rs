//! Pinned recipient fingerprints for local scope files.
//!
//! A reveal only proceeds when the file's current recipient set matches the
//! fingerprint recorded here, so a swapped header or injected ciphertext is
//! noticed before any value leaves the vault.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::context::{Env, StatePaths};
use crate::fsio;
use crate::settings::{non_empty, Settings};

use super::VaultError;

pub const TRUST_STORE_KEY: &str = "SI_VAULT_TRUST_STORE";
const SCHEMA_VERSION: u32 = 3;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrustEntry {
    pub file: PathBuf,
    pub scope: String,
    pub fingerprint: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trusted_at: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrustStore {
    #[serde(default)]
    pub schema_version: u32,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub entries: Vec<TrustEntry>,
}

impl Default for TrustStore {
    fn default() -> Self {
        Self {
            schema_version: SCHEMA_VERSION,
            entries: Vec::new(),
        }
    }
}

/// `SI_VAULT_TRUST_STORE` > `vault.trust_store` > `<state>/vault/trust.json`.
pub fn store_path(env: &Env, settings: &Settings, paths: &StatePaths) -> PathBuf {
    env.get(TRUST_STORE_KEY)
        .or_else(|| non_empty(settings.vault.trust_store.as_deref()))
        .map(PathBuf::from)
        .unwrap_or_else(|| paths.vault_dir().join("trust.json"))
}

/// Entries are keyed by the resolved file so `./.env` and its absolute
/// spelling share one pin.
pub fn entry_key(path: &Path) -> PathBuf {
    std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf())
}

impl TrustStore {
    pub fn load(path: &Path) -> Result<Self, VaultError> {
        let raw = match std::fs::read(path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(source) => {
                return Err(VaultError::Read {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };
        let mut store: TrustStore =
            serde_json::from_slice(&raw).map_err(|err| VaultError::TrustStore {
                path: path.to_path_buf(),
                reason: err.to_string(),
            })?;
        store.schema_version = store.schema_version.max(SCHEMA_VERSION);
        Ok(store)
    }

    pub fn save(&self, path: &Path) -> Result<(), VaultError> {
        let mut bytes = serde_json::to_vec_pretty(self).map_err(|err| VaultError::TrustStore {
            path: path.to_path_buf(),
            reason: err.to_string(),
        })?;
        bytes.push(b'\n');
        fsio::write_atomic_with_mode(path, &bytes, fsio::OWNER_ONLY).map_err(|source| {
            VaultError::Persistence {
                path: path.to_path_buf(),
                source,
            }
        })
    }

    pub fn find(&self, file: &Path) -> Option<&TrustEntry> {
        self.entries.iter().find(|entry| entry.file == file)
    }

    pub fn upsert(&mut self, entry: TrustEntry) {
        match self.entries.iter_mut().find(|existing| existing.file == entry.file) {
            Some(existing) => *existing = entry,
            None => self.entries.push(entry),
        }
    }

    pub fn remove(&mut self, file: &Path) -> bool {
        let before = self.entries.len();
        self.entries.retain(|entry| entry.file != file);
        before != self.entries.len()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum TrustState {
    Ok,
    Untrusted,
    Mismatch,
    /// The scope file does not exist yet.
    Unavailable,
    /// Sun-backed scopes are pinned by the server, not locally.
    SunManaged,
}

impl TrustState {
    pub fn as_str(self) -> &'static str {
        match self {
            TrustState::Ok => "ok",
            TrustState::Untrusted => "untrusted",
            TrustState::Mismatch => "mismatch",
            TrustState::Unavailable => "unavailable",
            TrustState::SunManaged => "sun-managed",
        }
    }

    pub fn classify(stored: Option<&str>, current: Option<&str>) -> Self {
        match (stored, current) {
            (_, None) => TrustState::Unavailable,
            (None, Some(_)) => TrustState::Untrusted,
            (Some(stored), Some(current)) if stored.trim() == current => TrustState::Ok,
            (Some(_), Some(_)) => TrustState::Mismatch,
        }
    }
}
