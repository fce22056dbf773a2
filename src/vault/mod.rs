//! Scope-addressed encrypted dotenv storage over a local file or a Sun object.

use std::fmt;
use std::path::PathBuf;

use serde::Serialize;

use crate::context::Env;
use crate::dotenv::{Document, DotenvError, PUBLIC_KEY_ENTRY};
use crate::error::ErrKind;
use crate::identity::IdentityError;
use crate::settings::{non_empty, Settings};
use crate::sun::SunError;

mod audit;
pub mod backup;
pub mod engine;
pub mod target;
pub mod trust;

pub use engine::VaultEngine;
pub use target::{ScopeRequest, Target};

pub const SYNC_BACKEND_KEY: &str = "SI_VAULT_SYNC_BACKEND";
pub const AUDIT_LOG_KEY: &str = "SI_VAULT_AUDIT_LOG";
pub const ALLOW_SYMLINK_KEYS: &[&str] = &["SI_VAULT_ALLOW_SYMLINK_ENV_FILE"];

#[derive(Debug, thiserror::Error)]
pub enum VaultError {
    #[error("invalid vault scope {0:?} (use 1-64 characters from A-Z a-z 0-9 . _ -)")]
    InvalidScope(String),
    #[error("vault scope {0} does not exist")]
    ScopeNotFound(String),
    #[error("key {key} not found in scope {scope}")]
    KeyNotFound { scope: String, key: String },
    #[error("vault scope {0} already exists")]
    ScopeExists(String),
    #[error("refusing to remove the last recipient of scope {0}")]
    LastRecipient(String),
    #[error("refusing to remove the local identity's recipient {0}")]
    OwnRecipient(String),
    #[error("failed to persist {path}: {source}")]
    Persistence {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("refusing to write through symlink {0} (set SI_VAULT_ALLOW_SYMLINK_ENV_FILE=1 to override)")]
    SymlinkRefused(PathBuf),
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid {source_name} {value:?} (expected local or sun)")]
    InvalidBackend {
        source_name: &'static str,
        value: String,
    },
    #[error("invalid vault.plaintext_policy {0:?} (expected warn, block or off)")]
    InvalidPolicy(String),
    #[error("{0}")]
    Unsupported(String),
    #[error("scope {0} contains plaintext values; run `si vault encrypt` first or pass --allow-plaintext")]
    PlaintextRefused(String),
    #[error("vault backup {scope} failed verification: {reason}")]
    BackupMismatch { scope: String, reason: String },
    #[error("{0} already exists; pass --force to overwrite")]
    BackupTargetExists(PathBuf),
    #[error("vault trust not established for {}; review it with `si vault trust status --file {}` and accept with `si vault trust accept --file {} --yes`", .0.display(), .0.display(), .0.display())]
    TrustNotEstablished(PathBuf),
    #[error("recipients of {} changed since they were trusted; review with `si vault trust status --file {}` and re-accept with `si vault trust accept --file {} --yes`", .0.display(), .0.display(), .0.display())]
    TrustMismatch(PathBuf),
    #[error("invalid trust store {path}: {reason}")]
    TrustStore { path: PathBuf, reason: String },
    #[error(transparent)]
    Dotenv(#[from] DotenvError),
    #[error(transparent)]
    Identity(#[from] IdentityError),
    #[error(transparent)]
    Sun(#[from] SunError),
}

impl VaultError {
    pub fn kind(&self) -> ErrKind {
        match self {
            VaultError::InvalidScope(_) => ErrKind::InvalidScope,
            VaultError::ScopeNotFound(_) | VaultError::KeyNotFound { .. } => ErrKind::NotFound,
            VaultError::ScopeExists(_) | VaultError::BackupTargetExists(_) => ErrKind::ScopeExists,
            VaultError::LastRecipient(_) => ErrKind::LastRecipient,
            VaultError::OwnRecipient(_) => ErrKind::InvalidRecipient,
            VaultError::Persistence { .. } | VaultError::SymlinkRefused(_) => {
                ErrKind::PersistenceFailed
            }
            VaultError::Read { .. } => ErrKind::Io,
            VaultError::InvalidBackend { .. } | VaultError::InvalidPolicy(_) => ErrKind::Config,
            VaultError::Unsupported(_) => ErrKind::InvalidArgument,
            VaultError::PlaintextRefused(_) => ErrKind::PlaintextDetected,
            VaultError::BackupMismatch { .. } => ErrKind::Decode,
            VaultError::TrustNotEstablished(_) | VaultError::TrustMismatch(_) => ErrKind::Untrusted,
            VaultError::TrustStore { .. } => ErrKind::Config,
            VaultError::Dotenv(err) => err.kind(),
            VaultError::Identity(err) => err.kind(),
            VaultError::Sun(err) => err.kind(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    Local,
    Sun,
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Backend::Local => "local",
            Backend::Sun => "sun",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BackendResolution {
    pub backend: Backend,
    pub source: &'static str,
}

/// `SI_VAULT_SYNC_BACKEND` > `vault.sync_backend` > local.
pub fn resolve_backend(env: &Env, settings: &Settings) -> Result<BackendResolution, VaultError> {
    if let Some(raw) = env.get(SYNC_BACKEND_KEY) {
        let backend = parse_backend(raw).ok_or_else(|| VaultError::InvalidBackend {
            source_name: SYNC_BACKEND_KEY,
            value: raw.to_string(),
        })?;
        return Ok(BackendResolution {
            backend,
            source: "env",
        });
    }
    if let Some(raw) = non_empty(settings.vault.sync_backend.as_deref()) {
        let backend = parse_backend(raw).ok_or_else(|| VaultError::InvalidBackend {
            source_name: "vault.sync_backend",
            value: raw.to_string(),
        })?;
        return Ok(BackendResolution {
            backend,
            source: "settings",
        });
    }
    Ok(BackendResolution {
        backend: Backend::Local,
        source: "default",
    })
}

fn parse_backend(raw: &str) -> Option<Backend> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "local" | "file" | "git" => Some(Backend::Local),
        "sun" | "helia" | "remote" => Some(Backend::Sun),
        _ => None,
    }
}

/// Keys holding a non-empty value that is not an encrypted marker.
pub fn plaintext_keys(document: &Document) -> Vec<String> {
    document
        .entries()
        .into_iter()
        .filter(|entry| !entry.encrypted && !entry.value.is_empty())
        .filter(|entry| entry.key != PUBLIC_KEY_ENTRY)
        .map(|entry| entry.key)
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PlaintextPolicy {
    Warn,
    Block,
    Off,
}

impl PlaintextPolicy {
    pub fn resolve(settings: &Settings) -> Result<Self, VaultError> {
        match non_empty(settings.vault.plaintext_policy.as_deref()) {
            None => Ok(PlaintextPolicy::Block),
            Some(raw) => match raw.to_ascii_lowercase().as_str() {
                "warn" => Ok(PlaintextPolicy::Warn),
                "block" | "deny" => Ok(PlaintextPolicy::Block),
                "off" | "allow" => Ok(PlaintextPolicy::Off),
                _ => Err(VaultError::InvalidPolicy(raw.to_string())),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{plaintext_keys, resolve_backend, Backend, PlaintextPolicy, VaultError};
    use crate::context::Env;
    use crate::dotenv::Document;
    use crate::settings::Settings;

    #[test]
    fn backend_env_overrides_settings_and_reports_source() {
        let mut settings = Settings::default();
        let resolved = resolve_backend(&Env::default(), &settings).expect("default");
        assert_eq!((resolved.backend, resolved.source), (Backend::Local, "default"));

        settings.vault.sync_backend = Some("sun".to_string());
        let resolved = resolve_backend(&Env::default(), &settings).expect("settings");
        assert_eq!((resolved.backend, resolved.source), (Backend::Sun, "settings"));

        let env = Env::from_pairs([("SI_VAULT_SYNC_BACKEND", "file")]);
        let resolved = resolve_backend(&env, &settings).expect("env");
        assert_eq!((resolved.backend, resolved.source), (Backend::Local, "env"));

        let env = Env::from_pairs([("SI_VAULT_SYNC_BACKEND", "s3")]);
        assert!(matches!(
            resolve_backend(&env, &settings),
            Err(VaultError::InvalidBackend { .. })
        ));
    }

    #[test]
    fn plaintext_policy_defaults_to_block() {
        let mut settings = Settings::default();
        assert_eq!(
            PlaintextPolicy::resolve(&settings).expect("default"),
            PlaintextPolicy::Block
        );
        settings.vault.plaintext_policy = Some("WARN".to_string());
        assert_eq!(
            PlaintextPolicy::resolve(&settings).expect("warn"),
            PlaintextPolicy::Warn
        );
        settings.vault.plaintext_policy = Some("sometimes".to_string());
        assert!(PlaintextPolicy::resolve(&settings).is_err());
    }

    #[test]
    fn plaintext_keys_skip_markers_tombstones_and_public_key() {
        let doc = Document::parse(
            b"SI_VAULT_PUBLIC_KEY=age1abc\nSEC=age:v1:QUJD\nGONE=\nPLAIN=oops\n",
        )
        .expect("parse");
        assert_eq!(plaintext_keys(&doc), vec!["PLAIN".to_string()]);
    }
}
