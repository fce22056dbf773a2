use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::ErrKind;
use crate::fsio;

#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("cannot resolve a home directory; set HOME or SI_SETTINGS_HOME")]
    HomeUnavailable,
    #[error("invalid settings file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("settings serialization failed: {0}")]
    Serialize(#[from] toml::ser::Error),
    #[error("settings I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl SettingsError {
    pub fn kind(&self) -> ErrKind {
        match self {
            SettingsError::Io { .. } => ErrKind::Io,
            _ => ErrKind::Config,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Settings {
    #[serde(default)]
    pub vault: VaultSettings,
    #[serde(default)]
    pub sun: SunSettings,
    #[serde(default)]
    pub dyad: DyadSettings,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct VaultSettings {
    /// Default scope used when neither `--scope` nor `--file` is given.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
    /// Path of the default scope's dotenv file on the local backend.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sync_backend: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plaintext_policy: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audit_log: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trust_store: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct SunSettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(default)]
    pub auto_sync: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub taskboard: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub taskboard_agent: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub taskboard_lease_seconds: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub machine_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operator_id: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct DyadSettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl Settings {
    /// Missing file yields defaults; a malformed file is an error.
    pub fn load(path: &Path) -> Result<Self, SettingsError> {
        let raw = match std::fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Ok(Self::default());
            }
            Err(source) => {
                return Err(SettingsError::Io {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };
        Self::parse(path, &raw)
    }

    pub fn parse(path: &Path, raw: &str) -> Result<Self, SettingsError> {
        toml::from_str(raw).map_err(|source| SettingsError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn save(&self, path: &Path) -> Result<(), SettingsError> {
        let rendered = toml::to_string_pretty(self)?;
        fsio::write_atomic(path, rendered.as_bytes(), fsio::OWNER_ONLY).map_err(|source| {
            SettingsError::Io {
                path: path.to_path_buf(),
                source,
            }
        })
    }
}

pub fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|value| !value.is_empty())
}
