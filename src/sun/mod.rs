//! Client side of the Sun object store: versioned `(kind, name)` payloads
//! gated by `expected_revision`.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::ErrKind;

pub mod auth;
pub mod cas;
pub mod client;
#[cfg(test)]
pub mod memory;

pub use cas::{cas_mutate, read_document, CasDocument, CasOutcome, MAX_CAS_ATTEMPTS};
pub use client::SunClient;

pub const KIND_DOTENV_SCOPE: &str = "dotenv_scope";
pub const KIND_VAULT_BACKUP: &str = "vault_backup";
pub const KIND_TASKBOARD: &str = "dyad_taskboard";
pub const KIND_MACHINE_REGISTRY: &str = "machine_registry";
pub const KIND_MACHINE_JOB: &str = "machine_job";

#[derive(Debug, thiserror::Error)]
pub enum SunError {
    #[error("{0}")]
    NotAuthenticated(String),
    #[error("{0}")]
    InvalidConfig(String),
    #[error("sun: {message} (status 401)")]
    Unauthorized { message: String },
    #[error("sun: {message} (status 404)")]
    NotFound { message: String },
    #[error("sun: {message} (status 409)")]
    RevisionConflict {
        current: Option<i64>,
        message: String,
    },
    #[error("sun: {message} (status {status})")]
    Server { status: u16, message: String },
    #[error("sun: {message} (status {status})")]
    Rejected { status: u16, message: String },
    #[error("sun request failed: {0}")]
    Network(String),
    #[error("sun response could not be decoded: {0}")]
    Decode(String),
    #[error("sun auth file I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl SunError {
    pub fn kind(&self) -> ErrKind {
        match self {
            SunError::NotAuthenticated(_) => ErrKind::NotAuthenticated,
            SunError::InvalidConfig(_) => ErrKind::Config,
            SunError::Unauthorized { .. } => ErrKind::Unauthorized,
            SunError::NotFound { .. } => ErrKind::NotFound,
            SunError::RevisionConflict { .. } => ErrKind::RevisionConflict,
            SunError::Server { .. } => ErrKind::Server,
            SunError::Rejected { .. } => ErrKind::InvalidArgument,
            SunError::Network(_) => ErrKind::Network,
            SunError::Decode(_) => ErrKind::Decode,
            SunError::Io { .. } => ErrKind::Io,
        }
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, SunError::RevisionConflict { .. })
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, SunError::NotFound { .. })
    }

    pub(crate) fn from_status(status: u16, message: String, current: Option<i64>) -> Self {
        match status {
            401 => SunError::Unauthorized { message },
            404 => SunError::NotFound { message },
            409 => SunError::RevisionConflict { current, message },
            500..=599 => SunError::Server { status, message },
            _ => SunError::Rejected { status, message },
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ObjectMeta {
    #[serde(default)]
    pub kind: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub latest_revision: i64,
    #[serde(default)]
    pub checksum: String,
    #[serde(default)]
    pub content_type: String,
    #[serde(default)]
    pub size_bytes: i64,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub metadata: Map<String, Value>,
    #[serde(default)]
    pub created_at: String,
    #[serde(default)]
    pub updated_at: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ObjectRevision {
    #[serde(default)]
    pub revision: i64,
    #[serde(default)]
    pub checksum: String,
    #[serde(default)]
    pub content_type: String,
    #[serde(default)]
    pub size_bytes: i64,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub metadata: Map<String, Value>,
    #[serde(default)]
    pub created_at: String,
}

#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq, Eq)]
pub struct PutResult {
    pub latest_revision: i64,
    pub revision: i64,
}

#[derive(Debug, Clone)]
pub struct PutRequest<'a> {
    pub kind: &'a str,
    pub name: &'a str,
    pub payload: &'a [u8],
    pub content_type: &'a str,
    pub metadata: Map<String, Value>,
    /// `Some(0)` demands that the object does not exist yet.
    pub expected_revision: Option<i64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct WhoAmI {
    #[serde(default)]
    pub account_id: String,
    #[serde(default)]
    pub account_slug: String,
    #[serde(default)]
    pub token_id: String,
    #[serde(default)]
    pub scopes: Vec<String>,
}

/// The operations the engines need from the store. `SunClient` speaks HTTP;
/// tests use an in-memory implementation.
pub trait ObjectStore {
    fn lookup_meta(&self, kind: &str, name: &str) -> Result<Option<ObjectMeta>, SunError>;
    fn get_payload(&self, kind: &str, name: &str) -> Result<Vec<u8>, SunError>;
    fn put_object(&self, request: PutRequest<'_>) -> Result<PutResult, SunError>;
    fn list_objects(&self, kind: &str, limit: usize) -> Result<Vec<ObjectMeta>, SunError>;
    fn list_revisions(
        &self,
        kind: &str,
        name: &str,
        limit: usize,
    ) -> Result<Vec<ObjectRevision>, SunError>;
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    use sha2::{Digest, Sha256};
    format!("{:x}", Sha256::digest(bytes))
}
