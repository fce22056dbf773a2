use std::fmt;

use crate::dotenv::DotenvError;
use crate::guard::GuardError;
use crate::identity::IdentityError;
use crate::machine::MachineError;
use crate::settings::SettingsError;
use crate::sun::SunError;
use crate::taskboard::TaskboardError;
use crate::vault::VaultError;

/// Short machine-readable classification shared by every engine error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrKind {
    InvalidKey,
    DuplicateKey,
    MalformedQuote,
    EncodingError,
    InvalidScope,
    NotFound,
    ScopeExists,
    IdentityInitFailed,
    PersistenceFailed,
    NotAuthenticated,
    Unauthorized,
    Network,
    Server,
    RevisionConflict,
    IdentityMissing,
    NoRecipients,
    InvalidRecipient,
    LastRecipient,
    NotARecipient,
    Untrusted,
    InvalidCiphertext,
    DecryptionFailed,
    TaskNotFound,
    NoClaimable,
    NotOwner,
    PlaintextDetected,
    GitUnavailable,
    InvalidArgument,
    Config,
    Decode,
    Io,
}

impl ErrKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrKind::InvalidKey => "invalid_key",
            ErrKind::DuplicateKey => "duplicate_key",
            ErrKind::MalformedQuote => "malformed_quote",
            ErrKind::EncodingError => "encoding_error",
            ErrKind::InvalidScope => "invalid_scope",
            ErrKind::NotFound => "not_found",
            ErrKind::ScopeExists => "scope_exists",
            ErrKind::IdentityInitFailed => "identity_init_failed",
            ErrKind::PersistenceFailed => "persistence_failed",
            ErrKind::NotAuthenticated => "not_authenticated",
            ErrKind::Unauthorized => "unauthorized",
            ErrKind::Network => "network",
            ErrKind::Server => "server",
            ErrKind::RevisionConflict => "revision_conflict",
            ErrKind::IdentityMissing => "identity_missing",
            ErrKind::NoRecipients => "no_recipients",
            ErrKind::InvalidRecipient => "invalid_recipient",
            ErrKind::LastRecipient => "last_recipient",
            ErrKind::NotARecipient => "not_a_recipient",
            ErrKind::Untrusted => "untrusted",
            ErrKind::InvalidCiphertext => "invalid_ciphertext",
            ErrKind::DecryptionFailed => "decryption_failed",
            ErrKind::TaskNotFound => "task_not_found",
            ErrKind::NoClaimable => "no_claimable",
            ErrKind::NotOwner => "not_owner",
            ErrKind::PlaintextDetected => "plaintext_detected",
            ErrKind::GitUnavailable => "git_unavailable",
            ErrKind::InvalidArgument => "invalid_argument",
            ErrKind::Config => "config",
            ErrKind::Decode => "decode",
            ErrKind::Io => "io",
        }
    }

    pub fn exit_code(self) -> i32 {
        match self {
            ErrKind::PlaintextDetected => 2,
            _ => 1,
        }
    }
}

impl fmt::Display for ErrKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Top-level error returned by command dispatch.
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error(transparent)]
    Dotenv(#[from] DotenvError),
    #[error(transparent)]
    Identity(#[from] IdentityError),
    #[error(transparent)]
    Sun(#[from] SunError),
    #[error(transparent)]
    Vault(#[from] VaultError),
    #[error(transparent)]
    Taskboard(#[from] TaskboardError),
    #[error(transparent)]
    Guard(#[from] GuardError),
    #[error(transparent)]
    Machine(#[from] MachineError),
    #[error(transparent)]
    Settings(#[from] SettingsError),
    #[error("{0}")]
    InvalidArgument(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl AppError {
    /// Structured payload merged into the `--json` failure document.
    pub fn details(&self) -> Option<(&'static str, serde_json::Value)> {
        match self {
            AppError::Guard(GuardError::PlaintextDetected(report)) => serde_json::to_value(report)
                .ok()
                .map(|value| ("report", value)),
            _ => None,
        }
    }

    pub fn kind(&self) -> ErrKind {
        match self {
            AppError::Dotenv(err) => err.kind(),
            AppError::Identity(err) => err.kind(),
            AppError::Sun(err) => err.kind(),
            AppError::Vault(err) => err.kind(),
            AppError::Taskboard(err) => err.kind(),
            AppError::Guard(err) => err.kind(),
            AppError::Machine(err) => err.kind(),
            AppError::Settings(err) => err.kind(),
            AppError::InvalidArgument(_) => ErrKind::InvalidArgument,
            AppError::Io(_) => ErrKind::Io,
        }
    }
}
