use std::io::Write;
use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::context::Env;
use crate::settings::{non_empty, Settings};

use super::{Backend, AUDIT_LOG_KEY};

/// One line of the vault audit log. Never carries a value.
#[derive(Debug, Serialize)]
pub struct AuditRecord<'a> {
    pub ts: String,
    pub action: &'a str,
    pub scope: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key: Option<&'a str>,
    pub backend: Backend,
}

pub fn log_path(env: &Env, settings: &Settings) -> Option<PathBuf> {
    env.get(AUDIT_LOG_KEY)
        .or_else(|| non_empty(settings.vault.audit_log.as_deref()))
        .map(PathBuf::from)
}

/// Appends `record`; failures are logged and otherwise ignored.
pub fn append(path: &Path, record: &AuditRecord<'_>) {
    if let Err(err) = try_append(path, record) {
        tracing::warn!(path = %path.display(), error = %err, "vault audit log append failed");
    }
}

fn try_append(path: &Path, record: &AuditRecord<'_>) -> std::io::Result<()> {
    if let Some(parent) = path.parent().filter(|dir| !dir.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    let mut line = serde_json::to_vec(record)?;
    line.push(b'\n');
    let mut options = std::fs::OpenOptions::new();
    options.create(true).append(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(crate::fsio::OWNER_ONLY);
    }
    options.open(path)?.write_all(&line)
}
