use serde::Serialize;
use serde_json::{Map, Value};

use crate::dotenv::Document;
use crate::sun::{sha256_hex, ObjectStore, PutRequest, KIND_VAULT_BACKUP};

use super::{plaintext_keys, VaultError};

const CONTENT_TYPE: &str = "text/plain";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BackupReceipt {
    pub scope: String,
    pub revision: i64,
    pub sha256: String,
    pub size_bytes: usize,
}

/// Uploads a whole scope file to `vault_backup/<scope>`, last writer wins.
pub fn push(
    store: &dyn ObjectStore,
    scope: &str,
    bytes: &[u8],
    allow_plaintext: bool,
) -> Result<BackupReceipt, VaultError> {
    if !allow_plaintext && !plaintext_keys(&Document::parse(bytes)?).is_empty() {
        return Err(VaultError::PlaintextRefused(scope.to_string()));
    }
    let sha256 = sha256_hex(bytes);
    let mut metadata = Map::new();
    metadata.insert("scope".to_string(), Value::from(scope));
    metadata.insert("sha256".to_string(), Value::from(sha256.clone()));
    metadata.insert("size_bytes".to_string(), Value::from(bytes.len()));
    let put = store.put_object(PutRequest {
        kind: KIND_VAULT_BACKUP,
        name: scope,
        payload: bytes,
        content_type: CONTENT_TYPE,
        metadata,
        expected_revision: None,
    })?;
    tracing::debug!(scope, revision = put.revision, "vault backup pushed");
    Ok(BackupReceipt {
        scope: scope.to_string(),
        revision: put.revision,
        sha256,
        size_bytes: bytes.len(),
    })
}

/// Downloads the latest backup of `scope` and checks it against the
/// checksum and size recorded by the store and by [`push`].
pub fn fetch(store: &dyn ObjectStore, scope: &str) -> Result<(Vec<u8>, BackupReceipt), VaultError> {
    let meta = store
        .lookup_meta(KIND_VAULT_BACKUP, scope)?
        .ok_or_else(|| VaultError::ScopeNotFound(format!("backup {scope}")))?;
    let payload = store.get_payload(KIND_VAULT_BACKUP, scope)?;
    let sha256 = sha256_hex(&payload);
    let mismatch = |reason: String| VaultError::BackupMismatch {
        scope: scope.to_string(),
        reason,
    };

    if !meta.checksum.is_empty() && !meta.checksum.eq_ignore_ascii_case(&sha256) {
        return Err(mismatch(format!(
            "checksum {sha256} does not match stored {}",
            meta.checksum
        )));
    }
    if meta.size_bytes != payload.len() as i64 {
        return Err(mismatch(format!(
            "size {} does not match stored {}",
            payload.len(),
            meta.size_bytes
        )));
    }
    if let Some(recorded) = meta.metadata.get("sha256").and_then(Value::as_str) {
        if !recorded.eq_ignore_ascii_case(&sha256) {
            return Err(mismatch(format!(
                "checksum {sha256} does not match recorded {recorded}"
            )));
        }
    }
    if let Some(recorded) = meta.metadata.get("size_bytes").and_then(Value::as_u64) {
        if recorded != payload.len() as u64 {
            return Err(mismatch(format!(
                "size {} does not match recorded {recorded}",
                payload.len()
            )));
        }
    }

    let receipt = BackupReceipt {
        scope: scope.to_string(),
        revision: meta.latest_revision,
        sha256,
        size_bytes: payload.len(),
    };
    Ok((payload, receipt))
}
