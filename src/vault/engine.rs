use std::path::{Path, PathBuf};

use serde::Serialize;
use serde_json::{Map, Value};

use crate::context::{format_rfc3339, CommandContext};
use crate::dotenv::{validate_key, Document, PUBLIC_KEY_ENTRY};
use crate::fsio;
use crate::identity::{self, Identity, IdentityError, IdentityStore};
use crate::sun::cas::read_document;
use crate::sun::{cas_mutate, CasDocument, ObjectRevision, ObjectStore, SunError};

use super::audit::{self, AuditRecord};
use super::target::{Location, ScopeRequest, Target};
use super::trust::{self, TrustEntry, TrustState, TrustStore};
use super::{
    backup, plaintext_keys, resolve_backend, Backend, BackendResolution, PlaintextPolicy,
    VaultError, ALLOW_SYMLINK_KEYS,
};

const ENCRYPTED_PLACEHOLDER: &str = "(encrypted; use --reveal)";
const PLAINTEXT_PLACEHOLDER: &str = "(plaintext; run `si vault encrypt` to encrypt, use --reveal to print)";

/// Scope payload as stored in a `dotenv_scope` object.
struct ScopeDocument {
    scope: String,
    document: Document,
    existed: bool,
}

impl CasDocument for ScopeDocument {
    type Error = VaultError;
    const CONTENT_TYPE: &'static str = "text/plain";

    fn empty(name: &str) -> Self {
        Self {
            scope: name.strip_prefix("kv/").unwrap_or(name).to_string(),
            document: Document::default(),
            existed: false,
        }
    }

    fn decode(name: &str, payload: &[u8]) -> Result<Self, VaultError> {
        Ok(Self {
            existed: true,
            document: Document::parse(payload)?,
            ..Self::empty(name)
        })
    }

    fn encode(&self) -> Result<Vec<u8>, VaultError> {
        Ok(self.document.serialize())
    }

    fn metadata(&self) -> Map<String, Value> {
        let mut metadata = Map::new();
        metadata.insert("scope".to_string(), Value::from(self.scope.as_str()));
        metadata.insert(
            "keys".to_string(),
            Value::from(self.document.assignments().count()),
        );
        metadata
    }
}

#[derive(Debug, Clone, Copy)]
struct Mutation {
    changed: bool,
    revision: Option<i64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct InitOutcome {
    pub scope: String,
    pub location: String,
    pub backend: Backend,
    pub recipient: String,
    pub identity_source: String,
    pub identity_created: bool,
    /// Recipient fingerprint pinned for this file (local backend only).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trust_fingerprint: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub revision: Option<i64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct WriteOutcome {
    pub scope: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    pub changed: bool,
    pub backend: Backend,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub revision: Option<i64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct GetOutcome {
    pub scope: String,
    pub key: String,
    pub encrypted: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
}

impl GetOutcome {
    /// What `vault get` prints in text mode.
    pub fn display_value(&self) -> &str {
        match &self.value {
            Some(value) => value,
            None if self.encrypted => ENCRYPTED_PLACEHOLDER,
            None => PLAINTEXT_PLACEHOLDER,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ListEntry {
    pub key: String,
    pub encrypted: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct ListOutcome {
    pub scope: String,
    pub backend: Backend,
    pub location: String,
    pub entries: Vec<ListEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DumpEntry {
    pub key: String,
    pub encrypted: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DumpOutcome {
    pub scope: String,
    pub revealed: bool,
    pub entries: Vec<DumpEntry>,
}

#[derive(Debug, Clone, Serialize)]
pub struct EncryptOutcome {
    pub scope: String,
    pub location: String,
    pub encrypted_keys: Vec<String>,
    pub header_changed: bool,
    pub changed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub revision: Option<i64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RecipientsOutcome {
    pub scope: String,
    pub recipients: Vec<String>,
    pub fingerprint: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct TrustOutcome {
    pub scope: String,
    pub location: String,
    pub state: TrustState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_fingerprint: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stored_fingerprint: Option<String>,
    pub changed: bool,
}

/// Decrypted environment handed to `vault run`.
#[derive(Debug, Clone)]
pub struct RunEnv {
    pub scope: String,
    pub values: Vec<(String, String)>,
    pub plaintext_keys: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct HistoryOutcome {
    pub scope: String,
    pub name: String,
    pub revisions: Vec<ObjectRevision>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PullOutcome {
    pub path: String,
    #[serde(flatten)]
    pub receipt: backup::BackupReceipt,
}

/// The operator-facing vault API. The backend is resolved once per engine,
/// and `store` is required only for the sun backend and backups.
pub struct VaultEngine<'a> {
    ctx: &'a CommandContext,
    backend: BackendResolution,
    store: Option<&'a dyn ObjectStore>,
}

impl<'a> VaultEngine<'a> {
    pub fn new(
        ctx: &'a CommandContext,
        store: Option<&'a dyn ObjectStore>,
    ) -> Result<Self, VaultError> {
        let backend = resolve_backend(&ctx.env, &ctx.settings)?;
        tracing::debug!(backend = %backend.backend, source = backend.source, "vault backend");
        Ok(Self {
            ctx,
            backend,
            store,
        })
    }

    pub fn backend(&self) -> BackendResolution {
        self.backend
    }

    pub fn target(&self, request: ScopeRequest<'_>) -> Result<Target, VaultError> {
        Target::resolve(
            request,
            self.backend.backend,
            &self.ctx.paths,
            &self.ctx.settings,
        )
    }

    pub fn identities(&self) -> IdentityStore<'_> {
        IdentityStore::new(&self.ctx.env, self.ctx.paths.key_file())
    }

    pub fn init(&self, request: ScopeRequest<'_>) -> Result<InitOutcome, VaultError> {
        let target = self.target(request)?;
        let (identity, source, created) = self.identities().ensure()?;
        let recipient = identity.recipient().to_string();
        let header = [recipient.clone()];
        let (_, mutation) = self.mutate(&target, "init", None, |scope| {
            if scope.existed {
                return Err(VaultError::ScopeExists(target.scope.clone()));
            }
            scope.document.ensure_header(&header);
            Ok(())
        })?;
        let trust_fingerprint = self.pin_trust(&target, &header)?;
        Ok(InitOutcome {
            scope: target.scope.clone(),
            location: target.location.to_string(),
            backend: self.backend.backend,
            recipient,
            identity_source: source.to_string(),
            identity_created: created,
            trust_fingerprint,
            revision: mutation.revision,
        })
    }

    pub fn set(
        &self,
        request: ScopeRequest<'_>,
        key: &str,
        value: &str,
    ) -> Result<WriteOutcome, VaultError> {
        validate_key(key)?;
        let target = self.target(request)?;
        let own = self.own_identity()?;
        let (header, mutation) = self.mutate(&target, "set", Some(key), |scope| {
            let document = &mut scope.document;
            let before = document.recipients();
            // New values are sealed to the header, so it must be the pinned one.
            if !before.is_empty() {
                self.require_trusted(&target, &before)?;
            }
            let recipients = encryption_recipients(document, own.as_ref());
            if recipients.is_empty() {
                return Err(IdentityError::NoRecipients.into());
            }
            document.ensure_header(&recipients);
            let marker = identity::encrypt_string(value, &recipients)?;
            document.upsert(key, &marker)?;
            Ok(HeaderChange::between(before, document.recipients()))
        })?;
        if let Some(recipients) = header.repin(true) {
            self.pin_trust(&target, &recipients)?;
        }
        Ok(self.write_outcome(&target, Some(key), mutation))
    }

    pub fn get(
        &self,
        request: ScopeRequest<'_>,
        key: &str,
        reveal: bool,
    ) -> Result<GetOutcome, VaultError> {
        validate_key(key)?;
        let target = self.target(request)?;
        let document = self.load_existing(&target)?;
        let entry = document
            .entries()
            .into_iter()
            .find(|entry| entry.key == key && !entry.value.is_empty())
            .ok_or_else(|| VaultError::KeyNotFound {
                scope: target.scope.clone(),
                key: key.to_string(),
            })?;
        if reveal {
            self.require_trusted(&target, &document.recipients())?;
        }
        let value = match (reveal, entry.encrypted) {
            (false, _) => None,
            (true, false) => Some(entry.value),
            (true, true) => {
                let (identity, _) = self.identities().load_or_fail()?;
                Some(identity::decrypt_string(&entry.value, &identity)?)
            }
        };
        if reveal {
            self.audit("reveal", &target.scope, Some(key));
        }
        Ok(GetOutcome {
            scope: target.scope,
            key: key.to_string(),
            encrypted: entry.encrypted,
            value,
        })
    }

    /// Tombstones `key` with an empty value. Absent keys are left alone.
    pub fn unset(&self, request: ScopeRequest<'_>, key: &str) -> Result<WriteOutcome, VaultError> {
        validate_key(key)?;
        let target = self.target(request)?;
        let (_, mutation) = self.mutate(&target, "unset", Some(key), |scope| {
            match scope.document.lookup(key) {
                Some(value) if !value.is_empty() => Ok(scope.document.upsert(key, "")?),
                _ => Ok(false),
            }
        })?;
        Ok(self.write_outcome(&target, Some(key), mutation))
    }

    pub fn list(&self, request: ScopeRequest<'_>) -> Result<ListOutcome, VaultError> {
        let target = self.target(request)?;
        let document = self.load_existing(&target)?;
        let entries = visible_entries(&document)
            .map(|entry| ListEntry {
                key: entry.key,
                encrypted: entry.encrypted,
            })
            .collect();
        Ok(ListOutcome {
            scope: target.scope.clone(),
            backend: self.backend.backend,
            location: target.location.to_string(),
            entries,
        })
    }

    pub fn dump(&self, request: ScopeRequest<'_>, reveal: bool) -> Result<DumpOutcome, VaultError> {
        let target = self.target(request)?;
        let document = self.load_existing(&target)?;
        if reveal {
            self.require_trusted(&target, &document.recipients())?;
        }
        let visible = visible_entries(&document).collect::<Vec<_>>();
        let identity = if reveal && visible.iter().any(|entry| entry.encrypted) {
            Some(self.identities().load_or_fail()?.0)
        } else {
            None
        };
        let mut entries = Vec::with_capacity(visible.len());
        for entry in visible {
            let value = match (reveal, &identity) {
                (false, _) => None,
                (true, Some(identity)) if entry.encrypted => {
                    Some(identity::decrypt_string(&entry.value, identity)?)
                }
                (true, _) => Some(entry.value),
            };
            entries.push(DumpEntry {
                key: entry.key,
                encrypted: entry.encrypted,
                value,
            });
        }
        if reveal {
            self.audit("reveal", &target.scope, None);
        }
        Ok(DumpOutcome {
            scope: target.scope,
            revealed: reveal,
            entries,
        })
    }

    /// Encrypts every plaintext value in place; `format` also rewrites the
    /// header block canonically.
    pub fn encrypt(
        &self,
        request: ScopeRequest<'_>,
        format: bool,
    ) -> Result<EncryptOutcome, VaultError> {
        let target = self.target(request)?;
        let own = self.own_identity()?;
        let ((encrypted_keys, header_changed, header), mutation) =
            self.mutate(&target, "encrypt", None, |scope| {
                let document = &mut scope.document;
                let before = document.recipients();
                let trusted = before.is_empty() || self.require_trusted(&target, &before).is_ok();
                let plaintext = plaintext_keys(document);
                let recipients = encryption_recipients(document, own.as_ref());
                if recipients.is_empty() {
                    if plaintext.is_empty() {
                        return Ok((Vec::new(), false, HeaderChange::default()));
                    }
                    return Err(IdentityError::NoRecipients.into());
                }
                let mut header_changed = document.ensure_header(&recipients);
                for key in &plaintext {
                    let value = document.lookup(key).unwrap_or_default().to_string();
                    let marker = identity::encrypt_string(&value, &recipients)?;
                    document.upsert(key, &marker)?;
                }
                if format {
                    header_changed |= document.normalize_header();
                }
                let header = HeaderChange::between(before, document.recipients());
                Ok((plaintext, header_changed, header.with_trusted_base(trusted)))
            })?;
        // An unverified header is sealed to but never pinned implicitly.
        if let Some(recipients) = header.repin(false) {
            self.pin_trust(&target, &recipients)?;
        }
        Ok(EncryptOutcome {
            scope: target.scope.clone(),
            location: target.location.to_string(),
            encrypted_keys,
            header_changed,
            changed: mutation.changed,
            revision: mutation.revision,
        })
    }

    pub fn recipients_list(
        &self,
        request: ScopeRequest<'_>,
    ) -> Result<RecipientsOutcome, VaultError> {
        let target = self.target(request)?;
        let recipients = self.load_existing(&target)?.recipients();
        Ok(RecipientsOutcome {
            scope: target.scope,
            fingerprint: identity::recipients_fingerprint(&recipients),
            recipients,
        })
    }

    /// Widens the reader set for values written from now on. Existing
    /// ciphertext is not re-encrypted.
    pub fn recipients_add(
        &self,
        request: ScopeRequest<'_>,
        recipient: &str,
    ) -> Result<WriteOutcome, VaultError> {
        let recipient = identity::parse_recipient(recipient)?.to_string();
        let target = self.target(request)?;
        let (recipients, mutation) = self.mutate(&target, "recipients.add", None, |scope| {
            let before = scope.document.recipients();
            if !before.is_empty() {
                self.require_trusted(&target, &before)?;
            }
            scope.document.add_recipient(&recipient);
            Ok(scope.document.recipients())
        })?;
        if mutation.changed {
            self.pin_trust(&target, &recipients)?;
        }
        Ok(self.write_outcome(&target, None, mutation))
    }

    pub fn recipients_remove(
        &self,
        request: ScopeRequest<'_>,
        recipient: &str,
    ) -> Result<WriteOutcome, VaultError> {
        let recipient = identity::parse_recipient(recipient)?.to_string();
        let target = self.target(request)?;
        if let Some(own) = self.own_identity()? {
            if own.recipient() == recipient {
                return Err(VaultError::OwnRecipient(recipient));
            }
        }
        let (remaining, mutation) = self.mutate(&target, "recipients.remove", None, |scope| {
            let recipients = scope.document.recipients();
            if !recipients.contains(&recipient) {
                return Ok(recipients);
            }
            if recipients.iter().all(|existing| *existing == recipient) {
                return Err(VaultError::LastRecipient(scope.scope.clone()));
            }
            self.require_trusted(&target, &recipients)?;
            scope.document.remove_recipient(&recipient);
            Ok(scope.document.recipients())
        })?;
        if mutation.changed {
            self.pin_trust(&target, &remaining)?;
        }
        Ok(self.write_outcome(&target, None, mutation))
    }

    /// Decrypts every visible value for injection into a child process.
    /// Plaintext values are refused unless `allow_plaintext` is set.
    pub fn run_env(
        &self,
        request: ScopeRequest<'_>,
        allow_plaintext: bool,
    ) -> Result<RunEnv, VaultError> {
        let target = self.target(request)?;
        let document = self.load_existing(&target)?;
        self.require_trusted(&target, &document.recipients())?;
        let mut plaintext = plaintext_keys(&document);
        plaintext.sort();
        if !plaintext.is_empty() {
            if !allow_plaintext {
                return Err(VaultError::PlaintextRefused(target.scope.clone()));
            }
            tracing::warn!(scope = %target.scope, keys = %plaintext.join(", "), "running with plaintext values");
        }
        let visible = visible_entries(&document).collect::<Vec<_>>();
        let identity = if visible.iter().any(|entry| entry.encrypted) {
            Some(self.identities().load_or_fail()?.0)
        } else {
            None
        };
        let mut values = Vec::with_capacity(visible.len());
        for entry in visible {
            let value = match &identity {
                Some(identity) if entry.encrypted => {
                    identity::decrypt_string(&entry.value, identity)?
                }
                _ => entry.value,
            };
            values.push((entry.key, value));
        }
        self.audit("run", &target.scope, None);
        Ok(RunEnv {
            scope: target.scope,
            values,
            plaintext_keys: plaintext,
        })
    }

    pub fn trust_status(&self, request: ScopeRequest<'_>) -> Result<TrustOutcome, VaultError> {
        let target = self.target(request)?;
        let Location::File { path } = &target.location else {
            return Ok(self.trust_outcome(&target, TrustState::SunManaged, None, None, false));
        };
        let current = match read_local(path)? {
            Some(document) => Some(current_fingerprint(&document.recipients())?),
            None => None,
        };
        let stored = self.stored_fingerprint(path)?;
        let state = TrustState::classify(stored.as_deref(), current.as_deref());
        Ok(self.trust_outcome(&target, state, current, stored, false))
    }

    /// Pins the file's current recipient set.
    pub fn trust_accept(&self, request: ScopeRequest<'_>) -> Result<TrustOutcome, VaultError> {
        let (target, path) = self.local_target(request, "vault trust accept")?;
        let recipients = self.load_existing(&target)?.recipients();
        let current = current_fingerprint(&recipients)?;
        let stored = self.stored_fingerprint(&path)?;
        let changed = stored.as_deref().map(str::trim) != Some(current.as_str());
        self.pin_trust(&target, &recipients)?;
        if changed {
            self.audit("trust.accept", &target.scope, None);
        }
        Ok(self.trust_outcome(&target, TrustState::Ok, Some(current.clone()), Some(current), changed))
    }

    pub fn trust_forget(&self, request: ScopeRequest<'_>) -> Result<TrustOutcome, VaultError> {
        let (target, path) = self.local_target(request, "vault trust forget")?;
        let store_path = self.trust_store_path();
        let mut store = TrustStore::load(&store_path)?;
        let changed = store.remove(&trust::entry_key(&path));
        if changed {
            store.save(&store_path)?;
            self.audit("trust.forget", &target.scope, None);
        }
        Ok(self.trust_outcome(&target, TrustState::Untrusted, None, None, changed))
    }

    /// Plaintext keys of a stored scope; `check` uses this when the scope
    /// does not live in a local file.
    pub fn plaintext_scan(&self, request: ScopeRequest<'_>) -> Result<(Target, Vec<String>), VaultError> {
        let target = self.target(request)?;
        let keys = plaintext_keys(&self.load_existing(&target)?);
        Ok((target, keys))
    }

    pub fn history(
        &self,
        request: ScopeRequest<'_>,
        limit: usize,
    ) -> Result<HistoryOutcome, VaultError> {
        let target = self.target(request)?;
        let Location::Object { kind, name } = &target.location else {
            return Err(VaultError::Unsupported(
                "vault history requires the sun backend".to_string(),
            ));
        };
        let revisions = match self.store()?.list_revisions(kind, name, limit) {
            Ok(revisions) => revisions,
            Err(err) if err.is_not_found() => {
                return Err(VaultError::ScopeNotFound(target.scope.clone()))
            }
            Err(err) => return Err(err.into()),
        };
        Ok(HistoryOutcome {
            scope: target.scope.clone(),
            name: name.clone(),
            revisions,
        })
    }

    pub fn backup_push(
        &self,
        request: ScopeRequest<'_>,
        allow_plaintext: bool,
    ) -> Result<backup::BackupReceipt, VaultError> {
        let (target, path) = self.local_target(request, "vault backup push")?;
        let bytes = match std::fs::read(&path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(VaultError::ScopeNotFound(target.scope))
            }
            Err(source) => return Err(VaultError::Read { path, source }),
        };
        let receipt = backup::push(self.store()?, &target.scope, &bytes, allow_plaintext)?;
        self.audit("backup.push", &target.scope, None);
        Ok(receipt)
    }

    pub fn backup_pull(
        &self,
        request: ScopeRequest<'_>,
        force: bool,
    ) -> Result<PullOutcome, VaultError> {
        let (target, path) = self.local_target(request, "vault backup pull")?;
        if !force && (path.exists() || fsio::is_symlink(&path)) {
            return Err(VaultError::BackupTargetExists(path));
        }
        let (bytes, receipt) = backup::fetch(self.store()?, &target.scope)?;
        self.write_local(&path, &bytes, true)?;
        self.audit("backup.pull", &target.scope, None);
        Ok(PullOutcome {
            path: path.display().to_string(),
            receipt,
        })
    }

    fn local_target(
        &self,
        request: ScopeRequest<'_>,
        action: &str,
    ) -> Result<(Target, std::path::PathBuf), VaultError> {
        let target = self.target(request)?;
        match target.file_path() {
            Some(path) => {
                let path = path.to_path_buf();
                Ok((target, path))
            }
            None => Err(VaultError::Unsupported(format!(
                "{action} requires the local vault backend"
            ))),
        }
    }

    fn trust_store_path(&self) -> PathBuf {
        trust::store_path(&self.ctx.env, &self.ctx.settings, &self.ctx.paths)
    }

    fn stored_fingerprint(&self, path: &Path) -> Result<Option<String>, VaultError> {
        let store = TrustStore::load(&self.trust_store_path())?;
        Ok(store
            .find(&trust::entry_key(path))
            .map(|entry| entry.fingerprint.clone()))
    }

    /// Local scopes must carry the recipient set pinned in the trust store.
    /// Sun-backed scopes are not checked.
    fn require_trusted(&self, target: &Target, recipients: &[String]) -> Result<(), VaultError> {
        let Location::File { path } = &target.location else {
            return Ok(());
        };
        let current = current_fingerprint(recipients)?;
        match TrustState::classify(self.stored_fingerprint(path)?.as_deref(), Some(&current)) {
            TrustState::Ok => Ok(()),
            TrustState::Mismatch => Err(VaultError::TrustMismatch(path.clone())),
            _ => Err(VaultError::TrustNotEstablished(path.clone())),
        }
    }

    fn pin_trust(&self, target: &Target, recipients: &[String]) -> Result<Option<String>, VaultError> {
        let Location::File { path } = &target.location else {
            return Ok(None);
        };
        if recipients.is_empty() {
            return Ok(None);
        }
        let fingerprint = identity::recipients_fingerprint(recipients);
        let store_path = self.trust_store_path();
        let mut store = TrustStore::load(&store_path)?;
        store.upsert(TrustEntry {
            file: trust::entry_key(path),
            scope: target.scope.clone(),
            fingerprint: fingerprint.clone(),
            trusted_at: Some(format_rfc3339(self.ctx.now())),
        });
        store.save(&store_path)?;
        tracing::debug!(scope = %target.scope, fingerprint = %fingerprint, "pinned vault trust");
        Ok(Some(fingerprint))
    }

    fn trust_outcome(
        &self,
        target: &Target,
        state: TrustState,
        current_fingerprint: Option<String>,
        stored_fingerprint: Option<String>,
        changed: bool,
    ) -> TrustOutcome {
        TrustOutcome {
            scope: target.scope.clone(),
            location: target.location.to_string(),
            state,
            current_fingerprint,
            stored_fingerprint,
            changed,
        }
    }

    fn store(&self) -> Result<&'a dyn ObjectStore, VaultError> {
        self.store.ok_or_else(|| {
            SunError::NotAuthenticated(
                "sun is not configured; run `si sun auth login` or set SI_SUN_BASE_URL and SI_SUN_TOKEN"
                    .to_string(),
            )
            .into()
        })
    }

    fn own_identity(&self) -> Result<Option<Identity>, VaultError> {
        Ok(self.identities().load()?.map(|(identity, _)| identity))
    }

    fn load_existing(&self, target: &Target) -> Result<Document, VaultError> {
        self.load(target)?
            .ok_or_else(|| VaultError::ScopeNotFound(target.scope.clone()))
    }

    fn load(&self, target: &Target) -> Result<Option<Document>, VaultError> {
        match &target.location {
            Location::File { path } => read_local(path),
            Location::Object { kind, name } => {
                Ok(read_document::<ScopeDocument>(self.store()?, kind, name)?
                    .map(|(scope, _)| scope.document))
            }
        }
    }

    /// Load, mutate and persist one scope through whichever backend the
    /// target lives on. Mutations that leave the bytes unchanged are not
    /// written and not audited.
    fn mutate<T>(
        &self,
        target: &Target,
        action: &str,
        key: Option<&str>,
        mut apply: impl FnMut(&mut ScopeDocument) -> Result<T, VaultError>,
    ) -> Result<(T, Mutation), VaultError> {
        let (value, mutation) = match &target.location {
            Location::File { path } => {
                let existing = read_local(path)?;
                let mut scope = ScopeDocument {
                    scope: target.scope.clone(),
                    existed: existing.is_some(),
                    document: existing.unwrap_or_default(),
                };
                let before = scope.document.serialize();
                let value = apply(&mut scope)?;
                let after = scope.document.serialize();
                let changed = before != after;
                if changed {
                    self.write_local(path, &after, false)?;
                    self.auto_backup(target, &scope.document, &after);
                }
                (
                    value,
                    Mutation {
                        changed,
                        revision: None,
                    },
                )
            }
            Location::Object { kind, name } => {
                let outcome = cas_mutate::<ScopeDocument, _, _>(self.store()?, kind, name, apply)?;
                (
                    outcome.value,
                    Mutation {
                        changed: outcome.written,
                        revision: Some(outcome.put.revision),
                    },
                )
            }
        };
        if mutation.changed {
            self.audit(action, &target.scope, key);
        }
        Ok((value, mutation))
    }

    fn write_local(&self, path: &Path, bytes: &[u8], force_mode: bool) -> Result<(), VaultError> {
        let persistence = |source| VaultError::Persistence {
            path: path.to_path_buf(),
            source,
        };
        let mut destination = path.to_path_buf();
        if fsio::is_symlink(path) {
            if !self.ctx.env.flag(ALLOW_SYMLINK_KEYS) {
                return Err(VaultError::SymlinkRefused(path.to_path_buf()));
            }
            destination = std::fs::canonicalize(path).map_err(persistence)?;
        }
        let written = if force_mode {
            fsio::write_atomic_with_mode(&destination, bytes, fsio::OWNER_ONLY)
        } else {
            fsio::write_atomic(&destination, bytes, fsio::OWNER_ONLY)
        };
        written.map_err(persistence)
    }

    fn auto_backup(&self, target: &Target, document: &Document, bytes: &[u8]) {
        if !self.ctx.settings.sun.auto_sync {
            return;
        }
        if !matches!(
            PlaintextPolicy::resolve(&self.ctx.settings),
            Ok(PlaintextPolicy::Block)
        ) {
            return;
        }
        if !plaintext_keys(document).is_empty() {
            tracing::debug!(scope = %target.scope, "skipping auto-backup of scope with plaintext");
            return;
        }
        let Some(store) = self.store else {
            tracing::warn!(scope = %target.scope, "vault auto-backup skipped: sun is not configured");
            return;
        };
        if let Err(err) = backup::push(store, &target.scope, bytes, false) {
            tracing::warn!(scope = %target.scope, error = %err, "vault auto-backup failed");
        }
    }

    fn audit(&self, action: &str, scope: &str, key: Option<&str>) {
        let Some(path) = audit::log_path(&self.ctx.env, &self.ctx.settings) else {
            return;
        };
        audit::append(
            &path,
            &AuditRecord {
                ts: format_rfc3339(self.ctx.now()),
                action,
                scope,
                key,
                backend: self.backend.backend,
            },
        );
    }

    fn write_outcome(&self, target: &Target, key: Option<&str>, mutation: Mutation) -> WriteOutcome {
        WriteOutcome {
            scope: target.scope.clone(),
            key: key.map(str::to_string),
            changed: mutation.changed,
            backend: self.backend.backend,
            revision: mutation.revision,
        }
    }
}

fn read_local(path: &Path) -> Result<Option<Document>, VaultError> {
    match std::fs::read(path) {
        Ok(bytes) => Ok(Some(Document::parse(&bytes)?)),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(source) => Err(VaultError::Read {
            path: path.to_path_buf(),
            source,
        }),
    }
}

/// Recipient sets before and after a write that may touch the header.
#[derive(Debug, Default)]
struct HeaderChange {
    before: Vec<String>,
    after: Vec<String>,
    trusted_base: bool,
}

impl HeaderChange {
    fn between(before: Vec<String>, after: Vec<String>) -> Self {
        Self {
            trusted_base: before.is_empty(),
            before,
            after,
        }
    }

    fn with_trusted_base(mut self, trusted: bool) -> Self {
        self.trusted_base |= trusted;
        self
    }

    /// The new recipient set to pin, if the header changed and the old one
    /// was either absent or already verified.
    fn repin(self, verified: bool) -> Option<Vec<String>> {
        let changed = self.before != self.after && !self.after.is_empty();
        (changed && (verified || self.trusted_base)).then_some(self.after)
    }
}

fn current_fingerprint(recipients: &[String]) -> Result<String, VaultError> {
    if recipients.is_empty() {
        return Err(IdentityError::NoRecipients.into());
    }
    Ok(identity::recipients_fingerprint(recipients))
}

/// The document's recipients plus the local identity's own recipient.
fn encryption_recipients(document: &Document, own: Option<&Identity>) -> Vec<String> {
    let mut recipients = document.recipients();
    if let Some(own) = own {
        if !recipients.iter().any(|existing| existing == own.recipient()) {
            recipients.push(own.recipient().to_string());
        }
    }
    recipients
}

fn visible_entries(document: &Document) -> impl Iterator<Item = crate::dotenv::Entry> {
    document
        .entries()
        .into_iter()
        .filter(|entry| entry.key != PUBLIC_KEY_ENTRY && !entry.value.is_empty())
}

#[cfg(test)]
#[path = "engine_tests.rs"]
mod tests;
