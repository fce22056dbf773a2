use std::fmt;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::str::FromStr;

use age::secrecy::ExposeSecret;
use age::x25519;
use base64::engine::general_purpose::{STANDARD, STANDARD_NO_PAD, URL_SAFE, URL_SAFE_NO_PAD};
use base64::Engine;
use time::OffsetDateTime;

use crate::context::{format_rfc3339, Env};
use crate::dotenv::MARKER_PREFIX;
use crate::error::ErrKind;
use crate::fsio;

pub use crate::dotenv::is_encrypted_marker;

const SECRET_KEY_PREFIX: &str = "AGE-SECRET-KEY-";
const INLINE_IDENTITY_KEYS: &[&str] = &["SI_VAULT_IDENTITY", "SI_VAULT_PRIVATE_KEY"];
const IDENTITY_FILE_KEY: &str = "SI_VAULT_IDENTITY_FILE";
const ALLOW_INSECURE_KEY_FILE: &[&str] = &["SI_VAULT_ALLOW_INSECURE_KEY_FILE"];

#[derive(Debug, thiserror::Error)]
pub enum IdentityError {
    #[error("no vault identity at {0}; run `si vault init` first")]
    Missing(PathBuf),
    #[error("failed to initialise identity at {path}: {source}")]
    InitFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("identity file {0} must be owner-only and not a symlink (set SI_VAULT_ALLOW_INSECURE_KEY_FILE=1 to override)")]
    InsecureKeyFile(PathBuf),
    #[error("invalid identity from {source_name}: {reason}")]
    InvalidIdentity {
        source_name: String,
        reason: String,
    },
    #[error("encryption requires at least one recipient")]
    NoRecipients,
    #[error("invalid recipient {0:?}")]
    InvalidRecipient(String),
    #[error("this identity is not a recipient of the ciphertext")]
    NotARecipient,
    #[error("invalid ciphertext: {0}")]
    InvalidCiphertext(String),
    #[error("decryption failed")]
    DecryptionFailed,
    #[error("encryption failed: {0}")]
    EncryptionFailed(String),
    #[error("identity I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl IdentityError {
    pub fn kind(&self) -> ErrKind {
        match self {
            IdentityError::Missing(_) => ErrKind::IdentityMissing,
            IdentityError::InitFailed { .. } => ErrKind::IdentityInitFailed,
            IdentityError::InsecureKeyFile(_) | IdentityError::InvalidIdentity { .. } => {
                ErrKind::Config
            }
            IdentityError::NoRecipients => ErrKind::NoRecipients,
            IdentityError::InvalidRecipient(_) => ErrKind::InvalidRecipient,
            IdentityError::NotARecipient => ErrKind::NotARecipient,
            IdentityError::InvalidCiphertext(_) => ErrKind::InvalidCiphertext,
            IdentityError::DecryptionFailed => ErrKind::DecryptionFailed,
            IdentityError::EncryptionFailed(_) => ErrKind::EncodingError,
            IdentityError::Io { .. } => ErrKind::Io,
        }
    }
}

/// An X25519 age identity and its recipient string.
pub struct Identity {
    secret: x25519::Identity,
    recipient: String,
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Identity")
            .field("recipient", &self.recipient)
            .finish_non_exhaustive()
    }
}

impl Identity {
    pub fn generate() -> Self {
        Self::from_secret(x25519::Identity::generate())
    }

    fn from_secret(secret: x25519::Identity) -> Self {
        let recipient = secret.to_public().to_string();
        Self { secret, recipient }
    }

    /// Parses the first `AGE-SECRET-KEY-` line of `raw`.
    pub fn parse(raw: &str, source_name: &str) -> Result<Self, IdentityError> {
        let invalid = |reason: &str| IdentityError::InvalidIdentity {
            source_name: source_name.to_string(),
            reason: reason.to_string(),
        };
        let line = raw
            .lines()
            .map(str::trim)
            .find(|line| line.starts_with(SECRET_KEY_PREFIX))
            .ok_or_else(|| invalid("no AGE-SECRET-KEY line"))?;
        let secret = x25519::Identity::from_str(line).map_err(invalid)?;
        Ok(Self::from_secret(secret))
    }

    pub fn recipient(&self) -> &str {
        &self.recipient
    }

    fn render_key_file(&self, created: OffsetDateTime) -> String {
        format!(
            "# created: {}\n# public key: {}\n{}\n",
            format_rfc3339(created),
            self.recipient,
            self.secret.to_string().expose_secret()
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IdentitySource {
    Env(&'static str),
    File(PathBuf),
}

impl fmt::Display for IdentitySource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IdentitySource::Env(key) => write!(f, "env:{key}"),
            IdentitySource::File(path) => write!(f, "file:{}", path.display()),
        }
    }
}

/// Resolves the local identity from the environment or the key file.
pub struct IdentityStore<'a> {
    env: &'a Env,
    default_path: PathBuf,
}

impl<'a> IdentityStore<'a> {
    pub fn new(env: &'a Env, default_path: PathBuf) -> Self {
        Self { env, default_path }
    }

    pub fn key_path(&self) -> PathBuf {
        self.env
            .get(IDENTITY_FILE_KEY)
            .map(PathBuf::from)
            .unwrap_or_else(|| self.default_path.clone())
    }

    /// `Ok(None)` when no identity is configured anywhere.
    pub fn load(&self) -> Result<Option<(Identity, IdentitySource)>, IdentityError> {
        for key in INLINE_IDENTITY_KEYS {
            if let Some(raw) = self.env.get(key) {
                let identity = Identity::parse(raw, key)?;
                return Ok(Some((identity, IdentitySource::Env(*key))));
            }
        }
        let path = self.key_path();
        if !path.exists() && !fsio::is_symlink(&path) {
            return Ok(None);
        }
        let allow_insecure = self.env.flag(ALLOW_INSECURE_KEY_FILE);
        let identity = read_key_file(&path, allow_insecure)?;
        Ok(Some((identity, IdentitySource::File(path))))
    }

    pub fn load_or_fail(&self) -> Result<(Identity, IdentitySource), IdentityError> {
        self.load()?
            .ok_or_else(|| IdentityError::Missing(self.key_path()))
    }

    /// Loads the identity, generating and saving one on first use.
    pub fn ensure(&self) -> Result<(Identity, IdentitySource, bool), IdentityError> {
        if let Some((identity, source)) = self.load()? {
            return Ok((identity, source, false));
        }
        let path = self.key_path();
        let identity = Identity::generate();
        save(&path, &identity, OffsetDateTime::now_utc())?;
        tracing::debug!(path = %path.display(), "generated vault identity");
        Ok((identity, IdentitySource::File(path), true))
    }
}

pub fn load_or_fail(path: &Path) -> Result<Identity, IdentityError> {
    if !path.exists() {
        return Err(IdentityError::Missing(path.to_path_buf()));
    }
    read_key_file(path, false)
}

fn read_key_file(path: &Path, allow_insecure: bool) -> Result<Identity, IdentityError> {
    if !allow_insecure && !key_file_is_private(path) {
        return Err(IdentityError::InsecureKeyFile(path.to_path_buf()));
    }
    let raw = std::fs::read_to_string(path).map_err(|source| IdentityError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    Identity::parse(&raw, &path.display().to_string())
}

#[cfg(unix)]
fn key_file_is_private(path: &Path) -> bool {
    if fsio::is_symlink(path) {
        return false;
    }
    fsio::mode_of(path).is_ok_and(|mode| mode & 0o077 == 0)
}

#[cfg(not(unix))]
fn key_file_is_private(path: &Path) -> bool {
    !fsio::is_symlink(path)
}

pub fn save(path: &Path, identity: &Identity, created: OffsetDateTime) -> Result<(), IdentityError> {
    let init_failed = |source| IdentityError::InitFailed {
        path: path.to_path_buf(),
        source,
    };
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(init_failed)?;
        #[cfg(unix)]
        fsio::set_mode(parent, 0o700).map_err(init_failed)?;
    }
    fsio::write_atomic_with_mode(
        path,
        identity.render_key_file(created).as_bytes(),
        fsio::OWNER_ONLY,
    )
    .map_err(init_failed)
}

pub fn parse_recipient(raw: &str) -> Result<x25519::Recipient, IdentityError> {
    x25519::Recipient::from_str(raw.trim())
        .map_err(|_| IdentityError::InvalidRecipient(raw.trim().to_string()))
}

pub fn encrypt_string(plaintext: &str, recipients: &[String]) -> Result<String, IdentityError> {
    if recipients.is_empty() {
        return Err(IdentityError::NoRecipients);
    }
    let parsed = recipients
        .iter()
        .map(|raw| parse_recipient(raw))
        .collect::<Result<Vec<_>, _>>()?;
    let encryptor =
        age::Encryptor::with_recipients(parsed.iter().map(|r| r as &dyn age::Recipient))
            .map_err(|err| IdentityError::EncryptionFailed(err.to_string()))?;

    let mut ciphertext = Vec::new();
    let io_failed = |err: std::io::Error| IdentityError::EncryptionFailed(err.to_string());
    let mut writer = encryptor.wrap_output(&mut ciphertext).map_err(io_failed)?;
    writer.write_all(plaintext.as_bytes()).map_err(io_failed)?;
    writer.finish().map_err(io_failed)?;

    Ok(format!(
        "{MARKER_PREFIX}{}",
        URL_SAFE_NO_PAD.encode(ciphertext)
    ))
}

pub fn decrypt_string(marker: &str, identity: &Identity) -> Result<String, IdentityError> {
    let marker = marker.trim();
    let body = marker
        .strip_prefix(MARKER_PREFIX)
        .filter(|_| is_encrypted_marker(marker))
        .ok_or_else(|| IdentityError::InvalidCiphertext("missing age:v1: marker".to_string()))?;
    let ciphertext = decode_lenient(body)
        .ok_or_else(|| IdentityError::InvalidCiphertext("body is not base64".to_string()))?;

    let decryptor = age::Decryptor::new(&ciphertext[..]).map_err(map_decrypt_error)?;
    let mut reader = decryptor
        .decrypt(std::iter::once(&identity.secret as &dyn age::Identity))
        .map_err(map_decrypt_error)?;
    let mut plaintext = Vec::new();
    reader
        .read_to_end(&mut plaintext)
        .map_err(|_| IdentityError::DecryptionFailed)?;
    String::from_utf8(plaintext)
        .map_err(|_| IdentityError::InvalidCiphertext("plaintext is not UTF-8".to_string()))
}

fn decode_lenient(body: &str) -> Option<Vec<u8>> {
    URL_SAFE_NO_PAD
        .decode(body)
        .or_else(|_| URL_SAFE.decode(body))
        .or_else(|_| STANDARD.decode(body))
        .or_else(|_| STANDARD_NO_PAD.decode(body))
        .ok()
}

fn map_decrypt_error(err: age::DecryptError) -> IdentityError {
    match err {
        age::DecryptError::NoMatchingKeys => IdentityError::NotARecipient,
        age::DecryptError::InvalidHeader | age::DecryptError::UnknownFormat => {
            IdentityError::InvalidCiphertext(err.to_string())
        }
        age::DecryptError::Io(_) => IdentityError::InvalidCiphertext(err.to_string()),
        _ => IdentityError::DecryptionFailed,
    }
}

/// Hex sha-256 over the sorted, de-duplicated recipient set.
pub fn recipients_fingerprint(recipients: &[String]) -> String {
    use sha2::{Digest, Sha256};

    let mut unique = recipients
        .iter()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .collect::<Vec<_>>();
    unique.sort();
    unique.dedup();
    let mut hasher = Sha256::new();
    hasher.update(unique.join("\n").as_bytes());
    format!("{:x}", hasher.finalize())
}
