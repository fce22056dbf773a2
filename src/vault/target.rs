use std::fmt;
use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::context::StatePaths;
use crate::settings::{non_empty, Settings};
use crate::sun::KIND_DOTENV_SCOPE;

use super::{Backend, VaultError};

pub const DEFAULT_SCOPE: &str = "default";
const MAX_SCOPE_LEN: usize = 64;

/// Scope selection as given on the command line.
#[derive(Debug, Clone, Copy, Default)]
pub struct ScopeRequest<'a> {
    pub scope: Option<&'a str>,
    pub file: Option<&'a Path>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Location {
    File { path: PathBuf },
    Object { kind: &'static str, name: String },
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Location::File { path } => write!(f, "{}", path.display()),
            Location::Object { kind, name } => write!(f, "sun:{kind}/{name}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Target {
    pub scope: String,
    pub location: Location,
}

impl Target {
    /// Resolves `--scope` > `--file` > `vault.scope` > `default`.
    pub fn resolve(
        request: ScopeRequest<'_>,
        backend: Backend,
        paths: &StatePaths,
        settings: &Settings,
    ) -> Result<Self, VaultError> {
        if let Some(raw) = non_empty(request.scope) {
            return Self::for_scope(validate_scope(raw)?, backend, paths, settings);
        }
        if let Some(path) = request.file {
            if backend == Backend::Sun {
                return Err(VaultError::Unsupported(
                    "--file only applies to the local vault backend".to_string(),
                ));
            }
            return Ok(Self {
                scope: scope_from_file(path),
                location: Location::File {
                    path: path.to_path_buf(),
                },
            });
        }
        let scope = match non_empty(settings.vault.scope.as_deref()) {
            Some(raw) => validate_scope(raw)?,
            None => DEFAULT_SCOPE.to_string(),
        };
        Self::for_scope(scope, backend, paths, settings)
    }

    fn for_scope(
        scope: String,
        backend: Backend,
        paths: &StatePaths,
        settings: &Settings,
    ) -> Result<Self, VaultError> {
        let location = match backend {
            Backend::Sun => Location::Object {
                kind: KIND_DOTENV_SCOPE,
                name: object_name(&scope),
            },
            Backend::Local => Location::File {
                path: local_path(&scope, paths, settings),
            },
        };
        Ok(Self { scope, location })
    }

    pub fn file_path(&self) -> Option<&Path> {
        match &self.location {
            Location::File { path } => Some(path),
            Location::Object { .. } => None,
        }
    }
}

pub fn object_name(scope: &str) -> String {
    format!("kv/{scope}")
}

pub fn validate_scope(raw: &str) -> Result<String, VaultError> {
    let scope = raw.trim();
    let valid = !scope.is_empty()
        && scope.len() <= MAX_SCOPE_LEN
        && scope != "."
        && scope != ".."
        && scope
            .chars()
            .all(|ch| ch.is_ascii_alphanumeric() || matches!(ch, '-' | '_' | '.'));
    if valid {
        Ok(scope.to_string())
    } else {
        Err(VaultError::InvalidScope(raw.to_string()))
    }
}

fn local_path(scope: &str, paths: &StatePaths, settings: &Settings) -> PathBuf {
    if scope == DEFAULT_SCOPE {
        if let Some(file) = non_empty(settings.vault.file.as_deref()) {
            return expand_home(file, paths);
        }
        return paths.vault_dir().join(".env");
    }
    paths.vault_dir().join(format!(".env.{scope}"))
}

fn expand_home(raw: &str, paths: &StatePaths) -> PathBuf {
    match (raw.strip_prefix("~/"), paths.root().parent()) {
        (Some(rest), Some(home)) => home.join(rest),
        _ => PathBuf::from(raw),
    }
}

/// `.env` is the default scope, `.env.<x>` is `<x>`.
fn scope_from_file(path: &Path) -> String {
    let base = path
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or_default();
    let candidate = match base {
        ".env" => DEFAULT_SCOPE,
        other => other
            .strip_prefix(".env.")
            .unwrap_or_else(|| other.trim_start_matches('.')),
    };
    validate_scope(candidate).unwrap_or_else(|_| DEFAULT_SCOPE.to_string())
}
