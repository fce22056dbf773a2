use std::fs;
use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::fsio;

use super::{GitAdapter, GuardError};

pub const HOOK_TAG: &str = "# si-vault:hook pre-commit v1";
const HOOK_NAME: &str = "pre-commit";
const HOOK_MODE: u32 = 0o755;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HookState {
    Missing,
    Installed,
    Foreign,
}

impl HookState {
    pub fn as_str(self) -> &'static str {
        match self {
            HookState::Missing => "missing",
            HookState::Installed => "installed",
            HookState::Foreign => "foreign",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HookReport {
    pub path: PathBuf,
    pub state: HookState,
    pub changed: bool,
}

pub fn hook_path(git: &GitAdapter, dir: &Path) -> Result<PathBuf, GuardError> {
    Ok(git.hooks_dir(dir)?.join(HOOK_NAME))
}

pub fn status(git: &GitAdapter, dir: &Path) -> Result<HookReport, GuardError> {
    let path = hook_path(git, dir)?;
    let state = state_of(&path)?;
    Ok(HookReport {
        path,
        state,
        changed: false,
    })
}

/// Writes the managed hook. Rewriting an identical managed hook is a no-op;
/// replacing a hook without the tag needs `force`.
pub fn install(
    git: &GitAdapter,
    dir: &Path,
    si_bin: &Path,
    force: bool,
) -> Result<HookReport, GuardError> {
    let path = hook_path(git, dir)?;
    let script = render_script(si_bin);
    let existing = read_existing(&path)?;
    if let Some(existing) = &existing {
        if !is_managed(existing) && !force {
            return Err(GuardError::ForeignHook(path));
        }
        if existing == &script {
            tracing::debug!(path = %path.display(), "pre-commit hook already current");
            return Ok(HookReport {
                path,
                state: HookState::Installed,
                changed: false,
            });
        }
    }
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|source| GuardError::Io {
            path: parent.to_path_buf(),
            source,
        })?;
    }
    fsio::write_atomic_with_mode(&path, script.as_bytes(), HOOK_MODE).map_err(|source| {
        GuardError::Io {
            path: path.clone(),
            source,
        }
    })?;
    tracing::debug!(path = %path.display(), replaced = existing.is_some(), "installed pre-commit hook");
    Ok(HookReport {
        path,
        state: HookState::Installed,
        changed: true,
    })
}

/// Removes the managed hook; a foreign hook is left alone.
pub fn uninstall(git: &GitAdapter, dir: &Path) -> Result<HookReport, GuardError> {
    let path = hook_path(git, dir)?;
    match state_of(&path)? {
        HookState::Missing => Ok(HookReport {
            path,
            state: HookState::Missing,
            changed: false,
        }),
        HookState::Foreign => Err(GuardError::ForeignHook(path)),
        HookState::Installed => {
            fs::remove_file(&path).map_err(|source| GuardError::Io {
                path: path.clone(),
                source,
            })?;
            Ok(HookReport {
                path,
                state: HookState::Missing,
                changed: true,
            })
        }
    }
}

pub fn render_script(si_bin: &Path) -> String {
    let default_bin = si_bin.to_string_lossy().replace('\'', r"'\''");
    format!(
        r#"#!/bin/sh
set -e
{HOOK_TAG}
SI_BIN_DEFAULT='{default_bin}'
if [ -n "${{SI_BIN:-}}" ]; then
  SI="$SI_BIN"
elif [ -x "$SI_BIN_DEFAULT" ]; then
  SI="$SI_BIN_DEFAULT"
elif command -v si >/dev/null 2>&1; then
  SI="si"
else
  echo "si-vault pre-commit: si executable not found (set SI_BIN)" >&2
  exit 1
fi
exec "$SI" vault check --staged --all --vault-dir .
"#
    )
}

fn is_managed(script: &str) -> bool {
    script.lines().any(|line| line.trim() == HOOK_TAG)
}

fn state_of(path: &Path) -> Result<HookState, GuardError> {
    Ok(match read_existing(path)? {
        None => HookState::Missing,
        Some(script) if is_managed(&script) => HookState::Installed,
        Some(_) => HookState::Foreign,
    })
}

fn read_existing(path: &Path) -> Result<Option<String>, GuardError> {
    match fs::read(path) {
        Ok(bytes) => Ok(Some(String::from_utf8_lossy(&bytes).into_owned())),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(source) => Err(GuardError::Io {
            path: path.to_path_buf(),
            source,
        }),
    }
}
