//! Pre-commit guard: finds plaintext values in dotenv files, either in the
//! working tree or in the git index, and manages the `pre-commit` hook that
//! runs the staged check.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::dotenv::{is_encrypted_marker, Document, PUBLIC_KEY_ENTRY};
use crate::error::ErrKind;
use crate::vault::plaintext_keys;

pub mod git;
pub mod hooks;

pub use git::GitAdapter;

const EXAMPLE_SUFFIXES: [&str; 4] = ["example", "sample", "template", "dist"];
const SKIPPED_DIRS: [&str; 3] = [".git", "node_modules", "vendor"];

#[derive(Debug, thiserror::Error)]
pub enum GuardError {
    #[error("git CLI is not installed")]
    GitUnavailable,
    #[error("{} is not inside a git repository", .0.display())]
    NotARepository(PathBuf),
    #[error("git command failed ({command}, code {code:?}): {stderr}")]
    GitCommandFailed {
        command: String,
        code: Option<i32>,
        stderr: String,
    },
    /// Carries the full report so `--json` output stays a single document.
    #[error("plaintext values detected in {} file(s)", .0.findings.len())]
    PlaintextDetected(Box<CheckReport>),
    #[error("{} is not managed by si; rerun with --force to replace it", .0.display())]
    ForeignHook(PathBuf),
    #[error("I/O error at {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl GuardError {
    pub fn kind(&self) -> ErrKind {
        match self {
            GuardError::GitUnavailable | GuardError::NotARepository(_) => ErrKind::GitUnavailable,
            GuardError::GitCommandFailed { .. } | GuardError::Io { .. } => ErrKind::Io,
            GuardError::PlaintextDetected(_) => ErrKind::PlaintextDetected,
            GuardError::ForeignHook(_) => ErrKind::InvalidArgument,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct CheckOptions<'a> {
    /// Working directory for git plumbing.
    pub vault_dir: &'a Path,
    /// The resolved scope file. In working-tree mode `--all` scans its
    /// directory; in staged mode without `--all` only this path is checked.
    pub target: Option<&'a Path>,
    pub staged: bool,
    pub all: bool,
    pub include_examples: bool,
}

impl<'a> CheckOptions<'a> {
    pub fn new(vault_dir: &'a Path) -> Self {
        Self {
            vault_dir,
            target: None,
            staged: false,
            all: false,
            include_examples: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Finding {
    pub path: String,
    pub keys: Vec<String>,
    /// Remediation command printed under `Fix:`.
    pub fix: String,
    /// Parse failure for files that are not valid dotenv. `keys` then holds
    /// the assignments a line scan still found with a plaintext value.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Finding {
    pub fn for_file(display: String, absolute_path: &Path, keys: Vec<String>) -> Self {
        Self {
            path: display,
            keys,
            fix: format!(
                "si vault encrypt --file {} --format",
                shell_quote(&absolute_path.to_string_lossy())
            ),
            error: None,
        }
    }

    /// A file that failed to parse is reported rather than skipped.
    pub fn unparseable(display: String, absolute_path: &Path, bytes: &[u8], error: String) -> Self {
        let quoted = shell_quote(&absolute_path.to_string_lossy());
        Self {
            path: display,
            keys: salvage_plaintext_keys(bytes),
            fix: format!("repair the dotenv syntax in {quoted}, then si vault encrypt --file {quoted} --format"),
            error: Some(error),
        }
    }

    pub fn for_scope(location: String, scope: &str, keys: Vec<String>) -> Self {
        Self {
            path: location,
            keys,
            fix: format!("si vault encrypt --scope {scope} --format"),
            error: None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CheckReport {
    pub staged: bool,
    pub scanned: Vec<String>,
    pub findings: Vec<Finding>,
}

impl CheckReport {
    pub fn is_clean(&self) -> bool {
        self.findings.is_empty()
    }

    pub fn render(&self) -> String {
        let mut out = String::from("[si vault] plaintext values detected; encrypt before committing.\n");
        for finding in &self.findings {
            match (&finding.error, finding.keys.is_empty()) {
                (None, _) => {
                    let _ = writeln!(out, "  - {}: {}", finding.path, finding.keys.join(", "));
                }
                (Some(error), true) => {
                    let _ = writeln!(out, "  - {}: unparseable ({error})", finding.path);
                }
                (Some(error), false) => {
                    let _ = writeln!(
                        out,
                        "  - {}: {} (unparseable: {error})",
                        finding.path,
                        finding.keys.join(", ")
                    );
                }
            }
        }
        out.push_str("Fix:\n");
        for finding in &self.findings {
            let _ = writeln!(out, "  {}", finding.fix);
        }
        out.push_str("Bypass (not recommended): git commit --no-verify\n");
        out
    }
}

/// `.env` or `.env.<anything>`, minus example/template variants unless
/// `include_examples` is set.
pub fn is_candidate(path: &Path, include_examples: bool) -> bool {
    let Some(name) = path.file_name().and_then(|name| name.to_str()) else {
        return false;
    };
    if name == ".env" {
        return true;
    }
    let Some(suffix) = name.strip_prefix(".env.") else {
        return false;
    };
    if include_examples {
        return true;
    }
    !suffix
        .split('.')
        .any(|part| EXAMPLE_SUFFIXES.contains(&part.to_ascii_lowercase().as_str()))
}

pub fn check(git: &GitAdapter, options: &CheckOptions<'_>) -> Result<CheckReport, GuardError> {
    let sources = if options.staged {
        staged_sources(git, options)?
    } else {
        worktree_sources(options)
    };
    let mut report = CheckReport {
        staged: options.staged,
        ..CheckReport::default()
    };
    for source in sources.into_values() {
        report.scanned.push(source.display.clone());
        let bytes = match source.bytes {
            Some(bytes) => bytes,
            None => match fs::read(&source.absolute) {
                Ok(bytes) => bytes,
                Err(err) => {
                    tracing::warn!(path = %source.display, error = %err, "unreadable dotenv file");
                    report.findings.push(Finding::unparseable(
                        source.display,
                        &source.absolute,
                        &[],
                        format!("unreadable: {err}"),
                    ));
                    continue;
                }
            },
        };
        let document = match Document::parse(&bytes) {
            Ok(document) => document,
            Err(err) => {
                tracing::warn!(path = %source.display, error = %err, "unparseable dotenv file");
                report.findings.push(Finding::unparseable(
                    source.display,
                    &source.absolute,
                    &bytes,
                    err.to_string(),
                ));
                continue;
            }
        };
        let keys = plaintext_keys(&document);
        if !keys.is_empty() {
            report
                .findings
                .push(Finding::for_file(source.display, &source.absolute, keys));
        }
    }
    Ok(report)
}

struct Source {
    display: String,
    absolute: PathBuf,
    bytes: Option<Vec<u8>>,
}

fn staged_sources(
    git: &GitAdapter,
    options: &CheckOptions<'_>,
) -> Result<BTreeMap<PathBuf, Source>, GuardError> {
    let root = git.repo_root(options.vault_dir)?;
    let target = options.target.map(absolute);
    let mut sources = BTreeMap::new();
    for relative in git.staged_paths(options.vault_dir)? {
        if !is_candidate(&relative, options.include_examples) {
            continue;
        }
        let absolute_path = absolute(&root.join(&relative));
        if !options.all && target.as_ref() != Some(&absolute_path) {
            continue;
        }
        let bytes = git.staged_blob(options.vault_dir, &relative)?;
        sources.insert(
            absolute_path.clone(),
            Source {
                display: relative.to_string_lossy().into_owned(),
                absolute: absolute_path,
                bytes: Some(bytes),
            },
        );
    }
    Ok(sources)
}

fn worktree_sources(options: &CheckOptions<'_>) -> BTreeMap<PathBuf, Source> {
    let mut sources = BTreeMap::new();
    let Some(target) = options.target else {
        return sources;
    };
    if target.is_file() {
        sources.insert(absolute(target), file_source(target));
    }
    if options.all {
        let dir = match target.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        let mut found = Vec::new();
        walk(&dir, options.include_examples, &mut found);
        for path in found {
            sources
                .entry(absolute(&path))
                .or_insert_with(|| file_source(&path));
        }
    }
    sources
}

fn file_source(path: &Path) -> Source {
    Source {
        display: path.to_string_lossy().into_owned(),
        absolute: absolute(path),
        bytes: None,
    }
}

fn walk(dir: &Path, include_examples: bool, found: &mut Vec<PathBuf>) {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) => {
            tracing::warn!(dir = %dir.display(), error = %err, "cannot read directory");
            return;
        }
    };
    for entry in entries.flatten() {
        let path = entry.path();
        let Ok(file_type) = entry.file_type() else {
            continue;
        };
        if file_type.is_dir() {
            let skipped = entry
                .file_name()
                .to_str()
                .is_some_and(|name| SKIPPED_DIRS.contains(&name));
            if !skipped {
                walk(&path, include_examples, found);
            }
        } else if file_type.is_file() && is_candidate(&path, include_examples) {
            found.push(path);
        }
    }
}

fn absolute(path: &Path) -> PathBuf {
    fs::canonicalize(path).unwrap_or_else(|_| {
        std::env::current_dir()
            .map(|cwd| cwd.join(path))
            .unwrap_or_else(|_| path.to_path_buf())
    })
}

/// Line scan for `KEY=value` assignments with a non-marker value. Used only
/// when strict parsing has already failed.
fn salvage_plaintext_keys(bytes: &[u8]) -> Vec<String> {
    let text = String::from_utf8_lossy(bytes);
    let mut keys: Vec<String> = Vec::new();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let line = line.strip_prefix("export ").unwrap_or(line);
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let key = key.trim();
        let value = value.trim().trim_matches(|ch| ch == '"' || ch == '\'');
        if key.is_empty() || key == PUBLIC_KEY_ENTRY || value.is_empty() {
            continue;
        }
        if is_encrypted_marker(value) || keys.iter().any(|seen| seen == key) {
            continue;
        }
        keys.push(key.to_string());
    }
    keys
}

fn shell_quote(raw: &str) -> String {
    format!("'{}'", raw.replace('\'', r"'\''"))
}
