use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use super::GuardError;

/// Thin wrapper over the `git` executable. Every call runs as
/// `git -C <cwd> ...`.
#[derive(Debug, Clone, Default)]
pub struct GitAdapter;

impl GitAdapter {
    pub fn new() -> Self {
        Self
    }

    pub fn repo_root(&self, cwd: &Path) -> Result<PathBuf, GuardError> {
        let stdout = self.run_checked(
            cwd,
            vec!["rev-parse".to_string(), "--show-toplevel".to_string()],
        )?;
        Ok(PathBuf::from(stdout.trim()))
    }

    /// Added, copied or modified paths in the index, relative to the repo root.
    pub fn staged_paths(&self, cwd: &Path) -> Result<Vec<PathBuf>, GuardError> {
        let stdout = self.run_checked(
            cwd,
            vec![
                "diff".to_string(),
                "--cached".to_string(),
                "--name-only".to_string(),
                "--diff-filter=ACM".to_string(),
                "-z".to_string(),
            ],
        )?;
        Ok(stdout
            .split('\0')
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(PathBuf::from)
            .collect())
    }

    /// Index contents of `path` (repo-root relative), not the working tree copy.
    pub fn staged_blob(&self, cwd: &Path, path: &Path) -> Result<Vec<u8>, GuardError> {
        let args = vec!["show".to_string(), format!(":{}", path.to_string_lossy())];
        let output = self.run_allow_failure(cwd, args.clone())?;
        if !output.status.success() {
            return Err(command_failed(cwd, &args, &output));
        }
        Ok(output.stdout)
    }

    /// `core.hooksPath` when configured (relative to the repo root), else
    /// the repository's own hooks directory.
    pub fn hooks_dir(&self, cwd: &Path) -> Result<PathBuf, GuardError> {
        let root = self.repo_root(cwd)?;
        if let Some(custom) = self.config_value(cwd, "core.hooksPath")? {
            let custom = PathBuf::from(custom);
            return Ok(if custom.is_absolute() {
                custom
            } else {
                root.join(custom)
            });
        }
        let git_path = self.run_checked(
            cwd,
            vec![
                "rev-parse".to_string(),
                "--git-path".to_string(),
                "hooks".to_string(),
            ],
        )?;
        let git_path = PathBuf::from(git_path);
        Ok(if git_path.is_absolute() {
            git_path
        } else {
            cwd.join(git_path)
        })
    }

    fn config_value(&self, cwd: &Path, key: &str) -> Result<Option<String>, GuardError> {
        let output = self.run_allow_failure(
            cwd,
            vec!["config".to_string(), "--get".to_string(), key.to_string()],
        )?;
        if !output.status.success() {
            return Ok(None);
        }
        let value = String::from_utf8_lossy(&output.stdout).trim().to_string();
        Ok((!value.is_empty()).then_some(value))
    }

    fn run_checked(&self, cwd: &Path, args: Vec<String>) -> Result<String, GuardError> {
        let output = self.run_allow_failure(cwd, args.clone())?;
        if !output.status.success() {
            return Err(command_failed(cwd, &args, &output));
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    fn run_allow_failure(&self, cwd: &Path, args: Vec<String>) -> Result<Output, GuardError> {
        tracing::debug!(cwd = %cwd.display(), command = %args.join(" "), "git");
        let mut cmd = Command::new("git");
        cmd.arg("-C").arg(cwd).args(&args);
        cmd.output().map_err(|err| {
            if err.kind() == std::io::ErrorKind::NotFound {
                GuardError::GitUnavailable
            } else {
                GuardError::Io {
                    path: cwd.to_path_buf(),
                    source: err,
                }
            }
        })
    }
}

fn command_failed(cwd: &Path, args: &[String], output: &Output) -> GuardError {
    let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
    let lower = stderr.to_ascii_lowercase();
    if lower.contains("not a git repository") || lower.contains("cannot change to") {
        return GuardError::NotARepository(cwd.to_path_buf());
    }
    GuardError::GitCommandFailed {
        command: format!("git -C {} {}", cwd.display(), args.join(" ")),
        code: output.status.code(),
        stderr,
    }
}
