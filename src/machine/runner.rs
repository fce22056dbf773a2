use std::io::Read;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use super::MachineError;

const POLL_INTERVAL: Duration = Duration::from_millis(25);

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
    /// Set when the process could not be started or was killed.
    pub error: Option<String>,
}

/// Executes the `si` arguments of a claimed job.
pub trait JobRunner {
    fn run(&self, command: &[String], timeout: Duration) -> RunOutput;
}

/// Runs jobs with the local `si` executable and `NO_COLOR=1`.
#[derive(Debug, Clone)]
pub struct LocalSi {
    executable: PathBuf,
}

impl LocalSi {
    pub fn new(executable: PathBuf) -> Self {
        Self { executable }
    }

    pub fn current() -> Result<Self, MachineError> {
        std::env::current_exe()
            .map(Self::new)
            .map_err(|err| MachineError::InvalidArgument(format!("cannot locate si executable: {err}")))
    }
}

impl JobRunner for LocalSi {
    fn run(&self, command: &[String], timeout: Duration) -> RunOutput {
        if command.is_empty() {
            return failed("empty si command".to_string());
        }
        let spawned = Command::new(&self.executable)
            .args(command)
            .env("NO_COLOR", "1")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn();
        let mut child = match spawned {
            Ok(child) => child,
            Err(err) => return failed(format!("failed to start {}: {err}", self.executable.display())),
        };
        let stdout = child.stdout.take().map(drain);
        let stderr = child.stderr.take().map(drain);

        // `None` means the timeout is past what `Instant` can represent.
        let deadline = Instant::now().checked_add(timeout);
        let status = loop {
            match child.try_wait() {
                Ok(Some(status)) => break Ok(status),
                Ok(None) if deadline.is_some_and(|deadline| Instant::now() >= deadline) => {
                    let _ = child.kill();
                    let _ = child.wait();
                    break Err(format!("timed out after {}s", timeout.as_secs()));
                }
                Ok(None) => thread::sleep(POLL_INTERVAL),
                Err(err) => {
                    let _ = child.kill();
                    let _ = child.wait();
                    break Err(err.to_string());
                }
            }
        };

        let mut output = RunOutput {
            stdout: collect(stdout),
            stderr: collect(stderr),
            ..RunOutput::default()
        };
        match status {
            Ok(status) => output.exit_code = status.code().unwrap_or(1),
            Err(message) => {
                output.exit_code = 1;
                output.error = Some(message);
            }
        }
        output
    }
}

fn failed(message: String) -> RunOutput {
    RunOutput {
        exit_code: 1,
        error: Some(message),
        ..RunOutput::default()
    }
}

fn drain<R: Read + Send + 'static>(mut pipe: R) -> JoinHandle<Vec<u8>> {
    thread::spawn(move || {
        let mut buffer = Vec::new();
        let _ = pipe.read_to_end(&mut buffer);
        buffer
    })
}

fn collect(handle: Option<JoinHandle<Vec<u8>>>) -> String {
    handle
        .and_then(|handle| handle.join().ok())
        .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
        .unwrap_or_default()
}

#[cfg(all(test, unix))]
mod tests {
    use std::path::PathBuf;
    use std::time::Duration;

    use super::{JobRunner, LocalSi};

    fn sh(script: &str, timeout: Duration) -> super::RunOutput {
        LocalSi::new(PathBuf::from("/bin/sh")).run(&["-c".to_string(), script.to_string()], timeout)
    }

    #[test]
    fn captures_streams_exit_code_and_no_color() {
        let output = sh(
            "echo \"out:$NO_COLOR\"; echo err >&2; exit 3",
            Duration::from_secs(10),
        );
        assert_eq!(output.stdout, "out:1\n");
        assert_eq!(output.stderr, "err\n");
        assert_eq!(output.exit_code, 3);
        assert!(output.error.is_none());
    }

    #[test]
    fn kills_jobs_that_outlive_the_timeout() {
        let output = sh("exec sleep 5", Duration::from_millis(200));
        assert_eq!(output.exit_code, 1);
        assert!(output
            .error
            .as_deref()
            .is_some_and(|error| error.starts_with("timed out")));
    }

    #[test]
    fn unrepresentable_timeouts_run_to_completion() {
        let output = sh("echo done", Duration::MAX);
        assert_eq!(output.stdout, "done\n");
        assert_eq!(output.exit_code, 0);
        assert!(output.error.is_none());
    }

    #[test]
    fn missing_executables_fail_without_panicking() {
        let output = LocalSi::new(PathBuf::from("/nonexistent/si"))
            .run(&["vault".to_string()], Duration::from_secs(1));
        assert_eq!(output.exit_code, 1);
        assert!(output.error.is_some());
        assert!(LocalSi::new(PathBuf::from("/bin/sh"))
            .run(&[], Duration::from_secs(1))
            .error
            .is_some());
    }
}
