//! External command execution behind a mockable runner.

use std::ffi::OsString;
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::process::Stdio;
use std::time::Duration;

use camino::Utf8PathBuf;
use thiserror::Error;
use tokio::process::Command;
use tracing::debug;

/// A command line to execute.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Invocation {
    /// Program name or path.
    pub program: String,
    /// Arguments passed to the program.
    pub args: Vec<OsString>,
    /// Working directory, when it matters.
    pub cwd: Option<Utf8PathBuf>,
    /// Upper bound on the run time.
    pub timeout: Option<Duration>,
}

impl Invocation {
    /// Starts an invocation of `program` with no arguments.
    #[must_use]
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: None,
            timeout: None,
        }
    }

    /// Appends one argument.
    #[must_use]
    pub fn arg(mut self, value: impl Into<OsString>) -> Self {
        self.args.push(value.into());
        self
    }

    /// Appends several arguments.
    #[must_use]
    pub fn args<I, S>(mut self, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args.extend(values.into_iter().map(Into::into));
        self
    }

    /// Sets the working directory.
    #[must_use]
    pub fn current_dir(mut self, dir: impl Into<Utf8PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    /// Bounds the run time.
    #[must_use]
    pub const fn timeout(mut self, limit: Duration) -> Self {
        self.timeout = Some(limit);
        self
    }

    /// Returns a shell-like command string for logs and assertions.
    #[must_use]
    pub fn command_string(&self) -> String {
        let mut parts = Vec::with_capacity(self.args.len() + 1);
        parts.push(self.program.clone());
        parts.extend(
            self.args
                .iter()
                .map(|arg| arg.to_string_lossy().into_owned()),
        );
        parts.join(" ")
    }
}

/// Result of running an external command.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct CommandOutput {
    /// Exit code reported by the process, if available.
    pub code: Option<i32>,
    /// Captured standard output.
    pub stdout: String,
    /// Captured standard error.
    pub stderr: String,
}

impl CommandOutput {
    /// Returns `true` when the exit code equals zero.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self.code, Some(0))
    }
}

/// Errors raised before a command produced an exit status.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum CommandError {
    /// Raised when the process could not be started.
    #[error("failed to spawn {program}: {message}")]
    Spawn {
        /// Program that failed to start.
        program: String,
        /// Operating system error string.
        message: String,
        /// Whether the program could not be found at all.
        not_found: bool,
    },
    /// Raised when the process outlived its time limit and was killed.
    #[error("{program} did not finish within {seconds}s")]
    Timeout {
        /// Program that timed out.
        program: String,
        /// Limit that was exceeded.
        seconds: u64,
    },
}

/// Future returned by [`CommandRunner::run`].
pub type RunFuture<'a> = Pin<Box<dyn Future<Output = Result<CommandOutput, CommandError>> + Send + 'a>>;

/// Abstraction over command execution to support fakes in tests.
pub trait CommandRunner: Send + Sync {
    /// Runs the invocation, capturing stdout and stderr.
    ///
    /// Dropping the returned future kills the child process.
    fn run<'a>(&'a self, invocation: &'a Invocation) -> RunFuture<'a>;
}

/// Real command runner that spawns host processes.
#[derive(Clone, Copy, Debug, Default)]
pub struct ProcessCommandRunner;

impl CommandRunner for ProcessCommandRunner {
    fn run<'a>(&'a self, invocation: &'a Invocation) -> RunFuture<'a> {
        Box::pin(async move {
            debug!(command = %invocation.command_string(), "spawning");
            let mut command = Command::new(&invocation.program);
            command
                .args(&invocation.args)
                .stdin(Stdio::null())
                .kill_on_drop(true);
            if let Some(dir) = &invocation.cwd {
                command.current_dir(dir);
            }

            let pending = command.output();
            let finished = match invocation.timeout {
                Some(limit) => tokio::time::timeout(limit, pending).await.map_err(|_| {
                    CommandError::Timeout {
                        program: invocation.program.clone(),
                        seconds: limit.as_secs(),
                    }
                })?,
                None => pending.await,
            };
            let output = finished.map_err(|err| CommandError::Spawn {
                program: invocation.program.clone(),
                message: err.to_string(),
                not_found: err.kind() == io::ErrorKind::NotFound,
            })?;

            Ok(CommandOutput {
                code: output.status.code(),
                stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            })
        })
    }
}

/// Runs `invocation` attached to the current terminal and returns its exit
/// code. Used for interactive sessions, so no timeout applies.
///
/// # Errors
///
/// Returns [`CommandError::Spawn`] when the process cannot be started.
pub async fn attach(invocation: &Invocation) -> Result<Option<i32>, CommandError> {
    debug!(command = %invocation.command_string(), "attaching");
    let mut command = Command::new(&invocation.program);
    command
        .args(&invocation.args)
        .stdin(Stdio::inherit())
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit());
    if let Some(dir) = &invocation.cwd {
        command.current_dir(dir);
    }
    let status = command.status().await.map_err(|err| CommandError::Spawn {
        program: invocation.program.clone(),
        message: err.to_string(),
        not_found: err.kind() == io::ErrorKind::NotFound,
    })?;
    Ok(status.code())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(unix)]
    #[tokio::test]
    async fn attach_reports_the_exit_code() {
        let invocation = Invocation::new("sh").args(["-c", "exit 4"]);

        let code = attach(&invocation).await.expect("runs");

        assert_eq!(code, Some(4));
    }

    #[test]
    fn command_string_joins_program_and_args() {
        let invocation = Invocation::new("podman").args(["stop", "-t", "0", "demo"]);
        assert_eq!(invocation.command_string(), "podman stop -t 0 demo");
    }

    #[tokio::test]
    async fn missing_program_is_reported_as_not_found() {
        let invocation = Invocation::new("berth-definitely-not-installed");

        let err = ProcessCommandRunner
            .run(&invocation)
            .await
            .expect_err("spawn should fail");

        assert!(
            matches!(err, CommandError::Spawn { not_found: true, .. }),
            "got {err:?}"
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn captures_output_and_exit_code() {
        let invocation = Invocation::new("sh").args(["-c", "echo out; echo err >&2; exit 3"]);

        let output = ProcessCommandRunner.run(&invocation).await.expect("runs");

        assert_eq!(output.code, Some(3));
        assert_eq!(output.stdout.trim(), "out");
        assert_eq!(output.stderr.trim(), "err");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn timeout_kills_the_child() {
        let invocation = Invocation::new("sleep")
            .arg("5")
            .timeout(Duration::from_millis(50));

        let err = ProcessCommandRunner.run(&invocation).await.expect_err("times out");

        assert!(matches!(err, CommandError::Timeout { .. }), "got {err:?}");
    }
}
