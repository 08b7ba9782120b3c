//! Capability interface implemented by the VM and container drivers.
//!
//! The lifecycle is written once against [`Backend`]; [`BackendSelector`]
//! picks the implementation for a record's infrastructure type.

use std::fmt;
use std::future::Future;
use std::pin::Pin;

use camino::Utf8PathBuf;
use thiserror::Error;

use crate::plan::{InfraType, InfrastructurePlan};
use crate::process::{CommandError, CommandOutput, Invocation};
use crate::record::{InstanceRecord, PortBinding};

const EXHAUSTION_MARKERS: [&str; 7] = [
    "out of memory",
    "cannot allocate memory",
    "not enough memory",
    "insufficient memory",
    "no space left",
    "not enough space",
    "insufficient disk",
];

/// How the provisioning collaborator reaches an instance.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ConnectionTarget {
    /// Over SSH using the descriptor's host, port and key.
    Ssh,
    /// Through the container runtime, addressing the named container.
    Container {
        /// Container name known to the runtime.
        name: String,
    },
}

/// Everything needed to open a session on, or provision, an instance.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ConnectionDescriptor {
    /// Address to connect to.
    pub host: String,
    /// SSH port (ignored for container targets).
    pub port: u16,
    /// Login user.
    pub user: String,
    /// Private key, if any.
    pub key_path: Option<Utf8PathBuf>,
    /// Transport used by the provisioning collaborator.
    pub target: ConnectionTarget,
}

/// Stable category of a [`BackendError`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum BackendErrorKind {
    /// The backend tool or provider is missing or unusable.
    ProviderUnavailable,
    /// The host lacks memory, disk or similar resources.
    InsufficientHostResources,
    /// The operation exceeded its time limit.
    Timeout,
    /// The instance name is already taken by something berth did not create.
    NameInUse,
    /// Any other failure.
    Unknown,
}

impl BackendErrorKind {
    /// `SCREAMING_SNAKE_CASE` name used in user-facing output.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ProviderUnavailable => "PROVIDER_UNAVAILABLE",
            Self::InsufficientHostResources => "INSUFFICIENT_HOST_RESOURCES",
            Self::Timeout => "TIMEOUT",
            Self::NameInUse => "NAME_IN_USE",
            Self::Unknown => "UNKNOWN",
        }
    }
}

impl fmt::Display for BackendErrorKind {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str(self.as_str())
    }
}

/// Errors raised by backends.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum BackendError {
    /// The backend tool is not installed or the provider cannot be used.
    #[error("{provider} is unavailable: {message}")]
    ProviderUnavailable {
        /// Tool or provider name.
        provider: String,
        /// Detail from the probe.
        message: String,
    },
    /// The host cannot satisfy the request.
    #[error("insufficient host resources: {message}")]
    InsufficientHostResources {
        /// Detail reported by the backend tool.
        message: String,
    },
    /// The operation did not finish in time.
    #[error("{operation} timed out after {seconds}s")]
    Timeout {
        /// Operation that timed out.
        operation: String,
        /// Limit that was exceeded.
        seconds: u64,
    },
    /// The backend already has an instance under this name.
    #[error("a {tool} instance named {name} already exists")]
    NameInUse {
        /// Tool that owns the name.
        tool: String,
        /// Name that is taken.
        name: String,
    },
    /// Any other failure.
    #[error("{operation} failed: {message}")]
    Unknown {
        /// Operation that failed.
        operation: String,
        /// Detail reported by the backend tool.
        message: String,
    },
}

impl BackendError {
    /// Returns the stable category of the error.
    #[must_use]
    pub const fn kind(&self) -> BackendErrorKind {
        match self {
            Self::ProviderUnavailable { .. } => BackendErrorKind::ProviderUnavailable,
            Self::InsufficientHostResources { .. } => BackendErrorKind::InsufficientHostResources,
            Self::Timeout { .. } => BackendErrorKind::Timeout,
            Self::NameInUse { .. } => BackendErrorKind::NameInUse,
            Self::Unknown { .. } => BackendErrorKind::Unknown,
        }
    }

    /// Maps a runner failure for `operation` performed with `tool`.
    #[must_use]
    pub fn from_command(tool: &str, operation: &str, err: CommandError) -> Self {
        match err {
            CommandError::Spawn {
                message,
                not_found: true,
                ..
            } => Self::ProviderUnavailable {
                provider: tool.to_owned(),
                message,
            },
            CommandError::Spawn { message, .. } => Self::Unknown {
                operation: operation.to_owned(),
                message,
            },
            CommandError::Timeout { seconds, .. } => Self::Timeout {
                operation: operation.to_owned(),
                seconds,
            },
        }
    }

    /// Maps a non-zero exit of `operation`, recognising resource exhaustion
    /// from the tool's stderr.
    #[must_use]
    pub fn from_failed_output(operation: &str, output: &CommandOutput) -> Self {
        let detail = failure_detail(output);
        let lowered = detail.to_ascii_lowercase();
        let exhausted = EXHAUSTION_MARKERS
            .iter()
            .any(|needle| lowered.contains(needle));
        if exhausted {
            Self::InsufficientHostResources { message: detail }
        } else {
            Self::Unknown {
                operation: operation.to_owned(),
                message: detail,
            }
        }
    }
}

fn failure_detail(output: &CommandOutput) -> String {
    let stderr = output.stderr.trim();
    let text = if stderr.is_empty() {
        output.stdout.trim()
    } else {
        stderr
    };
    let last_lines: Vec<&str> = text.lines().rev().take(5).collect();
    let code = output
        .code
        .map_or_else(|| String::from("signal"), |code| code.to_string());
    if last_lines.is_empty() {
        format!("exit status {code}")
    } else {
        let joined: Vec<&str> = last_lines.into_iter().rev().collect();
        format!("exit status {code}: {}", joined.join(" | "))
    }
}

/// Future returned by backend operations.
pub type BackendFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, BackendError>> + Send + 'a>>;

/// Operations a VM or container driver provides to the lifecycle.
///
/// Every operation may take minutes. Dropping a returned future must abort
/// the underlying work (the process-based drivers kill their children).
pub trait Backend: Send + Sync {
    /// Infrastructure type served by this backend.
    fn infra_type(&self) -> InfraType;

    /// Creates and boots the instance described by `plan`, binding the
    /// resolved `ports`.
    fn create<'a>(
        &'a self,
        plan: &'a InfrastructurePlan,
        ports: &'a [PortBinding],
    ) -> BackendFuture<'a, ConnectionDescriptor>;

    /// Describes how to reach a running instance. Must not change state.
    fn connect<'a>(&'a self, record: &'a InstanceRecord) -> BackendFuture<'a, ConnectionDescriptor>;

    /// Boots a stopped instance.
    fn start<'a>(&'a self, record: &'a InstanceRecord) -> BackendFuture<'a, ()>;

    /// Stops a running instance, forcibly when `force` is set.
    fn stop<'a>(&'a self, record: &'a InstanceRecord, force: bool) -> BackendFuture<'a, ()>;

    /// Destroys the instance and its backend-side resources.
    fn remove<'a>(&'a self, record: &'a InstanceRecord) -> BackendFuture<'a, ()>;

    /// Builds the interactive (or one-shot, with `command`) session command
    /// for a running instance.
    fn session(&self, record: &InstanceRecord, command: Option<&str>) -> Invocation;
}

/// Chooses the backend responsible for an infrastructure type.
pub trait BackendSelector: Send + Sync {
    /// Returns the backend serving `infra_type`.
    fn backend(&self, infra_type: InfraType) -> &dyn Backend;
}

/// A VM backend and a container backend.
#[derive(Clone, Debug)]
pub struct Backends<V, C> {
    /// Driver for virtual machines.
    pub vm: V,
    /// Driver for containers.
    pub container: C,
}

impl<V: Backend, C: Backend> BackendSelector for Backends<V, C> {
    fn backend(&self, infra_type: InfraType) -> &dyn Backend {
        match infra_type {
            InfraType::Vm => &self.vm,
            InfraType::Container => &self.container,
        }
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    fn failed(stderr: &str) -> CommandOutput {
        CommandOutput {
            code: Some(1),
            stdout: String::new(),
            stderr: stderr.to_owned(),
        }
    }

    #[rstest]
    #[case("Error: cannot allocate memory", BackendErrorKind::InsufficientHostResources)]
    #[case("write /var/lib: no space left on device", BackendErrorKind::InsufficientHostResources)]
    #[case("The box 'x' could not be found", BackendErrorKind::Unknown)]
    fn failed_output_is_classified(#[case] stderr: &str, #[case] kind: BackendErrorKind) {
        assert_eq!(BackendError::from_failed_output("create", &failed(stderr)).kind(), kind);
    }

    #[test]
    fn failure_detail_keeps_exit_code_and_tail() {
        let err = BackendError::from_failed_output("stop", &failed("line one\nline two"));
        assert_eq!(
            err.to_string(),
            "stop failed: exit status 1: line one | line two"
        );
    }

    #[test]
    fn missing_tool_is_provider_unavailable() {
        let err = BackendError::from_command(
            "podman",
            "create",
            CommandError::Spawn {
                program: String::from("podman"),
                message: String::from("No such file or directory"),
                not_found: true,
            },
        );
        assert_eq!(err.kind(), BackendErrorKind::ProviderUnavailable);
    }

    #[test]
    fn runner_timeout_is_backend_timeout() {
        let err = BackendError::from_command(
            "vagrant",
            "create",
            CommandError::Timeout {
                program: String::from("vagrant"),
                seconds: 30,
            },
        );
        assert_eq!(
            err,
            BackendError::Timeout {
                operation: String::from("create"),
                seconds: 30,
            }
        );
    }
}
