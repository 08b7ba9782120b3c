//! Error types surfaced by lifecycle commands.

use std::fmt;

use camino::Utf8PathBuf;
use thiserror::Error;

use crate::backend::{BackendError, BackendErrorKind};
use crate::capacity::Overcommit;
use crate::conflict::Conflict;
use crate::plan::{InfraType, InstanceId, ValidationErrors};
use crate::provision::ProvisionError;
use crate::record::InstanceState;
use crate::registry::RegistryError;

/// Stable category of a [`LifecycleError`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ErrorKind {
    /// The declarations failed validation.
    ConfigInvalid,
    /// The plan collides with another project's instance.
    ConflictDetected,
    /// The host cannot fit the instance.
    InsufficientResources,
    /// The backend tool or provider is missing.
    ProviderUnavailable,
    /// A backend operation failed.
    BackendOperationFailed,
    /// The provisioning run failed.
    ProvisioningFailed,
    /// The registry document cannot be parsed.
    RegistryCorrupt,
    /// Another command is working on the same instance.
    ConcurrentOperationInProgress,
    /// The instance exists but is not running.
    NotRunning,
    /// No instance exists for the project.
    NotFound,
    /// An incompatible instance already exists.
    InstanceExists,
    /// The instance must be stopped first.
    StopRequired,
    /// The registry could not be read or written.
    Registry,
    /// The operation was interrupted.
    Interrupted,
}

impl ErrorKind {
    /// `SCREAMING_SNAKE_CASE` name used in user-facing output.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ConfigInvalid => "CONFIG_INVALID",
            Self::ConflictDetected => "CONFLICT_DETECTED",
            Self::InsufficientResources => "INSUFFICIENT_RESOURCES",
            Self::ProviderUnavailable => "PROVIDER_UNAVAILABLE",
            Self::BackendOperationFailed => "BACKEND_OPERATION_FAILED",
            Self::ProvisioningFailed => "PROVISIONING_FAILED",
            Self::RegistryCorrupt => "REGISTRY_CORRUPT",
            Self::ConcurrentOperationInProgress => "CONCURRENT_OPERATION_IN_PROGRESS",
            Self::NotRunning => "NOT_RUNNING",
            Self::NotFound => "NOT_FOUND",
            Self::InstanceExists => "INSTANCE_EXISTS",
            Self::StopRequired => "STOP_REQUIRED",
            Self::Registry => "REGISTRY",
            Self::Interrupted => "INTERRUPTED",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str(self.as_str())
    }
}

/// Errors raised by lifecycle commands.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum LifecycleError {
    /// Raised when the declarations are invalid; carries every field error.
    #[error("{}", render_validation(.0))]
    ConfigInvalid(ValidationErrors),
    /// Raised when the plan collides with other instances; carries every
    /// conflict found.
    #[error("{}", render_conflicts(.0))]
    ConflictDetected(Vec<Conflict>),
    /// Raised when the host cannot fit the instance.
    #[error("insufficient host resources: {message}")]
    InsufficientResources {
        /// What ran out.
        message: String,
    },
    /// Raised when the backend tool or provider cannot be used.
    #[error("{source}")]
    ProviderUnavailable {
        /// Backend failure.
        source: BackendError,
    },
    /// Raised when a backend operation fails.
    #[error("backend {operation} failed ({}): {source}", source.kind())]
    BackendOperationFailed {
        /// Lifecycle operation in progress.
        operation: &'static str,
        /// Backend failure.
        source: BackendError,
    },
    /// Raised when provisioning fails. The instance is left running.
    #[error("provisioning failed: {source}")]
    ProvisioningFailed {
        /// Provisioner failure.
        source: ProvisionError,
    },
    /// Raised when the registry document cannot be understood.
    #[error("registry {path} is corrupt: {message}")]
    RegistryCorrupt {
        /// Registry document.
        path: Utf8PathBuf,
        /// Parser or consistency error.
        message: String,
    },
    /// Raised when another command owns the instance.
    #[error("instance {id} is {state}; another command is working on it")]
    ConcurrentOperationInProgress {
        /// Contested instance.
        id: InstanceId,
        /// Transient state found in the registry.
        state: InstanceState,
    },
    /// Raised when a command needs a running instance.
    #[error("instance {id} is {state}, not running")]
    NotRunning {
        /// Instance in question.
        id: InstanceId,
        /// Its current state.
        state: InstanceState,
    },
    /// Raised when no instance exists for the project.
    #[error("no instance named {id} exists")]
    NotFound {
        /// Instance in question.
        id: InstanceId,
    },
    /// Raised when `up` meets an existing instance of another kind.
    #[error("instance {id} already exists as a {existing}, but the declarations ask for a {requested}")]
    InstanceExists {
        /// Instance in question.
        id: InstanceId,
        /// Kind of the existing instance.
        existing: InfraType,
        /// Kind requested by the declarations.
        requested: InfraType,
    },
    /// Raised when removing a running instance without force.
    #[error("instance {id} is running; stop it before removing")]
    StopRequired {
        /// Instance in question.
        id: InstanceId,
    },
    /// Raised when the registry cannot be read, written or locked.
    #[error(transparent)]
    Registry(RegistryError),
    /// Raised when the user interrupted a backend or provisioning call.
    #[error("{operation} of {id} was interrupted")]
    Interrupted {
        /// Instance in question.
        id: InstanceId,
        /// Operation that was cut short.
        operation: &'static str,
    },
}

impl LifecycleError {
    /// Maps a backend failure during `operation`.
    #[must_use]
    pub fn from_backend(operation: &'static str, source: BackendError) -> Self {
        match source.kind() {
            BackendErrorKind::ProviderUnavailable => Self::ProviderUnavailable { source },
            BackendErrorKind::InsufficientHostResources => Self::InsufficientResources {
                message: source.to_string(),
            },
            BackendErrorKind::Timeout | BackendErrorKind::NameInUse | BackendErrorKind::Unknown => {
                Self::BackendOperationFailed { operation, source }
            }
        }
    }

    pub(super) fn overcommit(found: Overcommit) -> Self {
        Self::InsufficientResources {
            message: format!(
                "{} MiB requested, but {} MiB of the host's {} MiB is already committed",
                found.requested_mb, found.committed_mb, found.total_mb
            ),
        }
    }

    /// Returns the stable category of the error.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::ConfigInvalid(_) => ErrorKind::ConfigInvalid,
            Self::ConflictDetected(_) => ErrorKind::ConflictDetected,
            Self::InsufficientResources { .. } => ErrorKind::InsufficientResources,
            Self::ProviderUnavailable { .. } => ErrorKind::ProviderUnavailable,
            Self::BackendOperationFailed { .. } => ErrorKind::BackendOperationFailed,
            Self::ProvisioningFailed { .. } => ErrorKind::ProvisioningFailed,
            Self::RegistryCorrupt { .. } => ErrorKind::RegistryCorrupt,
            Self::ConcurrentOperationInProgress { .. } => ErrorKind::ConcurrentOperationInProgress,
            Self::NotRunning { .. } => ErrorKind::NotRunning,
            Self::NotFound { .. } => ErrorKind::NotFound,
            Self::InstanceExists { .. } => ErrorKind::InstanceExists,
            Self::StopRequired { .. } => ErrorKind::StopRequired,
            Self::Registry(_) => ErrorKind::Registry,
            Self::Interrupted { .. } => ErrorKind::Interrupted,
        }
    }

    /// Process exit code for the error.
    #[must_use]
    pub const fn exit_code(&self) -> i32 {
        match self.kind() {
            ErrorKind::ConfigInvalid => 2,
            ErrorKind::InstanceExists => 3,
            ErrorKind::InsufficientResources => 4,
            ErrorKind::ProviderUnavailable => 5,
            ErrorKind::ConflictDetected => 6,
            ErrorKind::ProvisioningFailed => 7,
            ErrorKind::BackendOperationFailed
            | ErrorKind::RegistryCorrupt
            | ErrorKind::ConcurrentOperationInProgress
            | ErrorKind::NotRunning
            | ErrorKind::NotFound
            | ErrorKind::StopRequired
            | ErrorKind::Registry
            | ErrorKind::Interrupted => 1,
        }
    }

    /// Next step to offer the user, if there is an obvious one.
    #[must_use]
    pub fn suggestion(&self) -> Option<String> {
        let text = match self {
            Self::ConfigInvalid(_) => "fix the listed keys, then check with `berth up --dry-run`",
            Self::ConflictDetected(_) => {
                "change PORTS, IP_ADDRESS or INFRA_ID, or remove the other instance with `berth rm`"
            }
            Self::InsufficientResources { .. } => {
                "lower MEMORY or stop another instance with `berth stop`"
            }
            Self::ProviderUnavailable { .. } => "install the tool or choose another PROVIDER",
            Self::BackendOperationFailed {
                source: BackendError::NameInUse { tool, name },
                ..
            } => {
                return Some(format!(
                    "set INFRA_ID to another name, or remove the existing instance with `{tool} rm -f {name}` if it is not needed"
                ));
            }
            Self::BackendOperationFailed { .. } => "re-run the same command to retry",
            Self::ProvisioningFailed { .. } => {
                "the instance is still running; fix the playbook and run `berth up` to retry"
            }
            Self::RegistryCorrupt { path, .. } => {
                return Some(format!("inspect {path} and repair or move it aside"));
            }
            Self::ConcurrentOperationInProgress { .. } => {
                "wait for the other command to finish, then retry"
            }
            Self::NotRunning {
                state: InstanceState::Stopped,
                ..
            } => "run `berth start` first",
            Self::NotRunning { .. } => "wait for the instance to settle, then retry",
            Self::NotFound { .. } => "run `berth up` to create it",
            Self::InstanceExists { .. } => "run `berth rm` then `berth up` to recreate",
            Self::StopRequired { .. } => "run `berth stop` first, or `berth rm --force`",
            Self::Registry(_) | Self::Interrupted { .. } => return None,
        };
        Some(String::from(text))
    }
}

impl From<RegistryError> for LifecycleError {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::Corrupt { path, message } => Self::RegistryCorrupt { path, message },
            other => Self::Registry(other),
        }
    }
}

fn render_validation(errors: &ValidationErrors) -> String {
    let mut text = errors.to_string();
    for error in errors.errors() {
        text.push_str("\n  ");
        text.push_str(&error.to_string());
    }
    text
}

fn render_conflicts(conflicts: &[Conflict]) -> String {
    let mut text = format!("{} conflict(s) with existing instances", conflicts.len());
    for conflict in conflicts {
        text.push_str("\n  ");
        text.push_str(&conflict.to_string());
    }
    text
}
