//! Provisioning collaborator run once an instance is up.

use std::future::Future;
use std::pin::Pin;

use camino::Utf8PathBuf;
use thiserror::Error;

use crate::backend::ConnectionDescriptor;
use crate::plan::Provisioning;

mod ansible;

pub use ansible::{AnsibleProvisioner, render_inventory};

/// Outcome of a successful provisioning run.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ProvisionReport {
    /// Captured output of the provisioning tool.
    pub output: String,
}

/// Errors raised while provisioning an instance.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum ProvisionError {
    /// The provisioning tool is not installed.
    #[error("{tool} is unavailable: {message}")]
    ToolUnavailable {
        /// Tool that could not be run.
        tool: String,
        /// Operating system error string.
        message: String,
    },
    /// The playbook ran and reported failure.
    #[error("playbook failed with exit status {}: {output}", code.map_or_else(|| String::from("signal"), |value| value.to_string()))]
    Failed {
        /// Exit code, if the tool exited normally.
        code: Option<i32>,
        /// Tail of the captured output.
        output: String,
    },
    /// The playbook did not finish in time.
    #[error("provisioning timed out after {seconds}s")]
    Timeout {
        /// Limit that was exceeded.
        seconds: u64,
    },
    /// The temporary inventory could not be written.
    #[error("failed to write inventory {path}: {message}")]
    Inventory {
        /// Inventory path.
        path: Utf8PathBuf,
        /// Operating system error string.
        message: String,
    },
}

/// Future returned by [`Provisioner::provision`].
pub type ProvisionFuture<'a> =
    Pin<Box<dyn Future<Output = Result<ProvisionReport, ProvisionError>> + Send + 'a>>;

/// Runs a configuration-management playbook against an instance.
pub trait Provisioner: Send + Sync {
    /// Applies `request` to the instance reachable through `descriptor`.
    fn provision<'a>(
        &'a self,
        descriptor: &'a ConnectionDescriptor,
        request: &'a Provisioning,
    ) -> ProvisionFuture<'a>;
}
