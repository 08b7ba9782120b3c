//! Core library for the berth instance manager.
//!
//! A project declares one VM or container in a flat `.env` file. The crate
//! validates those declarations into a plan, checks it against every other
//! instance in a shared registry, and drives the matching backend (Vagrant
//! or Podman) through the `up → ssh → stop → rm` lifecycle, provisioning the
//! instance once with Ansible when asked.

pub mod backend;
pub mod capacity;
pub mod conflict;
pub mod env_file;
pub mod lifecycle;
pub mod plan;
pub mod podman;
pub mod process;
pub mod provision;
pub mod record;
pub mod registry;
pub mod settings;
pub mod test_support;
pub mod vagrant;

pub use backend::{
    Backend, BackendError, BackendSelector, Backends, ConnectionDescriptor, ConnectionTarget,
};
pub use env_file::{EnvFileError, RawConfig};
pub use lifecycle::{
    ErrorKind, Interrupt, Lifecycle, LifecycleError, ProvisionStatus, RemoveOutcome,
    StartOutcome, StopOutcome, UpAction, UpOptions, UpOutcome,
};
pub use plan::{InfraType, InfrastructurePlan, InstanceId, ValidationErrors, Validated};
pub use podman::PodmanBackend;
pub use process::{CommandRunner, ProcessCommandRunner};
pub use provision::{AnsibleProvisioner, Provisioner};
pub use record::{InstanceRecord, InstanceState};
pub use registry::{FileRegistry, MemoryRegistry, Registry, RegistryError};
pub use settings::{BerthSettings, SettingsError};
pub use vagrant::VagrantBackend;
