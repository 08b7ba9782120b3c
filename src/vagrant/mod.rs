//! Virtual machine backend driven through the Vagrant CLI.
//!
//! Each instance gets its own machine directory (`<machines>/<id>/`) holding
//! the rendered Vagrantfile and Vagrant's `.vagrant` state, so instances
//! never share Vagrant environments.

use std::io;
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use cap_std::{ambient_authority, fs_utf8::Dir};
use tracing::{info, warn};

use crate::backend::{Backend, BackendError, BackendFuture, ConnectionDescriptor, ConnectionTarget};
use crate::plan::{InfraType, InfrastructurePlan, InstanceId};
use crate::process::{CommandOutput, CommandRunner, Invocation};
use crate::record::{InstanceRecord, PortBinding};

mod ssh_config;
mod vagrantfile;

const TOOL: &str = "vagrant";
const PROBE_TIMEOUT: Duration = Duration::from_secs(30);
const UP_TIMEOUT: Duration = Duration::from_secs(30 * 60);
const HALT_TIMEOUT: Duration = Duration::from_secs(5 * 60);
const DESTROY_TIMEOUT: Duration = Duration::from_secs(10 * 60);
const SSH_CONFIG_TIMEOUT: Duration = Duration::from_secs(60);

/// Vagrant-backed [`Backend`] for virtual machines.
#[derive(Clone, Debug)]
pub struct VagrantBackend<R> {
    runner: R,
    binary: String,
    machines_dir: Utf8PathBuf,
}

impl<R: CommandRunner> VagrantBackend<R> {
    /// Creates a backend that runs `binary` and keeps machine directories
    /// under `machines_dir`.
    #[must_use]
    pub fn new(runner: R, binary: impl Into<String>, machines_dir: impl Into<Utf8PathBuf>) -> Self {
        Self {
            runner,
            binary: binary.into(),
            machines_dir: machines_dir.into(),
        }
    }

    /// Machine directory for an instance.
    #[must_use]
    pub fn machine_dir(&self, id: &InstanceId) -> Utf8PathBuf {
        self.machines_dir.join(id.as_str())
    }

    fn invocation(&self, id: &InstanceId) -> Invocation {
        Invocation::new(self.binary.clone()).current_dir(self.machine_dir(id))
    }

    async fn probe(&self) -> Result<(), BackendError> {
        let invocation = Invocation::new(self.binary.clone())
            .arg("--version")
            .timeout(PROBE_TIMEOUT);
        let output = self
            .runner
            .run(&invocation)
            .await
            .map_err(|err| BackendError::from_command(TOOL, "probe", err))?;
        if output.is_success() {
            Ok(())
        } else {
            Err(BackendError::ProviderUnavailable {
                provider: String::from(TOOL),
                message: output.stderr.trim().to_owned(),
            })
        }
    }

    async fn checked(
        &self,
        operation: &str,
        invocation: Invocation,
    ) -> Result<CommandOutput, BackendError> {
        let output = self
            .runner
            .run(&invocation)
            .await
            .map_err(|err| BackendError::from_command(TOOL, operation, err))?;
        if output.is_success() {
            Ok(output)
        } else {
            Err(BackendError::from_failed_output(operation, &output))
        }
    }

    async fn describe(
        &self,
        id: &InstanceId,
        user_key: Option<&Utf8Path>,
    ) -> Result<ConnectionDescriptor, BackendError> {
        let invocation = self
            .invocation(id)
            .arg("ssh-config")
            .timeout(SSH_CONFIG_TIMEOUT);
        let output = self.checked("ssh-config", invocation).await?;
        let config = ssh_config::parse(&output.stdout).ok_or_else(|| BackendError::Unknown {
            operation: String::from("ssh-config"),
            message: String::from("vagrant ssh-config reported no HostName"),
        })?;

        Ok(ConnectionDescriptor {
            host: config.host,
            port: config.port,
            user: config.user.unwrap_or_else(|| String::from("vagrant")),
            key_path: user_key.map(Utf8Path::to_path_buf).or(config.identity_file),
            target: ConnectionTarget::Ssh,
        })
    }

    fn write_vagrantfile(
        &self,
        plan: &InfrastructurePlan,
        ports: &[PortBinding],
    ) -> Result<(), BackendError> {
        let dir = self.machine_dir(plan.id());
        let io_failure = |err: io::Error| BackendError::Unknown {
            operation: String::from("write Vagrantfile"),
            message: format!("{dir}: {err}"),
        };
        Dir::create_ambient_dir_all(&dir, ambient_authority()).map_err(io_failure)?;
        let handle = Dir::open_ambient_dir(&dir, ambient_authority()).map_err(io_failure)?;
        handle
            .write("Vagrantfile", vagrantfile::render(plan, ports))
            .map_err(io_failure)
    }

    fn discard_machine_dir(&self, id: &InstanceId) {
        let Ok(parent) = Dir::open_ambient_dir(&self.machines_dir, ambient_authority()) else {
            return;
        };
        match parent.remove_dir_all(id.as_str()) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => warn!(id = %id, error = %err, "machine directory not removed"),
        }
    }

    fn machine_dir_exists(&self, id: &InstanceId) -> bool {
        Dir::open_ambient_dir(&self.machines_dir, ambient_authority())
            .and_then(|parent| parent.try_exists(id.as_str()))
            .unwrap_or(false)
    }
}

impl<R: CommandRunner> Backend for VagrantBackend<R> {
    fn infra_type(&self) -> InfraType {
        InfraType::Vm
    }

    fn create<'a>(
        &'a self,
        plan: &'a InfrastructurePlan,
        ports: &'a [PortBinding],
    ) -> BackendFuture<'a, ConnectionDescriptor> {
        Box::pin(async move {
            self.probe().await?;
            self.write_vagrantfile(plan, ports)?;

            let provider = plan.provider().map_or("virtualbox", |chosen| chosen.as_str());
            info!(id = %plan.id(), provider, "creating virtual machine");
            let up = self
                .invocation(plan.id())
                .args(["up", "--provider", provider, "--no-provision"])
                .timeout(UP_TIMEOUT);
            self.checked("vagrant up", up).await?;

            self.describe(plan.id(), plan.ssh().key_path.as_deref()).await
        })
    }

    fn connect<'a>(&'a self, record: &'a InstanceRecord) -> BackendFuture<'a, ConnectionDescriptor> {
        Box::pin(async move {
            self.describe(&record.id, record.ssh.key_path.as_deref())
                .await
        })
    }

    fn start<'a>(&'a self, record: &'a InstanceRecord) -> BackendFuture<'a, ()> {
        Box::pin(async move {
            self.probe().await?;
            let mut up = self.invocation(&record.id).arg("up");
            if let Some(provider) = record.provider {
                up = up.args(["--provider", provider.as_str()]);
            }
            self.checked("vagrant up", up.arg("--no-provision").timeout(UP_TIMEOUT))
                .await?;
            Ok(())
        })
    }

    fn stop<'a>(&'a self, record: &'a InstanceRecord, force: bool) -> BackendFuture<'a, ()> {
        Box::pin(async move {
            let mut halt = self.invocation(&record.id).arg("halt");
            if force {
                halt = halt.arg("--force");
            }
            self.checked("vagrant halt", halt.timeout(HALT_TIMEOUT))
                .await?;
            Ok(())
        })
    }

    fn remove<'a>(&'a self, record: &'a InstanceRecord) -> BackendFuture<'a, ()> {
        Box::pin(async move {
            if !self.machine_dir_exists(&record.id) {
                warn!(id = %record.id, "machine directory already gone; nothing to destroy");
                return Ok(());
            }
            let destroy = self
                .invocation(&record.id)
                .args(["destroy", "--force"])
                .timeout(DESTROY_TIMEOUT);
            self.checked("vagrant destroy", destroy).await?;
            self.discard_machine_dir(&record.id);
            Ok(())
        })
    }

    fn session(&self, record: &InstanceRecord, command: Option<&str>) -> Invocation {
        let ssh = self.invocation(&record.id).arg("ssh");
        match command {
            Some(line) => ssh.args(["-c", line]),
            None => ssh,
        }
    }
}
