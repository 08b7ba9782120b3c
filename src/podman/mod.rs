//! Container backend driven through the Podman CLI.
//!
//! Containers are named after the instance id and kept alive with
//! `sleep infinity` so sessions and provisioning can attach with
//! `podman exec`.

use std::time::Duration;

use tracing::{info, warn};

use crate::backend::{Backend, BackendError, BackendFuture, ConnectionDescriptor, ConnectionTarget};
use crate::plan::{InfraType, InfrastructurePlan, InstanceId, NetworkMode};
use crate::process::{CommandOutput, CommandRunner, Invocation};
use crate::record::{InstanceRecord, PortBinding};

const TOOL: &str = "podman";
const PROBE_TIMEOUT: Duration = Duration::from_secs(30);
const RUN_TIMEOUT: Duration = Duration::from_secs(30 * 60);
const STOP_TIMEOUT: Duration = Duration::from_secs(2 * 60);
const REMOVE_TIMEOUT: Duration = Duration::from_secs(2 * 60);
const INSPECT_TIMEOUT: Duration = Duration::from_secs(30);
const ADDRESS_FORMAT: &str = "{{.NetworkSettings.IPAddress}}";

/// Podman-backed [`Backend`] for containers.
#[derive(Clone, Debug)]
pub struct PodmanBackend<R> {
    runner: R,
    binary: String,
}

impl<R: CommandRunner> PodmanBackend<R> {
    /// Creates a backend that runs `binary`.
    #[must_use]
    pub fn new(runner: R, binary: impl Into<String>) -> Self {
        Self {
            runner,
            binary: binary.into(),
        }
    }

    fn invocation(&self) -> Invocation {
        Invocation::new(self.binary.clone())
    }

    async fn probe(&self) -> Result<(), BackendError> {
        let invocation = self.invocation().arg("--version").timeout(PROBE_TIMEOUT);
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

    async fn describe(&self, id: &InstanceId, user: &str) -> Result<ConnectionDescriptor, BackendError> {
        let inspect = self
            .invocation()
            .args(["inspect", "-f", ADDRESS_FORMAT, id.as_str()])
            .timeout(INSPECT_TIMEOUT);
        let output = self.checked("podman inspect", inspect).await?;
        let address = output.stdout.trim();
        let host = if address.is_empty() {
            id.as_str().to_owned()
        } else {
            address.to_owned()
        };
        Ok(ConnectionDescriptor {
            host,
            port: 0,
            user: user.to_owned(),
            key_path: None,
            target: ConnectionTarget::Container {
                name: id.as_str().to_owned(),
            },
        })
    }

    /// Refuses to create over a container that already carries the name.
    async fn ensure_name_free(&self, id: &InstanceId) -> Result<(), BackendError> {
        let exists = self
            .invocation()
            .args(["container", "exists", id.as_str()])
            .timeout(PROBE_TIMEOUT);
        let output = self
            .runner
            .run(&exists)
            .await
            .map_err(|err| BackendError::from_command(TOOL, "podman container exists", err))?;
        match output.code {
            Some(0) => Err(name_in_use(id)),
            Some(1) => Ok(()),
            _ => Err(BackendError::from_failed_output("podman container exists", &output)),
        }
    }

    async fn discard_container(&self, id: &InstanceId) {
        let remove = self
            .invocation()
            .args(["rm", "-f", id.as_str()])
            .timeout(REMOVE_TIMEOUT);
        match self.runner.run(&remove).await {
            Ok(output) if output.is_success() => {}
            Ok(output) => warn!(id = %id, stderr = %output.stderr.trim(), "partial container not removed"),
            Err(err) => warn!(id = %id, error = %err, "partial container not removed"),
        }
    }
}

fn name_in_use(id: &InstanceId) -> BackendError {
    BackendError::NameInUse {
        tool: String::from(TOOL),
        name: id.as_str().to_owned(),
    }
}

/// Podman refuses a run whose name is taken; that container is not ours.
fn reports_name_clash(output: &CommandOutput) -> bool {
    output.stderr.contains("is already in use")
}

/// Builds the `podman run` invocation arguments for `plan`.
fn run_args(plan: &InfrastructurePlan, ports: &[PortBinding]) -> Vec<String> {
    let resources = plan.resources();
    let mut args = vec![
        String::from("run"),
        String::from("-d"),
        String::from("--name"),
        plan.id().as_str().to_owned(),
        String::from("--hostname"),
        plan.id().as_str().to_owned(),
        String::from("--memory"),
        format!("{}m", resources.memory_mb),
        String::from("--cpus"),
        resources.cpu_cores.to_string(),
    ];
    if plan.networking().mode == NetworkMode::Bridge {
        args.extend([String::from("--network"), String::from("bridge")]);
    }
    if let Some(ip) = plan.networking().fixed_ip {
        args.extend([String::from("--ip"), ip.to_string()]);
    }
    for binding in ports {
        args.extend([String::from("-p"), binding.to_string()]);
    }
    args.extend([
        plan.image().to_owned(),
        String::from("sleep"),
        String::from("infinity"),
    ]);
    args
}

impl<R: CommandRunner> Backend for PodmanBackend<R> {
    fn infra_type(&self) -> InfraType {
        InfraType::Container
    }

    fn create<'a>(
        &'a self,
        plan: &'a InfrastructurePlan,
        ports: &'a [PortBinding],
    ) -> BackendFuture<'a, ConnectionDescriptor> {
        Box::pin(async move {
            self.probe().await?;
            self.ensure_name_free(plan.id()).await?;
            info!(id = %plan.id(), image = plan.image(), "creating container");
            let run = self.invocation().args(run_args(plan, ports)).timeout(RUN_TIMEOUT);
            let output = match self.runner.run(&run).await {
                Ok(output) => output,
                Err(err) => {
                    self.discard_container(plan.id()).await;
                    return Err(BackendError::from_command(TOOL, "podman run", err));
                }
            };
            if output.is_success() {
                return self.describe(plan.id(), &plan.ssh().user).await;
            }
            if reports_name_clash(&output) {
                return Err(name_in_use(plan.id()));
            }
            self.discard_container(plan.id()).await;
            Err(BackendError::from_failed_output("podman run", &output))
        })
    }

    fn connect<'a>(&'a self, record: &'a InstanceRecord) -> BackendFuture<'a, ConnectionDescriptor> {
        Box::pin(async move { self.describe(&record.id, &record.ssh.user).await })
    }

    fn start<'a>(&'a self, record: &'a InstanceRecord) -> BackendFuture<'a, ()> {
        Box::pin(async move {
            self.probe().await?;
            let start = self
                .invocation()
                .args(["start", record.id.as_str()])
                .timeout(RUN_TIMEOUT);
            self.checked("podman start", start).await?;
            Ok(())
        })
    }

    fn stop<'a>(&'a self, record: &'a InstanceRecord, force: bool) -> BackendFuture<'a, ()> {
        Box::pin(async move {
            let mut stop = self.invocation().arg("stop");
            if force {
                stop = stop.args(["-t", "0"]);
            }
            self.checked("podman stop", stop.arg(record.id.as_str()).timeout(STOP_TIMEOUT))
                .await?;
            Ok(())
        })
    }

    fn remove<'a>(&'a self, record: &'a InstanceRecord) -> BackendFuture<'a, ()> {
        Box::pin(async move {
            let remove = self
                .invocation()
                .args(["rm", "-f", record.id.as_str()])
                .timeout(REMOVE_TIMEOUT);
            self.checked("podman rm", remove).await?;
            Ok(())
        })
    }

    fn session(&self, record: &InstanceRecord, command: Option<&str>) -> Invocation {
        let exec = self
            .invocation()
            .args(["exec", "-it", record.id.as_str(), "/bin/sh"]);
        match command {
            Some(line) => exec.args(["-c", line]),
            None => exec,
        }
    }
}

#[cfg(test)]
mod tests;
