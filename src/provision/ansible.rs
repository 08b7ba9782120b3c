//! Ansible implementation of [`Provisioner`].

use std::io;
use std::time::Duration;

use camino::Utf8PathBuf;
use cap_std::{ambient_authority, fs_utf8::Dir};
use shell_escape::unix::escape;
use tracing::{info, warn};
use uuid::Uuid;

use super::{ProvisionError, ProvisionFuture, ProvisionReport, Provisioner};
use crate::backend::{ConnectionDescriptor, ConnectionTarget};
use crate::plan::Provisioning;
use crate::process::{CommandError, CommandRunner, Invocation};

const PLAYBOOK_TIMEOUT: Duration = Duration::from_secs(60 * 60);
const PREPARE_TIMEOUT: Duration = Duration::from_secs(10 * 60);
const INVENTORY_GROUP: &str = "berth";
const CONTAINER_PYTHON_BOOTSTRAP: &str = "command -v python3 >/dev/null 2>&1 \
    || apk add --no-cache python3 \
    || (apt-get update && apt-get install -y python3) \
    || dnf install -y python3";
const OUTPUT_TAIL_LINES: usize = 20;

/// Runs `ansible-playbook` with a throwaway inventory.
#[derive(Clone, Debug)]
pub struct AnsibleProvisioner<R> {
    runner: R,
    playbook_bin: String,
    podman_bin: String,
    scratch_dir: Utf8PathBuf,
}

impl<R: CommandRunner> AnsibleProvisioner<R> {
    /// Creates a provisioner that writes inventories under `scratch_dir`.
    #[must_use]
    pub fn new(
        runner: R,
        playbook_bin: impl Into<String>,
        podman_bin: impl Into<String>,
        scratch_dir: impl Into<Utf8PathBuf>,
    ) -> Self {
        Self {
            runner,
            playbook_bin: playbook_bin.into(),
            podman_bin: podman_bin.into(),
            scratch_dir: scratch_dir.into(),
        }
    }

    async fn prepare_container(&self, name: &str) {
        let invocation = Invocation::new(self.podman_bin.clone())
            .args(["exec", name, "sh", "-c", CONTAINER_PYTHON_BOOTSTRAP])
            .timeout(PREPARE_TIMEOUT);
        match self.runner.run(&invocation).await {
            Ok(output) if output.is_success() => {}
            Ok(output) => warn!(
                container = name,
                stderr = %output.stderr.trim(),
                "could not install python3 in the container; continuing"
            ),
            Err(err) => warn!(container = name, error = %err, "python3 bootstrap not run"),
        }
    }

    fn write_inventory(
        &self,
        descriptor: &ConnectionDescriptor,
    ) -> Result<InventoryFile, ProvisionError> {
        let file_name = format!("inventory-{}.ini", Uuid::new_v4().simple());
        let path = self.scratch_dir.join(&file_name);
        let failure = |err: io::Error| ProvisionError::Inventory {
            path: path.clone(),
            message: err.to_string(),
        };
        Dir::create_ambient_dir_all(&self.scratch_dir, ambient_authority()).map_err(failure)?;
        let dir = Dir::open_ambient_dir(&self.scratch_dir, ambient_authority()).map_err(failure)?;
        dir.write(&file_name, render_inventory(descriptor))
            .map_err(failure)?;
        Ok(InventoryFile { dir, file_name, path })
    }
}

/// Inventory on disk for the lifetime of one playbook run.
///
/// Removed on drop, so a cancelled provision leaves nothing behind.
struct InventoryFile {
    dir: Dir,
    file_name: String,
    path: Utf8PathBuf,
}

impl Drop for InventoryFile {
    fn drop(&mut self) {
        if let Err(err) = self.dir.remove_file(&self.file_name) {
            warn!(inventory = %self.path, error = %err, "temporary inventory not removed");
        }
    }
}

impl<R: CommandRunner> Provisioner for AnsibleProvisioner<R> {
    fn provision<'a>(
        &'a self,
        descriptor: &'a ConnectionDescriptor,
        request: &'a Provisioning,
    ) -> ProvisionFuture<'a> {
        Box::pin(async move {
            if request.auto_install
                && let ConnectionTarget::Container { name } = &descriptor.target
            {
                self.prepare_container(name).await;
            }

            let inventory = self.write_inventory(descriptor)?;
            let mut invocation = Invocation::new(self.playbook_bin.clone())
                .arg("-i")
                .arg(inventory.path.as_str())
                .arg(request.playbook_path.as_str())
                .timeout(PLAYBOOK_TIMEOUT);
            if let Some(vars) = &request.vars_path {
                invocation = invocation.arg("-e").arg(format!("@{vars}"));
            }

            info!(playbook = %request.playbook_path, "running playbook");
            let outcome = self.runner.run(&invocation).await;
            drop(inventory);

            let output = outcome.map_err(|err| match err {
                CommandError::Spawn { message, .. } => ProvisionError::ToolUnavailable {
                    tool: self.playbook_bin.clone(),
                    message,
                },
                CommandError::Timeout { seconds, .. } => ProvisionError::Timeout { seconds },
            })?;
            let combined = format!("{}{}", output.stdout, output.stderr);
            if output.is_success() {
                Ok(ProvisionReport { output: combined })
            } else {
                Err(ProvisionError::Failed {
                    code: output.code,
                    output: tail(&combined),
                })
            }
        })
    }
}

/// Renders a single-host INI inventory for `descriptor`.
#[must_use]
pub fn render_inventory(descriptor: &ConnectionDescriptor) -> String {
    let host_line = match &descriptor.target {
        ConnectionTarget::Container { name } => format!(
            "{name} ansible_connection=podman ansible_user={} ansible_remote_tmp=/tmp/ansible-tmp",
            descriptor.user
        ),
        ConnectionTarget::Ssh => {
            let mut line = format!(
                "{host} ansible_host={host} ansible_port={port} ansible_user={user}",
                host = descriptor.host,
                port = descriptor.port,
                user = descriptor.user
            );
            if let Some(key) = &descriptor.key_path {
                line.push_str(" ansible_ssh_private_key_file=");
                line.push_str(escape(key.as_str().into()).as_ref());
            }
            line.push_str(
                " ansible_ssh_common_args='-o StrictHostKeyChecking=no -o UserKnownHostsFile=/dev/null'",
            );
            line
        }
    };
    format!("[{INVENTORY_GROUP}]\n{host_line}\n")
}

fn tail(text: &str) -> String {
    let lines: Vec<&str> = text.lines().collect();
    let start = lines.len().saturating_sub(OUTPUT_TAIL_LINES);
    lines.get(start..).unwrap_or_default().join("\n")
}

#[cfg(test)]
mod tests {
    use rstest::{fixture, rstest};
    use tempfile::TempDir;

    use super::*;
    use crate::test_support::ScriptedRunner;

    fn ssh_descriptor() -> ConnectionDescriptor {
        ConnectionDescriptor {
            host: String::from("192.168.121.44"),
            port: 22,
            user: String::from("vagrant"),
            key_path: Some(Utf8PathBuf::from("/keys/my key")),
            target: ConnectionTarget::Ssh,
        }
    }

    fn container_descriptor() -> ConnectionDescriptor {
        ConnectionDescriptor {
            host: String::from("demo"),
            port: 0,
            user: String::from("root"),
            key_path: None,
            target: ConnectionTarget::Container {
                name: String::from("demo"),
            },
        }
    }

    fn request(auto_install: bool, vars: Option<&str>) -> Provisioning {
        Provisioning {
            playbook_path: Utf8PathBuf::from("/projects/demo/site.yml"),
            vars_path: vars.map(Utf8PathBuf::from),
            auto_install,
        }
    }

    struct Harness {
        _tmp: TempDir,
        scratch: Utf8PathBuf,
        runner: ScriptedRunner,
        provisioner: AnsibleProvisioner<ScriptedRunner>,
    }

    #[fixture]
    fn harness() -> Harness {
        let tmp = TempDir::new().expect("tempdir");
        let scratch = Utf8PathBuf::from_path_buf(tmp.path().join("scratch")).expect("utf8");
        let runner = ScriptedRunner::new();
        let provisioner =
            AnsibleProvisioner::new(runner.clone(), "ansible-playbook", "podman", scratch.clone());
        Harness {
            _tmp: tmp,
            scratch,
            runner,
            provisioner,
        }
    }

    #[test]
    fn ssh_inventory_quotes_key_and_disables_host_key_checks() {
        let text = render_inventory(&ssh_descriptor());

        assert!(text.starts_with("[berth]\n"));
        assert!(text.contains("ansible_host=192.168.121.44 ansible_port=22 ansible_user=vagrant"));
        assert!(text.contains("ansible_ssh_private_key_file='/keys/my key'"), "{text}");
        assert!(text.contains("StrictHostKeyChecking=no"));
    }

    #[test]
    fn container_inventory_uses_podman_connection() {
        let text = render_inventory(&container_descriptor());
        assert_eq!(
            text,
            "[berth]\ndemo ansible_connection=podman ansible_user=root ansible_remote_tmp=/tmp/ansible-tmp\n"
        );
    }

    #[rstest]
    #[tokio::test]
    async fn runs_playbook_with_vars_and_cleans_up(harness: Harness) {
        harness.runner.push_output(Some(0), "PLAY RECAP ok=3", "");

        let report = harness
            .provisioner
            .provision(&ssh_descriptor(), &request(false, Some("/projects/demo/vars.yml")))
            .await
            .expect("provisioned");

        assert!(report.output.contains("PLAY RECAP"));
        let calls = harness.runner.invocations();
        assert_eq!(calls.len(), 1);
        let command = calls.first().expect("one call").command_string();
        assert!(command.starts_with("ansible-playbook -i "), "{command}");
        assert!(command.ends_with("/projects/demo/site.yml -e @/projects/demo/vars.yml"));
        let leftovers = std::fs::read_dir(&harness.scratch).expect("scratch exists").count();
        assert_eq!(leftovers, 0, "inventory should be removed");
    }

    #[rstest]
    #[tokio::test]
    async fn auto_install_bootstraps_python_in_containers(harness: Harness) {
        harness.runner.push_success();
        harness.runner.push_success();

        harness
            .provisioner
            .provision(&container_descriptor(), &request(true, None))
            .await
            .expect("provisioned");

        let calls = harness.runner.invocations();
        let first = calls.first().expect("bootstrap call").command_string();
        assert!(first.starts_with("podman exec demo sh -c command -v python3"), "{first}");
        assert_eq!(calls.len(), 2);
    }

    #[rstest]
    #[tokio::test]
    async fn bootstrap_failure_does_not_block_the_playbook(harness: Harness) {
        harness.runner.push_failure(127);
        harness.runner.push_success();

        let result = harness
            .provisioner
            .provision(&container_descriptor(), &request(true, None))
            .await;

        assert!(result.is_ok(), "{result:?}");
    }

    #[rstest]
    #[tokio::test]
    async fn cancelled_run_removes_the_inventory(harness: Harness) {
        harness.runner.push_hang();

        let descriptor = ssh_descriptor();
        let req = request(false, None);
        let provision = harness.provisioner.provision(&descriptor, &req);
        let outcome = tokio::time::timeout(Duration::from_millis(50), provision).await;

        assert!(outcome.is_err(), "the playbook run should still be pending");
        assert_eq!(harness.runner.invocations().len(), 1);
        let leftovers = std::fs::read_dir(&harness.scratch).expect("scratch exists").count();
        assert_eq!(leftovers, 0, "inventory should be removed on cancellation");
    }

    #[rstest]
    #[tokio::test]
    async fn failed_playbook_reports_exit_code(harness: Harness) {
        harness.runner.push_output(Some(2), "", "fatal: [demo]: UNREACHABLE!");

        let err = harness
            .provisioner
            .provision(&ssh_descriptor(), &request(false, None))
            .await
            .expect_err("should fail");

        assert_eq!(
            err,
            ProvisionError::Failed {
                code: Some(2),
                output: String::from("fatal: [demo]: UNREACHABLE!"),
            }
        );
    }

    #[rstest]
    #[tokio::test]
    async fn missing_ansible_is_tool_unavailable(harness: Harness) {
        harness.runner.push_spawn_error(true);

        let err = harness
            .provisioner
            .provision(&ssh_descriptor(), &request(false, None))
            .await
            .expect_err("should fail");

        assert!(matches!(err, ProvisionError::ToolUnavailable { .. }), "{err:?}");
    }

    #[test]
    fn tail_keeps_last_lines() {
        let text: String = (1..=30).map(|n| format!("line {n}\n")).collect();
        let kept = tail(&text);
        assert!(kept.starts_with("line 11"));
        assert!(kept.ends_with("line 30"));
    }
}
