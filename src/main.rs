//! Binary entry point for the berth CLI.

use std::env;
use std::io::{self, Write};
use std::process;

use camino::Utf8PathBuf;
use clap::Parser;
use thiserror::Error;
use tracing_subscriber::EnvFilter;

use berth::backend::BackendSelector;
use berth::capacity::{FixedCapacity, HostCapacity, ProcMeminfo};
use berth::env_file::EnvFileError;
use berth::lifecycle::{Interrupt, Lifecycle, ProvisionStatus, UpAction, UpOptions, UpOutcome};
use berth::plan::{
    AmbientFiles, InstanceId, ValidationContext, ValidationErrors, Validated, resolve_id, validate,
};
use berth::process::{CommandError, attach};
use berth::provision::Provisioner;
use berth::{
    AnsibleProvisioner, Backends, BerthSettings, FileRegistry, InstanceRecord, LifecycleError,
    PodmanBackend, ProcessCommandRunner, RawConfig, RemoveOutcome, SettingsError, StopOutcome,
    VagrantBackend,
};

mod cli;

use cli::{Cli, Command};

const LOG_ENV: &str = "BERTH_LOG";

#[derive(Debug, Error)]
enum CliError {
    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),
    #[error(transparent)]
    Settings(#[from] SettingsError),
    #[error(transparent)]
    EnvFile(#[from] EnvFileError),
    #[error("project directory {path} is not usable: {message}")]
    Project { path: String, message: String },
    #[error("cannot open the session: {0}")]
    Session(#[from] CommandError),
}

impl CliError {
    fn kind(&self) -> &'static str {
        match self {
            Self::Lifecycle(err) => err.kind().as_str(),
            Self::Settings(_) | Self::EnvFile(_) | Self::Project { .. } => "CONFIG_INVALID",
            Self::Session(_) => "BACKEND_OPERATION_FAILED",
        }
    }

    const fn exit_code(&self) -> i32 {
        match self {
            Self::Lifecycle(err) => err.exit_code(),
            Self::Settings(_) | Self::EnvFile(_) | Self::Project { .. } => 2,
            Self::Session(_) => 1,
        }
    }

    fn suggestion(&self) -> Option<String> {
        match self {
            Self::Lifecycle(err) => err.suggestion(),
            Self::EnvFile(EnvFileError::NotFound { path }) => Some(format!(
                "create {path} declaring at least INFRA_TYPE=vm or INFRA_TYPE=container"
            )),
            Self::Project { .. } => Some(String::from("pass an existing directory with --project")),
            Self::Settings(_) | Self::EnvFile(_) | Self::Session(_) => None,
        }
    }
}

/// The project a command acts on.
struct Project {
    dir: Utf8PathBuf,
    env_path: Utf8PathBuf,
}

impl Project {
    fn context(&self) -> ValidationContext {
        ValidationContext::new(self.dir.clone())
    }

    /// Validates the full declarations. Warnings go to stderr.
    fn plan(&self) -> Result<Validated, CliError> {
        let raw = RawConfig::load(&self.env_path)?;
        let validated = validate(&raw, &self.context(), &AmbientFiles)
            .map_err(LifecycleError::ConfigInvalid)?;
        for warning in &validated.warnings {
            writeln!(io::stderr(), "warning: {warning}").ok();
        }
        Ok(validated)
    }

    /// Resolves only the identifier, so commands on an existing instance
    /// keep working when the declarations are missing or have since become
    /// invalid.
    fn id(&self) -> Result<InstanceId, CliError> {
        let raw = match RawConfig::load(&self.env_path) {
            Ok(raw) => raw,
            Err(EnvFileError::NotFound { .. }) => RawConfig::default(),
            Err(err) => return Err(err.into()),
        };
        resolve_id(&raw, &self.context())
            .map_err(|err| LifecycleError::ConfigInvalid(ValidationErrors(vec![err])).into())
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    let exit_code = match dispatch(cli).await {
        Ok(code) => code,
        Err(err) => {
            report_error(&err);
            err.exit_code()
        }
    };

    process::exit(exit_code);
}

fn init_tracing(verbose: bool) {
    let fallback = if verbose { "debug" } else { "warn" };
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new(fallback));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .with_target(false)
        .init();
}

async fn dispatch(cli: Cli) -> Result<i32, CliError> {
    let settings = BerthSettings::load_without_cli_args()?;
    settings.validate()?;
    let project = resolve_project(cli.project.as_deref(), &settings.env_file)?;
    let registry = FileRegistry::new(settings.registry_file()?, settings.lock_policy());
    let capacity: Box<dyn HostCapacity> = if settings.check_host_memory {
        Box::new(ProcMeminfo::default())
    } else {
        Box::new(FixedCapacity(None))
    };

    #[cfg(feature = "test-backdoors")]
    if let Some(mode) = env::var_os("BERTH_FAKE_BACKEND") {
        let (backends, provisioner) = backdoor::scripted(&mode.to_string_lossy());
        let lifecycle = Lifecycle::new(backends, provisioner, registry)
            .with_capacity(capacity)
            .with_port_range(settings.port_range()?)
            .with_interrupt(Interrupt::on_ctrl_c());
        return execute(&lifecycle, &project, cli.command).await;
    }

    let state_dir = settings.state_dir()?;
    let backends = Backends {
        vm: VagrantBackend::new(
            ProcessCommandRunner,
            settings.vagrant_bin.clone(),
            state_dir.join("machines"),
        ),
        container: PodmanBackend::new(ProcessCommandRunner, settings.podman_bin.clone()),
    };
    let provisioner = AnsibleProvisioner::new(
        ProcessCommandRunner,
        settings.ansible_playbook_bin.clone(),
        settings.podman_bin.clone(),
        state_dir.join("inventories"),
    );
    let lifecycle = Lifecycle::new(backends, provisioner, registry)
        .with_capacity(capacity)
        .with_port_range(settings.port_range()?)
        .with_interrupt(Interrupt::on_ctrl_c());
    execute(&lifecycle, &project, cli.command).await
}

fn resolve_project(flag: Option<&std::path::Path>, env_file: &str) -> Result<Project, CliError> {
    let raw_dir = match flag {
        Some(dir) => dir.to_path_buf(),
        None => env::current_dir().map_err(|err| CliError::Project {
            path: String::from("."),
            message: err.to_string(),
        })?,
    };
    let canonical = raw_dir.canonicalize().map_err(|err| CliError::Project {
        path: raw_dir.display().to_string(),
        message: err.to_string(),
    })?;
    let dir = Utf8PathBuf::from_path_buf(canonical).map_err(|path| CliError::Project {
        path: path.display().to_string(),
        message: String::from("path is not valid UTF-8"),
    })?;
    let env_path = dir.join(env_file);
    Ok(Project { dir, env_path })
}

async fn execute<S, P>(
    lifecycle: &Lifecycle<S, P, FileRegistry>,
    project: &Project,
    command: Command,
) -> Result<i32, CliError>
where
    S: BackendSelector,
    P: Provisioner,
{
    let mut stdout = io::stdout();
    match command {
        Command::Up(args) => {
            let validated = project.plan()?;
            let options = UpOptions {
                dry_run: args.dry_run,
                no_provision: args.no_provision,
            };
            let outcome = lifecycle.up(&validated.plan, options).await?;
            write_up(&mut stdout, &outcome);
        }
        Command::Ssh(args) => {
            let id = project.id()?;
            let session = lifecycle.ssh(&id, args.command.as_deref()).await?;
            return Ok(attach(&session.invocation).await?.unwrap_or(1));
        }
        Command::Stop(args) => {
            let id = project.id()?;
            let message = match lifecycle.stop(&id, args.force).await? {
                StopOutcome::Stopped => format!("stopped {id}"),
                StopOutcome::AlreadyStopped => format!("{id} is already stopped"),
            };
            writeln!(stdout, "{message}").ok();
        }
        Command::Start(args) => {
            let (id, validated) = if args.no_provision {
                (project.id()?, None)
            } else {
                let full = project.plan()?;
                (full.plan.id().clone(), Some(full))
            };
            let provisioning = validated
                .as_ref()
                .and_then(|valid| valid.plan.provisioning());
            let outcome = lifecycle.start(&id, provisioning).await?;
            let message = if outcome.already_running {
                format!("{id} is already running")
            } else {
                format!("started {id}")
            };
            writeln!(stdout, "{message}").ok();
            write_provisioning(&mut stdout, &outcome.provisioning);
        }
        Command::Rm(args) => {
            let id = project.id()?;
            let message = match lifecycle.rm(&id, args.force).await? {
                RemoveOutcome::Removed => format!("removed {id}"),
                RemoveOutcome::AlreadyAbsent => format!("no instance named {id}; nothing to remove"),
            };
            writeln!(stdout, "{message}").ok();
        }
        Command::Status => {
            let id = project.id()?;
            match lifecycle.status(&id)? {
                Some(record) => write_status(&mut stdout, &record),
                None => {
                    writeln!(stdout, "{id}: absent").ok();
                }
            }
        }
    }
    Ok(0)
}

fn write_up(mut target: impl Write, outcome: &UpOutcome) {
    let id = &outcome.id;
    let headline = match outcome.action {
        UpAction::Created => format!("created {id} ({})", outcome.state),
        UpAction::WouldCreate => format!("dry run: {id} can be created"),
        UpAction::AlreadyRunning => format!("{id} is already running"),
        UpAction::AlreadyStopped => {
            format!("{id} exists but is stopped; run `berth start` to boot it")
        }
    };
    writeln!(target, "{headline}").ok();
    for binding in &outcome.ports {
        writeln!(target, "  port {binding}").ok();
    }
    for difference in &outcome.drift {
        writeln!(io::stderr(), "warning: {difference} (not applied)").ok();
    }
    write_provisioning(&mut target, &outcome.provisioning);
}

fn write_provisioning(mut target: impl Write, status: &ProvisionStatus) {
    let line = match status {
        ProvisionStatus::NotRequested | ProvisionStatus::NotEntered => return,
        ProvisionStatus::Disabled => "provisioning skipped (--no-provision)",
        ProvisionStatus::AlreadyProvisioned => "already provisioned",
        ProvisionStatus::Completed { output } => {
            tracing::debug!(%output, "provisioning output");
            "provisioned"
        }
    };
    writeln!(target, "{line}").ok();
}

fn write_status(mut target: impl Write, record: &InstanceRecord) {
    let resources = &record.resources;
    let disk = resources
        .disk_gb
        .map(|size| format!(", {size} GiB disk"))
        .unwrap_or_default();
    let lines = [
        format!("{}: {}", record.id, record.state),
        format!("  type        {}", record.infra_type),
        format!("  project     {}", record.project_path),
        format!(
            "  resources   {} MiB, {} cpu(s){disk}",
            resources.memory_mb, resources.cpu_cores
        ),
        format!("  provisioned {}", if record.provisioned { "yes" } else { "no" }),
    ];
    for line in lines {
        writeln!(target, "{line}").ok();
    }
    for binding in &record.networking.ports {
        writeln!(target, "  port        {binding}").ok();
    }
}

fn report_error(err: &CliError) {
    write_error(io::stderr(), err);
}

fn write_error(mut target: impl Write, err: &CliError) {
    writeln!(target, "error[{}]: {err}", err.kind()).ok();
    if let Some(next) = err.suggestion() {
        writeln!(target, "  → {next}").ok();
    }
}

#[cfg(feature = "test-backdoors")]
mod backdoor {
    //! Scripted collaborators selected with `BERTH_FAKE_BACKEND`, so the
    //! binary can be exercised without Vagrant, Podman or Ansible.

    use berth::backend::{BackendError, Backends};
    use berth::plan::InfraType;
    use berth::provision::ProvisionError;
    use berth::test_support::{BackendOp, ScriptedBackend, ScriptedProvisioner};

    pub(super) fn scripted(
        mode: &str,
    ) -> (Backends<ScriptedBackend, ScriptedBackend>, ScriptedProvisioner) {
        let backends = Backends {
            vm: ScriptedBackend::new(InfraType::Vm),
            container: ScriptedBackend::new(InfraType::Container),
        };
        let provisioner = ScriptedProvisioner::new();
        match mode {
            "provider-missing" => {
                for backend in [&backends.vm, &backends.container] {
                    backend.fail_next(
                        BackendOp::Create,
                        BackendError::ProviderUnavailable {
                            provider: String::from("scripted"),
                            message: String::from("not installed"),
                        },
                    );
                }
            }
            "provision-fails" => provisioner.fail_next(ProvisionError::Failed {
                code: Some(2),
                output: String::from("TASK [fail] fatal"),
            }),
            _ => {}
        }
        (backends, provisioner)
    }
}
