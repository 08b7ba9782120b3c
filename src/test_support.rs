//! Test support utilities shared across unit and integration tests.
//!
//! The scripted doubles here stand in for external tools so lifecycle
//! behaviour can be exercised without Vagrant, Podman or Ansible. The
//! binary also uses [`ScriptedBackend`] when built with the
//! `test-backdoors` feature.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::env;
use std::ffi::OsString;
use std::sync::{Arc, Mutex as StdMutex, MutexGuard as StdMutexGuard, PoisonError};
use std::time::Duration;

use camino::Utf8PathBuf;
use chrono::{DateTime, TimeZone, Utc};
use tokio::sync::{Mutex, MutexGuard};

use crate::backend::{
    Backend, BackendError, BackendFuture, ConnectionDescriptor, ConnectionTarget,
};
use crate::conflict::DEFAULT_AUTO_PORT_START;
use crate::env_file::RawConfig;
use crate::plan::{
    HostPort, InfraType, InfrastructurePlan, InstanceId, Provisioning, ValidationContext,
    ValidationErrors, validate,
};
use crate::process::{CommandError, CommandOutput, CommandRunner, Invocation, RunFuture};
use crate::provision::{ProvisionError, ProvisionFuture, ProvisionReport, Provisioner};
use crate::record::{InstanceRecord, InstanceState, PortBinding};

fn locked<T>(mutex: &StdMutex<T>) -> StdMutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Scripted command runner that returns pre-seeded outcomes in FIFO order.
///
/// Used to drive deterministic command outcomes without spawning processes.
#[derive(Clone, Debug, Default)]
pub struct ScriptedRunner {
    responses: Arc<StdMutex<VecDeque<Option<Result<CommandOutput, CommandError>>>>>,
    invocations: Arc<StdMutex<Vec<Invocation>>>,
}

impl ScriptedRunner {
    /// Creates a new runner with no queued responses.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a snapshot of all invocations recorded so far.
    #[must_use]
    pub fn invocations(&self) -> Vec<Invocation> {
        locked(&self.invocations).clone()
    }

    /// Pushes a successful exit status.
    pub fn push_success(&self) {
        self.push_output(Some(0), "", "");
    }

    /// Pushes a failing exit code with stderr text.
    pub fn push_failure(&self, code: i32) {
        self.push_output(Some(code), "", "simulated failure");
    }

    /// Pushes an explicit command output response.
    pub fn push_output(
        &self,
        code: Option<i32>,
        stdout: impl Into<String>,
        stderr: impl Into<String>,
    ) {
        locked(&self.responses).push_back(Some(Ok(CommandOutput {
            code,
            stdout: stdout.into(),
            stderr: stderr.into(),
        })));
    }

    /// Pushes a spawn failure, optionally flagged as "program not found".
    pub fn push_spawn_error(&self, not_found: bool) {
        locked(&self.responses).push_back(Some(Err(CommandError::Spawn {
            program: String::from("scripted"),
            message: String::from("No such file or directory"),
            not_found,
        })));
    }

    /// Pushes a timeout failure.
    pub fn push_timeout(&self, seconds: u64) {
        locked(&self.responses).push_back(Some(Err(CommandError::Timeout {
            program: String::from("scripted"),
            seconds,
        })));
    }

    /// Makes the next command run until its future is dropped.
    pub fn push_hang(&self) {
        locked(&self.responses).push_back(None);
    }
}

impl CommandRunner for ScriptedRunner {
    fn run<'a>(&'a self, invocation: &'a Invocation) -> RunFuture<'a> {
        locked(&self.invocations).push(invocation.clone());
        let next = locked(&self.responses).pop_front();
        Box::pin(async move {
            match next {
                Some(Some(response)) => response,
                Some(None) => std::future::pending().await,
                None => Err(CommandError::Spawn {
                    program: invocation.program.clone(),
                    message: String::from("no scripted response available"),
                    not_found: false,
                }),
            }
        })
    }
}

/// Backend operation observed by [`ScriptedBackend`].
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum BackendOp {
    /// [`Backend::create`].
    Create,
    /// [`Backend::connect`].
    Connect,
    /// [`Backend::start`].
    Start,
    /// [`Backend::stop`].
    Stop,
    /// [`Backend::remove`].
    Remove,
}

/// One recorded backend call.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct BackendCall {
    /// Operation invoked.
    pub op: BackendOp,
    /// Instance the operation targeted.
    pub id: InstanceId,
    /// `force` flag for stops; `false` otherwise.
    pub force: bool,
}

#[derive(Debug, Default)]
struct BackendScript {
    calls: Vec<BackendCall>,
    failures: BTreeMap<BackendOp, VecDeque<BackendError>>,
    hangs: BTreeSet<BackendOp>,
}

/// In-memory backend that records calls and replays scripted failures.
///
/// Every operation succeeds unless a failure was queued with
/// [`ScriptedBackend::fail_next`] or the next call was told to hang with
/// [`ScriptedBackend::hang_next`].
#[derive(Clone, Debug)]
pub struct ScriptedBackend {
    infra_type: InfraType,
    script: Arc<StdMutex<BackendScript>>,
}

impl ScriptedBackend {
    /// Creates a backend serving `infra_type`.
    #[must_use]
    pub fn new(infra_type: InfraType) -> Self {
        Self {
            infra_type,
            script: Arc::default(),
        }
    }

    /// Makes the next call of `op` fail with `err`.
    pub fn fail_next(&self, op: BackendOp, err: BackendError) {
        locked(&self.script)
            .failures
            .entry(op)
            .or_default()
            .push_back(err);
    }

    /// Makes the next call of `op` wait forever, until its future is
    /// dropped.
    pub fn hang_next(&self, op: BackendOp) {
        locked(&self.script).hangs.insert(op);
    }

    /// Returns every call recorded so far.
    #[must_use]
    pub fn calls(&self) -> Vec<BackendCall> {
        locked(&self.script).calls.clone()
    }

    /// Counts the calls of `op`.
    #[must_use]
    pub fn count(&self, op: BackendOp) -> usize {
        locked(&self.script)
            .calls
            .iter()
            .filter(|call| call.op == op)
            .count()
    }

    fn descriptor(&self, id: &InstanceId) -> ConnectionDescriptor {
        match self.infra_type {
            InfraType::Vm => ConnectionDescriptor {
                host: String::from("127.0.0.1"),
                port: 2222,
                user: String::from("vagrant"),
                key_path: None,
                target: ConnectionTarget::Ssh,
            },
            InfraType::Container => ConnectionDescriptor {
                host: id.as_str().to_owned(),
                port: 0,
                user: String::from("root"),
                key_path: None,
                target: ConnectionTarget::Container {
                    name: id.as_str().to_owned(),
                },
            },
        }
    }

    fn perform<'a, T: Send + 'a>(
        &'a self,
        op: BackendOp,
        id: &InstanceId,
        force: bool,
        value: T,
    ) -> BackendFuture<'a, T> {
        let (failure, hang) = {
            let mut script = locked(&self.script);
            script.calls.push(BackendCall {
                op,
                id: id.clone(),
                force,
            });
            let failure = script.failures.get_mut(&op).and_then(VecDeque::pop_front);
            let hang = script.hangs.remove(&op);
            (failure, hang)
        };
        Box::pin(async move {
            if hang {
                std::future::pending::<()>().await;
            }
            failure.map_or(Ok(value), Err)
        })
    }
}

impl Backend for ScriptedBackend {
    fn infra_type(&self) -> InfraType {
        self.infra_type
    }

    fn create<'a>(
        &'a self,
        plan: &'a InfrastructurePlan,
        _ports: &'a [PortBinding],
    ) -> BackendFuture<'a, ConnectionDescriptor> {
        let descriptor = self.descriptor(plan.id());
        self.perform(BackendOp::Create, plan.id(), false, descriptor)
    }

    fn connect<'a>(&'a self, record: &'a InstanceRecord) -> BackendFuture<'a, ConnectionDescriptor> {
        let descriptor = self.descriptor(&record.id);
        self.perform(BackendOp::Connect, &record.id, false, descriptor)
    }

    fn start<'a>(&'a self, record: &'a InstanceRecord) -> BackendFuture<'a, ()> {
        self.perform(BackendOp::Start, &record.id, false, ())
    }

    fn stop<'a>(&'a self, record: &'a InstanceRecord, force: bool) -> BackendFuture<'a, ()> {
        self.perform(BackendOp::Stop, &record.id, force, ())
    }

    fn remove<'a>(&'a self, record: &'a InstanceRecord) -> BackendFuture<'a, ()> {
        self.perform(BackendOp::Remove, &record.id, false, ())
    }

    fn session(&self, record: &InstanceRecord, command: Option<&str>) -> Invocation {
        let session = Invocation::new("echo").args(["session", record.id.as_str()]);
        match command {
            Some(line) => session.arg(line),
            None => session,
        }
    }
}

#[derive(Debug, Default)]
struct ProvisionScript {
    calls: Vec<(ConnectionDescriptor, Provisioning)>,
    failures: VecDeque<ProvisionError>,
    delay: Option<Duration>,
}

/// Provisioner double that records requests and replays scripted failures.
#[derive(Clone, Debug, Default)]
pub struct ScriptedProvisioner {
    script: Arc<StdMutex<ProvisionScript>>,
}

impl ScriptedProvisioner {
    /// Creates a provisioner that succeeds unless told otherwise.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next provisioning run fail with `err`.
    pub fn fail_next(&self, err: ProvisionError) {
        locked(&self.script).failures.push_back(err);
    }

    /// Makes every run take `delay` before it reports.
    pub fn delay_runs(&self, delay: Duration) {
        locked(&self.script).delay = Some(delay);
    }

    /// Returns every request recorded so far.
    #[must_use]
    pub fn calls(&self) -> Vec<(ConnectionDescriptor, Provisioning)> {
        locked(&self.script).calls.clone()
    }
}

impl Provisioner for ScriptedProvisioner {
    fn provision<'a>(
        &'a self,
        descriptor: &'a ConnectionDescriptor,
        request: &'a Provisioning,
    ) -> ProvisionFuture<'a> {
        let (failure, delay) = {
            let mut script = locked(&self.script);
            script.calls.push((descriptor.clone(), request.clone()));
            (script.failures.pop_front(), script.delay)
        };
        Box::pin(async move {
            if let Some(pause) = delay {
                tokio::time::sleep(pause).await;
            }
            failure.map_or_else(
                || {
                    Ok(ProvisionReport {
                        output: String::from("scripted provisioning"),
                    })
                },
                Err,
            )
        })
    }
}

/// Fixed timestamp used by record fixtures.
#[must_use]
pub fn fixed_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0)
        .single()
        .unwrap_or_default()
}

/// Validates `pairs` as the declarations of the project at `project`.
///
/// `site.yml` and `vars.yml` inside the project count as readable files so
/// provisioning declarations validate.
///
/// # Errors
///
/// Returns the validation errors when the declarations are invalid.
pub fn plan_from_pairs(
    project: &str,
    pairs: &[(&str, &str)],
) -> Result<InfrastructurePlan, ValidationErrors> {
    let root = Utf8PathBuf::from(project);
    let files: BTreeSet<Utf8PathBuf> = [root.join("site.yml"), root.join("vars.yml")]
        .into_iter()
        .collect();
    let raw = RawConfig::from_pairs(pairs.iter().copied());
    validate(&raw, &ValidationContext::new(root), &files).map(|validated| validated.plan)
}

/// Builds a record for `plan` in `state`.
///
/// Fixed host ports are kept and automatic ones are numbered upwards from
/// the start of the automatic range. Transient states carry a pending
/// operation whose previous state is the natural stable predecessor.
#[must_use]
pub fn record_for(plan: &InfrastructurePlan, state: InstanceState) -> InstanceRecord {
    let mut next_auto = DEFAULT_AUTO_PORT_START;
    let ports = plan
        .networking()
        .ports
        .iter()
        .map(|mapping| {
            let (host, auto) = match mapping.host {
                HostPort::Fixed(port) => (port, false),
                HostPort::Auto => {
                    let port = next_auto;
                    next_auto = next_auto.saturating_add(1);
                    (port, true)
                }
            };
            PortBinding {
                host,
                guest: mapping.guest,
                protocol: mapping.protocol,
                auto,
            }
        })
        .collect();

    let now = fixed_time();
    let mut record = InstanceRecord::creating(plan, ports, now);
    match state {
        InstanceState::Creating => {}
        InstanceState::Starting => {
            record.settle(InstanceState::Stopped, now);
            record.begin(state, now);
        }
        transient if transient.is_transient() => {
            record.settle(InstanceState::Running, now);
            record.begin(transient, now);
        }
        stable => record.settle(stable, now),
    }
    record
}

/// Global mutex used to serialise environment mutation in tests.
pub static ENV_LOCK: Mutex<()> = Mutex::const_new(());

/// Guard that holds the env mutex and cleans up variables on drop.
pub struct EnvGuard {
    previous: Vec<(String, Option<OsString>)>,
    _guard: MutexGuard<'static, ()>,
}

impl EnvGuard {
    /// Sets multiple environment variables while holding a global mutex.
    pub async fn set_vars(pairs: &[(&str, &str)]) -> Self {
        debug_assert!(
            {
                let mut seen = BTreeSet::new();
                pairs.iter().all(|(key, _)| seen.insert(*key))
            },
            "duplicate environment variable keys passed to EnvGuard::set_vars"
        );

        let guard = ENV_LOCK.lock().await;
        let mut previous = Vec::with_capacity(pairs.len());
        for (key, value) in pairs {
            let old = env::var_os(key);
            // SAFETY: Environment mutation is serialised by `ENV_LOCK`, preventing races.
            unsafe { env::set_var(key, value) };
            previous.push(((*key).to_owned(), old));
        }

        Self {
            previous,
            _guard: guard,
        }
    }
}

impl Drop for EnvGuard {
    fn drop(&mut self) {
        for (key, old) in &self.previous {
            // SAFETY: Environment mutation is serialised by holding `_guard`.
            unsafe {
                match old {
                    Some(val) => env::set_var(key, val),
                    None => env::remove_var(key),
                }
            }
        }
    }
}
