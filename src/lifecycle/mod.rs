//! Lifecycle state machine driving `up`, `start`, `ssh`, `stop` and `rm`.
//!
//! Every command follows the same protocol: decide inside one registry
//! transaction (writing a transient state when the backend is about to be
//! called), release the registry, run the backend call while watching for
//! an interrupt, then settle the outcome in a second transaction. The
//! registry lock is never held across a backend or provisioning call.

use std::future::Future;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::backend::{BackendSelector, ConnectionDescriptor};
use crate::capacity::{FixedCapacity, HostCapacity, assess, committed_memory_mb};
use crate::conflict::{PortRange, allocate_ports, check_conflicts};
use crate::plan::{InfrastructurePlan, InstanceId, Provisioning};
use crate::process::Invocation;
use crate::provision::Provisioner;
use crate::record::{InstanceRecord, InstanceState, PortBinding};
use crate::registry::{RecordSet, Registry};

mod error;
mod interrupt;

pub use error::{ErrorKind, LifecycleError};
pub use interrupt::{Interrupt, InterruptTrigger};

/// Records left transient for longer than this belong to a dead process.
pub const DEFAULT_OPERATION_STALE_SECS: i64 = 60 * 60;

/// Flags accepted by [`Lifecycle::up`].
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct UpOptions {
    /// Validate and check conflicts without touching the registry or a
    /// backend.
    pub dry_run: bool,
    /// Skip the provisioning sub-flow.
    pub no_provision: bool,
}

/// What `up` did about the instance itself.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum UpAction {
    /// A new instance was created.
    Created,
    /// A dry run found nothing blocking creation.
    WouldCreate,
    /// The instance was already running; nothing was created.
    AlreadyRunning,
    /// The instance exists but is stopped; nothing was created.
    AlreadyStopped,
}

/// What happened to provisioning during `up` or `start`.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ProvisionStatus {
    /// The declarations request no provisioning.
    NotRequested,
    /// Provisioning was disabled for this run.
    Disabled,
    /// The instance was provisioned by an earlier run.
    AlreadyProvisioned,
    /// The sub-flow was not entered because the instance is not running.
    NotEntered,
    /// The playbook ran successfully during this run.
    Completed {
        /// Captured provisioning output.
        output: String,
    },
}

/// Result of [`Lifecycle::up`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct UpOutcome {
    /// Instance identifier.
    pub id: InstanceId,
    /// Action taken on the instance.
    pub action: UpAction,
    /// Resulting state (`Creating` for a dry run).
    pub state: InstanceState,
    /// Bound ports, including allocated `auto` ports.
    pub ports: Vec<PortBinding>,
    /// Provisioning outcome.
    pub provisioning: ProvisionStatus,
    /// Differences between the existing instance and the declarations.
    pub drift: Vec<String>,
}

/// Result of [`Lifecycle::start`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct StartOutcome {
    /// Whether the instance was already running.
    pub already_running: bool,
    /// Provisioning outcome.
    pub provisioning: ProvisionStatus,
}

/// Result of [`Lifecycle::stop`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum StopOutcome {
    /// The instance was stopped.
    Stopped,
    /// The instance was already stopped.
    AlreadyStopped,
}

/// Result of [`Lifecycle::rm`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RemoveOutcome {
    /// The instance was destroyed and forgotten.
    Removed,
    /// No instance existed.
    AlreadyAbsent,
}

/// A session ready to be attached to the terminal.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Session {
    /// How the instance was reached.
    pub descriptor: ConnectionDescriptor,
    /// Command that opens the session.
    pub invocation: Invocation,
}

enum Guarded<T> {
    Done(T),
    Interrupted,
}

enum UpDecision {
    Create(InstanceRecord),
    Existing(InstanceRecord),
}

enum StartDecision {
    Start(InstanceRecord),
    AlreadyRunning(InstanceRecord),
}

enum StopDecision {
    Stop(InstanceRecord),
    AlreadyStopped,
}

enum RemoveDecision {
    Remove {
        record: InstanceRecord,
        was_running: bool,
    },
    Absent,
}

/// Orchestrates commands against backends, the provisioner and the
/// registry.
pub struct Lifecycle<S, P, R> {
    backends: S,
    provisioner: P,
    registry: R,
    capacity: Box<dyn HostCapacity>,
    port_range: PortRange,
    interrupt: Interrupt,
    stale_after: chrono::Duration,
}

impl<S, P, R> Lifecycle<S, P, R>
where
    S: BackendSelector,
    P: Provisioner,
    R: Registry,
{
    /// Creates a lifecycle with no capacity check, the default port range
    /// and no interrupt source.
    #[must_use]
    pub fn new(backends: S, provisioner: P, registry: R) -> Self {
        Self {
            backends,
            provisioner,
            registry,
            capacity: Box::new(FixedCapacity(None)),
            port_range: PortRange::default(),
            interrupt: Interrupt::never(),
            stale_after: chrono::Duration::seconds(DEFAULT_OPERATION_STALE_SECS),
        }
    }

    /// Uses `capacity` for the over-commit check.
    #[must_use]
    pub fn with_capacity(mut self, capacity: Box<dyn HostCapacity>) -> Self {
        self.capacity = capacity;
        self
    }

    /// Allocates `auto` ports from `range`.
    #[must_use]
    pub const fn with_port_range(mut self, range: PortRange) -> Self {
        self.port_range = range;
        self
    }

    /// Watches `interrupt` during backend and provisioning calls.
    #[must_use]
    pub fn with_interrupt(mut self, interrupt: Interrupt) -> Self {
        self.interrupt = interrupt;
        self
    }

    /// Treats transient records older than `stale_after` as abandoned.
    #[must_use]
    pub const fn with_stale_after(mut self, stale_after: chrono::Duration) -> Self {
        self.stale_after = stale_after;
        self
    }

    /// Borrows the registry.
    #[must_use]
    pub const fn registry(&self) -> &R {
        &self.registry
    }

    /// Brings the project's instance up, creating it if absent.
    ///
    /// An existing running or stopped instance of the same kind is left
    /// alone. Provisioning runs once per instance lifetime unless disabled.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError`] for conflicts, capacity, concurrent use,
    /// backend or provisioning failures and registry problems.
    pub async fn up(
        &self,
        plan: &InfrastructurePlan,
        options: UpOptions,
    ) -> Result<UpOutcome, LifecycleError> {
        if options.dry_run {
            return self.dry_run(plan);
        }

        let now = Utc::now();
        let decision = self
            .registry
            .transact(|set| self.decide_up(plan, set, now))?;

        match decision {
            UpDecision::Existing(record) => {
                let drift = record.drift_from(plan);
                for difference in &drift {
                    warn!(id = %record.id, "{difference}");
                }
                let (action, provisioning) = if record.state == InstanceState::Running {
                    let status = if options.no_provision {
                        ProvisionStatus::Disabled
                    } else {
                        self.provision_if_needed(&record, plan.provisioning(), None)
                            .await?
                    };
                    (UpAction::AlreadyRunning, status)
                } else {
                    (UpAction::AlreadyStopped, ProvisionStatus::NotEntered)
                };
                info!(id = %record.id, state = %record.state, "instance already exists");
                Ok(UpOutcome {
                    id: record.id.clone(),
                    action,
                    state: record.state,
                    ports: record.networking.ports.clone(),
                    provisioning,
                    drift,
                })
            }
            UpDecision::Create(record) => {
                let descriptor = self.create(plan, &record).await?;
                let running = self.settle(&record, InstanceState::Running)?;
                let provisioning = if options.no_provision {
                    ProvisionStatus::Disabled
                } else {
                    self.provision_if_needed(&running, plan.provisioning(), Some(descriptor))
                        .await?
                };
                Ok(UpOutcome {
                    id: running.id.clone(),
                    action: UpAction::Created,
                    state: running.state,
                    ports: running.networking.ports,
                    provisioning,
                    drift: Vec::new(),
                })
            }
        }
    }

    fn dry_run(&self, plan: &InfrastructurePlan) -> Result<UpOutcome, LifecycleError> {
        let mut snapshot = self.registry.snapshot()?;
        let decision = self.decide_up(plan, &mut snapshot, Utc::now())?;
        let (action, record) = match decision {
            UpDecision::Create(record) => (UpAction::WouldCreate, record),
            UpDecision::Existing(record) if record.state == InstanceState::Running => {
                (UpAction::AlreadyRunning, record)
            }
            UpDecision::Existing(record) => (UpAction::AlreadyStopped, record),
        };
        let drift = if action == UpAction::WouldCreate {
            Vec::new()
        } else {
            record.drift_from(plan)
        };
        Ok(UpOutcome {
            id: record.id,
            action,
            state: record.state,
            ports: record.networking.ports,
            provisioning: ProvisionStatus::NotEntered,
            drift,
        })
    }

    fn decide_up(
        &self,
        plan: &InfrastructurePlan,
        set: &mut RecordSet,
        now: DateTime<Utc>,
    ) -> Result<UpDecision, LifecycleError> {
        self.recover_abandoned(set, plan.id(), now);

        let same_project = set
            .get(plan.id())
            .is_some_and(|record| record.project_path == plan.project_path());
        if !same_project {
            let conflicts = check_conflicts(plan, set);
            if !conflicts.is_empty() {
                return Err(LifecycleError::ConflictDetected(conflicts));
            }
        }

        if let Some(existing) = set.get(plan.id()) {
            if existing.state.is_transient() {
                return Err(LifecycleError::ConcurrentOperationInProgress {
                    id: existing.id.clone(),
                    state: existing.state,
                });
            }
            if existing.infra_type != plan.infra_type() {
                return Err(LifecycleError::InstanceExists {
                    id: existing.id.clone(),
                    existing: existing.infra_type,
                    requested: plan.infra_type(),
                });
            }
            return Ok(UpDecision::Existing(existing.clone()));
        }

        let committed = committed_memory_mb(set, plan.id());
        let requested_mb = u64::from(plan.resources().memory_mb);
        if let Some(found) = assess(self.capacity.as_ref(), committed, requested_mb) {
            return Err(LifecycleError::overcommit(found));
        }

        let ports = allocate_ports(plan, set, self.port_range)
            .map_err(|conflict| LifecycleError::ConflictDetected(vec![conflict]))?;
        let record = InstanceRecord::creating(plan, ports, now);
        set.insert(record.clone());
        debug!(id = %record.id, "recorded creating state");
        Ok(UpDecision::Create(record))
    }

    async fn create(
        &self,
        plan: &InfrastructurePlan,
        record: &InstanceRecord,
    ) -> Result<ConnectionDescriptor, LifecycleError> {
        let backend = self.backends.backend(plan.infra_type());
        info!(id = %record.id, infra_type = %plan.infra_type(), "creating instance");
        match self
            .guarded(backend.create(plan, &record.networking.ports))
            .await
        {
            Guarded::Done(Ok(descriptor)) => Ok(descriptor),
            Guarded::Done(Err(err)) => {
                warn!(id = %record.id, error = %err, "create failed; forgetting the instance");
                self.forget(&record.id)?;
                Err(LifecycleError::from_backend("create", err))
            }
            Guarded::Interrupted => {
                self.abort(record).await;
                if let Err(err) = backend.remove(record).await {
                    warn!(id = %record.id, error = %err, "cleanup after interrupted create failed");
                }
                self.forget(&record.id)?;
                Err(LifecycleError::Interrupted {
                    id: record.id.clone(),
                    operation: "create",
                })
            }
        }
    }

    /// Boots a stopped instance. A running instance is left alone.
    ///
    /// `provisioning` is the request from the current declarations, if
    /// any; it runs under the same once-per-instance rule as `up`.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::NotFound`] without a record, and
    /// [`LifecycleError`] for capacity, concurrent use, backend,
    /// provisioning and registry failures.
    pub async fn start(
        &self,
        id: &InstanceId,
        provisioning: Option<&Provisioning>,
    ) -> Result<StartOutcome, LifecycleError> {
        let now = Utc::now();
        let decision = self.registry.transact(|set| {
            self.recover_abandoned(set, id, now);
            let record = set
                .get(id)
                .cloned()
                .ok_or_else(|| LifecycleError::NotFound { id: id.clone() })?;
            match record.state {
                InstanceState::Running => Ok(StartDecision::AlreadyRunning(record)),
                InstanceState::Stopped => {
                    let committed = committed_memory_mb(set, id);
                    let requested_mb = u64::from(record.resources.memory_mb);
                    if let Some(found) = assess(self.capacity.as_ref(), committed, requested_mb) {
                        return Err(LifecycleError::overcommit(found));
                    }
                    let mut starting = record;
                    starting.begin(InstanceState::Starting, now);
                    set.insert(starting.clone());
                    Ok(StartDecision::Start(starting))
                }
                transient => Err(LifecycleError::ConcurrentOperationInProgress {
                    id: id.clone(),
                    state: transient,
                }),
            }
        })?;

        let (already_running, running) = match decision {
            StartDecision::AlreadyRunning(record) => (true, record),
            StartDecision::Start(record) => {
                let backend = self.backends.backend(record.infra_type);
                info!(id = %record.id, "starting instance");
                match self.guarded(backend.start(&record)).await {
                    Guarded::Done(Ok(())) => {}
                    Guarded::Done(Err(err)) => {
                        self.restore(&record)?;
                        return Err(LifecycleError::from_backend("start", err));
                    }
                    Guarded::Interrupted => {
                        let stopped = self.abort(&record).await;
                        self.settle_interrupted(&record, stopped)?;
                        return Err(interrupted(&record, "start"));
                    }
                }
                (false, self.settle(&record, InstanceState::Running)?)
            }
        };

        let provisioning = self.provision_if_needed(&running, provisioning, None).await?;
        Ok(StartOutcome {
            already_running,
            provisioning,
        })
    }

    /// Prepares a session on a running instance.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::NotFound`] without a record,
    /// [`LifecycleError::NotRunning`] unless it is running, and backend or
    /// registry failures.
    pub async fn ssh(
        &self,
        id: &InstanceId,
        command: Option<&str>,
    ) -> Result<Session, LifecycleError> {
        let record = self
            .registry
            .get(id)?
            .ok_or_else(|| LifecycleError::NotFound { id: id.clone() })?;
        if !record.state.is_up() {
            return Err(LifecycleError::NotRunning {
                id: record.id,
                state: record.state,
            });
        }

        let backend = self.backends.backend(record.infra_type);
        let descriptor = match self.guarded(backend.connect(&record)).await {
            Guarded::Done(outcome) => {
                outcome.map_err(|err| LifecycleError::from_backend("connect", err))?
            }
            Guarded::Interrupted => return Err(interrupted(&record, "connect")),
        };
        debug!(id = %record.id, host = %descriptor.host, "opening session");
        Ok(Session {
            invocation: backend.session(&record, command),
            descriptor,
        })
    }

    /// Stops a running instance. A stopped instance is left alone.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::NotFound`] without a record, and
    /// concurrent use, backend and registry failures.
    pub async fn stop(&self, id: &InstanceId, force: bool) -> Result<StopOutcome, LifecycleError> {
        let now = Utc::now();
        let decision = self.registry.transact(|set| {
            self.recover_abandoned(set, id, now);
            let record = set
                .get(id)
                .cloned()
                .ok_or_else(|| LifecycleError::NotFound { id: id.clone() })?;
            match record.state {
                InstanceState::Stopped => Ok(StopDecision::AlreadyStopped),
                InstanceState::Running => {
                    let mut stopping = record;
                    stopping.begin(InstanceState::Stopping, now);
                    set.insert(stopping.clone());
                    Ok(StopDecision::Stop(stopping))
                }
                transient => Err(LifecycleError::ConcurrentOperationInProgress {
                    id: id.clone(),
                    state: transient,
                }),
            }
        })?;

        let StopDecision::Stop(record) = decision else {
            info!(id = %id, "instance already stopped");
            return Ok(StopOutcome::AlreadyStopped);
        };

        let backend = self.backends.backend(record.infra_type);
        info!(id = %record.id, force, "stopping instance");
        match self.guarded(backend.stop(&record, force)).await {
            Guarded::Done(Ok(())) => {
                self.settle(&record, InstanceState::Stopped)?;
                Ok(StopOutcome::Stopped)
            }
            Guarded::Done(Err(err)) => {
                self.restore(&record)?;
                Err(LifecycleError::from_backend("stop", err))
            }
            Guarded::Interrupted => {
                let stopped = self.abort(&record).await;
                self.settle_interrupted(&record, stopped)?;
                Err(interrupted(&record, "stop"))
            }
        }
    }

    /// Destroys the instance and forgets it, clearing the provisioning
    /// marker. Removing an absent instance succeeds.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::StopRequired`] for a running instance
    /// without `force`, and concurrent use, backend and registry failures.
    pub async fn rm(&self, id: &InstanceId, force: bool) -> Result<RemoveOutcome, LifecycleError> {
        let now = Utc::now();
        let decision = self.registry.transact(|set| {
            self.recover_abandoned(set, id, now);
            let Some(record) = set.get(id).cloned() else {
                return Ok(RemoveDecision::Absent);
            };
            match record.state {
                InstanceState::Running if !force => {
                    Err(LifecycleError::StopRequired { id: id.clone() })
                }
                InstanceState::Running | InstanceState::Stopped => {
                    let was_running = record.state == InstanceState::Running;
                    let mut removing = record;
                    removing.begin(InstanceState::Removing, now);
                    set.insert(removing.clone());
                    Ok(RemoveDecision::Remove {
                        record: removing,
                        was_running,
                    })
                }
                transient => Err(LifecycleError::ConcurrentOperationInProgress {
                    id: id.clone(),
                    state: transient,
                }),
            }
        })?;

        let RemoveDecision::Remove {
            record,
            was_running,
        } = decision
        else {
            info!(id = %id, "no instance to remove");
            return Ok(RemoveOutcome::AlreadyAbsent);
        };

        let backend = self.backends.backend(record.infra_type);
        if was_running {
            match self.guarded(backend.stop(&record, true)).await {
                Guarded::Done(Ok(())) => {}
                Guarded::Done(Err(err)) => {
                    self.restore(&record)?;
                    return Err(LifecycleError::from_backend("stop", err));
                }
                Guarded::Interrupted => {
                    let stopped = self.abort(&record).await;
                    self.settle_interrupted(&record, stopped)?;
                    return Err(interrupted(&record, "remove"));
                }
            }
        }

        info!(id = %record.id, "removing instance");
        match self.guarded(backend.remove(&record)).await {
            Guarded::Done(Ok(())) => {
                self.forget(&record.id)?;
                Ok(RemoveOutcome::Removed)
            }
            Guarded::Done(Err(err)) => {
                self.restore(&record)?;
                Err(LifecycleError::from_backend("remove", err))
            }
            Guarded::Interrupted => {
                let stopped = self.abort(&record).await;
                self.settle_interrupted(&record, stopped)?;
                Err(interrupted(&record, "remove"))
            }
        }
    }

    /// Returns the project's record, if any. Never writes.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError`] when the registry cannot be read.
    pub fn status(&self, id: &InstanceId) -> Result<Option<InstanceRecord>, LifecycleError> {
        Ok(self.registry.get(id)?)
    }

    async fn provision_if_needed(
        &self,
        record: &InstanceRecord,
        request: Option<&Provisioning>,
        descriptor: Option<ConnectionDescriptor>,
    ) -> Result<ProvisionStatus, LifecycleError> {
        let Some(playbook) = request else {
            return Ok(ProvisionStatus::NotRequested);
        };
        if record.provisioned {
            debug!(id = %record.id, "already provisioned; skipping");
            return Ok(ProvisionStatus::AlreadyProvisioned);
        }

        let now = Utc::now();
        let claimed = self
            .registry
            .transact(|set| self.claim_provisioning(set, &record.id, now))?;
        let Some(claimed) = claimed else {
            debug!(id = %record.id, "provisioned meanwhile; skipping");
            return Ok(ProvisionStatus::AlreadyProvisioned);
        };

        let target = match descriptor {
            Some(known) => known,
            None => {
                let backend = self.backends.backend(claimed.infra_type);
                match self.guarded(backend.connect(&claimed)).await {
                    Guarded::Done(Ok(found)) => found,
                    Guarded::Done(Err(err)) => {
                        self.restore(&claimed)?;
                        return Err(LifecycleError::from_backend("connect", err));
                    }
                    Guarded::Interrupted => {
                        self.restore(&claimed)?;
                        return Err(interrupted(&claimed, "provisioning"));
                    }
                }
            }
        };

        info!(id = %claimed.id, playbook = %playbook.playbook_path, "provisioning instance");
        let report = match self
            .guarded(self.provisioner.provision(&target, playbook))
            .await
        {
            Guarded::Done(Ok(report)) => report,
            Guarded::Done(Err(source)) => {
                warn!(id = %claimed.id, error = %source, "provisioning failed; instance left running");
                self.restore(&claimed)?;
                return Err(LifecycleError::ProvisioningFailed { source });
            }
            Guarded::Interrupted => {
                self.restore(&claimed)?;
                return Err(interrupted(&claimed, "provisioning"));
            }
        };

        let finished = Utc::now();
        self.registry.upsert(&claimed.id, |current| {
            let mut marked = current.cloned().unwrap_or_else(|| claimed.clone());
            marked.settle(InstanceState::Running, finished);
            marked.provisioned = true;
            marked
        })?;
        Ok(ProvisionStatus::Completed {
            output: report.output,
        })
    }

    /// Moves a running, unprovisioned record into `Provisioning`. Returns
    /// `None` when another run already provisioned it.
    fn claim_provisioning(
        &self,
        set: &mut RecordSet,
        id: &InstanceId,
        now: DateTime<Utc>,
    ) -> Result<Option<InstanceRecord>, LifecycleError> {
        self.recover_abandoned(set, id, now);
        let current = set
            .get(id)
            .cloned()
            .ok_or_else(|| LifecycleError::NotFound { id: id.clone() })?;
        if current.provisioned {
            return Ok(None);
        }
        match current.state {
            InstanceState::Running => {
                let mut provisioning = current;
                provisioning.begin(InstanceState::Provisioning, now);
                set.insert(provisioning.clone());
                Ok(Some(provisioning))
            }
            InstanceState::Stopped => Err(LifecycleError::NotRunning {
                id: id.clone(),
                state: InstanceState::Stopped,
            }),
            transient => Err(LifecycleError::ConcurrentOperationInProgress {
                id: id.clone(),
                state: transient,
            }),
        }
    }

    async fn guarded<T>(&self, work: impl Future<Output = T>) -> Guarded<T> {
        tokio::select! {
            biased;
            () = self.interrupt.triggered() => Guarded::Interrupted,
            outcome = work => Guarded::Done(outcome),
        }
    }

    /// Best-effort forced stop after an interrupt. Returns `true` when the
    /// instance is known to be stopped.
    async fn abort(&self, record: &InstanceRecord) -> bool {
        warn!(id = %record.id, "interrupted; forcing the instance to stop");
        let backend = self.backends.backend(record.infra_type);
        match backend.stop(record, true).await {
            Ok(()) => true,
            Err(err) => {
                warn!(id = %record.id, error = %err, "forced stop after interrupt failed");
                false
            }
        }
    }

    /// Settles an interrupted operation on an existing instance. A forced
    /// stop that went through leaves it stopped whatever it was before.
    fn settle_interrupted(&self, record: &InstanceRecord, stopped: bool) -> Result<(), LifecycleError> {
        if stopped {
            self.settle(record, InstanceState::Stopped)?;
            Ok(())
        } else {
            self.restore(record)
        }
    }

    /// Writes the outcome of a successful operation.
    fn settle(
        &self,
        record: &InstanceRecord,
        state: InstanceState,
    ) -> Result<InstanceRecord, LifecycleError> {
        let now = Utc::now();
        Ok(self.registry.upsert(&record.id, |current| {
            let mut next = current.cloned().unwrap_or_else(|| record.clone());
            next.settle(state, now);
            next
        })?)
    }

    /// Returns the record to the stable state it held before the
    /// operation.
    fn restore(&self, record: &InstanceRecord) -> Result<(), LifecycleError> {
        match record.previous_state() {
            Some(previous) => {
                self.settle(record, previous)?;
            }
            None => self.forget(&record.id)?,
        }
        Ok(())
    }

    fn forget(&self, id: &InstanceId) -> Result<(), LifecycleError> {
        self.registry.remove(id)?;
        Ok(())
    }

    fn recover_abandoned(&self, set: &mut RecordSet, id: &InstanceId, now: DateTime<Utc>) {
        let Some(record) = set.get(id) else {
            return;
        };
        if !record.is_abandoned(now, self.stale_after) {
            return;
        }
        warn!(id = %id, state = %record.state, "recovering record abandoned mid-operation");
        match record.previous_state() {
            Some(previous) => {
                let mut recovered = record.clone();
                recovered.settle(previous, now);
                set.insert(recovered);
            }
            None => {
                set.remove(id);
            }
        }
    }
}

fn interrupted(record: &InstanceRecord, operation: &'static str) -> LifecycleError {
    LifecycleError::Interrupted {
        id: record.id.clone(),
        operation,
    }
}
