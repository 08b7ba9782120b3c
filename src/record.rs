//! Persisted instance records and their lifecycle states.

use std::fmt;
use std::net::Ipv4Addr;

use camino::Utf8PathBuf;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::plan::{
    HostPort, InfraType, InfrastructurePlan, InstanceId, NetworkMode, Protocol, Provider,
    Resources, SshIdentity,
};

/// Lifecycle state of a persisted instance.
///
/// `Creating`, `Starting`, `Provisioning`, `Stopping` and `Removing` are
/// transient: they are written before a backend or provisioning call and
/// replaced once it settles, so a second command against the same instance
/// can detect the operation in flight.
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceState {
    /// The backend is creating the instance.
    Creating,
    /// The backend is starting a stopped instance.
    Starting,
    /// The instance is up.
    Running,
    /// The instance is up and the playbook is running against it.
    Provisioning,
    /// The backend is stopping the instance.
    Stopping,
    /// The instance exists but is not running.
    Stopped,
    /// The backend is destroying the instance.
    Removing,
}

impl InstanceState {
    /// Returns `true` when the instance is booted, whatever else is under way.
    #[must_use]
    pub const fn is_up(self) -> bool {
        matches!(self, Self::Running | Self::Provisioning)
    }

    /// Returns `true` while a backend operation owns the record.
    #[must_use]
    pub const fn is_transient(self) -> bool {
        matches!(
            self,
            Self::Creating | Self::Starting | Self::Provisioning | Self::Stopping | Self::Removing
        )
    }

    /// Lowercase state name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Creating => "creating",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Provisioning => "provisioning",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
            Self::Removing => "removing",
        }
    }
}

impl fmt::Display for InstanceState {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str(self.as_str())
    }
}

/// A forwarded port with its host side resolved.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PortBinding {
    /// Host port bound on the machine running the instance.
    pub host: u16,
    /// Port inside the instance.
    pub guest: u16,
    /// Transport protocol.
    pub protocol: Protocol,
    /// Whether the host port was allocated automatically.
    #[serde(default)]
    pub auto: bool,
}

impl fmt::Display for PortBinding {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(formatter, "{}:{}/{}", self.host, self.guest, self.protocol)
    }
}

/// Networking as actually bound for a persisted instance.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordNetworking {
    /// Attachment mode.
    pub mode: NetworkMode,
    /// Fixed IPv4 address, if any.
    pub fixed_ip: Option<Ipv4Addr>,
    /// Bound ports.
    #[serde(default)]
    pub ports: Vec<PortBinding>,
}

/// Bookkeeping for a backend operation in flight.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingOperation {
    /// Stable state to return to if the operation does not complete;
    /// `None` means the record did not exist before.
    pub previous: Option<InstanceState>,
    /// When the operation began.
    pub started_at: DateTime<Utc>,
    /// Process that owns the operation.
    pub pid: u32,
}

/// Persisted state for one project's instance.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceRecord {
    /// Instance identifier; also the registry key.
    pub id: InstanceId,
    /// Kind of infrastructure.
    pub infra_type: InfraType,
    /// Current lifecycle state.
    pub state: InstanceState,
    /// Canonical project directory owning the instance.
    pub project_path: Utf8PathBuf,
    /// Resources the instance was created with.
    pub resources: Resources,
    /// Networking the instance was created with.
    pub networking: RecordNetworking,
    /// Hypervisor provider for virtual machines.
    #[serde(default)]
    pub provider: Option<Provider>,
    /// Box or image the instance was created from.
    pub image: String,
    /// Login identity.
    pub ssh: SshIdentity,
    /// Set only after a successful provisioning run.
    #[serde(default)]
    pub provisioned: bool,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last state change.
    pub updated_at: DateTime<Utc>,
    /// Operation in flight, present only in transient states.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pending: Option<PendingOperation>,
}

impl InstanceRecord {
    /// Builds the record written before the backend creates the instance.
    #[must_use]
    pub fn creating(plan: &InfrastructurePlan, ports: Vec<PortBinding>, now: DateTime<Utc>) -> Self {
        Self {
            id: plan.id().clone(),
            infra_type: plan.infra_type(),
            state: InstanceState::Creating,
            project_path: plan.project_path().to_path_buf(),
            resources: plan.resources(),
            networking: RecordNetworking {
                mode: plan.networking().mode,
                fixed_ip: plan.networking().fixed_ip,
                ports,
            },
            provider: plan.provider(),
            image: plan.image().to_owned(),
            ssh: plan.ssh().clone(),
            provisioned: false,
            created_at: now,
            updated_at: now,
            pending: Some(PendingOperation {
                previous: None,
                started_at: now,
                pid: std::process::id(),
            }),
        }
    }

    /// Moves a stable record into a transient state, remembering where it
    /// came from.
    pub fn begin(&mut self, transient: InstanceState, now: DateTime<Utc>) {
        self.pending = Some(PendingOperation {
            previous: Some(self.state),
            started_at: now,
            pid: std::process::id(),
        });
        self.state = transient;
        self.updated_at = now;
    }

    /// Records the outcome of an operation and clears the pending marker.
    pub fn settle(&mut self, state: InstanceState, now: DateTime<Utc>) {
        self.state = state;
        self.pending = None;
        self.updated_at = now;
    }

    /// State the record held before the pending operation started.
    ///
    /// `None` means the record should not exist once the operation is
    /// abandoned.
    #[must_use]
    pub const fn previous_state(&self) -> Option<InstanceState> {
        match &self.pending {
            Some(pending) => pending.previous,
            None if self.state.is_transient() => None,
            None => Some(self.state),
        }
    }

    /// Returns `true` when the record has been transient for longer than
    /// `stale_after`, which means the owning process died mid-operation.
    #[must_use]
    pub fn is_abandoned(&self, now: DateTime<Utc>, stale_after: chrono::Duration) -> bool {
        if !self.state.is_transient() {
            return false;
        }
        let started = self
            .pending
            .as_ref()
            .map_or(self.updated_at, |pending| pending.started_at);
        now.signed_duration_since(started) > stale_after
    }

    /// Differences between the recorded instance and a freshly validated
    /// plan for the same project. Drift is reported, never applied.
    #[must_use]
    pub fn drift_from(&self, plan: &InfrastructurePlan) -> Vec<String> {
        let mut drift = Vec::new();
        let wanted = plan.resources();
        if wanted.memory_mb != self.resources.memory_mb {
            drift.push(format!(
                "memory is {} MiB but the declaration asks for {} MiB",
                self.resources.memory_mb, wanted.memory_mb
            ));
        }
        if wanted.cpu_cores != self.resources.cpu_cores {
            drift.push(format!(
                "cpus is {} but the declaration asks for {}",
                self.resources.cpu_cores, wanted.cpu_cores
            ));
        }
        if wanted.disk_gb != self.resources.disk_gb {
            drift.push(String::from("disk size differs from the declaration"));
        }
        if plan.networking().mode != self.networking.mode
            || plan.networking().fixed_ip != self.networking.fixed_ip
        {
            drift.push(String::from("network settings differ from the declaration"));
        }
        if !self.ports_match(plan) {
            drift.push(String::from("forwarded ports differ from the declaration"));
        }
        drift
    }

    fn ports_match(&self, plan: &InfrastructurePlan) -> bool {
        let declared = &plan.networking().ports;
        declared.len() == self.networking.ports.len()
            && declared
                .iter()
                .zip(&self.networking.ports)
                .all(|(mapping, bound)| {
                    mapping.guest == bound.guest
                        && mapping.protocol == bound.protocol
                        && match mapping.host {
                            HostPort::Fixed(port) => !bound.auto && port == bound.host,
                            HostPort::Auto => bound.auto,
                        }
                })
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use camino::Utf8PathBuf;
    use chrono::{Duration, TimeZone};
    use rstest::{fixture, rstest};

    use super::*;
    use crate::env_file::RawConfig;
    use crate::plan::{ValidationContext, validate};

    fn plan_with(pairs: &[(&str, &str)]) -> InfrastructurePlan {
        let raw = RawConfig::from_pairs(pairs.iter().copied());
        let files: BTreeSet<Utf8PathBuf> = BTreeSet::new();
        validate(&raw, &ValidationContext::new("/projects/demo"), &files)
            .expect("valid plan")
            .plan
    }

    #[fixture]
    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0)
            .single()
            .expect("valid timestamp")
    }

    #[fixture]
    fn plan() -> InfrastructurePlan {
        plan_with(&[("INFRA_TYPE", "container"), ("PORTS", "8080:80,auto:443")])
    }

    fn bindings() -> Vec<PortBinding> {
        vec![
            PortBinding {
                host: 8080,
                guest: 80,
                protocol: Protocol::Tcp,
                auto: false,
            },
            PortBinding {
                host: 20000,
                guest: 443,
                protocol: Protocol::Tcp,
                auto: true,
            },
        ]
    }

    #[rstest]
    fn creating_record_has_no_previous_state(plan: InfrastructurePlan, now: DateTime<Utc>) {
        let record = InstanceRecord::creating(&plan, bindings(), now);

        assert_eq!(record.state, InstanceState::Creating);
        assert_eq!(record.previous_state(), None);
        assert!(!record.provisioned);
    }

    #[rstest]
    fn begin_and_settle_track_previous_state(plan: InfrastructurePlan, now: DateTime<Utc>) {
        let mut record = InstanceRecord::creating(&plan, bindings(), now);
        record.settle(InstanceState::Running, now);
        record.begin(InstanceState::Stopping, now);

        assert_eq!(record.previous_state(), Some(InstanceState::Running));

        record.settle(InstanceState::Stopped, now);
        assert_eq!(record.pending, None);
        assert_eq!(record.previous_state(), Some(InstanceState::Stopped));
    }

    #[rstest]
    fn abandonment_needs_a_transient_state(plan: InfrastructurePlan, now: DateTime<Utc>) {
        let mut record = InstanceRecord::creating(&plan, bindings(), now);
        let later = now + Duration::hours(2);

        assert!(record.is_abandoned(later, Duration::hours(1)));
        assert!(!record.is_abandoned(now, Duration::hours(1)));

        record.settle(InstanceState::Running, now);
        assert!(!record.is_abandoned(later, Duration::hours(1)));
    }

    #[rstest]
    fn matching_plan_has_no_drift(plan: InfrastructurePlan, now: DateTime<Utc>) {
        let record = InstanceRecord::creating(&plan, bindings(), now);
        assert!(record.drift_from(&plan).is_empty());
    }

    #[rstest]
    fn changed_resources_and_ports_are_drift(plan: InfrastructurePlan, now: DateTime<Utc>) {
        let record = InstanceRecord::creating(&plan, bindings(), now);
        let changed = plan_with(&[
            ("INFRA_TYPE", "container"),
            ("MEMORY", "4G"),
            ("PORTS", "8080:80"),
        ]);

        let drift = record.drift_from(&changed);

        assert_eq!(drift.len(), 2, "{drift:?}");
    }

    #[rstest]
    fn record_serialises_with_camel_case_keys(plan: InfrastructurePlan, now: DateTime<Utc>) {
        let record = InstanceRecord::creating(&plan, bindings(), now);
        let json = serde_json::to_value(&record).expect("serialise");

        assert_eq!(json["projectPath"], "/projects/demo");
        assert_eq!(json["infraType"], "container");
        assert_eq!(json["state"], "creating");

        let back: InstanceRecord = serde_json::from_value(json).expect("deserialise");
        assert_eq!(back, record);
    }
}
