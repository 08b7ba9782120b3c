//! Cross-project conflict detection and automatic host-port allocation.
//!
//! Both functions are pure: they read a [`RecordSet`] and report conflicts
//! as data. The lifecycle calls them inside the same registry transaction
//! that inserts the new record, so two concurrent `up` runs cannot both
//! claim a port.

use std::collections::BTreeSet;
use std::fmt;
use std::net::Ipv4Addr;

use camino::Utf8PathBuf;

use crate::plan::{HostPort, InfrastructurePlan, InstanceId, Protocol};
use crate::record::PortBinding;
use crate::registry::RecordSet;

/// Default first port handed out for `auto` mappings.
pub const DEFAULT_AUTO_PORT_START: u16 = 20000;
/// Default last port handed out for `auto` mappings.
pub const DEFAULT_AUTO_PORT_END: u16 = 29999;

/// A reason a plan cannot be created alongside the existing instances.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Conflict {
    /// Another project already owns the identifier.
    IdCollision {
        /// Contested identifier.
        id: InstanceId,
        /// Project that owns it.
        owner_path: Utf8PathBuf,
    },
    /// A fixed host port is already bound by another instance.
    Port {
        /// Contested host port.
        host_port: u16,
        /// Transport protocol.
        protocol: Protocol,
        /// Instance that owns it.
        owner: InstanceId,
    },
    /// The fixed IP address is already assigned to another instance.
    FixedIp {
        /// Contested address.
        ip: Ipv4Addr,
        /// Instance that owns it.
        owner: InstanceId,
    },
    /// No free host port remained for an `auto` mapping.
    PortRangeExhausted {
        /// Guest port that needed a host port.
        guest: u16,
        /// First port of the allocation range.
        start: u16,
        /// Last port of the allocation range.
        end: u16,
    },
}

impl fmt::Display for Conflict {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::IdCollision { id, owner_path } => {
                write!(formatter, "instance id {id} is already used by {owner_path}")
            }
            Self::Port {
                host_port,
                protocol,
                owner,
            } => write!(
                formatter,
                "host port {host_port}/{protocol} is already bound by {owner}"
            ),
            Self::FixedIp { ip, owner } => {
                write!(formatter, "ip address {ip} is already assigned to {owner}")
            }
            Self::PortRangeExhausted { guest, start, end } => write!(
                formatter,
                "no free host port in {start}-{end} for guest port {guest}"
            ),
        }
    }
}

/// Inclusive range of host ports used for `auto` mappings.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct PortRange {
    start: u16,
    end: u16,
}

impl PortRange {
    /// Builds a range, returning `None` when `start > end`.
    #[must_use]
    pub const fn new(start: u16, end: u16) -> Option<Self> {
        if start > end {
            None
        } else {
            Some(Self { start, end })
        }
    }

    /// First port in the range.
    #[must_use]
    pub const fn start(self) -> u16 {
        self.start
    }

    /// Last port in the range.
    #[must_use]
    pub const fn end(self) -> u16 {
        self.end
    }
}

impl Default for PortRange {
    fn default() -> Self {
        Self {
            start: DEFAULT_AUTO_PORT_START,
            end: DEFAULT_AUTO_PORT_END,
        }
    }
}

/// Checks `plan` against every other record.
///
/// Conflicts are reported in a stable order: identifier first, then fixed
/// ports in declaration order, then the fixed IP.
#[must_use]
pub fn check_conflicts(plan: &InfrastructurePlan, records: &RecordSet) -> Vec<Conflict> {
    let mut conflicts = Vec::new();

    if let Some(existing) = records.get(plan.id())
        && existing.project_path != plan.project_path()
    {
        conflicts.push(Conflict::IdCollision {
            id: plan.id().clone(),
            owner_path: existing.project_path.clone(),
        });
    }

    let port_owners = records.port_owners();
    for mapping in &plan.networking().ports {
        let HostPort::Fixed(host_port) = mapping.host else {
            continue;
        };
        if let Some(owner) = port_owners.get(&(host_port, mapping.protocol))
            && owner != plan.id()
        {
            conflicts.push(Conflict::Port {
                host_port,
                protocol: mapping.protocol,
                owner: owner.clone(),
            });
        }
    }

    if let Some(ip) = plan.networking().fixed_ip
        && let Some(owner) = records.ip_owners().get(&ip)
        && owner != plan.id()
    {
        conflicts.push(Conflict::FixedIp {
            ip,
            owner: owner.clone(),
        });
    }

    conflicts
}

/// Resolves every port mapping of `plan` to a concrete host port.
///
/// Fixed ports are kept as declared. Each `auto` mapping receives the
/// lowest port in `range` not bound by another instance and not already
/// used by this plan.
///
/// # Errors
///
/// Returns [`Conflict::PortRangeExhausted`] when the range has no free
/// port left for an `auto` mapping.
pub fn allocate_ports(
    plan: &InfrastructurePlan,
    records: &RecordSet,
    range: PortRange,
) -> Result<Vec<PortBinding>, Conflict> {
    let mut taken: BTreeSet<(u16, Protocol)> = records
        .port_owners()
        .into_iter()
        .filter(|(_, owner)| owner != plan.id())
        .map(|(key, _)| key)
        .collect();
    for mapping in &plan.networking().ports {
        if let HostPort::Fixed(port) = mapping.host {
            taken.insert((port, mapping.protocol));
        }
    }

    let mut bindings = Vec::with_capacity(plan.networking().ports.len());
    for mapping in &plan.networking().ports {
        let binding = match mapping.host {
            HostPort::Fixed(host) => PortBinding {
                host,
                guest: mapping.guest,
                protocol: mapping.protocol,
                auto: false,
            },
            HostPort::Auto => {
                let host = (range.start..=range.end)
                    .find(|port| !taken.contains(&(*port, mapping.protocol)))
                    .ok_or(Conflict::PortRangeExhausted {
                        guest: mapping.guest,
                        start: range.start,
                        end: range.end,
                    })?;
                taken.insert((host, mapping.protocol));
                PortBinding {
                    host,
                    guest: mapping.guest,
                    protocol: mapping.protocol,
                    auto: true,
                }
            }
        };
        bindings.push(binding);
    }
    Ok(bindings)
}
