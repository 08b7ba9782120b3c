//! Typed infrastructure plans derived from project declarations.
//!
//! Raw declarations are untrusted. [`validate`] turns them into an
//! [`InfrastructurePlan`] or a complete list of [`FieldError`]s; nothing
//! downstream (registry, conflict detection, backends) ever sees the raw
//! key/value map. Plans are immutable once built: fields are private and
//! exposed through accessors only.

use std::fmt;
use std::net::Ipv4Addr;

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};
use thiserror::Error;

mod files;
mod ports;
mod units;
mod validate;

pub use files::{AmbientFiles, FileProbe};
pub use validate::{ValidationContext, Validated, resolve_id, validate};

/// Minimum memory an instance may request, in MiB.
pub const MIN_MEMORY_MB: u32 = 512;
/// Minimum number of CPU cores an instance may request.
pub const MIN_CPU_CORES: u32 = 1;
/// Minimum disk size for virtual machines, in GiB.
pub const MIN_DISK_GB: u32 = 5;

/// Kind of infrastructure backing a project.
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum InfraType {
    /// A full virtual machine managed by a hypervisor driver.
    Vm,
    /// A container managed by a container runtime.
    Container,
}

impl InfraType {
    /// Parses the declaration value (`vm` or `container`).
    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "vm" => Some(Self::Vm),
            "container" => Some(Self::Container),
            _ => None,
        }
    }

    /// Declaration spelling of the variant.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Vm => "vm",
            Self::Container => "container",
        }
    }
}

impl fmt::Display for InfraType {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str(self.as_str())
    }
}

/// Stable identifier of a project's instance; a valid host-name label.
#[derive(Clone, Debug, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
#[serde(transparent)]
pub struct InstanceId(String);

impl InstanceId {
    /// Longest identifier accepted, matching the DNS label limit.
    pub const MAX_LEN: usize = 63;

    /// Validates an explicitly declared identifier.
    ///
    /// # Errors
    ///
    /// Returns a description of the problem when `raw` is not a lowercase
    /// host-name label.
    pub fn parse(raw: &str) -> Result<Self, String> {
        let value = raw.trim();
        if value.is_empty() {
            return Err(String::from("must not be empty"));
        }
        if value.len() > Self::MAX_LEN {
            return Err(format!("must be at most {} characters", Self::MAX_LEN));
        }
        if !value
            .chars()
            .all(|ch| ch.is_ascii_lowercase() || ch.is_ascii_digit() || ch == '-')
        {
            return Err(format!(
                "'{value}' may only contain lowercase letters, digits and '-'"
            ));
        }
        if value.starts_with('-') || value.ends_with('-') {
            return Err(format!("'{value}' must not start or end with '-'"));
        }
        Ok(Self(value.to_owned()))
    }

    /// Derives an identifier from a project directory name by slugifying it.
    #[must_use]
    pub fn from_directory_name(name: &str) -> Option<Self> {
        let mut slug = slugify(name);
        slug.truncate(Self::MAX_LEN);
        Self::parse(slug.trim_end_matches('-')).ok()
    }

    /// Borrows the identifier text.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str(&self.0)
    }
}

fn slugify(value: &str) -> String {
    let mut slug = String::new();
    let mut last_dash = false;
    for ch in value.chars() {
        if ch.is_ascii_alphanumeric() {
            slug.push(ch.to_ascii_lowercase());
            last_dash = false;
        } else if !last_dash {
            slug.push('-');
            last_dash = true;
        }
    }
    slug.trim_matches('-').to_owned()
}

/// Compute resources requested for an instance.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct Resources {
    /// Memory in MiB.
    pub memory_mb: u32,
    /// Number of virtual CPU cores.
    pub cpu_cores: u32,
    /// Disk size in GiB; only virtual machines carry one.
    pub disk_gb: Option<u32>,
}

/// How the instance attaches to the host network.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkMode {
    /// Backend default networking (NAT or a private network).
    #[default]
    Default,
    /// Bridged onto the host's network.
    Bridge,
}

impl NetworkMode {
    /// Parses `bridge` or `default`.
    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "default" => Some(Self::Default),
            "bridge" => Some(Self::Bridge),
            _ => None,
        }
    }
}

/// Transport protocol of a forwarded port.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    /// TCP, the default.
    #[default]
    Tcp,
    /// UDP.
    Udp,
}

impl Protocol {
    /// Lowercase protocol name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Tcp => "tcp",
            Self::Udp => "udp",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str(self.as_str())
    }
}

/// Host side of a port mapping.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum HostPort {
    /// A fixed host port.
    Fixed(u16),
    /// A host port allocated from the configured range at creation time.
    Auto,
}

/// One forwarded port as declared.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct PortMapping {
    /// Host port or the auto marker.
    pub host: HostPort,
    /// Port inside the instance.
    pub guest: u16,
    /// Transport protocol.
    pub protocol: Protocol,
}

/// Declared networking for an instance.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Networking {
    /// Attachment mode.
    pub mode: NetworkMode,
    /// Optional fixed IPv4 address.
    pub fixed_ip: Option<Ipv4Addr>,
    /// Forwarded ports in declaration order.
    pub ports: Vec<PortMapping>,
}

/// Hypervisor provider for virtual machines.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Provider {
    /// Oracle VirtualBox.
    Virtualbox,
    /// libvirt / KVM.
    Libvirt,
    /// VMware Workstation or Fusion.
    VmwareDesktop,
    /// Microsoft Hyper-V.
    Hyperv,
    /// Parallels Desktop.
    Parallels,
    /// Plain QEMU.
    Qemu,
}

impl Provider {
    /// Every provider accepted in declarations.
    pub const ALL: [Self; 6] = [
        Self::Virtualbox,
        Self::Libvirt,
        Self::VmwareDesktop,
        Self::Hyperv,
        Self::Parallels,
        Self::Qemu,
    ];

    /// Parses a provider name as spelled in declarations.
    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        let wanted = raw.trim().to_ascii_lowercase();
        Self::ALL
            .into_iter()
            .find(|provider| provider.as_str() == wanted)
    }

    /// Provider name as understood by Vagrant.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Virtualbox => "virtualbox",
            Self::Libvirt => "libvirt",
            Self::VmwareDesktop => "vmware_desktop",
            Self::Hyperv => "hyperv",
            Self::Parallels => "parallels",
            Self::Qemu => "qemu",
        }
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str(self.as_str())
    }
}

/// Configuration-management run requested after the instance is up.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct Provisioning {
    /// Absolute path of the playbook.
    pub playbook_path: Utf8PathBuf,
    /// Optional absolute path of an extra variables file.
    pub vars_path: Option<Utf8PathBuf>,
    /// Whether missing provisioning prerequisites may be installed in the
    /// target automatically.
    pub auto_install: bool,
}

/// Login identity used to reach the instance.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct SshIdentity {
    /// Remote user name.
    pub user: String,
    /// Optional private key path.
    pub key_path: Option<Utf8PathBuf>,
}

/// A fully validated description of the desired infrastructure.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct InfrastructurePlan {
    id: InstanceId,
    infra_type: InfraType,
    project_path: Utf8PathBuf,
    resources: Resources,
    networking: Networking,
    provider: Option<Provider>,
    image: String,
    provisioning: Option<Provisioning>,
    ssh: SshIdentity,
}

impl InfrastructurePlan {
    /// Instance identifier.
    #[must_use]
    pub const fn id(&self) -> &InstanceId {
        &self.id
    }

    /// Infrastructure kind.
    #[must_use]
    pub const fn infra_type(&self) -> InfraType {
        self.infra_type
    }

    /// Canonical project directory owning the plan.
    #[must_use]
    pub fn project_path(&self) -> &Utf8Path {
        &self.project_path
    }

    /// Requested resources.
    #[must_use]
    pub const fn resources(&self) -> Resources {
        self.resources
    }

    /// Requested networking.
    #[must_use]
    pub const fn networking(&self) -> &Networking {
        &self.networking
    }

    /// Hypervisor provider; always present for virtual machines.
    #[must_use]
    pub const fn provider(&self) -> Option<Provider> {
        self.provider
    }

    /// Vagrant box for virtual machines or container image reference.
    #[must_use]
    pub fn image(&self) -> &str {
        &self.image
    }

    /// Provisioning request, if any.
    #[must_use]
    pub const fn provisioning(&self) -> Option<&Provisioning> {
        self.provisioning.as_ref()
    }

    /// Login identity.
    #[must_use]
    pub const fn ssh(&self) -> &SshIdentity {
        &self.ssh
    }
}

/// A single validation failure tied to a declaration key (or line).
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct FieldError {
    /// Declaration key, or `line N` for unparseable lines.
    pub field: String,
    /// What is wrong with it.
    pub message: String,
}

impl FieldError {
    pub(crate) fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for FieldError {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(formatter, "{}: {}", self.field, self.message)
    }
}

/// Every problem found in a set of declarations, in check order.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
#[error("configuration is invalid ({} problem(s))", .0.len())]
pub struct ValidationErrors(pub Vec<FieldError>);

impl ValidationErrors {
    /// Borrows the individual field errors.
    #[must_use]
    pub fn errors(&self) -> &[FieldError] {
        &self.0
    }
}
