//! Validation of raw declarations into an [`InfrastructurePlan`].

use std::net::Ipv4Addr;

use camino::{Utf8Path, Utf8PathBuf};

use super::{
    FieldError, FileProbe, InfraType, InfrastructurePlan, InstanceId, MIN_CPU_CORES, MIN_DISK_GB,
    MIN_MEMORY_MB, NetworkMode, Networking, Provider, Provisioning, Resources, SshIdentity,
    ValidationErrors, ports, units,
};
use crate::env_file::RawConfig;

const KNOWN_KEYS: [&str; 16] = [
    "INFRA_TYPE",
    "INFRA_ID",
    "MEMORY",
    "CPUS",
    "DISK_SIZE",
    "PROVIDER",
    "BOX",
    "IMAGE",
    "NETWORK_MODE",
    "IP_ADDRESS",
    "PORTS",
    "PROVISIONING_PLAYBOOK",
    "PROVISIONING_VARS",
    "PROVISIONING_AUTO_INSTALL_ANSIBLE",
    "SSH_USER",
    "SSH_KEY",
];

const DEFAULT_BOX: &str = "generic/alpine319";
const DEFAULT_IMAGE: &str = "alpine:latest";

struct Bound {
    key: &'static str,
    default: u32,
    min: u32,
    unit: &'static str,
}

const MEMORY: Bound = Bound {
    key: "MEMORY",
    default: 2048,
    min: MIN_MEMORY_MB,
    unit: "MiB",
};

const CPUS: Bound = Bound {
    key: "CPUS",
    default: 2,
    min: MIN_CPU_CORES,
    unit: "core(s)",
};

const DISK: Bound = Bound {
    key: "DISK_SIZE",
    default: 20,
    min: MIN_DISK_GB,
    unit: "GiB",
};

/// Facts about the invocation that validation depends on.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ValidationContext {
    /// Absolute, canonical project directory. Relative paths in the
    /// declarations resolve against it and its name seeds the default id.
    pub project_path: Utf8PathBuf,
}

impl ValidationContext {
    /// Builds a context for the given project directory.
    #[must_use]
    pub fn new(project_path: impl Into<Utf8PathBuf>) -> Self {
        Self {
            project_path: project_path.into(),
        }
    }
}

/// A plan together with the non-fatal observations made while building it.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Validated {
    /// The validated plan.
    pub plan: InfrastructurePlan,
    /// Warnings such as ignored or unknown keys.
    pub warnings: Vec<String>,
}

#[derive(Default)]
struct Findings {
    errors: Vec<FieldError>,
    warnings: Vec<String>,
}

impl Findings {
    fn error(&mut self, field: &str, message: impl Into<String>) {
        self.errors.push(FieldError::new(field, message));
    }

    fn warn(&mut self, message: impl Into<String>) {
        self.warnings.push(message.into());
    }
}

/// Validates raw declarations into a plan.
///
/// Every rule is evaluated; the error list carries all violations in
/// declaration-check order rather than stopping at the first one.
///
/// # Errors
///
/// Returns [`ValidationErrors`] holding at least one [`FieldError`] when any
/// rule fails.
pub fn validate(
    raw: &RawConfig,
    ctx: &ValidationContext,
    files: &impl FileProbe,
) -> Result<Validated, ValidationErrors> {
    let mut findings = Findings::default();
    for issue in raw.issues() {
        findings.error(&format!("line {}", issue.line), issue.message.clone());
    }
    note_key_warnings(raw, &mut findings);

    let infra_type = read_infra_type(raw, &mut findings);
    let id = match resolve_id(raw, ctx) {
        Ok(id) => Some(id),
        Err(err) => {
            findings.errors.push(err);
            None
        }
    };
    let resources = read_resources(raw, infra_type, &mut findings);
    let provider = read_provider(raw, infra_type, &mut findings);
    let networking = read_networking(raw, &mut findings);
    let provisioning = read_provisioning(raw, ctx, files, &mut findings);
    let ssh = read_ssh(raw, ctx, infra_type, files, &mut findings);
    let image = read_image(raw, infra_type);

    let Findings { errors, warnings } = findings;
    match (infra_type, id) {
        (Some(kind), Some(instance_id)) if errors.is_empty() => Ok(Validated {
            plan: InfrastructurePlan {
                id: instance_id,
                infra_type: kind,
                project_path: ctx.project_path.clone(),
                resources,
                networking,
                provider,
                image,
                provisioning,
                ssh,
            },
            warnings,
        }),
        _ => Err(ValidationErrors(errors)),
    }
}

/// Resolves the instance identifier for a project without validating the
/// rest of the declarations.
///
/// Commands that act on an existing instance (`ssh`, `stop`, `rm`) only need
/// the identifier, so they stay usable even when other keys have since
/// become invalid.
///
/// # Errors
///
/// Returns a [`FieldError`] for `INFRA_ID` when the declared value is not a
/// host-name label or when no identifier can be derived from the directory
/// name.
pub fn resolve_id(raw: &RawConfig, ctx: &ValidationContext) -> Result<InstanceId, FieldError> {
    if let Some(value) = raw.get("INFRA_ID") {
        return InstanceId::parse(value).map_err(|message| FieldError::new("INFRA_ID", message));
    }
    ctx.project_path
        .file_name()
        .and_then(InstanceId::from_directory_name)
        .ok_or_else(|| {
            FieldError::new(
                "INFRA_ID",
                format!(
                    "cannot derive an identifier from {}; set INFRA_ID explicitly",
                    ctx.project_path
                ),
            )
        })
}

fn note_key_warnings(raw: &RawConfig, findings: &mut Findings) {
    for key in raw.duplicates() {
        findings.warn(format!("{key} is declared more than once; the last value wins"));
    }
    for key in raw.keys() {
        if !KNOWN_KEYS.contains(&key) {
            findings.warn(format!("unknown key {key} is ignored"));
        }
    }
}

fn read_infra_type(raw: &RawConfig, findings: &mut Findings) -> Option<InfraType> {
    let Some(value) = raw.get("INFRA_TYPE") else {
        findings.error("INFRA_TYPE", "is required (vm or container)");
        return None;
    };
    let parsed = InfraType::parse(value);
    if parsed.is_none() {
        findings.error("INFRA_TYPE", format!("'{value}' must be vm or container"));
    }
    parsed
}

fn read_resources(
    raw: &RawConfig,
    infra_type: Option<InfraType>,
    findings: &mut Findings,
) -> Resources {
    let memory_mb = read_bounded(raw, &MEMORY, units::parse_memory_mb, findings);
    let cpu_cores = read_bounded(raw, &CPUS, parse_count, findings);
    let disk_gb = if infra_type == Some(InfraType::Container) {
        if raw.get(DISK.key).is_some() {
            findings.warn("DISK_SIZE is ignored for containers");
        }
        None
    } else {
        Some(read_bounded(raw, &DISK, units::parse_disk_gb, findings))
    };

    Resources {
        memory_mb,
        cpu_cores,
        disk_gb,
    }
}

fn read_bounded(
    raw: &RawConfig,
    bound: &Bound,
    parse: fn(&str) -> Result<u32, String>,
    findings: &mut Findings,
) -> u32 {
    let Some(value) = raw.get(bound.key) else {
        return bound.default;
    };
    match parse(value) {
        Ok(amount) if amount >= bound.min => amount,
        Ok(amount) => {
            findings.error(
                bound.key,
                format!(
                    "{amount} {unit} is below the minimum of {min} {unit}",
                    unit = bound.unit,
                    min = bound.min
                ),
            );
            amount
        }
        Err(message) => {
            findings.error(bound.key, message);
            bound.default
        }
    }
}

fn parse_count(raw: &str) -> Result<u32, String> {
    raw.trim()
        .parse::<u32>()
        .map_err(|_| format!("'{raw}' is not a whole number"))
}

fn read_provider(
    raw: &RawConfig,
    infra_type: Option<InfraType>,
    findings: &mut Findings,
) -> Option<Provider> {
    let declared = raw.get("PROVIDER");
    match (infra_type, declared) {
        (Some(InfraType::Vm), None) => {
            findings.error(
                "PROVIDER",
                format!("is required for virtual machines (one of {})", known_providers()),
            );
            None
        }
        (Some(InfraType::Vm), Some(value)) => {
            let parsed = Provider::parse(value);
            if parsed.is_none() {
                findings.error(
                    "PROVIDER",
                    format!("'{value}' is not one of {}", known_providers()),
                );
            }
            parsed
        }
        (Some(InfraType::Container), Some(_)) => {
            findings.warn("PROVIDER is ignored for containers");
            None
        }
        _ => None,
    }
}

fn known_providers() -> String {
    Provider::ALL
        .iter()
        .map(|provider| provider.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}

fn read_networking(raw: &RawConfig, findings: &mut Findings) -> Networking {
    let mode = match raw.get("NETWORK_MODE") {
        None => NetworkMode::Default,
        Some(value) => NetworkMode::parse(value).unwrap_or_else(|| {
            findings.error("NETWORK_MODE", format!("'{value}' must be bridge or default"));
            NetworkMode::Default
        }),
    };

    let fixed_ip = raw
        .get("IP_ADDRESS")
        .and_then(|value| match value.parse::<Ipv4Addr>() {
            Ok(ip) if ip.is_unspecified() || ip.is_broadcast() || ip.is_multicast() => {
                findings.error("IP_ADDRESS", format!("{ip} cannot be assigned to an instance"));
                None
            }
            Ok(ip) => Some(ip),
            Err(_) => {
                findings.error("IP_ADDRESS", format!("'{value}' is not an IPv4 address"));
                None
            }
        });

    let ports = match raw.get("PORTS").map(ports::parse_ports) {
        None => Vec::new(),
        Some(Ok(mappings)) => mappings,
        Some(Err(problems)) => {
            for problem in problems {
                findings.error("PORTS", problem);
            }
            Vec::new()
        }
    };

    Networking {
        mode,
        fixed_ip,
        ports,
    }
}

fn read_provisioning(
    raw: &RawConfig,
    ctx: &ValidationContext,
    files: &impl FileProbe,
    findings: &mut Findings,
) -> Option<Provisioning> {
    let auto_install = read_bool(raw, "PROVISIONING_AUTO_INSTALL_ANSIBLE", findings);
    let Some(declared_playbook) = raw.get("PROVISIONING_PLAYBOOK") else {
        if raw.get("PROVISIONING_VARS").is_some() {
            findings.warn("PROVISIONING_VARS is ignored without PROVISIONING_PLAYBOOK");
        }
        return None;
    };

    let playbook_path = resolve_path(&ctx.project_path, declared_playbook);
    let has_yaml_extension = playbook_path
        .extension()
        .map(str::to_ascii_lowercase)
        .is_some_and(|ext| ext == "yml" || ext == "yaml");
    let mut usable = true;
    if !has_yaml_extension {
        findings.error(
            "PROVISIONING_PLAYBOOK",
            format!("{playbook_path} must be a .yml or .yaml file"),
        );
        usable = false;
    } else if !files.is_readable_file(&playbook_path) {
        findings.error(
            "PROVISIONING_PLAYBOOK",
            format!("{playbook_path} is not a readable file"),
        );
        usable = false;
    }

    let vars_path = raw
        .get("PROVISIONING_VARS")
        .map(|value| resolve_path(&ctx.project_path, value));
    if let Some(path) = &vars_path
        && !files.is_readable_file(path)
    {
        findings.error("PROVISIONING_VARS", format!("{path} is not a readable file"));
        usable = false;
    }

    usable.then_some(Provisioning {
        playbook_path,
        vars_path,
        auto_install,
    })
}

fn read_bool(raw: &RawConfig, key: &str, findings: &mut Findings) -> bool {
    let Some(value) = raw.get(key) else {
        return false;
    };
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => true,
        "false" | "0" | "no" | "off" => false,
        _ => {
            findings.error(key, format!("'{value}' is not a boolean (true or false)"));
            false
        }
    }
}

fn read_ssh(
    raw: &RawConfig,
    ctx: &ValidationContext,
    infra_type: Option<InfraType>,
    files: &impl FileProbe,
    findings: &mut Findings,
) -> SshIdentity {
    let default_user = match infra_type {
        Some(InfraType::Container) => "root",
        _ => "vagrant",
    };
    let user = raw.get("SSH_USER").unwrap_or(default_user).to_owned();
    if user.chars().any(char::is_whitespace) {
        findings.error("SSH_USER", format!("'{user}' must not contain whitespace"));
    }

    let key_path = raw
        .get("SSH_KEY")
        .map(|value| resolve_path(&ctx.project_path, value));
    if let Some(path) = &key_path
        && !files.is_readable_file(path)
    {
        findings.warn(format!("SSH_KEY {path} is not readable yet"));
    }

    SshIdentity { user, key_path }
}

fn read_image(raw: &RawConfig, infra_type: Option<InfraType>) -> String {
    let image = match infra_type {
        Some(InfraType::Container) => raw.get("IMAGE").unwrap_or(DEFAULT_IMAGE),
        _ => raw.get("BOX").unwrap_or(DEFAULT_BOX),
    };
    image.to_owned()
}

fn resolve_path(project: &Utf8Path, value: &str) -> Utf8PathBuf {
    let candidate = Utf8Path::new(value);
    if candidate.is_absolute() {
        candidate.to_path_buf()
    } else {
        project.join(candidate)
    }
}
