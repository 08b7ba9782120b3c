//! Tool-level settings loaded via `ortho-config`.
//!
//! These are distinct from a project's `.env` declarations: they describe
//! where berth keeps its state and which external tools it drives. Values
//! merge defaults, `berth.toml`, and `BERTH_*` environment variables.

use std::ffi::OsString;
use std::time::Duration;

use camino::Utf8PathBuf;
use directories::ProjectDirs;
use ortho_config::OrthoConfig;
use serde::Deserialize;
use thiserror::Error;

use crate::conflict::{DEFAULT_AUTO_PORT_END, DEFAULT_AUTO_PORT_START, PortRange};
use crate::registry::LockPolicy;

/// Lowest port `auto` allocation may start from.
pub const MIN_AUTO_PORT: u16 = 1024;

const REGISTRY_FILE_NAME: &str = "registry.json";

/// Settings shared by every berth command.
#[derive(Clone, Debug, Deserialize, OrthoConfig, PartialEq, Eq)]
#[ortho_config(
    prefix = "BERTH",
    discovery(
        app_name = "berth",
        env_var = "BERTH_CONFIG_PATH",
        config_file_name = "berth.toml",
        dotfile_name = ".berth.toml",
        project_file_name = "berth.toml"
    )
)]
pub struct BerthSettings {
    /// Registry document location. Defaults to `registry.json` in the
    /// platform data directory.
    pub registry_path: Option<String>,
    /// Name of the declarations file inside a project.
    #[ortho_config(default = ".env".to_owned())]
    pub env_file: String,
    /// First host port handed out for `auto` mappings.
    #[ortho_config(default = DEFAULT_AUTO_PORT_START)]
    pub auto_port_start: u16,
    /// Last host port handed out for `auto` mappings.
    #[ortho_config(default = DEFAULT_AUTO_PORT_END)]
    pub auto_port_end: u16,
    /// Seconds to wait for the registry lock.
    #[ortho_config(default = 10)]
    pub lock_timeout_secs: u64,
    /// Age in seconds after which a registry lock is considered abandoned.
    #[ortho_config(default = 120)]
    pub lock_stale_secs: u64,
    /// Path to the `vagrant` executable.
    #[ortho_config(default = "vagrant".to_owned())]
    pub vagrant_bin: String,
    /// Path to the `podman` executable.
    #[ortho_config(default = "podman".to_owned())]
    pub podman_bin: String,
    /// Path to the `ansible-playbook` executable.
    #[ortho_config(default = "ansible-playbook".to_owned())]
    pub ansible_playbook_bin: String,
    /// Whether to refuse instances that would over-commit host memory.
    #[ortho_config(default = true)]
    pub check_host_memory: bool,
}

/// Errors raised while loading or validating settings.
#[derive(Debug, Error, Eq, PartialEq)]
pub enum SettingsError {
    /// A setting holds an unusable value.
    #[error("invalid setting: {0}")]
    Invalid(String),
    /// No registry path was configured and no data directory is known.
    #[error("cannot determine a data directory: set BERTH_REGISTRY_PATH or registry_path in berth.toml")]
    NoDataDir,
    /// Surfaces errors from the `ortho-config` loader.
    #[error("settings parsing failed: {0}")]
    Parse(String),
}

impl BerthSettings {
    /// Loads settings without parsing CLI arguments.
    ///
    /// # Errors
    ///
    /// Returns [`SettingsError::Parse`] when merging sources fails.
    pub fn load_without_cli_args() -> Result<Self, SettingsError> {
        Self::load_from_iter([OsString::from("berth")])
            .map_err(|err| SettingsError::Parse(err.to_string()))
    }

    /// Checks values the loader cannot constrain.
    ///
    /// # Errors
    ///
    /// Returns [`SettingsError::Invalid`] naming the environment variable
    /// and TOML key to fix.
    pub fn validate(&self) -> Result<(), SettingsError> {
        for (value, key) in [
            (&self.env_file, "env_file"),
            (&self.vagrant_bin, "vagrant_bin"),
            (&self.podman_bin, "podman_bin"),
            (&self.ansible_playbook_bin, "ansible_playbook_bin"),
        ] {
            if value.trim().is_empty() {
                return Err(invalid(key, "must not be empty"));
            }
        }
        if let Some(path) = &self.registry_path
            && path.trim().is_empty()
        {
            return Err(invalid("registry_path", "must not be empty when set"));
        }
        if self.auto_port_start < MIN_AUTO_PORT {
            return Err(invalid(
                "auto_port_start",
                &format!("must be at least {MIN_AUTO_PORT}"),
            ));
        }
        if self.auto_port_start > self.auto_port_end {
            return Err(invalid(
                "auto_port_end",
                "must not be lower than auto_port_start",
            ));
        }
        Ok(())
    }

    /// Range used for `auto` port allocation.
    ///
    /// # Errors
    ///
    /// Returns [`SettingsError::Invalid`] when the bounds are reversed.
    pub fn port_range(&self) -> Result<PortRange, SettingsError> {
        PortRange::new(self.auto_port_start, self.auto_port_end).ok_or_else(|| {
            invalid("auto_port_end", "must not be lower than auto_port_start")
        })
    }

    /// Registry lock behaviour derived from the timeout settings.
    #[must_use]
    pub fn lock_policy(&self) -> LockPolicy {
        LockPolicy {
            timeout: Duration::from_secs(self.lock_timeout_secs),
            stale_after: Duration::from_secs(self.lock_stale_secs),
            ..LockPolicy::default()
        }
    }

    /// Resolves the registry document location.
    ///
    /// # Errors
    ///
    /// Returns [`SettingsError::NoDataDir`] when no path is configured and
    /// the platform has no data directory.
    pub fn registry_file(&self) -> Result<Utf8PathBuf, SettingsError> {
        if let Some(path) = &self.registry_path {
            return Ok(Utf8PathBuf::from(path));
        }
        let dirs = ProjectDirs::from("", "", "berth").ok_or(SettingsError::NoDataDir)?;
        let data_dir = Utf8PathBuf::from_path_buf(dirs.data_dir().to_path_buf())
            .map_err(|_| SettingsError::NoDataDir)?;
        Ok(data_dir.join(REGISTRY_FILE_NAME))
    }

    /// Directory beside the registry that holds per-instance state such as
    /// Vagrant machine directories and provisioning inventories.
    ///
    /// # Errors
    ///
    /// Propagates [`BerthSettings::registry_file`] failures.
    pub fn state_dir(&self) -> Result<Utf8PathBuf, SettingsError> {
        let registry = self.registry_file()?;
        Ok(registry
            .parent()
            .map_or_else(|| Utf8PathBuf::from("."), Utf8PathBuf::from))
    }
}

fn invalid(key: &str, problem: &str) -> SettingsError {
    SettingsError::Invalid(format!(
        "{key} {problem}: set BERTH_{} or {key} in berth.toml",
        key.to_ascii_uppercase()
    ))
}
