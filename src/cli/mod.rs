//! Command-line interface definitions for the `berth` binary.
//!
//! This module centralises the clap parser structures so both the main binary
//! and the build script can reuse them when generating the manual page.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

/// Top-level CLI for the `berth` binary.
#[derive(Debug, Parser)]
#[command(
    name = "berth",
    version,
    about = "Per-project VMs and containers declared in a .env file",
    arg_required_else_help = true
)]
pub(crate) struct Cli {
    /// Log debug detail to stderr.
    #[arg(long, short, global = true)]
    pub(crate) verbose: bool,
    /// Project directory holding the declarations (defaults to the current
    /// directory).
    #[arg(long, short = 'C', global = true, value_name = "DIR")]
    pub(crate) project: Option<PathBuf>,
    /// Command to run.
    #[command(subcommand)]
    pub(crate) command: Command,
}

/// Lifecycle commands.
#[derive(Debug, Subcommand)]
pub(crate) enum Command {
    /// Create the project's instance, or reuse it, then provision it once.
    #[command(name = "up")]
    Up(UpCommand),
    /// Open a shell, or run one command, inside the running instance.
    #[command(name = "ssh")]
    Ssh(SshCommand),
    /// Stop the running instance.
    #[command(name = "stop")]
    Stop(StopCommand),
    /// Boot a stopped instance.
    #[command(name = "start")]
    Start(StartCommand),
    /// Destroy the instance and forget it.
    #[command(name = "rm")]
    Rm(RmCommand),
    /// Show what the registry knows about the project's instance.
    #[command(name = "status")]
    Status,
}

/// Arguments for `berth up`.
#[derive(Debug, Args)]
pub(crate) struct UpCommand {
    /// Validate and check conflicts without creating anything.
    #[arg(long)]
    pub(crate) dry_run: bool,
    /// Skip the provisioning playbook.
    #[arg(long)]
    pub(crate) no_provision: bool,
}

/// Arguments for `berth ssh`.
#[derive(Debug, Args)]
pub(crate) struct SshCommand {
    /// Run this command instead of an interactive shell and exit with its
    /// status.
    #[arg(long, short = 'c', value_name = "CMD")]
    pub(crate) command: Option<String>,
}

/// Arguments for `berth stop`.
#[derive(Debug, Args)]
pub(crate) struct StopCommand {
    /// Power the instance off without a graceful shutdown.
    #[arg(long, short)]
    pub(crate) force: bool,
}

/// Arguments for `berth start`.
#[derive(Debug, Args)]
pub(crate) struct StartCommand {
    /// Skip the provisioning playbook.
    #[arg(long)]
    pub(crate) no_provision: bool,
}

/// Arguments for `berth rm`.
#[derive(Debug, Args)]
pub(crate) struct RmCommand {
    /// Stop a running instance first instead of refusing.
    #[arg(long, short)]
    pub(crate) force: bool,
}
