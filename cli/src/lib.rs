//! `hostguard` command-line surface.
//!
//! Operator commands (`setup`, `status`, `unlock`, `control`), the entry
//! points systemd and pacman call (`watch`, `reconcile`, `hook`), and the
//! `transaction` wrapper for ad-hoc maintenance.
//!
//! ## Exit Codes
//!
//! - 0: Success
//! - 1: Operational failure (or a failed check for `verify`)
//! - 2: Usage error

pub mod control_cmd;
pub mod guard_cmd;
pub mod maintenance_cmd;
pub mod setup_cmd;

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Context;
use clap::{Parser, Subcommand};
use hostguard_core::GuardContext;
use hostguard_core::config::{ConfigLoader, GuardConfig};

use crate::control_cmd::ControlCli;
use crate::guard_cmd::{StatusArgs, VerifyArgs};
use crate::maintenance_cmd::{HookCli, TransactionArgs, UnlockArgs};
use crate::setup_cmd::{SetupArgs, UninstallArgs};

/// Keep an administrator-approved /etc/hosts in force.
#[derive(Debug, Parser)]
#[command(name = "hostguard", version, about)]
pub struct Cli {
    /// Configuration file.
    #[arg(long = "config", global = true, env = "HOSTGUARD_CONFIG", value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Debug logging.
    #[arg(short = 'v', long = "verbose", global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Snapshot the resource, install units and hooks, and enforce.
    Setup(SetupArgs),
    /// Remove units and hooks and lift protection (control must be DISABLED).
    Uninstall(UninstallArgs),
    /// Run one reconciliation pass.
    Reconcile,
    /// Show the guard's current state.
    Status(StatusArgs),
    /// Check every invariant without changing anything.
    Verify(VerifyArgs),
    /// Run the change watcher in the foreground.
    Watch,
    /// Package-manager hook entry points.
    Hook(HookCli),
    /// Run a command with protections lifted for its duration.
    Transaction(TransactionArgs),
    /// Edit the canonical content through the friction workflow.
    Unlock(UnlockArgs),
    /// Inspect or flip the out-of-band control state.
    Control(ControlCli),
}

impl Cli {
    pub fn loader(&self) -> ConfigLoader {
        match &self.config {
            Some(path) => ConfigLoader::new().with_file(path),
            None => ConfigLoader::new(),
        }
    }

    pub fn load_config(&self) -> anyhow::Result<GuardConfig> {
        self.loader()
            .load()
            .with_context(|| format!("loading {}", self.loader().target_path().display()))
    }

    pub fn context(&self) -> anyhow::Result<GuardContext> {
        Ok(GuardContext::system(self.load_config()?))
    }

    pub fn run(&self) -> anyhow::Result<ExitCode> {
        match &self.command {
            Command::Setup(args) => setup_cmd::run_setup(self, args),
            Command::Uninstall(args) => setup_cmd::run_uninstall(self, args),
            Command::Reconcile => guard_cmd::run_reconcile(self),
            Command::Status(args) => guard_cmd::run_status(self, args),
            Command::Verify(args) => guard_cmd::run_verify(self, args),
            Command::Watch => guard_cmd::run_watch(self),
            Command::Hook(hook) => maintenance_cmd::run_hook(self, hook),
            Command::Transaction(args) => maintenance_cmd::run_transaction(self, args),
            Command::Unlock(args) => maintenance_cmd::run_unlock(self, args),
            Command::Control(control) => control_cmd::run_control(self, control),
        }
    }
}

/// Refuse commands that touch mounts or attributes without privileges.
pub(crate) fn ensure_root(action: &str) -> anyhow::Result<()> {
    if !hostguard_core::running_as_root() {
        anyhow::bail!("`hostguard {action}` must run as root");
    }
    Ok(())
}

pub(crate) fn print_json(value: &impl serde::Serialize) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
