//! `hostguard setup` and `hostguard uninstall`.

use std::process::ExitCode;

use anyhow::Context;
use clap::Parser;
use hostguard_core::GuardContext;
use hostguard_core::install::{Installer, SetupOptions, UninstallOptions, apply_options};
use hostguard_core::surface::SystemdSurface;

use crate::{Cli, ensure_root};

#[derive(Debug, Parser)]
pub struct SetupArgs {
    /// Re-take the canonical snapshot from the live file even if one exists.
    /// Refused while control is ENABLED.
    #[arg(long = "force-snapshot", conflicts_with = "no_snapshot")]
    pub force_snapshot: bool,

    /// Do not take a snapshot; enforcement idles until one exists.
    #[arg(long = "no-snapshot")]
    pub no_snapshot: bool,

    /// Skip the read-only bind mount layer.
    #[arg(long = "skip-bind")]
    pub skip_bind: bool,

    /// Do not install the change watcher unit.
    #[arg(long = "skip-path-watch")]
    pub skip_path_watch: bool,

    /// Unlock cooldown in seconds.
    #[arg(long = "delay", value_name = "SECS")]
    pub delay: Option<u64>,

    /// Print the steps without performing them.
    #[arg(long = "dry-run")]
    pub dry_run: bool,
}

impl SetupArgs {
    fn options(&self) -> SetupOptions {
        SetupOptions {
            force_snapshot: self.force_snapshot,
            no_snapshot: self.no_snapshot,
            skip_bind: self.skip_bind,
            skip_path_watch: self.skip_path_watch,
            delay: self.delay,
            dry_run: self.dry_run,
        }
    }
}

#[derive(Debug, Parser)]
pub struct UninstallArgs {
    /// Also delete the state directory and the configuration file.
    #[arg(long = "purge")]
    pub purge: bool,
}

pub fn run_setup(cli: &Cli, args: &SetupArgs) -> anyhow::Result<ExitCode> {
    let options = args.options();
    let loader = cli.loader().allow_missing();
    let config_path = loader.target_path();
    let mut config = loader
        .load()
        .with_context(|| format!("loading {}", config_path.display()))?;
    apply_options(&mut config, &options);

    let surface = SystemdSurface::new(config.clone(), config_path.clone());
    let ctx = GuardContext::system(config);
    let installer = Installer::new(&ctx, &surface, &config_path);

    if options.dry_run {
        installer.check_allowed(&options)?;
        for step in installer.plan(&options) {
            println!("would {step}");
        }
        return Ok(ExitCode::SUCCESS);
    }

    ensure_root("setup")?;
    let report = installer.setup(&options)?;
    for step in &report.steps {
        println!("done: {step}");
    }
    if let Some(result) = report.reconcile {
        println!(
            "{}: {} (protections reapplied: {})",
            ctx.resource_path().display(),
            result.reason,
            result.protections_reapplied
        );
    }
    Ok(ExitCode::SUCCESS)
}

pub fn run_uninstall(cli: &Cli, args: &UninstallArgs) -> anyhow::Result<ExitCode> {
    ensure_root("uninstall")?;
    let loader = cli.loader().allow_missing();
    let config_path = loader.target_path();
    let config = loader
        .load()
        .with_context(|| format!("loading {}", config_path.display()))?;

    let surface = SystemdSurface::new(config.clone(), config_path.clone());
    let ctx = GuardContext::system(config);
    let done = Installer::new(&ctx, &surface, &config_path)
        .uninstall(&UninstallOptions { purge: args.purge })?;
    for line in done {
        println!("{line}");
    }
    Ok(ExitCode::SUCCESS)
}
