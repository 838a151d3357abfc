//! Enforcement commands: `reconcile`, `status`, `verify`, `watch`.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::Context;
use clap::Parser;
use hostguard_core::canonical::ProtectedResource;
use hostguard_core::suspend::{SuspendKind, SuspensionMarker};
use hostguard_core::unlock::{SessionJournal, UnlockSession};
use hostguard_core::watcher::ChangeWatcher;
use hostguard_core::{ControlState, GuardContext, Reconciler};
use serde::Serialize;
use tokio::signal::unix::{SignalKind, signal};

use crate::{Cli, ensure_root, print_json};

#[derive(Debug, Parser)]
pub struct StatusArgs {
    /// Output as JSON.
    #[arg(long = "json", short = 'j')]
    pub json: bool,
}

#[derive(Debug, Parser)]
pub struct VerifyArgs {
    /// Output as JSON.
    #[arg(long = "json", short = 'j')]
    pub json: bool,
}

/// Point-in-time view of the resource and its protections.
#[derive(Debug, Serialize)]
pub struct StatusReport {
    pub resource: PathBuf,
    pub control: ControlState,
    pub canonical_present: bool,
    pub canonical_sha256: Option<String>,
    pub canonical_digest_ok: Option<bool>,
    pub live_sha256: Option<String>,
    pub in_sync: bool,
    pub protection_backend: &'static str,
    pub locked: bool,
    pub bind_mount: bool,
    pub mount_layers: usize,
    pub top_read_only: bool,
    pub protected: bool,
    pub suspensions: Vec<SuspensionMarker>,
    pub last_unlock: Option<UnlockSession>,
}

impl StatusReport {
    pub fn collect(ctx: &GuardContext) -> anyhow::Result<Self> {
        let path = ctx.resource_path();
        let canonical = ctx.canonical().load()?;
        let live = ProtectedResource::inspect(path)?;
        let overlay = ctx.overlay().status(path)?;
        let canonical_sha256 = canonical
            .as_ref()
            .map(|loaded| loaded.snapshot.content_hash.clone());
        let in_sync = canonical_sha256.is_some() && canonical_sha256 == live.current_content_hash;
        let suspensions = SuspendKind::ALL
            .into_iter()
            .filter_map(|kind| ctx.suspensions().active(kind))
            .collect();
        let last_unlock = SessionJournal::new(ctx.layout().sessions_path())
            .recent(1)?
            .pop();

        Ok(Self {
            resource: path.to_path_buf(),
            control: ctx.control().read(),
            canonical_present: canonical.is_some(),
            canonical_digest_ok: canonical.as_ref().map(|loaded| loaded.digest_matches),
            canonical_sha256,
            live_sha256: live.current_content_hash,
            in_sync,
            protection_backend: ctx.protection().name(),
            locked: ctx.protection().is_locked(path),
            bind_mount: ctx.config().protection.bind_mount,
            mount_layers: overlay.layers,
            top_read_only: overlay.top_read_only,
            protected: ctx.is_protected()?,
            suspensions,
            last_unlock,
        })
    }

    fn print(&self) {
        println!("resource:    {}", self.resource.display());
        println!("control:     {}", self.control);
        match &self.canonical_sha256 {
            Some(hash) if self.canonical_digest_ok == Some(false) => {
                println!("canonical:   {hash} (digest file mismatch)");
            }
            Some(hash) => println!("canonical:   {hash}"),
            None => println!("canonical:   (none; run `hostguard setup`)"),
        }
        println!(
            "live:        {}{}",
            self.live_sha256.as_deref().unwrap_or("(missing)"),
            if self.in_sync { " (in sync)" } else { " (DRIFTED)" }
        );
        println!(
            "protection:  {} {}",
            self.protection_backend,
            if self.locked { "locked" } else { "unlocked" }
        );
        println!(
            "mounts:      {} layer(s){}",
            self.mount_layers,
            if self.top_read_only { ", top read-only" } else { "" }
        );
        for marker in &self.suspensions {
            println!(
                "suspended:   {} by pid {} since {} ({})",
                marker.kind,
                marker.pid,
                marker.started_at.to_rfc3339(),
                marker.reason
            );
        }
        if let Some(session) = &self.last_unlock {
            println!(
                "last unlock: {} {:?} at {}",
                session.session_id,
                session.reason,
                session.started_at.to_rfc3339()
            );
        }
    }
}

/// One invariant checked by `verify`.
#[derive(Debug, Serialize)]
pub struct Check {
    pub name: &'static str,
    pub ok: bool,
    pub detail: String,
}

impl Check {
    fn new(name: &'static str, ok: bool, detail: impl Into<String>) -> Self {
        Self {
            name,
            ok,
            detail: detail.into(),
        }
    }
}

pub fn verify_checks(ctx: &GuardContext) -> anyhow::Result<Vec<Check>> {
    let status = StatusReport::collect(ctx)?;
    let mut checks = vec![
        Check::new(
            "control",
            status.control.is_enabled(),
            status.control.as_token(),
        ),
        Check::new(
            "canonical",
            status.canonical_present && status.canonical_digest_ok == Some(true),
            match (status.canonical_present, status.canonical_digest_ok) {
                (false, _) => "no snapshot".to_string(),
                (true, Some(false)) => "digest file does not match content".to_string(),
                (true, _) => status.canonical_sha256.clone().unwrap_or_default(),
            },
        ),
        Check::new(
            "content",
            status.in_sync,
            status
                .live_sha256
                .clone()
                .unwrap_or_else(|| "missing".to_string()),
        ),
        Check::new(
            "attribute",
            status.locked,
            format!("{} backend", status.protection_backend),
        ),
    ];

    let mounts_ok = if status.bind_mount {
        status.mount_layers == 1 && status.top_read_only
    } else {
        status.mount_layers == 0
    };
    checks.push(Check::new(
        "mounts",
        mounts_ok,
        format!(
            "{} layer(s), expected {}",
            status.mount_layers,
            if status.bind_mount { "one read-only" } else { "none" }
        ),
    ));

    let mismatched = ctx.integrity().mismatched();
    checks.push(Check::new(
        "policy",
        mismatched.is_empty(),
        if mismatched.is_empty() {
            "all recorded files match".to_string()
        } else {
            mismatched
                .iter()
                .map(|path| path.display().to_string())
                .collect::<Vec<_>>()
                .join(", ")
        },
    ));
    Ok(checks)
}

pub fn run_reconcile(cli: &Cli) -> anyhow::Result<ExitCode> {
    let ctx = cli.context()?;
    let result = Reconciler::new(&ctx).reconcile()?;
    println!(
        "{}: {} (changed: {}, protections reapplied: {})",
        ctx.resource_path().display(),
        result.reason,
        result.changed,
        result.protections_reapplied
    );
    for path in &result.policy_restored {
        println!("restored policy file {}", path.display());
    }
    Ok(ExitCode::SUCCESS)
}

pub fn run_status(cli: &Cli, args: &StatusArgs) -> anyhow::Result<ExitCode> {
    let ctx = cli.context()?;
    let report = StatusReport::collect(&ctx)?;
    if args.json {
        print_json(&report)?;
    } else {
        report.print();
    }
    Ok(ExitCode::SUCCESS)
}

pub fn run_verify(cli: &Cli, args: &VerifyArgs) -> anyhow::Result<ExitCode> {
    let ctx = cli.context()?;
    let checks = verify_checks(&ctx)?;
    let ok = checks.iter().all(|check| check.ok);
    if args.json {
        print_json(&checks)?;
    } else {
        for check in &checks {
            let mark = if check.ok { "ok  " } else { "FAIL" };
            println!("{mark} {:<10} {}", check.name, check.detail);
        }
    }
    Ok(if ok { ExitCode::SUCCESS } else { ExitCode::FAILURE })
}

pub fn run_watch(cli: &Cli) -> anyhow::Result<ExitCode> {
    ensure_root("watch")?;
    let watcher = ChangeWatcher::new(cli.context()?);
    let runtime = tokio::runtime::Runtime::new().context("starting runtime")?;
    runtime.block_on(watch_until_signal(watcher))?;
    Ok(ExitCode::SUCCESS)
}

/// Runs until SIGINT or SIGTERM, or until the watcher returns on its own.
async fn watch_until_signal(watcher: ChangeWatcher) -> anyhow::Result<()> {
    let shutdown = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&shutdown);
    let mut task = tokio::task::spawn_blocking(move || watcher.run(&flag));
    let mut sigterm = signal(SignalKind::terminate()).context("installing SIGTERM handler")?;

    tokio::select! {
        result = &mut task => {
            result.context("change watcher panicked")??;
            return Ok(());
        }
        _ = tokio::signal::ctrl_c() => tracing::info!("SIGINT received"),
        _ = sigterm.recv() => tracing::info!("SIGTERM received"),
    }
    shutdown.store(true, Ordering::SeqCst);
    task.await.context("change watcher panicked")??;
    Ok(())
}
