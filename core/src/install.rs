//! `setup` and `uninstall`.
//!
//! Setup is expressed as a list of [`SetupStep`]s so `--dry-run` prints
//! exactly what a real run would execute.

use std::fmt;
use std::path::{Path, PathBuf};

use crate::audit::AuditEvent;
use crate::config::GuardConfig;
use crate::context::GuardContext;
use crate::control::ControlState;
use crate::error::{GuardError, Result};
use crate::fsutil;
use crate::protection::{lock_best_effort, unlock_best_effort};
use crate::reconcile::{ReconcileResult, Reconciler};
use crate::suspend::SuspendKind;
use crate::surface::ManagementSurface;

pub const WATCH_UNIT: &str = "hostguard-watch.service";
pub const RECONCILE_SERVICE: &str = "hostguard-reconcile.service";
pub const RECONCILE_TIMER: &str = "hostguard-reconcile.timer";
pub const WATCHDOG_UNIT: &str = "hostguard-watchdog.service";
pub const PRE_HOOK: &str = "hostguard-pre.hook";
pub const POST_HOOK: &str = "hostguard-post.hook";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SetupOptions {
    /// Retake the snapshot from the live file even when one exists.
    pub force_snapshot: bool,
    /// Never take a snapshot; enforcement waits for an existing one.
    pub no_snapshot: bool,
    pub skip_bind: bool,
    pub skip_path_watch: bool,
    /// Unlock cooldown in seconds.
    pub delay: Option<u64>,
    pub dry_run: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UninstallOptions {
    /// Also remove the state directory and configuration file.
    pub purge: bool,
}

/// Fold command-line choices into the configuration that setup persists.
pub fn apply_options(config: &mut GuardConfig, options: &SetupOptions) {
    if options.skip_bind {
        config.protection.bind_mount = false;
    }
    if options.skip_path_watch {
        config.watcher.enabled = false;
        config.watchdog.units.retain(|unit| unit != WATCH_UNIT);
    }
    if let Some(delay) = options.delay {
        config.unlock.cooldown_secs = delay;
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedFile {
    pub path: PathBuf,
    pub contents: String,
}

impl RenderedFile {
    pub fn name(&self) -> &str {
        self.path
            .file_name()
            .and_then(|name| name.to_str())
            .unwrap_or_default()
    }
}

fn cli(config: &GuardConfig) -> String {
    config.install.bin_dir.join("hostguard").display().to_string()
}

fn service(description: &str, config_path: &Path, body: &str, wanted_by: &str) -> String {
    format!(
        "[Unit]\n\
         Description={description}\n\
         After=local-fs.target\n\
         \n\
         [Service]\n\
         Environment=HOSTGUARD_CONFIG={config}\n\
         {body}\n\
         \n\
         [Install]\n\
         WantedBy={wanted_by}\n",
        config = config_path.display(),
    )
}

/// systemd units. The watchdog unit is separate from the units making up
/// the management surface it defends.
pub fn unit_files(config: &GuardConfig, config_path: &Path) -> Vec<RenderedFile> {
    let dir = &config.install.systemd_dir;
    let cli = cli(config);
    let mut files = Vec::new();

    if config.watcher.enabled {
        files.push(RenderedFile {
            path: dir.join(WATCH_UNIT),
            contents: service(
                &format!("hostguard change watcher for {}", config.resource.path.display()),
                config_path,
                &format!("Type=simple\nExecStart={cli} watch\nRestart=always\nRestartSec=2"),
                "multi-user.target",
            ),
        });
    }
    files.push(RenderedFile {
        path: dir.join(RECONCILE_SERVICE),
        contents: service(
            "hostguard scheduled reconciliation",
            config_path,
            &format!("Type=oneshot\nExecStart={cli} reconcile"),
            "multi-user.target",
        ),
    });
    files.push(RenderedFile {
        path: dir.join(RECONCILE_TIMER),
        contents: format!(
            "[Unit]\n\
             Description=Run hostguard reconciliation every {interval}\n\
             \n\
             [Timer]\n\
             OnBootSec=1min\n\
             OnUnitActiveSec={interval}\n\
             Unit={RECONCILE_SERVICE}\n\
             \n\
             [Install]\n\
             WantedBy=timers.target\n",
            interval = config.install.timer_interval,
        ),
    });
    files.push(RenderedFile {
        path: dir.join(WATCHDOG_UNIT),
        contents: service(
            "hostguard independent watchdog",
            config_path,
            &format!(
                "Type=simple\nExecStart={}\nRestart=always\nRestartSec=1",
                config.install.bin_dir.join("hostguard-watchdog").display()
            ),
            "multi-user.target",
        ),
    });
    files
}

fn hook(when: &str, description: &str, exec: String) -> String {
    format!(
        "[Trigger]\n\
         Operation = Install\n\
         Operation = Upgrade\n\
         Operation = Remove\n\
         Type = Package\n\
         Target = *\n\
         \n\
         [Action]\n\
         Description = {description}\n\
         When = {when}\n\
         Exec = {exec}\n"
    )
}

/// Pacman hooks. `Target = *` without `NeedsTargets`: they fire for every
/// transaction.
pub fn hook_files(config: &GuardConfig, config_path: &Path) -> Vec<RenderedFile> {
    let dir = &config.install.hooks_dir;
    let cli = format!("{} --config {}", cli(config), config_path.display());
    vec![
        RenderedFile {
            path: dir.join(PRE_HOOK),
            contents: hook(
                "PreTransaction",
                "Lifting hostguard protections for the transaction",
                format!("{cli} hook pre-transaction"),
            ),
        },
        RenderedFile {
            path: dir.join(POST_HOOK),
            contents: hook(
                "PostTransaction",
                "Re-applying hostguard protections",
                format!("{cli} hook post-transaction"),
            ),
        },
    ]
}

pub fn rendered_files(config: &GuardConfig, config_path: &Path) -> Vec<RenderedFile> {
    let mut files = unit_files(config, config_path);
    files.extend(hook_files(config, config_path));
    files
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SetupStep {
    CreateStateDir(PathBuf),
    TakeSnapshot { from: PathBuf },
    KeepSnapshot,
    SkipSnapshot,
    RecordIntegrity(Vec<PathBuf>),
    InitControl(PathBuf),
    WriteConfig(PathBuf),
    WriteFile(RenderedFile),
    ActivateSurface(String),
    Enforce,
}

impl fmt::Display for SetupStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SetupStep::CreateStateDir(dir) => write!(f, "create state directory {}", dir.display()),
            SetupStep::TakeSnapshot { from } => {
                write!(f, "take canonical snapshot of {}", from.display())
            }
            SetupStep::KeepSnapshot => f.write_str("keep existing canonical snapshot"),
            SetupStep::SkipSnapshot => f.write_str("skip canonical snapshot"),
            SetupStep::RecordIntegrity(files) => {
                write!(f, "record integrity of {} policy file(s)", files.len())
            }
            SetupStep::InitControl(path) => {
                write!(f, "initialise control state {}", path.display())
            }
            SetupStep::WriteConfig(path) => write!(f, "write configuration {}", path.display()),
            SetupStep::WriteFile(file) => write!(f, "write {}", file.path.display()),
            SetupStep::ActivateSurface(surface) => write!(f, "enable and start {surface}"),
            SetupStep::Enforce => f.write_str("reconcile and apply protections"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SetupReport {
    pub steps: Vec<SetupStep>,
    pub reconcile: Option<ReconcileResult>,
}

pub struct Installer<'a> {
    ctx: &'a GuardContext,
    surface: &'a dyn ManagementSurface,
    config_path: PathBuf,
}

impl<'a> Installer<'a> {
    pub fn new(
        ctx: &'a GuardContext,
        surface: &'a dyn ManagementSurface,
        config_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            ctx,
            surface,
            config_path: config_path.into(),
        }
    }

    pub fn plan(&self, options: &SetupOptions) -> Vec<SetupStep> {
        let config = self.ctx.config();
        let mut steps = vec![SetupStep::CreateStateDir(config.state_dir.clone())];

        let snapshot = if options.no_snapshot {
            SetupStep::SkipSnapshot
        } else if options.force_snapshot || !self.ctx.canonical().exists() {
            SetupStep::TakeSnapshot {
                from: config.resource.path.clone(),
            }
        } else {
            SetupStep::KeepSnapshot
        };
        steps.push(snapshot);

        if !config.policy_files.is_empty() {
            steps.push(SetupStep::RecordIntegrity(config.policy_files.clone()));
        }
        if !self.ctx.layout().control_path().exists() {
            steps.push(SetupStep::InitControl(self.ctx.layout().control_path()));
        }
        steps.push(SetupStep::WriteConfig(self.config_path.clone()));
        steps.extend(
            rendered_files(config, &self.config_path)
                .into_iter()
                .map(SetupStep::WriteFile),
        );
        steps.push(SetupStep::ActivateSurface(self.surface.describe()));
        steps.push(SetupStep::Enforce);
        steps
    }

    /// Refuse a re-run that would replace the snapshot or loosen the
    /// persisted configuration while the guard is installed and ENABLED.
    pub fn check_allowed(&self, options: &SetupOptions) -> Result<()> {
        if !self.ctx.canonical().exists() || !self.ctx.control().read().is_enabled() {
            return Ok(());
        }
        let changes = self.weakenings(options);
        if changes.is_empty() {
            return Ok(());
        }
        tracing::warn!("setup refused while ENABLED: {}", changes.join(", "));
        self.ctx.audit().record(
            AuditEvent::new("setup_refused")
                .field("path", self.ctx.resource_path().display())
                .field("changes", changes.join(",")),
        );
        Err(GuardError::StillEnabled)
    }

    fn weakenings(&self, options: &SetupOptions) -> Vec<&'static str> {
        let mut changes = Vec::new();
        if options.force_snapshot {
            changes.push("force_snapshot");
        }
        let config = self.ctx.config();
        match self.persisted_config() {
            Some(before) => {
                if before.protection.bind_mount && !config.protection.bind_mount {
                    changes.push("skip_bind");
                }
                if before.watcher.enabled && !config.watcher.enabled {
                    changes.push("skip_path_watch");
                }
                if config.unlock.cooldown_secs < before.unlock.cooldown_secs {
                    changes.push("delay");
                }
            }
            None => {
                if options.skip_bind {
                    changes.push("skip_bind");
                }
                if options.skip_path_watch {
                    changes.push("skip_path_watch");
                }
                if options.delay.is_some() {
                    changes.push("delay");
                }
            }
        }
        changes
    }

    fn persisted_config(&self) -> Option<GuardConfig> {
        let text = std::fs::read_to_string(&self.config_path).ok()?;
        match toml::from_str(&text) {
            Ok(config) => Some(config),
            Err(err) => {
                tracing::warn!("cannot parse {}: {err}", self.config_path.display());
                None
            }
        }
    }

    pub fn setup(&self, options: &SetupOptions) -> Result<SetupReport> {
        self.check_allowed(options)?;
        let steps = self.plan(options);
        let mut reconcile = None;
        for step in &steps {
            tracing::info!("setup: {step}");
            if let Some(result) = self.execute(step)? {
                reconcile = Some(result);
            }
        }
        self.ctx.lock_state_files();
        lock_best_effort(self.ctx.protection(), &self.config_path);
        self.ctx.audit().record(
            AuditEvent::new("setup")
                .field("path", self.ctx.resource_path().display())
                .field("bind_mount", self.ctx.config().protection.bind_mount)
                .field("watcher", self.ctx.config().watcher.enabled),
        );
        Ok(SetupReport { steps, reconcile })
    }

    fn execute(&self, step: &SetupStep) -> Result<Option<ReconcileResult>> {
        match step {
            SetupStep::CreateStateDir(dir) => {
                std::fs::create_dir_all(dir).map_err(|e| GuardError::io(dir, e))?;
            }
            SetupStep::TakeSnapshot { from } => {
                let content = std::fs::read(from).map_err(|e| GuardError::io(from, e))?;
                self.ctx.unlock_state_files();
                let snapshot = self.ctx.canonical().store(&content, from)?;
                self.ctx.audit().record(
                    AuditEvent::new("snapshot_taken")
                        .field("path", from.display())
                        .field("sha256", &snapshot.content_hash),
                );
            }
            SetupStep::KeepSnapshot => {}
            SetupStep::SkipSnapshot => {
                if !self.ctx.canonical().exists() {
                    tracing::warn!(
                        "no canonical snapshot; enforcement stays idle until one exists"
                    );
                }
            }
            SetupStep::RecordIntegrity(files) => {
                self.ctx.unlock_state_files();
                self.ctx.integrity().record(files)?;
            }
            SetupStep::InitControl(_) => self.ctx.control().write(ControlState::Enabled)?,
            SetupStep::WriteConfig(path) => {
                if path.exists() {
                    unlock_best_effort(self.ctx.protection(), path);
                }
                fsutil::atomic_write(path, self.ctx.config().to_toml()?.as_bytes())?;
            }
            SetupStep::WriteFile(file) => {
                fsutil::atomic_write(&file.path, file.contents.as_bytes())?;
            }
            SetupStep::ActivateSurface(_) => self.surface.reassert()?,
            SetupStep::Enforce => {
                return Reconciler::new(self.ctx).reconcile().map(Some);
            }
        }
        Ok(None)
    }

    /// Tear everything down. Refused while the control state is ENABLED so
    /// uninstalling is never a shortcut around `control disable`.
    pub fn uninstall(&self, options: &UninstallOptions) -> Result<Vec<String>> {
        if self.ctx.control().read().is_enabled() {
            return Err(GuardError::StillEnabled);
        }
        let mut done = Vec::new();

        if let Err(err) = self.surface.retire() {
            tracing::warn!("stopping units: {err}");
        } else {
            done.push(format!("stopped {}", self.surface.describe()));
        }

        let removed = self.ctx.release()?;
        done.push(format!(
            "released {} ({removed} mount layer(s) removed)",
            self.ctx.resource_path().display()
        ));
        self.ctx.unlock_state_files();
        if self.config_path.exists() {
            unlock_best_effort(self.ctx.protection(), &self.config_path);
        }

        for file in rendered_files(self.ctx.config(), &self.config_path) {
            match std::fs::remove_file(&file.path) {
                Ok(()) => done.push(format!("removed {}", file.path.display())),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(GuardError::io(&file.path, e)),
            }
        }
        for kind in SuspendKind::ALL {
            self.ctx.suspensions().resume(kind)?;
        }

        self.ctx.audit().record(
            AuditEvent::new("uninstall")
                .field("path", self.ctx.resource_path().display())
                .field("purge", options.purge),
        );

        if options.purge {
            let state_dir = &self.ctx.config().state_dir;
            match std::fs::remove_dir_all(state_dir) {
                Ok(()) => done.push(format!("removed {}", state_dir.display())),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(GuardError::io(state_dir, e)),
            }
            match std::fs::remove_file(&self.config_path) {
                Ok(()) => done.push(format!("removed {}", self.config_path.display())),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(GuardError::io(&self.config_path, e)),
            }
        }
        Ok(done)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protection::ProtectionBackend;
    use crate::reconcile::ReconcileReason;
    use crate::testing::{FakeSurface, Sandbox};
    use crate::transaction::TransactionGuard;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::Ordering;

    fn config_path(sandbox: &Sandbox) -> PathBuf {
        sandbox.dir.path().join("etc").join("config.toml")
    }

    #[test]
    fn setup_snapshots_and_protects() {
        let sandbox = Sandbox::new();
        sandbox.tamper(b"0.0.0.0 example.com\n");
        let surface = FakeSurface::default();
        let installer = Installer::new(&sandbox.context, &surface, config_path(&sandbox));

        let report = installer.setup(&SetupOptions::default()).unwrap();
        assert_eq!(
            report.reconcile.map(|r| r.reason),
            Some(ReconcileReason::InSync)
        );
        assert_eq!(
            sandbox.context.canonical().require().unwrap().snapshot.content_bytes,
            b"0.0.0.0 example.com\n"
        );
        assert_eq!(sandbox.mounts.count(sandbox.resource()), 1);
        assert!(sandbox.protection.is_locked(sandbox.resource()));
        assert_eq!(surface.reasserted.load(Ordering::SeqCst), 1);
        assert_eq!(sandbox.context.control().read(), ControlState::Enabled);

        let written: GuardConfig =
            toml::from_str(&std::fs::read_to_string(config_path(&sandbox)).unwrap()).unwrap();
        assert_eq!(&written, sandbox.context.config());
        for name in [WATCH_UNIT, RECONCILE_TIMER, WATCHDOG_UNIT] {
            assert!(sandbox.context.config().install.systemd_dir.join(name).exists());
        }
        assert!(sandbox.context.config().install.hooks_dir.join(PRE_HOOK).exists());
    }

    #[test]
    fn existing_snapshot_is_kept() {
        let sandbox = Sandbox::new();
        sandbox.install(b"approved\n");
        sandbox.tamper(b"edited\n");
        let surface = FakeSurface::default();
        let installer = Installer::new(&sandbox.context, &surface, config_path(&sandbox));

        let plan = installer.plan(&SetupOptions::default());
        assert!(plan.contains(&SetupStep::KeepSnapshot));
        installer.setup(&SetupOptions::default()).unwrap();
        assert_eq!(sandbox.live(), b"approved\n");
    }

    #[test]
    fn forced_snapshot_needs_disabled_control() {
        let sandbox = Sandbox::new();
        sandbox.install(b"approved\n");
        let surface = FakeSurface::default();
        let installer = Installer::new(&sandbox.context, &surface, config_path(&sandbox));
        installer.setup(&SetupOptions::default()).unwrap();
        let forced = SetupOptions {
            force_snapshot: true,
            ..Default::default()
        };

        sandbox.context.release().unwrap();
        sandbox.tamper(b"edited\n");
        assert!(matches!(
            installer.setup(&forced).unwrap_err(),
            GuardError::StillEnabled
        ));
        assert_eq!(
            sandbox.context.canonical().require().unwrap().snapshot.content_bytes,
            b"approved\n"
        );
        let audit = sandbox.context.audit().tail(10).unwrap();
        assert!(audit.iter().any(|line| line.contains("setup_refused")
            && line.contains("force_snapshot")));

        sandbox.context.control().write(ControlState::Disabled).unwrap();
        installer.setup(&forced).unwrap();
        assert_eq!(
            sandbox.context.canonical().require().unwrap().snapshot.content_bytes,
            b"edited\n"
        );
    }

    #[test]
    fn transaction_window_cannot_retake_the_snapshot() {
        let sandbox = Sandbox::new();
        sandbox.install(b"approved\n");
        let surface = FakeSurface::default();
        let installer = Installer::new(&sandbox.context, &surface, config_path(&sandbox));
        installer.setup(&SetupOptions::default()).unwrap();

        let transaction = TransactionGuard::new(sandbox.context.clone());
        transaction.pre_transaction().unwrap();
        sandbox.tamper(b"");
        let err = installer
            .setup(&SetupOptions {
                force_snapshot: true,
                delay: Some(0),
                ..Default::default()
            })
            .unwrap_err();
        assert!(matches!(err, GuardError::StillEnabled));
        transaction.post_transaction().unwrap();

        assert_eq!(sandbox.context.control().read(), ControlState::Enabled);
        assert_eq!(
            sandbox.context.canonical().require().unwrap().snapshot.content_bytes,
            b"approved\n"
        );
        assert_eq!(sandbox.live(), b"approved\n");
    }

    #[test]
    fn loosening_the_persisted_config_needs_disabled_control() {
        let sandbox = Sandbox::with_config(|config| config.unlock.cooldown_secs = 300);
        sandbox.install(b"approved\n");
        let surface = FakeSurface::default();
        Installer::new(&sandbox.context, &surface, config_path(&sandbox))
            .setup(&SetupOptions::default())
            .unwrap();

        let options = SetupOptions {
            skip_bind: true,
            delay: Some(0),
            ..Default::default()
        };
        let mut config = sandbox.context.config().clone();
        apply_options(&mut config, &options);
        let weaker =
            GuardContext::with_backends(config, sandbox.protection.clone(), sandbox.mounts.clone());
        let installer = Installer::new(&weaker, &surface, config_path(&sandbox));
        assert!(matches!(
            installer.setup(&options).unwrap_err(),
            GuardError::StillEnabled
        ));
        let persisted: GuardConfig =
            toml::from_str(&std::fs::read_to_string(config_path(&sandbox)).unwrap()).unwrap();
        assert_eq!(persisted.unlock.cooldown_secs, 300);
        assert!(persisted.protection.bind_mount);

        let stricter = SetupOptions {
            delay: Some(600),
            ..Default::default()
        };
        let mut config = sandbox.context.config().clone();
        apply_options(&mut config, &stricter);
        let stricter_ctx =
            GuardContext::with_backends(config, sandbox.protection.clone(), sandbox.mounts.clone());
        Installer::new(&stricter_ctx, &surface, config_path(&sandbox))
            .setup(&stricter)
            .unwrap();
    }

    #[test]
    fn setup_locks_config_and_state_files() {
        let sandbox = Sandbox::new();
        sandbox.tamper(b"x\n");
        let surface = FakeSurface::default();
        Installer::new(&sandbox.context, &surface, config_path(&sandbox))
            .setup(&SetupOptions::default())
            .unwrap();

        assert!(sandbox.protection.is_locked(&config_path(&sandbox)));
        assert!(
            sandbox
                .protection
                .is_locked(&sandbox.context.layout().control_path())
        );
    }

    #[test]
    fn no_snapshot_leaves_enforcement_idle() {
        let sandbox = Sandbox::new();
        sandbox.tamper(b"anything\n");
        let surface = FakeSurface::default();
        let installer = Installer::new(&sandbox.context, &surface, config_path(&sandbox));

        let report = installer
            .setup(&SetupOptions {
                no_snapshot: true,
                ..Default::default()
            })
            .unwrap();
        assert_eq!(
            report.reconcile.map(|r| r.reason),
            Some(ReconcileReason::NotInitialized)
        );
        assert_eq!(sandbox.mounts.count(sandbox.resource()), 0);
    }

    #[test]
    fn options_shape_the_persisted_config() {
        let options = SetupOptions {
            skip_bind: true,
            skip_path_watch: true,
            delay: Some(120),
            ..Default::default()
        };
        let sandbox = Sandbox::with_config(|config| apply_options(config, &options));
        let config = sandbox.context.config();
        assert!(!config.protection.bind_mount);
        assert!(!config.watcher.enabled);
        assert_eq!(config.unlock.cooldown_secs, 120);
        assert!(!config.watchdog.units.iter().any(|u| u == WATCH_UNIT));

        let names: Vec<String> = unit_files(config, Path::new("/etc/hostguard/config.toml"))
            .iter()
            .map(|file| file.name().to_string())
            .collect();
        assert_eq!(names, vec![RECONCILE_SERVICE, RECONCILE_TIMER, WATCHDOG_UNIT]);
    }

    #[test]
    fn dry_run_plan_touches_nothing() {
        let sandbox = Sandbox::new();
        sandbox.tamper(b"x\n");
        let surface = FakeSurface::default();
        let installer = Installer::new(&sandbox.context, &surface, config_path(&sandbox));

        let plan = installer.plan(&SetupOptions {
            dry_run: true,
            ..Default::default()
        });
        assert!(matches!(plan.first(), Some(SetupStep::CreateStateDir(_))));
        assert_eq!(plan.last(), Some(&SetupStep::Enforce));
        assert!(!sandbox.context.config().state_dir.exists());
        assert!(!config_path(&sandbox).exists());
    }

    #[test]
    fn hooks_fire_for_every_target() {
        let config = GuardConfig::default();
        let hooks = hook_files(&config, Path::new("/etc/hostguard/config.toml"));
        assert_eq!(hooks.len(), 2);
        for hook in &hooks {
            assert!(hook.contents.contains("Target = *"));
            assert!(!hook.contents.contains("NeedsTargets"));
        }
        assert!(hooks[0].contents.contains("When = PreTransaction"));
        assert!(
            hooks[0]
                .contents
                .contains("/usr/local/bin/hostguard --config /etc/hostguard/config.toml hook pre-transaction")
        );
        assert!(hooks[1].contents.contains("When = PostTransaction"));
    }

    #[test]
    fn uninstall_requires_disabled_control() {
        let sandbox = Sandbox::new();
        sandbox.tamper(b"x\n");
        let surface = FakeSurface::default();
        let installer = Installer::new(&sandbox.context, &surface, config_path(&sandbox));
        installer.setup(&SetupOptions::default()).unwrap();

        assert!(matches!(
            installer.uninstall(&UninstallOptions::default()).unwrap_err(),
            GuardError::StillEnabled
        ));
        assert_eq!(sandbox.mounts.count(sandbox.resource()), 1);

        sandbox.context.control().write(ControlState::Disabled).unwrap();
        installer
            .uninstall(&UninstallOptions { purge: true })
            .unwrap();
        assert_eq!(sandbox.mounts.count(sandbox.resource()), 0);
        assert!(!sandbox.protection.is_locked(sandbox.resource()));
        assert!(!sandbox.context.config().state_dir.exists());
        assert!(!config_path(&sandbox).exists());
        assert!(!sandbox.context.config().install.hooks_dir.join(POST_HOOK).exists());
        assert_eq!(surface.retired.load(Ordering::SeqCst), 1);
    }
}
