//! Change Watcher: reconcile whenever the protected file changes.
//!
//! The subscription is on the parent directory, filtered to the file name,
//! so replacing the inode does not lose the watch. Remounting the overlay
//! can still silently kill an inotify subscription; the watcher compares
//! the mount identity every `rearm_interval` and re-subscribes when it
//! moved.

use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::time::{Duration, Instant};

use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use notify_debouncer_full::{DebounceEventResult, Debouncer, FileIdMap, new_debouncer};

use crate::context::GuardContext;
use crate::error::{GuardError, Result};
use crate::reconcile::{ReconcileReason, Reconciler};

const TICK: Duration = Duration::from_millis(200);

/// What identifies "the file we are watching" across remounts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MountIdentity {
    pub top_mount_id: Option<u64>,
    pub dev: u64,
    pub ino: u64,
}

pub struct ChangeWatcher {
    ctx: GuardContext,
}

impl ChangeWatcher {
    pub fn new(ctx: GuardContext) -> Self {
        Self { ctx }
    }

    /// Block until `shutdown` is set.
    pub fn run(&self, shutdown: &AtomicBool) -> Result<()> {
        if !self.ctx.config().watcher.enabled {
            tracing::info!("change watcher disabled in configuration");
            return Ok(());
        }

        let target = self.ctx.resource_path().to_path_buf();
        let rearm = self.ctx.config().rearm_interval();
        let (tx, rx) = mpsc::channel();
        let mut subscription: Option<Debouncer<RecommendedWatcher, FileIdMap>> = None;
        let mut identity = None;
        let mut last_check: Option<Instant> = None;

        tracing::info!("watching {}", target.display());
        while !shutdown.load(Ordering::SeqCst) {
            if subscription.is_none() || last_check.is_none_or(|at| at.elapsed() >= rearm) {
                last_check = Some(Instant::now());
                let current = self.identity();
                if subscription.is_none() || current != identity {
                    if subscription.is_some() {
                        tracing::info!("mount identity of {} changed; re-arming", target.display());
                    }
                    subscription = None;
                    match self.subscribe(&target, tx.clone()) {
                        Ok(debouncer) => {
                            subscription = Some(debouncer);
                            identity = current;
                            // Events may have been missed while unsubscribed.
                            self.reconcile("re-armed");
                        }
                        Err(err) => {
                            tracing::warn!("subscription failed, retrying in {rearm:?}: {err}");
                        }
                    }
                }
            }
            self.drain(&rx, &target)?;
        }
        tracing::info!("change watcher stopped");
        Ok(())
    }

    fn drain(&self, rx: &Receiver<DebounceEventResult>, target: &Path) -> Result<()> {
        match rx.recv_timeout(TICK) {
            Ok(Ok(events)) => {
                if events.iter().any(|e| is_relevant(&e.event, target)) {
                    self.reconcile("change event");
                }
                Ok(())
            }
            Ok(Err(errors)) => {
                for error in errors {
                    tracing::warn!("watcher error: {error}");
                }
                Ok(())
            }
            Err(RecvTimeoutError::Timeout) => Ok(()),
            Err(RecvTimeoutError::Disconnected) => Err(GuardError::Config(
                "watch event channel closed".to_string(),
            )),
        }
    }

    fn subscribe(
        &self,
        target: &Path,
        tx: Sender<DebounceEventResult>,
    ) -> notify::Result<Debouncer<RecommendedWatcher, FileIdMap>> {
        let dir = watch_dir(target);
        let mut debouncer = new_debouncer(self.ctx.config().debounce(), None, tx)?;
        debouncer
            .watcher()
            .watch(&dir, RecursiveMode::NonRecursive)?;
        tracing::debug!("subscribed to {}", dir.display());
        Ok(debouncer)
    }

    pub fn identity(&self) -> Option<MountIdentity> {
        let path = self.ctx.resource_path();
        let meta = std::fs::metadata(path).ok()?;
        let top_mount_id = self
            .ctx
            .overlay()
            .status(path)
            .ok()
            .and_then(|status| status.top_mount_id);
        Some(MountIdentity {
            top_mount_id,
            dev: meta.dev(),
            ino: meta.ino(),
        })
    }

    fn reconcile(&self, trigger: &str) {
        match Reconciler::new(&self.ctx).reconcile() {
            Ok(result) if result.changed => {
                tracing::warn!("{trigger}: {}", result.reason);
            }
            Ok(result) if result.reason == ReconcileReason::Suspended => {
                tracing::debug!("{trigger}: suspended");
            }
            Ok(_) => {}
            Err(err) => tracing::error!("{trigger}: reconcile failed: {err}"),
        }
    }
}

fn watch_dir(target: &Path) -> PathBuf {
    match target.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    }
}

/// Create/modify/remove events naming the protected file.
pub fn is_relevant(event: &Event, target: &Path) -> bool {
    let kind_matches = matches!(
        event.kind,
        EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
    );
    kind_matches
        && event
            .paths
            .iter()
            .any(|path| path == target || path.file_name() == target.file_name())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::Sandbox;
    use notify::event::{AccessKind, CreateKind, DataChange, ModifyKind, RemoveKind};
    use std::sync::Arc;

    fn event(kind: EventKind, path: &str) -> Event {
        Event::new(kind).add_path(PathBuf::from(path))
    }

    #[test]
    fn relevant_events_name_the_target() {
        let target = Path::new("/etc/hosts");
        assert!(is_relevant(
            &event(EventKind::Modify(ModifyKind::Data(DataChange::Any)), "/etc/hosts"),
            target
        ));
        assert!(is_relevant(
            &event(EventKind::Remove(RemoveKind::File), "/etc/hosts"),
            target
        ));
        assert!(is_relevant(
            &event(EventKind::Create(CreateKind::File), "/etc/hosts"),
            target
        ));
        assert!(!is_relevant(
            &event(EventKind::Create(CreateKind::File), "/etc/passwd"),
            target
        ));
        assert!(!is_relevant(
            &event(EventKind::Access(AccessKind::Read), "/etc/hosts"),
            target
        ));
    }

    #[test]
    fn identity_follows_the_top_mount() {
        let sandbox = Sandbox::new();
        sandbox.install(b"x\n");
        let watcher = ChangeWatcher::new(sandbox.context.clone());

        let before = watcher.identity().unwrap();
        assert_eq!(before.top_mount_id, None);
        sandbox.context.enforce().unwrap();
        let after = watcher.identity().unwrap();
        assert!(after.top_mount_id.is_some());
        assert_ne!(before, after);
    }

    #[test]
    fn disabled_watcher_returns_immediately() {
        let sandbox = Sandbox::with_config(|config| config.watcher.enabled = false);
        let shutdown = AtomicBool::new(false);
        ChangeWatcher::new(sandbox.context.clone())
            .run(&shutdown)
            .unwrap();
    }

    #[test]
    fn tamper_is_reverted_while_watching() {
        let sandbox = Sandbox::with_config(|config| {
            config.watcher.debounce_ms = 50;
            config.watcher.rearm_interval_secs = 1;
        });
        sandbox.install(b"0.0.0.0 example.com\n");

        let shutdown = Arc::new(AtomicBool::new(false));
        let handle = {
            let ctx = sandbox.context.clone();
            let shutdown = Arc::clone(&shutdown);
            std::thread::spawn(move || ChangeWatcher::new(ctx).run(&shutdown))
        };

        // The initial re-arm pass applies protections.
        let deadline = Instant::now() + Duration::from_secs(10);
        while sandbox.mounts.count(sandbox.resource()) == 0 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(20));
        }
        std::thread::sleep(Duration::from_millis(300));

        sandbox.tamper(b"");
        let deadline = Instant::now() + Duration::from_secs(10);
        while sandbox.live() != b"0.0.0.0 example.com\n" && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(50));
        }
        shutdown.store(true, Ordering::SeqCst);
        handle.join().unwrap().unwrap();
        assert_eq!(sandbox.live(), b"0.0.0.0 example.com\n");
    }
}
