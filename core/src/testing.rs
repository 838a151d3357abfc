//! In-memory backends so enforcement logic can be exercised without root.

#![allow(clippy::unwrap_used)]

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use crate::config::GuardConfig;
use crate::context::GuardContext;
use crate::error::{GuardError, Result};
use crate::mount::{MountBackend, MountLayer};
use crate::protection::ProtectionBackend;
use crate::surface::{ManagementSurface, SurfaceState};

#[derive(Debug, Default)]
pub struct FakeProtection {
    locked: Mutex<HashSet<PathBuf>>,
    unsupported: AtomicBool,
    pub lock_calls: AtomicUsize,
}

impl FakeProtection {
    /// Make every call fail as on a filesystem without the attribute.
    pub fn set_unsupported(&self, unsupported: bool) {
        self.unsupported.store(unsupported, Ordering::SeqCst);
    }

    /// Strip the lock behind the guard's back.
    pub fn strip(&self, path: &Path) {
        self.locked.lock().unwrap().remove(path);
    }

    fn check(&self, path: &Path) -> Result<()> {
        if self.unsupported.load(Ordering::SeqCst) {
            return Err(GuardError::AttributeUnsupported {
                path: path.to_path_buf(),
                source: std::io::Error::from_raw_os_error(libc::EOPNOTSUPP),
            });
        }
        Ok(())
    }
}

impl ProtectionBackend for FakeProtection {
    fn lock(&self, path: &Path) -> Result<()> {
        self.check(path)?;
        self.lock_calls.fetch_add(1, Ordering::SeqCst);
        self.locked.lock().unwrap().insert(path.to_path_buf());
        Ok(())
    }

    fn unlock(&self, path: &Path) -> Result<()> {
        self.check(path)?;
        self.locked.lock().unwrap().remove(path);
        Ok(())
    }

    fn is_locked(&self, path: &Path) -> bool {
        self.locked.lock().unwrap().contains(path)
    }

    fn name(&self) -> &'static str {
        "fake"
    }
}

/// Mount table keyed by path; each entry is a stack of layers.
#[derive(Debug, Default)]
pub struct FakeMounts {
    table: Mutex<HashMap<PathBuf, Vec<MountLayer>>>,
    next_id: AtomicU64,
    stuck: AtomicBool,
    fail_remount: AtomicBool,
}

impl FakeMounts {
    pub fn push_layer(&self, path: &Path, read_only: bool) {
        let mount_id = self.next_id.fetch_add(1, Ordering::SeqCst) + 100;
        self.table
            .lock()
            .unwrap()
            .entry(path.to_path_buf())
            .or_default()
            .push(MountLayer {
                mount_id,
                read_only,
            });
    }

    /// Refuse every unmount, as with a busy mount.
    pub fn set_stuck(&self, stuck: bool) {
        self.stuck.store(stuck, Ordering::SeqCst);
    }

    pub fn fail_remount(&self, fail: bool) {
        self.fail_remount.store(fail, Ordering::SeqCst);
    }

    pub fn count(&self, path: &Path) -> usize {
        self.table
            .lock()
            .unwrap()
            .get(path)
            .map_or(0, Vec::len)
    }
}

impl MountBackend for FakeMounts {
    fn layers(&self, path: &Path) -> Result<Vec<MountLayer>> {
        Ok(self
            .table
            .lock()
            .unwrap()
            .get(path)
            .cloned()
            .unwrap_or_default())
    }

    fn bind_to_self(&self, path: &Path) -> Result<()> {
        self.push_layer(path, false);
        Ok(())
    }

    fn remount_read_only(&self, path: &Path) -> Result<()> {
        if self.fail_remount.load(Ordering::SeqCst) {
            return Err(GuardError::io(
                path,
                std::io::Error::from_raw_os_error(libc::EPERM),
            ));
        }
        let mut table = self.table.lock().unwrap();
        match table.get_mut(path).and_then(|stack| stack.last_mut()) {
            Some(top) => {
                top.read_only = true;
                Ok(())
            }
            None => Err(GuardError::io(
                path,
                std::io::Error::from_raw_os_error(libc::EINVAL),
            )),
        }
    }

    fn detach(&self, path: &Path, _force: bool) -> Result<bool> {
        if self.stuck.load(Ordering::SeqCst) {
            return Err(GuardError::io(
                path,
                std::io::Error::from_raw_os_error(libc::EBUSY),
            ));
        }
        let mut table = self.table.lock().unwrap();
        Ok(table
            .get_mut(path)
            .and_then(|stack| stack.pop())
            .is_some())
    }
}

#[derive(Debug)]
pub struct FakeSurface {
    state: Mutex<SurfaceState>,
    pub reasserted: AtomicUsize,
    pub retired: AtomicUsize,
}

impl Default for FakeSurface {
    fn default() -> Self {
        Self {
            state: Mutex::new(SurfaceState::Enabled),
            reasserted: AtomicUsize::new(0),
            retired: AtomicUsize::new(0),
        }
    }
}

impl FakeSurface {
    /// Simulate the operator disabling the module through the surface.
    pub fn set_state(&self, state: SurfaceState) {
        *self.state.lock().unwrap() = state;
    }
}

impl ManagementSurface for FakeSurface {
    fn state(&self) -> Result<SurfaceState> {
        Ok(*self.state.lock().unwrap())
    }

    fn reassert(&self) -> Result<()> {
        self.reasserted.fetch_add(1, Ordering::SeqCst);
        *self.state.lock().unwrap() = SurfaceState::Enabled;
        Ok(())
    }

    fn retire(&self) -> Result<()> {
        self.retired.fetch_add(1, Ordering::SeqCst);
        *self.state.lock().unwrap() = SurfaceState::Disabled;
        Ok(())
    }

    fn describe(&self) -> String {
        "fake surface".to_string()
    }
}

/// A context rooted in a temporary directory with fake backends.
pub struct Sandbox {
    pub dir: tempfile::TempDir,
    pub protection: Arc<FakeProtection>,
    pub mounts: Arc<FakeMounts>,
    pub context: GuardContext,
}

impl Sandbox {
    pub fn new() -> Self {
        Self::with_config(|_| {})
    }

    pub fn with_config(adjust: impl FnOnce(&mut GuardConfig)) -> Self {
        let dir = tempfile::TempDir::new().unwrap();
        let mut config = GuardConfig::rooted_at(dir.path());
        config.unlock.cooldown_secs = 0;
        config.control.cooldown_secs = 0;
        adjust(&mut config);
        let protection = Arc::new(FakeProtection::default());
        let mounts = Arc::new(FakeMounts::default());
        let context = GuardContext::with_backends(config, protection.clone(), mounts.clone());
        Self {
            dir,
            protection,
            mounts,
            context,
        }
    }

    pub fn resource(&self) -> &Path {
        self.context.resource_path()
    }

    /// Write the live resource and take it as the canonical snapshot.
    pub fn install(&self, content: &[u8]) {
        std::fs::write(self.resource(), content).unwrap();
        self.context
            .canonical()
            .store(content, self.resource())
            .unwrap();
    }

    /// Overwrite the live resource as an operator with write access would.
    pub fn tamper(&self, content: &[u8]) {
        std::fs::write(self.resource(), content).unwrap();
    }

    pub fn live(&self) -> Vec<u8> {
        std::fs::read(self.resource()).unwrap()
    }
}

impl Default for Sandbox {
    fn default() -> Self {
        Self::new()
    }
}

/// Records requested delays instead of sleeping.
#[derive(Debug, Default)]
pub struct RecordingSleeper {
    slept: Mutex<Vec<std::time::Duration>>,
}

impl RecordingSleeper {
    pub fn slept(&self) -> Vec<std::time::Duration> {
        self.slept.lock().unwrap().clone()
    }
}

impl crate::unlock::Sleeper for RecordingSleeper {
    fn sleep(&self, duration: std::time::Duration) {
        self.slept.lock().unwrap().push(duration);
    }
}
