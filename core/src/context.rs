//! Wiring shared by every entry point: configuration, state layout and the
//! two enforcement backends.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::audit::AuditLog;
use crate::canonical::CanonicalStore;
use crate::config::GuardConfig;
use crate::control::ControlStore;
use crate::error::Result;
use crate::integrity::IntegrityStore;
use crate::mount::{LinuxMounts, MountBackend, MountOverlay};
use crate::protection::{
    AttributeBackend, PermissionBackend, ProtectionBackend, lock_best_effort, unlock_best_effort,
};
use crate::suspend::{MaintenanceLock, SuspensionRegistry};

/// Paths under `state_dir`.
#[derive(Debug, Clone)]
pub struct StateLayout {
    root: PathBuf,
}

impl StateLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn canonical_dir(&self) -> PathBuf {
        self.root.join("canonical")
    }

    pub fn control_path(&self) -> PathBuf {
        self.root.join("control")
    }

    pub fn integrity_path(&self) -> PathBuf {
        self.root.join("integrity.json")
    }

    pub fn backups_dir(&self) -> PathBuf {
        self.root.join("policy-backups")
    }

    pub fn suspend_dir(&self) -> PathBuf {
        self.root.join("suspend")
    }

    pub fn maintenance_lock_path(&self) -> PathBuf {
        self.root.join("maintenance.lock")
    }

    pub fn sessions_path(&self) -> PathBuf {
        self.root.join("sessions.jsonl")
    }
}

/// What [`GuardContext::enforce`] had to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Enforcement {
    /// False when protections were already in place and nothing was touched.
    pub reapplied: bool,
    pub layers_removed: usize,
}

#[derive(Clone)]
pub struct GuardContext {
    config: Arc<GuardConfig>,
    layout: StateLayout,
    protection: Arc<dyn ProtectionBackend>,
    overlay: MountOverlay,
    audit: AuditLog,
    attribute_unsupported: Arc<AtomicBool>,
}

impl GuardContext {
    /// Context using the real attribute and mount backends.
    pub fn system(config: GuardConfig) -> Self {
        let protection: Arc<dyn ProtectionBackend> = if config.protection.immutable {
            Arc::new(AttributeBackend::new(config.protection.mode))
        } else {
            Arc::new(PermissionBackend::new(config.protection.mode))
        };
        Self::with_backends(config, protection, Arc::new(LinuxMounts::default()))
    }

    pub fn with_backends(
        config: GuardConfig,
        protection: Arc<dyn ProtectionBackend>,
        mounts: Arc<dyn MountBackend>,
    ) -> Self {
        let overlay = MountOverlay::new(mounts, config.protection.collapse_attempts);
        Self {
            layout: StateLayout::new(&config.state_dir),
            audit: AuditLog::new(&config.audit.path),
            config: Arc::new(config),
            protection,
            overlay,
            attribute_unsupported: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn config(&self) -> &GuardConfig {
        &self.config
    }

    pub fn layout(&self) -> &StateLayout {
        &self.layout
    }

    pub fn resource_path(&self) -> &Path {
        &self.config.resource.path
    }

    pub fn protection(&self) -> &dyn ProtectionBackend {
        self.protection.as_ref()
    }

    pub fn overlay(&self) -> &MountOverlay {
        &self.overlay
    }

    pub fn audit(&self) -> &AuditLog {
        &self.audit
    }

    pub fn canonical(&self) -> CanonicalStore {
        CanonicalStore::new(self.layout.canonical_dir())
    }

    pub fn control(&self) -> ControlStore {
        ControlStore::new(self.layout.control_path()).with_protection(Arc::clone(&self.protection))
    }

    pub fn integrity(&self) -> IntegrityStore {
        IntegrityStore::new(self.layout.integrity_path(), self.layout.backups_dir())
    }

    pub fn suspensions(&self) -> SuspensionRegistry {
        SuspensionRegistry::new(
            self.layout.suspend_dir(),
            self.config.transaction_stale_after(),
        )
    }

    pub fn maintenance_lock(&self) -> Result<MaintenanceLock> {
        MaintenanceLock::try_acquire(&self.layout.maintenance_lock_path())
    }

    /// Whether the resource currently carries every configured protection.
    pub fn is_protected(&self) -> Result<bool> {
        let path = self.resource_path();
        let status = self.overlay.status(path)?;
        let mounts_ok = if self.config.protection.bind_mount {
            status.is_enforced()
        } else {
            status.layers == 0
        };
        let attribute_ok =
            self.protection.is_locked(path) || self.attribute_unsupported.load(Ordering::Relaxed);
        Ok(mounts_ok && attribute_ok)
    }

    /// Bring the resource to exactly one read-only layer over a locked
    /// file. A no-op when that already holds.
    pub fn enforce(&self) -> Result<Enforcement> {
        if self.is_protected()? {
            return Ok(Enforcement {
                reapplied: false,
                layers_removed: 0,
            });
        }

        let path = self.resource_path();
        // The attribute cannot be changed through a read-only mount, so the
        // overlay comes off first.
        let layers_removed = self.overlay.collapse_to_zero(path)?;
        match self.protection.lock(path) {
            Ok(()) => {}
            Err(err) if err.is_best_effort() => {
                tracing::warn!("{err}; relying on the mount overlay");
                self.attribute_unsupported.store(true, Ordering::Relaxed);
            }
            Err(err) => tracing::warn!("{} lock failed: {err}", self.protection.name()),
        }
        if self.config.protection.bind_mount {
            self.overlay.apply_read_only_layer(path)?;
        }
        Ok(Enforcement {
            reapplied: true,
            layers_removed,
        })
    }

    /// Remove the overlay and the attribute so the resource can be written.
    pub fn release(&self) -> Result<usize> {
        let path = self.resource_path();
        let removed = self.overlay.collapse_to_zero(path)?;
        unlock_best_effort(self.protection(), path);
        Ok(removed)
    }

    /// Files the guard keeps for itself: the canonical store, the control
    /// state and the integrity record with its backups.
    pub fn state_files(&self) -> Vec<PathBuf> {
        let mut files = self.canonical().files().to_vec();
        files.push(self.layout.control_path());
        files.extend(self.integrity().state_files());
        files
    }

    /// Lock the state files, best effort.
    pub fn lock_state_files(&self) {
        for file in self.state_files() {
            if file.exists() {
                lock_best_effort(self.protection(), &file);
            }
        }
    }

    pub fn unlock_state_files(&self) {
        for file in self.state_files() {
            unlock_best_effort(self.protection(), &file);
        }
    }
}
