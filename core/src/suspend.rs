//! Suspension markers and the maintenance lock.
//!
//! A marker under `<state_dir>/suspend/<kind>` announces that a legitimate
//! maintenance window owns the resource; the watcher, watchdog and timer
//! skip reconciliation while one is active. The maintenance lock is the only
//! exclusive section in the system and keeps unlock sessions and package
//! transactions apart.

use std::fmt;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};

use crate::error::{GuardError, Result};
use crate::fsutil;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SuspendKind {
    Transaction,
    Unlock,
}

impl SuspendKind {
    pub const ALL: [SuspendKind; 2] = [SuspendKind::Transaction, SuspendKind::Unlock];

    pub fn as_str(self) -> &'static str {
        match self {
            SuspendKind::Transaction => "transaction",
            SuspendKind::Unlock => "unlock",
        }
    }
}

impl fmt::Display for SuspendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SuspensionMarker {
    pub kind: SuspendKind,
    pub pid: u32,
    pub reason: String,
    pub started_at: DateTime<Utc>,
}

impl SuspensionMarker {
    pub fn new(kind: SuspendKind, reason: impl Into<String>) -> Self {
        Self {
            kind,
            pid: std::process::id(),
            reason: reason.into(),
            started_at: Utc::now(),
        }
    }

    pub fn age(&self) -> Duration {
        (Utc::now() - self.started_at).to_std().unwrap_or_default()
    }

    /// Unlock sessions live in a single process; a marker left by a dead
    /// one no longer suspends anything.
    fn owner_alive(&self) -> bool {
        if self.kind != SuspendKind::Unlock {
            return true;
        }
        let Ok(pid) = libc::pid_t::try_from(self.pid) else {
            return false;
        };
        // SAFETY: signal 0 only checks for existence and permission.
        let rc = unsafe { libc::kill(pid, 0) };
        rc == 0 || std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
    }
}

#[derive(Debug, Clone)]
pub struct SuspensionRegistry {
    dir: PathBuf,
    stale_after: Duration,
}

impl SuspensionRegistry {
    pub fn new(dir: impl Into<PathBuf>, stale_after: Duration) -> Self {
        Self {
            dir: dir.into(),
            stale_after,
        }
    }

    pub fn marker_path(&self, kind: SuspendKind) -> PathBuf {
        self.dir.join(kind.as_str())
    }

    pub fn suspend(&self, kind: SuspendKind, reason: &str) -> Result<SuspensionMarker> {
        let marker = SuspensionMarker::new(kind, reason);
        fsutil::atomic_write(&self.marker_path(kind), &serde_json::to_vec_pretty(&marker)?)?;
        tracing::info!("{kind} suspension started: {reason}");
        Ok(marker)
    }

    /// Remove the marker. Returns whether one was present.
    pub fn resume(&self, kind: SuspendKind) -> Result<bool> {
        let path = self.marker_path(kind);
        match std::fs::remove_file(&path) {
            Ok(()) => {
                tracing::info!("{kind} suspension cleared");
                Ok(true)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(GuardError::io(path, e)),
        }
    }

    /// The marker on disk, whether or not it still applies.
    pub fn get(&self, kind: SuspendKind) -> Option<SuspensionMarker> {
        let path = self.marker_path(kind);
        let raw = match fsutil::read_optional(&path) {
            Ok(raw) => raw?,
            Err(err) => {
                tracing::warn!("{err}");
                return None;
            }
        };
        match serde_json::from_slice(&raw) {
            Ok(marker) => Some(marker),
            Err(e) => {
                tracing::warn!("ignoring unreadable marker {}: {e}", path.display());
                None
            }
        }
    }

    /// The marker for `kind` when it is present, fresh and owned.
    pub fn active(&self, kind: SuspendKind) -> Option<SuspensionMarker> {
        let marker = self.get(kind)?;
        if marker.age() > self.stale_after {
            tracing::warn!(
                "ignoring stale {kind} marker from pid {} started {}",
                marker.pid,
                marker.started_at.to_rfc3339()
            );
            return None;
        }
        if !marker.owner_alive() {
            tracing::warn!("ignoring {kind} marker of exited pid {}", marker.pid);
            return None;
        }
        Some(marker)
    }

    /// First active marker not owned by `owner`.
    pub fn blocking(&self, owner: Option<SuspendKind>) -> Option<SuspensionMarker> {
        SuspendKind::ALL
            .into_iter()
            .filter(|kind| Some(*kind) != owner)
            .find_map(|kind| self.active(kind))
    }
}

/// Exclusive advisory lock held for a whole maintenance window. Released
/// on drop.
#[derive(Debug)]
pub struct MaintenanceLock {
    file: File,
    path: PathBuf,
}

impl MaintenanceLock {
    pub fn try_acquire(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| GuardError::io(parent, e))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(path)
            .map_err(|e| GuardError::io(path, e))?;
        match file.try_lock_exclusive() {
            Ok(()) => Ok(Self {
                file,
                path: path.to_path_buf(),
            }),
            Err(e) if e.kind() == fs2::lock_contended_error().kind() => {
                Err(GuardError::MaintenanceBusy(format!(
                    "{} is held by another process",
                    path.display()
                )))
            }
            Err(e) => Err(GuardError::io(path, e)),
        }
    }
}

impl Drop for MaintenanceLock {
    fn drop(&mut self) {
        if let Err(e) = FileExt::unlock(&self.file) {
            tracing::warn!("releasing {} failed: {e}", self.path.display());
        }
    }
}
