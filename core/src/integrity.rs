//! Integrity Record for the policy files enforcement depends on.
//!
//! Each recorded file has a digest and a private backup copy under
//! `<state_dir>/policy-backups/`. A mismatch is tamper evidence: the file is
//! restored from its backup, never treated as a crash.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{GuardError, Result};
use crate::fsutil::{self, sha256_hex};
use crate::protection::ProtectionBackend;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntegrityEntry {
    pub sha256: String,
    /// Backup file name inside the backups directory.
    pub backup: String,
}

/// `file_path → sha256` for each policy file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntegrityRecord {
    pub files: BTreeMap<PathBuf, IntegrityEntry>,
}

/// Outcome of one verification pass.
#[derive(Debug, Default)]
pub struct IntegrityReport {
    pub restored: Vec<PathBuf>,
    /// Mismatches that could not be repaired (backup missing or altered).
    pub unrecoverable: Vec<GuardError>,
}

impl IntegrityReport {
    pub fn tampered(&self) -> bool {
        !self.restored.is_empty() || !self.unrecoverable.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct IntegrityStore {
    record_path: PathBuf,
    backups_dir: PathBuf,
}

impl IntegrityStore {
    pub fn new(record_path: impl Into<PathBuf>, backups_dir: impl Into<PathBuf>) -> Self {
        Self {
            record_path: record_path.into(),
            backups_dir: backups_dir.into(),
        }
    }

    pub fn backups_dir(&self) -> &Path {
        &self.backups_dir
    }

    pub fn record_path(&self) -> &Path {
        &self.record_path
    }

    /// Recorded entries; an absent record means nothing to verify.
    pub fn load(&self) -> Result<IntegrityRecord> {
        match fsutil::read_optional(&self.record_path)? {
            Some(raw) => serde_json::from_slice(&raw).map_err(|err| GuardError::IntegrityMismatch {
                path: self.record_path.clone(),
                expected: "a valid integrity record".to_string(),
                actual: err.to_string(),
            }),
            None => Ok(IntegrityRecord::default()),
        }
    }

    /// Every file the store owns: the record itself and each backup.
    pub fn state_files(&self) -> Vec<PathBuf> {
        let mut files = vec![self.record_path.clone()];
        if let Ok(entries) = std::fs::read_dir(&self.backups_dir) {
            files.extend(
                entries
                    .filter_map(std::result::Result::ok)
                    .map(|entry| entry.path())
                    .filter(|path| path.is_file()),
            );
        }
        files
    }

    /// Hash and back up `files`, replacing any previous record.
    pub fn record(&self, files: &[PathBuf]) -> Result<IntegrityRecord> {
        std::fs::create_dir_all(&self.backups_dir)
            .map_err(|e| GuardError::io(&self.backups_dir, e))?;

        let mut record = IntegrityRecord::default();
        for path in files {
            let data = std::fs::read(path).map_err(|e| GuardError::io(path, e))?;
            let backup = backup_name(path);
            fsutil::atomic_write(&self.backups_dir.join(&backup), &data)?;
            record.files.insert(
                path.clone(),
                IntegrityEntry {
                    sha256: sha256_hex(&data),
                    backup,
                },
            );
        }
        fsutil::atomic_write(&self.record_path, &serde_json::to_vec_pretty(&record)?)?;
        Ok(record)
    }

    /// Recorded files whose current digest differs, without touching them.
    /// An unreadable record reports the record itself.
    pub fn mismatched(&self) -> Vec<PathBuf> {
        let Ok(record) = self.load() else {
            return vec![self.record_path.clone()];
        };
        record
            .files
            .iter()
            .filter(|(path, entry)| current_digest(path) != entry.sha256)
            .map(|(path, _)| path.clone())
            .collect()
    }

    /// Verify every recorded file, restoring mismatches from backup.
    ///
    /// Never fails: a corrupt record or an unreadable file is tamper
    /// evidence and lands in [`IntegrityReport::unrecoverable`].
    pub fn verify_and_restore(&self, protection: &dyn ProtectionBackend) -> IntegrityReport {
        let mut report = IntegrityReport::default();
        let record = match self.load() {
            Ok(record) => record,
            Err(err) => {
                tracing::error!("integrity record unusable: {err}");
                report.unrecoverable.push(err);
                return report;
            }
        };

        for (path, entry) in &record.files {
            let actual = match fsutil::read_optional(path) {
                Ok(data) => data
                    .map(|data| sha256_hex(&data))
                    .unwrap_or_else(|| MISSING.to_string()),
                Err(err) => {
                    tracing::error!("cannot read policy file {}: {err}", path.display());
                    report.unrecoverable.push(GuardError::IntegrityMismatch {
                        path: path.clone(),
                        expected: entry.sha256.clone(),
                        actual: err.to_string(),
                    });
                    continue;
                }
            };
            if actual == entry.sha256 {
                continue;
            }

            tracing::warn!(
                "policy file {} changed (expected {}, found {actual})",
                path.display(),
                entry.sha256
            );
            match self.restore(path, entry, protection) {
                Ok(()) => report.restored.push(path.clone()),
                Err(err) => {
                    tracing::error!("cannot restore {}: {err}", path.display());
                    report.unrecoverable.push(err);
                }
            }
        }
        report
    }

    fn restore(
        &self,
        path: &Path,
        entry: &IntegrityEntry,
        protection: &dyn ProtectionBackend,
    ) -> Result<()> {
        let backup_path = self.backups_dir.join(&entry.backup);
        let backup = std::fs::read(&backup_path).map_err(|e| GuardError::io(&backup_path, e))?;
        let backup_hash = sha256_hex(&backup);
        if backup_hash != entry.sha256 {
            return Err(GuardError::IntegrityMismatch {
                path: backup_path,
                expected: entry.sha256.clone(),
                actual: backup_hash,
            });
        }

        let was_locked = protection.is_locked(path);
        if was_locked && let Err(err) = protection.unlock(path) {
            tracing::warn!("unlocking {} before restore: {err}", path.display());
        }
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| GuardError::io(parent, e))?;
        }
        fsutil::write_in_place(path, &backup)?;
        if was_locked && let Err(err) = protection.lock(path) {
            tracing::warn!("re-locking {} after restore: {err}", path.display());
        }
        Ok(())
    }
}

const MISSING: &str = "<missing>";

fn current_digest(path: &Path) -> String {
    match fsutil::read_optional(path) {
        Ok(Some(data)) => sha256_hex(&data),
        Ok(None) => MISSING.to_string(),
        Err(err) => err.to_string(),
    }
}

/// Stable, collision-resistant backup file name for `path`.
fn backup_name(path: &Path) -> String {
    let digest = sha256_hex(path.as_os_str().as_encoded_bytes());
    let stem = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "policy".to_string());
    format!("{}-{stem}", &digest[..16])
}
