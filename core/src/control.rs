//! Control State: the ENABLED/DISABLED flag gating enforcement.
//!
//! Stored as a single ASCII token. Readers never fail: a missing file or an
//! unknown token both read as [`ControlState::Enabled`].

use std::fmt;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use fs2::FileExt;
use serde::{Deserialize, Serialize};

use crate::error::{GuardError, Result};
use crate::fsutil;
use crate::protection::ProtectionBackend;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ControlState {
    Enabled,
    Disabled,
}

impl ControlState {
    pub fn as_token(self) -> &'static str {
        match self {
            ControlState::Enabled => "ENABLED",
            ControlState::Disabled => "DISABLED",
        }
    }

    pub fn is_enabled(self) -> bool {
        self == ControlState::Enabled
    }
}

impl fmt::Display for ControlState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_token())
    }
}

impl FromStr for ControlState {
    type Err = GuardError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim() {
            "ENABLED" => Ok(ControlState::Enabled),
            "DISABLED" => Ok(ControlState::Disabled),
            other => Err(GuardError::ControlStateMalformed(other.to_string())),
        }
    }
}

/// File-backed store for [`ControlState`].
///
/// With a protection backend attached, a locked control file is unlocked
/// for the write and locked again afterwards.
#[derive(Clone)]
pub struct ControlStore {
    path: PathBuf,
    protection: Option<Arc<dyn ProtectionBackend>>,
}

impl fmt::Debug for ControlStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ControlStore")
            .field("path", &self.path)
            .field("protection", &self.protection.as_ref().map(|p| p.name()))
            .finish()
    }
}

impl ControlStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            protection: None,
        }
    }

    pub fn with_protection(mut self, protection: Arc<dyn ProtectionBackend>) -> Self {
        self.protection = Some(protection);
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current state, failing safe to `Enabled`.
    pub fn read(&self) -> ControlState {
        match std::fs::read_to_string(&self.path) {
            Ok(text) => text.parse().unwrap_or_else(|err: GuardError| {
                tracing::warn!("{err}; treating control state as ENABLED");
                ControlState::Enabled
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => ControlState::Enabled,
            Err(e) => {
                tracing::warn!(
                    "cannot read control state {}: {e}; treating as ENABLED",
                    self.path.display()
                );
                ControlState::Enabled
            }
        }
    }

    /// Write `state`, serialising writers through an exclusive lock on a
    /// sibling `.lock` file. Fails without writing when the control file is
    /// locked and the lock cannot be lifted.
    pub fn write(&self, state: ControlState) -> Result<()> {
        let lock_path = self.lock_path();
        if let Some(parent) = lock_path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| GuardError::io(parent, e))?;
        }
        let lock = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&lock_path)
            .map_err(|e| GuardError::io(&lock_path, e))?;
        lock.lock_exclusive()
            .map_err(|e| GuardError::io(&lock_path, e))?;

        let result = self.write_locked(state);
        if let Err(e) = lock.unlock() {
            tracing::debug!("releasing {} failed: {e}", lock_path.display());
        }
        result
    }

    fn write_locked(&self, state: ControlState) -> Result<()> {
        let protection = self
            .protection
            .as_deref()
            .filter(|protection| protection.is_locked(&self.path));
        if let Some(protection) = protection {
            protection.unlock(&self.path)?;
        }
        let result = fsutil::atomic_write(&self.path, format!("{}\n", state.as_token()).as_bytes());
        if let Some(protection) = protection
            && let Err(err) = protection.lock(&self.path)
        {
            tracing::warn!("re-locking {}: {err}", self.path.display());
        }
        result
    }

    fn lock_path(&self) -> PathBuf {
        let mut name = self.path.as_os_str().to_owned();
        name.push(".lock");
        PathBuf::from(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeProtection;
    use pretty_assertions::assert_eq;

    #[test]
    fn absent_file_reads_enabled() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = ControlStore::new(dir.path().join("control"));
        assert_eq!(store.read(), ControlState::Enabled);
    }

    #[test]
    fn malformed_token_reads_enabled() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("control");
        std::fs::write(&path, "disabled-ish\n").unwrap();
        assert_eq!(ControlStore::new(&path).read(), ControlState::Enabled);

        std::fs::write(&path, "").unwrap();
        assert_eq!(ControlStore::new(&path).read(), ControlState::Enabled);
    }

    #[test]
    fn lowercase_token_is_malformed() {
        let err = "disabled".parse::<ControlState>().unwrap_err();
        assert!(matches!(err, GuardError::ControlStateMalformed(_)));
    }

    #[test]
    fn write_then_read() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = ControlStore::new(dir.path().join("state").join("control"));
        store.write(ControlState::Disabled).unwrap();
        assert_eq!(store.read(), ControlState::Disabled);
        assert_eq!(
            std::fs::read_to_string(store.path()).unwrap(),
            "DISABLED\n"
        );
        store.write(ControlState::Enabled).unwrap();
        assert_eq!(store.read(), ControlState::Enabled);
    }

    #[test]
    fn locked_file_is_relocked_after_write() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("control");
        let protection = Arc::new(FakeProtection::default());
        let store = ControlStore::new(&path).with_protection(protection.clone());
        store.write(ControlState::Enabled).unwrap();
        protection.lock(&path).unwrap();

        store.write(ControlState::Disabled).unwrap();
        assert_eq!(store.read(), ControlState::Disabled);
        assert!(protection.is_locked(&path));
    }

    #[test]
    fn locked_file_refuses_write_when_lock_cannot_be_lifted() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("control");
        let protection = Arc::new(FakeProtection::default());
        let store = ControlStore::new(&path).with_protection(protection.clone());
        store.write(ControlState::Enabled).unwrap();
        protection.lock(&path).unwrap();
        protection.set_unsupported(true);

        let err = store.write(ControlState::Disabled).unwrap_err();
        assert!(matches!(err, GuardError::AttributeUnsupported { .. }));
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "ENABLED\n");
    }
}
