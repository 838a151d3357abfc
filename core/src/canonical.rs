//! Canonical Store: the single approved copy of the protected resource.
//!
//! ## Layout
//!
//! ```text
//! <state_dir>/canonical/
//!   content          approved bytes
//!   content.sha256   hex digest of `content`
//!   meta.json        { created_at, updated_at, source_path }
//! ```
//!
//! Consumers compare raw bytes against `content`; the digest file is only a
//! cross-check and is never trusted on its own.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{GuardError, Result};
use crate::fsutil::{self, sha256_hex};

/// The live, operator-writable resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtectedResource {
    pub path: PathBuf,
    /// `None` when the file does not exist.
    pub current_content_hash: Option<String>,
}

impl ProtectedResource {
    pub fn inspect(path: &Path) -> Result<Self> {
        let current_content_hash = fsutil::read_optional(path)?.map(|data| sha256_hex(&data));
        Ok(Self {
            path: path.to_path_buf(),
            current_content_hash,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CanonicalSnapshot {
    pub content_bytes: Vec<u8>,
    pub content_hash: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SnapshotMeta {
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    source_path: PathBuf,
}

/// A loaded snapshot plus the result of the digest cross-check.
#[derive(Debug, Clone)]
pub struct LoadedSnapshot {
    pub snapshot: CanonicalSnapshot,
    /// False when `content.sha256` is missing or disagrees with `content`.
    pub digest_matches: bool,
}

#[derive(Debug, Clone)]
pub struct CanonicalStore {
    dir: PathBuf,
}

impl CanonicalStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn content_path(&self) -> PathBuf {
        self.dir.join("content")
    }

    pub fn digest_path(&self) -> PathBuf {
        self.dir.join("content.sha256")
    }

    fn meta_path(&self) -> PathBuf {
        self.dir.join("meta.json")
    }

    pub fn exists(&self) -> bool {
        self.content_path().exists()
    }

    /// Load the snapshot, or `None` when the guard was never set up.
    pub fn load(&self) -> Result<Option<LoadedSnapshot>> {
        let Some(content_bytes) = fsutil::read_optional(&self.content_path())? else {
            return Ok(None);
        };
        let content_hash = sha256_hex(&content_bytes);

        let digest_matches = fsutil::read_optional(&self.digest_path())?
            .map(|raw| String::from_utf8_lossy(&raw).trim().eq_ignore_ascii_case(&content_hash))
            .unwrap_or(false);

        let created_at = match fsutil::read_optional(&self.meta_path())? {
            Some(raw) => match serde_json::from_slice::<SnapshotMeta>(&raw) {
                Ok(meta) => meta.created_at,
                Err(e) => {
                    tracing::warn!("unreadable canonical metadata: {e}");
                    Utc::now()
                }
            },
            None => Utc::now(),
        };

        Ok(Some(LoadedSnapshot {
            snapshot: CanonicalSnapshot {
                content_bytes,
                content_hash,
                created_at,
            },
            digest_matches,
        }))
    }

    /// Load the snapshot, treating absence as [`GuardError::ConfigMissing`].
    pub fn require(&self) -> Result<LoadedSnapshot> {
        self.load()?
            .ok_or_else(|| GuardError::ConfigMissing(self.content_path()))
    }

    /// Store `content` as the approved copy. Keeps the original
    /// `created_at` when a snapshot already exists.
    pub fn store(&self, content: &[u8], source_path: &Path) -> Result<CanonicalSnapshot> {
        std::fs::create_dir_all(&self.dir).map_err(|e| GuardError::io(&self.dir, e))?;
        let now = Utc::now();
        let created_at = fsutil::read_optional(&self.meta_path())?
            .and_then(|raw| serde_json::from_slice::<SnapshotMeta>(&raw).ok())
            .map(|meta| meta.created_at)
            .unwrap_or(now);

        let content_hash = sha256_hex(content);
        fsutil::atomic_write(&self.content_path(), content)?;
        fsutil::atomic_write(&self.digest_path(), format!("{content_hash}\n").as_bytes())?;
        let meta = SnapshotMeta {
            created_at,
            updated_at: now,
            source_path: source_path.to_path_buf(),
        };
        fsutil::atomic_write(&self.meta_path(), &serde_json::to_vec_pretty(&meta)?)?;

        Ok(CanonicalSnapshot {
            content_bytes: content.to_vec(),
            content_hash,
            created_at,
        })
    }

    /// Paths making up the store, for attribute locking.
    pub fn files(&self) -> [PathBuf; 3] {
        [self.content_path(), self.digest_path(), self.meta_path()]
    }
}
