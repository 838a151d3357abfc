//! Small filesystem helpers shared by the file-backed stores.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;

use sha2::{Digest, Sha256};

use crate::error::{GuardError, Result};

/// Hex-encoded SHA-256 of `data`.
pub(crate) fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Atomically write `data` to `path` via a `.tmp` sibling.
pub(crate) fn atomic_write(path: &Path, data: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| GuardError::io(parent, e))?;
    }
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = std::path::PathBuf::from(tmp);
    {
        let mut file = std::fs::File::create(&tmp).map_err(|e| GuardError::io(&tmp, e))?;
        file.write_all(data).map_err(|e| GuardError::io(&tmp, e))?;
        file.sync_all().map_err(|e| GuardError::io(&tmp, e))?;
    }
    std::fs::rename(&tmp, path).map_err(|e| GuardError::io(path, e))?;
    Ok(())
}

/// Overwrite `path` in place, keeping its inode (and any watch on it).
pub(crate) fn write_in_place(path: &Path, data: &[u8]) -> Result<()> {
    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)
        .map_err(|e| GuardError::io(path, e))?;
    file.write_all(data).map_err(|e| GuardError::io(path, e))?;
    file.sync_all().map_err(|e| GuardError::io(path, e))?;
    Ok(())
}

/// Read a file, mapping "not found" to `None`.
pub(crate) fn read_optional(path: &Path) -> Result<Option<Vec<u8>>> {
    match std::fs::read(path) {
        Ok(data) => Ok(Some(data)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(GuardError::io(path, e)),
    }
}

/// Append one line to `path`, creating it (and its parent) when missing.
pub(crate) fn append_line(path: &Path, line: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| GuardError::io(parent, e))?;
    }
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| GuardError::io(path, e))?;
    writeln!(file, "{line}").map_err(|e| GuardError::io(path, e))?;
    Ok(())
}
