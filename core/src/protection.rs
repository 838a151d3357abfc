//! Protection Backend: OS-level write barriers on a single file.
//!
//! `lock` and `unlock` are idempotent. Attribute failures are best effort;
//! the mount overlay is the redundant barrier.

use std::fs::{File, OpenOptions};
use std::os::fd::AsRawFd;
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
use std::path::Path;

use crate::error::{GuardError, Result};

pub trait ProtectionBackend: Send + Sync {
    /// Apply the write barrier. Locking a locked file is a no-op.
    fn lock(&self, path: &Path) -> Result<()>;

    /// Remove the write barrier. Unlocking an unlocked file succeeds.
    fn unlock(&self, path: &Path) -> Result<()>;

    fn is_locked(&self, path: &Path) -> bool;

    fn name(&self) -> &'static str;
}

const FS_IMMUTABLE_FL: libc::c_int = 0x0000_0010;

// _IOR('f', 1, long) / _IOW('f', 2, long); the size field follows `long`.
#[cfg(target_pointer_width = "64")]
const FS_IOC_GETFLAGS: libc::c_ulong = 0x8008_6601;
#[cfg(target_pointer_width = "64")]
const FS_IOC_SETFLAGS: libc::c_ulong = 0x4008_6602;
#[cfg(target_pointer_width = "32")]
const FS_IOC_GETFLAGS: libc::c_ulong = 0x8004_6601;
#[cfg(target_pointer_width = "32")]
const FS_IOC_SETFLAGS: libc::c_ulong = 0x4004_6602;

/// Immutability attribute (`chattr +i`) plus permission bits.
#[derive(Debug, Clone)]
pub struct AttributeBackend {
    mode: u32,
}

impl AttributeBackend {
    pub fn new(mode: u32) -> Self {
        Self { mode }
    }

    fn open(path: &Path) -> Result<File> {
        OpenOptions::new()
            .read(true)
            .custom_flags(libc::O_NONBLOCK | libc::O_NOFOLLOW)
            .open(path)
            .map_err(|e| GuardError::io(path, e))
    }

    fn get_flags(path: &Path, file: &File) -> Result<libc::c_int> {
        let mut flags: libc::c_int = 0;
        // SAFETY: the fd is open for the duration of the call and `flags`
        // outlives it.
        let rc = unsafe {
            libc::ioctl(
                file.as_raw_fd(),
                FS_IOC_GETFLAGS as _,
                &mut flags as *mut libc::c_int,
            )
        };
        if rc != 0 {
            return Err(attribute_error(path, std::io::Error::last_os_error()));
        }
        Ok(flags)
    }

    fn set_flags(path: &Path, file: &File, flags: libc::c_int) -> Result<()> {
        // SAFETY: as in `get_flags`; the kernel only reads `flags`.
        let rc = unsafe {
            libc::ioctl(
                file.as_raw_fd(),
                FS_IOC_SETFLAGS as _,
                &flags as *const libc::c_int,
            )
        };
        if rc != 0 {
            return Err(attribute_error(path, std::io::Error::last_os_error()));
        }
        Ok(())
    }

    fn mode_matches(&self, path: &Path) -> Result<bool> {
        let meta = std::fs::metadata(path).map_err(|e| GuardError::io(path, e))?;
        Ok(meta.permissions().mode() & 0o7777 == self.mode)
    }
}

impl ProtectionBackend for AttributeBackend {
    fn lock(&self, path: &Path) -> Result<()> {
        let file = Self::open(path)?;
        let flags = Self::get_flags(path, &file)?;
        let immutable = flags & FS_IMMUTABLE_FL != 0;
        let mode_ok = self.mode_matches(path)?;
        if immutable && mode_ok {
            return Ok(());
        }

        if immutable {
            // chmod is refused on immutable inodes.
            Self::set_flags(path, &file, flags & !FS_IMMUTABLE_FL)?;
        }
        if !mode_ok {
            tracing::info!("resetting mode of {} to {:o}", path.display(), self.mode);
            std::fs::set_permissions(path, std::fs::Permissions::from_mode(self.mode))
                .map_err(|e| GuardError::io(path, e))?;
        }
        Self::set_flags(path, &file, flags | FS_IMMUTABLE_FL)?;
        tracing::debug!("immutable attribute set on {}", path.display());
        Ok(())
    }

    fn unlock(&self, path: &Path) -> Result<()> {
        let file = match Self::open(path) {
            Ok(file) => file,
            Err(GuardError::Io { source, .. }) if source.kind() == std::io::ErrorKind::NotFound => {
                return Ok(());
            }
            Err(err) => return Err(err),
        };
        let flags = Self::get_flags(path, &file)?;
        if flags & FS_IMMUTABLE_FL == 0 {
            return Ok(());
        }
        Self::set_flags(path, &file, flags & !FS_IMMUTABLE_FL)?;
        tracing::debug!("immutable attribute cleared on {}", path.display());
        Ok(())
    }

    fn is_locked(&self, path: &Path) -> bool {
        Self::open(path)
            .and_then(|file| Self::get_flags(path, &file))
            .map(|flags| flags & FS_IMMUTABLE_FL != 0)
            .unwrap_or(false)
    }

    fn name(&self) -> &'static str {
        "immutable-attribute"
    }
}

/// Used when the attribute is disabled in configuration: only permission
/// bits are enforced.
#[derive(Debug, Clone)]
pub struct PermissionBackend {
    mode: u32,
}

impl PermissionBackend {
    pub fn new(mode: u32) -> Self {
        Self { mode }
    }
}

impl ProtectionBackend for PermissionBackend {
    fn lock(&self, path: &Path) -> Result<()> {
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(self.mode))
            .map_err(|e| GuardError::io(path, e))
    }

    fn unlock(&self, _path: &Path) -> Result<()> {
        Ok(())
    }

    fn is_locked(&self, path: &Path) -> bool {
        std::fs::metadata(path)
            .map(|meta| meta.permissions().mode() & 0o7777 == self.mode)
            .unwrap_or(false)
    }

    fn name(&self) -> &'static str {
        "permissions"
    }
}

fn attribute_error(path: &Path, err: std::io::Error) -> GuardError {
    match err.raw_os_error() {
        Some(libc::ENOTTY) | Some(libc::EOPNOTSUPP) | Some(libc::EINVAL) => {
            GuardError::AttributeUnsupported {
                path: path.to_path_buf(),
                source: err,
            }
        }
        _ => GuardError::io(path, err),
    }
}

/// Lock `path`, downgrading any failure to a warning.
pub fn lock_best_effort(backend: &dyn ProtectionBackend, path: &Path) -> bool {
    match backend.lock(path) {
        Ok(()) => true,
        Err(err) if err.is_best_effort() => {
            tracing::warn!("{err}; relying on the mount overlay");
            false
        }
        Err(err) => {
            tracing::warn!("{} lock failed on {}: {err}", backend.name(), path.display());
            false
        }
    }
}

/// Unlock `path`, downgrading any failure to a warning.
pub fn unlock_best_effort(backend: &dyn ProtectionBackend, path: &Path) -> bool {
    match backend.unlock(path) {
        Ok(()) => true,
        Err(err) => {
            tracing::warn!("{} unlock failed on {}: {err}", backend.name(), path.display());
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unsupported_errno_maps_to_attribute_unsupported() {
        let err = attribute_error(
            Path::new("/tmp/x"),
            std::io::Error::from_raw_os_error(libc::ENOTTY),
        );
        assert!(err.is_best_effort());
        let err = attribute_error(
            Path::new("/tmp/x"),
            std::io::Error::from_raw_os_error(libc::EPERM),
        );
        assert!(matches!(err, GuardError::Io { .. }));
    }

    #[test]
    fn permission_backend_sets_mode() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("hosts");
        std::fs::write(&path, "x").unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o666)).unwrap();

        let backend = PermissionBackend::new(0o644);
        assert!(!backend.is_locked(&path));
        backend.lock(&path).unwrap();
        assert!(backend.is_locked(&path));
        backend.lock(&path).unwrap();
        backend.unlock(&path).unwrap();
        backend.unlock(&path).unwrap();
    }

    #[test]
    fn attribute_unlock_of_missing_file_succeeds() {
        let dir = tempfile::TempDir::new().unwrap();
        let backend = AttributeBackend::new(0o644);
        backend.unlock(&dir.path().join("absent")).unwrap();
        assert!(!backend.is_locked(&dir.path().join("absent")));
    }
}
