//! Mount Overlay Manager: at most one read-only bind mount over the
//! protected path.
//!
//! Every caller goes through [`MountOverlay::collapse_to_zero`] before
//! [`MountOverlay::apply_read_only_layer`], so layers never stack. When a
//! collapse cannot reach zero the overlay refuses to add a layer.

use std::ffi::CString;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::error::{GuardError, Result};

/// One mount stacked on the protected path, bottom first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountLayer {
    pub mount_id: u64,
    pub read_only: bool,
}

/// Raw mount primitives; [`MountOverlay`] owns the layering policy.
pub trait MountBackend: Send + Sync {
    /// Layers currently mounted on `path`, bottom first.
    fn layers(&self, path: &Path) -> Result<Vec<MountLayer>>;

    fn bind_to_self(&self, path: &Path) -> Result<()>;

    fn remount_read_only(&self, path: &Path) -> Result<()>;

    /// Detach the top layer. `Ok(false)` when `path` is not a mount point.
    fn detach(&self, path: &Path, force: bool) -> Result<bool>;
}

/// Linux implementation over `mount(2)`, `umount2(2)` and
/// `/proc/self/mountinfo`.
#[derive(Debug, Clone)]
pub struct LinuxMounts {
    mountinfo: PathBuf,
}

impl Default for LinuxMounts {
    fn default() -> Self {
        Self {
            mountinfo: PathBuf::from("/proc/self/mountinfo"),
        }
    }
}

impl LinuxMounts {
    fn c_path(path: &Path) -> Result<CString> {
        CString::new(path.as_os_str().as_bytes()).map_err(|e| {
            GuardError::io(
                path,
                std::io::Error::new(std::io::ErrorKind::InvalidInput, e),
            )
        })
    }

    fn mount(path: &Path, source: &Path, flags: libc::c_ulong) -> Result<()> {
        let target = Self::c_path(path)?;
        let source = Self::c_path(source)?;
        // SAFETY: both strings are NUL-terminated and live across the call;
        // fstype and data may be null for bind / remount operations.
        let rc = unsafe {
            libc::mount(
                source.as_ptr(),
                target.as_ptr(),
                std::ptr::null(),
                flags,
                std::ptr::null(),
            )
        };
        if rc != 0 {
            return Err(GuardError::io(path, std::io::Error::last_os_error()));
        }
        Ok(())
    }
}

impl MountBackend for LinuxMounts {
    fn layers(&self, path: &Path) -> Result<Vec<MountLayer>> {
        let target = std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf());
        let text = std::fs::read_to_string(&self.mountinfo)
            .map_err(|e| GuardError::io(&self.mountinfo, e))?;
        Ok(parse_mountinfo(&text, &target))
    }

    fn bind_to_self(&self, path: &Path) -> Result<()> {
        Self::mount(path, path, libc::MS_BIND)
    }

    fn remount_read_only(&self, path: &Path) -> Result<()> {
        Self::mount(path, path, libc::MS_BIND | libc::MS_REMOUNT | libc::MS_RDONLY)
    }

    fn detach(&self, path: &Path, force: bool) -> Result<bool> {
        let target = Self::c_path(path)?;
        let flags = if force { libc::MNT_FORCE } else { libc::MNT_DETACH };
        // SAFETY: `target` is NUL-terminated and outlives the call.
        let rc = unsafe { libc::umount2(target.as_ptr(), flags) };
        if rc == 0 {
            return Ok(true);
        }
        let err = std::io::Error::last_os_error();
        match err.raw_os_error() {
            Some(libc::EINVAL) | Some(libc::ENOENT) => Ok(false),
            _ => Err(GuardError::io(path, err)),
        }
    }
}

/// Layers mounted at `target`, in mount order.
pub fn parse_mountinfo(text: &str, target: &Path) -> Vec<MountLayer> {
    text.lines()
        .filter_map(|line| {
            let fields: Vec<&str> = line.split(' ').collect();
            let mount_id = fields.first()?.parse().ok()?;
            let mount_point = unescape_mountinfo(fields.get(4)?);
            if Path::new(&mount_point) != target {
                return None;
            }
            let read_only = fields.get(5)?.split(',').any(|opt| opt == "ro");
            Some(MountLayer {
                mount_id,
                read_only,
            })
        })
        .collect()
}

/// Decode the `\ooo` octal escapes mountinfo uses for space, tab,
/// newline and backslash.
fn unescape_mountinfo(field: &str) -> String {
    let bytes = field.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\'
            && let Some(digits) = bytes.get(i + 1..i + 4)
            && let Ok(digits) = std::str::from_utf8(digits)
            && let Ok(value) = u8::from_str_radix(digits, 8)
        {
            out.push(value);
            i += 4;
            continue;
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// Snapshot of the overlay on one path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OverlayStatus {
    pub layers: usize,
    pub top_read_only: bool,
    pub top_mount_id: Option<u64>,
}

impl OverlayStatus {
    /// Exactly one read-only layer.
    pub fn is_enforced(&self) -> bool {
        self.layers == 1 && self.top_read_only
    }
}

#[derive(Clone)]
pub struct MountOverlay {
    backend: Arc<dyn MountBackend>,
    max_attempts: u32,
}

impl MountOverlay {
    pub fn new(backend: Arc<dyn MountBackend>, max_attempts: u32) -> Self {
        Self {
            backend,
            max_attempts: max_attempts.max(1),
        }
    }

    pub fn status(&self, path: &Path) -> Result<OverlayStatus> {
        let layers = self.backend.layers(path)?;
        let top = layers.last();
        Ok(OverlayStatus {
            layers: layers.len(),
            top_read_only: top.is_some_and(|layer| layer.read_only),
            top_mount_id: top.map(|layer| layer.mount_id),
        })
    }

    pub fn layer_count(&self, path: &Path) -> Result<usize> {
        Ok(self.backend.layers(path)?.len())
    }

    /// Unmount until `path` is no longer a mount point. Returns how many
    /// layers were removed.
    pub fn collapse_to_zero(&self, path: &Path) -> Result<usize> {
        let mut removed = 0;
        for attempt in 1..=self.max_attempts {
            let layers = self.backend.layers(path)?.len();
            if layers == 0 {
                if removed > 0 {
                    tracing::info!("collapsed {removed} mount layer(s) on {}", path.display());
                }
                return Ok(removed);
            }
            // Alternate lazy and forced unmounts; busy mounts often only
            // yield to one of them.
            let force = attempt % 2 == 0;
            match self.backend.detach(path, force) {
                Ok(true) => removed += 1,
                Ok(false) => {}
                Err(err) => {
                    tracing::warn!(
                        "unmount attempt {attempt}/{} on {} failed: {err}",
                        self.max_attempts,
                        path.display()
                    );
                }
            }
        }

        let remaining = self.backend.layers(path)?.len();
        if remaining == 0 {
            return Ok(removed);
        }
        Err(GuardError::MountStackInvariantViolation {
            path: path.to_path_buf(),
            layers: remaining,
            attempts: self.max_attempts,
        })
    }

    /// Stack one read-only bind mount. Refuses unless no layer is present.
    pub fn apply_read_only_layer(&self, path: &Path) -> Result<()> {
        let layers = self.backend.layers(path)?.len();
        if layers != 0 {
            return Err(GuardError::MountStackInvariantViolation {
                path: path.to_path_buf(),
                layers,
                attempts: 0,
            });
        }

        self.backend.bind_to_self(path)?;
        if let Err(err) = self.backend.remount_read_only(path) {
            // Never leave a writable layer behind.
            if let Err(detach_err) = self.backend.detach(path, false) {
                tracing::error!(
                    "could not detach writable bind on {}: {detach_err}",
                    path.display()
                );
            }
            return Err(err);
        }
        tracing::debug!("read-only layer applied on {}", path.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeMounts;
    use pretty_assertions::assert_eq;

    const MOUNTINFO: &str = "\
22 1 259:2 / / rw,relatime shared:1 - ext4 /dev/nvme0n1p2 rw
61 22 259:2 /etc/hosts /etc/hosts rw,relatime shared:1 - ext4 /dev/nvme0n1p2 rw
62 61 259:2 /etc/hosts /etc/hosts ro,relatime shared:1 - ext4 /dev/nvme0n1p2 rw
70 22 0:45 / /mnt/with\\040space rw - tmpfs tmpfs rw
";

    #[test]
    fn parses_stacked_layers_in_order() {
        let layers = parse_mountinfo(MOUNTINFO, Path::new("/etc/hosts"));
        assert_eq!(
            layers,
            vec![
                MountLayer {
                    mount_id: 61,
                    read_only: false
                },
                MountLayer {
                    mount_id: 62,
                    read_only: true
                },
            ]
        );
    }

    #[test]
    fn decodes_octal_escapes() {
        let layers = parse_mountinfo(MOUNTINFO, Path::new("/mnt/with space"));
        assert_eq!(layers.len(), 1);
        assert!(parse_mountinfo(MOUNTINFO, Path::new("/etc/passwd")).is_empty());
    }

    #[test]
    fn collapse_removes_every_layer() {
        let mounts = Arc::new(FakeMounts::default());
        let path = Path::new("/etc/hosts");
        mounts.push_layer(path, false);
        mounts.push_layer(path, true);
        mounts.push_layer(path, true);

        let overlay = MountOverlay::new(mounts.clone(), 20);
        assert_eq!(overlay.collapse_to_zero(path).unwrap(), 3);
        assert_eq!(overlay.layer_count(path).unwrap(), 0);
        assert_eq!(overlay.collapse_to_zero(path).unwrap(), 0);
    }

    #[test]
    fn collapse_reports_violation_when_budget_exhausted() {
        let mounts = Arc::new(FakeMounts::default());
        let path = Path::new("/etc/hosts");
        mounts.push_layer(path, true);
        mounts.set_stuck(true);

        let overlay = MountOverlay::new(mounts.clone(), 4);
        let err = overlay.collapse_to_zero(path).unwrap_err();
        assert!(matches!(
            err,
            GuardError::MountStackInvariantViolation {
                layers: 1,
                attempts: 4,
                ..
            }
        ));
    }

    #[test]
    fn apply_refuses_to_stack() {
        let mounts = Arc::new(FakeMounts::default());
        let path = Path::new("/etc/hosts");
        let overlay = MountOverlay::new(mounts.clone(), 20);

        overlay.apply_read_only_layer(path).unwrap();
        assert!(overlay.status(path).unwrap().is_enforced());
        assert!(overlay.apply_read_only_layer(path).is_err());
        assert_eq!(overlay.layer_count(path).unwrap(), 1);
    }

    #[test]
    fn failed_remount_leaves_no_layer() {
        let mounts = Arc::new(FakeMounts::default());
        let path = Path::new("/etc/hosts");
        mounts.fail_remount(true);
        let overlay = MountOverlay::new(mounts.clone(), 20);

        assert!(overlay.apply_read_only_layer(path).is_err());
        assert_eq!(overlay.layer_count(path).unwrap(), 0);
    }

    #[test]
    fn layer_count_stays_within_bounds_for_any_sequence() {
        let mounts = Arc::new(FakeMounts::default());
        let path = Path::new("/etc/hosts");
        let overlay = MountOverlay::new(mounts.clone(), 20);

        // Deterministic pseudo-random interleaving of both operations.
        let mut seed: u32 = 0x9e37_79b9;
        for _ in 0..200 {
            seed ^= seed << 13;
            seed ^= seed >> 17;
            seed ^= seed << 5;
            if seed % 3 == 0 {
                overlay.collapse_to_zero(path).unwrap();
            } else {
                let _ = overlay.apply_read_only_layer(path);
            }
            assert!(overlay.layer_count(path).unwrap() <= 1);
        }
    }
}
