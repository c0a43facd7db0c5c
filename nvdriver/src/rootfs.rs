use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use nix::errno::Errno;
use nix::mount::{MntFlags, MsFlags, mount, umount2};
use tracing::{debug, info};

use crate::error::LifecycleError;

/// The mount primitives the binder relies on.
pub trait MountOps: Send + Sync {
    fn is_mounted(&self, target: &Path) -> Result<bool, LifecycleError>;

    /// Make `path` recursively unbindable, then private.
    fn isolate(&self, path: &Path) -> Result<(), LifecycleError>;

    fn rbind(&self, source: &Path, target: &Path) -> Result<(), LifecycleError>;

    /// Lazily detach `target` and everything mounted below it.
    fn detach(&self, target: &Path) -> Result<(), LifecycleError>;
}

#[derive(Debug, Clone)]
pub struct LinuxMounts {
    mountinfo: PathBuf,
}

impl Default for LinuxMounts {
    fn default() -> Self {
        LinuxMounts::new("/proc/self/mountinfo")
    }
}

impl LinuxMounts {
    pub fn new(mountinfo: impl Into<PathBuf>) -> Self {
        LinuxMounts {
            mountinfo: mountinfo.into(),
        }
    }

    fn mount_points(&self) -> Result<Vec<PathBuf>, LifecycleError> {
        let content = fs::read_to_string(&self.mountinfo)
            .map_err(|e| LifecycleError::io(&self.mountinfo, e))?;
        Ok(parse_mount_points(&content))
    }
}

fn mount_error(operation: &'static str, target: &Path, errno: Errno) -> LifecycleError {
    LifecycleError::Mount {
        operation,
        target: target.to_path_buf(),
        source: io::Error::from(errno),
    }
}

impl MountOps for LinuxMounts {
    fn is_mounted(&self, target: &Path) -> Result<bool, LifecycleError> {
        Ok(self.mount_points()?.iter().any(|point| point == target))
    }

    fn isolate(&self, path: &Path) -> Result<(), LifecycleError> {
        mount(
            None::<&str>,
            path,
            None::<&str>,
            MsFlags::MS_REC | MsFlags::MS_UNBINDABLE,
            None::<&str>,
        )
        .map_err(|e| mount_error("make-runbindable", path, e))?;
        mount(
            None::<&str>,
            path,
            None::<&str>,
            MsFlags::MS_PRIVATE,
            None::<&str>,
        )
        .map_err(|e| mount_error("make-private", path, e))
    }

    fn rbind(&self, source: &Path, target: &Path) -> Result<(), LifecycleError> {
        mount(
            Some(source),
            target,
            None::<&str>,
            MsFlags::MS_BIND | MsFlags::MS_REC,
            None::<&str>,
        )
        .map_err(|e| mount_error("rbind", target, e))
    }

    fn detach(&self, target: &Path) -> Result<(), LifecycleError> {
        let mut points: Vec<PathBuf> = self
            .mount_points()?
            .into_iter()
            .filter(|point| point.starts_with(target))
            .collect();
        points.sort();
        points.dedup();
        // deepest first
        points.sort_by_key(|point| std::cmp::Reverse(point.components().count()));
        for point in points {
            match umount2(point.as_path(), MntFlags::MNT_DETACH) {
                Ok(()) => debug!("detached {}", point.display()),
                // already gone with its parent
                Err(Errno::EINVAL) | Err(Errno::ENOENT) => {}
                Err(e) => return Err(mount_error("umount", &point, e)),
            }
        }
        Ok(())
    }
}

/// Mount points from `/proc/self/mountinfo`, in table order.
pub fn parse_mount_points(mountinfo: &str) -> Vec<PathBuf> {
    mountinfo
        .lines()
        .filter_map(|line| line.split(' ').nth(4))
        .map(|field| PathBuf::from(unescape_octal(field)))
        .collect()
}

/// Decode the `\NNN` escapes the kernel uses for space, tab, newline and
/// backslash.
fn unescape_octal(field: &str) -> String {
    let bytes = field.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' && i + 4 <= bytes.len() {
            let digits = &bytes[i + 1..i + 4];
            if digits.iter().all(|d| (b'0'..=b'7').contains(d)) {
                let value = digits
                    .iter()
                    .fold(0u32, |acc, d| acc * 8 + u32::from(d - b'0'));
                if let Ok(value) = u8::try_from(value) {
                    out.push(value);
                    i += 4;
                    continue;
                }
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// Exposes the driver's root filesystem at a fixed runtime path.
pub struct RootfsBinder<'a> {
    mounts: &'a dyn MountOps,
    source: &'a Path,
    target: &'a Path,
    sys: &'a Path,
}

impl<'a> RootfsBinder<'a> {
    pub fn new(mounts: &'a dyn MountOps, source: &'a Path, target: &'a Path, sys: &'a Path) -> Self {
        RootfsBinder {
            mounts,
            source,
            target,
            sys,
        }
    }

    /// Returns false when the tree was already mounted.
    pub fn mount(&self) -> Result<bool, LifecycleError> {
        if self.mounts.is_mounted(self.target)? {
            debug!("{} is already mounted", self.target.display());
            return Ok(false);
        }
        info!("Mounting NVIDIA driver rootfs...");
        fs::create_dir_all(self.target).map_err(|e| LifecycleError::io(self.target, e))?;
        self.mounts.isolate(self.sys)?;
        self.mounts.rbind(self.source, self.target)?;
        Ok(true)
    }

    /// Returns false when nothing was mounted.
    pub fn unmount(&self) -> Result<bool, LifecycleError> {
        if !self.mounts.is_mounted(self.target)? {
            return Ok(false);
        }
        info!("Unmounting NVIDIA driver rootfs...");
        self.mounts.detach(self.target)?;
        Ok(true)
    }
}
