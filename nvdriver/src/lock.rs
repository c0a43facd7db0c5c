use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use nix::errno::Errno;
use nix::fcntl::{Flock, FlockArg};
use tracing::{debug, warn};

use crate::error::LifecycleError;

/// Exclusive, host-wide token for one orchestrator instance.
///
/// Backed by a non-blocking `flock(2)` on a pid file. The kernel drops the
/// lock when the process exits, so a crashed instance never blocks the next.
#[derive(Debug)]
pub struct LifecycleLock {
    path: PathBuf,
    _lock: Flock<File>,
}

impl LifecycleLock {
    pub fn acquire(path: &Path) -> Result<Self, LifecycleError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| LifecycleError::io(parent, e))?;
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .map_err(|e| LifecycleError::io(path, e))?;

        let mut lock = match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
            Ok(lock) => lock,
            Err((_, errno)) if errno == Errno::EWOULDBLOCK => {
                return Err(LifecycleError::AlreadyRunning {
                    path: path.to_path_buf(),
                });
            }
            Err((_, errno)) => {
                return Err(LifecycleError::Lock {
                    path: path.to_path_buf(),
                    source: io::Error::from(errno),
                });
            }
        };

        lock.set_len(0).map_err(|e| LifecycleError::io(path, e))?;
        writeln!(lock, "{}", std::process::id()).map_err(|e| LifecycleError::io(path, e))?;
        debug!("acquired lifecycle lock {}", path.display());

        Ok(LifecycleLock {
            path: path.to_path_buf(),
            _lock: lock,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Remove the pid file, then drop the lock.
    pub fn release(self) {
        match fs::remove_file(&self.path) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!("failed to remove {}: {e}", self.path.display()),
        }
    }
}
