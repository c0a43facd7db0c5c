use std::io;
use std::path::PathBuf;

use libkmod::KmodError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("an instance of the NVIDIA driver is already running ({} is locked), aborting", .path.display())]
    AlreadyRunning { path: PathBuf },

    #[error("failed to lock {}: {source}", .path.display())]
    Lock {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error(transparent)]
    Kmod(#[from] KmodError),

    #[error("could not install NVIDIA driver packages: {reason}")]
    InstallFailed { reason: String },

    #[error("could not start {name}: {reason}")]
    DaemonStartFailed { name: String, reason: String },

    #[error("could not stop {name} (pid {pid}), still running")]
    DaemonStopFailed { name: String, pid: i32 },

    #[error("malformed pid file {}: {value:?}", .path.display())]
    BadPidFile { path: PathBuf, value: String },

    #[error("{operation} {} failed: {source}", .target.display())]
    Mount {
        operation: &'static str,
        target: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("could not determine kernel module type: {0}")]
    KernelType(String),

    #[error("interrupted by {0}")]
    Interrupted(String),

    #[error("shutdown failed: {0}")]
    Shutdown(#[source] Box<LifecycleError>),

    #[error("nvidia-peermem: {0}")]
    PeerModule(String),

    #[error("{}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl LifecycleError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        LifecycleError::Io {
            path: path.into(),
            source,
        }
    }

    pub fn is_interrupted(&self) -> bool {
        matches!(self, LifecycleError::Interrupted(_))
    }
}
