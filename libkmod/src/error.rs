use std::io;
use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum KmodError {
    #[error("failed to read {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("malformed reference count for module {module}: {value:?}")]
    BadRefcount { module: String, value: String },

    #[error("module {module} is in use ({refs} references): {reason}")]
    Busy {
        module: String,
        refs: u32,
        reason: String,
    },

    #[error("failed to run {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to load module {module}: {reason}")]
    LoadFailed { module: String, reason: String },

    #[error("failed to unload modules {modules:?}: {reason}")]
    UnloadFailed { modules: Vec<String>, reason: String },
}

impl KmodError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        KmodError::Io {
            path: path.into(),
            source,
        }
    }

    pub fn is_busy(&self) -> bool {
        matches!(self, KmodError::Busy { .. })
    }
}
