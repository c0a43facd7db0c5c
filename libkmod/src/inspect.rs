use std::collections::BTreeSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use crate::catalog::sysfs_name;
use crate::error::KmodError;

pub const SYS_MODULE: &str = "/sys/module";

/// Live view of one module, read from the host at the moment of asking.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleRuntimeState {
    pub name: String,
    pub loaded: bool,
    pub reference_count: u32,
    /// Modules holding a reference on this one, in kernel spelling.
    pub dependents: BTreeSet<String>,
}

/// Read access to the host's loaded-module state.
///
/// Implementations must not cache: every call reflects the kernel as it is
/// now.
pub trait ModuleInspector: Send + Sync {
    fn is_loaded(&self, module: &str) -> bool;

    /// `None` when the module is not loaded.
    fn refcount(&self, module: &str) -> Result<Option<u32>, KmodError>;

    fn holders(&self, module: &str) -> Result<BTreeSet<String>, KmodError>;

    fn runtime_state(&self, module: &str) -> Result<ModuleRuntimeState, KmodError> {
        let refs = self.refcount(module)?;
        let dependents = match refs {
            Some(_) => self.holders(module)?,
            None => BTreeSet::new(),
        };
        Ok(ModuleRuntimeState {
            name: module.to_string(),
            loaded: refs.is_some(),
            reference_count: refs.unwrap_or(0),
            dependents,
        })
    }
}

/// Module state from `/sys/module/<name>/{refcnt,holders}`.
#[derive(Debug, Clone)]
pub struct SysfsModules {
    root: PathBuf,
}

impl SysfsModules {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        SysfsModules { root: root.into() }
    }

    fn module_dir(&self, module: &str) -> PathBuf {
        self.root.join(sysfs_name(module))
    }
}

impl Default for SysfsModules {
    fn default() -> Self {
        SysfsModules::new(SYS_MODULE)
    }
}

impl ModuleInspector for SysfsModules {
    fn is_loaded(&self, module: &str) -> bool {
        self.module_dir(module).join("refcnt").is_file()
    }

    fn refcount(&self, module: &str) -> Result<Option<u32>, KmodError> {
        let path = self.module_dir(module).join("refcnt");
        let raw = match fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(KmodError::io(path, e)),
        };
        raw.trim()
            .parse()
            .map(Some)
            .map_err(|_| KmodError::BadRefcount {
                module: module.to_string(),
                value: raw.trim().to_string(),
            })
    }

    fn holders(&self, module: &str) -> Result<BTreeSet<String>, KmodError> {
        read_dir_names(&self.module_dir(module).join("holders"))
    }
}

fn read_dir_names(dir: &Path) -> Result<BTreeSet<String>, KmodError> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(BTreeSet::new()),
        Err(e) => return Err(KmodError::io(dir, e)),
    };
    let mut names = BTreeSet::new();
    for entry in entries {
        let entry = entry.map_err(|e| KmodError::io(dir, e))?;
        names.insert(entry.file_name().to_string_lossy().into_owned());
    }
    Ok(names)
}
