use std::fmt;
use std::path::PathBuf;
use std::process::Command;

use tracing::{info, warn};

use crate::config::KernelModuleType;
use crate::error::LifecycleError;

/// First driver branch whose recommended flavour is the open kernel modules.
pub const OPEN_MODULES_MIN_BRANCH: u32 = 560;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KernelType {
    Proprietary,
    Open,
}

impl KernelType {
    pub fn as_str(self) -> &'static str {
        match self {
            KernelType::Proprietary => "kernel",
            KernelType::Open => "kernel-open",
        }
    }

    pub fn from_branch(branch: u32) -> Self {
        if branch < OPEN_MODULES_MIN_BRANCH {
            KernelType::Proprietary
        } else {
            KernelType::Open
        }
    }
}

impl fmt::Display for KernelType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Source of the installer's own flavour recommendation.
pub trait KernelTypeAdvisor: Send + Sync {
    /// Raw recommendation, e.g. `open` or `proprietary`.
    fn recommend(&self) -> Result<String, LifecycleError>;
}

/// Asks `nvidia-installer --print-recommended-kernel-module-type`.
#[derive(Debug, Clone)]
pub struct InstallerAdvisor {
    program: PathBuf,
}

impl Default for InstallerAdvisor {
    fn default() -> Self {
        InstallerAdvisor {
            program: PathBuf::from("nvidia-installer"),
        }
    }
}

impl InstallerAdvisor {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        InstallerAdvisor {
            program: program.into(),
        }
    }
}

impl KernelTypeAdvisor for InstallerAdvisor {
    fn recommend(&self) -> Result<String, LifecycleError> {
        let output = Command::new(&self.program)
            .arg("--print-recommended-kernel-module-type")
            .output()
            .map_err(|e| LifecycleError::KernelType(format!("{}: {e}", self.program.display())))?;
        if !output.status.success() {
            return Err(LifecycleError::KernelType(format!(
                "{} exited with {}",
                self.program.display(),
                output.status
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

/// Settle the kernel flavour for this run.
///
/// An explicit preference wins. `auto` defers to the advisor and falls back to
/// the branch threshold when the advisor is unavailable.
pub fn resolve(
    preference: KernelModuleType,
    branch: u32,
    advisor: &dyn KernelTypeAdvisor,
) -> KernelType {
    let resolved = match preference {
        KernelModuleType::Open => KernelType::Open,
        KernelModuleType::Proprietary => KernelType::Proprietary,
        KernelModuleType::Auto => match advisor.recommend() {
            Ok(recommended) if recommended == "open" => KernelType::Open,
            Ok(_) => KernelType::Proprietary,
            Err(e) => {
                warn!("{e}, falling back to driver branch {branch}");
                KernelType::from_branch(branch)
            }
        },
    };
    info!("Proceeding with Linux kernel module type {resolved}");
    resolved
}
