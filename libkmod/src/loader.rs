use std::io;
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use nix::unistd::{chdir, chroot};
use tracing::debug;

use crate::error::KmodError;

/// The host's module-management primitives.
pub trait ModuleLoader: Send + Sync {
    fn load(&self, module: &str, params: &[String]) -> Result<(), KmodError>;

    /// Load several parameterless modules in one request.
    fn load_all(&self, modules: &[&str]) -> Result<(), KmodError>;

    /// Remove `modules` in one request, in the order given.
    fn unload(&self, modules: &[String]) -> Result<(), KmodError>;
}

/// `modprobe`/`rmmod`, optionally run inside another root filesystem.
#[derive(Debug, Clone)]
pub struct Modprobe {
    modprobe: PathBuf,
    rmmod: PathBuf,
    root: Option<PathBuf>,
}

impl Default for Modprobe {
    fn default() -> Self {
        Modprobe {
            modprobe: PathBuf::from("modprobe"),
            rmmod: PathBuf::from("rmmod"),
            root: None,
        }
    }
}

impl Modprobe {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run the tools chrooted into `root`, where the driver's modules live.
    pub fn in_root(root: impl Into<PathBuf>) -> Self {
        Modprobe {
            root: Some(root.into()),
            ..Self::default()
        }
    }

    pub fn with_programs(mut self, modprobe: impl Into<PathBuf>, rmmod: impl Into<PathBuf>) -> Self {
        self.modprobe = modprobe.into();
        self.rmmod = rmmod.into();
        self
    }

    fn command(&self, program: &Path) -> Command {
        let mut cmd = Command::new(program);
        if let Some(root) = self.root.clone() {
            // SAFETY: enter_root only issues chroot(2) and chdir(2), both
            // async-signal-safe.
            unsafe {
                cmd.pre_exec(move || enter_root(&root));
            }
        }
        cmd
    }

    fn run(&self, mut cmd: Command) -> Result<Output, KmodError> {
        debug!("running {cmd:?}");
        cmd.output().map_err(|source| KmodError::Spawn {
            program: cmd.get_program().to_string_lossy().into_owned(),
            source,
        })
    }
}

fn enter_root(root: &Path) -> io::Result<()> {
    chroot(root)?;
    chdir("/")?;
    Ok(())
}

fn failure_reason(output: &Output) -> String {
    let stderr = String::from_utf8_lossy(&output.stderr);
    let stderr = stderr.trim();
    if stderr.is_empty() {
        output.status.to_string()
    } else {
        format!("{}: {stderr}", output.status)
    }
}

impl ModuleLoader for Modprobe {
    fn load(&self, module: &str, params: &[String]) -> Result<(), KmodError> {
        let mut cmd = self.command(&self.modprobe);
        cmd.arg(module).args(params);
        let output = self.run(cmd)?;
        if !output.status.success() {
            return Err(KmodError::LoadFailed {
                module: module.to_string(),
                reason: failure_reason(&output),
            });
        }
        Ok(())
    }

    fn load_all(&self, modules: &[&str]) -> Result<(), KmodError> {
        let mut cmd = self.command(&self.modprobe);
        cmd.arg("-a").args(modules);
        let output = self.run(cmd)?;
        if !output.status.success() {
            return Err(KmodError::LoadFailed {
                module: modules.join(" "),
                reason: failure_reason(&output),
            });
        }
        Ok(())
    }

    fn unload(&self, modules: &[String]) -> Result<(), KmodError> {
        let mut cmd = self.command(&self.rmmod);
        cmd.args(modules);
        let output = self.run(cmd)?;
        if !output.status.success() {
            return Err(KmodError::UnloadFailed {
                modules: modules.to_vec(),
                reason: failure_reason(&output),
            });
        }
        Ok(())
    }
}
