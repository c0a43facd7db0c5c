use std::sync::Arc;

use libkmod::{Modprobe, ModuleInspector, ModuleLoader, SysfsModules};
use nix::sys::utsname::uname;

use crate::config::Paths;
use crate::daemon::{CommandLauncher, DaemonLauncher};
use crate::error::LifecycleError;
use crate::kernel_type::{InstallerAdvisor, KernelTypeAdvisor};
use crate::packages::{AptInstaller, PackageInstaller};
use crate::rootfs::{LinuxMounts, MountOps};
use crate::topology::{DeviceBus, SysfsBus};

/// Host capabilities used by the lifecycle and the peer watcher.
#[derive(Clone)]
pub struct Host {
    pub modules: Arc<dyn ModuleInspector>,
    pub loader: Arc<dyn ModuleLoader>,
    /// Loader running inside the mounted driver root.
    pub peer_loader: Arc<dyn ModuleLoader>,
    pub packages: Arc<dyn PackageInstaller>,
    pub mounts: Arc<dyn MountOps>,
    pub advisor: Arc<dyn KernelTypeAdvisor>,
    pub launcher: Arc<dyn DaemonLauncher>,
    pub bus: Arc<dyn DeviceBus>,
    pub kernel_release: String,
}

impl Host {
    pub fn system(paths: &Paths) -> Result<Self, LifecycleError> {
        let kernel_release = uname()
            .map_err(|e| LifecycleError::io("uname", e.into()))?
            .release()
            .to_string_lossy()
            .into_owned();
        Ok(Host {
            modules: Arc::new(SysfsModules::new(&paths.sys_module)),
            loader: Arc::new(Modprobe::new()),
            peer_loader: Arc::new(Modprobe::in_root(&paths.driver_root)),
            packages: Arc::new(AptInstaller::default()),
            mounts: Arc::new(LinuxMounts::new(&paths.mountinfo)),
            advisor: Arc::new(InstallerAdvisor::default()),
            launcher: Arc::new(CommandLauncher),
            bus: Arc::new(SysfsBus::new(&paths.pci_devices, &paths.nvswitch_devices)),
            kernel_release,
        })
    }
}
