use std::path::{Path, PathBuf};

use clap::ValueEnum;

/// Operator preference for the kernel module flavour.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum KernelModuleType {
    #[default]
    Auto,
    Open,
    Proprietary,
}

/// Settings of one lifecycle run, resolved from the environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriverConfig {
    pub driver_branch: u32,
    /// Architecture in the driver's spelling (`x86_64`, `aarch64`).
    pub driver_arch: String,
    pub kernel_module_type: KernelModuleType,
    pub gpu_direct_rdma: bool,
    pub use_host_mofed: bool,
    pub accept_license: bool,
}

/// Map a container platform architecture to the driver's naming.
pub fn driver_arch(target_arch: &str) -> String {
    match target_arch {
        "amd64" => "x86_64".to_string(),
        "arm64" => "aarch64".to_string(),
        other => other.to_string(),
    }
}

/// Every host location the orchestrator reads or writes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Paths {
    pub lock_file: PathBuf,
    pub driver_root: PathBuf,
    pub host_root: PathBuf,
    pub sys: PathBuf,
    pub sys_module: PathBuf,
    pub pci_devices: PathBuf,
    pub nvswitch_devices: PathBuf,
    pub mountinfo: PathBuf,
    pub module_config_dir: PathBuf,
    pub driver_ready_flag: PathBuf,
    pub persistenced_pid: PathBuf,
    pub fabricmanager_pid: PathBuf,
    pub fabricmanager_config: PathBuf,
    pub nvlsm_pid: PathBuf,
    pub nvlsm_config: PathBuf,
}

impl Default for Paths {
    fn default() -> Self {
        Paths {
            lock_file: "/run/nvidia/nvidia-driver.pid".into(),
            driver_root: "/run/nvidia/driver".into(),
            host_root: "/".into(),
            sys: "/sys".into(),
            sys_module: libkmod::inspect::SYS_MODULE.into(),
            pci_devices: "/sys/bus/pci/devices".into(),
            nvswitch_devices: "/proc/driver/nvidia-nvswitch/devices".into(),
            mountinfo: "/proc/self/mountinfo".into(),
            module_config_dir: libkmod::params::DEFAULT_CONFIG_DIR.into(),
            driver_ready_flag: "/run/nvidia/validations/.driver-ctr-ready".into(),
            persistenced_pid: "/var/run/nvidia-persistenced/nvidia-persistenced.pid".into(),
            fabricmanager_pid: "/var/run/nvidia-fabricmanager/nv-fabricmanager.pid".into(),
            fabricmanager_config: "/usr/share/nvidia/nvswitch/fabricmanager.cfg".into(),
            nvlsm_pid: "/var/run/nvidia-fabricmanager/nvlsm.pid".into(),
            nvlsm_config: "/usr/share/nvidia/nvlsm/nvlsm.conf".into(),
        }
    }
}

impl Paths {
    /// The default layout re-rooted under `root`. Used for fixtures.
    pub fn under(root: &Path) -> Self {
        let rebase = |path: PathBuf| match path.strip_prefix("/") {
            Ok(relative) => root.join(relative),
            Err(_) => root.join(path),
        };
        let defaults = Paths::default();
        Paths {
            lock_file: rebase(defaults.lock_file),
            driver_root: rebase(defaults.driver_root),
            host_root: rebase(defaults.host_root),
            sys: rebase(defaults.sys),
            sys_module: rebase(defaults.sys_module),
            pci_devices: rebase(defaults.pci_devices),
            nvswitch_devices: rebase(defaults.nvswitch_devices),
            mountinfo: rebase(defaults.mountinfo),
            module_config_dir: rebase(defaults.module_config_dir),
            driver_ready_flag: rebase(defaults.driver_ready_flag),
            persistenced_pid: rebase(defaults.persistenced_pid),
            fabricmanager_pid: rebase(defaults.fabricmanager_pid),
            fabricmanager_config: rebase(defaults.fabricmanager_config),
            nvlsm_pid: rebase(defaults.nvlsm_pid),
            nvlsm_config: rebase(defaults.nvlsm_config),
        }
    }
}
