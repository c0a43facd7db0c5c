#![allow(dead_code)]
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use libkmod::catalog::sysfs_name;
use libkmod::{KmodError, ModuleInspector, ModuleLoader};
use nix::sys::signal::Signal;
use nvdriver::daemon::{DaemonLauncher, LaunchSpec, SupervisorPolicy};
use nvdriver::kernel_type::KernelTypeAdvisor;
use nvdriver::packages::{InstallRequest, PackageInstaller};
use nvdriver::retry::RetryPolicy;
use nvdriver::rootfs::MountOps;
use nvdriver::signals::{SignalRouter, Stage};
use nvdriver::topology::{DeviceBus, FabricTopology};
use nvdriver::{DriverConfig, Host, KernelModuleType, LifecycleError};

/// Pid far above any pid_max, so it is never alive.
pub const DEAD_PID: &str = "2000000000";

#[derive(Debug, Clone, Default)]
struct LoadedModule {
    refs: u32,
    holders: BTreeSet<String>,
}

/// In-memory kernel: modules loaded through it show up in its inspector view.
/// Driver modules loaded after `nvidia` take a reference on it.
#[derive(Debug, Default)]
pub struct FakeKernel {
    modules: Mutex<BTreeMap<String, LoadedModule>>,
    pub calls: Mutex<Vec<String>>,
    fail_load: Option<&'static str>,
}

impl FakeKernel {
    pub fn with_module(self, name: &str, refs: u32) -> Self {
        self.modules.lock().unwrap().insert(
            sysfs_name(name),
            LoadedModule {
                refs,
                holders: BTreeSet::new(),
            },
        );
        self
    }

    pub fn failing_on(mut self, module: &'static str) -> Self {
        self.fail_load = Some(module);
        self
    }

    pub fn insert(&self, name: &str) {
        self.modules
            .lock()
            .unwrap()
            .entry(sysfs_name(name))
            .or_default();
    }

    /// Take a reference on `name` from outside the driver.
    pub fn hold(&self, name: &str) {
        if let Some(module) = self.modules.lock().unwrap().get_mut(&sysfs_name(name)) {
            module.refs += 1;
        }
    }

    pub fn loaded(&self) -> Vec<String> {
        self.modules.lock().unwrap().keys().cloned().collect()
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

impl ModuleInspector for FakeKernel {
    fn is_loaded(&self, module: &str) -> bool {
        self.modules
            .lock()
            .unwrap()
            .contains_key(&sysfs_name(module))
    }

    fn refcount(&self, module: &str) -> Result<Option<u32>, KmodError> {
        Ok(self
            .modules
            .lock()
            .unwrap()
            .get(&sysfs_name(module))
            .map(|m| m.refs))
    }

    fn holders(&self, module: &str) -> Result<BTreeSet<String>, KmodError> {
        Ok(self
            .modules
            .lock()
            .unwrap()
            .get(&sysfs_name(module))
            .map(|m| m.holders.clone())
            .unwrap_or_default())
    }
}

impl ModuleLoader for FakeKernel {
    fn load(&self, module: &str, params: &[String]) -> Result<(), KmodError> {
        self.calls
            .lock()
            .unwrap()
            .push(format!("modprobe {module} {}", params.join(" ")).trim_end().to_string());
        if self.fail_load == Some(module) {
            return Err(KmodError::LoadFailed {
                module: module.to_string(),
                reason: "exit status: 1".into(),
            });
        }
        let name = sysfs_name(module);
        let mut modules = self.modules.lock().unwrap();
        if name != "nvidia" && name.starts_with("nvidia") {
            if let Some(nvidia) = modules.get_mut("nvidia") {
                nvidia.refs += 1;
                nvidia.holders.insert(name.clone());
            }
        }
        modules.entry(name).or_default();
        Ok(())
    }

    fn load_all(&self, modules: &[&str]) -> Result<(), KmodError> {
        self.calls
            .lock()
            .unwrap()
            .push(format!("modprobe -a {}", modules.join(" ")));
        let mut loaded = self.modules.lock().unwrap();
        for module in modules {
            loaded.entry(sysfs_name(module)).or_default();
        }
        Ok(())
    }

    fn unload(&self, modules: &[String]) -> Result<(), KmodError> {
        self.calls
            .lock()
            .unwrap()
            .push(format!("rmmod {}", modules.join(" ")));
        let mut loaded = self.modules.lock().unwrap();
        for module in modules {
            let name = sysfs_name(module);
            loaded.remove(&name);
            for other in loaded.values_mut() {
                if other.holders.remove(&name) {
                    other.refs = other.refs.saturating_sub(1);
                }
            }
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct FakeMounts {
    mounted: Mutex<BTreeSet<PathBuf>>,
    pub calls: Mutex<Vec<String>>,
}

impl FakeMounts {
    pub fn mount_now(&self, target: &Path) {
        self.mounted.lock().unwrap().insert(target.to_path_buf());
    }

    pub fn mounted(&self) -> Vec<PathBuf> {
        self.mounted.lock().unwrap().iter().cloned().collect()
    }
}

impl MountOps for FakeMounts {
    fn is_mounted(&self, target: &Path) -> Result<bool, LifecycleError> {
        Ok(self.mounted.lock().unwrap().contains(target))
    }

    fn isolate(&self, _path: &Path) -> Result<(), LifecycleError> {
        self.calls.lock().unwrap().push("isolate".into());
        Ok(())
    }

    fn rbind(&self, _source: &Path, target: &Path) -> Result<(), LifecycleError> {
        self.calls.lock().unwrap().push("rbind".into());
        self.mounted.lock().unwrap().insert(target.to_path_buf());
        Ok(())
    }

    fn detach(&self, target: &Path) -> Result<(), LifecycleError> {
        self.calls.lock().unwrap().push("detach".into());
        self.mounted.lock().unwrap().remove(target);
        Ok(())
    }
}

/// Raises `signal` through a router while "installing", as a signal landing
/// mid-step would.
pub struct SignalDuringInstall<S> {
    pub router: Arc<SignalRouter<S>>,
    pub signal: Signal,
}

pub struct FakeInstaller<S> {
    pub requests: Mutex<Vec<InstallRequest>>,
    pub fail: bool,
    pub interrupt: Mutex<Option<SignalDuringInstall<S>>>,
}

impl<S> Default for FakeInstaller<S> {
    fn default() -> Self {
        FakeInstaller {
            requests: Mutex::new(Vec::new()),
            fail: false,
            interrupt: Mutex::new(None),
        }
    }
}

impl<S> FakeInstaller<S> {
    pub fn requests(&self) -> Vec<InstallRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl<S: Stage> PackageInstaller for FakeInstaller<S> {
    async fn install(&self, request: &InstallRequest) -> anyhow::Result<()> {
        self.requests.lock().unwrap().push(request.clone());
        if let Some(interrupt) = self.interrupt.lock().unwrap().take() {
            interrupt.router.dispatch(interrupt.signal);
        }
        if self.fail {
            anyhow::bail!("E: Unable to locate package nvidia-driver-{}", request.branch);
        }
        Ok(())
    }
}

pub struct FakeAdvisor(pub Option<&'static str>);

impl KernelTypeAdvisor for FakeAdvisor {
    fn recommend(&self) -> Result<String, LifecycleError> {
        self.0
            .map(str::to_string)
            .ok_or_else(|| LifecycleError::KernelType("nvidia-installer not found".into()))
    }
}

/// Writes an exited pid into each pid file, as a daemon that died right away.
#[derive(Debug, Default)]
pub struct FakeLauncher {
    pub launched: Mutex<Vec<String>>,
}

impl FakeLauncher {
    pub fn launched(&self) -> Vec<String> {
        self.launched.lock().unwrap().clone()
    }
}

#[async_trait]
impl DaemonLauncher for FakeLauncher {
    async fn launch(&self, spec: &LaunchSpec) -> Result<(), LifecycleError> {
        self.launched
            .lock()
            .unwrap()
            .push(spec.program.display().to_string());
        for daemon in &spec.daemons {
            if let Some(parent) = daemon.pid_file.parent() {
                fs::create_dir_all(parent).unwrap();
            }
            fs::write(&daemon.pid_file, DEAD_PID).unwrap();
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct FakeBus {
    pub mellanox: bool,
    pub topology: FabricTopology,
}

impl DeviceBus for FakeBus {
    fn has_vendor(&self, vendor: &str) -> bool {
        self.mellanox && vendor == nvdriver::topology::MELLANOX_VENDOR_ID
    }

    fn topology(&self) -> FabricTopology {
        self.topology
    }
}

pub fn config() -> DriverConfig {
    DriverConfig {
        driver_branch: 570,
        driver_arch: "x86_64".into(),
        kernel_module_type: KernelModuleType::Auto,
        gpu_direct_rdma: false,
        use_host_mofed: false,
        accept_license: true,
    }
}

pub fn fast_policy() -> SupervisorPolicy {
    SupervisorPolicy {
        launch_timeout: Duration::from_secs(5),
        pid_file_wait: RetryPolicy::bounded(Duration::from_millis(5), 20),
        stop_wait: RetryPolicy::bounded(Duration::from_millis(5), 20),
        fabric_wait: RetryPolicy::forever(Duration::from_millis(5)),
    }
}

pub fn host<S: Stage>(
    kernel: Arc<FakeKernel>,
    mounts: Arc<FakeMounts>,
    installer: Arc<FakeInstaller<S>>,
    launcher: Arc<FakeLauncher>,
    bus: FakeBus,
) -> Host {
    Host {
        modules: kernel.clone(),
        loader: kernel.clone(),
        peer_loader: kernel,
        packages: installer,
        mounts,
        advisor: Arc::new(FakeAdvisor(None)),
        launcher,
        bus: Arc::new(bus),
        kernel_release: "6.8.0-60-generic".into(),
    }
}

/// Poll `check` until it holds or a few seconds pass.
pub async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..500 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}
