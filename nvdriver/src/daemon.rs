use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use libkmod::ModuleInspector;
use nix::errno::Errno;
use nix::sys::signal::{Signal, kill};
use nix::sys::wait::{WaitPidFlag, WaitStatus, waitpid};
use nix::unistd::Pid;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::Paths;
use crate::error::LifecycleError;
use crate::retry::{RetryError, RetryPolicy};
use crate::topology::FabricTopology;

pub const PERSISTENCED: &str = "nvidia-persistenced";
pub const FABRIC_MANAGER: &str = "nv-fabricmanager";
pub const SUBNET_MANAGER: &str = "nvlsm";

/// Kernel modules the next-gen fabric needs before its daemons can start.
pub const FABRIC_MODULES: [&str; 2] = ["mlx5_core", "ib_umad"];

/// A daemon this process started, or finds evidence of through its pid file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DaemonHandle {
    pub name: String,
    pub pid_file: PathBuf,
    pub pid: Option<i32>,
    pub shutdown_signal: Signal,
}

impl DaemonHandle {
    pub fn new(name: impl Into<String>, pid_file: impl Into<PathBuf>) -> Self {
        DaemonHandle {
            name: name.into(),
            pid_file: pid_file.into(),
            pid: None,
            shutdown_signal: Signal::SIGTERM,
        }
    }
}

/// One launcher invocation. Self-daemonizing programs exit once their
/// children have written the listed pid files.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub daemons: Vec<DaemonHandle>,
}

#[async_trait]
pub trait DaemonLauncher: Send + Sync {
    /// Run the launcher to completion.
    async fn launch(&self, spec: &LaunchSpec) -> Result<(), LifecycleError>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct CommandLauncher;

#[async_trait]
impl DaemonLauncher for CommandLauncher {
    async fn launch(&self, spec: &LaunchSpec) -> Result<(), LifecycleError> {
        let name = spec.program.display().to_string();
        debug!("running {name} {}", spec.args.join(" "));
        let output = Command::new(&spec.program)
            .args(&spec.args)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| LifecycleError::DaemonStartFailed {
                name: name.clone(),
                reason: e.to_string(),
            })?;
        if !output.status.success() {
            return Err(LifecycleError::DaemonStartFailed {
                name,
                reason: format!(
                    "{}: {}",
                    output.status,
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SupervisorPolicy {
    pub launch_timeout: Duration,
    pub pid_file_wait: RetryPolicy,
    pub stop_wait: RetryPolicy,
    /// Unbounded: the fabric stays down until an operator loads its modules.
    pub fabric_wait: RetryPolicy,
}

impl Default for SupervisorPolicy {
    fn default() -> Self {
        SupervisorPolicy {
            launch_timeout: Duration::from_secs(30),
            pid_file_wait: RetryPolicy::bounded(Duration::from_millis(100), 50),
            stop_wait: RetryPolicy::bounded(Duration::from_millis(100), 50),
            fabric_wait: RetryPolicy::forever(Duration::from_secs(5)),
        }
    }
}

pub struct DaemonSupervisor<'a> {
    launcher: &'a dyn DaemonLauncher,
    modules: &'a dyn ModuleInspector,
    paths: &'a Paths,
    policy: SupervisorPolicy,
}

impl<'a> DaemonSupervisor<'a> {
    pub fn new(
        launcher: &'a dyn DaemonLauncher,
        modules: &'a dyn ModuleInspector,
        paths: &'a Paths,
        policy: SupervisorPolicy,
    ) -> Self {
        DaemonSupervisor {
            launcher,
            modules,
            paths,
            policy,
        }
    }

    /// Every daemon this system may run, in start order.
    pub fn catalog(&self) -> [DaemonHandle; 3] {
        [
            DaemonHandle::new(PERSISTENCED, &self.paths.persistenced_pid),
            DaemonHandle::new(FABRIC_MANAGER, &self.paths.fabricmanager_pid),
            DaemonHandle::new(SUBNET_MANAGER, &self.paths.nvlsm_pid),
        ]
    }

    /// Start the persistence daemon and whatever the fabric needs.
    ///
    /// `cancel` interrupts the wait for fabric kernel modules.
    pub async fn start_all(
        &self,
        topology: FabricTopology,
        cancel: &CancellationToken,
    ) -> Result<Vec<DaemonHandle>, LifecycleError> {
        let [persistenced, fabric_manager, subnet_manager] = self.catalog();
        let mut started = Vec::new();

        info!("Starting NVIDIA persistence daemon...");
        started.extend(
            self.launch(LaunchSpec {
                program: PERSISTENCED.into(),
                args: vec!["--persistence-mode".into()],
                daemons: vec![persistenced],
            })
            .await?,
        );

        match topology {
            FabricTopology::None => {
                debug!("no NVSwitch or NVLink5 fabric detected");
            }
            FabricTopology::LegacySwitch => {
                info!("Starting NVIDIA fabric manager daemon...");
                started.extend(
                    self.launch(LaunchSpec {
                        program: FABRIC_MANAGER.into(),
                        args: vec![
                            "-c".into(),
                            self.paths.fabricmanager_config.display().to_string(),
                        ],
                        daemons: vec![fabric_manager],
                    })
                    .await?,
                );
            }
            FabricTopology::NextGenSwitch => {
                self.wait_for_fabric_modules(cancel).await?;
                info!("Starting NVIDIA fabric manager daemon for NVLink5+...");
                started.extend(
                    self.launch(LaunchSpec {
                        program: "nvidia-fabricmanager-start.sh".into(),
                        args: vec![
                            "--mode".into(),
                            "start".into(),
                            "--fm-config-file".into(),
                            self.paths.fabricmanager_config.display().to_string(),
                            "--fm-pid-file".into(),
                            self.paths.fabricmanager_pid.display().to_string(),
                            "--nvlsm-config-file".into(),
                            self.paths.nvlsm_config.display().to_string(),
                            "--nvlsm-pid-file".into(),
                            self.paths.nvlsm_pid.display().to_string(),
                        ],
                        daemons: vec![fabric_manager, subnet_manager],
                    })
                    .await?,
                );
            }
        }
        Ok(started)
    }

    async fn wait_for_fabric_modules(&self, cancel: &CancellationToken) -> Result<(), LifecycleError> {
        let loaded = || FABRIC_MODULES.iter().all(|m| self.modules.is_loaded(m));
        let result = self
            .policy
            .fabric_wait
            .wait_until(cancel, loaded, |_| {
                info!("Waiting for mlx5_core and ib_umad kernel modules to be loaded...");
            })
            .await;
        match result {
            Ok(_) => Ok(()),
            Err(RetryError::Cancelled) => Err(LifecycleError::Interrupted(
                "wait for fabric kernel modules".into(),
            )),
            Err(e @ RetryError::Exhausted { .. }) => Err(LifecycleError::DaemonStartFailed {
                name: FABRIC_MANAGER.into(),
                reason: format!("mlx5_core and ib_umad: {e}"),
            }),
        }
    }

    async fn launch(&self, spec: LaunchSpec) -> Result<Vec<DaemonHandle>, LifecycleError> {
        let name = spec.program.display().to_string();
        match tokio::time::timeout(self.policy.launch_timeout, self.launcher.launch(&spec)).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(LifecycleError::DaemonStartFailed {
                    name,
                    reason: format!("did not finish within {:?}", self.policy.launch_timeout),
                });
            }
        }

        let mut handles = Vec::with_capacity(spec.daemons.len());
        for mut handle in spec.daemons {
            let pid_file = handle.pid_file.clone();
            let waited = self
                .policy
                .pid_file_wait
                .wait_until(&CancellationToken::new(), || pid_file.exists(), |_| {})
                .await;
            if waited.is_err() {
                return Err(LifecycleError::DaemonStartFailed {
                    name: handle.name,
                    reason: format!("{} was not created", pid_file.display()),
                });
            }
            handle.pid = read_pid(&pid_file)?;
            info!("{} started (pid {:?})", handle.name, handle.pid);
            handles.push(handle);
        }
        Ok(handles)
    }

    /// Stop every daemon with a pid file, subnet manager first.
    ///
    /// Not cancellable: modules must not be unloaded under a live daemon.
    /// Returns the names of daemons that were found and stopped.
    pub async fn stop_all(&self) -> Result<Vec<String>, LifecycleError> {
        let mut stopped = Vec::new();
        for handle in self.catalog().into_iter().rev() {
            if self.stop(&handle).await? {
                stopped.push(handle.name);
            }
        }
        Ok(stopped)
    }

    async fn stop(&self, handle: &DaemonHandle) -> Result<bool, LifecycleError> {
        let Some(pid) = read_pid(&handle.pid_file)? else {
            return Ok(false);
        };
        info!("Stopping {}...", handle.name);

        let target = Pid::from_raw(pid);
        match kill(target, handle.shutdown_signal) {
            Ok(()) => {}
            Err(Errno::ESRCH) => {
                debug!("{} (pid {pid}) already exited", handle.name);
                remove_pid_file(&handle.pid_file);
                return Ok(true);
            }
            Err(errno) => {
                warn!("failed to signal {} (pid {pid}): {errno}", handle.name);
            }
        }

        let gone = self
            .policy
            .stop_wait
            .wait_until(&CancellationToken::new(), || has_exited(target), |_| {})
            .await;
        if gone.is_err() {
            return Err(LifecycleError::DaemonStopFailed {
                name: handle.name.clone(),
                pid,
            });
        }
        remove_pid_file(&handle.pid_file);
        Ok(true)
    }
}

/// Daemonized processes are re-parented to us when we run as pid 1, and an
/// exited child stays a zombie that `kill(pid, 0)` still reaches until reaped.
fn has_exited(pid: Pid) -> bool {
    match waitpid(pid, Some(WaitPidFlag::WNOHANG)) {
        Ok(WaitStatus::Exited(..) | WaitStatus::Signaled(..)) => true,
        Ok(_) => false,
        // not our child
        Err(Errno::ECHILD) => matches!(kill(pid, None), Err(Errno::ESRCH)),
        Err(errno) => {
            debug!("waitpid({pid}) failed: {errno}");
            matches!(kill(pid, None), Err(Errno::ESRCH))
        }
    }
}

fn read_pid(path: &Path) -> Result<Option<i32>, LifecycleError> {
    let raw = match fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(LifecycleError::io(path, e)),
    };
    match raw.trim().parse::<i32>() {
        Ok(pid) if pid > 0 => Ok(Some(pid)),
        _ => Err(LifecycleError::BadPidFile {
            path: path.to_path_buf(),
            value: raw.trim().to_string(),
        }),
    }
}

fn remove_pid_file(path: &Path) {
    if let Err(e) = fs::remove_file(path) {
        if e.kind() != io::ErrorKind::NotFound {
            warn!("failed to remove {}: {e}", path.display());
        }
    }
}
