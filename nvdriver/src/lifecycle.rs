use std::sync::Arc;
use std::time::Duration;

use libkmod::{
    DependentCountPolicy, LoadOptions, ModuleParams, ModuleSet, UnloadOutcome, Unloader,
    load_modules,
};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::{DriverConfig, Paths};
use crate::daemon::{DaemonSupervisor, SupervisorPolicy};
use crate::error::LifecycleError;
use crate::host::Host;
use crate::kernel_type::{self, KernelType};
use crate::lock::LifecycleLock;
use crate::packages::InstallRequest;
use crate::rootfs::RootfsBinder;
use crate::signals::{Directive, SignalAction, SignalRouter, Stage};
use crate::topology::{FabricTopology, MELLANOX_VENDOR_ID};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum LifecycleState {
    Uninitialized = 0,
    Locked = 1,
    UnloadedClean = 2,
    Installed = 3,
    Loaded = 4,
    Mounted = 5,
    Waiting = 6,
    TearingDown = 7,
    Stopped = 8,
    Aborted = 9,
}

impl Stage for LifecycleState {
    fn code(self) -> u8 {
        self as u8
    }

    fn from_code(code: u8) -> Self {
        match code {
            0 => LifecycleState::Uninitialized,
            1 => LifecycleState::Locked,
            2 => LifecycleState::UnloadedClean,
            3 => LifecycleState::Installed,
            4 => LifecycleState::Loaded,
            5 => LifecycleState::Mounted,
            6 => LifecycleState::Waiting,
            7 => LifecycleState::TearingDown,
            8 => LifecycleState::Stopped,
            _ => LifecycleState::Aborted,
        }
    }

    fn on_terminate(self) -> SignalAction {
        use LifecycleState::*;
        match self {
            Uninitialized | Locked | UnloadedClean | Installed | Loaded | Mounted => {
                SignalAction::Abort
            }
            Waiting => SignalAction::Shutdown,
            TearingDown | Stopped | Aborted => SignalAction::Ignore,
        }
    }
}

/// One `init` run: bring the driver up, hold it, tear it down on signal.
pub struct Lifecycle {
    config: DriverConfig,
    paths: Paths,
    host: Host,
    policy: SupervisorPolicy,
    signals: Arc<SignalRouter<LifecycleState>>,
    lock: Option<LifecycleLock>,
    /// Set once the host is known clean; from then on a failed run tears
    /// down whatever it brought up.
    exit_hook_armed: bool,
}

impl Lifecycle {
    pub fn new(config: DriverConfig, paths: Paths, host: Host) -> Self {
        Lifecycle {
            config,
            paths,
            host,
            policy: SupervisorPolicy::default(),
            signals: Arc::new(SignalRouter::new(LifecycleState::Uninitialized)),
            lock: None,
            exit_hook_armed: false,
        }
    }

    pub fn with_supervisor_policy(mut self, policy: SupervisorPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn signals(&self) -> Arc<SignalRouter<LifecycleState>> {
        self.signals.clone()
    }

    pub fn state(&self) -> LifecycleState {
        self.signals.stage()
    }

    /// Run to completion. Succeeds only after an orderly shutdown from
    /// [`LifecycleState::Waiting`].
    pub async fn run(mut self) -> Result<(), LifecycleError> {
        let (result, clean) = match self.bring_up().await {
            Ok(()) => {
                self.hold().await;
                let result = self.teardown().await;
                let clean = result.is_ok();
                (result, clean)
            }
            Err(e) => {
                let (err, clean) = self.abort(e).await;
                (Err(err), clean)
            }
        };
        if let Some(lock) = self.lock.take() {
            if clean {
                lock.release();
            } else {
                // host state unknown: leave the pid file for the next instance
                warn!("keeping {}", lock.path().display());
            }
        }
        result
    }

    fn transition(&self, next: LifecycleState) {
        debug!(from = ?self.state(), to = ?next, "lifecycle transition");
        self.signals.set_stage(next);
    }

    /// Fail if a signal asked to abort since the last step.
    fn checkpoint(&self) -> Result<(), LifecycleError> {
        match self.signals.abort_signal() {
            Some(signal) => Err(LifecycleError::Interrupted(signal.as_str().to_string())),
            None => Ok(()),
        }
    }

    async fn bring_up(&mut self) -> Result<(), LifecycleError> {
        info!(
            "DRIVER_BRANCH={} DRIVER_ARCH={} KERNEL_RELEASE={}",
            self.config.driver_branch, self.config.driver_arch, self.host.kernel_release
        );
        let kernel_type = kernel_type::resolve(
            self.config.kernel_module_type,
            self.config.driver_branch,
            &*self.host.advisor,
        );
        self.checkpoint()?;

        self.lock = Some(LifecycleLock::acquire(&self.paths.lock_file)?);
        self.transition(LifecycleState::Locked);
        self.checkpoint()?;

        // whatever a previous instance left behind
        self.shutdown().await?;
        self.exit_hook_armed = true;
        self.transition(LifecycleState::UnloadedClean);
        self.checkpoint()?;

        let topology = self.host.bus.topology();
        info!("Fabric topology: {topology:?}");
        self.install(kernel_type, topology).await?;
        self.transition(LifecycleState::Installed);
        self.checkpoint()?;

        self.load_modules()?;
        self.checkpoint()?;
        self.supervisor()
            .start_all(topology, &self.signals.cancel_token())
            .await?;
        self.transition(LifecycleState::Loaded);
        self.checkpoint()?;

        self.binder().mount()?;
        self.transition(LifecycleState::Mounted);
        self.checkpoint()?;

        self.transition(LifecycleState::Waiting);
        // an abort may have landed just before the switch
        self.checkpoint()
    }

    async fn install(
        &self,
        kernel_type: KernelType,
        topology: FabricTopology,
    ) -> Result<(), LifecycleError> {
        let request = InstallRequest {
            branch: self.config.driver_branch,
            kernel_type,
            kernel_release: self.host.kernel_release.clone(),
            arch: self.config.driver_arch.clone(),
            topology,
            accept_license: self.config.accept_license,
        };
        self.host
            .packages
            .install(&request)
            .await
            .map_err(|e| LifecycleError::InstallFailed {
                reason: format!("{e:#}"),
            })
    }

    fn load_modules(&self) -> Result<(), LifecycleError> {
        let params = ModuleParams::load(&self.paths.module_config_dir)?;
        let modules = ModuleSet::from_params(&params);

        let peer_memory =
            self.config.gpu_direct_rdma && self.host.bus.has_vendor(MELLANOX_VENDOR_ID);
        if self.config.gpu_direct_rdma && !peer_memory {
            warn!("GPU direct RDMA is enabled but no Mellanox device was found, skipping nvidia-peermem");
        }

        let loaded = load_modules(&*self.host.loader, &modules, LoadOptions { peer_memory })?;
        info!("Loaded NVIDIA driver kernel modules: {}", loaded.join(" "));
        Ok(())
    }

    fn supervisor(&self) -> DaemonSupervisor<'_> {
        DaemonSupervisor::new(
            &*self.host.launcher,
            &*self.host.modules,
            &self.paths,
            self.policy,
        )
    }

    fn binder(&self) -> RootfsBinder<'_> {
        RootfsBinder::new(
            &*self.host.mounts,
            &self.paths.host_root,
            &self.paths.driver_root,
            &self.paths.sys,
        )
    }

    /// Block until a shutdown directive arrives. Wake-ups re-enter the wait.
    async fn hold(&self) {
        info!("Done, now waiting for signal");
        let mut sleeper = spawn_sleeper();
        loop {
            tokio::select! {
                directive = self.signals.next() => match directive {
                    Some(Directive { action: SignalAction::Wake, signal }) => {
                        debug!("woken by {}, waiting again", signal.as_str());
                    }
                    Some(Directive { signal, .. }) => {
                        debug!("leaving wait on {}", signal.as_str());
                        break;
                    }
                    None => break,
                },
                _ = &mut sleeper => sleeper = spawn_sleeper(),
            }
        }
        sleeper.abort();
    }

    async fn teardown(&mut self) -> Result<(), LifecycleError> {
        self.transition(LifecycleState::TearingDown);
        match self.shutdown().await {
            Ok(()) => {
                self.transition(LifecycleState::Stopped);
                info!("Done");
                Ok(())
            }
            Err(e) => {
                error!("{e}");
                self.transition(LifecycleState::Aborted);
                Err(LifecycleError::Shutdown(Box::new(e)))
            }
        }
    }

    /// Report `err`, run the exit hook if armed, and settle in `Aborted`.
    /// The flag tells whether the exit hook left the host clean.
    async fn abort(&mut self, err: LifecycleError) -> (LifecycleError, bool) {
        let err = match (err, self.signals.abort_signal()) {
            (LifecycleError::Interrupted(_), Some(signal)) => {
                LifecycleError::Interrupted(signal.as_str().to_string())
            }
            (err, _) => err,
        };
        error!("{err}");

        let mut clean = false;
        if self.exit_hook_armed {
            self.transition(LifecycleState::TearingDown);
            match self.shutdown().await {
                Ok(()) => clean = true,
                Err(e) => error!("shutdown after failure: {e}"),
            }
        }
        self.transition(LifecycleState::Aborted);
        (err, clean)
    }

    /// Stop daemons, unload modules, unmount the driver root. Every step is a
    /// no-op when there is nothing to do.
    async fn shutdown(&self) -> Result<(), LifecycleError> {
        let stopped = self.supervisor().stop_all().await?;
        if !stopped.is_empty() {
            info!("Stopped {}", stopped.join(", "));
        }

        let unloader = Unloader::new(
            &*self.host.modules,
            &*self.host.loader,
            &DependentCountPolicy,
        );
        match unloader.unload()? {
            UnloadOutcome::NothingLoaded => debug!("no NVIDIA driver kernel modules loaded"),
            UnloadOutcome::Unloaded(modules) => info!("Unloaded {}", modules.join(" ")),
        }

        self.binder().unmount()?;
        Ok(())
    }
}

fn spawn_sleeper() -> JoinHandle<()> {
    tokio::spawn(async {
        loop {
            tokio::time::sleep(Duration::from_secs(24 * 60 * 60)).await;
        }
    })
}
