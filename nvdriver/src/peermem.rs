use std::time::Duration;

use libkmod::ModuleInspector;
use libkmod::ModuleParams;
use libkmod::catalog::{NVIDIA, NVIDIA_PEERMEM};
use nix::sys::signal::Signal;
use tracing::{debug, info};

use crate::config::Paths;
use crate::error::LifecycleError;
use crate::host::Host;
use crate::retry::{RetryError, RetryPolicy};
use crate::signals::{Directive, SignalAction, SignalRouter, Stage};

/// Network driver the peer module attaches to.
pub const NETWORK_DRIVER: &str = "mlx5_core";

pub const RELOAD_POLICY: RetryPolicy = RetryPolicy::forever(Duration::from_secs(10));

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum WatchStage {
    Polling = 0,
    Parked = 1,
}

impl Stage for WatchStage {
    fn code(self) -> u8 {
        self as u8
    }

    fn from_code(code: u8) -> Self {
        match code {
            0 => WatchStage::Polling,
            _ => WatchStage::Parked,
        }
    }

    fn on_terminate(self) -> SignalAction {
        match self {
            WatchStage::Polling => SignalAction::Abort,
            WatchStage::Parked => SignalAction::Shutdown,
        }
    }
}

/// Wait for the network driver and the GPU side, then load the peer module
/// inside the driver root.
pub async fn reload(
    use_host_mofed: bool,
    paths: &Paths,
    host: &Host,
    signals: &SignalRouter<WatchStage>,
    policy: RetryPolicy,
) -> Result<(), LifecycleError> {
    let companion = if use_host_mofed {
        paths.driver_ready_flag.display().to_string()
    } else {
        NVIDIA.to_string()
    };
    let ready = || {
        let companion_ready = if use_host_mofed {
            paths.driver_ready_flag.exists()
        } else {
            host.modules.is_loaded(NVIDIA)
        };
        host.modules.is_loaded(NETWORK_DRIVER) && companion_ready
    };

    let waited = policy
        .wait_until(&signals.cancel_token(), ready, |_| {
            info!("waiting for {NETWORK_DRIVER} and {companion} to be ready");
        })
        .await;
    match waited {
        Ok(attempts) => debug!("peer dependencies ready after {attempts} attempts"),
        Err(RetryError::Cancelled) => {
            let signal = signals.abort_signal().map_or("cancellation", Signal::as_str);
            return Err(LifecycleError::Interrupted(signal.to_string()));
        }
        Err(e @ RetryError::Exhausted { .. }) => {
            return Err(LifecycleError::PeerModule(format!(
                "{NETWORK_DRIVER} and {companion}: {e}"
            )));
        }
    }

    info!("Loading NVIDIA Peer Memory kernel module...");
    let params = ModuleParams::load_modules(&paths.module_config_dir, &[NVIDIA_PEERMEM])?;
    host.peer_loader
        .load(NVIDIA_PEERMEM, params.get(NVIDIA_PEERMEM))?;
    if !host.modules.is_loaded(NVIDIA_PEERMEM) {
        return Err(LifecycleError::PeerModule(
            "module is not loaded after modprobe".into(),
        ));
    }
    if let Some(signal) = signals.abort_signal() {
        return Err(LifecycleError::Interrupted(signal.as_str().to_string()));
    }
    signals.set_stage(WatchStage::Parked);
    Ok(())
}

/// Wait for a terminating signal. Wake-ups are ignored.
pub async fn park(signals: &SignalRouter<WatchStage>) -> Option<Signal> {
    info!("Done, now waiting for signal");
    loop {
        match signals.next().await {
            Some(Directive {
                action: SignalAction::Wake,
                ..
            }) => continue,
            Some(directive) => return Some(directive.signal),
            None => return None,
        }
    }
}

/// `reload` followed by `park`: the long-running watcher mode.
pub async fn watch(
    use_host_mofed: bool,
    paths: &Paths,
    host: &Host,
    signals: &SignalRouter<WatchStage>,
    policy: RetryPolicy,
) -> Result<(), LifecycleError> {
    reload(use_host_mofed, paths, host, signals, policy).await?;
    if let Some(signal) = park(signals).await {
        info!("Caught {}, exiting", signal.as_str());
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeStatus {
    /// Network driver absent; nothing to check yet.
    NotApplicable,
    Loaded,
    Missing,
}

impl ProbeStatus {
    pub fn is_healthy(self) -> bool {
        self != ProbeStatus::Missing
    }
}

pub fn probe(modules: &dyn ModuleInspector) -> ProbeStatus {
    if !modules.is_loaded(NETWORK_DRIVER) {
        ProbeStatus::NotApplicable
    } else if modules.is_loaded(NVIDIA_PEERMEM) {
        ProbeStatus::Loaded
    } else {
        ProbeStatus::Missing
    }
}
