use std::sync::Arc;

use anyhow::{Context, bail};
use libkmod::{ModuleInspector, SysfsModules};
use tracing::info;

use crate::cli::{Cli, Commands};
use crate::config::{DriverConfig, Paths};
use crate::host::Host;
use crate::lifecycle::Lifecycle;
use crate::peermem::{self, ProbeStatus, RELOAD_POLICY, WatchStage};
use crate::signals::{self, SignalRouter};

pub async fn run(cli: Cli) -> anyhow::Result<()> {
    let paths = Paths::default();
    match cli.command {
        Commands::Init { accept_license } => init(cli.env.into_config(accept_license)?, paths).await,
        Commands::ReloadNvidiaPeermem => reload_peermem(cli.env.use_host_mofed, paths).await,
        Commands::ProbeNvidiaPeermem => probe_peermem(&SysfsModules::new(&paths.sys_module)),
    }
}

pub async fn init(config: DriverConfig, paths: Paths) -> anyhow::Result<()> {
    let host = Host::system(&paths).context("failed to inspect the host")?;
    let lifecycle = Lifecycle::new(config, paths, host);
    signals::spawn_listener(lifecycle.signals()).context("failed to install signal handlers")?;
    lifecycle.run().await?;
    Ok(())
}

pub async fn reload_peermem(use_host_mofed: bool, paths: Paths) -> anyhow::Result<()> {
    let host = Host::system(&paths).context("failed to inspect the host")?;
    let router = Arc::new(SignalRouter::new(WatchStage::Polling));
    signals::spawn_listener(router.clone()).context("failed to install signal handlers")?;
    peermem::watch(use_host_mofed, &paths, &host, &router, RELOAD_POLICY).await?;
    Ok(())
}

pub fn probe_peermem(modules: &dyn ModuleInspector) -> anyhow::Result<()> {
    let status = peermem::probe(modules);
    if status == ProbeStatus::NotApplicable {
        info!("{} is not loaded, skipping nvidia-peermem check", peermem::NETWORK_DRIVER);
    }
    if !status.is_healthy() {
        bail!(
            "{} is loaded but nvidia-peermem is not",
            peermem::NETWORK_DRIVER
        );
    }
    Ok(())
}
