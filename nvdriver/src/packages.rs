use std::path::PathBuf;

use anyhow::{Context, bail};
use async_trait::async_trait;
use tokio::process::Command;
use tracing::info;

use crate::kernel_type::KernelType;
use crate::topology::FabricTopology;

/// What the lifecycle needs installed; package naming is the installer's
/// concern.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallRequest {
    pub branch: u32,
    pub kernel_type: KernelType,
    pub kernel_release: String,
    pub arch: String,
    pub topology: FabricTopology,
    pub accept_license: bool,
}

#[async_trait]
pub trait PackageInstaller: Send + Sync {
    async fn install(&self, request: &InstallRequest) -> anyhow::Result<()>;
}

/// Installs the driver from an apt repository.
#[derive(Debug, Clone)]
pub struct AptInstaller {
    program: PathBuf,
}

impl Default for AptInstaller {
    fn default() -> Self {
        AptInstaller {
            program: PathBuf::from("apt-get"),
        }
    }
}

impl AptInstaller {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        AptInstaller {
            program: program.into(),
        }
    }

    pub fn packages(request: &InstallRequest) -> Vec<String> {
        let flavour = match request.kernel_type {
            KernelType::Open => "-open",
            KernelType::Proprietary => "",
        };
        let branch = request.branch;
        let mut packages = vec![
            format!("nvidia-driver-{branch}{flavour}"),
            format!(
                "linux-modules-nvidia-{branch}{flavour}-{}",
                request.kernel_release
            ),
        ];
        match request.topology {
            FabricTopology::None => {}
            FabricTopology::LegacySwitch => {
                packages.push(format!("nvidia-fabricmanager-{branch}"));
            }
            FabricTopology::NextGenSwitch => {
                packages.push(format!("nvidia-fabricmanager-{branch}"));
                packages.push("nvlsm".to_string());
            }
        }
        packages
    }

    async fn run(&self, args: &[String], noninteractive: bool) -> anyhow::Result<()> {
        let mut cmd = Command::new(&self.program);
        cmd.args(args);
        if noninteractive {
            cmd.env("DEBIAN_FRONTEND", "noninteractive");
        }
        let status = cmd
            .status()
            .await
            .with_context(|| format!("failed to run {}", self.program.display()))?;
        if !status.success() {
            bail!("{} {} exited with {status}", self.program.display(), args.join(" "));
        }
        Ok(())
    }
}

#[async_trait]
impl PackageInstaller for AptInstaller {
    async fn install(&self, request: &InstallRequest) -> anyhow::Result<()> {
        let packages = Self::packages(request);
        info!(
            "Installing NVIDIA driver {} ({}, {}) packages: {}",
            request.branch,
            request.kernel_type,
            request.arch,
            packages.join(" ")
        );

        self.run(&["-qq".to_string(), "update".to_string()], true)
            .await?;

        let mut args = vec!["install".to_string(), "--no-install-recommends".to_string()];
        if request.accept_license {
            args.push("-y".to_string());
        }
        args.extend(packages);
        self.run(&args, request.accept_license).await
    }
}
