use anyhow::Context;
use clap::builder::BoolishValueParser;
use clap::{ArgAction, Args, Parser, Subcommand};

use crate::config::{DriverConfig, KernelModuleType, driver_arch};

#[derive(Parser, Debug)]
#[command(name = "nvidia-driver", version, about = "Load, hold and unload the NVIDIA GPU driver", long_about = None)]
pub struct Cli {
    #[command(flatten)]
    pub env: EnvArgs,

    #[command(subcommand)]
    pub command: Commands,
}

/// Settings normally provided by the container environment.
#[derive(Args, Debug, Clone, PartialEq, Eq)]
pub struct EnvArgs {
    /// Driver branch, e.g. 570
    #[arg(long, env = "DRIVER_BRANCH", hide = true, value_parser = clap::value_parser!(u32).range(1..))]
    pub driver_branch: Option<u32>,

    /// Container platform architecture (amd64, arm64)
    #[arg(long, env = "TARGETARCH", hide = true)]
    pub target_arch: Option<String>,

    #[arg(
        long,
        env = "KERNEL_MODULE_TYPE",
        hide = true,
        value_enum,
        ignore_case = true,
        default_value_t = KernelModuleType::Auto
    )]
    pub kernel_module_type: KernelModuleType,

    #[arg(
        long,
        env = "GPU_DIRECT_RDMA_ENABLED",
        hide = true,
        action = ArgAction::Set,
        value_parser = BoolishValueParser::new(),
        default_value = "false"
    )]
    pub gpu_direct_rdma_enabled: bool,

    #[arg(
        long,
        env = "USE_HOST_MOFED",
        hide = true,
        action = ArgAction::Set,
        value_parser = BoolishValueParser::new(),
        default_value = "false"
    )]
    pub use_host_mofed: bool,
}

impl EnvArgs {
    pub fn into_config(self, accept_license: bool) -> anyhow::Result<DriverConfig> {
        let driver_branch = self
            .driver_branch
            .context("DRIVER_BRANCH must be set to the driver branch, aborting")?;
        let target_arch = self
            .target_arch
            .context("TARGETARCH must be set, aborting")?;
        Ok(DriverConfig {
            driver_branch,
            driver_arch: driver_arch(&target_arch),
            kernel_module_type: self.kernel_module_type,
            gpu_direct_rdma: self.gpu_direct_rdma_enabled,
            use_host_mofed: self.use_host_mofed,
            accept_license,
        })
    }
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Commands {
    #[command(about = "Install, load and hold the driver until a termination signal")]
    Init {
        /// Accept the driver license non-interactively
        #[arg(short = 'a', long)]
        accept_license: bool,
    },
    #[command(
        name = "reload_nvidia_peermem",
        about = "Wait for the network driver, then load nvidia-peermem"
    )]
    ReloadNvidiaPeermem,
    #[command(
        name = "probe_nvidia_peermem",
        about = "Exit non-zero if mlx5_core is loaded without nvidia-peermem"
    )]
    ProbeNvidiaPeermem,
}
