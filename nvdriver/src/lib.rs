//! Lifecycle orchestrator for the NVIDIA GPU driver container.
//!
//! `init` installs the driver, loads its kernel modules, starts the daemons
//! the fabric needs, exposes the driver root at `/run/nvidia/driver` and holds
//! everything until a termination signal, then tears it down again. The peer
//! watcher modes keep `nvidia-peermem` in step with the network driver.

pub mod cli;
pub mod commands;
pub mod config;
pub mod daemon;
pub mod error;
pub mod host;
pub mod kernel_type;
pub mod lifecycle;
pub mod lock;
pub mod packages;
pub mod peermem;
pub mod retry;
pub mod rootfs;
pub mod signals;
pub mod topology;

pub use config::{DriverConfig, KernelModuleType, Paths};
pub use error::LifecycleError;
pub use host::Host;
pub use lifecycle::{Lifecycle, LifecycleState};
