//! Kernel module primitives used by the GPU driver container.
//!
//! The crate knows the driver's module catalogue, reads per-module parameter
//! files, inspects live module state through sysfs and drives the host's
//! `modprobe`/`rmmod` tools. Everything that touches the host sits behind the
//! [`ModuleInspector`] and [`ModuleLoader`] traits so callers can substitute
//! fakes.

pub mod catalog;
pub mod error;
pub mod inspect;
pub mod load;
pub mod loader;
pub mod params;
pub mod unload;

pub use catalog::{ModuleRank, ModuleSet, ModuleSpec};
pub use error::KmodError;
pub use inspect::{ModuleInspector, ModuleRuntimeState, SysfsModules};
pub use load::{LoadOptions, load_modules};
pub use loader::{ModuleLoader, Modprobe};
pub use params::ModuleParams;
pub use unload::{BusyPolicy, DependentCountPolicy, UnloadOutcome, UnloadPlan, Unloader};
