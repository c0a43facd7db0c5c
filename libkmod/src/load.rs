use tracing::info;

use crate::catalog::{BASE_MODULES, ModuleRank, ModuleSet};
use crate::error::KmodError;
use crate::loader::ModuleLoader;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoadOptions {
    /// Load the peer-memory module. Callers set this only when the feature is
    /// enabled and a companion NIC is present.
    pub peer_memory: bool,
}

/// Load the driver in dependency order: base helpers, the primary module,
/// secondary modules, then the optional peer module.
///
/// The first failure is returned as is. Modules loaded earlier in the pass
/// stay loaded; the next unload pass removes them.
pub fn load_modules(
    loader: &dyn ModuleLoader,
    modules: &ModuleSet,
    options: LoadOptions,
) -> Result<Vec<String>, KmodError> {
    let mut loaded = Vec::new();

    info!("Loading ipmi and i2c_core kernel modules...");
    loader.load_all(&BASE_MODULES)?;

    info!("Loading NVIDIA driver kernel modules...");
    for rank in [ModuleRank::Primary, ModuleRank::Secondary] {
        for spec in modules.ranked(rank) {
            loader.load(spec.name(), spec.params())?;
            loaded.push(spec.name().to_string());
        }
    }

    if options.peer_memory {
        info!("Loading NVIDIA Peer Memory kernel module...");
        for spec in modules.ranked(ModuleRank::Peer) {
            loader.load(spec.name(), spec.params())?;
            loaded.push(spec.name().to_string());
        }
    }

    Ok(loaded)
}
