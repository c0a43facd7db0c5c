use crate::params::ModuleParams;

pub const NVIDIA: &str = "nvidia";
pub const NVIDIA_UVM: &str = "nvidia-uvm";
pub const NVIDIA_MODESET: &str = "nvidia-modeset";
pub const NVIDIA_PEERMEM: &str = "nvidia-peermem";

/// Kernel helpers the driver links against. Loaded without parameters and
/// never unloaded here.
pub const BASE_MODULES: [&str; 3] = ["i2c_core", "ipmi_msghandler", "ipmi_devintf"];

/// Driver modules in load order, each with its own parameter file.
pub const DRIVER_MODULES: [(&str, ModuleRank); 4] = [
    (NVIDIA, ModuleRank::Primary),
    (NVIDIA_UVM, ModuleRank::Secondary),
    (NVIDIA_MODESET, ModuleRank::Secondary),
    (NVIDIA_PEERMEM, ModuleRank::Peer),
];

/// Modules removed by an unload pass, in catalogue order.
pub const UNLOAD_SET: [&str; 4] = [NVIDIA_MODESET, NVIDIA_UVM, NVIDIA, NVIDIA_PEERMEM];

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ModuleRank {
    Base,
    Primary,
    Secondary,
    Peer,
}

/// Name of a module as the kernel spells it under `/sys/module`.
pub fn sysfs_name(module: &str) -> String {
    module.replace('-', "_")
}

pub fn same_module(a: &str, b: &str) -> bool {
    sysfs_name(a) == sysfs_name(b)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleSpec {
    name: String,
    params: Vec<String>,
    rank: ModuleRank,
}

impl ModuleSpec {
    pub fn new(name: impl Into<String>, params: Vec<String>, rank: ModuleRank) -> Self {
        ModuleSpec {
            name: name.into(),
            params,
            rank,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn params(&self) -> &[String] {
        &self.params
    }

    pub fn rank(&self) -> ModuleRank {
        self.rank
    }
}

/// The driver modules of one lifecycle run, ordered by rank.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ModuleSet {
    specs: Vec<ModuleSpec>,
}

impl ModuleSet {
    pub fn from_params(params: &ModuleParams) -> Self {
        let mut specs: Vec<ModuleSpec> = DRIVER_MODULES
            .iter()
            .map(|(name, rank)| ModuleSpec::new(*name, params.get(name).to_vec(), *rank))
            .collect();
        // stable: keeps catalogue order inside a rank
        specs.sort_by_key(ModuleSpec::rank);
        ModuleSet { specs }
    }

    pub fn get(&self, name: &str) -> Option<&ModuleSpec> {
        self.specs.iter().find(|spec| same_module(spec.name(), name))
    }

    pub fn iter(&self) -> impl Iterator<Item = &ModuleSpec> {
        self.specs.iter()
    }

    pub fn ranked(&self, rank: ModuleRank) -> impl Iterator<Item = &ModuleSpec> {
        self.specs.iter().filter(move |spec| spec.rank() == rank)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sysfs_name() {
        assert_eq!(sysfs_name("nvidia-uvm"), "nvidia_uvm");
        assert_eq!(sysfs_name("nvidia"), "nvidia");
        assert!(same_module("nvidia-peermem", "nvidia_peermem"));
        assert!(!same_module("nvidia", "nvidia_uvm"));
    }

    #[test]
    fn test_module_set_order() {
        let params = ModuleParams::from_entries([(NVIDIA, vec!["NVreg_EnableGpuFirmware=0".into()])]);
        let set = ModuleSet::from_params(&params);

        let names: Vec<&str> = set.iter().map(ModuleSpec::name).collect();
        assert_eq!(names, vec![NVIDIA, NVIDIA_UVM, NVIDIA_MODESET, NVIDIA_PEERMEM]);
        assert_eq!(set.get("nvidia").unwrap().params(), ["NVreg_EnableGpuFirmware=0"]);
        assert!(set.get("nvidia_uvm").unwrap().params().is_empty());
        assert_eq!(set.ranked(ModuleRank::Secondary).count(), 2);
    }
}
