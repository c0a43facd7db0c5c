use std::fs;
use std::path::{Path, PathBuf};

use tracing::debug;

/// PCI vendor id of the companion network adapters.
pub const MELLANOX_VENDOR_ID: &str = "0x15b3";

/// VPD keyword carried by the management NIC of an NVLink5 switch tray.
const NVLINK5_VPD_MARKER: &[u8] = b"SW_MNG";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum FabricTopology {
    #[default]
    None,
    /// NVSwitch systems served by the classic fabric manager.
    LegacySwitch,
    /// NVLink5 systems, which also need the subnet manager.
    NextGenSwitch,
}

/// Read-only view of the devices on the local bus.
pub trait DeviceBus: Send + Sync {
    fn has_vendor(&self, vendor: &str) -> bool;

    fn topology(&self) -> FabricTopology;
}

#[derive(Debug, Clone)]
pub struct SysfsBus {
    pci_devices: PathBuf,
    nvswitch_devices: PathBuf,
}

impl SysfsBus {
    pub fn new(pci_devices: impl Into<PathBuf>, nvswitch_devices: impl Into<PathBuf>) -> Self {
        SysfsBus {
            pci_devices: pci_devices.into(),
            nvswitch_devices: nvswitch_devices.into(),
        }
    }

    fn devices(&self) -> Vec<PathBuf> {
        match fs::read_dir(&self.pci_devices) {
            Ok(entries) => entries.flatten().map(|entry| entry.path()).collect(),
            Err(e) => {
                debug!("cannot list {}: {e}", self.pci_devices.display());
                Vec::new()
            }
        }
    }

    fn is_nvlink5(&self) -> bool {
        self.devices()
            .iter()
            .filter(|dev| vendor_matches(dev, MELLANOX_VENDOR_ID))
            .any(|dev| match fs::read(dev.join("vpd")) {
                Ok(vpd) => vpd
                    .windows(NVLINK5_VPD_MARKER.len())
                    .any(|window| window == NVLINK5_VPD_MARKER),
                Err(_) => false,
            })
    }

    fn has_nvswitch(&self) -> bool {
        fs::read_dir(&self.nvswitch_devices)
            .map(|mut entries| entries.next().is_some())
            .unwrap_or(false)
    }
}

fn vendor_matches(device: &Path, vendor: &str) -> bool {
    fs::read_to_string(device.join("vendor"))
        .map(|id| id.trim().eq_ignore_ascii_case(vendor))
        .unwrap_or(false)
}

impl DeviceBus for SysfsBus {
    fn has_vendor(&self, vendor: &str) -> bool {
        self.devices().iter().any(|dev| vendor_matches(dev, vendor))
    }

    fn topology(&self) -> FabricTopology {
        if self.is_nvlink5() {
            FabricTopology::NextGenSwitch
        } else if self.has_nvswitch() {
            FabricTopology::LegacySwitch
        } else {
            FabricTopology::None
        }
    }
}
