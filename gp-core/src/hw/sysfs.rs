//! BusControl over sysfs and setpci
//!
//! Device attributes are read from `<root>/bus/pci/devices/<addr>/`. The
//! hardware BAR0 value comes from the raw `config` file, the kernel's view
//! from the first line of `resource`.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

use super::BusControl;
use crate::constants::bus;
use crate::data::BusAddress;
use crate::retry::{Clock, SystemClock};
use gp_error::{ProvisionError, Result};

#[derive(Debug, Clone)]
pub struct SysfsBus<C = SystemClock> {
    root: PathBuf,
    iomem: PathBuf,
    vendor_id: String,
    setpci: String,
    settle: Duration,
    clock: C,
}

impl SysfsBus {
    pub fn new(root: impl Into<PathBuf>, iomem: impl Into<PathBuf>, vendor_id: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            iomem: iomem.into(),
            vendor_id: vendor_id.into().to_ascii_lowercase(),
            setpci: bus::SETPCI.to_string(),
            settle: Duration::from_millis(bus::DEFAULT_RESCAN_SETTLE_MS),
            clock: SystemClock,
        }
    }
}

impl<C: Clock> SysfsBus<C> {
    pub fn with_settle(mut self, settle: Duration) -> Self {
        self.settle = settle;
        self
    }

    /// Wait out the post-rescan settle on another clock
    pub fn with_clock<K: Clock>(self, clock: K) -> SysfsBus<K> {
        SysfsBus {
            root: self.root,
            iomem: self.iomem,
            vendor_id: self.vendor_id,
            setpci: self.setpci,
            settle: self.settle,
            clock,
        }
    }

    pub fn with_setpci(mut self, setpci: impl Into<String>) -> Self {
        self.setpci = setpci.into();
        self
    }

    fn devices_dir(&self) -> PathBuf {
        self.root.join("bus/pci/devices")
    }

    fn device_dir(&self, device: &BusAddress) -> PathBuf {
        self.devices_dir().join(device.as_str())
    }

    fn write_attr(path: &Path, value: &str) -> Result<()> {
        fs::write(path, value).map_err(|e| write_error(path, e))
    }
}

fn write_error(path: &Path, err: io::Error) -> ProvisionError {
    match err.kind() {
        io::ErrorKind::PermissionDenied => {
            ProvisionError::PermissionDenied(format!("writing {}", path.display()))
        }
        _ => ProvisionError::sysfs(path, err.to_string()),
    }
}

fn read_attr(path: &Path) -> Option<String> {
    fs::read_to_string(path).ok().map(|s| s.trim().to_ascii_lowercase())
}

/// BAR0 base from raw config space bytes, flag bits masked off
pub fn read_bar0(config: &[u8]) -> Option<u64> {
    let offset = bus::BAR0_OFFSET as usize;
    let bytes: [u8; 4] = config.get(offset..offset + 4)?.try_into().ok()?;
    Some(u64::from(u32::from_le_bytes(bytes) & !bus::BAR_FLAG_MASK))
}

/// Start address from the first line of a sysfs `resource` file
pub fn parse_resource_start(contents: &str) -> Option<u64> {
    let first = contents.lines().next()?;
    let start = first.split_whitespace().next()?;
    u64::from_str_radix(start.trim_start_matches("0x"), 16).ok()
}

impl<C: Clock> BusControl for SysfsBus<C> {
    fn target_devices(&self) -> Result<Vec<BusAddress>> {
        let dir = self.devices_dir();
        let entries = fs::read_dir(&dir).map_err(|e| ProvisionError::sysfs(&dir, e.to_string()))?;

        let mut devices: Vec<BusAddress> = entries
            .flatten()
            .filter(|entry| {
                let path = entry.path();
                let vendor = read_attr(&path.join("vendor"));
                let class = read_attr(&path.join("class"));
                vendor.as_deref() == Some(self.vendor_id.as_str())
                    && class.is_some_and(|c| c.starts_with(bus::DISPLAY_CLASS_PREFIX))
            })
            .filter_map(|entry| BusAddress::parse(&entry.file_name().to_string_lossy()))
            .collect();
        devices.sort();
        debug!("Found {} target devices on the bus", devices.len());
        Ok(devices)
    }

    fn resource_map(&self) -> Result<String> {
        fs::read_to_string(&self.iomem).map_err(|e| ProvisionError::FileRead {
            path: self.iomem.clone(),
            source: e,
        })
    }

    fn hardware_window(&self, device: &BusAddress) -> Result<u64> {
        let path = self.device_dir(device).join("config");
        let config = fs::read(&path).map_err(|e| ProvisionError::sysfs(&path, e.to_string()))?;
        read_bar0(&config).ok_or_else(|| ProvisionError::sysfs(&path, "config space too short"))
    }

    fn kernel_window(&self, device: &BusAddress) -> Result<u64> {
        let path = self.device_dir(device).join("resource");
        let contents = fs::read_to_string(&path).map_err(|e| ProvisionError::sysfs(&path, e.to_string()))?;
        parse_resource_start(&contents).ok_or_else(|| ProvisionError::sysfs(&path, "unparseable resource line"))
    }

    fn detach(&self, device: &BusAddress) -> Result<()> {
        debug!("Detaching {}", device);
        Self::write_attr(&self.device_dir(device).join("remove"), "1")
    }

    fn write_window(&self, device: &BusAddress, base: u64) -> Result<()> {
        // the device is detached, so config space is reached through mechanism 1
        let assignment = format!("BASE_ADDRESS_0={:x}", base);
        gp_gpu::run_tool(&self.setpci, &["-H1", "-s", device.as_str(), &assignment])?;
        info!("Programmed {} BAR0 to {:#x}", device, base);
        Ok(())
    }

    fn rescan(&self) -> Result<()> {
        Self::write_attr(&self.root.join("bus/pci/rescan"), "1")?;
        self.clock.sleep(self.settle);
        Ok(())
    }
}
