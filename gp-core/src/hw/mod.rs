//! Hardware and platform collaborators
//!
//! The engine only talks to devices, the PCI bus, the module loader and the
//! machine through these traits. Real implementations live in the
//! submodules; tests use the mockall mocks or [`crate::fakes`].

mod diagnostics;
mod modules;
mod nvidia;
mod platform;
mod sysfs;

pub use diagnostics::{DcgmSource, FileSource};
pub use modules::Modprobe;
pub use nvidia::NvidiaBackend;
pub use platform::{PathLocator, SystemPlatform};
pub use sysfs::{parse_resource_start, read_bar0, SysfsBus};

use std::path::PathBuf;

use crate::data::{BusAddress, Capability, GpuDevice, Toggle};
use gp_error::Result;

/// Query and control of the devices under provisioning
#[cfg_attr(test, mockall::automock)]
pub trait DeviceBackend {
    /// Enumerate devices with their capability readings
    fn query_devices(&self) -> Result<Vec<GpuDevice>>;

    /// Tear down sub-resources that block changing `capability`
    fn destroy_dependents(&self, device: &BusAddress, capability: Capability) -> Result<()>;

    fn apply(&self, device: &BusAddress, capability: Capability, value: Toggle) -> Result<()>;

    /// In-place reset of a single device
    fn reset(&self, device: &BusAddress) -> Result<()>;

    /// Devices answer queries again
    fn probe_available(&self) -> bool;

    fn tool_version(&self) -> Option<String>;
}

/// Machine-level actions
#[cfg_attr(test, mockall::automock)]
pub trait Platform {
    /// Flush and start a reboot; returns once the reboot is requested
    fn trigger_reboot(&self) -> Result<()>;

    fn hostname(&self) -> String;

    /// Secure Boot state as reported by firmware, None if unknown
    fn secure_boot_state(&self) -> Option<String>;
}

/// PCI bus access used by the window repair
#[cfg_attr(test, mockall::automock)]
pub trait BusControl {
    /// Target-class devices present on the bus, in bus order
    fn target_devices(&self) -> Result<Vec<BusAddress>>;

    /// Raw `/proc/iomem` style resource map
    fn resource_map(&self) -> Result<String>;

    /// BAR0 base as programmed in hardware (config space)
    fn hardware_window(&self, device: &BusAddress) -> Result<u64>;

    /// BAR0 base as claimed by the kernel, 0 when unclaimed
    fn kernel_window(&self, device: &BusAddress) -> Result<u64>;

    /// Remove the device from the kernel's view
    fn detach(&self, device: &BusAddress) -> Result<()>;

    /// Program a new BAR0 base into a detached device
    fn write_window(&self, device: &BusAddress, base: u64) -> Result<()>;

    /// Rescan the bus and wait for the platform to settle
    fn rescan(&self) -> Result<()>;
}

/// Kernel module loading
#[cfg_attr(test, mockall::automock)]
pub trait ModuleControl {
    fn is_loaded(&self, module: &str) -> bool;

    fn load(&self, module: &str) -> Result<()>;
}

/// Raw diagnostic output as produced by the tool
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawDiagnostic {
    /// Where the text came from (`dcgmi diag -r 2`, a file path)
    pub source: String,
    pub text: String,
    /// The producing tool exited with status 0
    pub exit_ok: bool,
}

#[cfg_attr(test, mockall::automock)]
pub trait DiagnosticSource {
    fn collect(&self) -> Result<RawDiagnostic>;
}

#[cfg_attr(test, mockall::automock)]
pub trait ToolLocator {
    fn locate(&self, tool: &str) -> Option<PathBuf>;
}
