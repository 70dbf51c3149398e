//! In-memory collaborators for end-to-end tests
//!
//! These model just enough device, bus and module behaviour to drive a full
//! run without hardware: applied values land as pending, a reset promotes
//! pending to current, a rescan claims the windows of detached devices.
//!
//! Compiled for unit tests and with the `fakes` feature.

use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;

use crate::data::{BusAddress, Capability, CapabilityReading, GpuDevice, GpuIdentity, Toggle};
use crate::hw::{
    BusControl, DeviceBackend, DiagnosticSource, ModuleControl, Platform, RawDiagnostic, ToolLocator,
};
use gp_error::{ProvisionError, Result};

/// Builds a device with known MIG and ECC values; None marks unsupported
///
/// Panics on a malformed bus address.
pub fn create_mock_gpu(index: u32, bus: &str, mig: Option<Toggle>, ecc: Option<Toggle>) -> GpuDevice {
    let reading = |value: Option<Toggle>| match value {
        Some(v) => CapabilityReading::known(v, None),
        None => CapabilityReading::unsupported(),
    };
    GpuDevice {
        identity: GpuIdentity {
            index,
            bus: BusAddress::parse(bus).expect("valid bus address"),
            serial: Some(format!("132092100{:04}", index)),
            uuid: Some(format!("GPU-00000000-0000-0000-0000-{:012}", index)),
            name: "NVIDIA H100 80GB HBM3".to_string(),
        },
        capabilities: BTreeMap::from([(Capability::Mig, reading(mig)), (Capability::Ecc, reading(ecc))]),
    }
}

#[derive(Debug, Default)]
pub struct FakeBackend {
    devices: RefCell<Vec<GpuDevice>>,
    /// Reset succeeds but pending values stay pending
    pub sticky_reset: bool,
    pub reset_fails: bool,
    pub never_available: bool,
    /// (device, capability) pairs whose set command fails
    pub failing_sets: Vec<(BusAddress, Capability)>,
    calls: RefCell<Vec<String>>,
}

impl FakeBackend {
    pub fn new(devices: Vec<GpuDevice>) -> Self {
        Self {
            devices: RefCell::new(devices),
            ..Default::default()
        }
    }

    /// Commands received so far, e.g. `apply 0000:17:00.0 mig disabled`
    pub fn calls(&self) -> Vec<String> {
        self.calls.borrow().clone()
    }

    pub fn count(&self, prefix: &str) -> usize {
        self.calls.borrow().iter().filter(|c| c.starts_with(prefix)).count()
    }

    pub fn devices(&self) -> Vec<GpuDevice> {
        self.devices.borrow().clone()
    }

    fn log(&self, call: String) {
        self.calls.borrow_mut().push(call);
    }
}

impl DeviceBackend for FakeBackend {
    fn query_devices(&self) -> Result<Vec<GpuDevice>> {
        self.log("query".to_string());
        // the changed flag belongs to the engine, the tool never reports it
        let mut devices = self.devices();
        for device in &mut devices {
            for reading in device.capabilities.values_mut() {
                reading.changed = false;
            }
        }
        Ok(devices)
    }

    fn destroy_dependents(&self, device: &BusAddress, capability: Capability) -> Result<()> {
        self.log(format!("destroy {} {}", device, capability));
        Ok(())
    }

    fn apply(&self, device: &BusAddress, capability: Capability, value: Toggle) -> Result<()> {
        self.log(format!("apply {} {} {}", device, capability, value));
        if self.failing_sets.iter().any(|(d, c)| d == device && *c == capability) {
            return Err(ProvisionError::generic(format!("Unable to set {} on {}", capability, device)));
        }
        let mut devices = self.devices.borrow_mut();
        let target = devices
            .iter_mut()
            .find(|d| d.id() == device)
            .ok_or_else(|| ProvisionError::DeviceNotFound(device.to_string()))?;
        let reading = target
            .capabilities
            .get_mut(&capability)
            .filter(|r| r.supported)
            .ok_or_else(|| ProvisionError::Unsupported {
                device: device.to_string(),
                capability: capability.to_string(),
            })?;
        reading.pending = Some(value);
        Ok(())
    }

    fn reset(&self, device: &BusAddress) -> Result<()> {
        self.log(format!("reset {}", device));
        if self.reset_fails {
            return Err(ProvisionError::generic("GPU reset not supported on this platform"));
        }
        if !self.sticky_reset {
            let mut devices = self.devices.borrow_mut();
            if let Some(target) = devices.iter_mut().find(|d| d.id() == device) {
                for reading in target.capabilities.values_mut() {
                    if let Some(pending) = reading.pending.take() {
                        reading.current = Some(pending);
                    }
                }
            }
        }
        Ok(())
    }

    fn probe_available(&self) -> bool {
        !self.never_available
    }

    fn tool_version(&self) -> Option<String> {
        Some("550.54.15".to_string())
    }
}

#[derive(Debug)]
pub struct FakePlatform {
    pub hostname: String,
    pub secure_boot: Option<String>,
    reboots: Cell<u32>,
}

impl Default for FakePlatform {
    fn default() -> Self {
        Self {
            hostname: "gpu-node-01".to_string(),
            secure_boot: Some("disabled".to_string()),
            reboots: Cell::new(0),
        }
    }
}

impl FakePlatform {
    pub fn reboots(&self) -> u32 {
        self.reboots.get()
    }
}

impl Platform for FakePlatform {
    fn trigger_reboot(&self) -> Result<()> {
        self.reboots.set(self.reboots.get() + 1);
        Ok(())
    }

    fn hostname(&self) -> String {
        self.hostname.clone()
    }

    fn secure_boot_state(&self) -> Option<String> {
        self.secure_boot.clone()
    }
}

/// Module loader that fails a fixed number of times
#[derive(Debug, Default)]
pub struct FakeModules {
    loaded: Cell<bool>,
    failures_left: Cell<u32>,
    attempts: Cell<u32>,
}

impl FakeModules {
    pub fn loaded() -> Self {
        let modules = Self::default();
        modules.loaded.set(true);
        modules
    }

    pub fn failing(times: u32) -> Self {
        let modules = Self::default();
        modules.failures_left.set(times);
        modules
    }

    pub fn attempts(&self) -> u32 {
        self.attempts.get()
    }
}

impl ModuleControl for FakeModules {
    fn is_loaded(&self, _module: &str) -> bool {
        self.loaded.get()
    }

    fn load(&self, module: &str) -> Result<()> {
        self.attempts.set(self.attempts.get() + 1);
        let left = self.failures_left.get();
        if left > 0 {
            self.failures_left.set(left - 1);
            return Err(ProvisionError::ModuleLoad {
                module: module.to_string(),
                reason: "No such device".to_string(),
            });
        }
        self.loaded.set(true);
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FakeWindow {
    hardware: u64,
    kernel: u64,
}

/// PCI bus with per-device BAR0 state and a static resource map
#[derive(Debug, Default)]
pub struct FakeBus {
    resource_map: String,
    windows: RefCell<BTreeMap<BusAddress, FakeWindow>>,
    detached: RefCell<BTreeSet<BusAddress>>,
    writes: RefCell<Vec<(BusAddress, u64)>>,
    rescans: Cell<u32>,
}

impl FakeBus {
    pub fn new(resource_map: impl Into<String>) -> Self {
        Self {
            resource_map: resource_map.into(),
            ..Default::default()
        }
    }

    /// Add a device with its hardware and kernel-claimed BAR0
    pub fn with_device(self, address: &str, hardware: u64, kernel: u64) -> Self {
        if let Some(address) = BusAddress::parse(address) {
            self.windows.borrow_mut().insert(address, FakeWindow { hardware, kernel });
        }
        self
    }

    pub fn writes(&self) -> Vec<(BusAddress, u64)> {
        self.writes.borrow().clone()
    }

    pub fn rescans(&self) -> u32 {
        self.rescans.get()
    }

    fn window(&self, device: &BusAddress) -> Result<FakeWindow> {
        if self.detached.borrow().contains(device) {
            return Err(ProvisionError::DeviceNotFound(device.to_string()));
        }
        self.windows
            .borrow()
            .get(device)
            .copied()
            .ok_or_else(|| ProvisionError::DeviceNotFound(device.to_string()))
    }
}

impl BusControl for FakeBus {
    fn target_devices(&self) -> Result<Vec<BusAddress>> {
        Ok(self.windows.borrow().keys().cloned().collect())
    }

    fn resource_map(&self) -> Result<String> {
        Ok(self.resource_map.clone())
    }

    fn hardware_window(&self, device: &BusAddress) -> Result<u64> {
        Ok(self.window(device)?.hardware)
    }

    fn kernel_window(&self, device: &BusAddress) -> Result<u64> {
        Ok(self.window(device)?.kernel)
    }

    fn detach(&self, device: &BusAddress) -> Result<()> {
        self.window(device)?;
        self.detached.borrow_mut().insert(device.clone());
        Ok(())
    }

    fn write_window(&self, device: &BusAddress, base: u64) -> Result<()> {
        let mut windows = self.windows.borrow_mut();
        let window = windows
            .get_mut(device)
            .ok_or_else(|| ProvisionError::DeviceNotFound(device.to_string()))?;
        window.hardware = base;
        self.writes.borrow_mut().push((device.clone(), base));
        Ok(())
    }

    fn rescan(&self) -> Result<()> {
        self.rescans.set(self.rescans.get() + 1);
        let mut windows = self.windows.borrow_mut();
        for device in std::mem::take(&mut *self.detached.borrow_mut()) {
            if let Some(window) = windows.get_mut(&device) {
                window.kernel = window.hardware;
            }
        }
        Ok(())
    }
}

/// Finds every tool except the listed ones
#[derive(Debug, Default, Clone)]
pub struct FakeLocator {
    pub missing: Vec<String>,
}

impl FakeLocator {
    pub fn missing(tools: &[&str]) -> Self {
        Self {
            missing: tools.iter().map(|t| t.to_string()).collect(),
        }
    }
}

impl ToolLocator for FakeLocator {
    fn locate(&self, tool: &str) -> Option<PathBuf> {
        if self.missing.iter().any(|m| m == tool) {
            None
        } else {
            Some(PathBuf::from("/usr/bin").join(tool))
        }
    }
}

/// Diagnostic source returning canned output
#[derive(Debug, Clone)]
pub struct StaticDiagnostics {
    pub raw: RawDiagnostic,
}

impl StaticDiagnostics {
    pub fn new(text: impl Into<String>, exit_ok: bool) -> Self {
        Self {
            raw: RawDiagnostic {
                source: "dcgmi diag -r 2".to_string(),
                text: text.into(),
                exit_ok,
            },
        }
    }
}

impl DiagnosticSource for StaticDiagnostics {
    fn collect(&self) -> Result<RawDiagnostic> {
        Ok(self.raw.clone())
    }
}
