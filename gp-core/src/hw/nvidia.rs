//! DeviceBackend over nvidia-smi

use tracing::debug;

use super::DeviceBackend;
use crate::data::{BusAddress, Capability, GpuDevice, Toggle};
use gp_error::Result;
use gp_gpu::nvidia;

#[derive(Debug, Default, Clone, Copy)]
pub struct NvidiaBackend;

impl NvidiaBackend {
    pub fn new() -> Self {
        Self
    }
}

impl DeviceBackend for NvidiaBackend {
    fn query_devices(&self) -> Result<Vec<GpuDevice>> {
        gp_gpu::enumerate_gpus()
    }

    fn destroy_dependents(&self, device: &BusAddress, capability: Capability) -> Result<()> {
        if !capability.has_dependents() {
            return Ok(());
        }
        debug!("Destroying MIG instances on {}", device);
        nvidia::destroy_mig_instances(device)
    }

    fn apply(&self, device: &BusAddress, capability: Capability, value: Toggle) -> Result<()> {
        nvidia::set_capability(device, capability, value)
    }

    fn reset(&self, device: &BusAddress) -> Result<()> {
        nvidia::reset_device(device)
    }

    fn probe_available(&self) -> bool {
        nvidia::probe_available()
    }

    fn tool_version(&self) -> Option<String> {
        nvidia::driver_version()
    }
}
