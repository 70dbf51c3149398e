//! Diagnosis and repair of unclaimed register windows
//!
//! A device whose BAR0 is programmed in hardware but missing from the
//! kernel's resource view never gets a driver bound. The repair detaches the
//! affected devices, programs new bases from the window plan, rescans the bus
//! once and re-reads the kernel's view to see which ones came back.

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::allocator::{plan_windows, PlanMethod, WindowPlan, WindowRequest};
use super::iomem::claimed_ranges;
use crate::data::BusAddress;
use crate::hw::BusControl;
use crate::report::{Issue, IssueCategory, Stage};
use gp_error::Result;

/// Target device whose window the kernel did not claim
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnclaimedDevice {
    pub device: BusAddress,
    pub hardware_base: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RepairStatus {
    /// Kernel claims the new window after rescan
    Fixed,
    /// Written and rescanned, still unclaimed
    StillBroken,
    /// Not attempted or aborted before rescan
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceRepair {
    pub device: String,
    pub hardware_base: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assigned_base: Option<u64>,
    pub status: RepairStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepairSummary {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<PlanMethod>,
    pub devices: Vec<DeviceRepair>,
}

impl RepairSummary {
    pub fn count(&self, status: RepairStatus) -> usize {
        self.devices.iter().filter(|d| d.status == status).count()
    }

    pub fn fixed(&self) -> usize {
        self.count(RepairStatus::Fixed)
    }

    pub fn broken(&self) -> usize {
        self.devices.len() - self.fixed()
    }

    /// Issues for devices that did not come back
    ///
    /// Critical when the driver could not load at all, warning when it runs
    /// and only some devices are missing their window.
    pub fn issues(&self, driver_loaded: bool) -> Vec<Issue> {
        self.devices
            .iter()
            .filter(|d| d.status != RepairStatus::Fixed)
            .map(|d| {
                let mut message = match d.status {
                    RepairStatus::StillBroken => format!("{}: register window still unclaimed after rescan", d.device),
                    _ => format!("{}: register window repair did not complete", d.device),
                };
                if let Some(detail) = &d.detail {
                    message.push_str(": ");
                    message.push_str(detail);
                }
                let issue = if driver_loaded {
                    Issue::warning(IssueCategory::ResourceAllocation, Stage::Driver, message)
                } else {
                    Issue::critical(IssueCategory::ResourceAllocation, Stage::Driver, message)
                };
                issue.on_device(&d.device)
            })
            .collect()
    }
}

/// Target devices with a hardware BAR0 but no kernel claim
pub fn diagnose(bus: &dyn BusControl) -> Result<Vec<UnclaimedDevice>> {
    let mut unclaimed = Vec::new();
    for device in bus.target_devices()? {
        let hardware = match bus.hardware_window(&device) {
            Ok(base) => base,
            Err(e) => {
                warn!(%device, "Cannot read config space: {}", e);
                continue;
            }
        };
        let kernel = match bus.kernel_window(&device) {
            Ok(base) => base,
            Err(e) => {
                warn!(%device, "Cannot read kernel resource: {}", e);
                continue;
            }
        };
        debug!(%device, "BAR0 hardware {:#x} kernel {:#x}", hardware, kernel);
        if hardware != 0 && kernel == 0 {
            info!(%device, "BAR0 {:#x} not claimed by the kernel", hardware);
            unclaimed.push(UnclaimedDevice { device, hardware_base: hardware });
        }
    }
    Ok(unclaimed)
}

/// Plan windows for `unclaimed` against the current resource map
pub fn plan_repair(bus: &dyn BusControl, unclaimed: &[UnclaimedDevice], size: u64, ceiling: u64) -> Result<WindowPlan> {
    let claimed = claimed_ranges(&bus.resource_map()?, ceiling);
    let requests: Vec<WindowRequest> = unclaimed
        .iter()
        .map(|u| WindowRequest {
            device: u.device.clone(),
            hardware_base: u.hardware_base,
        })
        .collect();
    Ok(plan_windows(&requests, &claimed, size, ceiling))
}

/// Diagnose, plan and apply; per-device failures are recorded, not returned
pub fn repair(bus: &dyn BusControl, size: u64, ceiling: u64) -> Result<RepairSummary> {
    let unclaimed = diagnose(bus)?;
    if unclaimed.is_empty() {
        info!("All target devices have their register window claimed");
        return Ok(RepairSummary::default());
    }
    let plan = plan_repair(bus, &unclaimed, size, ceiling)?;
    Ok(apply_plan(bus, &unclaimed, &plan))
}

/// Detach, program, rescan once, re-verify
pub fn apply_plan(bus: &dyn BusControl, unclaimed: &[UnclaimedDevice], plan: &WindowPlan) -> RepairSummary {
    let mut devices: Vec<DeviceRepair> = Vec::with_capacity(plan.assignments.len());
    let mut detached = false;

    for assignment in &plan.assignments {
        let hardware_base = unclaimed
            .iter()
            .find(|u| u.device == assignment.device)
            .map(|u| u.hardware_base)
            .unwrap_or(0);
        let mut record = DeviceRepair {
            device: assignment.device.to_string(),
            hardware_base,
            assigned_base: assignment.window.map(|w| w.base_address),
            status: RepairStatus::Failed,
            detail: assignment.error.clone(),
        };
        if assignment.window.is_some() {
            match bus.detach(&assignment.device) {
                Ok(()) => {
                    detached = true;
                    record.status = RepairStatus::StillBroken;
                }
                Err(e) => record.detail = Some(format!("detach failed: {}", e)),
            }
        }
        devices.push(record);
    }

    for (assignment, record) in plan.assignments.iter().zip(devices.iter_mut()) {
        let (Some(window), RepairStatus::StillBroken) = (assignment.window, record.status) else {
            continue;
        };
        if let Err(e) = bus.write_window(&assignment.device, window.base_address) {
            warn!(device = %assignment.device, "Writing BAR0 failed: {}", e);
            record.status = RepairStatus::Failed;
            record.detail = Some(format!("write failed: {}", e));
        }
    }

    // detached devices only come back through a rescan, even after a failed write
    if detached {
        if let Err(e) = bus.rescan() {
            warn!("Bus rescan failed: {}", e);
            for record in devices.iter_mut().filter(|d| d.status == RepairStatus::StillBroken) {
                record.status = RepairStatus::Failed;
                record.detail = Some(format!("rescan failed: {}", e));
            }
        }
    }

    for (assignment, record) in plan.assignments.iter().zip(devices.iter_mut()) {
        if record.status != RepairStatus::StillBroken {
            continue;
        }
        match bus.kernel_window(&assignment.device) {
            Ok(base) if base != 0 => {
                info!(device = %assignment.device, "Window claimed at {:#x}", base);
                record.status = RepairStatus::Fixed;
            }
            Ok(_) => record.detail = Some("kernel still reports no window".to_string()),
            Err(e) => record.detail = Some(format!("device not back after rescan: {}", e)),
        }
    }

    let summary = RepairSummary {
        method: Some(plan.method),
        devices,
    };
    info!(
        fixed = summary.fixed(),
        broken = summary.broken(),
        "Register window repair finished"
    );
    summary
}
