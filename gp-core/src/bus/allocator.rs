//! Register window planning for devices the kernel did not claim
//!
//! The preferred plan packs all windows, aligned to their size, into the
//! largest unclaimed gap below the ceiling. When that does not fit, each
//! device keeps its hardware-reported base and collisions with already
//! assigned windows are resolved by probing forward one window at a time.

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::interval::{IntervalSet, Range};
use crate::data::BusAddress;
use gp_error::ProvisionError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceWindow {
    pub base_address: u64,
    pub size: u64,
    pub alignment: u64,
}

impl ResourceWindow {
    pub fn new(base_address: u64, size: u64) -> Self {
        Self {
            base_address,
            size,
            alignment: size,
        }
    }

    pub fn end(&self) -> u64 {
        self.base_address + self.size
    }

    pub fn range(&self) -> Range {
        Range::new(self.base_address, self.end())
    }

    pub fn is_aligned(&self) -> bool {
        self.alignment != 0 && self.base_address % self.alignment == 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanMethod {
    LargestGap,
    HardwareFallback,
}

/// A device needing a window and its hardware-reported base
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WindowRequest {
    pub device: BusAddress,
    pub hardware_base: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WindowAssignment {
    pub device: BusAddress,
    pub window: Option<ResourceWindow>,
    /// Why no window could be assigned
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WindowPlan {
    pub method: PlanMethod,
    pub gap: Option<Range>,
    pub assignments: Vec<WindowAssignment>,
}

impl WindowPlan {
    pub fn windows(&self) -> impl Iterator<Item = (&BusAddress, &ResourceWindow)> {
        self.assignments
            .iter()
            .filter_map(|a| a.window.as_ref().map(|w| (&a.device, w)))
    }
}

/// Round up to a multiple of a power-of-two `align`
pub fn align_up(value: u64, align: u64) -> Option<u64> {
    debug_assert!(align.is_power_of_two());
    value.checked_add(align - 1).map(|v| v & !(align - 1))
}

/// Plan one window of `size` per request, in request order
///
/// `size` must be a power of two.
pub fn plan_windows(requests: &[WindowRequest], claimed: &IntervalSet, size: u64, ceiling: u64) -> WindowPlan {
    let needed = size.saturating_mul(requests.len() as u64);
    let gap = claimed.largest_gap(ceiling);

    if let Some(gap) = gap {
        let fits = align_up(gap.start, size)
            .and_then(|base| base.checked_add(needed).map(|end| (base, end)))
            .filter(|(_, end)| *end <= gap.end);

        if let Some((base, _)) = fits {
            info!("Packing {} window(s) into gap {}", requests.len(), gap);
            let assignments = requests
                .iter()
                .enumerate()
                .map(|(i, req)| WindowAssignment {
                    device: req.device.clone(),
                    window: Some(ResourceWindow::new(base + i as u64 * size, size)),
                    error: None,
                })
                .collect();
            return WindowPlan {
                method: PlanMethod::LargestGap,
                gap: Some(gap),
                assignments,
            };
        }
        debug!("Largest gap {} cannot hold {:#x} bytes aligned", gap, needed);
    }

    warn!("No gap fits {} window(s), falling back to hardware addresses", requests.len());
    WindowPlan {
        method: PlanMethod::HardwareFallback,
        gap,
        assignments: fallback_assignments(requests, size, ceiling),
    }
}

fn fallback_assignments(requests: &[WindowRequest], size: u64, ceiling: u64) -> Vec<WindowAssignment> {
    let mut assigned = IntervalSet::new();
    let mut assignments = Vec::with_capacity(requests.len());

    for req in requests {
        let mut base = align_up(req.hardware_base, size);
        // shift forward until it no longer overlaps an assigned window
        while let Some(b) = base {
            match b.checked_add(size) {
                Some(end) if end <= ceiling => {
                    if !assigned.overlaps(b, end) {
                        break;
                    }
                    base = Some(b + size);
                }
                _ => base = None,
            }
        }

        match base {
            Some(b) => {
                if b != req.hardware_base {
                    debug!(device = %req.device, "Shifted from {:#x} to {:#x}", req.hardware_base, b);
                }
                assigned.insert(b, b + size);
                assignments.push(WindowAssignment {
                    device: req.device.clone(),
                    window: Some(ResourceWindow::new(b, size)),
                    error: None,
                });
            }
            None => {
                warn!(device = %req.device, "No free window below {:#x}", ceiling);
                assignments.push(WindowAssignment {
                    device: req.device.clone(),
                    window: None,
                    error: Some(
                        ProvisionError::Allocation(format!(
                            "no free {:#x}-byte window between {:#x} and {:#x}",
                            size, req.hardware_base, ceiling
                        ))
                        .to_string(),
                    ),
                });
            }
        }
    }
    assignments
}
