//! PCI register window allocation and repair

mod allocator;
mod interval;
mod iomem;
mod repair;

pub use allocator::{
    align_up, plan_windows, PlanMethod, ResourceWindow, WindowAssignment, WindowPlan, WindowRequest,
};
pub use interval::{IntervalSet, Range};
pub use iomem::{claimed_ranges, parse_entries, IomemEntry};
pub use repair::{
    apply_plan, diagnose, plan_repair, repair, DeviceRepair, RepairStatus, RepairSummary,
    UnclaimedDevice,
};
