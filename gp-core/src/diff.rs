//! Diff and apply of capability policy
//!
//! [`compute_diff`] is pure: it decides per device and capability what needs
//! changing. [`apply_diff`] pushes the planned values through a
//! [`DeviceBackend`], one capability at a time, and keeps going past
//! failures.

use tracing::{debug, info, warn};

use crate::data::{BusAddress, Capability, CapabilityChange, GpuDevice, TargetPolicy, Toggle};
use crate::hw::DeviceBackend;
use crate::report::{Issue, IssueCategory, Stage, Verdict};

/// One capability that does not match policy
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedChange {
    pub device: BusAddress,
    pub capability: Capability,
    pub previous: Toggle,
    pub target: Toggle,
    /// Set by an earlier run; only activation is outstanding
    pub awaiting_activation: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DiffPlan {
    pub changes: Vec<PlannedChange>,
    /// Capabilities whose value could not be read
    pub issues: Vec<Issue>,
}

impl DiffPlan {
    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ApplyOutcome {
    pub changes: Vec<CapabilityChange>,
    pub issues: Vec<Issue>,
    pub status: Option<Verdict>,
}

impl ApplyOutcome {
    pub fn status(&self) -> Verdict {
        self.status.unwrap_or(Verdict::Pass)
    }
}

/// Compare every device against policy, in enumeration then policy order
///
/// Unsupported capabilities are skipped silently. The effective value
/// (pending if reported) is compared, so changes already applied but not yet
/// activated are planned for activation only and never set twice.
pub fn compute_diff(devices: &[GpuDevice], policy: &TargetPolicy) -> DiffPlan {
    let mut plan = DiffPlan::default();

    for device in devices {
        for (capability, target) in policy.iter() {
            let reading = device.capability(capability);
            if !reading.supported {
                debug!(device = %device.id(), %capability, "Unsupported, skipping");
                continue;
            }
            match reading.effective() {
                Some(value) if value == target => match reading.current {
                    Some(current) if reading.activation_pending() => {
                        info!(
                            device = %device.id(),
                            %capability,
                            %current,
                            pending = %value,
                            "Pending change awaiting activation"
                        );
                        plan.changes.push(PlannedChange {
                            device: device.id().clone(),
                            capability,
                            previous: current,
                            target,
                            awaiting_activation: true,
                        });
                    }
                    _ => debug!(device = %device.id(), %capability, %value, "Already at policy"),
                },
                Some(value) => plan.changes.push(PlannedChange {
                    device: device.id().clone(),
                    capability,
                    previous: value,
                    target,
                    awaiting_activation: false,
                }),
                None => {
                    warn!(device = %device.id(), %capability, "Value unreadable, not applying");
                    plan.issues.push(
                        Issue::warning(
                            IssueCategory::UnreadableValue,
                            Stage::Apply,
                            format!(
                                "{} {}: current value unreadable, policy {} not applied",
                                device.id(),
                                capability,
                                target
                            ),
                        )
                        .on_device(device.id()),
                    );
                }
            }
        }
    }
    plan
}

/// Apply a plan; a failed set is critical, sibling work continues
pub fn apply_diff(backend: &dyn DeviceBackend, plan: &DiffPlan) -> ApplyOutcome {
    let mut outcome = ApplyOutcome {
        issues: plan.issues.clone(),
        ..Default::default()
    };
    let mut failed = false;

    for planned in &plan.changes {
        let PlannedChange { device, capability, previous, target, awaiting_activation } = planned;

        if *awaiting_activation {
            outcome
                .changes
                .push(CapabilityChange::new(device.clone(), *capability, Some(*previous), *target));
            continue;
        }

        if capability.has_dependents() {
            if let Err(e) = backend.destroy_dependents(device, *capability) {
                warn!(%device, %capability, "Destroying dependents failed: {}", e);
                outcome.issues.push(
                    Issue::info(
                        IssueCategory::ApplyFailure,
                        Stage::Apply,
                        format!("{} {}: tearing down dependents failed: {}", device, capability, e),
                    )
                    .on_device(device),
                );
            }
        }

        match backend.apply(device, *capability, *target) {
            Ok(()) => {
                info!(%device, %capability, from = %previous, to = %target, "Applied");
                outcome
                    .changes
                    .push(CapabilityChange::new(device.clone(), *capability, Some(*previous), *target));
            }
            Err(e) => {
                failed = true;
                outcome.issues.push(
                    Issue::critical(
                        IssueCategory::ApplyFailure,
                        Stage::Apply,
                        format!("{} {}: setting {} failed: {}", device, capability, target, e),
                    )
                    .on_device(device),
                );
            }
        }
    }

    outcome.status = Some(if failed { Verdict::Fail } else { Verdict::Pass });
    outcome
}

/// Mark the changed capabilities on device snapshots
pub fn mark_changed(devices: &mut [GpuDevice], changes: &[CapabilityChange]) {
    for change in changes {
        if let Some(device) = devices.iter_mut().find(|d| d.id() == &change.device_id) {
            if let Some(reading) = device.capabilities.get_mut(&change.capability) {
                reading.changed = true;
            }
        }
    }
}
