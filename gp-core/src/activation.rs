//! Activation of pending capability changes
//!
//! Capability changes land as pending values and only take effect after a
//! device reset or a reboot. The coordinator picks the mechanism, drives the
//! reset and its availability wait, and verifies the outcome:
//!
//! ```text
//! NotNeeded
//! AppliedPending -> ResetAttempted  -> Verified
//!                -> RebootScheduled
//! ```
//!
//! State is written to the work area on every transition. Nothing is read
//! back after a reboot; the resumed run re-queries devices instead.

use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{debug, info, warn};

use crate::constants::{millis, paths};
use crate::data::{BusAddress, CapabilityChange, GpuDevice, TargetPolicy, WorkArea};
use crate::hw::DeviceBackend;
use crate::report::{Issue, IssueCategory, Stage};
use crate::retry::{Clock, RetryPolicy};
use crate::settings::{ActivationSettings, ActivationStrategy};
use gp_error::ProvisionError;

const STATE_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivationPhase {
    NotNeeded,
    AppliedPending,
    ResetAttempted,
    RebootScheduled,
    Verified,
}

impl ActivationPhase {
    fn can_transition_to(self, next: ActivationPhase) -> bool {
        use ActivationPhase::*;
        matches!(
            (self, next),
            (NotNeeded, AppliedPending)
                | (NotNeeded, Verified)
                | (AppliedPending, ResetAttempted)
                | (AppliedPending, RebootScheduled)
                | (ResetAttempted, RebootScheduled)
                | (ResetAttempted, Verified)
        )
    }
}

impl fmt::Display for ActivationPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ActivationPhase::NotNeeded => "not_needed",
            ActivationPhase::AppliedPending => "applied_pending",
            ActivationPhase::ResetAttempted => "reset_attempted",
            ActivationPhase::RebootScheduled => "reboot_scheduled",
            ActivationPhase::Verified => "verified",
        };
        f.write_str(name)
    }
}

/// Activation progress of one run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivationState {
    pub version: u32,
    pub phase: ActivationPhase,
    pub pending_changes: Vec<CapabilityChange>,
    pub reboot_required: bool,
    pub verified: bool,
}

impl Default for ActivationState {
    fn default() -> Self {
        Self {
            version: STATE_VERSION,
            phase: ActivationPhase::NotNeeded,
            pending_changes: Vec::new(),
            reboot_required: false,
            verified: false,
        }
    }
}

impl ActivationState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the changes produced by the apply step
    pub fn record_changes(&mut self, changes: Vec<CapabilityChange>) {
        self.pending_changes = changes;
        if !self.pending_changes.is_empty() {
            self.transition(ActivationPhase::AppliedPending);
        }
    }

    /// Move to `next`; illegal transitions are logged and ignored
    pub fn transition(&mut self, next: ActivationPhase) -> bool {
        if self.phase == next {
            return true;
        }
        if !self.phase.can_transition_to(next) {
            warn!("Ignoring activation transition {} -> {}", self.phase, next);
            return false;
        }
        debug!("Activation {} -> {}", self.phase, next);
        self.phase = next;
        true
    }

    /// Devices with pending changes, each once, in change order
    pub fn pending_devices(&self) -> Vec<BusAddress> {
        let mut devices: Vec<BusAddress> = Vec::new();
        for change in &self.pending_changes {
            if !devices.contains(&change.device_id) {
                devices.push(change.device_id.clone());
            }
        }
        devices
    }

    pub fn unverified(&self) -> impl Iterator<Item = &CapabilityChange> {
        self.pending_changes.iter().filter(|c| !c.verified)
    }
}

/// Result of one activation pass
#[derive(Debug, Clone, Default)]
pub struct ActivationOutcome {
    pub issues: Vec<Issue>,
    /// The caller must emit the report and then reboot the machine
    pub reboot_requested: bool,
    /// Device state re-queried after a reset
    pub after: Option<Vec<GpuDevice>>,
}

pub struct ActivationCoordinator<'a> {
    backend: &'a dyn DeviceBackend,
    clock: &'a dyn Clock,
    strategy: ActivationStrategy,
    availability: RetryPolicy,
    work: Option<&'a WorkArea>,
}

impl<'a> ActivationCoordinator<'a> {
    pub fn new(backend: &'a dyn DeviceBackend, clock: &'a dyn Clock, settings: &ActivationSettings) -> Self {
        Self {
            backend,
            clock,
            strategy: settings.strategy,
            availability: RetryPolicy::fixed(settings.poll_attempts, millis(settings.poll_interval_ms)),
            work: None,
        }
    }

    /// Persist state transitions into a work area
    pub fn with_work_area(mut self, work: &'a WorkArea) -> Self {
        self.work = Some(work);
        self
    }

    fn persist(&self, state: &ActivationState) {
        if let Some(work) = self.work {
            if let Err(e) = work.save(paths::STATE_FILE, state) {
                warn!("Failed to persist activation state: {}", e);
            }
        }
    }

    pub fn activate(&self, state: &mut ActivationState) -> ActivationOutcome {
        if state.pending_changes.is_empty() {
            state.phase = ActivationPhase::NotNeeded;
            self.persist(state);
            info!("No capability changes, activation not needed");
            return ActivationOutcome::default();
        }
        self.persist(state);

        match self.strategy {
            ActivationStrategy::Reboot => self.schedule_reboot(state, Vec::new()),
            ActivationStrategy::Auto | ActivationStrategy::Reset => self.reset_and_verify(state),
        }
    }

    fn reset_and_verify(&self, state: &mut ActivationState) -> ActivationOutcome {
        let mut outcome = ActivationOutcome::default();
        state.transition(ActivationPhase::ResetAttempted);
        self.persist(state);

        let devices = state.pending_devices();
        let mut failed: Vec<BusAddress> = Vec::new();
        for device in &devices {
            info!(%device, "Resetting device");
            if let Err(e) = self.backend.reset(device) {
                warn!(%device, "Reset failed: {}", e);
                if self.strategy == ActivationStrategy::Reset {
                    outcome.issues.push(
                        Issue::warning(
                            IssueCategory::ActivationPending,
                            Stage::Activation,
                            format!(
                                "{}: reset failed ({}); pending changes take effect after a full reboot",
                                device, e
                            ),
                        )
                        .on_device(device),
                    );
                }
                failed.push(device.clone());
            }
        }

        if !failed.is_empty() && self.strategy == ActivationStrategy::Auto {
            info!("Reset unavailable, falling back to reboot");
            return self.schedule_reboot(state, outcome.issues);
        }

        if failed.len() == devices.len() {
            self.persist(state);
            return outcome;
        }

        if !self.availability.poll(self.clock, || self.backend.probe_available()) {
            outcome.issues.push(Issue::critical(
                IssueCategory::ActivationPending,
                Stage::Activation,
                ProvisionError::Timeout(format!(
                    "devices did not become available after reset ({} probes)",
                    self.availability.max_attempts
                ))
                .to_string(),
            ));
            self.persist(state);
            return outcome;
        }

        let after = match self.backend.query_devices() {
            Ok(after) => after,
            Err(e) => {
                outcome.issues.push(Issue::critical(
                    IssueCategory::ActivationPending,
                    Stage::Verification,
                    format!("Re-querying devices after reset failed: {}", e),
                ));
                self.persist(state);
                return outcome;
            }
        };

        for change in state.pending_changes.iter_mut() {
            if failed.contains(&change.device_id) {
                continue;
            }
            let Some(device) = after.iter().find(|d| d.id() == &change.device_id) else {
                outcome.issues.push(
                    Issue::critical(
                        IssueCategory::ActivationPending,
                        Stage::Verification,
                        format!("{} missing after reset", change.device_id),
                    )
                    .on_device(&change.device_id),
                );
                continue;
            };
            if device.capability(change.capability).current == Some(change.applied) {
                info!(device = %change.device_id, capability = %change.capability, "Change verified");
                change.verified = true;
            } else {
                outcome.issues.push(
                    Issue::warning(
                        IssueCategory::ActivationPending,
                        Stage::Verification,
                        format!(
                            "{} still pending after reset; takes effect after a full reboot",
                            change.describe()
                        ),
                    )
                    .on_device(&change.device_id),
                );
            }
        }

        if state.unverified().next().is_none() {
            state.verified = true;
            state.transition(ActivationPhase::Verified);
        }
        self.persist(state);
        outcome.after = Some(after);
        outcome
    }

    fn schedule_reboot(&self, state: &mut ActivationState, issues: Vec<Issue>) -> ActivationOutcome {
        state.reboot_required = true;
        state.transition(ActivationPhase::RebootScheduled);
        self.persist(state);

        let pending: Vec<String> = state.unverified().map(|c| c.describe()).collect();
        let mut outcome = ActivationOutcome {
            issues,
            reboot_requested: true,
            after: None,
        };
        outcome.issues.push(Issue::warning(
            IssueCategory::ActivationPending,
            Stage::Activation,
            format!(
                "Reboot scheduled to activate {} pending change(s): {}",
                pending.len(),
                pending.join(", ")
            ),
        ));
        outcome
    }
}

/// Compare re-queried devices against policy after a reboot
///
/// Every supported capability is checked against its active value.
/// Mismatches are warnings; hardware may not honour every capability.
pub fn verify_against_policy(devices: &[GpuDevice], policy: &TargetPolicy) -> Vec<Issue> {
    let mut issues = Vec::new();
    for device in devices {
        for (capability, target) in policy.iter() {
            let reading = device.capability(capability);
            if !reading.supported {
                continue;
            }
            match reading.current {
                Some(value) if value == target => {}
                Some(value) => issues.push(
                    Issue::warning(
                        IssueCategory::PolicyMismatch,
                        Stage::Verification,
                        format!("{} {}: is {}, policy wants {}", device.id(), capability, value, target),
                    )
                    .on_device(device.id()),
                ),
                None => issues.push(
                    Issue::warning(
                        IssueCategory::UnreadableValue,
                        Stage::Verification,
                        format!("{} {}: value unreadable, policy wants {}", device.id(), capability, target),
                    )
                    .on_device(device.id()),
                ),
            }
        }
    }
    issues
}
