//! One provisioning run from preflight to verdict
//!
//! Stages run in a fixed order and every stage reports through the issue
//! list. Only a failed precondition, a driver that will not load or a device
//! query that fails end the run early; everything else is aggregated.

use tracing::{error, info, warn};

use crate::activation::{verify_against_policy, ActivationCoordinator, ActivationPhase, ActivationState};
use crate::classify::classify_output;
use crate::data::{GpuDevice, WorkArea};
use crate::diff::{apply_diff, compute_diff, mark_changed};
use crate::hw::{BusControl, DeviceBackend, DiagnosticSource, ModuleControl, Platform, ToolLocator};
use crate::preflight::{check_tools, Requirements};
use crate::recovery::ModuleRecovery;
use crate::report::{Issue, IssueCategory, ProvisionReport, Severity, Stage, Verdict};
use crate::retry::Clock;
use crate::settings::ProvisionSettings;

/// Everything a run talks to outside the process
pub struct Collaborators<'a> {
    pub backend: &'a dyn DeviceBackend,
    pub platform: &'a dyn Platform,
    pub bus: &'a dyn BusControl,
    pub modules: &'a dyn ModuleControl,
    pub locator: &'a dyn ToolLocator,
    /// None disables the diagnostics stage
    pub diagnostics: Option<&'a dyn DiagnosticSource>,
    pub clock: &'a dyn Clock,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunOptions {
    /// This run follows a reboot this tool scheduled
    pub resumed: bool,
    /// Query and compare only, never apply
    pub verify_only: bool,
    /// Diagnostics come from running `dcgmi`, so it must be installed
    pub dcgm_required: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RunOutcome {
    pub report: ProvisionReport,
    /// Emit the report, then reboot
    pub reboot_requested: bool,
}

pub struct Runner<'a> {
    settings: &'a ProvisionSettings,
    with: Collaborators<'a>,
    work: Option<&'a WorkArea>,
}

impl<'a> Runner<'a> {
    pub fn new(settings: &'a ProvisionSettings, with: Collaborators<'a>) -> Self {
        Self {
            settings,
            with,
            work: None,
        }
    }

    pub fn with_work_area(mut self, work: &'a WorkArea) -> Self {
        self.work = Some(work);
        self
    }

    fn finish(&self, mut report: ProvisionReport, reboot_requested: bool) -> RunOutcome {
        let verdict = report.finalize(&self.settings.report.suppressed_patterns);
        info!(
            %verdict,
            critical = report.count(Severity::Critical),
            warnings = report.count(Severity::Warning),
            "Run finished"
        );
        RunOutcome {
            report,
            reboot_requested,
        }
    }

    pub fn run(&self, options: RunOptions) -> RunOutcome {
        let resumed = options.resumed;
        let mut report = ProvisionReport::new(self.with.platform.hostname(), resumed);
        info!(resumed, verify_only = options.verify_only, "Starting provisioning run");

        let missing = check_tools(
            self.with.locator,
            Requirements {
                dcgm: options.dcgm_required && self.with.diagnostics.is_some(),
                bus_repair: false,
            },
        );
        if !missing.is_empty() {
            report.extend(missing);
            return self.finish(report, false);
        }

        let recovery = ModuleRecovery::new(
            self.with.modules,
            self.with.bus,
            self.with.platform,
            self.with.clock,
            &self.settings.module,
            &self.settings.bus,
        )
        .ensure_loaded();
        report.extend(recovery.issues);
        report.bus_repair = recovery.repair.filter(|r| !r.devices.is_empty());
        report.recovery = recovery.context;
        if !recovery.loaded {
            return self.finish(report, false);
        }

        report.driver_version = self.with.backend.tool_version();
        let mut devices = match self.with.backend.query_devices() {
            Ok(devices) => devices,
            Err(e) => {
                error!("Device query failed: {}", e);
                report.push(Issue::critical(
                    IssueCategory::ToolOutput,
                    Stage::Preflight,
                    format!("Device query failed: {}", e),
                ));
                return self.finish(report, false);
            }
        };
        if devices.is_empty() {
            report.push(Issue::critical(
                IssueCategory::Precondition,
                Stage::Preflight,
                "No GPUs found",
            ));
            return self.finish(report, false);
        }
        info!(count = devices.len(), "Devices enumerated");

        if resumed || options.verify_only {
            report.record_devices(&devices);
            let mismatches = verify_against_policy(&devices, &self.settings.policy);
            if mismatches.is_empty() && resumed {
                report.activation = Some(ActivationPhase::Verified);
            }
            report.extend(mismatches);
        } else if self.reconcile(&mut report, &mut devices) {
            return self.finish(report, true);
        }

        self.diagnose(&mut report, devices.len());
        self.finish(report, false)
    }

    /// Diff, apply, activate; true when a reboot was scheduled
    fn reconcile(&self, report: &mut ProvisionReport, devices: &mut [GpuDevice]) -> bool {
        let plan = compute_diff(devices, &self.settings.policy);
        let applied = apply_diff(self.with.backend, &plan);
        if applied.status() == Verdict::Fail {
            warn!("One or more capability changes failed to apply");
        }
        mark_changed(devices, &applied.changes);
        report.record_devices(devices);
        report.extend(applied.issues);

        let mut state = ActivationState::new();
        state.record_changes(applied.changes);
        let mut coordinator =
            ActivationCoordinator::new(self.with.backend, self.with.clock, &self.settings.activation);
        if let Some(work) = self.work {
            coordinator = coordinator.with_work_area(work);
        }
        let activation = coordinator.activate(&mut state);

        report.extend(activation.issues);
        report.changes = state.pending_changes.clone();
        report.activation = Some(state.phase);
        if let Some(after) = &activation.after {
            report.record_after(after);
        }
        activation.reboot_requested
    }

    fn diagnose(&self, report: &mut ProvisionReport, device_count: usize) {
        let Some(source) = self.with.diagnostics else {
            return;
        };
        if !self.settings.diagnostics.enabled {
            info!("Diagnostics disabled");
            return;
        }
        let raw = match source.collect() {
            Ok(raw) => raw,
            Err(e) => {
                error!("Diagnostics could not run: {}", e);
                report.push(Issue::critical(
                    IssueCategory::Diagnostics,
                    Stage::Diagnostics,
                    format!("Diagnostics could not run: {}", e),
                ));
                return;
            }
        };

        let expected = self.settings.diagnostics.expected_devices.or(Some(device_count));
        let outcome = classify_output(&raw, expected);
        report.extend(outcome.issues);
        if let Some(mut preserved) = outcome.preserved {
            if let Some(dir) = &self.settings.report.artifact_dir {
                if let Err(e) = preserved.save_into(dir) {
                    warn!("Cannot save raw diagnostic output: {}", e);
                }
            }
            report.preserved_outputs.push(preserved);
        }
        report.diagnostics = Some(outcome.classification);
    }
}
