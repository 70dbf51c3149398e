//! Structured run report
//!
//! The single value handed to the report emitter: verdict, ordered issues,
//! per-device before/after capability state, and whatever the classifier and
//! bus repair produced along the way.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

use gp_error::{ProvisionError, Result};

use crate::constants::{exit, report::MAX_PRESERVED_BYTES};
use crate::data::{Capability, CapabilityChange, CapabilityReading, GpuDevice};

/// Overall outcome, ordered from best to worst
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Verdict {
    Pass,
    Warn,
    Fail,
}

impl Verdict {
    /// Worst of two verdicts
    pub fn escalate(self, other: Verdict) -> Verdict {
        self.max(other)
    }

    /// Worst verdict of a sequence, PASS when empty
    pub fn worst<I: IntoIterator<Item = Verdict>>(verdicts: I) -> Verdict {
        verdicts.into_iter().fold(Verdict::Pass, Verdict::escalate)
    }

    pub fn exit_code(&self) -> i32 {
        match self {
            Verdict::Fail => exit::FAIL,
            Verdict::Pass | Verdict::Warn => exit::OK,
        }
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Verdict::Pass => f.write_str("PASS"),
            Verdict::Warn => f.write_str("WARN"),
            Verdict::Fail => f.write_str("FAIL"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

impl Severity {
    /// Verdict this severity escalates to
    pub fn verdict(&self) -> Verdict {
        match self {
            Severity::Info => Verdict::Pass,
            Severity::Warning => Verdict::Warn,
            Severity::Critical => Verdict::Fail,
        }
    }
}

/// Error taxonomy an issue belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueCategory {
    Precondition,
    ApplyFailure,
    ActivationPending,
    ResourceAllocation,
    ModuleLoad,
    PolicyMismatch,
    UnreadableValue,
    Diagnostics,
    ToolOutput,
}

/// Run stage that raised an issue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Preflight,
    Driver,
    Apply,
    Activation,
    Verification,
    Diagnostics,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Issue {
    pub message: String,
    pub severity: Severity,
    pub category: IssueCategory,
    pub stage: Stage,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device: Option<String>,
}

impl Issue {
    pub fn new(
        severity: Severity,
        category: IssueCategory,
        stage: Stage,
        message: impl Into<String>,
    ) -> Self {
        Self {
            message: message.into(),
            severity,
            category,
            stage,
            device: None,
        }
    }

    pub fn critical(category: IssueCategory, stage: Stage, message: impl Into<String>) -> Self {
        Self::new(Severity::Critical, category, stage, message)
    }

    pub fn warning(category: IssueCategory, stage: Stage, message: impl Into<String>) -> Self {
        Self::new(Severity::Warning, category, stage, message)
    }

    pub fn info(category: IssueCategory, stage: Stage, message: impl Into<String>) -> Self {
        Self::new(Severity::Info, category, stage, message)
    }

    pub fn on_device(mut self, device: impl fmt::Display) -> Self {
        self.device = Some(device.to_string());
        self
    }
}

/// Capability state of one device at one point of the run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceStateRecord {
    pub device_id: String,
    pub index: u32,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub serial: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uuid: Option<String>,
    pub before: BTreeMap<Capability, CapabilityReading>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub after: Option<BTreeMap<Capability, CapabilityReading>>,
}

impl DeviceStateRecord {
    pub fn from_device(device: &GpuDevice) -> Self {
        Self {
            device_id: device.id().to_string(),
            index: device.identity.index,
            name: device.identity.name.clone(),
            serial: device.identity.serial.clone(),
            uuid: device.identity.uuid.clone(),
            before: device.capabilities.clone(),
            after: None,
        }
    }
}

/// Raw tool output kept for offline diagnosis
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreservedOutput {
    pub source: String,
    pub sha256: String,
    pub truncated: bool,
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

impl PreservedOutput {
    /// Hash the full text and keep at most `MAX_PRESERVED_BYTES` of it
    pub fn capture(source: &str, text: &str) -> Self {
        let sha256 = format!("{:x}", Sha256::digest(text.as_bytes()));
        let truncated = text.len() > MAX_PRESERVED_BYTES;
        let kept = if truncated {
            let mut end = MAX_PRESERVED_BYTES;
            while !text.is_char_boundary(end) {
                end -= 1;
            }
            &text[..end]
        } else {
            text
        };
        Self {
            source: source.to_string(),
            sha256,
            truncated,
            text: kept.to_string(),
            path: None,
        }
    }

    /// Write the kept text to `<dir>/<sha256 prefix>.txt` and record the path
    pub fn save_into(&mut self, dir: &Path) -> Result<()> {
        std::fs::create_dir_all(dir).map_err(|e| ProvisionError::FileWrite {
            path: dir.to_path_buf(),
            source: e,
        })?;
        let prefix = self.sha256.get(..16).unwrap_or(&self.sha256);
        let path = dir.join(format!("diag-{}.txt", prefix));
        std::fs::write(&path, &self.text).map_err(|e| ProvisionError::FileWrite {
            path: path.clone(),
            source: e,
        })?;
        self.path = Some(path.display().to_string());
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProvisionReport {
    pub verdict: Option<Verdict>,
    pub generated_at: String,
    pub hostname: String,
    pub resumed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub driver_version: Option<String>,
    pub issues: Vec<Issue>,
    pub devices: Vec<DeviceStateRecord>,
    pub changes: Vec<CapabilityChange>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub activation: Option<crate::activation::ActivationPhase>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub diagnostics: Option<crate::classify::Classification>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bus_repair: Option<crate::bus::RepairSummary>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recovery: Option<crate::recovery::DiagnosticContext>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub preserved_outputs: Vec<PreservedOutput>,
}

impl ProvisionReport {
    pub fn new(hostname: impl Into<String>, resumed: bool) -> Self {
        Self {
            generated_at: chrono::Utc::now().format("%Y-%m-%d %H:%M:%S UTC").to_string(),
            hostname: hostname.into(),
            resumed,
            ..Default::default()
        }
    }

    pub fn push(&mut self, issue: Issue) {
        self.issues.push(issue);
    }

    pub fn extend<I: IntoIterator<Item = Issue>>(&mut self, issues: I) {
        self.issues.extend(issues);
    }

    /// Record the initial state of every device
    pub fn record_devices(&mut self, devices: &[GpuDevice]) {
        self.devices = devices.iter().map(DeviceStateRecord::from_device).collect();
    }

    /// Record post-activation state, matched by device id
    pub fn record_after(&mut self, devices: &[GpuDevice]) {
        for device in devices {
            if let Some(record) = self
                .devices
                .iter_mut()
                .find(|r| r.device_id == device.id().as_str())
            {
                record.after = Some(device.capabilities.clone());
            }
        }
    }

    /// Drop issues matching any suppression pattern (case-insensitive)
    pub fn suppress(&mut self, patterns: &[String]) {
        if patterns.is_empty() {
            return;
        }
        let lowered: Vec<String> = patterns.iter().map(|p| p.to_lowercase()).collect();
        self.issues.retain(|issue| {
            let message = issue.message.to_lowercase();
            !lowered.iter().any(|p| message.contains(p.as_str()))
        });
    }

    /// Derive the verdict from the issue list
    pub fn compute_verdict(&self) -> Verdict {
        Verdict::worst(self.issues.iter().map(|i| i.severity.verdict()))
    }

    /// Fix the verdict; called once all stages ran
    pub fn finalize(&mut self, suppress_patterns: &[String]) -> Verdict {
        self.suppress(suppress_patterns);
        let verdict = self.compute_verdict();
        self.verdict = Some(verdict);
        verdict
    }

    pub fn verdict(&self) -> Verdict {
        self.verdict.unwrap_or_else(|| self.compute_verdict())
    }

    pub fn exit_code(&self) -> i32 {
        self.verdict().exit_code()
    }

    pub fn count(&self, severity: Severity) -> usize {
        self.issues.iter().filter(|i| i.severity == severity).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_verdict_ordering_and_worst() {
        assert_eq!(Verdict::worst([]), Verdict::Pass);
        assert_eq!(Verdict::worst([Verdict::Pass, Verdict::Warn]), Verdict::Warn);
        assert_eq!(Verdict::worst([Verdict::Fail, Verdict::Warn]), Verdict::Fail);
        assert_eq!(Verdict::Warn.exit_code(), 0);
        assert_eq!(Verdict::Fail.exit_code(), 1);
    }

    #[test]
    fn test_info_issues_do_not_escalate() {
        let mut report = ProvisionReport::new("host", false);
        report.push(Issue::info(IssueCategory::ApplyFailure, Stage::Apply, "destroy skipped"));
        assert_eq!(report.compute_verdict(), Verdict::Pass);
        report.push(Issue::warning(IssueCategory::ActivationPending, Stage::Activation, "pending"));
        assert_eq!(report.compute_verdict(), Verdict::Warn);
    }

    #[test]
    fn test_suppressed_warning_upgrades_to_pass() {
        let mut report = ProvisionReport::new("host", false);
        report.push(Issue::warning(
            IssueCategory::Diagnostics,
            Stage::Diagnostics,
            "GPU 2: PCIe link degradation Gen4 -> Gen2",
        ));
        let verdict = report.finalize(&["pcie link degradation".to_string()]);
        assert_eq!(verdict, Verdict::Pass);
        assert!(report.issues.is_empty());
    }

    #[test]
    fn test_preserved_output_truncates_but_hashes_everything() {
        let text = "x".repeat(MAX_PRESERVED_BYTES + 10);
        let preserved = PreservedOutput::capture("dcgmi", &text);
        assert!(preserved.truncated);
        assert_eq!(preserved.text.len(), MAX_PRESERVED_BYTES);
        assert_eq!(preserved.sha256, format!("{:x}", Sha256::digest(text.as_bytes())));

        let small = PreservedOutput::capture("dcgmi", "garbage");
        assert!(!small.truncated);
        assert_eq!(small.text, "garbage");
    }

    #[test]
    fn test_preserved_output_saved_to_artifact_dir() {
        let dir = tempfile::tempdir().unwrap();
        let mut preserved = PreservedOutput::capture("dcgmi", "not json");
        preserved.save_into(dir.path()).unwrap();
        let path = preserved.path.clone().unwrap();
        assert_eq!(std::fs::read_to_string(path).unwrap(), "not json");
    }

    #[test]
    fn test_verdict_serializes_uppercase() {
        assert_eq!(serde_json::to_string(&Verdict::Warn).unwrap(), "\"WARN\"");
        assert_eq!(serde_json::to_string(&Severity::Critical).unwrap(), "\"critical\"");
    }
}
