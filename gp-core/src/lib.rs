//! gpuprov core library
//!
//! Brings NVIDIA datacenter GPUs to a policy-compliant state and proves it.
//!
//! # Module Structure
//!
//! - `data/` - Device records, target policy, work area, validation
//! - `hw/` - Collaborator traits and their real implementations
//! - `bus/` - PCI register window allocation and repair
//! - `classify/` - DCGM diagnostic result classification
//! - `diff`, `activation` - Reconciliation against policy and activation
//! - `runner` - One provisioning run end to end
//!
//! # Example
//!
//! ```no_run
//! use gp_core::{compute_diff, DeviceBackend, NvidiaBackend, ProvisionSettings};
//!
//! let settings = ProvisionSettings::default();
//! let devices = NvidiaBackend::new().query_devices().unwrap();
//! let plan = compute_diff(&devices, &settings.policy);
//! println!("{} change(s) needed", plan.changes.len());
//! ```

// Grouped modules
pub mod bus;
pub mod classify;
pub mod data;
pub mod hw;

// Standalone modules
pub mod activation;
pub mod constants;
pub mod diff;
pub mod preflight;
pub mod recovery;
pub mod report;
pub mod retry;
pub mod runner;
pub mod settings;

#[cfg(any(test, feature = "fakes"))]
pub mod fakes;

// Re-export primary types from data/
pub use data::{
    BusAddress, Capability, CapabilityChange, CapabilityReading, GpuDevice, GpuIdentity,
    TargetPolicy, Toggle, WorkArea,
};

pub use data::{read_json, remove_work_dir, write_json_atomic};

// Re-export error types
pub use gp_error::{ProvisionError, Result};

// Re-export hardware traits and implementations from hw/
pub use hw::{
    BusControl, DcgmSource, DeviceBackend, DiagnosticSource, FileSource, Modprobe, ModuleControl,
    NvidiaBackend, PathLocator, Platform, RawDiagnostic, SysfsBus, SystemPlatform, ToolLocator,
};

pub use activation::{
    verify_against_policy, ActivationCoordinator, ActivationOutcome, ActivationPhase, ActivationState,
};
pub use bus::{IntervalSet, PlanMethod, RepairSummary, ResourceWindow, WindowPlan};
pub use classify::{classify_document, classify_output, Classification, ClassifyOutcome, TestStatus};
pub use diff::{apply_diff, compute_diff, ApplyOutcome, DiffPlan, PlannedChange};
pub use recovery::{DiagnosticContext, ModuleRecovery, RecoveryOutcome};
pub use report::{Issue, IssueCategory, PreservedOutput, ProvisionReport, Severity, Stage, Verdict};
pub use retry::{Backoff, Clock, RetryPolicy, SystemClock};
pub use runner::{Collaborators, RunOptions, RunOutcome, Runner};
pub use settings::{load_settings, ActivationStrategy, ProvisionSettings};
