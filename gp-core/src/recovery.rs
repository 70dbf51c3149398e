//! Kernel module load with register window repair
//!
//! The driver refuses to bind devices whose BAR0 the kernel never claimed.
//! Loading is retried with linear backoff; if that is exhausted the bus
//! repair runs and the load is tried once more. When it still fails the
//! outcome carries enough context to diagnose the host offline.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use tracing::{debug, error, info, warn};

use crate::bus::{claimed_ranges, diagnose, repair, Range, RepairSummary};
use crate::constants::millis;
use crate::hw::{BusControl, ModuleControl, Platform};
use crate::report::{Issue, IssueCategory, Stage};
use crate::retry::{Clock, RetryPolicy};
use crate::settings::{BusSettings, ModuleSettings};

const MAX_EXCERPT_LINES: usize = 64;

/// Host state captured after a failed load
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiagnosticContext {
    /// Resource map lines for host bridges and unclaimed devices
    pub resource_map_excerpt: Vec<String>,
    pub unclaimed_devices: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub largest_gap: Option<Range>,
    pub gsp_firmware_present: bool,
    pub firmware_blobs: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secure_boot: Option<String>,
}

impl DiagnosticContext {
    pub fn collect(
        bus: &dyn BusControl,
        platform: &dyn Platform,
        bus_settings: &BusSettings,
        firmware_dir: &Path,
    ) -> Self {
        let unclaimed: Vec<String> = match diagnose(bus) {
            Ok(devices) => devices.iter().map(|d| d.device.to_string()).collect(),
            Err(e) => {
                warn!("Cannot diagnose register windows: {}", e);
                Vec::new()
            }
        };
        let (resource_map_excerpt, largest_gap) = match bus.resource_map() {
            Ok(map) => (
                resource_excerpt(&map, &unclaimed),
                claimed_ranges(&map, bus_settings.ceiling).largest_gap(bus_settings.ceiling),
            ),
            Err(e) => {
                warn!("Cannot read resource map: {}", e);
                (Vec::new(), None)
            }
        };
        let firmware_blobs = gsp_blobs(firmware_dir);

        Self {
            resource_map_excerpt,
            unclaimed_devices: unclaimed,
            largest_gap,
            gsp_firmware_present: !firmware_blobs.is_empty(),
            firmware_blobs,
            secure_boot: platform.secure_boot_state(),
        }
    }

    /// One-line summary for the issue message
    pub fn summary(&self) -> String {
        let mut parts = Vec::new();
        if !self.unclaimed_devices.is_empty() {
            parts.push(format!("unclaimed windows on {}", self.unclaimed_devices.join(", ")));
        }
        match self.largest_gap {
            Some(gap) => parts.push(format!("largest free gap {}", gap)),
            None => parts.push("no free address gap below the ceiling".to_string()),
        }
        parts.push(if self.gsp_firmware_present {
            "GSP firmware present".to_string()
        } else {
            "GSP firmware missing".to_string()
        });
        if let Some(state) = &self.secure_boot {
            parts.push(format!("Secure Boot {}", state));
        }
        parts.join("; ")
    }
}

/// Lines naming a host bridge or one of `devices`
pub fn resource_excerpt(map: &str, devices: &[String]) -> Vec<String> {
    map.lines()
        .filter(|line| line.contains("PCI Bus") || devices.iter().any(|d| line.contains(d.as_str())))
        .take(MAX_EXCERPT_LINES)
        .map(|line| line.trim_end().to_string())
        .collect()
}

/// GSP firmware files in `dir` and its immediate (per-version) subdirectories
pub fn gsp_blobs(dir: &Path) -> Vec<String> {
    let mut blobs = Vec::new();
    let Ok(entries) = fs::read_dir(dir) else {
        debug!("Firmware directory {} not readable", dir.display());
        return blobs;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            if let Ok(children) = fs::read_dir(&path) {
                blobs.extend(
                    children
                        .flatten()
                        .map(|c| c.path())
                        .filter(|p| is_gsp_blob(p))
                        .map(|p| p.display().to_string()),
                );
            }
        } else if is_gsp_blob(&path) {
            blobs.push(path.display().to_string());
        }
    }
    blobs.sort();
    blobs
}

fn is_gsp_blob(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|n| n.to_ascii_lowercase().contains("gsp"))
}

#[derive(Debug, Clone, Default)]
pub struct RecoveryOutcome {
    pub loaded: bool,
    pub repair: Option<RepairSummary>,
    pub context: Option<DiagnosticContext>,
    pub issues: Vec<Issue>,
}

pub struct ModuleRecovery<'a> {
    modules: &'a dyn ModuleControl,
    bus: &'a dyn BusControl,
    platform: &'a dyn Platform,
    clock: &'a dyn Clock,
    module: &'a ModuleSettings,
    bus_settings: &'a BusSettings,
}

impl<'a> ModuleRecovery<'a> {
    pub fn new(
        modules: &'a dyn ModuleControl,
        bus: &'a dyn BusControl,
        platform: &'a dyn Platform,
        clock: &'a dyn Clock,
        module: &'a ModuleSettings,
        bus_settings: &'a BusSettings,
    ) -> Self {
        Self {
            modules,
            bus,
            platform,
            clock,
            module,
            bus_settings,
        }
    }

    pub fn ensure_loaded(&self) -> RecoveryOutcome {
        let name = self.module.name.as_str();
        let mut outcome = RecoveryOutcome::default();
        if self.modules.is_loaded(name) {
            debug!(module = name, "Kernel module already loaded");
            outcome.loaded = true;
            return outcome;
        }

        let policy = RetryPolicy::linear(self.module.attempts, millis(self.module.backoff_step_ms));
        let first = policy.run(self.clock, |attempt| {
            info!(module = name, attempt, "Loading kernel module");
            self.modules.load(name)
        });
        let Err(first_error) = first else {
            info!(module = name, "Kernel module loaded");
            outcome.loaded = true;
            return outcome;
        };
        warn!(module = name, "Module load failed after {} attempts: {}", policy.max_attempts, first_error);

        info!("Checking PCI register windows before the final load attempt");
        match repair(self.bus, self.bus_settings.window_size, self.bus_settings.ceiling) {
            Ok(summary) => {
                info!(fixed = summary.fixed(), broken = summary.broken(), "Register window repair finished");
                outcome.repair = Some(summary);
            }
            Err(e) => {
                warn!("Register window repair could not run: {}", e);
                outcome.issues.push(Issue::warning(
                    IssueCategory::ResourceAllocation,
                    Stage::Driver,
                    format!("Register window repair could not run: {}", e),
                ));
            }
        }

        let last = RetryPolicy::once().run(self.clock, |_| self.modules.load(name));
        outcome.loaded = last.is_ok();
        if let Some(summary) = &outcome.repair {
            outcome.issues.extend(summary.issues(outcome.loaded));
        }

        match last {
            Ok(()) => info!(module = name, "Kernel module loaded after register window repair"),
            Err(e) => {
                let context = DiagnosticContext::collect(self.bus, self.platform, self.bus_settings, &self.module.firmware_dir);
                error!(module = name, "Kernel module still fails to load: {}", e);
                outcome.issues.push(
                    Issue::critical(
                        IssueCategory::ModuleLoad,
                        Stage::Driver,
                        format!("Kernel module {} failed to load: {} ({})", name, e, context.summary()),
                    ),
                );
                outcome.context = Some(context);
            }
        }
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::BusAddress;
    use crate::hw::{MockBusControl, MockModuleControl, MockPlatform};
    use crate::report::Severity;
    use crate::retry::FakeClock;
    use gp_error::ProvisionError;
    use std::time::Duration;

    const IOMEM: &str = "\
00000000-00000fff : Reserved
c0000000-dfffffff : PCI Bus 0000:00
  c0000000-c0ffffff : 0000:01:00.0
fee00000-fee00fff : Local APIC
";

    fn load_error() -> ProvisionError {
        ProvisionError::ModuleLoad {
            module: "nvidia".to_string(),
            reason: "No such device".to_string(),
        }
    }

    fn healthy_bus() -> MockBusControl {
        let mut bus = MockBusControl::new();
        bus.expect_target_devices().returning(|| Ok(Vec::new()));
        bus.expect_resource_map().returning(|| Ok(IOMEM.to_string()));
        bus
    }

    #[test]
    fn test_already_loaded_does_nothing() {
        let mut modules = MockModuleControl::new();
        modules.expect_is_loaded().return_const(true);
        modules.expect_load().times(0);
        let bus = MockBusControl::new();
        let platform = MockPlatform::new();
        let clock = FakeClock::new();
        let (module, bus_settings) = (ModuleSettings::default(), BusSettings::default());

        let outcome = ModuleRecovery::new(&modules, &bus, &platform, &clock, &module, &bus_settings).ensure_loaded();
        assert!(outcome.loaded);
        assert!(outcome.issues.is_empty());
    }

    #[test]
    fn test_linear_backoff_until_load() {
        let mut modules = MockModuleControl::new();
        modules.expect_is_loaded().return_const(false);
        let mut calls = 0;
        modules.expect_load().times(3).returning(move |_| {
            calls += 1;
            if calls < 3 {
                Err(load_error())
            } else {
                Ok(())
            }
        });
        let bus = MockBusControl::new();
        let platform = MockPlatform::new();
        let clock = FakeClock::new();
        let (module, bus_settings) = (ModuleSettings::default(), BusSettings::default());

        let outcome = ModuleRecovery::new(&modules, &bus, &platform, &clock, &module, &bus_settings).ensure_loaded();
        assert!(outcome.loaded);
        assert!(outcome.repair.is_none());
        assert_eq!(clock.sleeps(), vec![Duration::from_millis(1000), Duration::from_millis(2000)]);
    }

    #[test]
    fn test_persistent_failure_surfaces_context() {
        let firmware = tempfile::tempdir().unwrap();
        std::fs::create_dir(firmware.path().join("550.54")).unwrap();
        std::fs::write(firmware.path().join("550.54/gsp_ga10x.bin"), b"").unwrap();

        let mut modules = MockModuleControl::new();
        modules.expect_is_loaded().return_const(false);
        // three backoff attempts, one after repair
        modules.expect_load().times(4).returning(|_| Err(load_error()));
        let bus = healthy_bus();
        let mut platform = MockPlatform::new();
        platform.expect_secure_boot_state().returning(|| Some("enabled".to_string()));
        let clock = FakeClock::new();
        let module = ModuleSettings {
            firmware_dir: firmware.path().to_path_buf(),
            ..ModuleSettings::default()
        };
        let bus_settings = BusSettings::default();

        let outcome = ModuleRecovery::new(&modules, &bus, &platform, &clock, &module, &bus_settings).ensure_loaded();
        assert!(!outcome.loaded);
        assert_eq!(outcome.issues.len(), 1);
        assert_eq!(outcome.issues[0].severity, Severity::Critical);
        assert!(outcome.issues[0].message.contains("Secure Boot enabled"));

        let context = outcome.context.unwrap();
        assert!(context.gsp_firmware_present);
        assert_eq!(context.firmware_blobs.len(), 1);
        assert_eq!(context.resource_map_excerpt, vec!["c0000000-dfffffff : PCI Bus 0000:00".to_string()]);
        assert!(context.largest_gap.is_some());
    }

    #[test]
    fn test_repair_then_load_succeeds() {
        let device = BusAddress::parse("0000:01:00.0").unwrap();
        let mut modules = MockModuleControl::new();
        modules.expect_is_loaded().return_const(false);
        let mut calls = 0;
        modules.expect_load().times(4).returning(move |_| {
            calls += 1;
            if calls <= 3 {
                Err(load_error())
            } else {
                Ok(())
            }
        });

        let mut bus = MockBusControl::new();
        let listed = device.clone();
        bus.expect_target_devices().returning(move || Ok(vec![listed.clone()]));
        bus.expect_hardware_window().returning(|_| Ok(0xc000_0000));
        let mut kernel_reads = 0;
        bus.expect_kernel_window().returning(move |_| {
            kernel_reads += 1;
            Ok(if kernel_reads == 1 { 0 } else { 0xe000_0000 })
        });
        bus.expect_resource_map()
            .returning(|| Ok("00000000-dfffffff : System RAM\n".to_string()));
        bus.expect_detach().times(1).returning(|_| Ok(()));
        bus.expect_write_window().times(1).returning(|_, _| Ok(()));
        bus.expect_rescan().times(1).returning(|| Ok(()));
        let platform = MockPlatform::new();
        let clock = FakeClock::new();
        let (module, bus_settings) = (ModuleSettings::default(), BusSettings::default());

        let outcome = ModuleRecovery::new(&modules, &bus, &platform, &clock, &module, &bus_settings).ensure_loaded();
        assert!(outcome.loaded);
        assert_eq!(outcome.repair.unwrap().fixed(), 1);
        assert!(outcome.issues.is_empty());
        assert!(outcome.context.is_none());
    }

    #[test]
    fn test_gsp_blobs_missing_dir() {
        assert!(gsp_blobs(Path::new("/nonexistent/firmware")).is_empty());
    }
}
