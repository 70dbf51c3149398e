/*
 * Integration tests for gpuprov
 *
 * These tests drive whole provisioning runs against in-memory devices and
 * check the report a run produces, plus a few properties of the engine
 * that must hold for any input.
 */

use clap::Parser;
use mockall::mock;
use serde_json::json;
use serial_test::serial;
use std::io::Write;

use gp_core::bus::{apply_plan, diagnose, plan_repair, plan_windows, RepairStatus, WindowRequest};
use gp_core::classify::classify_document;
use gp_core::constants::env;
use gp_core::fakes::{
    create_mock_gpu, FakeBackend, FakeBus, FakeLocator, FakeModules, FakePlatform, StaticDiagnostics,
};
use gp_core::hw::{DiagnosticSource, RawDiagnostic};
use gp_core::retry::FakeClock;
use gp_core::{
    load_settings, ActivationPhase, ActivationStrategy, BusAddress, Capability, CapabilityReading,
    Collaborators, IntervalSet, IssueCategory, PlanMethod, ProvisionError, ProvisionSettings,
    RunOptions, RunOutcome, Runner, Severity, Toggle, Verdict,
};
use gpuprov::cli::{Cli, Commands};
use gpuprov::commands::{resolve_settings, CommandError};

const MIB: u64 = 1024 * 1024;

mock! {
    pub BrokenDiagnostics {}

    impl DiagnosticSource for BrokenDiagnostics {
        fn collect(&self) -> gp_core::Result<RawDiagnostic>;
    }
}

// Test rig holding one of every collaborator
struct Host {
    backend: FakeBackend,
    platform: FakePlatform,
    bus: FakeBus,
    modules: FakeModules,
    locator: FakeLocator,
    clock: FakeClock,
}

impl Host {
    fn new(backend: FakeBackend) -> Self {
        Self {
            backend,
            platform: FakePlatform::default(),
            bus: FakeBus::new(""),
            modules: FakeModules::loaded(),
            locator: FakeLocator::default(),
            clock: FakeClock::new(),
        }
    }

    fn run_with(
        &self,
        settings: &ProvisionSettings,
        diagnostics: Option<&dyn DiagnosticSource>,
        options: RunOptions,
    ) -> RunOutcome {
        let collab = Collaborators {
            backend: &self.backend,
            platform: &self.platform,
            bus: &self.bus,
            modules: &self.modules,
            locator: &self.locator,
            diagnostics,
            clock: &self.clock,
        };
        Runner::new(settings, collab).run(options)
    }

    fn run(&self, settings: &ProvisionSettings) -> RunOutcome {
        self.run_with(settings, None, RunOptions::default())
    }
}

fn single_gpu(mig: Option<Toggle>, ecc: Option<Toggle>) -> FakeBackend {
    FakeBackend::new(vec![create_mock_gpu(0, "0000:17:00.0", mig, ecc)])
}

fn addr(s: &str) -> BusAddress {
    BusAddress::parse(s).unwrap()
}

#[test]
fn test_mig_disabled_by_reset_passes_clean() {
    let host = Host::new(single_gpu(Some(Toggle::Enabled), Some(Toggle::Enabled)));
    let outcome = host.run(&ProvisionSettings::default());

    assert_eq!(outcome.report.verdict(), Verdict::Pass);
    assert!(outcome.report.issues.is_empty(), "{:?}", outcome.report.issues);
    assert!(!outcome.reboot_requested);
    assert_eq!(outcome.report.activation, Some(ActivationPhase::Verified));
    assert_eq!(outcome.report.changes.len(), 1);
    assert_eq!(outcome.report.changes[0].capability, Capability::Mig);
    assert!(outcome.report.changes[0].verified);
    assert_eq!(host.backend.count("apply"), 1);
    assert_eq!(host.backend.count("reset"), 1);
    assert_eq!(outcome.report.exit_code(), 0);
}

#[test]
fn test_reset_that_does_not_activate_warns_once() {
    let mut backend = single_gpu(Some(Toggle::Enabled), Some(Toggle::Enabled));
    backend.sticky_reset = true;
    let host = Host::new(backend);
    let outcome = host.run(&ProvisionSettings::default());

    assert_eq!(outcome.report.verdict(), Verdict::Warn);
    assert_eq!(outcome.report.issues.len(), 1);
    assert!(outcome.report.issues[0].message.contains("full reboot"));
    assert_eq!(outcome.report.issues[0].category, IssueCategory::ActivationPending);
    assert_eq!(host.platform.reboots(), 0);
    assert!(!outcome.reboot_requested);
}

#[test]
fn test_repair_falls_back_to_hardware_addresses() {
    // 20 MiB free between RAM and the reserved top, two 16 MiB windows needed
    let iomem = "00000000-bfffffff : System RAM\nc1400000-ffffffff : Reserved\n";
    let bus = FakeBus::new(iomem)
        .with_device("0000:17:00.0", 0xc000_0000, 0)
        .with_device("0000:65:00.0", 0xc000_0000, 0);

    let unclaimed = diagnose(&bus).unwrap();
    assert_eq!(unclaimed.len(), 2);
    let plan = plan_repair(&bus, &unclaimed, 16 * MIB, 1 << 32).unwrap();
    assert_eq!(plan.method, PlanMethod::HardwareFallback);

    let bases: Vec<u64> = plan.windows().map(|(_, w)| w.base_address).collect();
    assert_eq!(bases.len(), 2);
    assert_ne!(bases[0], bases[1]);
    assert!(bases.iter().all(|b| *b != 0));

    let summary = apply_plan(&bus, &unclaimed, &plan);
    assert_eq!(summary.method, Some(PlanMethod::HardwareFallback));
    assert_eq!(summary.count(RepairStatus::Fixed), 2);
    assert_eq!(bus.rescans(), 1);
    assert_eq!(bus.writes().len(), 2);
    assert!(summary.issues(true).is_empty());
}

#[test]
fn test_unknown_document_shape_found_by_generic_search() {
    let doc = json!({
        "run": {"suites": [{"name": "pcie", "results": [{"status": "Pass", "info": "link ok"}]}]}
    });
    let text = format!("Running diagnostics...\n{}\n", doc);
    let diagnostics = StaticDiagnostics::new(text, true);
    let host = Host::new(single_gpu(Some(Toggle::Disabled), Some(Toggle::Enabled)));

    let outcome = host.run_with(&ProvisionSettings::default(), Some(&diagnostics), RunOptions::default());
    let classification = outcome.report.diagnostics.as_ref().expect("diagnostics ran");
    assert_eq!(classification.strategy.as_deref(), Some("generic_search"));
    assert_eq!(classification.results.len(), 1);
    assert_eq!(classification.results[0].test_name, "pcie");
    assert_eq!(outcome.report.verdict(), Verdict::Pass);
}

#[test]
fn test_missing_tool_stops_before_query() {
    let mut host = Host::new(single_gpu(Some(Toggle::Enabled), Some(Toggle::Enabled)));
    host.locator = FakeLocator::missing(&["nvidia-smi"]);
    let outcome = host.run(&ProvisionSettings::default());

    assert_eq!(outcome.report.verdict(), Verdict::Fail);
    assert!(outcome.report.issues[0].message.contains("Missing required tool"));
    assert_eq!(outcome.report.issues[0].category, IssueCategory::Precondition);
    assert_eq!(host.backend.count("query"), 0);
    assert_eq!(outcome.report.exit_code(), 1);
}

#[test]
fn test_dcgmi_only_required_when_it_runs() {
    let mut host = Host::new(single_gpu(Some(Toggle::Disabled), Some(Toggle::Enabled)));
    host.locator = FakeLocator::missing(&["dcgmi"]);
    let diagnostics = StaticDiagnostics::new("{}", true);

    let from_file = host.run_with(&ProvisionSettings::default(), Some(&diagnostics), RunOptions::default());
    assert!(!from_file
        .report
        .issues
        .iter()
        .any(|i| i.category == IssueCategory::Precondition));

    let from_tool = host.run_with(
        &ProvisionSettings::default(),
        Some(&diagnostics),
        RunOptions {
            dcgm_required: true,
            ..Default::default()
        },
    );
    assert_eq!(from_tool.report.verdict(), Verdict::Fail);
    assert_eq!(from_tool.report.issues[0].message, "Missing required tool: dcgmi");
}

#[test]
fn test_diagnostics_that_cannot_run_are_critical() {
    let mut broken = MockBrokenDiagnostics::new();
    broken
        .expect_collect()
        .times(1)
        .returning(|| Err(ProvisionError::generic("dcgmi: host engine not running")));
    let host = Host::new(single_gpu(Some(Toggle::Disabled), Some(Toggle::Enabled)));

    let outcome = host.run_with(&ProvisionSettings::default(), Some(&broken), RunOptions::default());
    assert_eq!(outcome.report.verdict(), Verdict::Fail);
    let issue = &outcome.report.issues[0];
    assert_eq!(issue.category, IssueCategory::Diagnostics);
    assert!(issue.message.starts_with("Diagnostics could not run"));
}

#[test]
fn test_unparseable_diagnostics_preserved_in_artifact_dir() {
    let dir = tempfile::tempdir().unwrap();
    let mut settings = ProvisionSettings::default();
    settings.report.artifact_dir = Some(dir.path().to_path_buf());
    let diagnostics = StaticDiagnostics::new("Error: unable to connect to host engine", false);
    let host = Host::new(single_gpu(Some(Toggle::Disabled), Some(Toggle::Enabled)));

    let outcome = host.run_with(&settings, Some(&diagnostics), RunOptions::default());
    assert_eq!(outcome.report.verdict(), Verdict::Fail);
    assert_eq!(outcome.report.preserved_outputs.len(), 1);
    let saved = outcome.report.preserved_outputs[0].path.clone().expect("saved to disk");
    assert!(std::path::Path::new(&saved).starts_with(dir.path()));
    assert_eq!(
        std::fs::read_to_string(saved).unwrap(),
        "Error: unable to connect to host engine"
    );
}

// Properties

#[test]
fn test_second_run_changes_nothing() {
    let host = Host::new(FakeBackend::new(vec![
        create_mock_gpu(0, "0000:17:00.0", Some(Toggle::Enabled), Some(Toggle::Disabled)),
        create_mock_gpu(1, "0000:65:00.0", Some(Toggle::Disabled), Some(Toggle::Enabled)),
    ]));
    let settings = ProvisionSettings::default();

    let first = host.run(&settings);
    assert_eq!(first.report.changes.len(), 2);
    let applied = host.backend.count("apply");

    let second = host.run(&settings);
    assert!(second.report.changes.is_empty());
    assert_eq!(second.report.activation, Some(ActivationPhase::NotNeeded));
    assert_eq!(host.backend.count("apply"), applied);
    assert_eq!(second.report.verdict(), Verdict::Pass);
}

#[test]
fn test_pending_change_is_not_applied_again() {
    let mut backend = single_gpu(Some(Toggle::Enabled), Some(Toggle::Enabled));
    backend.sticky_reset = true;
    let host = Host::new(backend);
    let settings = ProvisionSettings::default();

    host.run(&settings);
    assert_eq!(host.backend.count("apply"), 1);
    let second = host.run(&settings);
    assert_eq!(host.backend.count("apply"), 1);
    assert_eq!(host.backend.count("reset"), 2);
    assert_eq!(second.report.changes.len(), 1);
    assert!(!second.report.changes[0].verified);
    assert_eq!(second.report.verdict(), Verdict::Warn);
    assert!(second.report.issues.iter().any(|i| i.message.contains("full reboot")));
}

#[test]
fn test_change_left_pending_by_interrupted_run_is_activated() {
    let mut gpu = create_mock_gpu(0, "0000:17:00.0", Some(Toggle::Enabled), Some(Toggle::Enabled));
    gpu.capabilities.insert(
        Capability::Mig,
        CapabilityReading::known(Toggle::Enabled, Some(Toggle::Disabled)),
    );
    let host = Host::new(FakeBackend::new(vec![gpu]));
    let outcome = host.run(&ProvisionSettings::default());

    assert_eq!(host.backend.count("apply"), 0);
    assert_eq!(host.backend.count("reset"), 1);
    assert_eq!(outcome.report.activation, Some(ActivationPhase::Verified));
    assert_eq!(outcome.report.changes.len(), 1);
    assert_eq!(outcome.report.changes[0].previous_value, Some(Toggle::Enabled));
    assert!(outcome.report.changes[0].verified);
    assert_eq!(host.backend.devices()[0].capability(Capability::Mig).current, Some(Toggle::Disabled));
    assert_eq!(outcome.report.verdict(), Verdict::Pass);
}

#[test]
fn test_unsupported_capability_never_applied() {
    let host = Host::new(FakeBackend::new(vec![
        create_mock_gpu(0, "0000:17:00.0", None, Some(Toggle::Enabled)),
        create_mock_gpu(1, "0000:65:00.0", None, None),
    ]));
    let outcome = host.run(&ProvisionSettings::default());

    assert_eq!(host.backend.count("apply"), 0);
    assert!(outcome.report.issues.is_empty());
    assert_eq!(outcome.report.verdict(), Verdict::Pass);
}

#[test]
fn test_reboot_strategy_requests_reboot_and_skips_diagnostics() {
    let mut settings = ProvisionSettings::default();
    settings.activation.strategy = ActivationStrategy::Reboot;
    let diagnostics = StaticDiagnostics::new("{}", true);
    let host = Host::new(single_gpu(Some(Toggle::Enabled), Some(Toggle::Enabled)));

    let outcome = host.run_with(&settings, Some(&diagnostics), RunOptions::default());
    assert!(outcome.reboot_requested);
    assert_eq!(outcome.report.activation, Some(ActivationPhase::RebootScheduled));
    assert!(outcome.report.diagnostics.is_none());
    assert_eq!(host.backend.count("reset"), 0);
    // the caller reboots once the report is out
    assert_eq!(host.platform.reboots(), 0);
}

#[test]
fn test_resumed_run_verifies_without_applying() {
    let host = Host::new(single_gpu(Some(Toggle::Disabled), Some(Toggle::Enabled)));
    let outcome = host.run_with(
        &ProvisionSettings::default(),
        None,
        RunOptions {
            resumed: true,
            ..Default::default()
        },
    );
    assert!(outcome.report.resumed);
    assert_eq!(outcome.report.activation, Some(ActivationPhase::Verified));
    assert_eq!(host.backend.count("apply"), 0);
    assert_eq!(outcome.report.verdict(), Verdict::Pass);
}

#[test]
fn test_allocated_windows_never_overlap_and_stay_aligned() {
    let cases: &[(&str, &[u64], u64)] = &[
        ("00000000-bfffffff : System RAM\n", &[0xc000_0000, 0xc100_0000, 0xc200_0000], 16 * MIB),
        ("00000000-bfffffff : RAM\nc1400000-ffffffff : Reserved\n", &[0xc000_0000, 0xc000_0000], 16 * MIB),
        ("00000000-0fffffff : RAM\n20000000-ffffffff : Reserved\n", &[0x1000_0000; 4], 32 * MIB),
        ("00000000-fbffffff : RAM\n", &[0xfc00_0000, 0xfc00_0000, 0xfe00_0000], 16 * MIB),
    ];

    for (iomem, bases, size) in cases {
        let claimed = gp_core::bus::claimed_ranges(iomem, 1 << 32);
        let requests: Vec<WindowRequest> = bases
            .iter()
            .enumerate()
            .map(|(i, base)| WindowRequest {
                device: addr(&format!("0000:{:02x}:00.0", 0x17 + i)),
                hardware_base: *base,
            })
            .collect();
        let plan = plan_windows(&requests, &claimed, *size, 1 << 32);

        let windows: Vec<_> = plan.windows().map(|(_, w)| *w).collect();
        for (i, a) in windows.iter().enumerate() {
            assert!(a.is_aligned(), "{:?} unaligned in {}", a, iomem);
            assert!(a.end() <= 1 << 32);
            for b in &windows[i + 1..] {
                assert!(!a.range().overlaps(&b.range()), "{:?} overlaps {:?}", a, b);
            }
        }
        if plan.method == PlanMethod::LargestGap {
            for w in &windows {
                assert!(!claimed.overlaps(w.base_address, w.end()));
            }
        }
    }
}

#[test]
fn test_largest_gap_packing_avoids_claims() {
    let mut claimed = IntervalSet::new();
    claimed.insert(0, 0xd000_0000);
    claimed.insert(0xf000_0000, 1 << 32);
    let requests = vec![
        WindowRequest { device: addr("0000:17:00.0"), hardware_base: 0xc000_0000 },
        WindowRequest { device: addr("0000:65:00.0"), hardware_base: 0xc100_0000 },
    ];
    let plan = plan_windows(&requests, &claimed, 16 * MIB, 1 << 32);
    assert_eq!(plan.method, PlanMethod::LargestGap);
    let bases: Vec<u64> = plan.windows().map(|(_, w)| w.base_address).collect();
    assert_eq!(bases, vec![0xd000_0000, 0xd100_0000]);
}

#[test]
fn test_classifier_verdict_is_monotone() {
    fn doc(statuses: &[&str]) -> serde_json::Value {
        let results: Vec<_> = statuses
            .iter()
            .enumerate()
            .map(|(i, s)| json!({"gpu_id": i, "status": s}))
            .collect();
        json!({"dcgm_diagnostics": {"test_results": [{"test": "memory", "results": results}]}})
    }

    let base = ["Pass", "Pass", "Skip", "Pass"];
    let before = classify_document(&doc(&base), Some(4)).unwrap().verdict;
    assert_eq!(before, Verdict::Pass);

    for i in 0..base.len() {
        for worse in ["Warn", "Fail"] {
            let mut statuses = base;
            statuses[i] = worse;
            let after = classify_document(&doc(&statuses), Some(4)).unwrap().verdict;
            assert!(after >= before, "{:?} lowered the verdict", statuses);
            assert_eq!(after == Verdict::Fail, worse == "Fail");
        }
    }

    let mixed = classify_document(&doc(&["Warn", "Fail", "Pass", "Pass"]), Some(4)).unwrap();
    assert_eq!(mixed.verdict, Verdict::Fail);
    let severities: Vec<Severity> = mixed.results.iter().map(|r| r.severity).collect();
    assert_eq!(severities, vec![Severity::Critical]);
}

// Settings resolution

fn write_config(contents: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(contents.as_bytes()).unwrap();
    file
}

#[test]
#[serial]
fn test_config_from_environment() {
    let file = write_config(r#"{"activation": {"strategy": "reset"}, "diagnostics": {"level": 3}}"#);
    std::env::set_var(env::CONFIG, file.path());
    let settings = load_settings(None);
    std::env::remove_var(env::CONFIG);

    let settings = settings.unwrap();
    assert_eq!(settings.activation.strategy, ActivationStrategy::Reset);
    assert_eq!(settings.diagnostics.level, 3);
}

#[test]
#[serial]
fn test_named_config_must_exist() {
    std::env::set_var(env::CONFIG, "/nonexistent/gpuprov/config.json");
    let result = load_settings(None);
    std::env::remove_var(env::CONFIG);
    assert!(matches!(result, Err(ProvisionError::FileNotFound(_))));
}

#[test]
#[serial]
fn test_command_line_overrides_config_file() {
    let file = write_config(r#"{"policy": {"mig": "enabled", "ecc": "enabled"}}"#);
    let path = file.path().to_string_lossy().to_string();
    let cli = Cli::try_parse_from([
        "gpuprov", "--config", path.as_str(), "run", "--policy", "mig=disabled", "--strategy", "reboot",
    ])
    .unwrap();
    let Commands::Run(args) = &cli.command else {
        panic!("expected run command");
    };

    let settings = resolve_settings(&cli, Some(args)).unwrap();
    assert_eq!(settings.policy.target(Capability::Mig), Some(Toggle::Disabled));
    assert_eq!(settings.policy.target(Capability::Ecc), Some(Toggle::Enabled));
    assert_eq!(settings.activation.strategy, ActivationStrategy::Reboot);
}

#[test]
#[serial]
fn test_bad_override_is_usage_error() {
    std::env::remove_var(env::CONFIG);
    let cli = Cli::try_parse_from(["gpuprov", "run", "--policy", "mig=sideways"]).unwrap();
    let Commands::Run(args) = &cli.command else {
        panic!("expected run command");
    };
    let err = resolve_settings(&cli, Some(args)).unwrap_err();
    assert!(matches!(err, CommandError::Usage(_)));
    assert_eq!(err.exit_code(), 2);
}
