/*
 * This file is part of gpuprov.
 *
 * Copyright (C) 2025 gpuprov contributors
 *
 * gpuprov is free software: you can redistribute it and/or modify
 * it under the terms of the GNU General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * gpuprov is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
 * GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License
 * along with gpuprov. If not, see <https://www.gnu.org/licenses/>.
 */

//! Subcommand handlers
//!
//! Each handler wires the real collaborators, runs one operation and
//! returns the process exit status.

use anyhow::Context;
use std::path::PathBuf;
use tracing::{error, info, warn};

use gp_core::bus::{diagnose, plan_repair, repair};
use gp_core::constants::{bus::SETPCI, exit, millis};
use gp_core::preflight::check_named;
use gp_core::{
    classify_output, load_settings, remove_work_dir, Collaborators, DcgmSource, DiagnosticSource,
    FileSource, Modprobe, ModuleControl, NvidiaBackend, PathLocator, Platform, ProvisionReport,
    ProvisionSettings, RunOptions, Runner, SysfsBus, SystemClock, SystemPlatform, WorkArea,
};
use gp_error::ProvisionError;

use crate::cli::{BusCommands, ClassifyArgs, Cli, Commands, ReportArgs, RunArgs};
use crate::output::{emit_report, render_plan};

/// Errors that map to a specific exit status
#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    /// Bad configuration or arguments
    #[error("{0}")]
    Usage(String),

    #[error("gpuprov must run as root for {0}")]
    NotRoot(&'static str),
}

impl CommandError {
    pub fn exit_code(&self) -> i32 {
        match self {
            CommandError::Usage(_) => exit::USAGE,
            CommandError::NotRoot(_) => exit::FAIL,
        }
    }
}

fn usage(e: ProvisionError) -> CommandError {
    CommandError::Usage(e.to_string())
}

fn require_root(what: &'static str) -> Result<(), CommandError> {
    // SAFETY: geteuid has no preconditions and cannot fail
    if unsafe { libc::geteuid() } != 0 {
        return Err(CommandError::NotRoot(what));
    }
    Ok(())
}

/// Settings from file, adjusted by `run` flags, validated
pub fn resolve_settings(cli: &Cli, args: Option<&RunArgs>) -> Result<ProvisionSettings, CommandError> {
    let mut settings = load_settings(cli.config.as_deref()).map_err(usage)?;
    if let Some(args) = args {
        for spec in &args.policy {
            settings.policy.apply_override(spec).map_err(usage)?;
        }
        if let Some(strategy) = args.strategy {
            settings.activation.strategy = strategy;
        }
        if let Some(level) = args.diag_level {
            settings.diagnostics.level = level;
        }
        if args.no_diag {
            settings.diagnostics.enabled = false;
        }
    }
    settings.validate().map_err(usage)?;
    Ok(settings)
}

/// Real collaborators for this host
struct Host {
    backend: NvidiaBackend,
    platform: SystemPlatform,
    bus: SysfsBus,
    modules: Modprobe,
    locator: PathLocator,
    clock: SystemClock,
}

impl Host {
    fn new(settings: &ProvisionSettings) -> Self {
        let bus = SysfsBus::new(&settings.bus.sysfs_root, &settings.bus.iomem_path, settings.bus.vendor_id.clone())
            .with_settle(millis(settings.bus.rescan_settle_ms));
        Self {
            backend: NvidiaBackend::new(),
            platform: SystemPlatform,
            bus,
            modules: Modprobe,
            locator: PathLocator::from_env(),
            clock: SystemClock,
        }
    }

    fn collaborators<'a>(&'a self, diagnostics: Option<&'a dyn DiagnosticSource>) -> Collaborators<'a> {
        Collaborators {
            backend: &self.backend,
            platform: &self.platform,
            bus: &self.bus,
            modules: &self.modules,
            locator: &self.locator,
            diagnostics,
            clock: &self.clock,
        }
    }
}

/// Remove the work area if the run is interrupted
fn install_cleanup(work_dir: PathBuf) {
    if let Err(e) = ctrlc::set_handler(move || {
        warn!("Interrupted, removing {}", work_dir.display());
        if let Err(e) = remove_work_dir(&work_dir) {
            error!("Failed to remove work area: {}", e);
        }
        std::process::exit(exit::FAIL);
    }) {
        warn!("Failed to set signal handler: {}", e);
    }
}

pub fn execute(cli: &Cli) -> anyhow::Result<i32> {
    match &cli.command {
        Commands::Run(args) => run(cli, args),
        Commands::Verify(args) => verify(cli, args),
        Commands::Classify(args) => classify(cli, args),
        Commands::Bus(BusCommands::Plan) => bus_plan(cli),
        Commands::Bus(BusCommands::Repair(args)) => bus_repair(cli, args),
    }
}

fn run(cli: &Cli, args: &RunArgs) -> anyhow::Result<i32> {
    let settings = resolve_settings(cli, Some(args))?;
    require_root("run")?;
    let host = Host::new(&settings);

    let file_source = args.diag_file.as_ref().map(|path| FileSource {
        path: path.clone(),
        exit_ok: true,
    });
    let dcgm_source = DcgmSource {
        level: settings.diagnostics.level,
    };
    let diagnostics: Option<&dyn DiagnosticSource> = match &file_source {
        Some(source) => Some(source),
        None if settings.diagnostics.enabled => Some(&dcgm_source),
        None => None,
    };

    let work = WorkArea::create(&settings.work_base).context("creating work area")?;
    install_cleanup(work.path().to_path_buf());

    let options = RunOptions {
        resumed: args.resumed,
        verify_only: false,
        dcgm_required: file_source.is_none() && diagnostics.is_some(),
    };
    let outcome = Runner::new(&settings, host.collaborators(diagnostics))
        .with_work_area(&work)
        .run(options);

    emit_report(&outcome.report, args.report.output.as_deref()).context("emitting report")?;
    drop(work);

    if outcome.reboot_requested {
        info!("Report emitted, rebooting to activate pending changes");
        if let Err(e) = host.platform.trigger_reboot() {
            error!("Reboot request failed: {}", e);
            return Ok(exit::FAIL);
        }
    }
    Ok(outcome.report.exit_code())
}

fn verify(cli: &Cli, args: &ReportArgs) -> anyhow::Result<i32> {
    let settings = resolve_settings(cli, None)?;
    require_root("verify")?;
    let host = Host::new(&settings);
    let outcome = Runner::new(&settings, host.collaborators(None)).run(RunOptions {
        verify_only: true,
        ..Default::default()
    });
    emit_report(&outcome.report, args.output.as_deref()).context("emitting report")?;
    Ok(outcome.report.exit_code())
}

fn classify(cli: &Cli, args: &ClassifyArgs) -> anyhow::Result<i32> {
    let settings = resolve_settings(cli, None)?;
    let source = FileSource {
        path: args.file.clone(),
        exit_ok: !args.tool_failed,
    };
    let raw = source.collect().map_err(usage)?;
    let expected = args.expected.or(settings.diagnostics.expected_devices);
    let outcome = classify_output(&raw, expected);

    let mut report = ProvisionReport::new(SystemPlatform.hostname(), false);
    report.extend(outcome.issues);
    if let Some(mut preserved) = outcome.preserved {
        if let Some(dir) = &settings.report.artifact_dir {
            if let Err(e) = preserved.save_into(dir) {
                warn!("Cannot save raw diagnostic output: {}", e);
            }
        }
        report.preserved_outputs.push(preserved);
    }
    report.diagnostics = Some(outcome.classification);
    report.finalize(&settings.report.suppressed_patterns);

    emit_report(&report, args.report.output.as_deref()).context("emitting report")?;
    Ok(report.exit_code())
}

fn bus_plan(cli: &Cli) -> anyhow::Result<i32> {
    let settings = resolve_settings(cli, None)?;
    let host = Host::new(&settings);
    let unclaimed = diagnose(&host.bus).context("reading PCI devices")?;
    if unclaimed.is_empty() {
        println!("All target devices have their register window claimed");
        return Ok(exit::OK);
    }
    let plan = plan_repair(&host.bus, &unclaimed, settings.bus.window_size, settings.bus.ceiling)
        .context("reading resource map")?;
    print!("{}", render_plan(&unclaimed, &plan));
    Ok(exit::OK)
}

fn bus_repair(cli: &Cli, args: &ReportArgs) -> anyhow::Result<i32> {
    let settings = resolve_settings(cli, None)?;
    require_root("bus repair")?;
    let host = Host::new(&settings);
    let mut report = ProvisionReport::new(host.platform.hostname(), false);

    let missing = check_named(&host.locator, &[SETPCI]);
    if missing.is_empty() {
        let summary = repair(&host.bus, settings.bus.window_size, settings.bus.ceiling)
            .context("repairing register windows")?;
        let driver_loaded = host.modules.is_loaded(&settings.module.name);
        report.extend(summary.issues(driver_loaded));
        report.bus_repair = Some(summary);
    } else {
        report.extend(missing);
    }
    report.finalize(&settings.report.suppressed_patterns);

    emit_report(&report, args.output.as_deref()).context("emitting report")?;
    Ok(report.exit_code())
}
