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

//! Command Line Interface

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

use gp_core::ActivationStrategy;

#[derive(Parser, Debug)]
#[command(name = "gpuprov")]
#[command(version)]
#[command(about = "Provision NVIDIA datacenter GPUs to a verified policy state")]
#[command(long_about = "gpuprov - GPU provisioning and commissioning

Brings every GPU to the configured MIG/ECC policy, activates the changes
with a device reset or a reboot, and classifies DCGM diagnostics into a
PASS/WARN/FAIL verdict.

EXAMPLES:
    gpuprov run                          Reconcile, activate, run diagnostics
    gpuprov run --policy mig=enabled     Override one capability
    gpuprov run --resumed                Verify after a scheduled reboot
    gpuprov verify                       Compare devices against policy only
    gpuprov classify diag.json --expected 8
    gpuprov bus plan                     Show register window plan
    gpuprov bus repair                   Reassign unclaimed register windows

ENVIRONMENT VARIABLES:
    GPUPROV_CONFIG=<path>    Settings file
    GPUPROV_RESUMED=1        Same as --resumed
    GPUPROV_LOG=debug        Log filter (tracing EnvFilter syntax)

FILES:
    /etc/gpuprov/config.json       System settings
    ~/.config/gpuprov/config.json  User settings
    /run/gpuprov/<pid>/            Per-run work area")]
#[command(propagate_version = true)]
pub struct Cli {
    /// Settings file (overrides GPUPROV_CONFIG and default locations)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Only log warnings and errors
    #[arg(short, long, global = true)]
    pub quiet: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Reconcile devices against policy, activate, run diagnostics
    Run(RunArgs),

    /// Query devices and compare against policy without applying
    Verify(ReportArgs),

    /// Classify a captured diagnostic document
    Classify(ClassifyArgs),

    /// PCI register window diagnosis and repair
    #[command(subcommand)]
    Bus(BusCommands),
}

#[derive(Args, Debug, Clone, Default)]
pub struct ReportArgs {
    /// Write the report here instead of stdout
    #[arg(short, long)]
    pub output: Option<PathBuf>,
}

#[derive(Args, Debug, Clone)]
pub struct RunArgs {
    /// This run follows a reboot scheduled by gpuprov
    #[arg(long, env = "GPUPROV_RESUMED")]
    pub resumed: bool,

    /// Classify this file instead of running dcgmi
    #[arg(long, conflicts_with_all = ["diag_level", "no_diag"])]
    pub diag_file: Option<PathBuf>,

    /// DCGM run level (1-4)
    #[arg(long, value_parser = clap::value_parser!(u8).range(1..=4))]
    pub diag_level: Option<u8>,

    /// Skip diagnostics
    #[arg(long)]
    pub no_diag: bool,

    /// Override policy, e.g. mig=disabled (repeatable)
    #[arg(long = "policy", value_name = "CAP=VALUE")]
    pub policy: Vec<String>,

    /// Activation strategy: auto, reset or reboot
    #[arg(long)]
    pub strategy: Option<ActivationStrategy>,

    #[command(flatten)]
    pub report: ReportArgs,
}

#[derive(Args, Debug, Clone)]
pub struct ClassifyArgs {
    /// Diagnostic output file
    pub file: PathBuf,

    /// Number of GPUs the run should have covered
    #[arg(long)]
    pub expected: Option<usize>,

    /// The tool that produced the file exited non-zero
    #[arg(long)]
    pub tool_failed: bool,

    #[command(flatten)]
    pub report: ReportArgs,
}

#[derive(Subcommand, Debug)]
pub enum BusCommands {
    /// Print the window plan without touching hardware
    Plan,
    /// Detach, reprogram and rescan devices with unclaimed windows
    Repair(ReportArgs),
}
