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

//! Report emission

use std::io::Write;
use std::path::Path;
use tracing::info;

use gp_core::bus::{UnclaimedDevice, WindowPlan};
use gp_core::{write_json_atomic, ProvisionReport};
use gp_error::{ProvisionError, Result};

/// Pretty JSON to `output` (atomic) or stdout
pub fn emit_report(report: &ProvisionReport, output: Option<&Path>) -> Result<()> {
    match output {
        Some(path) => {
            write_json_atomic(path, report)?;
            info!(path = %path.display(), verdict = %report.verdict(), "Report written");
        }
        None => {
            let json = serde_json::to_string_pretty(report)?;
            let mut stdout = std::io::stdout().lock();
            writeln!(stdout, "{}", json).map_err(ProvisionError::Io)?;
        }
    }
    Ok(())
}

/// Human-readable window plan, one device per line
pub fn render_plan(unclaimed: &[UnclaimedDevice], plan: &WindowPlan) -> String {
    let mut out = format!("Method: {:?}\n", plan.method);
    if let Some(gap) = plan.gap {
        out.push_str(&format!("Largest gap: {}\n", gap));
    }
    for assignment in &plan.assignments {
        let hardware = unclaimed
            .iter()
            .find(|u| u.device == assignment.device)
            .map(|u| u.hardware_base)
            .unwrap_or(0);
        let line = match (&assignment.window, &assignment.error) {
            (Some(window), _) => format!(
                "{}  {:#010x} -> {:#010x} ({} MiB)\n",
                assignment.device,
                hardware,
                window.base_address,
                window.size / (1024 * 1024)
            ),
            (None, Some(error)) => format!("{}  {:#010x} -> unassigned: {}\n", assignment.device, hardware, error),
            (None, None) => format!("{}  {:#010x} -> unassigned\n", assignment.device, hardware),
        };
        out.push_str(&line);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use gp_core::bus::{plan_windows, IntervalSet, WindowRequest};
    use gp_core::BusAddress;

    #[test]
    fn test_report_written_atomically() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("report.json");
        let mut report = ProvisionReport::new("node", false);
        report.finalize(&[]);
        emit_report(&report, Some(&path)).unwrap();

        let back: ProvisionReport = serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(back, report);
        assert!(!path.with_extension("json.tmp").exists());
    }

    #[test]
    fn test_render_plan_lists_every_device() {
        let device = BusAddress::parse("0000:17:00.0").unwrap();
        let unclaimed = vec![UnclaimedDevice {
            device: device.clone(),
            hardware_base: 0xc000_0000,
        }];
        let requests = vec![WindowRequest {
            device,
            hardware_base: 0xc000_0000,
        }];
        let mut claimed = IntervalSet::new();
        claimed.insert(0, 0xd000_0000);
        let plan = plan_windows(&requests, &claimed, 16 * 1024 * 1024, 1 << 32);
        let text = render_plan(&unclaimed, &plan);
        assert!(text.starts_with("Method: LargestGap\n"));
        assert!(text.contains("0000:17:00.0  0xc0000000 -> 0xd0000000 (16 MiB)"));
    }
}
