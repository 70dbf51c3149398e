//! NVIDIA GPU query and control
//!
//! Everything goes through `nvidia-smi`. Parsing is kept separate from
//! process execution so the tolerant row handling can be tested on captured
//! output.

use crate::constants::{
    INVALID_FIELD_MARKER, LEGACY_QUERY_FIELDS, NOTHING_TO_DESTROY, NOT_AVAILABLE, NVIDIA_SMI,
    QUERY_FIELDS,
};
use crate::{run_tool, BusAddress, Capability, CapabilityReading, GpuDevice, GpuIdentity, Result, Toggle};
use gp_error::ProvisionError;
use std::collections::BTreeMap;
use tracing::{debug, info, trace, warn};

/// Column layout of a query
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryLayout {
    /// `QUERY_FIELDS`, MIG columns present
    Full,
    /// `LEGACY_QUERY_FIELDS`, no MIG columns
    Legacy,
}

impl QueryLayout {
    fn fields(&self) -> &'static str {
        match self {
            QueryLayout::Full => QUERY_FIELDS,
            QueryLayout::Legacy => LEGACY_QUERY_FIELDS,
        }
    }
}

pub fn enumerate_gpus() -> Result<Vec<GpuDevice>> {
    match query(QueryLayout::Full) {
        Ok(gpus) => Ok(gpus),
        Err(ProvisionError::ToolFailed { stderr, .. }) if stderr.contains(INVALID_FIELD_MARKER) => {
            info!("Driver does not know MIG query fields, retrying legacy query");
            query(QueryLayout::Legacy)
        }
        Err(e) => Err(e),
    }
}

fn query(layout: QueryLayout) -> Result<Vec<GpuDevice>> {
    let query_arg = format!("--query-gpu={}", layout.fields());
    let output = run_tool(NVIDIA_SMI, &[query_arg.as_str(), "--format=csv,noheader"])?;
    let stdout = String::from_utf8_lossy(&output.stdout);
    Ok(parse_query_output(&stdout, layout))
}

/// Parse `--format=csv,noheader` rows into devices
///
/// Short rows are tolerated: missing capability columns read as unsupported.
/// Rows without a usable index or bus id are skipped.
pub fn parse_query_output(stdout: &str, layout: QueryLayout) -> Vec<GpuDevice> {
    let mut gpus = Vec::new();

    for line in stdout.lines() {
        if line.trim().is_empty() {
            continue;
        }

        let parts: Vec<&str> = line.split(',').map(|s| s.trim()).collect();
        let field = |i: usize| parts.get(i).copied().unwrap_or("");

        let index = match field(0).parse::<u32>() {
            Ok(idx) => idx,
            Err(e) => {
                warn!("Failed to parse GPU index '{}': {}", field(0), e);
                continue;
            }
        };
        let Some(bus) = BusAddress::parse(field(1)) else {
            warn!("Skipping GPU {} with unusable bus id '{}'", index, field(1));
            continue;
        };

        let mut capabilities = BTreeMap::new();
        match layout {
            QueryLayout::Full => {
                capabilities.insert(Capability::Mig, parse_mode_pair(field(5), field(6)));
                capabilities.insert(Capability::Ecc, parse_mode_pair(field(7), field(8)));
            }
            QueryLayout::Legacy => {
                capabilities.insert(Capability::Mig, CapabilityReading::unsupported());
                capabilities.insert(Capability::Ecc, parse_mode_pair(field(5), field(6)));
            }
        }

        trace!("GPU {} at {}: {:?}", index, bus, capabilities);
        gpus.push(GpuDevice {
            identity: GpuIdentity {
                index,
                bus,
                serial: optional_field(field(2)),
                uuid: optional_field(field(3)),
                name: if field(4).is_empty() { "Unknown GPU".to_string() } else { field(4).to_string() },
            },
            capabilities,
        });
    }

    gpus
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ModeField {
    Value(Toggle),
    NotAvailable,
    Unknown,
}

impl ModeField {
    fn value(self) -> Option<Toggle> {
        match self {
            ModeField::Value(t) => Some(t),
            _ => None,
        }
    }
}

fn parse_mode_field(s: &str) -> ModeField {
    if NOT_AVAILABLE.contains(&s) {
        ModeField::NotAvailable
    } else {
        s.parse::<Toggle>().map(ModeField::Value).unwrap_or(ModeField::Unknown)
    }
}

fn parse_mode_pair(current: &str, pending: &str) -> CapabilityReading {
    let pending_field = parse_mode_field(pending);
    match parse_mode_field(current) {
        ModeField::Value(c) => CapabilityReading::known(c, pending_field.value()),
        ModeField::NotAvailable if pending_field == ModeField::NotAvailable => {
            CapabilityReading::unsupported()
        }
        ModeField::NotAvailable | ModeField::Unknown => CapabilityReading {
            pending: pending_field.value(),
            ..CapabilityReading::unknown()
        },
    }
}

fn optional_field(s: &str) -> Option<String> {
    if NOT_AVAILABLE.contains(&s) {
        None
    } else {
        Some(s.to_string())
    }
}

/// Set a capability; takes effect after reset or reboot
pub fn set_capability(bus: &BusAddress, capability: Capability, value: Toggle) -> Result<()> {
    let flag = match capability {
        Capability::Mig => "-mig",
        Capability::Ecc => "-e",
    };
    run_tool(NVIDIA_SMI, &["-i", bus.as_str(), flag, value.as_flag()])?;
    info!("Set {} {} to {}", bus, capability, value);
    Ok(())
}

/// Tear down MIG compute and GPU instances (compute first)
pub fn destroy_mig_instances(bus: &BusAddress) -> Result<()> {
    for op in ["-dci", "-dgi"] {
        match run_tool(NVIDIA_SMI, &["mig", "-i", bus.as_str(), op]) {
            Ok(_) => debug!("nvidia-smi mig {} on {} ok", op, bus),
            Err(ProvisionError::ToolFailed { stderr, .. }) if nothing_to_destroy(&stderr) => {
                debug!("No MIG instances to destroy on {} ({})", bus, op);
            }
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

fn nothing_to_destroy(stderr: &str) -> bool {
    let lower = stderr.to_ascii_lowercase();
    NOTHING_TO_DESTROY.iter().any(|m| lower.contains(m))
}

/// Secondary bus reset of one GPU through the driver
pub fn reset_device(bus: &BusAddress) -> Result<()> {
    run_tool(NVIDIA_SMI, &["--gpu-reset", "-i", bus.as_str()])?;
    info!("Reset GPU {}", bus);
    Ok(())
}

/// Whether the driver answers queries and lists at least one GPU
pub fn probe_available() -> bool {
    match run_tool(NVIDIA_SMI, &["-L"]) {
        Ok(output) => count_listed_gpus(&String::from_utf8_lossy(&output.stdout)) > 0,
        Err(e) => {
            debug!("nvidia-smi -L not ready: {}", e);
            false
        }
    }
}

/// Count `GPU n: ...` lines of `nvidia-smi -L`
pub fn count_listed_gpus(stdout: &str) -> usize {
    stdout
        .lines()
        .filter(|l| l.trim_start().starts_with("GPU "))
        .count()
}

/// Installed driver version, if the driver responds
pub fn driver_version() -> Option<String> {
    let output = run_tool(
        NVIDIA_SMI,
        &["--query-gpu=driver_version", "--format=csv,noheader"],
    )
    .ok()?;
    String::from_utf8_lossy(&output.stdout)
        .lines()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;

    const H100_OUTPUT: &str = "\
0, 00000000:17:00.0, 1650123000001, GPU-aaaa, NVIDIA H100 80GB HBM3, Enabled, Enabled, Enabled, Enabled
1, 00000000:2A:00.0, 1650123000002, GPU-bbbb, NVIDIA H100 80GB HBM3, Enabled, Disabled, Enabled, Enabled
";

    #[test]
    fn test_parse_full_rows() {
        let gpus = parse_query_output(H100_OUTPUT, QueryLayout::Full);
        assert_eq!(gpus.len(), 2);
        assert_eq!(gpus[0].id().as_str(), "0000:17:00.0");
        assert_eq!(gpus[1].id().as_str(), "0000:2a:00.0");
        assert_eq!(gpus[0].identity.serial.as_deref(), Some("1650123000001"));

        let mig = gpus[1].capability(Capability::Mig);
        assert_eq!(mig.current, Some(Toggle::Enabled));
        assert_eq!(mig.pending, Some(Toggle::Disabled));
        assert_eq!(mig.effective(), Some(Toggle::Disabled));
    }

    #[test]
    fn test_not_supported_marks_capability_unsupported() {
        let out = "0, 00000000:65:00.0, [N/A], GPU-cccc, NVIDIA L40S, [N/A], [N/A], Enabled, Enabled\n";
        let gpus = parse_query_output(out, QueryLayout::Full);
        assert!(!gpus[0].capability(Capability::Mig).supported);
        assert!(gpus[0].capability(Capability::Ecc).supported);
        assert_eq!(gpus[0].identity.serial, None);
    }

    #[test]
    fn test_short_row_tolerated() {
        let out = "0, 00000000:65:00.0, 123, GPU-cccc, NVIDIA A100\n";
        let gpus = parse_query_output(out, QueryLayout::Full);
        assert_eq!(gpus.len(), 1);
        assert!(!gpus[0].capability(Capability::Mig).supported);
        assert!(!gpus[0].capability(Capability::Ecc).supported);
    }

    #[test]
    fn test_unknown_value_is_supported_but_unreadable() {
        let out = "0, 00000000:65:00.0, 123, GPU-c, NVIDIA A100, [Unknown Error], [Unknown Error], Enabled, Enabled\n";
        let mig = parse_query_output(out, QueryLayout::Full)[0].capability(Capability::Mig);
        assert!(mig.supported);
        assert_eq!(mig.current, None);
    }

    #[test]
    fn test_bad_rows_skipped() {
        let out = "No devices were found\nx, 00000000:65:00.0\n0, [N/A], 1, 2, 3\n";
        assert!(parse_query_output(out, QueryLayout::Full).is_empty());
    }

    #[test]
    fn test_legacy_layout_reports_mig_unsupported() {
        let out = "0, 0000:03:00.0, 42, GPU-d, Tesla V100, Disabled, Enabled\n";
        let gpus = parse_query_output(out, QueryLayout::Legacy);
        assert!(!gpus[0].capability(Capability::Mig).supported);
        let ecc = gpus[0].capability(Capability::Ecc);
        assert_eq!(ecc.current, Some(Toggle::Disabled));
        assert_eq!(ecc.pending, Some(Toggle::Enabled));
    }

    #[test]
    fn test_count_listed_gpus() {
        let out = "GPU 0: NVIDIA H100 (UUID: GPU-a)\nGPU 1: NVIDIA H100 (UUID: GPU-b)\n";
        assert_eq!(count_listed_gpus(out), 2);
        assert_eq!(count_listed_gpus("No devices were found\n"), 0);
    }

    #[test]
    fn test_nothing_to_destroy_detection() {
        assert!(nothing_to_destroy("No GPU instances found: Not Found"));
        assert!(!nothing_to_destroy("Insufficient Permissions"));
    }
}
