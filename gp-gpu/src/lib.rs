//! GPU query and control for gpuprov
//!
//! Normalizes what `nvidia-smi` reports about each GPU into [`GpuDevice`]
//! records and issues the capability, MIG and reset commands the engine
//! needs. Diagnostics output from `dcgmi` is captured raw.

pub mod constants;
pub mod dcgm;
pub mod nvidia;

mod types;

pub use constants as gpu_const;
pub use types::*;

use gp_error::ProvisionError;
use std::process::{Command, Output};
use tracing::trace;

pub type Result<T> = std::result::Result<T, ProvisionError>;

/// Enumerate all NVIDIA GPUs with their capability readings
pub fn enumerate_gpus() -> Result<Vec<GpuDevice>> {
    nvidia::enumerate_gpus()
}

/// Run a tool and capture its output; only a failure to launch is an error
pub fn capture_tool(tool: &str, args: &[&str]) -> Result<Output> {
    trace!("exec {} {:?}", tool, args);
    Command::new(tool).args(args).output().map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => ProvisionError::ToolMissing(tool.to_string()),
        _ => ProvisionError::generic(format!("Failed to run {}: {}", tool, e)),
    })
}

/// Run a tool to completion, mapping a missing binary and non-zero exit to errors
pub fn run_tool(tool: &str, args: &[&str]) -> Result<Output> {
    let output = capture_tool(tool, args)?;
    if !output.status.success() {
        // nvidia-smi reports most errors on stdout
        let detail = if output.stderr.is_empty() { &output.stdout } else { &output.stderr };
        return Err(ProvisionError::tool_failed(tool, &output.status, detail));
    }
    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_binary_is_tool_missing() {
        let err = run_tool("gpuprov-no-such-tool", &["--version"]).unwrap_err();
        assert!(err.is_tool_missing());
        assert_eq!(err.to_string(), "Missing required tool: gpuprov-no-such-tool");
    }

    #[test]
    fn test_non_zero_exit_carries_output() {
        let err = run_tool("sh", &["-c", "echo 'No devices were found'; exit 6"]).unwrap_err();
        match err {
            ProvisionError::ToolFailed { tool, stderr, .. } => {
                assert_eq!(tool, "sh");
                assert_eq!(stderr, "No devices were found");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_capture_keeps_failed_run() {
        let output = capture_tool("sh", &["-c", "echo partial; exit 1"]).unwrap();
        assert!(!output.status.success());
        assert_eq!(String::from_utf8_lossy(&output.stdout).trim(), "partial");
    }
}
