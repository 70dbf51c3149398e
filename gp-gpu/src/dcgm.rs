//! DCGM diagnostics runner
//!
//! Runs `dcgmi diag` with JSON output. The document shape differs across
//! DCGM major versions; interpreting it is the classifier's job, this module
//! only captures stdout and the exit status.

use crate::constants::DCGMI;
use crate::{capture_tool, Result};
use tracing::{info, warn};

/// Raw output of one diagnostic run
#[derive(Debug, Clone)]
pub struct DiagRun {
    pub stdout: String,
    pub stderr: String,
    /// Whether dcgmi exited with status 0
    pub exit_ok: bool,
}

/// Run `dcgmi diag -r <level> -j`
///
/// A non-zero exit is not an error here: dcgmi exits non-zero when a test
/// fails, and the output still carries the per-test results.
pub fn run_diag(level: u8) -> Result<DiagRun> {
    info!("Running DCGM diagnostics at level {}", level);
    let output = capture_tool(DCGMI, &["diag", "-r", &level.to_string(), "-j"])?;

    let run = DiagRun {
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        exit_ok: output.status.success(),
    };
    if !run.exit_ok {
        warn!("dcgmi diag exited with {}", output.status);
    }
    Ok(run)
}
