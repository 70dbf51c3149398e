//! Diagnostic output sources

use std::path::PathBuf;

use super::{DiagnosticSource, RawDiagnostic};
use gp_error::{ProvisionError, Result};

/// Runs `dcgmi diag` at a fixed level
#[derive(Debug, Clone, Copy)]
pub struct DcgmSource {
    pub level: u8,
}

impl DiagnosticSource for DcgmSource {
    fn collect(&self) -> Result<RawDiagnostic> {
        let run = gp_gpu::dcgm::run_diag(self.level)?;
        Ok(RawDiagnostic {
            source: format!("dcgmi diag -r {}", self.level),
            text: run.stdout,
            exit_ok: run.exit_ok,
        })
    }
}

/// Previously captured diagnostic output
#[derive(Debug, Clone)]
pub struct FileSource {
    pub path: PathBuf,
    /// Exit status of the run that produced the file
    pub exit_ok: bool,
}

impl DiagnosticSource for FileSource {
    fn collect(&self) -> Result<RawDiagnostic> {
        let text = std::fs::read_to_string(&self.path).map_err(|e| ProvisionError::FileRead {
            path: self.path.clone(),
            source: e,
        })?;
        Ok(RawDiagnostic {
            source: self.path.display().to_string(),
            text,
            exit_ok: self.exit_ok,
        })
    }
}
