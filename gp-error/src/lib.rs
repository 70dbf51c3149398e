//! Unified error handling for gpuprov
//!
//! One error type shared by every gpuprov crate.
//! Library crates return it directly; the binary wraps it in `anyhow` at the edge.

use std::io;
use std::path::PathBuf;

/// Result type alias using ProvisionError
pub type Result<T> = std::result::Result<T, ProvisionError>;

/// Unified error type for all gpuprov operations
#[derive(thiserror::Error, Debug)]
pub enum ProvisionError {
    // ============================================================================
    // I/O and File System Errors
    // ============================================================================
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Failed to read file {path}: {source}")]
    FileRead {
        path: PathBuf,
        source: io::Error,
    },

    #[error("Failed to write file {path}: {source}")]
    FileWrite {
        path: PathBuf,
        source: io::Error,
    },

    #[error("File not found: {0}")]
    FileNotFound(PathBuf),

    // ============================================================================
    // External Tool Errors
    // ============================================================================
    #[error("Missing required tool: {0}")]
    ToolMissing(String),

    #[error("{tool} failed ({status}): {stderr}")]
    ToolFailed {
        tool: String,
        status: String,
        stderr: String,
    },

    #[error("Failed to parse {what}: {reason}")]
    Parse {
        what: String,
        reason: String,
    },

    #[error("Failed to parse JSON: {0}")]
    JsonParse(#[from] serde_json::Error),

    // ============================================================================
    // Hardware Access Errors
    // ============================================================================
    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    #[error("Capability {capability} not supported on {device}")]
    Unsupported {
        device: String,
        capability: String,
    },

    #[error("Sysfs access failed for {path}: {reason}")]
    Sysfs {
        path: PathBuf,
        reason: String,
    },

    #[error("Address window allocation failed: {0}")]
    Allocation(String),

    #[error("Kernel module {module} failed to load: {reason}")]
    ModuleLoad {
        module: String,
        reason: String,
    },

    // ============================================================================
    // Configuration Errors
    // ============================================================================
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration value for {field}: {reason}")]
    InvalidConfig {
        field: String,
        reason: String,
    },

    // ============================================================================
    // Generic Errors
    // ============================================================================
    #[error("{0}")]
    Generic(String),

    #[error("Operation timed out: {0}")]
    Timeout(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),
}

impl ProvisionError {
    /// Create a generic error from a string
    pub fn generic(msg: impl Into<String>) -> Self {
        Self::Generic(msg.into())
    }

    /// Create a config error from a string
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create an invalid config value error
    pub fn invalid_config(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidConfig {
            field: field.into(),
            reason: reason.into(),
        }
    }

    /// Create a parse error
    pub fn parse(what: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Parse {
            what: what.into(),
            reason: reason.into(),
        }
    }

    /// Create a sysfs error
    pub fn sysfs(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::Sysfs {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Create a tool failure error from a finished process
    pub fn tool_failed(
        tool: impl Into<String>,
        status: &std::process::ExitStatus,
        stderr: &[u8],
    ) -> Self {
        Self::ToolFailed {
            tool: tool.into(),
            status: status.to_string(),
            stderr: String::from_utf8_lossy(stderr).trim().to_string(),
        }
    }

    /// Whether this error means a required external tool is absent
    pub fn is_tool_missing(&self) -> bool {
        matches!(self, Self::ToolMissing(_))
    }
}

// Allow converting from String to ProvisionError
impl From<String> for ProvisionError {
    fn from(s: String) -> Self {
        Self::Generic(s)
    }
}

// Allow converting from &str to ProvisionError
impl From<&str> for ProvisionError {
    fn from(s: &str) -> Self {
        Self::Generic(s.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tool_missing_display() {
        let err = ProvisionError::ToolMissing("nvidia-smi".to_string());
        assert_eq!(err.to_string(), "Missing required tool: nvidia-smi");
        assert!(err.is_tool_missing());
    }

    #[test]
    fn test_helpers_build_expected_variants() {
        assert!(matches!(
            ProvisionError::invalid_config("bus.window_size", "not a power of two"),
            ProvisionError::InvalidConfig { .. }
        ));
        assert!(!ProvisionError::generic("x").is_tool_missing());
        let from_str: ProvisionError = "boom".into();
        assert_eq!(from_str.to_string(), "boom");
    }
}
