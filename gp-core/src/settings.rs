//! Provisioning settings
//!
//! Loaded from JSON. Every field is defaulted so an empty file, or no file at
//! all, yields a working configuration. Resolution order:
//! explicit path > `GPUPROV_CONFIG` > `/etc/gpuprov/config.json` >
//! user config dir > defaults.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::{debug, info};

use crate::constants::{activation, bus, env, module, paths, report};
use crate::data::{
    read_json, validate_attempts, validate_ceiling, validate_file_size, validate_module_name,
    validate_window_size, Capability, TargetPolicy, Toggle,
};
use gp_error::{ProvisionError, Result};

/// How pending changes get activated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActivationStrategy {
    /// Reset in place, reboot if the reset command fails
    #[default]
    Auto,
    /// Reset only; failures are warnings
    Reset,
    /// Always schedule a reboot
    Reboot,
}

impl fmt::Display for ActivationStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ActivationStrategy::Auto => f.write_str("auto"),
            ActivationStrategy::Reset => f.write_str("reset"),
            ActivationStrategy::Reboot => f.write_str("reboot"),
        }
    }
}

impl FromStr for ActivationStrategy {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "auto" => Ok(ActivationStrategy::Auto),
            "reset" => Ok(ActivationStrategy::Reset),
            "reboot" => Ok(ActivationStrategy::Reboot),
            other => Err(format!("unknown activation strategy '{}'", other)),
        }
    }
}

/// Top-level settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProvisionSettings {
    /// Target value per governed capability
    #[serde(default = "default_policy")]
    pub policy: TargetPolicy,

    #[serde(default)]
    pub activation: ActivationSettings,

    #[serde(default)]
    pub bus: BusSettings,

    #[serde(default)]
    pub module: ModuleSettings,

    #[serde(default)]
    pub diagnostics: DiagnosticsSettings,

    #[serde(default)]
    pub report: ReportSettings,

    /// Base directory of per-process work areas
    #[serde(default = "default_work_base")]
    pub work_base: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivationSettings {
    #[serde(default)]
    pub strategy: ActivationStrategy,

    /// Availability probes after a reset
    #[serde(default = "default_poll_attempts")]
    pub poll_attempts: u32,

    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BusSettings {
    /// Register window size per device, also its alignment
    #[serde(default = "default_window_size")]
    pub window_size: u64,

    /// Top of the allocatable address space
    #[serde(default = "default_ceiling")]
    pub ceiling: u64,

    /// PCI vendor id of target devices, as found in sysfs (`0x10de`)
    #[serde(default = "default_vendor_id")]
    pub vendor_id: String,

    #[serde(default = "default_rescan_settle_ms")]
    pub rescan_settle_ms: u64,

    #[serde(default = "default_sysfs_root")]
    pub sysfs_root: PathBuf,

    #[serde(default = "default_iomem_path")]
    pub iomem_path: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleSettings {
    #[serde(default = "default_module_name")]
    pub name: String,

    #[serde(default = "default_load_attempts")]
    pub attempts: u32,

    /// Linear backoff step between load attempts
    #[serde(default = "default_backoff_step_ms")]
    pub backoff_step_ms: u64,

    #[serde(default = "default_firmware_dir")]
    pub firmware_dir: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiagnosticsSettings {
    /// Run diagnostics after activation
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// `dcgmi diag -r` level
    #[serde(default = "default_diag_level")]
    pub level: u8,

    /// Expected device count; defaults to the number of enumerated devices
    #[serde(default)]
    pub expected_devices: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportSettings {
    /// Case-insensitive fragments of issue messages that are known false positives
    #[serde(default = "default_suppressed_patterns")]
    pub suppressed_patterns: Vec<String>,

    /// Directory raw tool output is written to when preserved
    #[serde(default)]
    pub artifact_dir: Option<PathBuf>,
}

fn default_policy() -> TargetPolicy {
    TargetPolicy::new()
        .with(Capability::Mig, Toggle::Disabled)
        .with(Capability::Ecc, Toggle::Enabled)
}
fn default_work_base() -> PathBuf { PathBuf::from(paths::WORK_BASE) }
fn default_poll_attempts() -> u32 { activation::DEFAULT_POLL_ATTEMPTS }
fn default_poll_interval_ms() -> u64 { activation::DEFAULT_POLL_INTERVAL_MS }
fn default_window_size() -> u64 { bus::DEFAULT_WINDOW_SIZE }
fn default_ceiling() -> u64 { bus::ADDRESS_CEILING }
fn default_vendor_id() -> String { gp_gpu::gpu_const::NVIDIA_VENDOR_ID.to_string() }
fn default_rescan_settle_ms() -> u64 { bus::DEFAULT_RESCAN_SETTLE_MS }
fn default_sysfs_root() -> PathBuf { PathBuf::from(paths::SYSFS_ROOT) }
fn default_iomem_path() -> PathBuf { PathBuf::from(paths::IOMEM) }
fn default_module_name() -> String { module::DEFAULT_MODULE.to_string() }
fn default_load_attempts() -> u32 { module::DEFAULT_LOAD_ATTEMPTS }
fn default_backoff_step_ms() -> u64 { module::DEFAULT_BACKOFF_STEP_MS }
fn default_firmware_dir() -> PathBuf { PathBuf::from(paths::FIRMWARE_DIR) }
fn default_true() -> bool { true }
fn default_diag_level() -> u8 { gp_gpu::gpu_const::DEFAULT_DIAG_LEVEL }
fn default_suppressed_patterns() -> Vec<String> {
    report::DEFAULT_SUPPRESSED_PATTERNS.iter().map(|s| s.to_string()).collect()
}

impl Default for ProvisionSettings {
    fn default() -> Self {
        Self {
            policy: default_policy(),
            activation: ActivationSettings::default(),
            bus: BusSettings::default(),
            module: ModuleSettings::default(),
            diagnostics: DiagnosticsSettings::default(),
            report: ReportSettings::default(),
            work_base: default_work_base(),
        }
    }
}

impl Default for ActivationSettings {
    fn default() -> Self {
        Self {
            strategy: ActivationStrategy::default(),
            poll_attempts: default_poll_attempts(),
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

impl Default for BusSettings {
    fn default() -> Self {
        Self {
            window_size: default_window_size(),
            ceiling: default_ceiling(),
            vendor_id: default_vendor_id(),
            rescan_settle_ms: default_rescan_settle_ms(),
            sysfs_root: default_sysfs_root(),
            iomem_path: default_iomem_path(),
        }
    }
}

impl Default for ModuleSettings {
    fn default() -> Self {
        Self {
            name: default_module_name(),
            attempts: default_load_attempts(),
            backoff_step_ms: default_backoff_step_ms(),
            firmware_dir: default_firmware_dir(),
        }
    }
}

impl Default for DiagnosticsSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            level: default_diag_level(),
            expected_devices: None,
        }
    }
}

impl Default for ReportSettings {
    fn default() -> Self {
        Self {
            suppressed_patterns: default_suppressed_patterns(),
            artifact_dir: None,
        }
    }
}

impl ProvisionSettings {
    /// Reject values the engine cannot work with
    pub fn validate(&self) -> Result<()> {
        validate_window_size(self.bus.window_size)?;
        validate_ceiling(self.bus.ceiling, self.bus.window_size)?;
        validate_attempts("activation.poll_attempts", self.activation.poll_attempts)?;
        validate_attempts("module.attempts", self.module.attempts)?;
        validate_module_name(&self.module.name)?;
        if self.policy.is_empty() {
            return Err(ProvisionError::invalid_config("policy", "no capability is governed"));
        }
        Ok(())
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(ProvisionError::FileNotFound(path.to_path_buf()));
        }
        validate_file_size(path)?;
        let settings: Self = read_json(path).map_err(|e| {
            ProvisionError::config(format!("Failed to parse {}: {}", path.display(), e))
        })?;
        settings.validate()?;
        Ok(settings)
    }
}

/// Candidate config locations in resolution order
pub fn config_candidates(explicit: Option<&Path>) -> Vec<PathBuf> {
    if let Some(path) = explicit {
        return vec![path.to_path_buf()];
    }
    if let Ok(path) = std::env::var(env::CONFIG) {
        if !path.is_empty() {
            return vec![PathBuf::from(path)];
        }
    }
    let mut candidates = vec![Path::new(paths::CONFIG_DIR).join(paths::CONFIG_FILE)];
    if let Some(dir) = paths::user_config_dir() {
        candidates.push(dir.join(paths::CONFIG_FILE));
    }
    candidates
}

/// Load settings from the first existing candidate, else defaults
///
/// An explicitly named file (flag or env) must exist.
pub fn load_settings(explicit: Option<&Path>) -> Result<ProvisionSettings> {
    let named = explicit.is_some()
        || std::env::var(env::CONFIG).map(|v| !v.is_empty()).unwrap_or(false);

    for path in config_candidates(explicit) {
        if path.exists() {
            let settings = ProvisionSettings::from_file(&path)?;
            info!(path = %path.display(), "Loaded settings");
            return Ok(settings);
        }
        if named {
            return Err(ProvisionError::FileNotFound(path));
        }
        debug!("No config at {:?}", path);
    }

    debug!("Using default settings");
    Ok(ProvisionSettings::default())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_empty_document_yields_defaults() {
        let settings: ProvisionSettings = serde_json::from_str("{}").unwrap();
        assert_eq!(settings, ProvisionSettings::default());
        assert_eq!(settings.bus.vendor_id, "0x10de");
        assert_eq!(settings.policy.target(Capability::Mig), Some(Toggle::Disabled));
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_partial_document_keeps_other_defaults() {
        let json = r#"{
            "policy": {"ecc": "disabled"},
            "activation": {"strategy": "reboot"},
            "bus": {"window_size": 33554432}
        }"#;
        let settings: ProvisionSettings = serde_json::from_str(json).unwrap();
        assert_eq!(settings.activation.strategy, ActivationStrategy::Reboot);
        assert_eq!(settings.activation.poll_attempts, 5);
        assert_eq!(settings.bus.window_size, 32 * 1024 * 1024);
        assert_eq!(settings.bus.ceiling, 1 << 32);
        assert_eq!(settings.policy.target(Capability::Mig), None);
    }

    #[test]
    fn test_validation_rejects_bad_window() {
        let mut settings = ProvisionSettings::default();
        settings.bus.window_size = 3 * 1024 * 1024;
        assert!(settings.validate().is_err());

        let mut settings = ProvisionSettings::default();
        settings.module.attempts = 0;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_explicit_path_must_exist() {
        let missing = Path::new("/nonexistent/gpuprov/config.json");
        assert!(matches!(
            load_settings(Some(missing)),
            Err(ProvisionError::FileNotFound(_))
        ));
    }

    #[test]
    fn test_load_from_explicit_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"module": {{"name": "nvidia", "attempts": 5}}}}"#).unwrap();
        let settings = load_settings(Some(file.path())).unwrap();
        assert_eq!(settings.module.attempts, 5);
    }

    #[test]
    fn test_strategy_parsing() {
        assert_eq!("REBOOT".parse::<ActivationStrategy>().unwrap(), ActivationStrategy::Reboot);
        assert!("later".parse::<ActivationStrategy>().is_err());
    }
}
