//! Validation for settings values and config files
//!
//! Rejects values the allocator and retry loops cannot work with before any
//! device is touched.

use std::path::Path;

use gp_error::{ProvisionError, Result};

/// Largest config file accepted
const MAX_CONFIG_SIZE: u64 = 1024 * 1024;

/// Window sizes must be a non-zero power of two so alignment equals size
pub fn validate_window_size(size: u64) -> Result<u64> {
    if size == 0 || !size.is_power_of_two() {
        return Err(ProvisionError::invalid_config(
            "bus.window_size",
            format!("{:#x} is not a power of two", size),
        ));
    }
    Ok(size)
}

/// The ceiling must leave room for at least one window
pub fn validate_ceiling(ceiling: u64, window_size: u64) -> Result<u64> {
    if ceiling <= window_size {
        return Err(ProvisionError::invalid_config(
            "bus.ceiling",
            format!("{:#x} must be above the window size {:#x}", ceiling, window_size),
        ));
    }
    Ok(ceiling)
}

/// Retry budgets of zero would never run the operation
pub fn validate_attempts(field: &str, attempts: u32) -> Result<u32> {
    if attempts == 0 {
        return Err(ProvisionError::invalid_config(field, "must be at least 1"));
    }
    Ok(attempts)
}

/// Kernel module names are passed to modprobe as a single argument
pub fn validate_module_name(name: &str) -> Result<&str> {
    let valid = !name.is_empty()
        && name.len() <= 64
        && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    if !valid {
        return Err(ProvisionError::invalid_config(
            "module.name",
            format!("'{}' is not a valid module name", name),
        ));
    }
    Ok(name)
}

/// Refuse oversized config files
pub fn validate_file_size(path: &Path) -> Result<()> {
    let metadata = std::fs::metadata(path)
        .map_err(|e| ProvisionError::config(format!("cannot read file metadata: {}", e)))?;

    if metadata.len() > MAX_CONFIG_SIZE {
        return Err(ProvisionError::config(format!(
            "config file exceeds maximum size of {} bytes",
            MAX_CONFIG_SIZE
        )));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_window_size() {
        assert!(validate_window_size(16 * 1024 * 1024).is_ok());
        assert!(validate_window_size(0).is_err());
        assert!(validate_window_size(20 * 1024 * 1024).is_err());
    }

    #[test]
    fn test_validate_ceiling() {
        assert!(validate_ceiling(1 << 32, 1 << 24).is_ok());
        assert!(validate_ceiling(1 << 24, 1 << 24).is_err());
    }

    #[test]
    fn test_validate_attempts_and_module() {
        assert!(validate_attempts("module.attempts", 0).is_err());
        assert_eq!(validate_attempts("module.attempts", 3).unwrap(), 3);
        assert!(validate_module_name("nvidia").is_ok());
        assert!(validate_module_name("nvidia_drm").is_ok());
        assert!(validate_module_name("nvidia; reboot").is_err());
        assert!(validate_module_name("").is_err());
    }

    #[test]
    fn test_validate_file_size() {
        let file = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(file.path(), "{}").unwrap();
        assert!(validate_file_size(file.path()).is_ok());
        assert!(validate_file_size(Path::new("/nonexistent/gpuprov.json")).is_err());
    }
}
