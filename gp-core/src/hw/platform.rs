//! Machine-level platform actions and tool lookup

use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use tracing::{info, warn};

use super::{Platform, ToolLocator};
use gp_error::{ProvisionError, Result};

/// EFI variable holding the Secure Boot flag (GUID of the global namespace)
const SECURE_BOOT_EFIVAR: &str =
    "/sys/firmware/efi/efivars/SecureBoot-8be4df61-93ca-11d2-aa0d-00e098032b8c";

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemPlatform;

impl Platform for SystemPlatform {
    fn trigger_reboot(&self) -> Result<()> {
        // SAFETY: sync(2) takes no arguments and cannot fail
        unsafe { libc::sync() };

        info!("Requesting system reboot");
        Command::new("systemctl")
            .arg("reboot")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => ProvisionError::ToolMissing("systemctl".to_string()),
                _ => ProvisionError::generic(format!("Failed to request reboot: {}", e)),
            })?;
        Ok(())
    }

    fn hostname(&self) -> String {
        fs::read_to_string("/proc/sys/kernel/hostname")
            .map(|s| s.trim().to_string())
            .unwrap_or_else(|_| "unknown".to_string())
    }

    fn secure_boot_state(&self) -> Option<String> {
        match fs::read(SECURE_BOOT_EFIVAR) {
            Ok(bytes) => Some(secure_boot_from_efivar(&bytes).to_string()),
            Err(_) if !Path::new("/sys/firmware/efi").exists() => Some("legacy boot (no EFI)".to_string()),
            Err(e) => {
                warn!("Cannot read Secure Boot state: {}", e);
                None
            }
        }
    }
}

/// efivarfs prefixes the value with 4 attribute bytes
pub fn secure_boot_from_efivar(bytes: &[u8]) -> &'static str {
    match bytes.get(4) {
        Some(1) => "enabled",
        Some(0) => "disabled",
        _ => "unknown",
    }
}

/// Resolves tools against `PATH`
#[derive(Debug, Clone)]
pub struct PathLocator {
    dirs: Vec<PathBuf>,
}

impl PathLocator {
    pub fn from_env() -> Self {
        let dirs = std::env::var_os("PATH")
            .map(|p| std::env::split_paths(&p).collect())
            .unwrap_or_default();
        Self { dirs }
    }

    pub fn with_dirs(dirs: Vec<PathBuf>) -> Self {
        Self { dirs }
    }
}

impl ToolLocator for PathLocator {
    fn locate(&self, tool: &str) -> Option<PathBuf> {
        use std::os::unix::fs::PermissionsExt;

        self.dirs
            .iter()
            .map(|dir| dir.join(tool))
            .find(|candidate| {
                fs::metadata(candidate)
                    .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
                    .unwrap_or(false)
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;

    #[test]
    fn test_secure_boot_efivar_decoding() {
        assert_eq!(secure_boot_from_efivar(&[6, 0, 0, 0, 1]), "enabled");
        assert_eq!(secure_boot_from_efivar(&[6, 0, 0, 0, 0]), "disabled");
        assert_eq!(secure_boot_from_efivar(&[6]), "unknown");
    }

    #[test]
    fn test_path_locator_requires_executable() {
        let dir = tempfile::tempdir().unwrap();
        let tool = dir.path().join("nvidia-smi");
        fs::write(&tool, "#!/bin/sh\n").unwrap();
        let locator = PathLocator::with_dirs(vec![dir.path().to_path_buf()]);
        assert!(locator.locate("nvidia-smi").is_none());

        fs::set_permissions(&tool, fs::Permissions::from_mode(0o755)).unwrap();
        assert_eq!(locator.locate("nvidia-smi"), Some(tool));
        assert!(locator.locate("dcgmi").is_none());
    }
}
