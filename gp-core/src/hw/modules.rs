//! Kernel module loading through lsmod/modprobe

use tracing::{debug, info};

use super::ModuleControl;
use gp_error::{ProvisionError, Result};

#[derive(Debug, Default, Clone, Copy)]
pub struct Modprobe;

/// Whether `module` appears as a loaded module in lsmod output
pub fn lsmod_lists(stdout: &str, module: &str) -> bool {
    stdout
        .lines()
        .skip(1)
        .filter_map(|line| line.split_whitespace().next())
        .any(|name| name == module)
}

impl ModuleControl for Modprobe {
    fn is_loaded(&self, module: &str) -> bool {
        gp_gpu::capture_tool("lsmod", &[])
            .map(|o| lsmod_lists(&String::from_utf8_lossy(&o.stdout), module))
            .unwrap_or(false)
    }

    fn load(&self, module: &str) -> Result<()> {
        gp_gpu::run_tool("modprobe", &[module]).map_err(|e| load_error(module, e))?;
        info!("Loaded kernel module: {}", module);
        Ok(())
    }
}

fn load_error(module: &str, err: ProvisionError) -> ProvisionError {
    if err.is_tool_missing() {
        return err;
    }
    let reason = match err {
        ProvisionError::ToolFailed { stderr, .. } => stderr,
        other => other.to_string(),
    };
    debug!("modprobe {} failed: {}", module, reason);
    ProvisionError::ModuleLoad {
        module: module.to_string(),
        reason,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_modprobe_failure_becomes_module_load() {
        let failed = ProvisionError::ToolFailed {
            tool: "modprobe".to_string(),
            status: "exit status: 1".to_string(),
            stderr: "modprobe: FATAL: Module nvidia not found".to_string(),
        };
        let err = load_error("nvidia", failed);
        assert_eq!(
            err.to_string(),
            "Kernel module nvidia failed to load: modprobe: FATAL: Module nvidia not found"
        );
        assert!(load_error("nvidia", ProvisionError::ToolMissing("modprobe".to_string())).is_tool_missing());
    }

    #[test]
    fn test_lsmod_matches_whole_names() {
        let out = "Module                  Size  Used by\n\
                   nvidia_uvm           1531904  0\n\
                   nvidia_drm             77824  0\n";
        assert!(!lsmod_lists(out, "nvidia"));
        assert!(lsmod_lists(out, "nvidia_uvm"));
        let loaded = format!("{}nvidia              56627200  2 nvidia_uvm\n", out);
        assert!(lsmod_lists(&loaded, "nvidia"));
    }
}
