//! Constants and configuration defaults for gpuprov
//!
//! Centralizes magic numbers, paths and timing defaults. Settings fall back
//! to these values when a field is absent from the config file.

use std::time::Duration;

/// System paths
pub mod paths {
    /// System configuration directory
    pub const CONFIG_DIR: &str = "/etc/gpuprov";

    /// Configuration file name
    pub const CONFIG_FILE: &str = "config.json";

    /// Base of per-process working areas (tmpfs, gone after reboot)
    pub const WORK_BASE: &str = "/run/gpuprov";

    /// Activation state file inside a working area
    pub const STATE_FILE: &str = "activation.json";

    /// Kernel view of claimed physical address ranges
    pub const IOMEM: &str = "/proc/iomem";

    /// sysfs root
    pub const SYSFS_ROOT: &str = "/sys";

    /// Firmware search root for GSP blobs
    pub const FIRMWARE_DIR: &str = "/lib/firmware/nvidia";

    /// systemd journal socket, logging goes to journald when present
    pub const JOURNALD_SOCKET: &str = "/run/systemd/journal/socket";

    /// User configuration directory fallback
    pub fn user_config_dir() -> Option<std::path::PathBuf> {
        dirs::config_dir().map(|p| p.join("gpuprov"))
    }
}

/// Environment variables read by the binary and the settings loader
pub mod env {
    /// Overrides the config file path
    pub const CONFIG: &str = "GPUPROV_CONFIG";

    /// Set by the invoking environment when this run continues after a reboot
    pub const RESUMED: &str = "GPUPROV_RESUMED";

    /// Log filter (trace, debug, info, warn, error)
    pub const LOG: &str = "GPUPROV_LOG";
}

/// Bus resource allocation
pub mod bus {
    /// Everything below this is the 32-bit MMIO address space
    pub const ADDRESS_CEILING: u64 = 1 << 32;

    /// BAR0 size of the supported device class (16 MiB)
    pub const DEFAULT_WINDOW_SIZE: u64 = 16 * 1024 * 1024;

    /// Offset of BAR0 in PCI configuration space
    pub const BAR0_OFFSET: u64 = 0x10;

    /// Low bits of a memory BAR that carry flags, not address
    pub const BAR_FLAG_MASK: u32 = 0xf;

    /// PCI class prefixes of display controllers (VGA 0x0300, 3D 0x0302)
    pub const DISPLAY_CLASS_PREFIX: &str = "0x03";

    /// Tool used to write config space of a detached device
    pub const SETPCI: &str = "setpci";

    /// Time the platform needs after a rescan before resources are claimed
    pub const DEFAULT_RESCAN_SETTLE_MS: u64 = 2000;
}

/// Activation timing
pub mod activation {
    /// Availability probes after a reset
    pub const DEFAULT_POLL_ATTEMPTS: u32 = 5;

    /// Fixed interval between availability probes
    pub const DEFAULT_POLL_INTERVAL_MS: u64 = 2000;
}

/// Kernel module loading
pub mod module {
    /// Driver module for the supported device class
    pub const DEFAULT_MODULE: &str = "nvidia";

    /// Load attempts before recovery kicks in
    pub const DEFAULT_LOAD_ATTEMPTS: u32 = 3;

    /// Linear backoff step between load attempts
    pub const DEFAULT_BACKOFF_STEP_MS: u64 = 1000;
}

/// Report and diagnostics
pub mod report {
    /// Issue text fragments known to be false positives
    pub const DEFAULT_SUPPRESSED_PATTERNS: &[&str] = &["pcie link degradation"];

    /// Longest raw output kept inline in a report
    pub const MAX_PRESERVED_BYTES: usize = 256 * 1024;
}

/// Process exit codes
pub mod exit {
    pub const OK: i32 = 0;
    pub const FAIL: i32 = 1;
    pub const USAGE: i32 = 2;
}

/// Convert milliseconds from settings into a Duration
#[inline]
pub fn millis(ms: u64) -> Duration {
    Duration::from_millis(ms)
}
