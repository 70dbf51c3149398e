//! Core data types for gpuprov
//!
//! Device identity and capability readings come from gp-gpu; this module adds
//! the records the engine creates while reconciling them.

use serde::{Deserialize, Serialize};

use gp_gpu::{BusAddress, Capability, Toggle};

/// One capability set by the apply engine during this run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilityChange {
    pub device_id: BusAddress,
    pub capability: Capability,
    /// Effective value before the change, None if it was unreadable
    pub previous_value: Option<Toggle>,
    /// Value that was applied
    pub applied: Toggle,
    /// The change only takes effect after a reset or reboot
    pub activation_required: bool,
    /// Post-activation query confirmed the applied value
    #[serde(default)]
    pub verified: bool,
}

impl CapabilityChange {
    pub fn new(
        device_id: BusAddress,
        capability: Capability,
        previous_value: Option<Toggle>,
        applied: Toggle,
    ) -> Self {
        Self {
            device_id,
            capability,
            previous_value,
            applied,
            activation_required: true,
            verified: false,
        }
    }

    /// Human readable `device capability: old -> new`
    pub fn describe(&self) -> String {
        let previous = self
            .previous_value
            .map(|v| v.to_string())
            .unwrap_or_else(|| "unknown".to_string());
        format!(
            "{} {}: {} -> {}",
            self.device_id, self.capability, previous, self.applied
        )
    }
}
