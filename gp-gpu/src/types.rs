//! GPU data types

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// PCI bus address in the sysfs form `dddd:bb:dd.f`
///
/// `nvidia-smi` reports an 8-digit domain (`00000000:17:00.0`) while sysfs
/// uses 4 digits, so every address is normalized on the way in.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BusAddress(String);

impl BusAddress {
    /// Parse and normalize a bus address, returns None if malformed
    pub fn parse(raw: &str) -> Option<Self> {
        let raw = raw.trim();
        let parts: Vec<&str> = raw.split(':').collect();
        let (domain, bus, devfn) = match parts.as_slice() {
            [domain, bus, devfn] => (u32::from_str_radix(domain, 16).ok()?, *bus, *devfn),
            [bus, devfn] => (0, *bus, *devfn),
            _ => return None,
        };
        if domain > 0xffff {
            return None;
        }
        let bus = u8::from_str_radix(bus, 16).ok()?;
        let (dev, func) = devfn.split_once('.')?;
        let dev = u8::from_str_radix(dev, 16).ok()?;
        let func = u8::from_str_radix(func, 16).ok()?;
        if dev > 0x1f || func > 7 {
            return None;
        }
        Some(Self(format!("{:04x}:{:02x}:{:02x}.{:x}", domain, bus, dev, func)))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BusAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Policy-governed device capability
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Capability {
    /// Multi-Instance GPU partitioning mode
    Mig,
    /// ECC memory error correction mode
    Ecc,
}

impl Capability {
    pub const ALL: [Capability; 2] = [Capability::Mig, Capability::Ecc];

    pub fn as_str(&self) -> &'static str {
        match self {
            Capability::Mig => "mig",
            Capability::Ecc => "ecc",
        }
    }

    /// Whether sub-instances must be torn down before the mode can change
    pub fn has_dependents(&self) -> bool {
        matches!(self, Capability::Mig)
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Capability {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "mig" | "mig_mode" | "mig.mode" => Ok(Capability::Mig),
            "ecc" | "ecc_mode" | "ecc.mode" => Ok(Capability::Ecc),
            other => Err(format!("unknown capability '{}'", other)),
        }
    }
}

/// Value of a mode-flag capability
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Toggle {
    Enabled,
    Disabled,
}

impl Toggle {
    /// Flag as passed on the nvidia-smi command line
    pub fn as_flag(&self) -> &'static str {
        match self {
            Toggle::Enabled => "1",
            Toggle::Disabled => "0",
        }
    }
}

impl fmt::Display for Toggle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Toggle::Enabled => f.write_str("enabled"),
            Toggle::Disabled => f.write_str("disabled"),
        }
    }
}

impl FromStr for Toggle {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "enabled" | "enable" | "on" | "1" | "true" => Ok(Toggle::Enabled),
            "disabled" | "disable" | "off" | "0" | "false" => Ok(Toggle::Disabled),
            other => Err(format!("unknown mode value '{}'", other)),
        }
    }
}

/// What the device reported for one capability
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilityReading {
    /// False when the tool reports N/A or Not Supported
    pub supported: bool,
    /// Active value, None when unreadable
    pub current: Option<Toggle>,
    /// Value that takes effect on next activation, if reported
    pub pending: Option<Toggle>,
    /// Set by the apply engine when this run changed the capability
    #[serde(default)]
    pub changed: bool,
}

impl CapabilityReading {
    pub fn unsupported() -> Self {
        Self {
            supported: false,
            current: None,
            pending: None,
            changed: false,
        }
    }

    pub fn unknown() -> Self {
        Self {
            supported: true,
            current: None,
            pending: None,
            changed: false,
        }
    }

    pub fn known(current: Toggle, pending: Option<Toggle>) -> Self {
        Self {
            supported: true,
            current: Some(current),
            pending,
            changed: false,
        }
    }

    /// The value the device will run with once pending changes activate
    pub fn effective(&self) -> Option<Toggle> {
        self.pending.or(self.current)
    }

    /// A pending value differs from the active one
    pub fn activation_pending(&self) -> bool {
        matches!((self.current, self.pending), (Some(c), Some(p)) if c != p)
    }
}

/// Stable identity of a GPU, re-derived every run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GpuIdentity {
    /// nvidia-smi index (0, 1, 2, etc.)
    pub index: u32,
    /// PCI bus address, used as the device id
    pub bus: BusAddress,
    /// Board serial number
    pub serial: Option<String>,
    /// GPU UUID
    pub uuid: Option<String>,
    /// Product name
    pub name: String,
}

/// A GPU with its policy-governed capabilities
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GpuDevice {
    pub identity: GpuIdentity,
    pub capabilities: BTreeMap<Capability, CapabilityReading>,
}

impl GpuDevice {
    pub fn id(&self) -> &BusAddress {
        &self.identity.bus
    }

    /// Reading for a capability; missing fields count as unsupported
    pub fn capability(&self, capability: Capability) -> CapabilityReading {
        self.capabilities
            .get(&capability)
            .copied()
            .unwrap_or_else(CapabilityReading::unsupported)
    }
}
