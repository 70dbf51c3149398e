//! GPU-related constants

/// PCI vendor ID for NVIDIA GPUs
pub const NVIDIA_VENDOR_ID: &str = "0x10de";

/// Query and control tool shipped with the NVIDIA driver
pub const NVIDIA_SMI: &str = "nvidia-smi";

/// DCGM command line client
pub const DCGMI: &str = "dcgmi";

/// Fields queried on current drivers, in column order
pub const QUERY_FIELDS: &str = "index,pci.bus_id,serial,uuid,name,mig.mode.current,mig.mode.pending,ecc.mode.current,ecc.mode.pending";

/// Fields for drivers that predate MIG; MIG columns are then reported unsupported
pub const LEGACY_QUERY_FIELDS: &str = "index,pci.bus_id,serial,uuid,name,ecc.mode.current,ecc.mode.pending";

/// nvidia-smi stderr fragment when a query field is unknown to the driver
pub const INVALID_FIELD_MARKER: &str = "is not a valid field";

/// Values nvidia-smi prints when a field does not apply to the device
pub const NOT_AVAILABLE: &[&str] = &["", "N/A", "[N/A]", "Not Supported", "[Not Supported]"];

/// Fragments nvidia-smi prints when there is nothing to destroy
pub const NOTHING_TO_DESTROY: &[&str] = &["no gpu instances found", "no compute instances found", "not found"];

/// Default DCGM diagnostic run level (2 = medium)
pub const DEFAULT_DIAG_LEVEL: u8 = 2;
