//! Data types, policy, persistence and validation modules
//!
//! Contains the records the engine works on and the per-run working area.

mod persistence;
mod policy;
mod types;
mod validation;

pub use policy::TargetPolicy;
pub use types::CapabilityChange;

// Re-export device types from gp-gpu crate
pub use gp_gpu::{BusAddress, Capability, CapabilityReading, GpuDevice, GpuIdentity, Toggle};
pub use persistence::{read_json, remove_work_dir, write_json_atomic, WorkArea};
pub use validation::{
    validate_attempts, validate_ceiling, validate_file_size, validate_module_name,
    validate_window_size,
};
