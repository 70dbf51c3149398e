//! Target capability policy
//!
//! Maps each governed capability to the value every device should run with.
//! Capabilities absent from the policy are left alone.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use gp_error::{ProvisionError, Result};
use gp_gpu::{Capability, Toggle};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TargetPolicy {
    targets: BTreeMap<Capability, Toggle>,
}

impl TargetPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, capability: Capability, value: Toggle) -> Self {
        self.targets.insert(capability, value);
        self
    }

    pub fn set(&mut self, capability: Capability, value: Toggle) {
        self.targets.insert(capability, value);
    }

    pub fn target(&self, capability: Capability) -> Option<Toggle> {
        self.targets.get(&capability).copied()
    }

    /// Governed capabilities in a fixed order
    pub fn iter(&self) -> impl Iterator<Item = (Capability, Toggle)> + '_ {
        self.targets.iter().map(|(c, t)| (*c, *t))
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }

    /// Apply a `capability=value` override from the command line
    pub fn apply_override(&mut self, spec: &str) -> Result<()> {
        let (capability, value) = spec.split_once('=').ok_or_else(|| {
            ProvisionError::invalid_config("policy", format!("expected capability=value, got '{}'", spec))
        })?;
        let capability: Capability = capability
            .parse()
            .map_err(|e: String| ProvisionError::invalid_config("policy", e))?;
        let value: Toggle = value
            .parse()
            .map_err(|e: String| ProvisionError::invalid_config("policy", e))?;
        self.set(capability, value);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_policy_override_parsing() {
        let mut policy = TargetPolicy::new();
        policy.apply_override("mig=disabled").unwrap();
        policy.apply_override("ECC=on").unwrap();
        assert_eq!(policy.target(Capability::Mig), Some(Toggle::Disabled));
        assert_eq!(policy.target(Capability::Ecc), Some(Toggle::Enabled));
        assert!(policy.apply_override("mig").is_err());
        assert!(policy.apply_override("nvlink=on").is_err());
    }

    #[test]
    fn test_policy_json_shape() {
        let policy: TargetPolicy = serde_json::from_str(r#"{"ecc": "enabled", "mig": "disabled"}"#).unwrap();
        let order: Vec<Capability> = policy.iter().map(|(c, _)| c).collect();
        assert_eq!(order, vec![Capability::Mig, Capability::Ecc]);
    }
}
