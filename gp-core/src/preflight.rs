//! Required tool checks run before any device work

use tracing::{debug, error};

use crate::constants::bus::SETPCI;
use crate::hw::ToolLocator;
use crate::report::{Issue, IssueCategory, Stage};
use gp_gpu::gpu_const::{DCGMI, NVIDIA_SMI};

/// What the upcoming run will need
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Requirements {
    /// Diagnostics will be produced by running `dcgmi`
    pub dcgm: bool,
    /// Register windows may be rewritten
    pub bus_repair: bool,
}

pub fn required_tools(req: Requirements) -> Vec<&'static str> {
    let mut tools = vec![NVIDIA_SMI];
    if req.dcgm {
        tools.push(DCGMI);
    }
    if req.bus_repair {
        tools.push(SETPCI);
    }
    tools
}

/// One critical precondition issue per missing tool
pub fn check_tools(locator: &dyn ToolLocator, req: Requirements) -> Vec<Issue> {
    check_named(locator, &required_tools(req))
}

pub fn check_named(locator: &dyn ToolLocator, tools: &[&str]) -> Vec<Issue> {
    tools
        .iter()
        .copied()
        .filter_map(|tool| match locator.locate(tool) {
            Some(path) => {
                debug!(tool, path = %path.display(), "Found tool");
                None
            }
            None => {
                error!(tool, "Required tool not found in PATH");
                Some(Issue::critical(
                    IssueCategory::Precondition,
                    Stage::Preflight,
                    format!("Missing required tool: {}", tool),
                ))
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hw::MockToolLocator;
    use std::path::PathBuf;

    #[test]
    fn test_required_tools_follow_requirements() {
        assert_eq!(required_tools(Requirements::default()), vec!["nvidia-smi"]);
        let all = required_tools(Requirements { dcgm: true, bus_repair: true });
        assert_eq!(all, vec!["nvidia-smi", "dcgmi", "setpci"]);
    }

    #[test]
    fn test_missing_tool_is_critical() {
        let mut locator = MockToolLocator::new();
        locator
            .expect_locate()
            .returning(|tool| (tool != "dcgmi").then(|| PathBuf::from("/usr/bin").join(tool)));
        let issues = check_tools(&locator, Requirements { dcgm: true, bus_repair: false });
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].message, "Missing required tool: dcgmi");
        assert_eq!(issues[0].category, IssueCategory::Precondition);
    }
}
