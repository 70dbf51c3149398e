//! Per-target status classification

use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TestStatus {
    Pass,
    Fail,
    Warn,
    Skip,
    Unknown,
}

impl TestStatus {
    /// Case-insensitive substring match, checked pass, fail, warn, skip
    pub fn classify(raw: &str) -> TestStatus {
        let lowered = raw.to_lowercase();
        if lowered.contains("pass") {
            TestStatus::Pass
        } else if lowered.contains("fail") {
            TestStatus::Fail
        } else if lowered.contains("warn") {
            TestStatus::Warn
        } else if lowered.contains("skip") {
            TestStatus::Skip
        } else {
            TestStatus::Unknown
        }
    }
}

impl fmt::Display for TestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TestStatus::Pass => "pass",
            TestStatus::Fail => "fail",
            TestStatus::Warn => "warn",
            TestStatus::Skip => "skip",
            TestStatus::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_variants() {
        assert_eq!(TestStatus::classify("Pass"), TestStatus::Pass);
        assert_eq!(TestStatus::classify("PASSED"), TestStatus::Pass);
        assert_eq!(TestStatus::classify("Fail"), TestStatus::Fail);
        assert_eq!(TestStatus::classify("Warning"), TestStatus::Warn);
        assert_eq!(TestStatus::classify("Skipped"), TestStatus::Skip);
        assert_eq!(TestStatus::classify("Not Run"), TestStatus::Unknown);
        assert_eq!(TestStatus::classify(""), TestStatus::Unknown);
    }

    #[test]
    fn test_pass_checked_first() {
        // pass wins over any later keyword in the same string
        assert_eq!(TestStatus::classify("pass (after fail)"), TestStatus::Pass);
    }
}
