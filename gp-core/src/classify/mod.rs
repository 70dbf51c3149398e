//! Diagnostic result classifier
//!
//! Turns one diagnostic document, in whatever shape the installed DCGM
//! version produces, into per-test per-GPU statuses and an exact verdict.
//!
//! # Verdict
//!
//! - FAIL iff at least one result classifies as fail
//! - otherwise WARN if any result warns or the number of GPUs seen differs
//!   from the expected count
//! - otherwise PASS
//!
//! Output that cannot be parsed is only critical when the tool itself also
//! exited non-zero.

mod extract;
mod metrics;
mod status;
mod strategies;
mod targets;

pub use extract::extract_json;
pub use metrics::{extract_into, TargetMetrics};
pub use status::TestStatus;
pub use strategies::{info_text, run_strategies, RawEntry, RawTest, Strategy, STRATEGIES};
pub use targets::{explicit_id, infer_target_count, map_entries, remap_skipped};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info, warn};

use crate::hw::RawDiagnostic;
use crate::report::{Issue, IssueCategory, PreservedOutput, Severity, Stage, Verdict};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<u32>,
    pub status: TestStatus,
    pub raw_status: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub info: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiagnosticResult {
    pub test_name: String,
    pub per_target_status: Vec<TargetStatus>,
    pub severity: Severity,
}

impl DiagnosticResult {
    pub fn has(&self, status: TestStatus) -> bool {
        self.per_target_status.iter().any(|t| t.status == status)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Classification {
    /// Name of the strategy that recognized the document
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub strategy: Option<String>,
    pub verdict: Verdict,
    pub results: Vec<DiagnosticResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_targets: Option<usize>,
    pub targets_seen: usize,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metrics: BTreeMap<u32, TargetMetrics>,
}

impl Classification {
    fn unrecognized(verdict: Verdict, expected_targets: Option<usize>) -> Self {
        Self {
            strategy: None,
            verdict,
            results: Vec::new(),
            expected_targets,
            targets_seen: 0,
            metrics: BTreeMap::new(),
        }
    }

    pub fn count_mismatch(&self) -> bool {
        self.expected_targets.is_some_and(|n| n != self.targets_seen)
    }
}

/// Classification plus the issues and preserved output it produced
#[derive(Debug, Clone, PartialEq)]
pub struct ClassifyOutcome {
    pub classification: Classification,
    pub issues: Vec<Issue>,
    pub preserved: Option<PreservedOutput>,
}

fn severity_of(statuses: &[TargetStatus]) -> Severity {
    if statuses.iter().any(|t| t.status == TestStatus::Fail) {
        Severity::Critical
    } else if statuses.iter().any(|t| t.status == TestStatus::Warn) {
        Severity::Warning
    } else {
        Severity::Info
    }
}

/// Classify a parsed document; None when no strategy recognizes it
pub fn classify_document(doc: &Value, expected_targets: Option<usize>) -> Option<Classification> {
    let (strategy, tests) = run_strategies(doc)?;
    debug!(strategy, tests = tests.len(), "Diagnostic document recognized");

    let n = expected_targets.unwrap_or_else(|| infer_target_count(&tests));
    let skipped = remap_skipped(&tests, n);
    let mut seen = BTreeSet::new();
    // explicit ids past the expected count, still observed GPUs
    let mut beyond = BTreeSet::new();
    let mut metrics: BTreeMap<u32, TargetMetrics> = BTreeMap::new();
    let mut results = Vec::with_capacity(tests.len());

    for test in &tests {
        let ids = if n > 0 {
            map_entries(&test.entries, n, &skipped).into_iter().map(Some).collect()
        } else {
            vec![None; test.entries.len()]
        };
        let per_target_status: Vec<TargetStatus> = test
            .entries
            .iter()
            .zip(ids)
            .map(|(entry, id)| {
                if let Some(extra) = explicit_id(entry).filter(|id| *id >= n) {
                    beyond.insert(extra);
                }
                let target = id.map(|i| i as u32);
                if let Some(t) = target {
                    seen.insert(t);
                    let m = metrics.entry(t).or_default();
                    extract_into(m, &test.name, &entry.info);
                }
                TargetStatus {
                    target,
                    status: TestStatus::classify(&entry.status),
                    raw_status: entry.status.clone(),
                    info: entry.info.clone(),
                }
            })
            .collect();
        results.push(DiagnosticResult {
            test_name: test.name.clone(),
            severity: severity_of(&per_target_status),
            per_target_status,
        });
    }
    metrics.retain(|_, m| !m.is_empty());

    let mut classification = Classification {
        strategy: Some(strategy.to_string()),
        verdict: Verdict::Pass,
        results,
        expected_targets,
        targets_seen: seen.len() + beyond.len(),
        metrics,
    };
    classification.verdict = if classification.results.iter().any(|r| r.has(TestStatus::Fail)) {
        Verdict::Fail
    } else if classification.results.iter().any(|r| r.has(TestStatus::Warn)) || classification.count_mismatch() {
        Verdict::Warn
    } else {
        Verdict::Pass
    };
    Some(classification)
}

fn target_label(target: Option<u32>) -> String {
    target.map(|t| format!("GPU {}", t)).unwrap_or_else(|| "unknown GPU".to_string())
}

/// Issues for failing and warning results and a count mismatch
pub fn classification_issues(classification: &Classification) -> Vec<Issue> {
    let mut issues = Vec::new();
    for result in &classification.results {
        for target in &result.per_target_status {
            let (severity, verb) = match target.status {
                TestStatus::Fail => (Severity::Critical, "failed"),
                TestStatus::Warn => (Severity::Warning, "warned"),
                _ => continue,
            };
            let mut message = format!("Diagnostic '{}' {} on {}", result.test_name, verb, target_label(target.target));
            if !target.info.is_empty() {
                message.push_str(": ");
                message.push_str(&target.info);
            }
            let mut issue = Issue::new(severity, IssueCategory::Diagnostics, Stage::Diagnostics, message);
            if let Some(t) = target.target {
                issue = issue.on_device(format!("GPU {}", t));
            }
            issues.push(issue);
        }
    }
    if let (true, Some(expected)) = (classification.count_mismatch(), classification.expected_targets) {
        let seen = classification.targets_seen;
        let message = if seen > expected {
            format!("Diagnostics reported {} GPUs, {} expected", seen, expected)
        } else {
            format!("Diagnostics covered {} of {} expected GPUs", seen, expected)
        };
        issues.push(Issue::warning(IssueCategory::Diagnostics, Stage::Diagnostics, message));
    }
    issues
}

/// Classify raw tool output end to end
pub fn classify_output(raw: &RawDiagnostic, expected_targets: Option<usize>) -> ClassifyOutcome {
    let classification = extract_json(&raw.text).and_then(|doc| classify_document(&doc, expected_targets));

    match classification {
        Some(classification) => {
            info!(
                verdict = %classification.verdict,
                strategy = classification.strategy.as_deref().unwrap_or("none"),
                "Diagnostics classified"
            );
            let mut issues = classification_issues(&classification);
            if !raw.exit_ok && classification.verdict != Verdict::Fail {
                issues.push(Issue::warning(
                    IssueCategory::ToolOutput,
                    Stage::Diagnostics,
                    format!("{} exited non-zero but reported no failing test", raw.source),
                ));
            }
            ClassifyOutcome {
                classification,
                issues,
                preserved: None,
            }
        }
        None => {
            let (verdict, issue) = if raw.exit_ok {
                warn!("Diagnostic output from {} has no recognized shape", raw.source);
                (
                    Verdict::Warn,
                    Issue::warning(
                        IssueCategory::ToolOutput,
                        Stage::Diagnostics,
                        format!("Unrecognized diagnostic output from {}; raw output preserved", raw.source),
                    ),
                )
            } else {
                warn!("{} failed and its output could not be parsed", raw.source);
                (
                    Verdict::Fail,
                    Issue::critical(
                        IssueCategory::ToolOutput,
                        Stage::Diagnostics,
                        format!("{} failed and produced unparseable output", raw.source),
                    ),
                )
            };
            ClassifyOutcome {
                classification: Classification::unrecognized(verdict, expected_targets),
                issues: vec![issue],
                preserved: Some(PreservedOutput::capture(&raw.source, &raw.text)),
            }
        }
    }
}
