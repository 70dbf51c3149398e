//! Mapping result entries to GPU indices
//!
//! Entries do not always carry a `gpu_id`. Resolution runs three passes per
//! test: explicit ids (field or `GPU <n>` in the info text), row-remap skip
//! entries matched to GPUs missing from tests that do report ids, then
//! elimination against `0..n`. Array position is the last resort.

use regex::Regex;
use serde_json::Value;
use std::collections::BTreeSet;
use std::sync::OnceLock;

use super::strategies::{RawEntry, RawTest};

const ROW_REMAP_MARKER: &str = "row remapping";

fn gpu_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"\bGPU\s+(\d+)\b").ok()).as_ref()
}

/// Explicit id of one entry, if any
pub fn explicit_id(entry: &RawEntry) -> Option<usize> {
    let from_field = entry.gpu_id.as_ref().and_then(|v| match v {
        Value::Number(n) => n.as_u64().map(|n| n as usize),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    });
    from_field.or_else(|| {
        gpu_pattern()?
            .captures(&entry.info)
            .and_then(|c| c.get(1))
            .and_then(|m| m.as_str().parse().ok())
    })
}

fn is_remap_skip(entry: &RawEntry) -> bool {
    entry.info.to_lowercase().contains(ROW_REMAP_MARKER)
}

/// GPUs absent from tests that report explicit ids next to a row-remap skip
pub fn remap_skipped(tests: &[RawTest], n: usize) -> BTreeSet<usize> {
    let all: BTreeSet<usize> = (0..n).collect();
    let mut skipped = BTreeSet::new();
    for test in tests {
        let found: BTreeSet<usize> = test
            .entries
            .iter()
            .filter_map(explicit_id)
            .filter(|id| *id < n)
            .collect();
        let has_skip = test.entries.iter().any(is_remap_skip);
        if has_skip && !found.is_empty() {
            skipped.extend(all.difference(&found));
        }
    }
    skipped
}

/// GPU index per entry of one test
pub fn map_entries(entries: &[RawEntry], n: usize, skipped: &BTreeSet<usize>) -> Vec<usize> {
    let mut mapping: Vec<Option<usize>> = entries
        .iter()
        .map(|e| explicit_id(e).filter(|id| *id < n))
        .collect();

    let known: BTreeSet<usize> = mapping.iter().flatten().copied().collect();
    let remap_slots: Vec<usize> = (0..entries.len())
        .filter(|&i| mapping[i].is_none() && is_remap_skip(&entries[i]))
        .collect();
    let unassigned: Vec<usize> = skipped.difference(&known).copied().collect();
    if !remap_slots.is_empty() && remap_slots.len() == unassigned.len() {
        for (slot, id) in remap_slots.into_iter().zip(unassigned) {
            mapping[slot] = Some(id);
        }
    }

    let known: BTreeSet<usize> = mapping.iter().flatten().copied().collect();
    let missing: Vec<usize> = (0..n).filter(|id| !known.contains(id)).collect();
    let unknown: Vec<usize> = (0..entries.len()).filter(|&i| mapping[i].is_none()).collect();
    if missing.len() == unknown.len() {
        for (slot, id) in unknown.into_iter().zip(missing) {
            mapping[slot] = Some(id);
        }
    } else {
        for slot in unknown {
            mapping[slot] = Some(if slot < n { slot } else { 0 });
        }
    }

    mapping.into_iter().map(|m| m.unwrap_or(0)).collect()
}

/// Target count when none is configured: widest test or highest explicit id
pub fn infer_target_count(tests: &[RawTest]) -> usize {
    tests
        .iter()
        .flat_map(|t| {
            let width = t.entries.len();
            t.entries
                .iter()
                .filter_map(explicit_id)
                .map(|id| id + 1)
                .chain(std::iter::once(width))
        })
        .max()
        .unwrap_or(0)
}
