//! Sorted set of half-open address ranges

use serde::{Deserialize, Serialize};
use std::fmt;

/// `[start, end)`
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Range {
    pub start: u64,
    pub end: u64,
}

impl Range {
    pub fn new(start: u64, end: u64) -> Self {
        Self { start, end }
    }

    pub fn len(&self) -> u64 {
        self.end.saturating_sub(self.start)
    }

    pub fn is_empty(&self) -> bool {
        self.end <= self.start
    }

    pub fn overlaps(&self, other: &Range) -> bool {
        self.start < other.end && other.start < self.end
    }
}

impl fmt::Display for Range {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{:#010x}, {:#010x})", self.start, self.end)
    }
}

/// Claimed ranges, kept sorted and merged
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IntervalSet {
    ranges: Vec<Range>,
}

impl IntervalSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert `[start, end)`, merging with overlapping or touching ranges
    pub fn insert(&mut self, start: u64, end: u64) {
        if end <= start {
            return;
        }
        let mut merged = Range::new(start, end);
        // first range that could touch the new one
        let first = self.ranges.partition_point(|r| r.end < merged.start);
        let mut last = first;
        while last < self.ranges.len() && self.ranges[last].start <= merged.end {
            merged.start = merged.start.min(self.ranges[last].start);
            merged.end = merged.end.max(self.ranges[last].end);
            last += 1;
        }
        self.ranges.splice(first..last, std::iter::once(merged));
    }

    pub fn ranges(&self) -> &[Range] {
        &self.ranges
    }

    pub fn len(&self) -> usize {
        self.ranges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    /// Whether any claimed range intersects `[start, end)`
    pub fn overlaps(&self, start: u64, end: u64) -> bool {
        let probe = Range::new(start, end);
        if probe.is_empty() {
            return false;
        }
        let idx = self.ranges.partition_point(|r| r.end <= start);
        self.ranges.get(idx).is_some_and(|r| r.overlaps(&probe))
    }

    /// Unclaimed ranges between 0 and `ceiling`
    pub fn gaps(&self, ceiling: u64) -> Vec<Range> {
        let mut gaps = Vec::new();
        let mut cursor = 0u64;
        for range in &self.ranges {
            if range.start >= ceiling {
                break;
            }
            if range.start > cursor {
                gaps.push(Range::new(cursor, range.start));
            }
            cursor = cursor.max(range.end);
        }
        if cursor < ceiling {
            gaps.push(Range::new(cursor, ceiling));
        }
        gaps
    }

    /// Largest gap below `ceiling`; the lowest wins a tie
    pub fn largest_gap(&self, ceiling: u64) -> Option<Range> {
        self.gaps(ceiling)
            .into_iter()
            .fold(None, |best: Option<Range>, gap| match best {
                Some(b) if b.len() >= gap.len() => Some(b),
                _ => Some(gap),
            })
    }
}
