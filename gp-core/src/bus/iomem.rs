//! `/proc/iomem` parsing
//!
//! Lines are `start-end : name` with inclusive hex bounds, nested by two
//! spaces of indentation per level. Host bridge windows (`PCI Bus ...`) are
//! address space handed to a bus, not claims; what sits inside them is.

use tracing::trace;

use super::interval::IntervalSet;

const BRIDGE_PREFIX: &str = "PCI Bus";

/// One parsed iomem line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IomemEntry {
    pub depth: usize,
    pub start: u64,
    /// Inclusive
    pub end: u64,
    pub name: String,
}

impl IomemEntry {
    pub fn is_bridge_window(&self) -> bool {
        self.name.starts_with(BRIDGE_PREFIX)
    }
}

fn parse_line(line: &str) -> Option<IomemEntry> {
    let indent = line.len() - line.trim_start().len();
    let (range, name) = line.trim().split_once(" : ")?;
    let (start, end) = range.split_once('-')?;
    let start = u64::from_str_radix(start.trim(), 16).ok()?;
    let end = u64::from_str_radix(end.trim(), 16).ok()?;
    if end < start {
        return None;
    }
    Some(IomemEntry {
        depth: indent / 2,
        start,
        end,
        name: name.trim().to_string(),
    })
}

pub fn parse_entries(contents: &str) -> Vec<IomemEntry> {
    contents.lines().filter_map(parse_line).collect()
}

/// Claimed ranges below `ceiling`
///
/// An entry counts as a claim when it is not a bridge window and all of its
/// ancestors are. Ranges at or above the ceiling are dropped, ranges
/// crossing it are clipped.
pub fn claimed_ranges(contents: &str, ceiling: u64) -> IntervalSet {
    let mut claimed = IntervalSet::new();
    // is_bridge flag of each open ancestor, by depth
    let mut ancestors: Vec<bool> = Vec::new();

    for entry in parse_entries(contents) {
        ancestors.truncate(entry.depth);
        let inside_claim = ancestors.iter().any(|is_bridge| !is_bridge);
        let bridge = entry.is_bridge_window();
        // keep depth indices aligned even if the file skips a level
        while ancestors.len() < entry.depth {
            ancestors.push(true);
        }
        ancestors.push(bridge);

        if bridge || inside_claim || entry.start >= ceiling {
            continue;
        }
        let end = entry.end.saturating_add(1).min(ceiling);
        trace!("claim {:#x}-{:#x} {}", entry.start, end, entry.name);
        claimed.insert(entry.start, end);
    }
    claimed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::interval::Range;

    const SAMPLE: &str = "\
00000000-00000fff : Reserved
00001000-0009ffff : System RAM
000a0000-000fffff : Reserved
00100000-5fffffff : System RAM
  01000000-01ffffff : Kernel code
e0000000-efffffff : PCI MMCONFIG 0000 [bus 00-ff]
  e0000000-efffffff : Reserved
f0000000-fbffffff : PCI Bus 0000:00
  f0000000-f0ffffff : 0000:00:02.0
  f8000000-f9ffffff : PCI Bus 0000:17
    f8000000-f8ffffff : 0000:17:00.0
      f8000000-f8ffffff : nvidia
fee00000-fee00fff : Local APIC
100000000-47fffffff : System RAM
";

    #[test]
    fn test_parse_entries_depth() {
        let entries = parse_entries(SAMPLE);
        assert_eq!(entries.len(), 14);
        assert_eq!(entries[4].depth, 1);
        assert_eq!(entries[11].depth, 3);
        assert!(entries[7].is_bridge_window());
    }

    #[test]
    fn test_bridge_windows_descended() {
        let claimed = claimed_ranges(SAMPLE, 1 << 32);
        assert_eq!(
            claimed.ranges(),
            &[
                Range::new(0x0, 0x6000_0000),
                Range::new(0xe000_0000, 0xf100_0000),
                Range::new(0xf800_0000, 0xf900_0000),
                Range::new(0xfee0_0000, 0xfee0_1000),
            ]
        );
        // free space inside the bridge windows is allocatable
        assert!(!claimed.overlaps(0xf100_0000, 0xf800_0000));
    }

    #[test]
    fn test_ceiling_clips_and_drops() {
        let contents = "ff000000-100ffffff : Reserved\n200000000-2ffffffff : System RAM\n";
        let claimed = claimed_ranges(contents, 1 << 32);
        assert_eq!(claimed.ranges(), &[Range::new(0xff00_0000, 1 << 32)]);
    }

    #[test]
    fn test_garbage_lines_ignored() {
        let claimed = claimed_ranges("not iomem\n00000000-00000000 : \n", 1 << 32);
        assert!(claimed.is_empty());
    }
}
