//! Per-GPU performance figures from diagnostic info text

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TargetMetrics {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gflops: Option<f64>,
    /// GB/s
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pcie_bandwidth: Option<f64>,
    /// microseconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pcie_latency: Option<f64>,
    /// W
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub power_avg: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub power_max: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stress_level: Option<u32>,
    /// Share of framebuffer the memory test covered
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_percent: Option<f64>,
}

impl TargetMetrics {
    pub fn is_empty(&self) -> bool {
        *self == TargetMetrics::default()
    }
}

struct Patterns {
    gflops: Regex,
    bandwidth: Regex,
    latency: Regex,
    power_avg: Regex,
    power_max: Regex,
    stress: Regex,
    memory: Regex,
}

fn patterns() -> Option<&'static Patterns> {
    static PATTERNS: OnceLock<Option<Patterns>> = OnceLock::new();
    PATTERNS
        .get_or_init(|| {
            Some(Patterns {
                gflops: Regex::new(r"(?i)approximately\s+([\d.]+)\s+gigaflops").ok()?,
                bandwidth: Regex::new(r"(?i)bidirectional bandwidth[:\s]+([\d.]+)").ok()?,
                latency: Regex::new(r"(?i)GPU to Host latency[:\s]+([\d.]+)").ok()?,
                power_avg: Regex::new(r"(?i)average power usage[:\s]+([\d.]+)").ok()?,
                power_max: Regex::new(r"(?i)max power[:\s]+([\d.]+)").ok()?,
                stress: Regex::new(r"(?i)stress level\s+(\d+)").ok()?,
                memory: Regex::new(r"\(([\d.]+)%\)").ok()?,
            })
        })
        .as_ref()
}

fn capture<T: std::str::FromStr>(re: &Regex, text: &str) -> Option<T> {
    re.captures(text)?.get(1)?.as_str().trim_end_matches('.').parse().ok()
}

/// Fold figures from one entry of `test` into `metrics`
pub fn extract_into(metrics: &mut TargetMetrics, test: &str, info: &str) {
    let Some(p) = patterns() else {
        return;
    };
    if info.is_empty() {
        return;
    }
    match test.to_ascii_lowercase().as_str() {
        "diagnostic" => {
            if let Some(v) = capture(&p.gflops, info) {
                metrics.gflops = Some(v);
            }
        }
        "pcie" => {
            if let Some(v) = capture(&p.bandwidth, info) {
                metrics.pcie_bandwidth = Some(v);
            }
            if let Some(v) = capture(&p.latency, info) {
                metrics.pcie_latency = Some(v);
            }
        }
        "targeted_power" => {
            if let Some(v) = capture(&p.power_avg, info) {
                metrics.power_avg = Some(v);
            }
            if let Some(v) = capture(&p.power_max, info) {
                metrics.power_max = Some(v);
            }
        }
        "targeted_stress" => {
            if let Some(v) = capture(&p.stress, info) {
                metrics.stress_level = Some(v);
            }
        }
        "memory" => {
            if let Some(v) = capture(&p.memory, info) {
                metrics.memory_percent = Some(v);
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extracts_known_figures() {
        let mut m = TargetMetrics::default();
        extract_into(&mut m, "diagnostic", "GPU 0 calculated at approximately 51234.56 gigaflops during this test");
        extract_into(
            &mut m,
            "pcie",
            "GPU 0 GPU to Host bidirectional bandwidth: 49.12 GB/s; GPU 0 GPU to Host latency: 2.35 us",
        );
        extract_into(&mut m, "targeted_power", "GPU 0 average power usage: 687.20 W; max power: 699.9 W");
        extract_into(&mut m, "targeted_stress", "GPU 0 held stress level 17421 for 120 seconds");
        extract_into(&mut m, "memory", "Allocated 85031714816 bytes (98.9%)");

        assert_eq!(m.gflops, Some(51234.56));
        assert_eq!(m.pcie_bandwidth, Some(49.12));
        assert_eq!(m.pcie_latency, Some(2.35));
        assert_eq!(m.power_avg, Some(687.2));
        assert_eq!(m.power_max, Some(699.9));
        assert_eq!(m.stress_level, Some(17421));
        assert_eq!(m.memory_percent, Some(98.9));
    }

    #[test]
    fn test_unrelated_test_yields_nothing() {
        let mut m = TargetMetrics::default();
        extract_into(&mut m, "software", "approximately 10 gigaflops");
        assert!(m.is_empty());
    }
}
