use serde::{Deserialize, Serialize};

/// How close tracked usage is to the page's memory budget.
///
/// Anything above `Low` makes [`MemoryBroker::enforce`] ask handlers to give
/// memory back; the higher the band, the further down it pushes.
///
/// [`MemoryBroker::enforce`]: crate::MemoryBroker::enforce
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryPressure {
    Low,
    Medium,
    High,
    /// The page is about to fail allocation; everything purgeable goes.
    Critical,
}

impl MemoryPressure {
    /// Share of the budget that enforcement at this band reclaims down to.
    pub fn target_ratio(self) -> f64 {
        match self {
            MemoryPressure::Low => 1.0,
            MemoryPressure::Medium => 0.70,
            MemoryPressure::High => 0.50,
            MemoryPressure::Critical => 0.0,
        }
    }

    /// [`target_ratio`](Self::target_ratio) applied to `budget_bytes`.
    pub fn target_bytes(self, budget_bytes: u64) -> u64 {
        ((budget_bytes as f64) * self.target_ratio()).round() as u64
    }
}

/// Usage ratios at which the broker moves into each pressure band.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MemoryPressureThresholds {
    pub medium: f64,
    pub high: f64,
    pub critical: f64,
}

impl Default for MemoryPressureThresholds {
    fn default() -> Self {
        Self {
            medium: 0.70,
            high: 0.85,
            critical: 0.95,
        }
    }
}

impl MemoryPressureThresholds {
    pub fn level_for_ratio(self, ratio: f64) -> MemoryPressure {
        if ratio >= self.critical {
            MemoryPressure::Critical
        } else if ratio >= self.high {
            MemoryPressure::High
        } else if ratio >= self.medium {
            MemoryPressure::Medium
        } else {
            MemoryPressure::Low
        }
    }

    /// Band for `usage_bytes` against `budget_bytes`. A zero budget counts as
    /// one byte, so any usage at all is critical.
    pub fn level_for_usage(self, usage_bytes: u64, budget_bytes: u64) -> MemoryPressure {
        let ratio = usage_bytes as f64 / budget_bytes.max(1) as f64;
        self.level_for_ratio(ratio)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn usage_maps_onto_bands() {
        let thresholds = MemoryPressureThresholds::default();
        let budget = 1000;
        assert_eq!(thresholds.level_for_usage(0, budget), MemoryPressure::Low);
        assert_eq!(thresholds.level_for_usage(699, budget), MemoryPressure::Low);
        assert_eq!(thresholds.level_for_usage(700, budget), MemoryPressure::Medium);
        assert_eq!(thresholds.level_for_usage(900, budget), MemoryPressure::High);
        assert_eq!(thresholds.level_for_usage(1500, budget), MemoryPressure::Critical);
    }

    #[test]
    fn zero_budget_is_critical_once_anything_is_used() {
        let thresholds = MemoryPressureThresholds::default();
        assert_eq!(thresholds.level_for_usage(0, 0), MemoryPressure::Low);
        assert_eq!(thresholds.level_for_usage(1, 0), MemoryPressure::Critical);
    }

    #[test]
    fn targets_shrink_as_pressure_rises() {
        let budget = 64 * 1024 * 1024;
        assert_eq!(MemoryPressure::Low.target_bytes(budget), budget);
        assert_eq!(MemoryPressure::High.target_bytes(budget), budget / 2);
        assert_eq!(MemoryPressure::Critical.target_bytes(budget), 0);
        assert!(
            MemoryPressure::Medium.target_bytes(budget) > MemoryPressure::High.target_bytes(budget)
        );
    }
}
