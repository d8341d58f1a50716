//! Threshold evaluation over a cycle's bucket counts.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::classify::BucketCounts;

/// Outcome of one evaluation. Carries the full breakdown even when not
/// triggered so the status record can show trend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlertDecision {
    pub triggered: bool,
    pub qualifying_total: usize,
    pub breakdown: BucketCounts,
    pub threshold: usize,
    pub evaluated_at: DateTime<Utc>,
}

/// Compares the qualifying total against an inclusive threshold.
#[derive(Debug, Clone, Copy)]
pub struct ThresholdEvaluator {
    threshold: usize,
}

impl ThresholdEvaluator {
    #[must_use]
    pub const fn new(threshold: usize) -> Self {
        Self { threshold }
    }

    #[must_use]
    pub const fn threshold(&self) -> usize {
        self.threshold
    }

    #[must_use]
    pub fn evaluate(&self, counts: &BucketCounts, now: DateTime<Utc>) -> AlertDecision {
        let qualifying_total = counts.qualifying_total();
        AlertDecision {
            triggered: qualifying_total >= self.threshold,
            qualifying_total,
            breakdown: counts.clone(),
            threshold: self.threshold,
            evaluated_at: now,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn counts(a: usize, b: usize, c: usize, other: usize) -> BucketCounts {
        BucketCounts {
            within_60: a,
            within_90: b,
            within_120: c,
            other,
        }
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 9, 19, 23, 0, 0).unwrap()
    }

    #[test]
    fn test_exactly_threshold_triggers() {
        let decision = ThresholdEvaluator::new(20).evaluate(&counts(10, 10, 0, 50), now());
        assert!(decision.triggered);
        assert_eq!(decision.qualifying_total, 20);
        assert_eq!(decision.breakdown.other, 50);
    }

    #[test]
    fn test_below_threshold_keeps_breakdown() {
        let decision = ThresholdEvaluator::new(20).evaluate(&counts(9, 5, 5, 300), now());
        assert!(!decision.triggered);
        assert_eq!(decision.qualifying_total, 19);
        assert_eq!(decision.breakdown, counts(9, 5, 5, 300));
    }

    #[test]
    fn test_other_bucket_never_counts() {
        let decision = ThresholdEvaluator::new(1).evaluate(&counts(0, 0, 0, 1000), now());
        assert!(!decision.triggered);
        assert_eq!(decision.qualifying_total, 0);
    }

    #[test]
    fn test_evaluate_is_idempotent() {
        let evaluator = ThresholdEvaluator::new(20);
        let input = counts(3, 8, 12, 4);
        assert_eq!(evaluator.evaluate(&input, now()), evaluator.evaluate(&input, now()));
    }
}
