//! Tier promotion policy.

use crate::types::{DEFAULT_L1_THRESHOLD, DEFAULT_L2_THRESHOLD, Decision, TierConfig};

/// Maps an invocation count and a method's request state to a decision.
///
/// L2 is checked first: once a method is hot enough for L2 there is no point
/// in also compiling it at L1, so a method whose count jumps past both
/// thresholds between observations goes straight to L2.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TierPolicy {
    l1_threshold: u64,
    l2_threshold: u64,
}

impl TierPolicy {
    pub const fn new(l1_threshold: u64, l2_threshold: u64) -> Self {
        Self {
            l1_threshold,
            l2_threshold,
        }
    }

    pub fn from_config(config: &TierConfig) -> Self {
        Self::new(config.l1_threshold, config.l2_threshold)
    }

    pub const fn l1_threshold(&self) -> u64 {
        self.l1_threshold
    }

    pub const fn l2_threshold(&self) -> u64 {
        self.l2_threshold
    }

    /// Decide what, if anything, to compile for an invocation that observed
    /// `count`.
    ///
    /// `already_l1_requested` and `already_l2_requested` cover both in-flight
    /// and completed compilations.
    pub fn decide(
        &self,
        count: u64,
        already_l1_requested: bool,
        already_l2_requested: bool,
    ) -> Decision {
        if count >= self.l2_threshold && !already_l2_requested {
            Decision::CompileL2
        } else if count >= self.l1_threshold && !already_l1_requested && !already_l2_requested {
            Decision::CompileL1
        } else {
            Decision::None
        }
    }
}

impl Default for TierPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_L1_THRESHOLD, DEFAULT_L2_THRESHOLD)
    }
}

#[cfg(test)]
#[allow(
    clippy::arithmetic_side_effects,
    clippy::indexing_slicing,
    clippy::as_conversions,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic
)]
mod tests {
    use super::*;

    #[test]
    fn test_below_l1_is_none() {
        let policy = TierPolicy::default();
        for count in 0..20 {
            assert_eq!(policy.decide(count, false, false), Decision::None);
        }
    }

    #[test]
    fn test_l1_at_threshold() {
        let policy = TierPolicy::default();
        assert_eq!(policy.decide(20, false, false), Decision::CompileL1);
        assert_eq!(policy.decide(899, false, false), Decision::CompileL1);
        assert_eq!(policy.decide(20, true, false), Decision::None);
    }

    #[test]
    fn test_l2_takes_priority() {
        let policy = TierPolicy::default();
        assert_eq!(policy.decide(900, false, false), Decision::CompileL2);
        assert_eq!(policy.decide(900, true, false), Decision::CompileL2);
        assert_eq!(policy.decide(5_000, false, false), Decision::CompileL2);
    }

    #[test]
    fn test_nothing_after_l2_requested() {
        let policy = TierPolicy::default();
        assert_eq!(policy.decide(900, true, true), Decision::None);
        // L1 is never requested once L2 is in flight or done.
        assert_eq!(policy.decide(100, false, true), Decision::None);
        assert_eq!(policy.decide(1_000, false, true), Decision::None);
    }

    #[test]
    fn test_from_config() {
        let policy = TierPolicy::from_config(&TierConfig::with_thresholds(2, 5));
        assert_eq!(policy.l1_threshold(), 2);
        assert_eq!(policy.l2_threshold(), 5);
        assert_eq!(policy.decide(1, false, false), Decision::None);
        assert_eq!(policy.decide(2, false, false), Decision::CompileL1);
        assert_eq!(policy.decide(5, true, false), Decision::CompileL2);
    }
}
