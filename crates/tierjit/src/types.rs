//! Tiering types.
//!
//! Core data structures shared by the counter, the policy, the cache and the
//! dispatcher. Everything here is plain data plus atomics; no locks.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Default invocation count at which a method is compiled at L1.
pub const DEFAULT_L1_THRESHOLD: u64 = 20;
/// Default invocation count at which a method is compiled at L2.
pub const DEFAULT_L2_THRESHOLD: u64 = 900;
/// Default number of shards for the counter and cache maps.
pub const DEFAULT_SHARDS: usize = 64;

/// Opaque identity of a method.
///
/// Assumed stable for the lifetime of the process. It is the only key used by
/// the usage counter and the compilation cache.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct MethodId(pub u64);

impl From<u64> for MethodId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

impl fmt::Display for MethodId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "method#{}", self.0)
    }
}

/// Compilation tier. Ordered: `L1 < L2`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub enum Tier {
    /// Quick baseline compilation.
    L1,
    /// Optimizing compilation.
    L2,
}

impl Tier {
    /// Both tiers, lowest first.
    pub const ALL: [Tier; 2] = [Tier::L1, Tier::L2];

    /// Bit used for this tier in the cache's request mask.
    pub(crate) const fn request_bit(self) -> u8 {
        match self {
            Tier::L1 => 0b01,
            Tier::L2 => 0b10,
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Tier::L1 => f.write_str("L1"),
            Tier::L2 => f.write_str("L2"),
        }
    }
}

/// Outcome of the tier policy for one invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Decision {
    /// Nothing to compile.
    None,
    /// Request baseline compilation.
    CompileL1,
    /// Request optimizing compilation.
    CompileL2,
}

impl Decision {
    /// The tier this decision asks for, if any.
    pub const fn tier(self) -> Option<Tier> {
        match self {
            Decision::None => None,
            Decision::CompileL1 => Some(Tier::L1),
            Decision::CompileL2 => Some(Tier::L2),
        }
    }
}

/// Observable execution state of a method.
///
/// Transitions only forward: `Interpreted -> L1Compiled -> L2Compiled`, or
/// straight from `Interpreted` to `L2Compiled`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub enum MethodTier {
    Interpreted,
    L1Compiled,
    L2Compiled,
}

impl From<Option<Tier>> for MethodTier {
    fn from(tier: Option<Tier>) -> Self {
        match tier {
            None => MethodTier::Interpreted,
            Some(Tier::L1) => MethodTier::L1Compiled,
            Some(Tier::L2) => MethodTier::L2Compiled,
        }
    }
}

/// Where compilation work runs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompilationMode {
    /// The invocation that wins the request compiles inline and may fail.
    #[default]
    Synchronous,
    /// Requests are handed to a pool of compiler threads; callers keep
    /// interpreting until the artifact is published.
    Background,
}

/// Configuration for the tiered dispatcher.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TierConfig {
    /// Invocation count at which a method becomes eligible for L1.
    pub l1_threshold: u64,
    /// Invocation count at which a method becomes eligible for L2.
    pub l2_threshold: u64,
    /// Inline or background compilation.
    pub compilation_mode: CompilationMode,
    /// Number of compiler threads in background mode.
    pub compile_workers: usize,
    /// Number of shards in the counter and cache maps. Must be a power of two.
    pub shards: usize,
}

impl TierConfig {
    /// Configuration with the given thresholds and defaults elsewhere.
    pub fn with_thresholds(l1_threshold: u64, l2_threshold: u64) -> Self {
        Self {
            l1_threshold,
            l2_threshold,
            ..Self::default()
        }
    }

    /// Switch to background compilation with `workers` compiler threads.
    pub fn background(mut self, workers: usize) -> Self {
        self.compilation_mode = CompilationMode::Background;
        self.compile_workers = workers;
        self
    }

    /// Check the configuration for values the dispatcher cannot run with.
    ///
    /// Inverted thresholds (`l1_threshold >= l2_threshold`) are not rejected;
    /// see [`TierConfig::has_inverted_thresholds`].
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.l1_threshold == 0 {
            return Err(ConfigError::ZeroThreshold(Tier::L1));
        }
        if self.l2_threshold == 0 {
            return Err(ConfigError::ZeroThreshold(Tier::L2));
        }
        if self.compilation_mode == CompilationMode::Background && self.compile_workers == 0 {
            return Err(ConfigError::NoCompileWorkers);
        }
        if !self.shards.is_power_of_two() {
            return Err(ConfigError::InvalidShardCount(self.shards));
        }
        Ok(())
    }

    /// Whether L1 would not fire strictly before L2.
    pub fn has_inverted_thresholds(&self) -> bool {
        self.l1_threshold >= self.l2_threshold
    }
}

impl Default for TierConfig {
    fn default() -> Self {
        Self {
            l1_threshold: DEFAULT_L1_THRESHOLD,
            l2_threshold: DEFAULT_L2_THRESHOLD,
            compilation_mode: CompilationMode::Synchronous,
            compile_workers: 1,
            shards: DEFAULT_SHARDS,
        }
    }
}

/// Atomic counters for dispatch and compilation events.
#[derive(Debug, Default)]
pub struct DispatchMetrics {
    /// Invocations that ran through the interpreter.
    pub interpretations: AtomicU64,
    /// Invocations that ran a compiled artifact.
    pub executions: AtomicU64,
    /// Successful L1 compilations.
    pub l1_compilations: AtomicU64,
    /// Successful L2 compilations.
    pub l2_compilations: AtomicU64,
    /// Compiler errors (the request was rolled back).
    pub compilation_failures: AtomicU64,
    /// Policy asked for a tier but another caller already held the request.
    pub requests_denied: AtomicU64,
    /// Requests handed to the background compiler pool.
    pub requests_queued: AtomicU64,
    /// Artifacts that arrived after a higher tier was already published.
    pub superseded_publishes: AtomicU64,
}

impl DispatchMetrics {
    /// Create a new metrics instance with all counters at zero.
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_compilation(&self, tier: Tier) {
        let counter = match tier {
            Tier::L1 => &self.l1_compilations,
            Tier::L2 => &self.l2_compilations,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Get a snapshot of all metrics.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            interpretations: self.interpretations.load(Ordering::Relaxed),
            executions: self.executions.load(Ordering::Relaxed),
            l1_compilations: self.l1_compilations.load(Ordering::Relaxed),
            l2_compilations: self.l2_compilations.load(Ordering::Relaxed),
            compilation_failures: self.compilation_failures.load(Ordering::Relaxed),
            requests_denied: self.requests_denied.load(Ordering::Relaxed),
            requests_queued: self.requests_queued.load(Ordering::Relaxed),
            superseded_publishes: self.superseded_publishes.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`DispatchMetrics`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub interpretations: u64,
    pub executions: u64,
    pub l1_compilations: u64,
    pub l2_compilations: u64,
    pub compilation_failures: u64,
    pub requests_denied: u64,
    pub requests_queued: u64,
    pub superseded_publishes: u64,
}

impl MetricsSnapshot {
    /// Total dispatched invocations, compiled or not.
    pub fn invocations(&self) -> u64 {
        self.interpretations.saturating_add(self.executions)
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
    fn test_default_config_is_valid() {
        let config = TierConfig::default();
        assert_eq!(config.l1_threshold, 20);
        assert_eq!(config.l2_threshold, 900);
        assert_eq!(config.validate(), Ok(()));
        assert!(!config.has_inverted_thresholds());
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let config = TierConfig::with_thresholds(0, 900);
        assert_eq!(config.validate(), Err(ConfigError::ZeroThreshold(Tier::L1)));

        let config = TierConfig::with_thresholds(20, 0);
        assert_eq!(config.validate(), Err(ConfigError::ZeroThreshold(Tier::L2)));

        let config = TierConfig::default().background(0);
        assert_eq!(config.validate(), Err(ConfigError::NoCompileWorkers));

        let config = TierConfig {
            shards: 12,
            ..TierConfig::default()
        };
        assert_eq!(config.validate(), Err(ConfigError::InvalidShardCount(12)));
    }

    #[test]
    fn test_inverted_thresholds_are_allowed() {
        let config = TierConfig::with_thresholds(900, 20);
        assert_eq!(config.validate(), Ok(()));
        assert!(config.has_inverted_thresholds());
    }

    #[test]
    fn test_config_deserializes_with_defaults() {
        let config: TierConfig = serde_json::from_str(
            r#"{ "l1_threshold": 5, "compilation_mode": "background", "compile_workers": 4 }"#,
        )
        .expect("valid config json");
        assert_eq!(config.l1_threshold, 5);
        assert_eq!(config.l2_threshold, DEFAULT_L2_THRESHOLD);
        assert_eq!(config.compilation_mode, CompilationMode::Background);
        assert_eq!(config.compile_workers, 4);
        assert_eq!(config.shards, DEFAULT_SHARDS);
    }

    #[test]
    fn test_tier_ordering_and_method_tier() {
        assert!(Tier::L1 < Tier::L2);
        assert_eq!(MethodTier::from(None), MethodTier::Interpreted);
        assert_eq!(MethodTier::from(Some(Tier::L1)), MethodTier::L1Compiled);
        assert_eq!(MethodTier::from(Some(Tier::L2)), MethodTier::L2Compiled);
        assert!(MethodTier::L1Compiled < MethodTier::L2Compiled);
    }

    #[test]
    fn test_metrics_snapshot() {
        let metrics = DispatchMetrics::new();
        metrics.interpretations.store(19, Ordering::Relaxed);
        metrics.executions.store(81, Ordering::Relaxed);
        metrics.record_compilation(Tier::L1);
        metrics.record_compilation(Tier::L2);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.invocations(), 100);
        assert_eq!(snapshot.l1_compilations, 1);
        assert_eq!(snapshot.l2_compilations, 1);
        assert_eq!(snapshot.compilation_failures, 0);
    }
}
