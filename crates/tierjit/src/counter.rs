//! Usage counter for compilation tiering.
//!
//! Tracks how many times each method has been invoked. The post-increment
//! value is what the tier policy decides against, so increment and read
//! happen in a single atomic step.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::shard::ShardedMap;
use crate::types::{DEFAULT_SHARDS, MethodId};

/// Thread-safe invocation counter keyed by method identity.
///
/// Each method's count is an `AtomicU64` inside a sharded map, so
/// `increment()` only needs a shard read lock for already-seen methods.
/// Counts are never removed.
#[derive(Debug)]
pub struct UsageCounter {
    counts: ShardedMap<AtomicU64>,
}

impl UsageCounter {
    /// Create a new usage counter.
    pub fn new() -> Self {
        Self::with_shards(DEFAULT_SHARDS)
    }

    /// Create a new usage counter with the given number of shards.
    pub fn with_shards(shards: usize) -> Self {
        Self {
            counts: ShardedMap::with_shards(shards),
        }
    }

    /// Increment the invocation count for a method. Returns the new count.
    ///
    /// Unseen methods start at zero, so their first increment returns 1.
    /// For a single method the returned values follow the total order of the
    /// underlying `fetch_add`s.
    pub fn increment(&self, id: &MethodId) -> u64 {
        self.counts.with_or_insert(id, |count| {
            count.fetch_add(1, Ordering::Relaxed).saturating_add(1)
        })
    }

    /// Get the current invocation count for a method (0 if never seen).
    pub fn get(&self, id: &MethodId) -> u64 {
        self.counts
            .with(id, |count| count.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    /// Number of distinct methods observed.
    pub fn len(&self) -> usize {
        self.counts.len()
    }

    /// Whether no method has been observed yet.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for UsageCounter {
    fn default() -> Self {
        Self::new()
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
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_increment_and_get() {
        let counter = UsageCounter::new();
        let id = MethodId(0);

        assert_eq!(counter.get(&id), 0);
        assert_eq!(counter.increment(&id), 1);
        assert_eq!(counter.increment(&id), 2);
        assert_eq!(counter.get(&id), 2);
    }

    #[test]
    fn test_distinct_methods() {
        let counter = UsageCounter::new();
        let m1 = MethodId(0);
        let m2 = MethodId(1);

        counter.increment(&m1);
        counter.increment(&m1);
        counter.increment(&m2);

        assert_eq!(counter.get(&m1), 2);
        assert_eq!(counter.get(&m2), 1);
        assert_eq!(counter.len(), 2);
    }

    #[test]
    fn test_concurrent_increments_hand_out_every_count_once() {
        let counter = Arc::new(UsageCounter::with_shards(4));
        let id = MethodId(42);

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let counter = Arc::clone(&counter);
                thread::spawn(move || (0..1_000).map(|_| counter.increment(&id)).collect::<Vec<_>>())
            })
            .collect();

        let mut seen: Vec<u64> = handles
            .into_iter()
            .flat_map(|h| h.join().expect("increment thread panicked"))
            .collect();
        seen.sort_unstable();

        assert_eq!(seen, (1..=8_000).collect::<Vec<u64>>());
        assert_eq!(counter.get(&id), 8_000);
    }
}
