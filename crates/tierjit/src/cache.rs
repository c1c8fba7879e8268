//! Compilation cache.
//!
//! Stores the published artifact for each method together with the set of
//! tiers that have been requested for it. The request set is the gate that
//! keeps compilation at most once per (method, tier): a caller must win
//! [`CompilationCache::mark_requested`] before it may invoke the compiler.
//!
//! `lookup` is on the hot path (every dispatch) and takes two read locks: the
//! shard and the method's artifact slot. Requests and publishes are on the
//! cold path. No lock is held while the compiler runs.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, RwLock};

use crate::shard::ShardedMap;
use crate::types::{DEFAULT_SHARDS, MethodId, Tier};

/// A published artifact and the tier it was compiled at.
#[derive(Debug)]
pub struct CompiledMethod<A> {
    tier: Tier,
    artifact: A,
}

impl<A> CompiledMethod<A> {
    pub fn tier(&self) -> Tier {
        self.tier
    }

    pub fn artifact(&self) -> &A {
        &self.artifact
    }
}

/// Snapshot of a method's compilation state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TierState {
    /// L1 compilation is in flight or done.
    pub l1_requested: bool,
    /// L2 compilation is in flight or done.
    pub l2_requested: bool,
    /// Tier of the artifact currently used for execution.
    pub published: Option<Tier>,
}

/// Per-method cache record.
#[derive(Debug)]
struct CacheEntry<A> {
    /// Bit mask of requested tiers, see [`Tier::request_bit`].
    requested: AtomicU8,
    /// Highest-tier artifact published so far.
    active: RwLock<Option<Arc<CompiledMethod<A>>>>,
}

impl<A> Default for CacheEntry<A> {
    fn default() -> Self {
        Self {
            requested: AtomicU8::new(0),
            active: RwLock::new(None),
        }
    }
}

impl<A> CacheEntry<A> {
    fn active(&self) -> Option<Arc<CompiledMethod<A>>> {
        #[expect(clippy::unwrap_used, reason = "RwLock poisoning is unrecoverable")]
        let active = self.active.read().unwrap();
        active.clone()
    }
}

/// Thread-safe cache of compiled methods.
///
/// Entries are never evicted. Publishing a higher tier replaces the artifact
/// used for execution; publishing a lower tier after a higher one is a no-op.
#[derive(Debug)]
pub struct CompilationCache<A> {
    entries: ShardedMap<CacheEntry<A>>,
}

impl<A> CompilationCache<A> {
    /// Create a new empty cache.
    pub fn new() -> Self {
        Self::with_shards(DEFAULT_SHARDS)
    }

    /// Create a new empty cache with the given number of shards.
    pub fn with_shards(shards: usize) -> Self {
        Self {
            entries: ShardedMap::with_shards(shards),
        }
    }

    /// Look up the artifact to execute for a method, if any.
    pub fn lookup(&self, id: &MethodId) -> Option<Arc<CompiledMethod<A>>> {
        self.entries.with(id, CacheEntry::active).flatten()
    }

    /// Tier of the published artifact, if any.
    pub fn tier_of(&self, id: &MethodId) -> Option<Tier> {
        self.lookup(id).map(|compiled| compiled.tier())
    }

    /// Current request and publish state of a method.
    ///
    /// Unseen methods report the default (nothing requested, nothing
    /// published) without creating an entry.
    pub fn tier_state(&self, id: &MethodId) -> TierState {
        self.entries
            .with(id, |entry| {
                let bits = entry.requested.load(Ordering::Acquire);
                TierState {
                    l1_requested: bits & Tier::L1.request_bit() != 0,
                    l2_requested: bits & Tier::L2.request_bit() != 0,
                    published: entry.active().map(|compiled| compiled.tier()),
                }
            })
            .unwrap_or_default()
    }

    /// Claim the right to compile `id` at `tier`.
    ///
    /// Returns `true` for exactly one caller per (method, tier) until the
    /// request is released; that caller must compile and then either
    /// [`publish`](Self::publish) or [`release`](Self::release). L1 is only
    /// granted while no tier has been requested; L2 supersedes L1 and is
    /// granted whenever L2 itself has not been requested.
    pub fn mark_requested(&self, id: &MethodId, tier: Tier) -> bool {
        let bit = tier.request_bit();
        self.entries.with_or_insert(id, |entry| {
            entry
                .requested
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |bits| {
                    let taken = match tier {
                        Tier::L1 => bits != 0,
                        Tier::L2 => bits & bit != 0,
                    };
                    (!taken).then_some(bits | bit)
                })
                .is_ok()
        })
    }

    /// Roll back a request whose compilation failed, so a later invocation
    /// can request the same tier again.
    pub fn release(&self, id: &MethodId, tier: Tier) {
        let bit = tier.request_bit();
        self.entries.with(id, |entry| {
            entry.requested.fetch_and(!bit, Ordering::AcqRel);
        });
    }

    /// Publish an artifact compiled at `tier`.
    ///
    /// Returns `true` if it became the artifact used for execution, `false`
    /// if a higher tier was already published (the artifact is dropped).
    /// The tier is recorded as requested either way.
    pub fn publish(&self, id: &MethodId, tier: Tier, artifact: A) -> bool {
        let compiled = Arc::new(CompiledMethod { tier, artifact });
        self.entries.with_or_insert(id, |entry| {
            entry
                .requested
                .fetch_or(tier.request_bit(), Ordering::AcqRel);

            #[expect(clippy::unwrap_used, reason = "RwLock poisoning is unrecoverable")]
            let mut active = entry.active.write().unwrap();
            match active.as_ref() {
                Some(current) if current.tier() > tier => false,
                _ => {
                    *active = Some(compiled);
                    true
                }
            }
        })
    }

    /// Number of methods with a request or an artifact.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the cache holds no entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Method ids that have a published artifact, with its tier.
    pub fn published(&self) -> Vec<(MethodId, Tier)> {
        self.entries
            .keys()
            .into_iter()
            .filter_map(|id| self.tier_of(&id).map(|tier| (id, tier)))
            .collect()
    }
}

impl<A> Default for CompilationCache<A> {
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

    #[test]
    fn test_cache_publish_and_lookup() {
        let cache = CompilationCache::new();
        let id = MethodId(1);

        assert!(cache.lookup(&id).is_none());
        assert!(cache.is_empty());

        assert!(cache.mark_requested(&id, Tier::L1));
        assert!(cache.publish(&id, Tier::L1, "l1-code"));

        let compiled = cache.lookup(&id).expect("published entry should exist");
        assert_eq!(compiled.tier(), Tier::L1);
        assert_eq!(*compiled.artifact(), "l1-code");
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_mark_requested_once_per_tier() {
        let cache: CompilationCache<()> = CompilationCache::new();
        let id = MethodId(1);

        assert!(cache.mark_requested(&id, Tier::L1));
        assert!(!cache.mark_requested(&id, Tier::L1));
        assert!(cache.mark_requested(&id, Tier::L2));
        assert!(!cache.mark_requested(&id, Tier::L2));
    }

    #[test]
    fn test_l2_request_blocks_l1() {
        let cache: CompilationCache<()> = CompilationCache::new();
        let id = MethodId(1);

        assert!(cache.mark_requested(&id, Tier::L2));
        assert!(!cache.mark_requested(&id, Tier::L1));
        assert_eq!(
            cache.tier_state(&id),
            TierState {
                l1_requested: false,
                l2_requested: true,
                published: None,
            }
        );
    }

    #[test]
    fn test_release_allows_retry() {
        let cache: CompilationCache<()> = CompilationCache::new();
        let id = MethodId(1);

        assert!(cache.mark_requested(&id, Tier::L1));
        cache.release(&id, Tier::L1);
        assert_eq!(cache.tier_state(&id), TierState::default());
        assert!(cache.mark_requested(&id, Tier::L1));
    }

    #[test]
    fn test_release_keeps_other_tier() {
        let cache: CompilationCache<()> = CompilationCache::new();
        let id = MethodId(1);

        assert!(cache.mark_requested(&id, Tier::L1));
        assert!(cache.publish(&id, Tier::L1, ()));
        assert!(cache.mark_requested(&id, Tier::L2));
        cache.release(&id, Tier::L2);

        let state = cache.tier_state(&id);
        assert!(state.l1_requested);
        assert!(!state.l2_requested);
        assert_eq!(state.published, Some(Tier::L1));
    }

    #[test]
    fn test_higher_tier_replaces_lower() {
        let cache = CompilationCache::new();
        let id = MethodId(1);

        assert!(cache.publish(&id, Tier::L1, 1));
        assert!(cache.publish(&id, Tier::L2, 2));

        let compiled = cache.lookup(&id).expect("entry should exist");
        assert_eq!(compiled.tier(), Tier::L2);
        assert_eq!(*compiled.artifact(), 2);
    }

    #[test]
    fn test_late_lower_tier_is_dropped() {
        let cache = CompilationCache::new();
        let id = MethodId(1);

        assert!(cache.publish(&id, Tier::L2, 2));
        assert!(!cache.publish(&id, Tier::L1, 1));

        assert_eq!(cache.tier_of(&id), Some(Tier::L2));
        assert_eq!(cache.lookup(&id).map(|c| *c.artifact()), Some(2));
    }

    #[test]
    fn test_separate_method_entries() {
        let cache = CompilationCache::new();
        let a = MethodId(1);
        let b = MethodId(2);

        assert!(cache.mark_requested(&a, Tier::L1));
        assert!(cache.publish(&a, Tier::L1, "a"));

        assert!(cache.lookup(&b).is_none());
        assert_eq!(cache.tier_state(&b), TierState::default());
        assert!(cache.mark_requested(&b, Tier::L1));
        assert_eq!(cache.published(), vec![(a, Tier::L1)]);
    }

    #[test]
    fn test_tier_state_does_not_create_entries() {
        let cache: CompilationCache<()> = CompilationCache::new();
        assert_eq!(cache.tier_state(&MethodId(9)), TierState::default());
        assert!(cache.lookup(&MethodId(9)).is_none());
        assert!(cache.is_empty());
    }
}
