//! Sharded per-method map.
//!
//! Splits per-method state across a power-of-two number of `RwLock`ed
//! `FxHashMap`s so that callers working on different methods rarely touch the
//! same lock. Values are expected to carry their own interior mutability
//! (atomics, nested locks), so the fast path only ever takes a read lock:
//! the write lock is taken once per method, on first observation.

use std::hash::{Hash, Hasher};
use std::sync::RwLock;

use rustc_hash::{FxHashMap, FxHasher};

use crate::types::MethodId;

type Shard<V> = RwLock<FxHashMap<MethodId, V>>;

#[derive(Debug)]
pub(crate) struct ShardedMap<V> {
    shards: Box<[Shard<V>]>,
    mask: usize,
}

impl<V> ShardedMap<V> {
    /// Create a map with `shards` shards, rounded up to a power of two.
    pub(crate) fn with_shards(shards: usize) -> Self {
        let count = shards.max(1).next_power_of_two();
        let shards: Box<[Shard<V>]> = (0..count)
            .map(|_| RwLock::new(FxHashMap::default()))
            .collect();
        Self {
            shards,
            mask: count.saturating_sub(1),
        }
    }

    fn shard(&self, id: &MethodId) -> &Shard<V> {
        let mut hasher = FxHasher::default();
        id.hash(&mut hasher);
        let mask = u64::try_from(self.mask).unwrap_or(u64::MAX);
        let index = usize::try_from(hasher.finish() & mask).unwrap_or_default();
        #[expect(clippy::indexing_slicing, reason = "index is masked to the shard count")]
        let shard = &self.shards[index];
        shard
    }

    /// Run `f` on the value for `id`, if present. Read lock only.
    pub(crate) fn with<R>(&self, id: &MethodId, f: impl FnOnce(&V) -> R) -> Option<R> {
        #[expect(clippy::unwrap_used, reason = "RwLock poisoning is unrecoverable")]
        let shard = self.shard(id).read().unwrap();
        shard.get(id).map(f)
    }

    /// Number of distinct methods stored.
    pub(crate) fn len(&self) -> usize {
        self.shards
            .iter()
            .map(|shard| {
                #[expect(clippy::unwrap_used, reason = "RwLock poisoning is unrecoverable")]
                let shard = shard.read().unwrap();
                shard.len()
            })
            .sum()
    }

    /// All stored method ids, in no particular order.
    pub(crate) fn keys(&self) -> Vec<MethodId> {
        let mut keys = Vec::new();
        for shard in self.shards.iter() {
            #[expect(clippy::unwrap_used, reason = "RwLock poisoning is unrecoverable")]
            let shard = shard.read().unwrap();
            keys.extend(shard.keys().copied());
        }
        keys
    }
}

impl<V: Default> ShardedMap<V> {
    /// Run `f` on the value for `id`, creating a default value first if the
    /// method has never been seen.
    ///
    /// Fast path: read lock for already-seen methods.
    /// Slow path: write lock for first-seen methods (double-checked through
    /// the entry API after the upgrade).
    pub(crate) fn with_or_insert<R>(&self, id: &MethodId, f: impl FnOnce(&V) -> R) -> R {
        let shard = self.shard(id);
        {
            #[expect(clippy::unwrap_used, reason = "RwLock poisoning is unrecoverable")]
            let entries = shard.read().unwrap();
            if let Some(value) = entries.get(id) {
                return f(value);
            }
        }

        #[expect(clippy::unwrap_used, reason = "RwLock poisoning is unrecoverable")]
        let mut entries = shard.write().unwrap();
        f(entries.entry(*id).or_default())
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
    use std::sync::atomic::{AtomicU64, Ordering};

    #[test]
    fn test_shard_count_rounds_up() {
        let map: ShardedMap<AtomicU64> = ShardedMap::with_shards(5);
        assert_eq!(map.shards.len(), 8);
        let map: ShardedMap<AtomicU64> = ShardedMap::with_shards(0);
        assert_eq!(map.shards.len(), 1);
    }

    #[test]
    fn test_with_or_insert_creates_once() {
        let map: ShardedMap<AtomicU64> = ShardedMap::with_shards(4);
        let id = MethodId(7);

        assert!(map.with(&id, |v| v.load(Ordering::Relaxed)).is_none());
        map.with_or_insert(&id, |v| v.fetch_add(1, Ordering::Relaxed));
        map.with_or_insert(&id, |v| v.fetch_add(1, Ordering::Relaxed));

        assert_eq!(map.with(&id, |v| v.load(Ordering::Relaxed)), Some(2));
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn test_keys_cover_all_shards() {
        let map: ShardedMap<AtomicU64> = ShardedMap::with_shards(16);
        for raw in 0..100 {
            map.with_or_insert(&MethodId(raw), |_| ());
        }
        let mut keys = map.keys();
        keys.sort();
        assert_eq!(keys.len(), 100);
        assert_eq!(keys.first(), Some(&MethodId(0)));
        assert_eq!(keys.last(), Some(&MethodId(99)));
    }
}
