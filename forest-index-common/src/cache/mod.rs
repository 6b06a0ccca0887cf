//! A byte-bounded, single-threaded LRU cache for decoded pages.
//!
//! This crate runs on one thread: there is exactly one cooperative call
//! stack driving the builder or a query, so the page cache needs no
//! locking. It is bounded on the summed decoded size of its entries
//! rather than their count, since pages vary widely in point count. The
//! eviction list itself is the reused [crate::lru_cache::Lru]; this
//! module only adds the byte budget and root-page pinning on top.

use crate::error::{CacheInvariantError, CoreError};
use crate::lru_cache::Lru;
use std::collections::HashSet;
use std::hash::Hash;

/// Something a [PageCache] can track the footprint of.
pub trait CacheEntry {
    fn byte_size(&self) -> u64;
}

/// An LRU cache of `V` keyed by `K`, evicting oldest-touched entries once
/// the summed [CacheEntry::byte_size] of its contents exceeds `max_bytes`.
/// Keys in `pinned` are never evicted, no matter how stale - used to keep
/// a page's ancestors (in particular the root) resident, since most
/// queries have to revisit them on every descent.
pub struct PageCache<K, V> {
    lru: Lru<K, V>,
    total_bytes: u64,
    max_bytes: u64,
    pinned: HashSet<K>,
}

impl<K, V> PageCache<K, V>
where
    K: Hash + Eq + Clone,
    V: CacheEntry,
{
    pub fn new(max_bytes: u64) -> Self {
        PageCache {
            lru: Lru::new(),
            total_bytes: 0,
            max_bytes,
            pinned: HashSet::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.lru.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lru.len() == 0
    }

    pub fn total_bytes(&self) -> u64 {
        self.total_bytes
    }

    pub fn get(&self, key: &K) -> Option<&V> {
        self.lru.get(key)
    }

    /// Moves `key` to the most-recently-used position, if present.
    pub fn touch(&mut self, key: &K) -> Option<&mut V> {
        self.lru.touch(key)
    }

    /// Marks `key` as pinned: it will not be considered for eviction
    /// until [PageCache::unpin] is called, even if it is never touched
    /// again. `key` need not already be present.
    pub fn pin(&mut self, key: K) {
        self.pinned.insert(key);
    }

    pub fn unpin(&mut self, key: &K) {
        self.pinned.remove(key);
    }

    /// Inserts `value`, then evicts least-recently-used, unpinned
    /// entries until the cache is back within its byte budget. Returns
    /// the evicted entries so the caller can flush any that are dirty
    /// before they are dropped.
    pub fn insert(&mut self, key: K, value: V) -> Vec<(K, V)> {
        let new_size = value.byte_size();
        if let Some(old) = self.lru.get(&key) {
            self.total_bytes -= old.byte_size();
        }
        self.lru.insert(key, value);
        self.total_bytes += new_size;
        self.evict_to_budget()
    }

    fn evict_to_budget(&mut self) -> Vec<(K, V)> {
        let mut evicted = Vec::new();
        if self.total_bytes <= self.max_bytes {
            return evicted;
        }
        // Lru::iter visits oldest-to-newest; collect candidate keys first
        // since we can't remove while iterating.
        let candidates: Vec<K> = self
            .lru
            .iter()
            .filter(|(k, _)| !self.pinned.contains(*k))
            .map(|(k, _)| k.clone())
            .collect();
        for key in candidates {
            if self.total_bytes <= self.max_bytes {
                break;
            }
            if let Some(value) = self.lru.remove(&key) {
                self.total_bytes -= value.byte_size();
                evicted.push((key, value));
            }
        }
        evicted
    }

    /// Removes and returns `key` unconditionally, bypassing the LRU
    /// order and any pinning. Used when a page is deleted outright
    /// rather than merely evicted.
    pub fn remove(&mut self, key: &K) -> Option<V> {
        let value = self.lru.remove(key)?;
        self.total_bytes -= value.byte_size();
        self.pinned.remove(key);
        Some(value)
    }

    /// Validates that a pinned key is actually present - pinning an
    /// absent key is legal (it just pre-pins a future insert), but
    /// callers that expect the root already loaded can use this to turn
    /// a silent miss into an error.
    pub fn expect_pinned(&self, key: &K) -> Result<(), CoreError> {
        if self.lru.get(key).is_none() {
            return Err(CacheInvariantError {
                message: "expected pinned entry to be present in cache".to_string(),
            }
            .into());
        }
        Ok(())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&K, &V)> {
        self.lru.iter()
    }

    /// Mutable access to every entry, in LRU order, without disturbing
    /// that order - used by [crate::query::engine::QueryEngine::flush]
    /// to write back dirty pages and clear their dirty bit in place.
    pub fn iter_mut(&mut self) -> impl Iterator<Item = (&K, &mut V)> {
        self.lru.iter_mut()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Clone, Debug, PartialEq)]
    struct Blob(u64);
    impl CacheEntry for Blob {
        fn byte_size(&self) -> u64 {
            self.0
        }
    }

    #[test]
    fn evicts_oldest_first_once_over_budget() {
        let mut cache: PageCache<u32, Blob> = PageCache::new(10);
        cache.insert(1, Blob(4));
        cache.insert(2, Blob(4));
        let evicted = cache.insert(3, Blob(4));
        assert_eq!(evicted.len(), 1);
        assert_eq!(evicted[0].0, 1);
        assert!(cache.get(&1).is_none());
        assert!(cache.get(&2).is_some());
        assert!(cache.get(&3).is_some());
    }

    #[test]
    fn pinned_entries_survive_eviction_pressure() {
        let mut cache: PageCache<u32, Blob> = PageCache::new(10);
        cache.pin(1);
        cache.insert(1, Blob(8));
        let evicted = cache.insert(2, Blob(8));
        assert_eq!(evicted.len(), 1);
        assert_eq!(evicted[0].0, 2);
        assert!(cache.get(&1).is_some());
    }

    #[test]
    fn touch_updates_recency_order() {
        let mut cache: PageCache<u32, Blob> = PageCache::new(12);
        cache.insert(1, Blob(4));
        cache.insert(2, Blob(4));
        cache.insert(3, Blob(4));
        cache.touch(&1);
        let evicted = cache.insert(4, Blob(4));
        assert_eq!(evicted[0].0, 2);
    }
}
