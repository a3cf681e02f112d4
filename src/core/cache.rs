//! LRU cache of decoded payloads
//!
//! Entries are keyed by [`Locator`] and hold the raw (decoded) bytes behind an
//! `Arc`, so a hit hands out a cheap clone. The cache is split into shards,
//! each behind its own mutex; a locator always maps to the same shard. With a
//! single shard eviction follows exact least-recently-used order.
//!
//! The cache never touches block files. Keeping it coherent with deletes and
//! compaction is the manager's job.

use crate::locator::Locator;
use ahash::RandomState;
use lru::LruCache;
use parking_lot::Mutex;
use std::hash::BuildHasher;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Cache statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    /// Entries currently resident
    pub entries: usize,
    pub capacity: usize,
}

impl CacheStats {
    /// Calculate hit rate as a percentage
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            (self.hits as f64 / total as f64) * 100.0
        }
    }
}

pub struct BlockCache {
    shards: Vec<Mutex<LruCache<Locator, Arc<[u8]>>>>,
    hasher: RandomState,
    capacity: usize,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl BlockCache {
    /// Create a cache holding at most `capacity` payloads across `shards` partitions
    ///
    /// Capacity is distributed exactly; the shard count is clamped to
    /// `1..=capacity`.
    pub fn new(capacity: usize, shards: usize) -> Self {
        let capacity = capacity.max(1);
        let shard_count = shards.clamp(1, capacity);

        let base = capacity / shard_count;
        let extra = capacity % shard_count;
        let shards = (0..shard_count)
            .map(|i| {
                let cap = base + usize::from(i < extra);
                // cap >= 1 because shard_count <= capacity
                let cap = NonZeroUsize::new(cap).unwrap_or(NonZeroUsize::MIN);
                Mutex::new(LruCache::new(cap))
            })
            .collect();

        BlockCache {
            shards,
            hasher: RandomState::new(),
            capacity,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    fn shard(&self, locator: &Locator) -> &Mutex<LruCache<Locator, Arc<[u8]>>> {
        if self.shards.len() == 1 {
            return &self.shards[0];
        }
        let idx = self.hasher.hash_one(locator) as usize % self.shards.len();
        &self.shards[idx]
    }

    /// Look up a payload, marking it most recently used
    pub fn get(&self, locator: &Locator) -> Option<Arc<[u8]>> {
        let hit = self.shard(locator).lock().get(locator).cloned();
        match hit {
            Some(_) => self.hits.fetch_add(1, Ordering::Relaxed),
            None => self.misses.fetch_add(1, Ordering::Relaxed),
        };
        hit
    }

    /// Insert or refresh a payload, evicting the least recently used entry when full
    pub fn put(&self, locator: Locator, bytes: Arc<[u8]>) {
        let evicted = self.shard(&locator).lock().push(locator, bytes);
        if let Some((old_key, _)) = evicted {
            // push returns the replaced value for an existing key too
            if old_key != locator {
                self.evictions.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Remove an entry; returns whether one was present
    pub fn invalidate(&self, locator: &Locator) -> bool {
        self.shard(locator).lock().pop(locator).is_some()
    }

    /// Whether an entry is resident, without touching recency or stats
    pub fn contains(&self, locator: &Locator) -> bool {
        self.shard(locator).lock().contains(locator)
    }

    pub fn clear(&self) {
        for shard in &self.shards {
            shard.lock().clear();
        }
    }

    pub fn len(&self) -> usize {
        self.shards.iter().map(|shard| shard.lock().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            entries: self.len(),
            capacity: self.capacity,
        }
    }
}
