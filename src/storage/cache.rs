//! # Shared Page Cache with Before-Evict Protocol
//!
//! This module implements the process-wide page cache. One cache instance
//! serves every open store: entries are keyed by `(partition, page_id)`,
//! where the partition identifies the owning store (in practice its file
//! path).
//!
//! ## Second-Chance Eviction
//!
//! Strict LRU has a critical flaw for databases: a sequential scan evicts
//! the entire cache. The cache instead uses a second-chance scheme over a
//! "visited" flag:
//!
//! - On access: set the visited flag
//! - On eviction: scan entries with a hand pointer
//!   - visited set: clear it, move the hand forward
//!   - visited clear: this entry is the eviction candidate
//!
//! This approximates LRU by recency of `lookup`/`insert_or_update` while
//! letting scan pages leave quickly.
//!
//! ## Before-Evict Protocol
//!
//! The cache is global, but only the store that owns a page knows whether
//! dropping it is safe: an uncommitted writable page may exist nowhere but
//! memory. Before removing an entry, the cache consults the subscriber
//! registered for the entry's partition:
//!
//! - `EvictionVerdict::Retain` cancels the eviction; the entry is marked
//!   visited and the hand moves on to the next candidate.
//! - `EvictionVerdict::Evict` lets the removal proceed; the subscriber has
//!   either no interest or has taken over durability (for example by
//!   queueing the page to a background writer).
//!
//! Subscribers are held as `Weak` references keyed by partition, so the
//! cache never keeps a closed store alive; a dead subscriber counts as no
//! subscriber. Callbacks run synchronously under the shard lock and must
//! not call back into the cache.
//!
//! If every candidate in a shard cancels, the insert is honored anyway and
//! the shard transiently exceeds its soft capacity.
//!
//! ## Lock Sharding
//!
//! A single lock over the whole cache would serialize every store in the
//! process. The cache uses `CACHE_SHARD_COUNT` independent shards, each a
//! `parking_lot::RwLock` over its own index and entry vector; keys are
//! assigned to shards by hash.
//!
//! ## Thread Safety
//!
//! `PageCache` is `Send + Sync`. The visited flag is an `AtomicBool` so
//! lookups mark recency under the shard read lock.

use std::hash::{Hash, Hasher};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};

use eyre::{ensure, Result};
use hashbrown::HashMap;
use parking_lot::RwLock;

use crate::config::{CACHE_SHARD_COUNT, DEFAULT_CACHE_CAPACITY};

use super::page::Page;

/// Identifies a store within the shared cache; in practice the store's
/// file path. Cheap to clone and hash.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Partition(Arc<str>);

impl Partition {
    pub fn new(path: &Path) -> Self {
        Self(Arc::from(path.to_string_lossy().as_ref()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Partition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PageKey {
    pub partition: Partition,
    pub page_id: u64,
}

impl PageKey {
    pub fn new(partition: Partition, page_id: u64) -> Self {
        Self { partition, page_id }
    }
}

/// Outcome of a before-evict consultation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvictionVerdict {
    /// Drop the entry. The subscriber has no stake in it or has assumed
    /// durability responsibility.
    Evict,
    /// Cancel the eviction and keep the entry resident.
    Retain,
}

/// Subscriber interest in evictions from one partition.
///
/// `cancellable` is false when the cache is being force-cleared: the
/// subscriber may still hand the page off for durability, but the entry
/// is dropped regardless of the verdict.
pub trait EvictionListener: Send + Sync {
    fn before_evict(&self, partition: &Partition, page_id: u64, cancellable: bool)
        -> EvictionVerdict;
}

/// Hit/miss and eviction counters, readable without any cache lock.
#[derive(Debug, Default)]
pub struct CacheStats {
    pub hits: AtomicU64,
    pub misses: AtomicU64,
    pub evictions: AtomicU64,
    pub cancelled_evictions: AtomicU64,
}

impl CacheStats {
    pub fn hit_rate(&self) -> f64 {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        if hits + misses == 0 {
            0.0
        } else {
            hits as f64 / (hits + misses) as f64
        }
    }
}

struct CacheEntry {
    key: PageKey,
    page: Arc<Page>,
    visited: AtomicBool,
}

impl CacheEntry {
    fn new(key: PageKey, page: Arc<Page>) -> Self {
        Self {
            key,
            page,
            visited: AtomicBool::new(true),
        }
    }

    fn mark_visited(&self) {
        self.visited.store(true, Ordering::Release);
    }

    fn clear_visited(&self) -> bool {
        self.visited.swap(false, Ordering::AcqRel)
    }
}

struct CacheShard {
    entries: Vec<CacheEntry>,
    index: HashMap<PageKey, usize>,
    hand: usize,
    capacity: usize,
}

impl CacheShard {
    fn new(capacity: usize) -> Self {
        Self {
            entries: Vec::with_capacity(capacity),
            index: HashMap::with_capacity(capacity),
            hand: 0,
            capacity,
        }
    }

    fn get(&self, key: &PageKey) -> Option<usize> {
        self.index.get(key).copied()
    }

    fn insert(&mut self, entry: CacheEntry) {
        let key = entry.key.clone();
        let idx = self.entries.len();
        self.entries.push(entry);
        self.index.insert(key, idx);
    }

    fn remove(&mut self, idx: usize) -> CacheEntry {
        let entry = self.entries.swap_remove(idx);
        self.index.remove(&entry.key);

        if idx < self.entries.len() {
            let moved_key = self.entries[idx].key.clone();
            self.index.insert(moved_key, idx);
        }

        if self.hand >= self.entries.len() {
            self.hand = 0;
        }

        entry
    }

    fn is_full(&self) -> bool {
        self.entries.len() >= self.capacity
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}

pub struct PageCache {
    shards: Vec<RwLock<CacheShard>>,
    listeners: RwLock<HashMap<Partition, Weak<dyn EvictionListener>>>,
    capacity: usize,
    pub stats: CacheStats,
}

impl PageCache {
    pub fn new(total_capacity: usize) -> Result<Self> {
        ensure!(
            total_capacity >= CACHE_SHARD_COUNT,
            "cache capacity {} must be at least {} (one page per shard)",
            total_capacity,
            CACHE_SHARD_COUNT
        );

        let capacity_per_shard = total_capacity / CACHE_SHARD_COUNT;
        let remainder = total_capacity % CACHE_SHARD_COUNT;

        let shards: Vec<_> = (0..CACHE_SHARD_COUNT)
            .map(|i| {
                let cap = if i < remainder {
                    capacity_per_shard + 1
                } else {
                    capacity_per_shard
                };
                RwLock::new(CacheShard::new(cap))
            })
            .collect();

        Ok(Self {
            shards,
            listeners: RwLock::new(HashMap::new()),
            capacity: total_capacity,
            stats: CacheStats::default(),
        })
    }

    /// The process-wide default instance. Stores take an explicit cache
    /// handle, so tests can supply a fresh one instead.
    pub fn shared() -> &'static Arc<PageCache> {
        static SHARED: OnceLock<Arc<PageCache>> = OnceLock::new();
        SHARED.get_or_init(|| {
            // INVARIANT: DEFAULT_CACHE_CAPACITY >= CACHE_SHARD_COUNT is a compile-time assertion
            Arc::new(PageCache::new(DEFAULT_CACHE_CAPACITY).expect("default cache capacity is valid"))
        })
    }

    fn shard_index(&self, key: &PageKey) -> usize {
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        key.hash(&mut hasher);
        (hasher.finish() as usize) % CACHE_SHARD_COUNT
    }

    fn shard(&self, key: &PageKey) -> &RwLock<CacheShard> {
        &self.shards[self.shard_index(key)]
    }

    /// Registers `listener` for before-evict notifications on `partition`,
    /// replacing any previous registration.
    pub fn subscribe(&self, partition: Partition, listener: Weak<dyn EvictionListener>) {
        self.listeners.write().insert(partition, listener);
    }

    pub fn unsubscribe(&self, partition: &Partition) {
        self.listeners.write().remove(partition);
    }

    /// Looks up a page, recording a hit or miss and refreshing recency.
    pub fn lookup(&self, partition: &Partition, page_id: u64) -> Option<Arc<Page>> {
        let key = PageKey::new(partition.clone(), page_id);
        let shard = self.shard(&key);
        let guard = shard.read();

        match guard.get(&key) {
            Some(idx) => {
                let entry = &guard.entries[idx];
                entry.mark_visited();
                self.stats.hits.fetch_add(1, Ordering::Relaxed);
                Some(Arc::clone(&entry.page))
            }
            None => {
                self.stats.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Inserts a page or replaces the entry already present for its id,
    /// refreshing recency either way. May evict one entry first; if every
    /// candidate cancels, the shard exceeds its soft capacity transiently.
    pub fn insert_or_update(&self, partition: &Partition, page: Arc<Page>) {
        let key = PageKey::new(partition.clone(), page.id());
        let shard = self.shard(&key);
        let mut guard = shard.write();

        if let Some(idx) = guard.get(&key) {
            let entry = &mut guard.entries[idx];
            entry.page = page;
            entry.mark_visited();
            return;
        }

        if guard.is_full() {
            self.evict_one(&mut guard);
        }

        guard.insert(CacheEntry::new(key, page));
    }

    /// Runs the second-chance scan until one entry is evicted or every
    /// entry has been given a chance to cancel. Returns true on eviction.
    fn evict_one(&self, shard: &mut CacheShard) -> bool {
        if shard.entries.is_empty() {
            return false;
        }

        // Two sweeps: one to spend visited flags, one to consult owners.
        let limit = shard.entries.len() * 2;
        let mut steps = 0;

        loop {
            if steps >= limit {
                return false;
            }
            steps += 1;

            let entry = &shard.entries[shard.hand];

            if entry.clear_visited() {
                shard.hand = (shard.hand + 1) % shard.entries.len();
                continue;
            }

            match self.consult(&entry.key, true) {
                EvictionVerdict::Retain => {
                    entry.mark_visited();
                    self.stats.cancelled_evictions.fetch_add(1, Ordering::Relaxed);
                    shard.hand = (shard.hand + 1) % shard.entries.len();
                }
                EvictionVerdict::Evict => {
                    let idx = shard.hand;
                    shard.remove(idx);
                    self.stats.evictions.fetch_add(1, Ordering::Relaxed);
                    return true;
                }
            }
        }
    }

    fn consult(&self, key: &PageKey, cancellable: bool) -> EvictionVerdict {
        let listener = self.listeners.read().get(&key.partition).cloned();
        match listener.and_then(|weak| weak.upgrade()) {
            Some(listener) => listener.before_evict(&key.partition, key.page_id, cancellable),
            None => EvictionVerdict::Evict,
        }
    }

    /// Drops every entry. Subscribers are notified with `cancellable =
    /// false` so they can hand pages off for durability, but the drop
    /// proceeds regardless of the verdict.
    pub fn clear(&self) {
        for shard in &self.shards {
            let mut guard = shard.write();
            for entry in guard.entries.drain(..) {
                self.consult(&entry.key, false);
            }
            guard.index.clear();
            guard.hand = 0;
        }
    }

    pub fn len(&self) -> usize {
        self.shards.iter().map(|s| s.read().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
