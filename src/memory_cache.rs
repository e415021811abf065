//! In-memory cache of decoded containers
//!
//! Strict LRU bounded by both total cost (bytes) and entry count. Cost is
//! the container's own estimate (4 bytes per pixel when dimensions are
//! known). Entries may carry a TTL; expired entries read as misses and are
//! removed lazily on access. Under platform memory pressure callers invoke
//! [`MemoryCache::remove_all`] to drop everything.
//!
//! The map and the LRU ordering live behind one short critical section;
//! cost is computed before the lock is taken.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::debug;

use crate::container::ImageContainer;
use crate::keys::MemoryCacheKey;
use crate::traits::ImageCaching;

/// Fraction of the cost limit any single entry may occupy.
const DEFAULT_ENTRY_COST_FRACTION: f64 = 0.1;

struct Entry {
    container: ImageContainer,
    cost: u64,
    expires_at: Option<Instant>,
    access_seq: u64,
}

impl Entry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|expires_at| now > expires_at)
    }
}

struct LruState {
    map: HashMap<MemoryCacheKey, Entry>,
    /// Access sequence → key; the first entry is the least recently used.
    order: BTreeMap<u64, MemoryCacheKey>,
    next_seq: u64,
    total_cost: u64,
}

impl LruState {
    fn touch(&mut self, key: &MemoryCacheKey) {
        let seq = self.next_seq;
        self.next_seq += 1;
        if let Some(entry) = self.map.get_mut(key) {
            self.order.remove(&entry.access_seq);
            entry.access_seq = seq;
            self.order.insert(seq, key.clone());
        }
    }

    fn remove(&mut self, key: &MemoryCacheKey) -> Option<Entry> {
        let entry = self.map.remove(key)?;
        self.order.remove(&entry.access_seq);
        self.total_cost -= entry.cost;
        Some(entry)
    }

    fn pop_lru(&mut self) -> Option<MemoryCacheKey> {
        let (&seq, _) = self.order.iter().next()?;
        let key = self.order.remove(&seq)?;
        if let Some(entry) = self.map.remove(&key) {
            self.total_cost -= entry.cost;
        }
        Some(key)
    }
}

/// Counters exposed by [`MemoryCache::stats`].
#[derive(Debug, Clone, Default)]
pub struct MemoryCacheStats {
    pub hits: u64,
    pub misses: u64,
    pub writes: u64,
    pub evictions: u64,
    pub total_cost: u64,
    pub count: usize,
}

/// Cost-bounded LRU cache of [`ImageContainer`]s.
pub struct MemoryCache {
    cost_limit: u64,
    count_limit: usize,
    entry_cost_limit: u64,
    default_ttl: Option<Duration>,
    state: Mutex<LruState>,
    hits: AtomicU64,
    misses: AtomicU64,
    writes: AtomicU64,
    evictions: AtomicU64,
}

impl MemoryCache {
    /// Default cost limit: 256 MiB, unbounded count.
    #[must_use]
    pub fn new() -> Self {
        Self::with_limits(256 * 1024 * 1024, usize::MAX)
    }

    #[must_use]
    pub fn with_limits(cost_limit: u64, count_limit: usize) -> Self {
        #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let entry_cost_limit = ((cost_limit as f64) * DEFAULT_ENTRY_COST_FRACTION).max(1.0) as u64;
        Self {
            cost_limit,
            count_limit: count_limit.max(1),
            entry_cost_limit,
            default_ttl: None,
            state: Mutex::new(LruState {
                map: HashMap::new(),
                order: BTreeMap::new(),
                next_seq: 0,
                total_cost: 0,
            }),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            writes: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    /// Apply a TTL to every entry stored from now on.
    #[must_use]
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.default_ttl = Some(ttl);
        self
    }

    /// Store with an explicit TTL overriding the cache default.
    pub fn put_with_ttl(
        &self,
        key: MemoryCacheKey,
        container: ImageContainer,
        ttl: Option<Duration>,
    ) {
        let cost = container.cost();
        if cost > self.entry_cost_limit {
            debug!(key = %key, cost, "entry exceeds per-entry cost cap, not cached");
            return;
        }
        let expires_at = ttl.or(self.default_ttl).map(|ttl| Instant::now() + ttl);
        let mut evicted = 0u64;
        {
            let mut state = self.state.lock();
            state.remove(&key);
            let seq = state.next_seq;
            state.next_seq += 1;
            state.map.insert(
                key.clone(),
                Entry {
                    container,
                    cost,
                    expires_at,
                    access_seq: seq,
                },
            );
            state.order.insert(seq, key);
            state.total_cost += cost;
            while state.total_cost > self.cost_limit || state.map.len() > self.count_limit {
                if state.pop_lru().is_none() {
                    break;
                }
                evicted += 1;
            }
        }
        self.writes.fetch_add(1, Ordering::Relaxed);
        if evicted > 0 {
            self.evictions.fetch_add(evicted, Ordering::Relaxed);
            debug!(count = evicted, "evicted least recently used entries");
        }
    }

    #[must_use]
    pub fn stats(&self) -> MemoryCacheStats {
        let state = self.state.lock();
        MemoryCacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            writes: self.writes.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            total_cost: state.total_cost,
            count: state.map.len(),
        }
    }

    #[must_use]
    pub fn total_cost(&self) -> u64 {
        self.state.lock().total_cost
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.state.lock().map.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for MemoryCache {
    fn default() -> Self {
        Self::new()
    }
}

impl ImageCaching for MemoryCache {
    fn get(&self, key: &MemoryCacheKey) -> Option<ImageContainer> {
        let now = Instant::now();
        let mut state = self.state.lock();
        let expired = state.map.get(key).is_some_and(|entry| entry.is_expired(now));
        if expired {
            state.remove(key);
            drop(state);
            self.misses.fetch_add(1, Ordering::Relaxed);
            return None;
        }
        if let Some(entry) = state.map.get(key) {
            let container = entry.container.clone();
            state.touch(key);
            drop(state);
            self.hits.fetch_add(1, Ordering::Relaxed);
            Some(container)
        } else {
            drop(state);
            self.misses.fetch_add(1, Ordering::Relaxed);
            None
        }
    }

    fn put(&self, key: MemoryCacheKey, container: ImageContainer) {
        self.put_with_ttl(key, container, None);
    }

    fn remove(&self, key: &MemoryCacheKey) {
        self.state.lock().remove(key);
    }

    fn remove_all(&self) {
        let mut state = self.state.lock();
        state.map.clear();
        state.order.clear();
        state.total_cost = 0;
        debug!("memory cache cleared");
    }
}
