//! Deduplication and retention stores.
//!
//! Three structures are provided:
//!
//! 1. [`MonotonicGuard`]: per-symbol non-decreasing timestamp filter used by
//!    the market data feed within one connection epoch.
//! 2. [`TtlStore`]: bounded, time-windowed key/value store. Entries expire
//!    after `ttl_us` and the oldest entry is evicted once `capacity` is
//!    reached, so memory stays flat under sustained load. Backs the gateway's
//!    idempotency-key retention.
//! 3. [`FillDedup`]: `TtlStore` keyed by the xxHash64 of a fill id, used by
//!    the scheduler for at-least-once fill delivery.

use std::collections::VecDeque;
use std::hash::Hash;

use ahash::AHashMap;

// ---------------------------------------------------------------------------
// MonotonicGuard: per-symbol timestamp ordering
// ---------------------------------------------------------------------------

/// Accepts a tick only if its timestamp is not older than the last accepted
/// tick for the same symbol.
///
/// Not thread-safe. The feed's normalizer thread owns its instance.
pub struct MonotonicGuard {
    last_ts: AHashMap<String, u64>,
}

impl MonotonicGuard {
    pub fn new() -> Self {
        Self { last_ts: AHashMap::new() }
    }

    /// Returns `true` (and records `ts`) if `ts` is >= the last accepted
    /// timestamp for `symbol`.
    #[inline]
    pub fn check_and_update(&mut self, symbol: &str, ts: u64) -> bool {
        match self.last_ts.get_mut(symbol) {
            Some(last) if ts < *last => false,
            Some(last) => {
                *last = ts;
                true
            }
            None => {
                self.last_ts.insert(symbol.to_string(), ts);
                true
            }
        }
    }

    pub fn last_ts(&self, symbol: &str) -> Option<u64> {
        self.last_ts.get(symbol).copied()
    }

    /// Forget all symbols (called when a new connection epoch starts).
    pub fn reset(&mut self) {
        self.last_ts.clear();
    }
}

impl Default for MonotonicGuard {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// TtlStore: bounded, time-windowed map
// ---------------------------------------------------------------------------

/// Bounded map whose entries expire after a retention window.
///
/// Insertion order is tracked in a queue; re-inserting a key refreshes its
/// timestamp and leaves a stale queue slot behind that is skipped on
/// eviction. The queue is compacted when stale slots dominate.
pub struct TtlStore<K, V> {
    entries: AHashMap<K, (V, u64)>,
    order: VecDeque<(K, u64)>,
    capacity: usize,
    ttl_us: u64,
}

impl<K, V> TtlStore<K, V>
where
    K: Eq + Hash + Clone,
{
    /// `capacity` is clamped to at least 1.
    pub fn new(capacity: usize, ttl_us: u64) -> Self {
        let capacity = capacity.max(1);
        Self {
            entries: AHashMap::with_capacity(capacity.min(1 << 16)),
            order: VecDeque::new(),
            capacity,
            ttl_us,
        }
    }

    /// Look up a live entry.
    pub fn get(&self, key: &K, now_us: u64) -> Option<&V> {
        self.entries
            .get(key)
            .filter(|(_, ts)| now_us.saturating_sub(*ts) < self.ttl_us)
            .map(|(v, _)| v)
    }

    pub fn contains(&self, key: &K, now_us: u64) -> bool {
        self.get(key, now_us).is_some()
    }

    /// Insert or refresh an entry, evicting expired and (if full) oldest ones.
    pub fn insert(&mut self, key: K, value: V, now_us: u64) {
        self.purge_expired(now_us);
        if !self.entries.contains_key(&key) {
            while self.entries.len() >= self.capacity {
                if !self.evict_front() {
                    break;
                }
            }
        }
        self.entries.insert(key.clone(), (value, now_us));
        self.order.push_back((key, now_us));
        if self.order.len() > self.capacity * 2 {
            self.compact();
        }
    }

    pub fn remove(&mut self, key: &K) -> Option<V> {
        self.entries.remove(key).map(|(v, _)| v)
    }

    /// Drop every entry older than the retention window.
    pub fn purge_expired(&mut self, now_us: u64) {
        while let Some((_, ts)) = self.order.front() {
            if now_us.saturating_sub(*ts) < self.ttl_us {
                break;
            }
            self.evict_front();
        }
    }

    /// Live entries (expired-but-not-purged entries are counted until the
    /// next mutation).
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Iterate live entries.
    pub fn iter(&self, now_us: u64) -> impl Iterator<Item = (&K, &V)> + '_ {
        let ttl = self.ttl_us;
        self.entries
            .iter()
            .filter(move |(_, (_, ts))| now_us.saturating_sub(*ts) < ttl)
            .map(|(k, (v, _))| (k, v))
    }

    /// Pop the oldest queue slot, removing the map entry if the slot is current.
    fn evict_front(&mut self) -> bool {
        let Some((key, ts)) = self.order.pop_front() else {
            return false;
        };
        if matches!(self.entries.get(&key), Some((_, cur)) if *cur == ts) {
            self.entries.remove(&key);
        }
        true
    }

    fn compact(&mut self) {
        let entries = &self.entries;
        self.order
            .retain(|(k, ts)| matches!(entries.get(k), Some((_, cur)) if cur == ts));
    }
}

// ---------------------------------------------------------------------------
// FillDedup: hashed fill ids
// ---------------------------------------------------------------------------

/// Bounded, time-windowed fill-id deduplicator.
///
/// Fill ids are hashed with xxHash64; a hash collision inside the window
/// would drop a genuine fill, which at 64 bits is negligible for the window
/// sizes used here.
pub struct FillDedup {
    seen: TtlStore<u64, ()>,
}

impl FillDedup {
    pub fn new(capacity: usize, ttl_us: u64) -> Self {
        Self { seen: TtlStore::new(capacity, ttl_us) }
    }

    #[inline]
    fn hash_id(fill_id: &str) -> u64 {
        xxhash_rust::xxh64::xxh64(fill_id.as_bytes(), 0)
    }

    /// Returns `true` the first time a fill id is seen inside the window.
    pub fn check_and_insert(&mut self, fill_id: &str, now_us: u64) -> bool {
        let h = Self::hash_id(fill_id);
        if self.seen.contains(&h, now_us) {
            return false;
        }
        self.seen.insert(h, (), now_us);
        true
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}
