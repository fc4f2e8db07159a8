//! TTL/LRU cache implementation.
//!
//! Entries live in a [`DashMap`] so lookups for absent keys never contend
//! on a lock. Recency is tracked by an arena-backed doubly-linked list
//! guarded by a single mutex. Every map mutation happens while that mutex
//! is held, which linearizes all writers and keeps the list and the map in
//! agreement: a key is in the map if and only if its slot is linked.

use std::hash::Hash;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};
use vigil_core::CacheError;

use crate::config::CacheConfig;
use crate::stats::{CacheStats, StatsCounters};

// ============================================================================
// ENTRIES
// ============================================================================

#[derive(Debug)]
struct Entry<V> {
    value: V,
    /// `None` means the entry only leaves through size eviction or delete.
    expires_at: Option<Instant>,
    /// Slot of this key in the recency list.
    slot: usize,
}

impl<V> Entry<V> {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| now >= at)
    }
}

// ============================================================================
// RECENCY LIST
// ============================================================================

#[derive(Debug)]
struct Node<K> {
    key: K,
    prev: Option<usize>,
    next: Option<usize>,
}

/// Doubly-linked list over a slot arena. Head is most recently used.
#[derive(Debug)]
struct RecencyList<K> {
    nodes: Vec<Option<Node<K>>>,
    free: Vec<usize>,
    head: Option<usize>,
    tail: Option<usize>,
}

impl<K> RecencyList<K> {
    fn new() -> Self {
        Self {
            nodes: Vec::new(),
            free: Vec::new(),
            head: None,
            tail: None,
        }
    }

    fn push_front(&mut self, key: K) -> usize {
        let node = Node {
            key,
            prev: None,
            next: None,
        };
        let slot = match self.free.pop() {
            Some(slot) => {
                self.nodes[slot] = Some(node);
                slot
            }
            None => {
                self.nodes.push(Some(node));
                self.nodes.len() - 1
            }
        };
        self.attach_front(slot);
        slot
    }

    fn move_to_front(&mut self, slot: usize) {
        if self.head == Some(slot) {
            return;
        }
        self.detach(slot);
        self.attach_front(slot);
    }

    fn remove(&mut self, slot: usize) -> Option<K> {
        self.detach(slot);
        let node = self.nodes.get_mut(slot)?.take()?;
        self.free.push(slot);
        Some(node.key)
    }

    fn pop_back(&mut self) -> Option<K> {
        let tail = self.tail?;
        self.remove(tail)
    }

    fn attach_front(&mut self, slot: usize) {
        let old_head = self.head;
        match self.nodes.get_mut(slot).and_then(Option::as_mut) {
            Some(node) => {
                node.prev = None;
                node.next = old_head;
            }
            None => return,
        }
        if let Some(head) = old_head {
            if let Some(node) = self.nodes[head].as_mut() {
                node.prev = Some(slot);
            }
        }
        self.head = Some(slot);
        if self.tail.is_none() {
            self.tail = Some(slot);
        }
    }

    fn detach(&mut self, slot: usize) {
        let (prev, next) = match self.nodes.get(slot).and_then(Option::as_ref) {
            Some(node) => (node.prev, node.next),
            None => return,
        };

        match prev {
            Some(p) => {
                if let Some(node) = self.nodes[p].as_mut() {
                    node.next = next;
                }
            }
            None => self.head = next,
        }
        match next {
            Some(n) => {
                if let Some(node) = self.nodes[n].as_mut() {
                    node.prev = prev;
                }
            }
            None => self.tail = prev,
        }

        if let Some(node) = self.nodes[slot].as_mut() {
            node.prev = None;
            node.next = None;
        }
    }
}

// ============================================================================
// CACHE
// ============================================================================

/// Generic, thread-safe, size-bounded cache with per-entry expiry.
///
/// Guarantees:
/// - at most `capacity` entries are held at any time;
/// - eviction always removes the least recently used entry, so the most
///   recently used one survives as long as anything older remains.
///
/// Expired entries are removed lazily by [`get`](Self::get) and in bulk by
/// the janitor started with [`start_janitor`](Self::start_janitor).
pub struct TtlLruCache<K, V> {
    capacity: usize,
    entries: DashMap<K, Entry<V>>,
    recency: Mutex<RecencyList<K>>,
    stats: StatsCounters,
}

impl<K, V> TtlLruCache<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    /// Create a cache holding at most `capacity` entries.
    ///
    /// A zero capacity is a configuration error and must abort startup.
    pub fn new(capacity: usize) -> Result<Self, CacheError> {
        if capacity == 0 {
            return Err(CacheError::InvalidCapacity { capacity });
        }

        Ok(Self {
            capacity,
            entries: DashMap::with_capacity(capacity.min(4096)),
            recency: Mutex::new(RecencyList::new()),
            stats: StatsCounters::default(),
        })
    }

    /// Create a cache sized from configuration.
    pub fn from_config(config: &CacheConfig) -> Result<Self, CacheError> {
        Self::new(config.capacity)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Insert or replace `key`. A zero `ttl` keeps the entry until it is
    /// evicted by size or deleted.
    pub fn put(&self, key: K, value: V, ttl: Duration) {
        let expires_at = if ttl.is_zero() {
            None
        } else {
            Instant::now().checked_add(ttl)
        };

        let mut list = self.recency.lock();

        let previous_slot = self.entries.get(&key).map(|entry| entry.slot);
        if let Some(slot) = previous_slot {
            list.remove(slot);
        }

        let slot = list.push_front(key.clone());
        self.entries.insert(
            key,
            Entry {
                value,
                expires_at,
                slot,
            },
        );

        while self.entries.len() > self.capacity {
            match list.pop_back() {
                Some(evicted) => {
                    self.entries.remove(&evicted);
                    self.stats.evicted();
                    trace!("Evicted least recently used cache entry");
                }
                None => break,
            }
        }
    }

    /// Look up `key`, promoting it to most recently used.
    ///
    /// An expired entry counts as a miss and is deleted on the spot.
    pub fn get(&self, key: &K) -> Option<V> {
        // Lock-free fast path for keys that are not cached at all.
        if !self.entries.contains_key(key) {
            self.stats.miss();
            return None;
        }

        let mut list = self.recency.lock();

        let found = self
            .entries
            .get(key)
            .map(|entry| (entry.slot, entry.is_expired(Instant::now()), entry.value.clone()));

        match found {
            None => {
                self.stats.miss();
                None
            }
            Some((slot, true, _)) => {
                self.entries.remove(key);
                list.remove(slot);
                self.stats.expired(1);
                self.stats.miss();
                None
            }
            Some((slot, false, value)) => {
                list.move_to_front(slot);
                self.stats.hit();
                Some(value)
            }
        }
    }

    /// Remove `key`. Returns whether an entry was present.
    pub fn delete(&self, key: &K) -> bool {
        let mut list = self.recency.lock();
        match self.entries.remove(key) {
            Some((_, entry)) => {
                list.remove(entry.slot);
                true
            }
            None => false,
        }
    }

    /// Whether `key` has a live entry. Does not touch recency.
    pub fn contains_key(&self, key: &K) -> bool {
        self.entries
            .get(key)
            .is_some_and(|entry| !entry.is_expired(Instant::now()))
    }

    /// Number of entries held, including expired ones not yet swept.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Remove every expired entry. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut list = self.recency.lock();

        let expired: Vec<(K, usize)> = self
            .entries
            .iter()
            .filter(|entry| entry.is_expired(now))
            .map(|entry| (entry.key().clone(), entry.slot))
            .collect();

        for (key, slot) in &expired {
            self.entries.remove(key);
            list.remove(*slot);
        }

        self.stats.expired(expired.len() as u64);
        expired.len()
    }

    pub fn stats(&self) -> CacheStats {
        self.stats.snapshot(self.entries.len())
    }

    /// Spawn a background sweep of expired entries every `interval`.
    ///
    /// Returns `None` without spawning when `interval` is zero. The task
    /// stops when `shutdown` is cancelled or the cache is dropped.
    pub fn start_janitor(
        self: &Arc<Self>,
        interval: Duration,
        shutdown: CancellationToken,
    ) -> Option<JoinHandle<()>> {
        if interval.is_zero() {
            return None;
        }

        let cache = Arc::downgrade(self);
        Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            // The first tick completes immediately.
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        let Some(cache) = cache.upgrade() else {
                            break;
                        };
                        let removed = cache.purge_expired();
                        if removed > 0 {
                            debug!(removed, remaining = cache.len(), "Cache janitor swept expired entries");
                        }
                    }
                }
            }

            trace!("Cache janitor stopped");
        }))
    }
}

// ============================================================================
// TESTS
// ============================================================================
