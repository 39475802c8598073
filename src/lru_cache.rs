//! # LRU Cache
//!
//! A bounded Least Recently Used cache shared between concurrent queries.
//!
//! Recency is tracked with a monotonically increasing access counter stored
//! per entry, so a hit only needs the shared read lock. Inserts and evictions
//! take the write lock. Eviction is an O(n) scan for the smallest counter,
//! which is fine for the few hundred entries the query layer keeps. Entries
//! still being computed are evicted last.
//!
//! Each entry holds a single-assignment slot: concurrent callers asking for
//! the same missing key share one computation instead of racing.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use once_cell::sync::OnceCell;

type Slot<V> = Arc<OnceCell<Arc<V>>>;

#[derive(Debug)]
struct CacheEntry<V> {
    slot: Slot<V>,
    last_access: AtomicU64,
}

/// A thread-safe LRU cache with at-most-one computation per key.
#[derive(Debug)]
pub struct LruCache<K, V> {
    capacity: usize,
    entries: RwLock<HashMap<K, CacheEntry<V>>>,
    access_counter: AtomicU64,
}

impl<K: Eq + Hash + Clone, V> LruCache<K, V> {
    /// Create a new LRU cache with the given capacity (at least 1).
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            entries: RwLock::new(HashMap::with_capacity(capacity)),
            access_counter: AtomicU64::new(0),
        }
    }

    fn tick(&self) -> u64 {
        self.access_counter.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Return the cached value for `key`, computing it on a miss.
    ///
    /// Only one caller runs `compute` for a given key; others asking for the
    /// same key meanwhile block until it finishes and receive the same value.
    /// A failed computation leaves nothing behind, so the next call retries.
    pub fn get_or_compute<E, F>(&self, key: K, compute: F) -> Result<Arc<V>, E>
    where
        F: FnOnce() -> Result<V, E>,
    {
        let slot = self.slot_for(&key);
        let result = slot
            .get_or_try_init(|| compute().map(Arc::new))
            .map(Arc::clone);
        if result.is_err() {
            self.discard_pending(&key, &slot);
        }
        result
    }

    /// Clear all entries from the cache.
    pub fn clear(&self) {
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        self.access_counter.store(0, Ordering::Relaxed);
    }

    /// Get the number of entries in the cache.
    pub fn len(&self) -> usize {
        self.entries.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Check if the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Check if the cache contains a key (computed or in flight).
    pub fn contains(&self, key: &K) -> bool {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(key)
    }

    /// Find or create the slot for `key`, refreshing recency.
    fn slot_for(&self, key: &K) -> Slot<V> {
        {
            let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
            if let Some(entry) = entries.get(key) {
                entry.last_access.store(self.tick(), Ordering::Relaxed);
                return Arc::clone(&entry.slot);
            }
        }

        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        // Another caller may have inserted between the two locks
        if let Some(entry) = entries.get(key) {
            entry.last_access.store(self.tick(), Ordering::Relaxed);
            return Arc::clone(&entry.slot);
        }
        if entries.len() >= self.capacity {
            Self::evict_oldest(&mut entries);
        }
        let slot: Slot<V> = Arc::new(OnceCell::new());
        entries.insert(
            key.clone(),
            CacheEntry {
                slot: Arc::clone(&slot),
                last_access: AtomicU64::new(self.tick()),
            },
        );
        slot
    }

    /// Drop an entry whose computation failed, unless it was replaced.
    fn discard_pending(&self, key: &K, slot: &Slot<V>) {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        let stale = entries
            .get(key)
            .map(|entry| Arc::ptr_eq(&entry.slot, slot) && entry.slot.get().is_none())
            .unwrap_or(false);
        if stale {
            entries.remove(key);
        }
    }

    /// Evict the least recently used entry.
    ///
    /// Finished entries go first; an in-flight slot is only evicted when
    /// every entry is still computing.
    fn evict_oldest(entries: &mut HashMap<K, CacheEntry<V>>) {
        let oldest_key = entries
            .iter()
            .min_by_key(|(_, entry)| (entry.slot.get().is_none(), entry.last_access.load(Ordering::Relaxed)))
            .map(|(k, _)| k.clone());

        if let Some(key) = oldest_key {
            entries.remove(&key);
        }
    }
}
