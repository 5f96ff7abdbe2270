//! Fixed-capacity FIFO cache
//!
//! Memoizes loads inside reader stages. Eviction is pure insertion order:
//! hits and updates never refresh an entry.

use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::hash::Hash;
use std::sync::Arc;

use crate::error::{HighwayError, Result};

/// Hit/miss/eviction counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
}

impl CacheStats {
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

/// Statistics handle that can outlive the cache and be shared by every
/// worker of a stage
pub type SharedCacheStats = Arc<Mutex<CacheStats>>;

/// Bounded cache evicting the oldest inserted entry
pub struct FifoCache<K, V> {
    entries: HashMap<K, V>,
    order: VecDeque<K>,
    capacity: usize,
    stats: SharedCacheStats,
}

impl<K, V> FifoCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    /// Create an empty cache holding at most `capacity` entries
    pub fn new(capacity: usize) -> Result<Self> {
        Self::with_stats(capacity, SharedCacheStats::default())
    }

    /// Create a cache that records into an existing statistics handle
    pub fn with_stats(capacity: usize, stats: SharedCacheStats) -> Result<Self> {
        if capacity == 0 {
            return Err(HighwayError::config("cache capacity must be at least 1"));
        }
        Ok(Self {
            entries: HashMap::with_capacity(capacity),
            order: VecDeque::with_capacity(capacity),
            capacity,
            stats,
        })
    }

    /// Look up a value; O(1)
    pub fn get(&self, key: &K) -> Option<V> {
        let value = self.entries.get(key).cloned();
        let mut stats = self.stats.lock();
        match value {
            Some(_) => stats.hits += 1,
            None => stats.misses += 1,
        }
        value
    }

    /// Insert or update; evicts the oldest entry when over capacity
    ///
    /// An update keeps the entry's original position in the eviction order.
    pub fn set(&mut self, key: K, value: V) {
        if let Some(slot) = self.entries.get_mut(&key) {
            *slot = value;
            return;
        }

        self.order.push_back(key.clone());
        self.entries.insert(key, value);

        while self.entries.len() > self.capacity {
            let Some(oldest) = self.order.pop_front() else {
                break;
            };
            self.entries.remove(&oldest);
            self.stats.lock().evictions += 1;
        }
    }

    pub fn contains(&self, key: &K) -> bool {
        self.entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Snapshot of the statistics
    pub fn stats(&self) -> CacheStats {
        *self.stats.lock()
    }

    pub fn stats_handle(&self) -> SharedCacheStats {
        self.stats.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fifo_eviction() {
        let mut cache = FifoCache::new(3).unwrap();
        for k in ["a", "b", "c", "d"] {
            cache.set(k, k.to_uppercase());
        }

        assert_eq!(cache.len(), 3);
        assert_eq!(cache.get(&"a"), None);
        assert_eq!(cache.get(&"b").as_deref(), Some("B"));
        assert_eq!(cache.get(&"d").as_deref(), Some("D"));
        assert_eq!(cache.stats().evictions, 1);
    }

    #[test]
    fn test_hit_does_not_refresh() {
        let mut cache = FifoCache::new(2).unwrap();
        cache.set(1, 10);
        cache.set(2, 20);
        assert_eq!(cache.get(&1), Some(10));
        cache.set(3, 30);
        assert!(!cache.contains(&1));
        assert!(cache.contains(&2));
    }

    #[test]
    fn test_update_keeps_position() {
        let mut cache = FifoCache::new(2).unwrap();
        cache.set(1, 10);
        cache.set(2, 20);
        cache.set(1, 11);
        assert_eq!(cache.len(), 2);
        cache.set(3, 30);
        assert_eq!(cache.get(&1), None);
        assert_eq!(cache.get(&2), Some(20));
    }

    #[test]
    fn test_zero_capacity_rejected() {
        assert!(FifoCache::<u32, u32>::new(0).is_err());
    }

    #[test]
    fn test_stats() {
        let mut cache = FifoCache::new(4).unwrap();
        cache.set("k", 1);
        cache.get(&"k");
        cache.get(&"missing");
        let stats = cache.stats();
        assert_eq!((stats.hits, stats.misses), (1, 1));
        assert!((stats.hit_rate() - 0.5).abs() < f64::EPSILON);
    }
}
