//! Bounded two-queue cache.
//!
//! Admission-controlled LRU: new keys enter a small FIFO `recent` queue and
//! only graduate to the LRU `frequent` segment when they come back after
//! eviction (tracked in a ghost list of bare keys). A one-off scan can churn
//! `recent` all day without touching the entries the workload actually
//! reuses.

use std::collections::{HashMap, HashSet, VecDeque};
use std::hash::Hash;
use std::sync::Mutex;

/// Share of capacity reserved for the recent queue.
const RECENT_RATIO: f64 = 0.25;
/// Ghost list size relative to capacity.
const GHOST_RATIO: f64 = 0.5;

/// Thread-safe bounded cache with two-queue admission.
pub struct TwoQueueCache<K, V> {
    inner: Mutex<TwoQueueInner<K, V>>,
}

struct TwoQueueInner<K, V> {
    recent_cap: usize,
    frequent_cap: usize,
    ghost_cap: usize,
    // FIFO admission queue
    recent: VecDeque<K>,
    recent_map: HashMap<K, V>,
    // LRU segment, back = most recently used
    frequent: VecDeque<K>,
    frequent_map: HashMap<K, V>,
    // keys recently evicted from `recent`; membership grants promotion
    ghost: VecDeque<K>,
    ghost_set: HashSet<K>,
}

impl<K, V> TwoQueueCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    /// A cache holding at most `capacity` live entries.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(2);
        let recent_cap = ((capacity as f64 * RECENT_RATIO) as usize).max(1);
        TwoQueueCache {
            inner: Mutex::new(TwoQueueInner {
                recent_cap,
                frequent_cap: capacity - recent_cap,
                ghost_cap: ((capacity as f64 * GHOST_RATIO) as usize).max(1),
                recent: VecDeque::new(),
                recent_map: HashMap::new(),
                frequent: VecDeque::new(),
                frequent_map: HashMap::new(),
                ghost: VecDeque::new(),
                ghost_set: HashSet::new(),
            }),
        }
    }

    pub fn get<Q>(&self, key: &Q) -> Option<V>
    where
        K: std::borrow::Borrow<Q>,
        Q: Eq + Hash + ?Sized,
    {
        let mut inner = self.inner.lock().expect("mutex poisoned");
        if let Some(value) = inner.frequent_map.get(key).cloned() {
            inner.touch_frequent(key);
            return Some(value);
        }
        // a recent hit is served in place; only re-admission promotes
        inner.recent_map.get(key).cloned()
    }

    pub fn insert(&self, key: K, value: V) {
        let mut inner = self.inner.lock().expect("mutex poisoned");
        if inner.frequent_map.contains_key(&key) {
            inner.frequent_map.insert(key.clone(), value);
            inner.touch_frequent(&key);
            return;
        }
        if inner.recent_map.contains_key(&key) {
            inner.recent_map.insert(key, value);
            return;
        }
        if inner.ghost_set.remove(&key) {
            inner.ghost.retain(|ghost| ghost != &key);
            inner.admit_frequent(key, value);
            return;
        }
        inner.admit_recent(key, value);
    }

    pub fn len(&self) -> usize {
        let inner = self.inner.lock().expect("mutex poisoned");
        inner.recent_map.len() + inner.frequent_map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<K, V> TwoQueueInner<K, V>
where
    K: Eq + Hash + Clone,
{
    fn touch_frequent<Q>(&mut self, key: &Q)
    where
        K: std::borrow::Borrow<Q>,
        Q: Eq + Hash + ?Sized,
    {
        if let Some(position) = self
            .frequent
            .iter()
            .position(|candidate| candidate.borrow() == key)
        {
            if let Some(entry) = self.frequent.remove(position) {
                self.frequent.push_back(entry);
            }
        }
    }

    fn admit_recent(&mut self, key: K, value: V) {
        while self.recent.len() >= self.recent_cap {
            if let Some(evicted) = self.recent.pop_front() {
                self.recent_map.remove(&evicted);
                self.remember_ghost(evicted);
            }
        }
        self.recent.push_back(key.clone());
        self.recent_map.insert(key, value);
    }

    fn admit_frequent(&mut self, key: K, value: V) {
        while self.frequent.len() >= self.frequent_cap {
            if let Some(evicted) = self.frequent.pop_front() {
                self.frequent_map.remove(&evicted);
            }
        }
        self.frequent.push_back(key.clone());
        self.frequent_map.insert(key, value);
    }

    fn remember_ghost(&mut self, key: K) {
        while self.ghost.len() >= self.ghost_cap {
            if let Some(expired) = self.ghost.pop_front() {
                self.ghost_set.remove(&expired);
            }
        }
        self.ghost_set.insert(key.clone());
        self.ghost.push_back(key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn holds_and_returns_entries() {
        let cache: TwoQueueCache<String, String> = TwoQueueCache::new(16);
        assert!(cache.is_empty());
        cache.insert("10.0.0.1".into(), "a.example".into());
        cache.insert("10.0.0.2".into(), "b.example".into());
        assert_eq!(cache.get("10.0.0.1"), Some("a.example".into()));
        assert_eq!(cache.get("10.0.0.2"), Some("b.example".into()));
        assert_eq!(cache.get("10.0.0.3"), None);
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn update_replaces_without_growing() {
        let cache: TwoQueueCache<&str, u32> = TwoQueueCache::new(8);
        cache.insert("k", 1);
        cache.insert("k", 2);
        assert_eq!(cache.get("k"), Some(2));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn never_exceeds_capacity() {
        let cache: TwoQueueCache<u32, u32> = TwoQueueCache::new(64);
        for key in 0..1000 {
            cache.insert(key, key);
            // mix in re-admissions so the frequent segment fills too
            if key % 3 == 0 {
                cache.insert(key / 2, key);
            }
            assert!(cache.len() <= 64, "cache grew past capacity at key {key}");
        }
    }

    #[test]
    fn readmission_promotes_to_the_frequent_segment() {
        let cache: TwoQueueCache<u32, u32> = TwoQueueCache::new(8); // recent holds 2
        cache.insert(1, 10);
        cache.insert(2, 20);
        cache.insert(3, 30); // evicts 1 into the ghost list
        assert_eq!(cache.get(&1), None);
        cache.insert(1, 11); // ghost hit: straight to frequent
        for key in 100..110 {
            cache.insert(key, key); // churn the recent queue
        }
        assert_eq!(cache.get(&1), Some(11), "promoted entry survived the scan");
    }

    #[test]
    fn scan_does_not_evict_frequent_entries() {
        let cache: TwoQueueCache<u32, u32> = TwoQueueCache::new(8);
        // establish 1 as frequent via evict + re-admit
        cache.insert(1, 1);
        cache.insert(2, 2);
        cache.insert(3, 3);
        cache.insert(1, 1);
        for key in 1000..1100 {
            cache.insert(key, key);
        }
        assert_eq!(cache.get(&1), Some(1));
    }
}
