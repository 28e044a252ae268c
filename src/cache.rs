//! Bounded in-memory cache with approximate LRU eviction.
//!
//! Each model owns its own caches (feature maps and predictions); nothing is
//! global. Entries carry a last-access stamp; when the cache grows past its
//! cap the oldest ~10% are evicted in one pass.

use std::collections::HashMap;
use std::hash::Hash;

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub size: usize,
    pub max_size: usize,
}

#[derive(Debug)]
pub struct CacheManager<K, V> {
    entries: HashMap<K, (V, u64)>,
    max_size: usize,
    clock: u64,
    hits: u64,
    misses: u64,
}

impl<K, V> CacheManager<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new(max_size: usize) -> Self {
        Self {
            entries: HashMap::new(),
            max_size: max_size.max(1),
            clock: 0,
            hits: 0,
            misses: 0,
        }
    }

    pub fn get(&mut self, key: &K) -> Option<V> {
        self.clock += 1;
        match self.entries.get_mut(key) {
            Some((value, stamp)) => {
                *stamp = self.clock;
                self.hits += 1;
                Some(value.clone())
            }
            None => {
                self.misses += 1;
                None
            }
        }
    }

    pub fn insert(&mut self, key: K, value: V) {
        self.clock += 1;
        self.entries.insert(key, (value, self.clock));
        if self.entries.len() > self.max_size {
            self.evict();
        }
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits,
            misses: self.misses,
            size: self.entries.len(),
            max_size: self.max_size,
        }
    }

    fn evict(&mut self) {
        let n_evict = (self.entries.len() / 10).max(1);
        let mut stamps: Vec<(u64, K)> = self
            .entries
            .iter()
            .map(|(k, (_, stamp))| (*stamp, k.clone()))
            .collect();
        stamps.sort_unstable_by_key(|(stamp, _)| *stamp);
        for (_, key) in stamps.into_iter().take(n_evict) {
            self.entries.remove(&key);
        }
    }
}
