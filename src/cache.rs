// Copyright 2024 The silt Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// See the License for the specific language governing permissions and
// limitations under the License.

use hashbrown::HashMap;
use std::hash::Hash;
use std::sync::Mutex;

/// A thread-safe cache mapping keys to cheaply-clonable values.
pub trait Cache<K, V>: Send + Sync
where
    K: Send + Sync,
    V: Send + Sync + Clone,
{
    /// Inserts a value, evicting old entries if over capacity.
    fn insert(&self, key: K, value: V) -> V;

    /// Looks up a key, marking it recently used.
    fn get(&self, key: &K) -> Option<V>;

    /// Removes an entry if present.
    fn erase(&self, key: &K);

    /// The number of cached entries.
    fn len(&self) -> usize;
}

struct LRUInner<K, V> {
    // value + last-used tick
    map: HashMap<K, (V, u64)>,
    tick: u64,
}

/// A least-recently-used cache holding at most `capacity` entries.
pub struct LRUCache<K, V> {
    capacity: usize,
    inner: Mutex<LRUInner<K, V>>,
}

impl<K: Hash + Eq + Clone, V> LRUCache<K, V> {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "capacity must be positive");
        Self {
            capacity,
            inner: Mutex::new(LRUInner {
                map: HashMap::new(),
                tick: 0,
            }),
        }
    }
}

impl<K, V> Cache<K, V> for LRUCache<K, V>
where
    K: Hash + Eq + Clone + Send + Sync,
    V: Clone + Send + Sync,
{
    fn insert(&self, key: K, value: V) -> V {
        let mut inner = self.inner.lock().unwrap();
        inner.tick += 1;
        let tick = inner.tick;
        inner.map.insert(key, (value.clone(), tick));
        while inner.map.len() > self.capacity {
            // evict the stalest entry
            if let Some(oldest) = inner
                .map
                .iter()
                .min_by_key(|(_, (_, t))| *t)
                .map(|(k, _)| k.clone())
            {
                inner.map.remove(&oldest);
            } else {
                break;
            }
        }
        value
    }

    fn get(&self, key: &K) -> Option<V> {
        let mut inner = self.inner.lock().unwrap();
        inner.tick += 1;
        let tick = inner.tick;
        match inner.map.get_mut(key) {
            Some((v, t)) => {
                *t = tick;
                Some(v.clone())
            }
            None => None,
        }
    }

    fn erase(&self, key: &K) {
        let mut inner = self.inner.lock().unwrap();
        inner.map.remove(key);
    }

    fn len(&self) -> usize {
        self.inner.lock().unwrap().map.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_get_erase() {
        let cache: LRUCache<u64, String> = LRUCache::new(4);
        cache.insert(1, "one".to_owned());
        cache.insert(2, "two".to_owned());
        assert_eq!(cache.get(&1).as_deref(), Some("one"));
        assert_eq!(cache.get(&3), None);
        cache.erase(&1);
        assert_eq!(cache.get(&1), None);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_eviction_prefers_stale_entries() {
        let cache: LRUCache<u64, u64> = LRUCache::new(3);
        cache.insert(1, 10);
        cache.insert(2, 20);
        cache.insert(3, 30);
        // touch 1 so 2 becomes the stalest
        cache.get(&1);
        cache.insert(4, 40);
        assert_eq!(cache.len(), 3);
        assert_eq!(cache.get(&2), None);
        assert_eq!(cache.get(&1), Some(10));
        assert_eq!(cache.get(&3), Some(30));
        assert_eq!(cache.get(&4), Some(40));
    }

    #[test]
    fn test_reinsert_updates_value() {
        let cache: LRUCache<u64, u64> = LRUCache::new(2);
        cache.insert(1, 10);
        cache.insert(1, 11);
        assert_eq!(cache.get(&1), Some(11));
        assert_eq!(cache.len(), 1);
    }
}
