//! Small bounded object cache evicting by insertion order.

use std::fmt;
use std::hash::Hash;

use hashlink::LinkedHashMap;
use parking_lot::Mutex;

pub const DEFAULT_MAX_COUNT: usize = 256;

/// Thread-safe map holding at most `max_count` values. Inserting beyond the limit drops the
/// least recently inserted value; reads do not change the order.
pub struct StackCache<V, K = String> {
    inner: Mutex<StackInner<K, V>>,
}

struct StackInner<K, V> {
    entries: LinkedHashMap<K, V>,
    max_count: usize,
}

impl<K: Hash + Eq, V> StackInner<K, V> {
    fn shrink_to_limit(&mut self) {
        while self.entries.len() > self.max_count {
            if self.entries.pop_front().is_none() {
                break;
            }
        }
    }
}

impl<V, K: Hash + Eq> fmt::Debug for StackCache<V, K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("StackCache")
            .field("len", &inner.entries.len())
            .field("max_count", &inner.max_count)
            .finish()
    }
}

impl<V, K: Hash + Eq> Default for StackCache<V, K> {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_COUNT)
    }
}

impl<V, K: Hash + Eq> StackCache<V, K> {
    pub fn new(max_count: usize) -> Self {
        Self { inner: Mutex::new(StackInner { entries: LinkedHashMap::new(), max_count }) }
    }

    pub fn max_count(&self) -> usize {
        self.inner.lock().max_count
    }

    /// Change the limit; shrinking evicts the oldest values straight away.
    pub fn set_max_count(&self, max_count: usize) {
        let mut inner = self.inner.lock();
        inner.max_count = max_count;
        inner.shrink_to_limit();
    }

    /// Drop every value.
    pub fn reset(&self) {
        self.inner.lock().entries.clear();
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Insert `value` under `key` as the newest entry. Returns `false` when nothing can be
    /// held because the limit is zero.
    pub fn cache_object(&self, value: V, key: K) -> bool {
        let mut inner = self.inner.lock();
        if inner.max_count == 0 {
            return false;
        }
        inner.entries.remove(&key);
        inner.entries.insert(key, value);
        inner.shrink_to_limit();
        true
    }

    pub fn remove(&self, key: &K) -> Option<V> {
        self.inner.lock().entries.remove(key)
    }

    pub fn contains(&self, key: &K) -> bool {
        self.inner.lock().entries.contains_key(key)
    }
}

impl<V: Clone, K: Hash + Eq> StackCache<V, K> {
    pub fn get(&self, key: &K) -> Option<V> {
        self.inner.lock().entries.get(key).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn evicts_by_insertion_order() {
        let cache: StackCache<u32> = StackCache::new(2);
        assert!(cache.cache_object(1, "a".to_string()));
        assert!(cache.cache_object(2, "b".to_string()));
        assert_eq!(cache.get(&"a".to_string()), Some(1));
        cache.cache_object(3, "c".to_string());

        assert!(!cache.contains(&"a".to_string()));
        assert_eq!(cache.get(&"b".to_string()), Some(2));
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn reinsert_moves_to_newest() {
        let cache: StackCache<u32> = StackCache::new(2);
        cache.cache_object(1, "a".to_string());
        cache.cache_object(2, "b".to_string());
        cache.cache_object(10, "a".to_string());
        cache.cache_object(3, "c".to_string());

        assert_eq!(cache.get(&"a".to_string()), Some(10));
        assert!(!cache.contains(&"b".to_string()));
    }

    #[test]
    fn shrinking_and_reset() {
        let cache: StackCache<u32, u32> = StackCache::default();
        assert_eq!(cache.max_count(), DEFAULT_MAX_COUNT);
        for i in 0..10 {
            cache.cache_object(i, i);
        }
        cache.set_max_count(3);
        assert_eq!(cache.len(), 3);
        assert!(cache.contains(&7) && cache.contains(&9));
        assert_eq!(cache.remove(&8), Some(8));

        cache.reset();
        assert!(cache.is_empty());
        cache.set_max_count(0);
        assert!(!cache.cache_object(1, 1));
    }

    #[test]
    fn shared_across_threads() {
        let cache = Arc::new(StackCache::<usize, usize>::new(64));
        let handles: Vec<_> = (0..4)
            .map(|worker| {
                let cache = Arc::clone(&cache);
                thread::spawn(move || {
                    for i in 0..100 {
                        cache.cache_object(i, worker * 1000 + i);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(cache.len(), 64);
    }
}
