//! In-memory LRU of recently used blob values.

use std::fmt;
use std::sync::Arc;

use hashlink::LruCache;

use crate::types::MemoryBudget;

/// Called with the key and value of every entry pushed out by the budget.
pub type EvictionListener = Box<dyn Fn(&str, &Arc<[u8]>) + Send + Sync>;

/// LRU keyed by cache key that evicts based on a byte budget and an optional entry cap.
pub struct MemoryCache {
    entries: LruCache<String, Arc<[u8]>>,
    budget: MemoryBudget,
    bytes_used: usize,
    listener: Option<EvictionListener>,
}

impl fmt::Debug for MemoryCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryCache")
            .field("entries", &self.entries.len())
            .field("budget", &self.budget)
            .field("bytes_used", &self.bytes_used)
            .field("listener", &self.listener.is_some())
            .finish()
    }
}

impl MemoryCache {
    /// Construct a cache with the provided memory budget.
    pub fn new(budget: MemoryBudget) -> Self {
        Self { entries: LruCache::new_unbounded(), budget, bytes_used: 0, listener: None }
    }

    pub fn with_listener(mut self, listener: EvictionListener) -> Self {
        self.listener = Some(listener);
        self
    }

    pub fn set_listener(&mut self, listener: Option<EvictionListener>) {
        self.listener = listener;
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.len() == 0
    }

    /// Total bytes held by cached values.
    pub fn bytes_used(&self) -> usize {
        self.bytes_used
    }

    pub fn budget(&self) -> MemoryBudget {
        self.budget
    }

    /// Change the budget, evicting least recently used values until it is met.
    pub fn set_budget(&mut self, budget: MemoryBudget) {
        self.budget = budget;
        self.evict_if_needed();
    }

    /// Retrieve a value, refreshing its recency ordering if present.
    pub fn get(&mut self, key: &str) -> Option<Arc<[u8]>> {
        self.entries.get(key).cloned()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.peek(key).is_some()
    }

    /// Insert or replace a value. Values larger than the byte budget are not cached, and any
    /// stale value under the same key is dropped.
    pub fn insert(&mut self, key: impl Into<String>, value: Arc<[u8]>) -> bool {
        let key = key.into();
        if let Some(existing) = self.entries.remove(&key) {
            self.bytes_used = self.bytes_used.saturating_sub(existing.len());
        }

        let cost = value.len();
        if cost > self.budget.bytes_max || self.budget.entries_max == Some(0) {
            return false;
        }

        self.bytes_used += cost;
        self.entries.insert(key, value);
        self.evict_if_needed();
        true
    }

    /// Remove a value if present. Explicit removal does not notify the listener.
    pub fn remove(&mut self, key: &str) -> Option<Arc<[u8]>> {
        let removed = self.entries.remove(key);
        if let Some(value) = &removed {
            self.bytes_used = self.bytes_used.saturating_sub(value.len());
        }
        removed
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.bytes_used = 0;
    }

    fn over_budget(&self) -> bool {
        self.bytes_used > self.budget.bytes_max
            || self.budget.entries_max.is_some_and(|max| self.entries.len() > max)
    }

    fn evict_if_needed(&mut self) {
        while self.over_budget() {
            let Some((key, oldest)) = self.entries.remove_lru() else {
                break;
            };
            self.bytes_used = self.bytes_used.saturating_sub(oldest.len());
            if let Some(listener) = &self.listener {
                listener(&key, &oldest);
            }
        }
    }
}
