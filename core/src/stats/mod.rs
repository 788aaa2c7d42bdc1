//! Cache effectiveness counters.
//!
//! The facade records every lookup outcome, write and eviction here; [`CacheStats::snapshot`]
//! hands out a serialisable copy for diagnostics.

use std::time::{Instant, SystemTime, UNIX_EPOCH};

use serde::Serialize;
use tracing::warn;

#[derive(Debug)]
struct StatsInner {
    started_at: Instant,
    memory_hits: u64,
    disk_hits: u64,
    misses: u64,
    writes: u64,
    bytes_written: u64,
    removals: u64,
    evictions: u64,
    disk_usage: u64,
    disk_capacity: u64,
    memory_bytes: u64,
}

impl Default for StatsInner {
    fn default() -> Self {
        Self {
            started_at: Instant::now(),
            memory_hits: 0,
            disk_hits: 0,
            misses: 0,
            writes: 0,
            bytes_written: 0,
            removals: 0,
            evictions: 0,
            disk_usage: 0,
            disk_capacity: 0,
            memory_bytes: 0,
        }
    }
}

/// Where a lookup was answered from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lookup {
    Memory,
    Disk,
    Miss,
}

/// Thread-safe counter collection.
#[derive(Debug, Default)]
pub struct CacheStats {
    inner: parking_lot::Mutex<StatsInner>,
}

impl CacheStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_lookup(&self, outcome: Lookup) {
        let mut guard = self.inner.lock();
        let counter = match outcome {
            Lookup::Memory => &mut guard.memory_hits,
            Lookup::Disk => &mut guard.disk_hits,
            Lookup::Miss => &mut guard.misses,
        };
        *counter = counter.saturating_add(1);
    }

    pub fn record_write(&self, bytes: u64) {
        let mut guard = self.inner.lock();
        guard.writes = guard.writes.saturating_add(1);
        guard.bytes_written = guard.bytes_written.saturating_add(bytes);
    }

    pub fn record_removals(&self, count: usize) {
        let mut guard = self.inner.lock();
        guard.removals = guard.removals.saturating_add(count as u64);
    }

    pub fn record_evictions(&self, count: usize) {
        let mut guard = self.inner.lock();
        guard.evictions = guard.evictions.saturating_add(count as u64);
    }

    /// Update the usage gauges.
    pub fn update_usage(&self, disk_usage: u64, disk_capacity: u64, memory_bytes: usize) {
        let mut guard = self.inner.lock();
        guard.disk_usage = disk_usage;
        guard.disk_capacity = disk_capacity;
        guard.memory_bytes = memory_bytes as u64;
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let guard = self.inner.lock();

        let hits = guard.memory_hits + guard.disk_hits;
        let requests = hits + guard.misses;
        let hit_ratio = hits as f32 / requests.max(1) as f32;

        StatsSnapshot {
            timestamp_ms: now_ms(),
            uptime_ms: guard.started_at.elapsed().as_millis() as u64,
            requests,
            memory_hits: guard.memory_hits,
            disk_hits: guard.disk_hits,
            misses: guard.misses,
            hit_ratio,
            writes: guard.writes,
            bytes_written: guard.bytes_written,
            removals: guard.removals,
            evictions: guard.evictions,
            disk_usage: guard.disk_usage,
            disk_capacity: guard.disk_capacity,
            memory_bytes: guard.memory_bytes,
        }
    }
}

fn now_ms() -> u64 {
    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(delta) => delta.as_millis() as u64,
        Err(err) => {
            warn!("system clock error: {err}");
            0
        }
    }
}

/// Immutable copy of the counters.
#[derive(Debug, Clone, Serialize)]
pub struct StatsSnapshot {
    pub timestamp_ms: u64,
    pub uptime_ms: u64,
    pub requests: u64,
    pub memory_hits: u64,
    pub disk_hits: u64,
    pub misses: u64,
    pub hit_ratio: f32,
    pub writes: u64,
    pub bytes_written: u64,
    pub removals: u64,
    pub evictions: u64,
    pub disk_usage: u64,
    pub disk_capacity: u64,
    pub memory_bytes: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookups_feed_hit_ratio() {
        let stats = CacheStats::new();
        stats.record_lookup(Lookup::Memory);
        stats.record_lookup(Lookup::Disk);
        stats.record_lookup(Lookup::Miss);
        stats.record_lookup(Lookup::Miss);

        let snap = stats.snapshot();
        assert_eq!(snap.requests, 4);
        assert!((snap.hit_ratio - 0.5).abs() < f32::EPSILON);
    }

    #[test]
    fn writes_and_usage_are_tracked() {
        let stats = CacheStats::new();
        stats.record_write(100);
        stats.record_write(28);
        stats.record_evictions(2);
        stats.update_usage(128, 1024, 64);

        let snap = stats.snapshot();
        assert_eq!(snap.writes, 2);
        assert_eq!(snap.bytes_written, 128);
        assert_eq!(snap.evictions, 2);
        assert_eq!(snap.disk_capacity, 1024);
        let json = serde_json::to_value(&snap).unwrap();
        assert_eq!(json["memory_bytes"], 64);
    }
}
