//! Per-entry metadata shared by the hot metadata cache, the dirty set and callers.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use crate::clock;

/// Metadata for one cached blob, shared between the hot metadata cache and callers.
#[derive(Debug)]
pub struct Entity {
    key: String,
    storage_id: String,
    size: u64,
    compressed: bool,
    access_time: AtomicU64,
    dirty: AtomicBool,
}

impl Entity {
    pub fn new(
        key: impl Into<String>,
        storage_id: impl Into<String>,
        access_time: u64,
        size: u64,
        compressed: bool,
    ) -> Self {
        Self {
            key: key.into(),
            storage_id: storage_id.into(),
            size,
            compressed,
            access_time: AtomicU64::new(access_time),
            dirty: AtomicBool::new(false),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn storage_id(&self) -> &str {
        &self.storage_id
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn is_compressed(&self) -> bool {
        self.compressed
    }

    pub fn access_time(&self) -> u64 {
        self.access_time.load(Ordering::Acquire)
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    /// Stamp the entity as used now. Only the in-memory copy changes; the index writes the new
    /// access time back to the catalog on its next flush.
    pub fn register_access(&self) {
        self.access_time.fetch_max(clock::now_micros(), Ordering::AcqRel);
        self.dirty.store(true, Ordering::Release);
    }

    /// Clear the dirty flag, returning the access time to persist if it was set.
    pub(crate) fn take_dirty(&self) -> Option<u64> {
        if self.dirty.swap(false, Ordering::AcqRel) { Some(self.access_time()) } else { None }
    }

    pub(crate) fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::Release);
    }
}
