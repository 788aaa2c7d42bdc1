//! Two-tier blob cache: an in-memory value cache in front of the durable index.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use tracing::{debug, info, warn};
use url::Url;

use crate::config::CacheConfig;
use crate::error::CacheError;
use crate::index::{BatchOutcome, Index, StoreReceipt};
use crate::stats::{CacheStats, Lookup, StatsSnapshot};
use crate::storage::{BlobStorage, FileContext, FileStorage};
use crate::types::{BackendKind, CacheKey, MemoryBudget, TrimLevel};

use super::Result;
use super::memory::MemoryCache;

/// Lookups per `get` when a concurrent store keeps moving the row to a new blob.
const READ_ATTEMPTS: usize = 4;

/// Per-item overrides for [`DiskCache::set_with`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SetOptions {
    /// Compress this item regardless of the storage policy and the cache-wide default.
    pub compress: Option<bool>,
}

impl SetOptions {
    pub fn compressed(compress: bool) -> Self {
        Self { compress: Some(compress) }
    }
}

/// Handle to an open cache root. Share it through an `Arc`; dropping the last handle flushes
/// pending access times.
#[derive(Debug)]
pub struct DiskCache {
    root: PathBuf,
    backend: BackendKind,
    index: Index,
    memory: Mutex<MemoryCache>,
    compressed: AtomicBool,
    ready: AtomicBool,
    stats: CacheStats,
}

impl DiskCache {
    /// Open the cache described by `config`, storing blobs in the default file layout.
    pub fn open(config: CacheConfig) -> Result<Self> {
        config.validate()?;
        let storage = FileStorage::new(&config.root)
            .map_err(|err| CacheError::corrupt(&config.root, err))?
            .with_compression_level(config.compression_level);
        Self::open_with_storage(config, Box::new(storage))
    }

    /// Open the cache with a caller-provided blob storage.
    pub fn open_with_storage(config: CacheConfig, storage: Box<dyn BlobStorage>) -> Result<Self> {
        config.validate()?;
        fs::create_dir_all(&config.root).map_err(|err| CacheError::corrupt(&config.root, err))?;

        let files = Arc::new(FileContext::new("file", storage));
        let index = Index::open(&config.root, config.backend, files, config.index_config())?;
        let memory = MemoryCache::new(config.memory_budget());
        let cache = Self {
            root: config.root,
            backend: config.backend,
            index,
            memory: Mutex::new(memory),
            compressed: AtomicBool::new(config.compressed),
            ready: AtomicBool::new(true),
            stats: CacheStats::new(),
        };
        cache.refresh_usage();
        info!(root = %cache.root.display(), backend = ?cache.backend, "disk cache ready");
        Ok(cache)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn backend(&self) -> BackendKind {
        self.backend
    }

    /// Whether the cache accepts operations; false once closed.
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    pub fn get(&self, url: &Url) -> Result<Option<Arc<[u8]>>> {
        self.get_key(&CacheKey::from_url(url))
    }

    pub fn set(&self, url: &Url, bytes: &[u8]) -> Result<StoreReceipt> {
        self.set_key(&CacheKey::from_url(url), bytes, SetOptions::default())
    }

    pub fn set_with(&self, url: &Url, bytes: &[u8], options: SetOptions) -> Result<StoreReceipt> {
        self.set_key(&CacheKey::from_url(url), bytes, options)
    }

    pub fn remove(&self, url: &Url) -> Result<bool> {
        self.remove_key(&CacheKey::from_url(url))
    }

    pub fn contains(&self, url: &Url) -> Result<bool> {
        self.contains_key(&CacheKey::from_url(url))
    }

    pub fn storage_id_for(&self, url: &Url) -> Result<Option<String>> {
        self.ensure_ready()?;
        self.index.storage_id_for_key(CacheKey::from_url(url).as_str())
    }

    /// Bytes cached for `key`, from memory when possible. A catalog row whose blob has gone
    /// missing is dropped and reported as a miss.
    pub fn get_key(&self, key: &CacheKey) -> Result<Option<Arc<[u8]>>> {
        self.ensure_ready()?;
        let key = key.as_str();

        let cached = self.memory.lock().get(key);
        if let Some(value) = cached {
            if let Some(entity) = self.index.resident(key) {
                self.index.register_access(&entity);
            }
            self.stats.record_lookup(Lookup::Memory);
            return Ok(Some(value));
        }

        for _ in 0..READ_ATTEMPTS {
            let Some(entity) = self.index.lookup(key)? else {
                break;
            };
            let Some(bytes) = self.index.read_blob(&entity)? else {
                if self.index.discard(&entity)? {
                    warn!(key, storage_id = entity.storage_id(), "blob missing, dropped its row");
                    self.refresh_usage();
                    break;
                }
                // The row moved to a new blob after the lookup; resolve it again.
                continue;
            };

            let value: Arc<[u8]> = bytes.into();
            self.remember(key, Arc::clone(&value), entity.storage_id());
            self.index.register_access(&entity);
            self.stats.record_lookup(Lookup::Disk);
            return Ok(Some(value));
        }

        self.stats.record_lookup(Lookup::Miss);
        Ok(None)
    }

    /// Store `bytes` under `key` and keep a copy in memory.
    pub fn set_key(
        &self,
        key: &CacheKey,
        bytes: &[u8],
        options: SetOptions,
    ) -> Result<StoreReceipt> {
        self.ensure_ready()?;
        let key = key.as_str();
        let compress = self.compression_for(key, options);

        let receipt = self.index.store(key, bytes, compress)?;
        self.forget(&receipt.evicted);
        self.remember(key, Arc::from(bytes), &receipt.storage_id);
        self.stats.record_write(receipt.size);
        self.stats.record_evictions(receipt.evicted.len());
        self.refresh_usage();
        Ok(receipt)
    }

    pub fn remove_key(&self, key: &CacheKey) -> Result<bool> {
        self.ensure_ready()?;
        let key = key.as_str();
        let removed = self.index.remove(key);
        self.memory.lock().remove(key);
        if let Ok(true) = removed {
            self.stats.record_removals(1);
        }
        self.refresh_usage();
        removed
    }

    pub fn contains_key(&self, key: &CacheKey) -> Result<bool> {
        self.ensure_ready()?;
        if self.memory.lock().contains(key.as_str()) {
            return Ok(true);
        }
        Ok(self.index.lookup(key.as_str())?.is_some())
    }

    /// Store several items on one catalog pass. Each item succeeds or fails on its own.
    pub fn set_many<'a>(
        &self,
        items: impl IntoIterator<Item = (&'a Url, &'a [u8])>,
    ) -> Result<BatchOutcome<StoreReceipt>> {
        self.ensure_ready()?;
        let keyed: Vec<(CacheKey, &[u8])> =
            items.into_iter().map(|(url, bytes)| (CacheKey::from_url(url), bytes)).collect();
        let batch: Vec<(&str, &[u8], bool)> = keyed
            .iter()
            .map(|(key, bytes)| {
                (key.as_str(), *bytes, self.compression_for(key.as_str(), SetOptions::default()))
            })
            .collect();

        let outcome = self.index.store_batch(&batch);
        for ((key, bytes), (_, result)) in keyed.iter().zip(&outcome.items) {
            if let Ok(receipt) = result {
                self.forget(&receipt.evicted);
                self.remember(key.as_str(), Arc::from(*bytes), &receipt.storage_id);
                self.stats.record_write(receipt.size);
                self.stats.record_evictions(receipt.evicted.len());
            }
        }
        self.refresh_usage();
        Ok(outcome)
    }

    pub fn remove_many<'a>(
        &self,
        urls: impl IntoIterator<Item = &'a Url>,
    ) -> Result<BatchOutcome<bool>> {
        self.ensure_ready()?;
        let keys: Vec<CacheKey> = urls.into_iter().map(CacheKey::from_url).collect();
        let refs: Vec<&str> = keys.iter().map(CacheKey::as_str).collect();

        let outcome = self.index.remove_batch(&refs);
        {
            let mut memory = self.memory.lock();
            for key in &refs {
                memory.remove(key);
            }
        }
        let removed = outcome.items.iter().filter(|(_, result)| matches!(result, Ok(true))).count();
        self.stats.record_removals(removed);
        self.refresh_usage();
        Ok(outcome)
    }

    /// Remove every entry whose key contains `fragment`, or every entry whose key does not when
    /// `excluding` is set. Returns the removed keys.
    pub fn remove_matching(&self, fragment: &str, excluding: bool) -> Result<Vec<String>> {
        self.ensure_ready()?;
        let removed = self.index.remove_by_fragment(fragment, excluding)?;
        self.forget(&removed);
        self.stats.record_removals(removed.len());
        self.refresh_usage();
        Ok(removed)
    }

    /// Write pending access times to the catalog.
    pub fn flush(&self) -> Result<usize> {
        self.ensure_ready()?;
        self.index.flush()
    }

    /// Flush and stop accepting operations. Closing twice is a no-op.
    pub fn close(&self) -> Result<()> {
        if !self.ready.swap(false, Ordering::AcqRel) {
            return Ok(());
        }
        self.memory.lock().clear();
        let flushed = self.index.flush()?;
        info!(root = %self.root.display(), flushed, "disk cache closed");
        Ok(())
    }

    /// Delete blobs no catalog row points at, e.g. after a crash between writing bytes and
    /// committing their row, along with temp files of writes that never finished.
    pub fn reclaim_orphans(&self) -> Result<usize> {
        self.ensure_ready()?;
        self.index.reclaim_orphans()
    }

    pub fn len(&self) -> Result<usize> {
        self.ensure_ready()?;
        self.index.len()
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Sum of the stored sizes of every entry.
    pub fn current_disk_usage(&self) -> u64 {
        self.index.current_disk_usage()
    }

    /// Usage recomputed from the catalog rows rather than the running counter.
    pub fn catalog_usage(&self) -> Result<u64> {
        self.ensure_ready()?;
        self.index.catalog_usage()
    }

    pub fn disk_cache_size(&self) -> u64 {
        self.index.disk_capacity()
    }

    /// Change the disk capacity, trimming straight away when usage is above it.
    pub fn set_disk_cache_size(&self, bytes: u64) -> Vec<String> {
        let evicted = self.index.set_disk_capacity(bytes);
        self.forget(&evicted);
        self.stats.record_evictions(evicted.len());
        self.refresh_usage();
        evicted
    }

    pub fn memory_cache_size(&self) -> usize {
        self.memory.lock().budget().bytes_max
    }

    pub fn set_memory_cache_size(&self, bytes: usize) {
        let mut memory = self.memory.lock();
        let budget = MemoryBudget { bytes_max: bytes, ..memory.budget() };
        memory.set_budget(budget);
    }

    pub fn set_memory_entry_limit(&self, limit: Option<usize>) {
        let mut memory = self.memory.lock();
        let budget = MemoryBudget { entries_max: limit, ..memory.budget() };
        memory.set_budget(budget);
    }

    pub fn memory_bytes_used(&self) -> usize {
        self.memory.lock().bytes_used()
    }

    pub fn trim_level(&self) -> TrimLevel {
        self.index.trim_level()
    }

    pub fn set_trim_level(&self, level: TrimLevel) {
        self.index.set_trim_level(level);
    }

    pub fn is_compressed(&self) -> bool {
        self.compressed.load(Ordering::Relaxed)
    }

    /// Change the default for items stored from now on.
    pub fn set_compressed(&self, compressed: bool) {
        self.compressed.store(compressed, Ordering::Relaxed);
    }

    pub fn set_entry_cache_count_limit(&self, limit: usize) {
        self.index.set_entry_cache_count_limit(limit);
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.refresh_usage();
        self.stats.snapshot()
    }

    fn ensure_ready(&self) -> Result<()> {
        if self.is_ready() { Ok(()) } else { Err(CacheError::NotReady) }
    }

    fn compression_for(&self, key: &str, options: SetOptions) -> bool {
        options.compress.unwrap_or_else(|| self.index.should_compress(key, self.is_compressed()))
    }

    fn remember(&self, key: &str, value: Arc<[u8]>, storage_id: &str) {
        let mut memory = self.memory.lock();
        // A concurrent store or remove may have replaced the row in the meantime.
        if memory.insert(key, value) && !self.is_current(key, storage_id) {
            memory.remove(key);
        }
    }

    /// Whether `key` still resolves to `storage_id`. Asks the catalog when the entity has been
    /// pushed out of the hot metadata cache.
    fn is_current(&self, key: &str, storage_id: &str) -> bool {
        if let Some(entity) = self.index.resident(key) {
            return entity.storage_id() == storage_id;
        }
        match self.index.storage_id_for_key(key) {
            Ok(current) => current.as_deref() == Some(storage_id),
            Err(err) => {
                warn!(key, error = %err, "could not confirm value, not keeping it in memory");
                false
            }
        }
    }

    fn forget(&self, keys: &[String]) {
        if keys.is_empty() {
            return;
        }
        let mut memory = self.memory.lock();
        for key in keys {
            memory.remove(key);
        }
        debug!(count = keys.len(), "dropped evicted values from memory");
    }

    fn refresh_usage(&self) {
        self.stats.update_usage(
            self.index.current_disk_usage(),
            self.index.disk_capacity(),
            self.memory.lock().bytes_used(),
        );
    }
}

impl Drop for DiskCache {
    fn drop(&mut self) {
        if self.ready.swap(false, Ordering::AcqRel) {
            if let Err(err) = self.index.flush() {
                warn!(error = %err, "failed to flush access times on drop");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TrimFractions;

    fn url(path: &str) -> Url {
        Url::parse(&format!("https://cdn.example.com/{path}")).unwrap()
    }

    fn open(root: &Path) -> DiskCache {
        DiskCache::open(CacheConfig::at(root).with_disk_cache_size(10_000)).expect("open cache")
    }

    #[test]
    fn handle_is_shareable() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<DiskCache>();
    }

    #[test]
    fn values_are_written_through_to_memory() -> Result<()> {
        let temp = tempfile::tempdir().unwrap();
        let cache = open(temp.path());
        cache.set(&url("a.png"), b"pixels")?;
        assert_eq!(cache.memory_bytes_used(), 6);

        assert_eq!(cache.get(&url("a.png"))?.as_deref(), Some(&b"pixels"[..]));
        let stats = cache.stats();
        assert_eq!(stats.memory_hits, 1);
        assert_eq!(stats.disk_usage, 6);
        Ok(())
    }

    #[test]
    fn caller_storage_receives_blobs() -> Result<()> {
        let temp = tempfile::tempdir().unwrap();
        let storage = Arc::new(FileStorage::new(temp.path().join("elsewhere")).unwrap());
        let cache = DiskCache::open_with_storage(
            CacheConfig::at(temp.path()),
            Box::new(Arc::clone(&storage)),
        )?;
        assert_eq!(cache.root(), temp.path());

        let receipt = cache.set(&url("a.png"), b"pixels")?;
        assert_eq!(storage.list()?, vec![receipt.storage_id]);
        Ok(())
    }

    #[test]
    fn memory_tier_works_without_hot_metadata() -> Result<()> {
        let temp = tempfile::tempdir().unwrap();
        let cache = DiskCache::open(CacheConfig::at(temp.path()).with_entry_cache_count_limit(0))?;
        cache.set(&url("a.png"), b"pixels")?;
        assert_eq!(cache.memory_bytes_used(), 6);

        cache.get(&url("a.png"))?;
        cache.get(&url("a.png"))?;
        let stats = cache.stats();
        assert_eq!(stats.memory_hits, 2);
        assert_eq!(stats.disk_hits, 0);
        Ok(())
    }

    #[test]
    fn disk_is_read_when_memory_misses() -> Result<()> {
        let temp = tempfile::tempdir().unwrap();
        let cache = open(temp.path());
        cache.set_memory_cache_size(0);
        cache.set(&url("a.png"), b"pixels")?;
        assert_eq!(cache.memory_bytes_used(), 0);

        assert_eq!(cache.get(&url("a.png"))?.as_deref(), Some(&b"pixels"[..]));
        assert_eq!(cache.stats().disk_hits, 1);
        Ok(())
    }

    #[test]
    fn per_item_compression_overrides_default() -> Result<()> {
        let temp = tempfile::tempdir().unwrap();
        let cache = DiskCache::open(CacheConfig::at(temp.path()).with_compressed(true))?;
        let plain = cache.set_with(&url("plain"), &[1; 64], SetOptions::compressed(false))?;
        let packed = cache.set(&url("packed"), &[1; 64])?;
        assert!(!plain.compressed);
        assert!(packed.compressed);
        assert_eq!(cache.current_disk_usage(), 128);
        Ok(())
    }

    #[test]
    fn missing_blob_heals_the_catalog() -> Result<()> {
        let temp = tempfile::tempdir().unwrap();
        let cache = open(temp.path());
        cache.set_memory_cache_size(0);
        let receipt = cache.set(&url("gone"), b"bytes")?;

        let storage = FileStorage::new(temp.path()).unwrap();
        fs::remove_file(storage.path_for(&receipt.storage_id).unwrap()).unwrap();

        assert!(cache.get(&url("gone"))?.is_none());
        assert!(!cache.contains(&url("gone"))?);
        assert_eq!(cache.current_disk_usage(), 0);
        Ok(())
    }

    #[test]
    fn closed_cache_rejects_operations() -> Result<()> {
        let temp = tempfile::tempdir().unwrap();
        let cache = open(temp.path());
        cache.set(&url("a"), b"1")?;
        cache.close()?;
        cache.close()?;

        assert!(!cache.is_ready());
        assert!(matches!(cache.get(&url("a")), Err(CacheError::NotReady)));
        assert!(matches!(cache.set(&url("b"), b"2"), Err(CacheError::NotReady)));
        Ok(())
    }

    #[test]
    fn invalid_config_is_rejected_before_opening() {
        let temp = tempfile::tempdir().unwrap();
        let config = CacheConfig::at(temp.path())
            .with_trim_fractions(TrimFractions { low: 0.0, middle: 0.7, high: 0.9 });
        assert!(matches!(DiskCache::open(config), Err(CacheError::InvalidConfig(_))));
        assert!(!temp.path().join("catalog.sqlite3").exists());
    }

    #[test]
    fn corrupt_catalog_prevents_open() {
        let temp = tempfile::tempdir().unwrap();
        fs::write(temp.path().join("catalog.sqlite3"), b"definitely not sqlite").unwrap();
        let err = DiskCache::open(CacheConfig::at(temp.path())).unwrap_err();
        assert!(matches!(err, CacheError::CatalogCorrupt { .. }));
    }
}
