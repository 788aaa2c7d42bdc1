//! Durable catalog of cached blobs: membership, disk usage accounting and eviction.
//!
//! Every mutation runs on the catalog context. Bytes are written before the row that points at
//! them is committed, and rows are deleted before their bytes, so a crash can leave an orphaned
//! blob but never a row without bytes. Orphans are removed by [`Index::reclaim_orphans`].

pub mod backend;
pub mod entity;
pub mod snapshot;
pub mod sqlite;

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use hashlink::LruCache;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

pub use backend::{CatalogBackend, CatalogRow, NewEntry, open_backend};
pub use entity::Entity;
pub use snapshot::SnapshotCatalog;
pub use sqlite::SqliteCatalog;

use crate::clock;
use crate::context::SerialContext;
use crate::error::CacheError;
use crate::storage::FileContext;
use crate::types::{BackendKind, TrimFractions, TrimLevel};

pub type Result<T> = crate::Result<T>;

/// Rows fetched per trim scan query.
const TRIM_BATCH: usize = 32;

/// Sizing and eviction settings for an [`Index`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct IndexConfig {
    pub disk_capacity: u64,
    pub trim_level: TrimLevel,
    pub trim_fractions: TrimFractions,
    pub entry_cache_count_limit: usize,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            disk_capacity: 512 * 1024 * 1024,
            trim_level: TrimLevel::default(),
            trim_fractions: TrimFractions::default(),
            entry_cache_count_limit: 512,
        }
    }
}

/// Result of a successful [`Index::store`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreReceipt {
    pub key: String,
    pub storage_id: String,
    pub size: u64,
    pub compressed: bool,
    /// Whether an older blob for the same key was replaced.
    pub replaced: bool,
    /// Keys evicted by the trim pass this store triggered.
    pub evicted: Vec<String>,
    /// Disk usage once the store and its trim pass settled.
    pub usage: u64,
    pub capacity: u64,
}

impl StoreReceipt {
    pub fn is_over_capacity(&self) -> bool {
        self.usage > self.capacity
    }

    /// Report [`CacheError::CapacityExceededDespiteTrim`] when trimming could not bring usage
    /// under capacity. The item itself stays stored either way.
    pub fn check_capacity(&self) -> Result<()> {
        if self.is_over_capacity() {
            return Err(CacheError::CapacityExceededDespiteTrim {
                usage: self.usage,
                capacity: self.capacity,
            });
        }
        Ok(())
    }
}

/// Independent per-item results of a batch operation, in input order.
#[derive(Debug)]
pub struct BatchOutcome<T> {
    pub items: Vec<(String, Result<T>)>,
}

impl<T> BatchOutcome<T> {
    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn succeeded(&self) -> usize {
        self.items.iter().filter(|(_, result)| result.is_ok()).count()
    }

    pub fn all_succeeded(&self) -> bool {
        self.items.iter().all(|(_, result)| result.is_ok())
    }

    pub fn failures(&self) -> impl Iterator<Item = (&str, &CacheError)> {
        self.items
            .iter()
            .filter_map(|(key, result)| result.as_ref().err().map(|err| (key.as_str(), err)))
    }

    pub fn get(&self, key: &str) -> Option<&Result<T>> {
        self.items.iter().find(|(item, _)| item == key).map(|(_, result)| result)
    }
}

struct CatalogState {
    backend: Box<dyn CatalogBackend>,
    usage: u64,
    capacity: u64,
    trim_level: TrimLevel,
    fractions: TrimFractions,
}

impl CatalogState {
    fn target(&self) -> u64 {
        self.fractions.target(self.capacity, self.trim_level)
    }
}

/// Rows removed from the catalog and the blob deletes that failed afterwards.
struct Removal {
    rows: Vec<CatalogRow>,
    delete_failures: Vec<(String, CacheError)>,
}

/// Catalog, hot metadata cache and eviction engine.
pub struct Index {
    catalog: SerialContext<CatalogState>,
    files: Arc<FileContext>,
    hot: Mutex<LruCache<String, Arc<Entity>>>,
    dirty: Mutex<HashMap<String, Arc<Entity>>>,
    usage: AtomicU64,
    capacity: AtomicU64,
    id_counter: AtomicU64,
}

impl std::fmt::Debug for Index {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Index")
            .field("catalog", &self.catalog)
            .field("files", &self.files)
            .field("usage", &self.usage.load(Ordering::Relaxed))
            .field("capacity", &self.capacity.load(Ordering::Relaxed))
            .finish()
    }
}

impl Index {
    /// Open the catalog of `kind` under `root`.
    pub fn open(
        root: &Path,
        kind: BackendKind,
        files: Arc<FileContext>,
        config: IndexConfig,
    ) -> Result<Self> {
        let backend = open_backend(kind, root)?;
        Self::new(backend, files, config)
    }

    /// Build an index over an already opened catalog backend.
    pub fn new(
        mut backend: Box<dyn CatalogBackend>,
        files: Arc<FileContext>,
        config: IndexConfig,
    ) -> Result<Self> {
        let usage = backend.total_size()?;
        clock::observe(backend.newest_access_time()?);
        info!(
            backend = ?backend.kind(),
            entries = backend.len()?,
            usage,
            capacity = config.disk_capacity,
            "opened cache index"
        );

        let state = CatalogState {
            backend,
            usage,
            capacity: config.disk_capacity,
            trim_level: config.trim_level,
            fractions: config.trim_fractions,
        };
        Ok(Self {
            catalog: SerialContext::new("catalog", state),
            files,
            hot: Mutex::new(LruCache::new(config.entry_cache_count_limit)),
            dirty: Mutex::new(HashMap::new()),
            usage: AtomicU64::new(usage),
            capacity: AtomicU64::new(config.disk_capacity),
            id_counter: AtomicU64::new(0),
        })
    }

    /// Sum of the sizes of every live entry.
    pub fn current_disk_usage(&self) -> u64 {
        self.usage.load(Ordering::Acquire)
    }

    pub fn disk_capacity(&self) -> u64 {
        self.capacity.load(Ordering::Acquire)
    }

    pub fn trim_level(&self) -> TrimLevel {
        self.catalog.run(|state| state.trim_level)
    }

    /// Recompute usage from the catalog rows.
    pub fn catalog_usage(&self) -> Result<u64> {
        self.catalog.run(|state| state.backend.total_size())
    }

    pub fn len(&self) -> Result<usize> {
        self.catalog.run(|state| state.backend.len())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Resolve the entity for `key`, from the hot metadata cache when resident.
    pub fn lookup(&self, key: &str) -> Result<Option<Arc<Entity>>> {
        if let Some(entity) = self.hot.lock().get(key).cloned() {
            return Ok(Some(entity));
        }

        self.catalog.run(|state| {
            let Some(row) = state.backend.select(key)? else {
                return Ok(None);
            };
            let mut hot = self.hot.lock();
            if let Some(entity) = hot.get(key) {
                return Ok(Some(Arc::clone(entity)));
            }
            let entity = Arc::new(entity_from_row(row));
            hot.insert(key.to_string(), Arc::clone(&entity));
            Ok(Some(entity))
        })
    }

    /// The entity for `key` if it is already resident in the hot metadata cache.
    pub fn resident(&self, key: &str) -> Option<Arc<Entity>> {
        self.hot.lock().peek(key).cloned()
    }

    /// Storage id of the blob backing `key`.
    pub fn storage_id_for_key(&self, key: &str) -> Result<Option<String>> {
        Ok(self.lookup(key)?.map(|entity| entity.storage_id().to_string()))
    }

    /// Mark `entity` as used now; the new access time is persisted on the next flush.
    pub fn register_access(&self, entity: &Arc<Entity>) {
        entity.register_access();
        self.dirty.lock().insert(entity.key().to_string(), Arc::clone(entity));
    }

    /// Whether `key` should be stored compressed, given the cache-wide default.
    pub fn should_compress(&self, key: &str, default: bool) -> bool {
        self.files.run(|storage| storage.should_compress(key, default))
    }

    /// Read the bytes behind `entity`.
    pub fn read_blob(&self, entity: &Entity) -> Result<Option<Vec<u8>>> {
        self.files.run(|storage| storage.read(entity.storage_id(), entity.is_compressed()))
    }

    /// Persist `bytes` for `key` and commit its catalog row, then trim if over capacity.
    pub fn store(&self, key: &str, bytes: &[u8], compress: bool) -> Result<StoreReceipt> {
        self.catalog.run(|state| self.store_in(state, key, bytes, compress))
    }

    /// Store several items as one unit on the catalog context. Each item succeeds or fails on
    /// its own.
    pub fn store_batch(&self, items: &[(&str, &[u8], bool)]) -> BatchOutcome<StoreReceipt> {
        self.catalog.run(|state| BatchOutcome {
            items: items
                .iter()
                .map(|(key, bytes, compress)| {
                    (key.to_string(), self.store_in(state, key, bytes, *compress))
                })
                .collect(),
        })
    }

    /// Remove `key`. Returns whether a row existed. The row is gone even when deleting its
    /// bytes fails; that failure is still reported.
    pub fn remove(&self, key: &str) -> Result<bool> {
        self.catalog.run(|state| {
            let mut removal = self.remove_rows_in(state, &[key])?;
            if let Some((_, err)) = removal.delete_failures.pop() {
                return Err(err);
            }
            Ok(!removal.rows.is_empty())
        })
    }

    pub fn remove_batch(&self, keys: &[&str]) -> BatchOutcome<bool> {
        self.catalog.run(|state| BatchOutcome {
            items: keys
                .iter()
                .map(|key| {
                    let result = self.remove_rows_in(state, &[key]).and_then(|mut removal| {
                        match removal.delete_failures.pop() {
                            Some((_, err)) => Err(err),
                            None => Ok(!removal.rows.is_empty()),
                        }
                    });
                    (key.to_string(), result)
                })
                .collect(),
        })
    }

    /// Remove every key containing `fragment`, or every key not containing it when
    /// `excluding` is set, in one catalog transaction. Returns the removed keys.
    pub fn remove_by_fragment(&self, fragment: &str, excluding: bool) -> Result<Vec<String>> {
        self.catalog.run(|state| {
            let rows = state.backend.select_by_fragment(fragment, excluding)?;
            let keys: Vec<&str> = rows.iter().map(|row| row.key.as_str()).collect();
            let removal = self.remove_rows_in(state, &keys)?;
            for (key, err) in &removal.delete_failures {
                warn!(key = %key, error = %err, "blob left behind by fragment removal");
            }
            debug!(fragment, excluding, removed = removal.rows.len(), "removed by fragment");
            Ok(removal.rows.into_iter().map(|row| row.key).collect())
        })
    }

    /// Drop the row for `entity` if it still points at the same blob. Used when the blob turns
    /// out to be missing.
    pub fn discard(&self, entity: &Entity) -> Result<bool> {
        self.catalog.run(|state| {
            match state.backend.select(entity.key())? {
                Some(row) if row.storage_id == entity.storage_id() => {}
                _ => return Ok(false),
            }
            let removal = self.remove_rows_in(state, &[entity.key()])?;
            Ok(!removal.rows.is_empty())
        })
    }

    /// Persist every pending access time. Returns the number of rows updated.
    pub fn flush(&self) -> Result<usize> {
        self.catalog.run(|state| self.flush_in(state))
    }

    /// Change the capacity, trimming straight away when usage is now above it. Returns the
    /// evicted keys.
    pub fn set_disk_capacity(&self, capacity: u64) -> Vec<String> {
        self.catalog.run(|state| {
            state.capacity = capacity;
            self.capacity.store(capacity, Ordering::Release);
            if state.usage > capacity { self.trim_in(state, None) } else { Vec::new() }
        })
    }

    pub fn set_trim_level(&self, level: TrimLevel) {
        self.catalog.run(|state| state.trim_level = level);
    }

    pub fn set_entry_cache_count_limit(&self, limit: usize) {
        self.hot.lock().set_capacity(limit);
    }

    pub fn entry_cache_count_limit(&self) -> usize {
        self.hot.lock().capacity()
    }

    /// Delete blobs that no catalog row points at, plus leftovers of interrupted writes.
    /// Returns how many files were removed.
    pub fn reclaim_orphans(&self) -> Result<usize> {
        self.catalog.run(|state| {
            let known: HashSet<String> = state.backend.storage_ids()?.into_iter().collect();
            let stored = self.files.run(|storage| storage.list())?;
            let mut reclaimed = 0;
            for storage_id in stored.iter().filter(|id| !known.contains(*id)) {
                match self.files.run(|storage| storage.delete(storage_id)) {
                    Ok(()) => reclaimed += 1,
                    Err(err) => warn!(storage_id = %storage_id, error = %err, "orphan blob kept"),
                }
            }
            match self.files.run(|storage| storage.prune_partial()) {
                Ok(pruned) => reclaimed += pruned,
                Err(err) => warn!(error = %err, "partial writes kept"),
            }
            if reclaimed > 0 {
                info!(reclaimed, "reclaimed orphaned blobs and partial writes");
            }
            Ok(reclaimed)
        })
    }

    fn store_in(
        &self,
        state: &mut CatalogState,
        key: &str,
        bytes: &[u8],
        compress: bool,
    ) -> Result<StoreReceipt> {
        let storage_id = self.next_storage_id(key);
        self.files.run(|storage| storage.write(&storage_id, bytes, compress))?;

        let size = bytes.len() as u64;
        let access_time = clock::now_micros();
        let entry =
            NewEntry { key, storage_id: &storage_id, size, access_time, compressed: compress };
        let previous = match state.backend.upsert(&entry) {
            Ok(previous) => previous,
            Err(err) => {
                if let Err(cleanup) = self.files.run(|storage| storage.delete(&storage_id)) {
                    warn!(storage_id = %storage_id, error = %cleanup, "uncommitted blob kept");
                }
                return Err(err);
            }
        };

        let replaced_size = previous.as_ref().map_or(0, |row| row.size);
        state.usage = state.usage.saturating_sub(replaced_size).saturating_add(size);
        self.usage.store(state.usage, Ordering::Release);

        let entity = Entity::new(key, storage_id.as_str(), access_time, size, compress);
        self.hot.lock().insert(key.to_string(), Arc::new(entity));
        self.dirty.lock().remove(key);

        if let Some(previous) = &previous {
            if let Err(err) = self.files.run(|storage| storage.delete(&previous.storage_id)) {
                let storage_id = previous.storage_id.as_str();
                warn!(key, storage_id, error = %err, "replaced blob left behind");
            }
        }
        debug!(key, storage_id = %storage_id, size, compress, usage = state.usage, "stored entry");

        let evicted =
            if state.usage > state.capacity { self.trim_in(state, Some(key)) } else { Vec::new() };
        if state.usage > state.capacity {
            let (usage, capacity) = (state.usage, state.capacity);
            warn!(key, usage, capacity, "disk usage above capacity after trim");
        }

        Ok(StoreReceipt {
            key: key.to_string(),
            storage_id,
            size,
            compressed: compress,
            replaced: previous.is_some(),
            evicted,
            usage: state.usage,
            capacity: state.capacity,
        })
    }

    /// Evict least recently used rows until usage reaches the trim target. `protect` names a
    /// key that must survive, normally the one whose store triggered the pass.
    fn trim_in(&self, state: &mut CatalogState, protect: Option<&str>) -> Vec<String> {
        if let Err(err) = self.flush_in(state) {
            warn!(error = %err, "trimming with stale access times");
        }

        let target = state.target();
        let mut evicted = Vec::new();
        'scan: while state.usage > target {
            let batch = match state.backend.select_oldest(TRIM_BATCH) {
                Ok(batch) => batch,
                Err(err) => {
                    warn!(error = %err, "trim scan failed");
                    break;
                }
            };

            let mut progressed = false;
            for row in batch.iter().filter(|row| Some(row.key.as_str()) != protect) {
                if state.usage <= target {
                    break 'scan;
                }
                match self.remove_rows_in(state, &[row.key.as_str()]) {
                    Ok(removal) => {
                        for (key, err) in removal.delete_failures {
                            warn!(key = %key, error = %err, "skipping blob delete during trim");
                        }
                        progressed |= !removal.rows.is_empty();
                        evicted.extend(removal.rows.into_iter().map(|row| row.key));
                    }
                    Err(err) => {
                        warn!(key = %row.key, error = %err, "trim aborted");
                        break 'scan;
                    }
                }
            }
            if !progressed {
                break;
            }
        }

        debug!(evicted = evicted.len(), usage = state.usage, target, "trim finished");
        evicted
    }

    /// Delete rows first, then their blobs. Blob delete failures are returned, not raised.
    fn remove_rows_in(&self, state: &mut CatalogState, keys: &[&str]) -> Result<Removal> {
        if keys.is_empty() {
            return Ok(Removal { rows: Vec::new(), delete_failures: Vec::new() });
        }
        let rows = state.backend.delete_many(keys)?;

        {
            let mut hot = self.hot.lock();
            let mut dirty = self.dirty.lock();
            for key in keys {
                hot.remove(*key);
                dirty.remove(*key);
            }
        }

        let freed: u64 = rows.iter().map(|row| row.size).sum();
        state.usage = state.usage.saturating_sub(freed);
        self.usage.store(state.usage, Ordering::Release);

        let mut delete_failures = Vec::new();
        for row in &rows {
            if let Err(err) = self.files.run(|storage| storage.delete(&row.storage_id)) {
                delete_failures.push((row.key.clone(), err));
            }
        }
        Ok(Removal { rows, delete_failures })
    }

    fn flush_in(&self, state: &mut CatalogState) -> Result<usize> {
        let pending: Vec<Arc<Entity>> =
            self.dirty.lock().drain().map(|(_, entity)| entity).collect();
        let updates: Vec<(String, u64)> = pending
            .iter()
            .filter_map(|entity| entity.take_dirty().map(|time| (entity.key().to_string(), time)))
            .collect();

        match state.backend.update_access_times(&updates) {
            Ok(updated) => Ok(updated),
            Err(err) => {
                let mut dirty = self.dirty.lock();
                for entity in pending {
                    entity.mark_dirty();
                    dirty.entry(entity.key().to_string()).or_insert(entity);
                }
                Err(err)
            }
        }
    }

    fn next_storage_id(&self, key: &str) -> String {
        let counter = self.id_counter.fetch_add(1, Ordering::Relaxed);
        let mut hasher = blake3::Hasher::new();
        hasher.update(key.as_bytes());
        hasher.update(&counter.to_le_bytes());
        hasher.update(&clock::now_micros().to_le_bytes());
        hasher.update(&std::process::id().to_le_bytes());
        hasher.finalize().to_hex()[..32].to_string()
    }
}

fn entity_from_row(row: CatalogRow) -> Entity {
    Entity::new(row.key, row.storage_id, row.access_time, row.size, row.compressed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::BlobStorage;
    use std::sync::atomic::AtomicBool;
    use crate::types::BackendKind::{Snapshot, Sqlite};
    use crate::types::TrimLevel::{High, Low, Middle};

    #[derive(Debug, Default)]
    struct MemoryStorage {
        blobs: Mutex<HashMap<String, Vec<u8>>>,
        fail_writes: AtomicBool,
        fail_deletes: AtomicBool,
    }

    impl MemoryStorage {
        fn contains(&self, storage_id: &str) -> bool {
            self.blobs.lock().contains_key(storage_id)
        }

        fn count(&self) -> usize {
            self.blobs.lock().len()
        }
    }

    impl BlobStorage for MemoryStorage {
        fn write(&self, storage_id: &str, bytes: &[u8], _compress: bool) -> Result<()> {
            if self.fail_writes.load(Ordering::SeqCst) {
                return Err(CacheError::StorageWriteFailed {
                    storage_id: storage_id.to_string(),
                    source: std::io::Error::other("disk full"),
                });
            }
            self.blobs.lock().insert(storage_id.to_string(), bytes.to_vec());
            Ok(())
        }

        fn read(&self, storage_id: &str, _compressed: bool) -> Result<Option<Vec<u8>>> {
            Ok(self.blobs.lock().get(storage_id).cloned())
        }

        fn delete(&self, storage_id: &str) -> Result<()> {
            if self.fail_deletes.load(Ordering::SeqCst) {
                return Err(CacheError::StorageDeleteFailed {
                    storage_id: storage_id.to_string(),
                    source: std::io::Error::other("busy"),
                });
            }
            self.blobs.lock().remove(storage_id);
            Ok(())
        }

        fn list(&self) -> Result<Vec<String>> {
            Ok(self.blobs.lock().keys().cloned().collect())
        }
    }

    fn index_with(
        kind: BackendKind,
        root: &Path,
        capacity: u64,
        level: TrimLevel,
    ) -> (Index, Arc<MemoryStorage>) {
        let storage = Arc::new(MemoryStorage::default());
        let files = Arc::new(FileContext::new("file", Box::new(Arc::clone(&storage))));
        let config =
            IndexConfig { disk_capacity: capacity, trim_level: level, ..Default::default() };
        let index = Index::open(root, kind, files, config).expect("open index");
        (index, storage)
    }

    fn assert_usage_matches_catalog(index: &Index) {
        assert_eq!(index.current_disk_usage(), index.catalog_usage().unwrap());
    }

    const BACKENDS: [BackendKind; 2] = [Sqlite, Snapshot];

    #[test]
    fn store_then_lookup_resolves_entity() {
        for kind in BACKENDS {
            let temp = tempfile::tempdir().unwrap();
            let (index, storage) = index_with(kind, temp.path(), 10_000, Middle);

            let receipt = index.store("a", b"hello", false).unwrap();
            assert!(storage.contains(&receipt.storage_id));
            let entity = index.lookup("a").unwrap().expect("entity");
            assert_eq!(entity.storage_id(), receipt.storage_id);
            assert_eq!(entity.size(), 5);
            assert_eq!(index.read_blob(&entity).unwrap().as_deref(), Some(&b"hello"[..]));
            assert!(index.lookup("missing").unwrap().is_none());
            assert_usage_matches_catalog(&index);
        }
    }

    #[test]
    fn replacing_deletes_old_blob_after_commit() {
        for kind in BACKENDS {
            let temp = tempfile::tempdir().unwrap();
            let (index, storage) = index_with(kind, temp.path(), 10_000, Middle);

            let first = index.store("a", &[1; 100], false).unwrap();
            let second = index.store("a", &[2; 40], true).unwrap();
            assert!(second.replaced);
            assert!(!storage.contains(&first.storage_id));
            assert!(storage.contains(&second.storage_id));
            assert_eq!(index.current_disk_usage(), 40);
            assert!(index.lookup("a").unwrap().unwrap().is_compressed());
            assert_usage_matches_catalog(&index);
        }
    }

    #[test]
    fn failed_write_commits_nothing() {
        let temp = tempfile::tempdir().unwrap();
        let (index, storage) = index_with(Sqlite, temp.path(), 10_000, Middle);
        index.store("a", &[1; 10], false).unwrap();

        storage.fail_writes.store(true, Ordering::SeqCst);
        let err = index.store("a", &[2; 20], false).unwrap_err();
        assert!(matches!(err, CacheError::StorageWriteFailed { .. }));
        let err = index.store("b", &[2; 20], false).unwrap_err();
        assert!(err.is_storage());

        assert_eq!(index.current_disk_usage(), 10);
        assert!(index.lookup("b").unwrap().is_none());
        let a = index.lookup("a").unwrap().unwrap();
        assert_eq!(index.read_blob(&a).unwrap(), Some(vec![1; 10]));
        assert_usage_matches_catalog(&index);
    }

    #[test]
    fn trim_reaches_middle_target_oldest_first() {
        for kind in BACKENDS {
            let temp = tempfile::tempdir().unwrap();
            let (index, storage) = index_with(kind, temp.path(), 1000, Middle);

            index.store("A", &[0; 400], false).unwrap();
            index.store("B", &[0; 400], false).unwrap();
            let receipt = index.store("C", &[0; 400], false).unwrap();

            assert_eq!(receipt.evicted, ["A", "B"]);
            assert_eq!(index.current_disk_usage(), 400);
            assert!(index.lookup("A").unwrap().is_none());
            assert!(index.lookup("B").unwrap().is_none());
            assert!(index.lookup("C").unwrap().is_some());
            assert_eq!(storage.count(), 1);
            assert!(receipt.check_capacity().is_ok());
            assert_usage_matches_catalog(&index);
        }
    }

    #[test]
    fn registered_access_protects_from_eviction() {
        for kind in BACKENDS {
            let temp = tempfile::tempdir().unwrap();
            let (index, _storage) = index_with(kind, temp.path(), 1000, High);

            index.store("A", &[0; 400], false).unwrap();
            index.store("B", &[0; 400], false).unwrap();
            let a = index.lookup("A").unwrap().unwrap();
            index.register_access(&a);

            let receipt = index.store("C", &[0; 400], false).unwrap();
            assert_eq!(receipt.evicted, ["B"]);
            assert!(index.lookup("A").unwrap().is_some());
            assert_eq!(index.current_disk_usage(), 800);
        }
    }

    #[test]
    fn oversized_item_is_kept_and_reported() {
        let temp = tempfile::tempdir().unwrap();
        let (index, _storage) = index_with(Snapshot, temp.path(), 1000, Low);
        index.store("small", &[0; 100], false).unwrap();

        let receipt = index.store("huge", &[0; 1500], false).unwrap();
        assert_eq!(receipt.evicted, ["small"]);
        assert!(index.lookup("huge").unwrap().is_some());
        assert!(matches!(
            receipt.check_capacity(),
            Err(CacheError::CapacityExceededDespiteTrim { usage: 1500, capacity: 1000 })
        ));
    }

    #[test]
    fn failed_victim_delete_is_skipped_and_later_reclaimed() {
        let temp = tempfile::tempdir().unwrap();
        let (index, storage) = index_with(Sqlite, temp.path(), 1000, Middle);
        index.store("A", &[0; 400], false).unwrap();
        index.store("B", &[0; 400], false).unwrap();

        storage.fail_deletes.store(true, Ordering::SeqCst);
        let receipt = index.store("C", &[0; 400], false).unwrap();
        assert_eq!(receipt.evicted, ["A", "B"]);
        assert_eq!(index.current_disk_usage(), 400);
        assert_eq!(storage.count(), 3);

        storage.fail_deletes.store(false, Ordering::SeqCst);
        assert_eq!(index.reclaim_orphans().unwrap(), 2);
        assert_eq!(storage.count(), 1);
        assert_usage_matches_catalog(&index);
    }

    #[test]
    fn remove_deletes_row_before_reporting_blob_failure() {
        let temp = tempfile::tempdir().unwrap();
        let (index, storage) = index_with(Snapshot, temp.path(), 1000, Middle);
        index.store("a", &[0; 10], false).unwrap();
        index.store("b", &[0; 10], false).unwrap();

        assert!(index.remove("a").unwrap());
        assert!(!index.remove("a").unwrap());

        storage.fail_deletes.store(true, Ordering::SeqCst);
        let err = index.remove("b").unwrap_err();
        assert!(matches!(err, CacheError::StorageDeleteFailed { .. }));
        assert!(index.lookup("b").unwrap().is_none());
        assert_eq!(index.current_disk_usage(), 0);
        assert_usage_matches_catalog(&index);
    }

    #[test]
    fn fragment_removal_selects_or_excludes() {
        for kind in BACKENDS {
            for excluding in [false, true] {
                let temp = tempfile::tempdir().unwrap();
                let (index, _storage) = index_with(kind, temp.path(), 10_000, Middle);
                for key in ["img_1", "img_2", "doc_1", "thumb_img_3"] {
                    index.store(key, key.as_bytes(), false).unwrap();
                }

                let mut removed = index.remove_by_fragment("img_", excluding).unwrap();
                removed.sort();
                if excluding {
                    assert_eq!(removed, ["doc_1"]);
                } else {
                    assert_eq!(removed, ["img_1", "img_2", "thumb_img_3"]);
                }
                for key in ["img_1", "img_2", "doc_1", "thumb_img_3"] {
                    let present = index.lookup(key).unwrap().is_some();
                    assert_eq!(present, key.contains("img_") == excluding, "{key}");
                }
                assert_usage_matches_catalog(&index);
            }
        }
    }

    #[test]
    fn batches_report_each_item() {
        let temp = tempfile::tempdir().unwrap();
        let (index, _storage) = index_with(Sqlite, temp.path(), 10_000, Middle);

        let stored = index.store_batch(&[("a", &b"1"[..], false), ("b", &b"22"[..], true)]);
        assert!(stored.all_succeeded());
        assert_eq!(index.current_disk_usage(), 3);

        let removed = index.remove_batch(&["a", "missing"]);
        assert_eq!(removed.len(), 2);
        assert!(matches!(removed.get("a"), Some(Ok(true))));
        assert!(matches!(removed.get("missing"), Some(Ok(false))));
        assert_usage_matches_catalog(&index);
    }

    #[test]
    fn flushed_access_times_survive_reopen() {
        let temp = tempfile::tempdir().unwrap();
        {
            let (index, _storage) = index_with(Sqlite, temp.path(), 10_000, Middle);
            index.store("a", &[0; 10], false).unwrap();
            index.store("b", &[0; 10], false).unwrap();
            let a = index.lookup("a").unwrap().unwrap();
            index.register_access(&a);
            assert_eq!(index.flush().unwrap(), 1);
            assert!(!a.is_dirty());
        }

        let (index, _storage) = index_with(Sqlite, temp.path(), 10_000, Middle);
        assert_eq!(index.current_disk_usage(), 20);
        let a = index.lookup("a").unwrap().unwrap();
        let b = index.lookup("b").unwrap().unwrap();
        assert!(a.access_time() > b.access_time());
    }

    #[test]
    fn lowering_capacity_trims_immediately() {
        let temp = tempfile::tempdir().unwrap();
        let (index, _storage) = index_with(Snapshot, temp.path(), 10_000, Low);
        for key in ["a", "b", "c", "d"] {
            index.store(key, &[0; 100], false).unwrap();
        }

        let evicted = index.set_disk_capacity(300);
        assert_eq!(evicted, ["a", "b", "c"]);
        assert_eq!(index.current_disk_usage(), 100);
        assert_eq!(index.disk_capacity(), 300);
    }

    #[test]
    fn hot_cache_respects_count_limit() {
        let temp = tempfile::tempdir().unwrap();
        let (index, _storage) = index_with(Sqlite, temp.path(), 10_000, Middle);
        index.set_entry_cache_count_limit(2);
        for key in ["a", "b", "c"] {
            index.store(key, &[0; 1], false).unwrap();
        }
        assert!(index.resident("a").is_none());
        assert!(index.resident("c").is_some());
        assert!(index.lookup("a").unwrap().is_some());
        assert_eq!(index.entry_cache_count_limit(), 2);
    }
}
