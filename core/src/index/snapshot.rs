//! Catalog kept in a transactional snapshot store.

use std::collections::BTreeMap;
use std::path::Path;

use tracing::{trace, warn};

use crate::store::{SnapshotHook, SnapshotStore};
use crate::types::BackendKind;

use super::Result;
use super::backend::{CatalogBackend, CatalogRow, NewEntry};

/// Drops rows that cannot be served when the snapshot is loaded. Their blobs become orphans and
/// are reclaimed by the next orphan scan.
#[derive(Debug)]
struct RowRepair;

impl SnapshotHook<CatalogRow> for RowRepair {
    fn opened(&self, records: &mut BTreeMap<String, CatalogRow>) -> Result<()> {
        let before = records.len();
        records.retain(|key, row| row.key == *key && !row.storage_id.is_empty());
        let dropped = before - records.len();
        if dropped > 0 {
            warn!(dropped, "discarded malformed catalog rows");
        }
        Ok(())
    }

    fn committed(&self, changes: usize) {
        trace!(changes, "catalog snapshot committed");
    }
}

/// Object-store catalog backend: every mutation is one snapshot transaction.
#[derive(Debug)]
pub struct SnapshotCatalog {
    store: SnapshotStore<CatalogRow>,
    next_seq: u64,
}

impl SnapshotCatalog {
    pub fn open(path: &Path) -> Result<Self> {
        let hooks: Vec<Box<dyn SnapshotHook<CatalogRow>>> = vec![Box::new(RowRepair)];
        let store = SnapshotStore::open_with_hooks(path, hooks)?;
        let next_seq = store.values().map(|row| row.seq).max().map_or(1, |seq| seq + 1);
        Ok(Self { store, next_seq })
    }

    pub fn path(&self) -> &Path {
        self.store.path()
    }
}

impl CatalogBackend for SnapshotCatalog {
    fn kind(&self) -> BackendKind {
        BackendKind::Snapshot
    }

    fn select(&mut self, key: &str) -> Result<Option<CatalogRow>> {
        Ok(self.store.get(key).cloned())
    }

    fn upsert(&mut self, entry: &NewEntry<'_>) -> Result<Option<CatalogRow>> {
        let row = CatalogRow {
            key: entry.key.to_string(),
            storage_id: entry.storage_id.to_string(),
            size: entry.size,
            access_time: entry.access_time,
            compressed: entry.compressed,
            seq: self.next_seq,
        };
        let previous = self.store.transaction(|tx| Ok(tx.put(entry.key, row)))?;
        self.next_seq += 1;
        Ok(previous)
    }

    fn delete_many(&mut self, keys: &[&str]) -> Result<Vec<CatalogRow>> {
        self.store.transaction(|tx| Ok(keys.iter().filter_map(|key| tx.delete(key)).collect()))
    }

    fn select_by_fragment(&mut self, fragment: &str, excluding: bool) -> Result<Vec<CatalogRow>> {
        let mut rows: Vec<_> = self
            .store
            .values()
            .filter(|row| row.key.contains(fragment) != excluding)
            .cloned()
            .collect();
        rows.sort_by_key(|row| row.seq);
        Ok(rows)
    }

    fn select_oldest(&mut self, limit: usize) -> Result<Vec<CatalogRow>> {
        let mut rows: Vec<_> = self.store.values().collect();
        rows.sort_by_key(|row| (row.access_time, row.seq));
        Ok(rows.into_iter().take(limit).cloned().collect())
    }

    fn update_access_times(&mut self, updates: &[(String, u64)]) -> Result<usize> {
        self.store.transaction(|tx| {
            let mut changed = 0;
            for (key, access_time) in updates {
                let Some(row) = tx.get(key) else { continue };
                if row.access_time >= *access_time {
                    continue;
                }
                let mut row = row.clone();
                row.access_time = *access_time;
                tx.put(key.clone(), row);
                changed += 1;
            }
            Ok(changed)
        })
    }

    fn total_size(&mut self) -> Result<u64> {
        Ok(self.store.values().map(|row| row.size).sum())
    }

    fn len(&mut self) -> Result<usize> {
        Ok(self.store.len())
    }

    fn storage_ids(&mut self) -> Result<Vec<String>> {
        Ok(self.store.values().map(|row| row.storage_id.clone()).collect())
    }

    fn newest_access_time(&mut self) -> Result<u64> {
        Ok(self.store.values().map(|row| row.access_time).max().unwrap_or(0))
    }
}
