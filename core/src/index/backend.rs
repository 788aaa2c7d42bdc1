//! Persistence contract shared by the catalog implementations.

use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::types::BackendKind;

use super::Result;
use super::snapshot::SnapshotCatalog;
use super::sqlite::SqliteCatalog;

/// A durable catalog row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogRow {
    pub key: String,
    pub storage_id: String,
    pub size: u64,
    pub access_time: u64,
    pub compressed: bool,
    /// Insertion order, used to break access-time ties.
    pub seq: u64,
}

/// Values for a row about to be inserted; the backend assigns the insertion sequence.
#[derive(Debug, Clone, Copy)]
pub struct NewEntry<'a> {
    pub key: &'a str,
    pub storage_id: &'a str,
    pub size: u64,
    pub access_time: u64,
    pub compressed: bool,
}

/// Row-level persistence for the index. Eviction policy stays in the index; backends only
/// store, query and delete rows, each call being atomic on its own.
pub trait CatalogBackend: Send + fmt::Debug {
    fn kind(&self) -> BackendKind;

    /// Exact-key lookup.
    fn select(&mut self, key: &str) -> Result<Option<CatalogRow>>;

    /// Insert the row for `entry.key`, replacing any existing one in the same transaction.
    /// Returns the replaced row.
    fn upsert(&mut self, entry: &NewEntry<'_>) -> Result<Option<CatalogRow>>;

    /// Delete the rows for `keys` in one transaction, returning the rows that existed.
    fn delete_many(&mut self, keys: &[&str]) -> Result<Vec<CatalogRow>>;

    /// Rows whose key contains `fragment`, or does not when `excluding` is set.
    fn select_by_fragment(&mut self, fragment: &str, excluding: bool) -> Result<Vec<CatalogRow>>;

    /// Up to `limit` rows, least recently accessed first, ties by insertion order.
    fn select_oldest(&mut self, limit: usize) -> Result<Vec<CatalogRow>>;

    /// Write back access times in one transaction. Rows already holding a newer time, or no
    /// longer present, are left alone. Returns the number of rows updated.
    fn update_access_times(&mut self, updates: &[(String, u64)]) -> Result<usize>;

    /// Sum of `size` over every row.
    fn total_size(&mut self) -> Result<u64>;

    fn len(&mut self) -> Result<usize>;

    fn storage_ids(&mut self) -> Result<Vec<String>>;

    /// Largest access time on record, zero for an empty catalog.
    fn newest_access_time(&mut self) -> Result<u64>;

    fn delete(&mut self, key: &str) -> Result<Option<CatalogRow>> {
        Ok(self.delete_many(&[key])?.pop())
    }

    fn is_empty(&mut self) -> Result<bool> {
        Ok(self.len()? == 0)
    }
}

/// Open the catalog of the requested kind inside `root`.
pub fn open_backend(kind: BackendKind, root: &Path) -> Result<Box<dyn CatalogBackend>> {
    let path = root.join(kind.file_name());
    Ok(match kind {
        BackendKind::Sqlite => Box::new(SqliteCatalog::open(&path)?),
        BackendKind::Snapshot => Box::new(SnapshotCatalog::open(&path)?),
    })
}
