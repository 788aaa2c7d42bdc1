//! Error taxonomy shared by the catalog, the blob storage and the cache facade.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Errors surfaced by cache operations.
///
/// A missing key is not an error: lookups return `Option` instead.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("failed to write blob {storage_id}: {source}")]
    StorageWriteFailed {
        storage_id: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to read blob {storage_id}: {source}")]
    StorageReadFailed {
        storage_id: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to delete blob {storage_id}: {source}")]
    StorageDeleteFailed {
        storage_id: String,
        #[source]
        source: io::Error,
    },

    /// The catalog could not be opened or one of its statements failed to prepare.
    #[error("catalog at {} is unusable: {reason}", path.display())]
    CatalogCorrupt { path: PathBuf, reason: String },

    #[error("catalog {operation} failed: {reason}")]
    Catalog { operation: &'static str, reason: String },

    /// Trimming could not bring usage under capacity; the triggering item is still stored.
    #[error("disk usage {usage} exceeds capacity {capacity} after trimming")]
    CapacityExceededDespiteTrim { usage: u64, capacity: u64 },

    #[error("cache has been closed")]
    NotReady,

    #[error("invalid cache configuration: {0}")]
    InvalidConfig(String),
}

impl CacheError {
    pub(crate) fn catalog(operation: &'static str, err: impl std::fmt::Display) -> Self {
        Self::Catalog { operation, reason: err.to_string() }
    }

    pub(crate) fn corrupt(path: impl Into<PathBuf>, err: impl std::fmt::Display) -> Self {
        Self::CatalogCorrupt { path: path.into(), reason: err.to_string() }
    }

    /// Returns `true` for failures raised by the blob storage rather than the catalog.
    pub fn is_storage(&self) -> bool {
        matches!(
            self,
            Self::StorageWriteFailed { .. }
                | Self::StorageReadFailed { .. }
                | Self::StorageDeleteFailed { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, CacheError>;
