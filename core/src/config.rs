//! Cache configuration.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::CacheError;
use crate::index::IndexConfig;
use crate::types::{BackendKind, MemoryBudget, TrimFractions, TrimLevel};

/// Settings for [`crate::DiskCache::open`]. Missing fields in a config file take their defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Directory holding the catalog and the blob tree.
    pub root: PathBuf,
    /// Byte budget of the in-memory value cache.
    pub memory_cache_size: usize,
    pub memory_entry_limit: Option<usize>,
    /// Disk capacity in bytes; exceeding it triggers a trim.
    pub disk_cache_size: u64,
    pub trim_level: TrimLevel,
    pub trim_fractions: TrimFractions,
    /// Whether blobs are compressed unless a per-item choice says otherwise.
    pub compressed: bool,
    /// Number of entities kept in the hot metadata cache.
    pub entry_cache_count_limit: usize,
    pub backend: BackendKind,
    /// zlib level used for compressed blobs, 0-9.
    pub compression_level: u32,
}

impl Default for CacheConfig {
    fn default() -> Self {
        let index = IndexConfig::default();
        Self {
            root: default_cache_root(),
            memory_cache_size: MemoryBudget::default().bytes_max,
            memory_entry_limit: None,
            disk_cache_size: index.disk_capacity,
            trim_level: index.trim_level,
            trim_fractions: index.trim_fractions,
            compressed: false,
            entry_cache_count_limit: index.entry_cache_count_limit,
            backend: BackendKind::default(),
            compression_level: 6,
        }
    }
}

impl CacheConfig {
    /// Defaults rooted at `root`.
    pub fn at(root: impl Into<PathBuf>) -> Self {
        Self::default().with_root(root)
    }

    pub fn with_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.root = root.into();
        self
    }

    pub fn with_memory_cache_size(mut self, bytes: usize) -> Self {
        self.memory_cache_size = bytes;
        self
    }

    pub fn with_memory_entry_limit(mut self, limit: Option<usize>) -> Self {
        self.memory_entry_limit = limit;
        self
    }

    pub fn with_disk_cache_size(mut self, bytes: u64) -> Self {
        self.disk_cache_size = bytes;
        self
    }

    pub fn with_trim_level(mut self, level: TrimLevel) -> Self {
        self.trim_level = level;
        self
    }

    pub fn with_trim_fractions(mut self, fractions: TrimFractions) -> Self {
        self.trim_fractions = fractions;
        self
    }

    pub fn with_compressed(mut self, compressed: bool) -> Self {
        self.compressed = compressed;
        self
    }

    pub fn with_entry_cache_count_limit(mut self, limit: usize) -> Self {
        self.entry_cache_count_limit = limit;
        self
    }

    pub fn with_backend(mut self, backend: BackendKind) -> Self {
        self.backend = backend;
        self
    }

    pub fn with_compression_level(mut self, level: u32) -> Self {
        self.compression_level = level;
        self
    }

    /// Load a JSON config file.
    pub fn from_json_file(path: impl AsRef<Path>) -> crate::Result<Self> {
        let path = path.as_ref();
        let bytes = fs::read(path).map_err(|err| {
            CacheError::InvalidConfig(format!("reading {}: {err}", path.display()))
        })?;
        serde_json::from_slice(&bytes).map_err(|err| {
            CacheError::InvalidConfig(format!("parsing {}: {err}", path.display()))
        })
    }

    /// Reject settings the cache cannot run with.
    pub fn validate(&self) -> crate::Result<()> {
        if self.root.as_os_str().is_empty() {
            return Err(CacheError::InvalidConfig("cache root is empty".into()));
        }
        if !self.trim_fractions.is_valid() {
            return Err(CacheError::InvalidConfig(format!(
                "trim fractions must lie in (0, 1], got {:?}",
                self.trim_fractions
            )));
        }
        if self.compression_level > 9 {
            return Err(CacheError::InvalidConfig(format!(
                "compression level {} is outside 0-9",
                self.compression_level
            )));
        }
        Ok(())
    }

    pub fn memory_budget(&self) -> MemoryBudget {
        MemoryBudget { bytes_max: self.memory_cache_size, entries_max: self.memory_entry_limit }
    }

    pub fn index_config(&self) -> IndexConfig {
        IndexConfig {
            disk_capacity: self.disk_cache_size,
            trim_level: self.trim_level,
            trim_fractions: self.trim_fractions,
            entry_cache_count_limit: self.entry_cache_count_limit,
        }
    }
}

fn default_cache_root() -> PathBuf {
    if let Some(dirs) = directories::ProjectDirs::from("com", "Blobcache", "blobcache") {
        dirs.cache_dir().to_path_buf()
    } else {
        std::env::temp_dir().join("blobcache")
    }
}
