//! Two-tier content-addressable blob cache.
//!
//! Values live in an in-memory LRU in front of a durable store made of a catalog (SQLite or a
//! JSON snapshot) and one blob file per item. Disk usage is bounded by trimming the least
//! recently used entries down to a configurable fraction of capacity.

#![deny(missing_debug_implementations)]

pub mod cache;
pub mod clock;
pub mod config;
pub mod context;
pub mod error;
pub mod index;
pub mod log;
pub mod stats;
pub mod storage;
pub mod store;
pub mod types;

pub use cache::{DiskCache, MemoryCache, SetOptions, StackCache};
pub use config::CacheConfig;
pub use error::{CacheError, Result};
pub use index::{BatchOutcome, Entity, Index, IndexConfig, StoreReceipt};
pub use stats::StatsSnapshot;
pub use storage::{BlobStorage, FileStorage};
pub use types::{BackendKind, CacheKey, MemoryBudget, TrimFractions, TrimLevel};

/// Returns the version of the core crate for telemetry and debugging.
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exposes_semver_version() {
        assert!(version().contains('.'));
    }
}
