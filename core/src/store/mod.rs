//! Persistent record stores used by the catalog backends.

pub mod snapshot;

pub use snapshot::{SnapshotHook, SnapshotStore, Transaction};

pub type Result<T> = crate::Result<T>;
