//! In-memory and disk cache coordination.

pub mod disk;
pub mod memory;
pub mod stack;

pub use disk::{DiskCache, SetOptions};
pub use memory::{EvictionListener, MemoryCache};
pub use stack::StackCache;

pub type Result<T> = crate::Result<T>;
