//! Byte storage delegate consumed by the index and the cache facade.

pub mod file;

use std::fmt;
use std::sync::Arc;

pub use file::FileStorage;

use crate::context::SerialContext;

pub type Result<T> = crate::Result<T>;

/// Capability the index uses to persist and discard the bytes behind a catalog row.
///
/// Implementations are only ever called from the file context, one call at a time.
pub trait BlobStorage: Send + Sync + fmt::Debug {
    /// Persist `bytes` under `storage_id`. Must be durable once this returns.
    fn write(&self, storage_id: &str, bytes: &[u8], compress: bool) -> Result<()>;

    /// Read the bytes stored under `storage_id`, `None` when nothing is stored there.
    fn read(&self, storage_id: &str, compressed: bool) -> Result<Option<Vec<u8>>>;

    /// Remove the bytes stored under `storage_id`. Deleting a missing id is not an error.
    fn delete(&self, storage_id: &str) -> Result<()>;

    /// Per-item compression policy; the cache-wide default applies unless overridden.
    fn should_compress(&self, _key: &str, default: bool) -> bool {
        default
    }

    /// Enumerate every stored id.
    fn list(&self) -> Result<Vec<String>> {
        Ok(Vec::new())
    }

    /// Delete what interrupted writes left behind. Returns how many files were removed.
    fn prune_partial(&self) -> Result<usize> {
        Ok(0)
    }
}

impl<S: BlobStorage + ?Sized> BlobStorage for Arc<S> {
    fn write(&self, storage_id: &str, bytes: &[u8], compress: bool) -> Result<()> {
        (**self).write(storage_id, bytes, compress)
    }

    fn read(&self, storage_id: &str, compressed: bool) -> Result<Option<Vec<u8>>> {
        (**self).read(storage_id, compressed)
    }

    fn delete(&self, storage_id: &str) -> Result<()> {
        (**self).delete(storage_id)
    }

    fn should_compress(&self, key: &str, default: bool) -> bool {
        (**self).should_compress(key, default)
    }

    fn list(&self) -> Result<Vec<String>> {
        (**self).list()
    }

    fn prune_partial(&self) -> Result<usize> {
        (**self).prune_partial()
    }
}

/// The serialized context all blob I/O runs on.
pub type FileContext = SerialContext<Box<dyn BlobStorage>>;
