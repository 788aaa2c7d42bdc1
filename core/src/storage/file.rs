//! Blob files on the local file system, laid out in a sharded directory tree.

use std::fs;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

use flate2::Compression;
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use tempfile::Builder;
use tracing::{debug, warn};

use crate::error::CacheError;

use super::{BlobStorage, Result};

const SHARD_LEN: usize = 2;
const BLOB_EXTENSION: &str = "blob";
const BLOB_DIR: &str = "blobs";
/// Name prefix of the temp files a write goes through before it is renamed into place.
const PARTIAL_PREFIX: &str = ".partial";

/// Stores each blob as `<root>/blobs/<aa>/<bb>/<rest>.blob`, keyed by its storage id.
#[derive(Debug, Clone)]
pub struct FileStorage {
    root: PathBuf,
    level: Compression,
}

impl FileStorage {
    /// Create or reuse a blob directory under the provided cache root.
    pub fn new(root: impl AsRef<Path>) -> io::Result<Self> {
        let root = root.as_ref().join(BLOB_DIR);
        fs::create_dir_all(&root)?;
        Ok(Self { root, level: Compression::default() })
    }

    /// Override the zlib level (0-9) used for compressed blobs.
    pub fn with_compression_level(mut self, level: u32) -> Self {
        self.level = Compression::new(level.min(9));
        self
    }

    /// Returns the directory holding the blob tree.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve the on-disk path of a storage id.
    pub fn path_for(&self, storage_id: &str) -> io::Result<PathBuf> {
        if storage_id.len() <= SHARD_LEN * 2
            || !storage_id.bytes().all(|b| b.is_ascii_alphanumeric())
        {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("storage id {storage_id:?} is not a valid blob name"),
            ));
        }

        let (shard_one, remainder) = storage_id.split_at(SHARD_LEN);
        let (shard_two, remainder) = remainder.split_at(SHARD_LEN);
        let filename = format!("{remainder}.{BLOB_EXTENSION}");
        Ok(self.root.join(shard_one).join(shard_two).join(filename))
    }

    fn write_file(&self, storage_id: &str, bytes: &[u8], compress: bool) -> io::Result<()> {
        let path = self.path_for(storage_id)?;
        let parent = path.parent().ok_or_else(|| {
            io::Error::other(format!("blob path {} has no parent directory", path.display()))
        })?;
        fs::create_dir_all(parent)?;

        let mut tmp = Builder::new().prefix(PARTIAL_PREFIX).tempfile_in(parent)?;
        if compress {
            let mut encoder = ZlibEncoder::new(tmp.as_file_mut(), self.level);
            encoder.write_all(bytes)?;
            encoder.finish()?;
        } else {
            tmp.write_all(bytes)?;
        }
        tmp.flush()?;
        tmp.as_file().sync_all()?;
        tmp.persist(&path).map_err(|err| err.error)?;
        Ok(())
    }

    fn read_file(&self, storage_id: &str, compressed: bool) -> io::Result<Option<Vec<u8>>> {
        let path = self.path_for(storage_id)?;
        let raw = match fs::read(&path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err),
        };

        if !compressed {
            return Ok(Some(raw));
        }
        let mut bytes = Vec::with_capacity(raw.len() * 2);
        ZlibDecoder::new(raw.as_slice()).read_to_end(&mut bytes)?;
        Ok(Some(bytes))
    }

    fn delete_file(&self, storage_id: &str) -> io::Result<()> {
        let path = self.path_for(storage_id)?;
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err),
        }
    }

    fn list_files(&self) -> io::Result<Vec<String>> {
        let mut ids = Vec::new();
        for path in self.shard_files()? {
            if path.extension().and_then(|ext| ext.to_str()) != Some(BLOB_EXTENSION) {
                continue;
            }
            if let Some(id) = storage_id_of(&path) {
                ids.push(id);
            }
        }
        Ok(ids)
    }

    fn prune_partial_files(&self) -> io::Result<usize> {
        let mut pruned = 0;
        for path in self.shard_files()? {
            if !file_name(&path).is_some_and(|name| name.starts_with(PARTIAL_PREFIX)) {
                continue;
            }
            match fs::remove_file(&path) {
                Ok(()) => pruned += 1,
                Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                Err(err) => warn!(path = %path.display(), error = %err, "partial write kept"),
            }
        }
        Ok(pruned)
    }

    /// Every file two shard levels below the blob root.
    fn shard_files(&self) -> io::Result<Vec<PathBuf>> {
        let mut files = Vec::new();
        for shard_one in subdirectories(&self.root)? {
            for shard_two in subdirectories(&shard_one)? {
                for entry in fs::read_dir(&shard_two)? {
                    let entry = entry?;
                    if entry.file_type()?.is_file() {
                        files.push(entry.path());
                    }
                }
            }
        }
        Ok(files)
    }
}

impl BlobStorage for FileStorage {
    fn write(&self, storage_id: &str, bytes: &[u8], compress: bool) -> Result<()> {
        debug!(storage_id, len = bytes.len(), compress, "writing blob");
        self.write_file(storage_id, bytes, compress).map_err(|source| {
            CacheError::StorageWriteFailed { storage_id: storage_id.to_string(), source }
        })
    }

    fn read(&self, storage_id: &str, compressed: bool) -> Result<Option<Vec<u8>>> {
        self.read_file(storage_id, compressed).map_err(|source| CacheError::StorageReadFailed {
            storage_id: storage_id.to_string(),
            source,
        })
    }

    fn delete(&self, storage_id: &str) -> Result<()> {
        self.delete_file(storage_id).map_err(|source| CacheError::StorageDeleteFailed {
            storage_id: storage_id.to_string(),
            source,
        })
    }

    fn list(&self) -> Result<Vec<String>> {
        self.list_files().map_err(|source| CacheError::StorageReadFailed {
            storage_id: self.root.display().to_string(),
            source,
        })
    }

    fn prune_partial(&self) -> Result<usize> {
        self.prune_partial_files().map_err(|source| CacheError::StorageDeleteFailed {
            storage_id: self.root.display().to_string(),
            source,
        })
    }
}

fn subdirectories(dir: &Path) -> io::Result<Vec<PathBuf>> {
    let mut dirs = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            dirs.push(entry.path());
        }
    }
    Ok(dirs)
}

fn file_name(path: &Path) -> Option<&str> {
    path.file_name().and_then(|name| name.to_str())
}

/// Rebuild the storage id from `<aa>/<bb>/<rest>.blob`.
fn storage_id_of(path: &Path) -> Option<String> {
    let stem = path.file_stem()?.to_str()?;
    let shard_two = path.parent()?;
    let shard_one = shard_two.parent()?;
    Some(format!("{}{}{stem}", file_name(shard_one)?, file_name(shard_two)?))
}
