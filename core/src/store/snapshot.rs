//! Transactional keyed record store persisted as a single JSON snapshot.
//!
//! Every committed transaction rewrites the snapshot through a temporary file that is atomically
//! renamed over the previous one, so readers of the file only ever see whole commits. Lifecycle
//! hooks registered on the store run once the snapshot is loaded (and may repair the records)
//! and after every commit.

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;

use crate::error::CacheError;

use super::Result;

const SNAPSHOT_VERSION: u32 = 1;

/// Lifecycle callbacks for a [`SnapshotStore`].
pub trait SnapshotHook<R>: Send + fmt::Debug {
    /// Called after the snapshot has been loaded. Changes made here are persisted with the
    /// next commit.
    fn opened(&self, _records: &mut BTreeMap<String, R>) -> Result<()> {
        Ok(())
    }

    /// Called after a transaction touching `changes` records was persisted.
    fn committed(&self, _changes: usize) {}
}

#[derive(Debug, Deserialize)]
struct SnapshotFile<R> {
    version: u32,
    records: BTreeMap<String, R>,
}

#[derive(Serialize)]
struct SnapshotRef<'a, R> {
    version: u32,
    records: &'a BTreeMap<String, R>,
}

/// Keyed records with all-or-nothing transactions.
pub struct SnapshotStore<R> {
    path: PathBuf,
    records: BTreeMap<String, R>,
    hooks: Vec<Box<dyn SnapshotHook<R>>>,
}

impl<R> fmt::Debug for SnapshotStore<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SnapshotStore")
            .field("path", &self.path)
            .field("records", &self.records.len())
            .field("hooks", &self.hooks)
            .finish()
    }
}

impl<R> SnapshotStore<R>
where
    R: Serialize + DeserializeOwned + Clone,
{
    /// Load the snapshot at `path`, starting empty when it does not exist yet.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        Self::open_with_hooks(path, Vec::new())
    }

    /// Load the snapshot and run the `opened` hook of every registered hook in order.
    pub fn open_with_hooks(
        path: impl Into<PathBuf>,
        hooks: Vec<Box<dyn SnapshotHook<R>>>,
    ) -> Result<Self> {
        let path = path.into();
        let mut records = read_snapshot(&path)?;
        for hook in &hooks {
            hook.opened(&mut records)?;
        }
        Ok(Self { path, records, hooks })
    }

    pub fn register_hook(&mut self, hook: Box<dyn SnapshotHook<R>>) {
        self.hooks.push(hook);
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn get(&self, key: &str) -> Option<&R> {
        self.records.get(key)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &R)> {
        self.records.iter()
    }

    pub fn values(&self) -> impl Iterator<Item = &R> {
        self.records.values()
    }

    /// Run `work` against a staged view of the records and commit its changes atomically.
    ///
    /// Nothing is applied when `work` fails. When persisting fails the in-memory records are
    /// rolled back and the error is returned.
    pub fn transaction<T>(
        &mut self,
        work: impl FnOnce(&mut Transaction<'_, R>) -> Result<T>,
    ) -> Result<T> {
        let mut tx = Transaction { base: &self.records, staged: BTreeMap::new() };
        let output = work(&mut tx)?;
        let staged = tx.staged;
        if staged.is_empty() {
            return Ok(output);
        }

        let changes = staged.len();
        let mut undo = Vec::with_capacity(changes);
        for (key, value) in staged {
            let previous = match value {
                Some(record) => self.records.insert(key.clone(), record),
                None => self.records.remove(&key),
            };
            undo.push((key, previous));
        }

        if let Err(err) = write_snapshot(&self.path, &self.records) {
            for (key, previous) in undo.into_iter().rev() {
                match previous {
                    Some(record) => self.records.insert(key, record),
                    None => self.records.remove(&key),
                };
            }
            return Err(CacheError::catalog("commit", err));
        }

        for hook in &self.hooks {
            hook.committed(changes);
        }
        Ok(output)
    }
}

/// Staged changes on top of the committed records.
#[derive(Debug)]
pub struct Transaction<'a, R> {
    base: &'a BTreeMap<String, R>,
    staged: BTreeMap<String, Option<R>>,
}

impl<R: Clone> Transaction<'_, R> {
    pub fn get(&self, key: &str) -> Option<&R> {
        match self.staged.get(key) {
            Some(staged) => staged.as_ref(),
            None => self.base.get(key),
        }
    }

    pub fn contains(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    /// Stage `record` under `key`, returning the record it shadows.
    pub fn put(&mut self, key: impl Into<String>, record: R) -> Option<R> {
        let key = key.into();
        let previous = self.get(&key).cloned();
        self.staged.insert(key, Some(record));
        previous
    }

    /// Stage the removal of `key`, returning the record it removes.
    pub fn delete(&mut self, key: &str) -> Option<R> {
        let previous = self.get(key).cloned();
        if previous.is_some() {
            self.staged.insert(key.to_string(), None);
        }
        previous
    }

    /// Committed records plus staged changes, in key order.
    pub fn records(&self) -> impl Iterator<Item = (&String, &R)> {
        let committed = self
            .base
            .iter()
            .filter(|(key, _)| !self.staged.contains_key(*key));
        let staged = self.staged.iter().filter_map(|(key, value)| value.as_ref().map(|v| (key, v)));
        let mut all: Vec<_> = committed.chain(staged).collect();
        all.sort_by(|a, b| a.0.cmp(b.0));
        all.into_iter()
    }
}

fn read_snapshot<R: DeserializeOwned>(path: &Path) -> Result<BTreeMap<String, R>> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(BTreeMap::new()),
        Err(err) => return Err(CacheError::corrupt(path, err)),
    };

    let file: SnapshotFile<R> =
        serde_json::from_slice(&bytes).map_err(|err| CacheError::corrupt(path, err))?;
    if file.version != SNAPSHOT_VERSION {
        return Err(CacheError::corrupt(
            path,
            format!("unsupported snapshot version {}", file.version),
        ));
    }
    Ok(file.records)
}

fn write_snapshot<R: Serialize>(path: &Path, records: &BTreeMap<String, R>) -> io::Result<()> {
    let parent = path.parent().ok_or_else(|| {
        io::Error::other(format!("snapshot path {} has no parent directory", path.display()))
    })?;
    fs::create_dir_all(parent)?;

    let data = serde_json::to_vec(&SnapshotRef { version: SNAPSHOT_VERSION, records })?;
    let mut temp = NamedTempFile::new_in(parent)?;
    temp.write_all(&data)?;
    temp.flush()?;
    temp.as_file().sync_all()?;

    match temp.persist(path) {
        Ok(_) => Ok(()),
        Err(err) if err.error.kind() == io::ErrorKind::AlreadyExists => {
            match fs::remove_file(path) {
                Ok(()) => {}
                Err(remove_err) if remove_err.kind() == io::ErrorKind::NotFound => {}
                Err(remove_err) => return Err(remove_err),
            }
            err.file.persist(path).map(|_| ()).map_err(|persist_err| persist_err.error)
        }
        Err(err) => Err(err.error),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug, Default)]
    struct CountingHook {
        commits: Arc<AtomicUsize>,
    }

    impl SnapshotHook<u32> for CountingHook {
        fn opened(&self, records: &mut BTreeMap<String, u32>) -> Result<()> {
            records.retain(|_, value| *value != 0);
            Ok(())
        }

        fn committed(&self, changes: usize) {
            self.commits.fetch_add(changes, Ordering::SeqCst);
        }
    }

    #[test]
    fn committed_records_survive_reopen() -> Result<()> {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("store.json");

        let mut store = SnapshotStore::<u32>::open(&path)?;
        store.transaction(|tx| {
            tx.put("a", 1);
            tx.put("b", 2);
            Ok(())
        })?;

        let reopened = SnapshotStore::<u32>::open(&path)?;
        assert_eq!(reopened.get("a"), Some(&1));
        assert_eq!(reopened.len(), 2);
        Ok(())
    }

    #[test]
    fn failed_work_leaves_records_untouched() -> Result<()> {
        let temp = tempfile::tempdir().unwrap();
        let mut store = SnapshotStore::<u32>::open(temp.path().join("store.json"))?;
        store.transaction(|tx| {
            tx.put("a", 1);
            Ok(())
        })?;

        let result: Result<()> = store.transaction(|tx| {
            tx.delete("a");
            tx.put("b", 2);
            Err(CacheError::catalog("test", "abort"))
        });
        assert!(result.is_err());
        assert_eq!(store.get("a"), Some(&1));
        assert!(store.get("b").is_none());
        Ok(())
    }

    #[test]
    fn transactions_see_their_own_changes() -> Result<()> {
        let temp = tempfile::tempdir().unwrap();
        let mut store = SnapshotStore::<u32>::open(temp.path().join("store.json"))?;
        store.transaction(|tx| {
            tx.put("a", 1);
            tx.put("c", 3);
            Ok(())
        })?;

        let seen = store.transaction(|tx| {
            assert_eq!(tx.put("a", 10), Some(1));
            assert_eq!(tx.delete("c"), Some(3));
            tx.put("b", 2);
            Ok(tx.records().map(|(k, v)| (k.clone(), *v)).collect::<Vec<_>>())
        })?;
        assert_eq!(seen, vec![("a".to_string(), 10), ("b".to_string(), 2)]);
        Ok(())
    }

    #[test]
    fn hooks_repair_on_open_and_observe_commits() -> Result<()> {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("store.json");
        let mut store = SnapshotStore::<u32>::open(&path)?;
        store.transaction(|tx| {
            tx.put("zero", 0);
            tx.put("one", 1);
            Ok(())
        })?;

        let commits = Arc::new(AtomicUsize::new(0));
        let hook = CountingHook { commits: Arc::clone(&commits) };
        let hooks: Vec<Box<dyn SnapshotHook<u32>>> = vec![Box::new(hook)];
        let mut reopened = SnapshotStore::open_with_hooks(&path, hooks)?;
        assert!(reopened.get("zero").is_none());

        reopened.transaction(|tx| {
            tx.put("two", 2);
            Ok(())
        })?;
        assert_eq!(commits.load(Ordering::SeqCst), 1);
        Ok(())
    }

    #[test]
    fn malformed_snapshot_is_corrupt() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("store.json");
        fs::write(&path, b"{not json").unwrap();

        let err = SnapshotStore::<u32>::open(&path).unwrap_err();
        assert!(matches!(err, CacheError::CatalogCorrupt { .. }));
    }
}
