//! Catalog kept in an embedded SQLite database.

use std::path::{Path, PathBuf};

use rusqlite::{Connection, OptionalExtension, Row, Transaction, params};
use tracing::debug;

use crate::error::CacheError;
use crate::types::BackendKind;

use super::Result;
use super::backend::{CatalogBackend, CatalogRow, NewEntry};

const SCHEMA: &str = "
    PRAGMA journal_mode = WAL;
    PRAGMA synchronous = NORMAL;
    CREATE TABLE IF NOT EXISTS cache_entries (
        seq INTEGER PRIMARY KEY AUTOINCREMENT,
        key TEXT NOT NULL UNIQUE,
        storage_id TEXT NOT NULL,
        size INTEGER NOT NULL,
        access_time INTEGER NOT NULL,
        compressed INTEGER NOT NULL DEFAULT 0
    );
    CREATE INDEX IF NOT EXISTS cache_entries_recency ON cache_entries (access_time, seq);
";

const SELECT_BY_KEY: &str =
    "SELECT key, storage_id, size, access_time, compressed, seq FROM cache_entries WHERE key = ?1";
const INSERT: &str = "INSERT INTO cache_entries (key, storage_id, size, access_time, compressed) \
     VALUES (?1, ?2, ?3, ?4, ?5)";
const DELETE_BY_KEY: &str = "DELETE FROM cache_entries WHERE key = ?1";
const SELECT_BY_FRAGMENT: &str = "SELECT key, storage_id, size, access_time, compressed, seq \
     FROM cache_entries WHERE instr(key, ?1) > 0 ORDER BY seq";
const SELECT_EXCLUDING_FRAGMENT: &str = "SELECT key, storage_id, size, access_time, compressed, seq \
     FROM cache_entries WHERE instr(key, ?1) = 0 ORDER BY seq";
const TRIM_SCAN: &str = "SELECT key, storage_id, size, access_time, compressed, seq \
     FROM cache_entries ORDER BY access_time ASC, seq ASC LIMIT ?1";
const UPDATE_ACCESS: &str =
    "UPDATE cache_entries SET access_time = ?2 WHERE key = ?1 AND access_time < ?2";
const SUMMARY: &str = "SELECT COALESCE(SUM(size), 0), COUNT(*), COALESCE(MAX(access_time), 0) \
     FROM cache_entries";
const STORAGE_IDS: &str = "SELECT storage_id FROM cache_entries";

const STATEMENTS: [&str; 10] = [
    SELECT_BY_KEY,
    INSERT,
    DELETE_BY_KEY,
    SELECT_BY_FRAGMENT,
    SELECT_EXCLUDING_FRAGMENT,
    TRIM_SCAN,
    UPDATE_ACCESS,
    SUMMARY,
    STORAGE_IDS,
    "PRAGMA quick_check",
];

/// Relational catalog backend using cached prepared statements.
#[derive(Debug)]
pub struct SqliteCatalog {
    path: PathBuf,
    conn: Connection,
}

impl SqliteCatalog {
    /// Open or create the catalog database. Any failure to open, migrate, verify or prepare
    /// the statements is reported as [`CacheError::CatalogCorrupt`].
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path).map_err(|err| CacheError::corrupt(path, err))?;
        conn.execute_batch(SCHEMA).map_err(|err| CacheError::corrupt(path, err))?;
        conn.set_prepared_statement_cache_capacity(STATEMENTS.len() + 2);

        for sql in STATEMENTS {
            conn.prepare_cached(sql).map_err(|err| CacheError::corrupt(path, err))?;
        }

        let check: String = conn
            .query_row("PRAGMA quick_check", [], |row| row.get(0))
            .map_err(|err| CacheError::corrupt(path, err))?;
        if check != "ok" {
            return Err(CacheError::corrupt(path, format!("integrity check reported {check}")));
        }

        debug!(path = %path.display(), "opened sqlite catalog");
        Ok(Self { path: path.to_path_buf(), conn })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn summary(&self) -> Result<(u64, usize, u64)> {
        let mut stmt = self.conn.prepare_cached(SUMMARY).map_err(sql_err("summary"))?;
        stmt.query_row([], |row| {
            Ok((
                from_sql_int(row.get(0)?),
                from_sql_int(row.get(1)?) as usize,
                from_sql_int(row.get(2)?),
            ))
        })
        .map_err(sql_err("summary"))
    }

    fn query_rows(
        &self,
        sql: &str,
        operation: &'static str,
        arg: &dyn rusqlite::ToSql,
    ) -> Result<Vec<CatalogRow>> {
        let mut stmt = self.conn.prepare_cached(sql).map_err(sql_err(operation))?;
        let rows = stmt
            .query_map([arg], read_row)
            .map_err(sql_err(operation))?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(sql_err(operation))?;
        Ok(rows)
    }
}

impl CatalogBackend for SqliteCatalog {
    fn kind(&self) -> BackendKind {
        BackendKind::Sqlite
    }

    fn select(&mut self, key: &str) -> Result<Option<CatalogRow>> {
        select_in(&self.conn, key)
    }

    fn upsert(&mut self, entry: &NewEntry<'_>) -> Result<Option<CatalogRow>> {
        let tx = self.conn.transaction().map_err(sql_err("insert"))?;
        let previous = delete_in(&tx, entry.key)?;
        {
            let mut stmt = tx.prepare_cached(INSERT).map_err(sql_err("insert"))?;
            stmt.execute(params![
                entry.key,
                entry.storage_id,
                to_sql_int(entry.size),
                to_sql_int(entry.access_time),
                entry.compressed,
            ])
            .map_err(sql_err("insert"))?;
        }
        tx.commit().map_err(sql_err("insert"))?;
        Ok(previous)
    }

    fn delete_many(&mut self, keys: &[&str]) -> Result<Vec<CatalogRow>> {
        let tx = self.conn.transaction().map_err(sql_err("delete"))?;
        let mut removed = Vec::with_capacity(keys.len());
        for key in keys {
            if let Some(row) = delete_in(&tx, key)? {
                removed.push(row);
            }
        }
        tx.commit().map_err(sql_err("delete"))?;
        Ok(removed)
    }

    fn select_by_fragment(&mut self, fragment: &str, excluding: bool) -> Result<Vec<CatalogRow>> {
        let sql = if excluding { SELECT_EXCLUDING_FRAGMENT } else { SELECT_BY_FRAGMENT };
        self.query_rows(sql, "select by fragment", &fragment)
    }

    fn select_oldest(&mut self, limit: usize) -> Result<Vec<CatalogRow>> {
        self.query_rows(TRIM_SCAN, "trim scan", &(limit.min(i64::MAX as usize) as i64))
    }

    fn update_access_times(&mut self, updates: &[(String, u64)]) -> Result<usize> {
        if updates.is_empty() {
            return Ok(0);
        }
        let tx = self.conn.transaction().map_err(sql_err("update"))?;
        let mut changed = 0;
        {
            let mut stmt = tx.prepare_cached(UPDATE_ACCESS).map_err(sql_err("update"))?;
            for (key, access_time) in updates {
                changed +=
                    stmt.execute(params![key, to_sql_int(*access_time)]).map_err(sql_err("update"))?;
            }
        }
        tx.commit().map_err(sql_err("update"))?;
        Ok(changed)
    }

    fn total_size(&mut self) -> Result<u64> {
        Ok(self.summary()?.0)
    }

    fn len(&mut self) -> Result<usize> {
        Ok(self.summary()?.1)
    }

    fn storage_ids(&mut self) -> Result<Vec<String>> {
        let mut stmt = self.conn.prepare_cached(STORAGE_IDS).map_err(sql_err("list"))?;
        let ids = stmt
            .query_map([], |row| row.get::<_, String>(0))
            .map_err(sql_err("list"))?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(sql_err("list"))?;
        Ok(ids)
    }

    fn newest_access_time(&mut self) -> Result<u64> {
        Ok(self.summary()?.2)
    }
}

fn select_in(conn: &Connection, key: &str) -> Result<Option<CatalogRow>> {
    let mut stmt = conn.prepare_cached(SELECT_BY_KEY).map_err(sql_err("select"))?;
    stmt.query_row([key], read_row).optional().map_err(sql_err("select"))
}

fn delete_in(tx: &Transaction<'_>, key: &str) -> Result<Option<CatalogRow>> {
    let existing = select_in(tx, key)?;
    if existing.is_some() {
        let mut stmt = tx.prepare_cached(DELETE_BY_KEY).map_err(sql_err("delete"))?;
        stmt.execute([key]).map_err(sql_err("delete"))?;
    }
    Ok(existing)
}

fn read_row(row: &Row<'_>) -> rusqlite::Result<CatalogRow> {
    Ok(CatalogRow {
        key: row.get(0)?,
        storage_id: row.get(1)?,
        size: from_sql_int(row.get(2)?),
        access_time: from_sql_int(row.get(3)?),
        compressed: row.get(4)?,
        seq: from_sql_int(row.get(5)?),
    })
}

fn sql_err(operation: &'static str) -> impl Fn(rusqlite::Error) -> CacheError {
    move |err| CacheError::catalog(operation, err)
}

fn to_sql_int(value: u64) -> i64 {
    value.min(i64::MAX as u64) as i64
}

fn from_sql_int(value: i64) -> u64 {
    value.max(0) as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry<'a>(key: &'a str, storage_id: &'a str, size: u64, access_time: u64) -> NewEntry<'a> {
        NewEntry { key, storage_id, size, access_time, compressed: false }
    }

    #[test]
    fn upsert_replaces_and_reports_previous_row() -> Result<()> {
        let temp = tempfile::tempdir().unwrap();
        let mut catalog = SqliteCatalog::open(&temp.path().join("catalog.sqlite3"))?;

        assert!(catalog.upsert(&entry("a", "id-1", 10, 1))?.is_none());
        let previous = catalog.upsert(&entry("a", "id-2", 20, 2))?.expect("replaced row");
        assert_eq!(previous.storage_id, "id-1");

        let row = catalog.select("a")?.expect("row");
        assert_eq!(row.storage_id, "id-2");
        assert_eq!(catalog.total_size()?, 20);
        assert_eq!(catalog.len()?, 1);
        Ok(())
    }

    #[test]
    fn trim_scan_orders_by_access_then_insertion() -> Result<()> {
        let temp = tempfile::tempdir().unwrap();
        let mut catalog = SqliteCatalog::open(&temp.path().join("catalog.sqlite3"))?;
        catalog.upsert(&entry("late", "id-1", 1, 50))?;
        catalog.upsert(&entry("tie-first", "id-2", 1, 10))?;
        catalog.upsert(&entry("tie-second", "id-3", 1, 10))?;

        let keys: Vec<_> = catalog.select_oldest(10)?.into_iter().map(|row| row.key).collect();
        assert_eq!(keys, ["tie-first", "tie-second", "late"]);
        assert_eq!(catalog.select_oldest(1)?.len(), 1);
        Ok(())
    }

    #[test]
    fn access_times_only_move_forward() -> Result<()> {
        let temp = tempfile::tempdir().unwrap();
        let mut catalog = SqliteCatalog::open(&temp.path().join("catalog.sqlite3"))?;
        catalog.upsert(&entry("a", "id-1", 1, 100))?;

        let updates = vec![("a".to_string(), 50), ("missing".to_string(), 500)];
        assert_eq!(catalog.update_access_times(&updates)?, 0);
        assert_eq!(catalog.update_access_times(&[("a".to_string(), 200)])?, 1);
        assert_eq!(catalog.select("a")?.unwrap().access_time, 200);
        assert_eq!(catalog.newest_access_time()?, 200);
        Ok(())
    }

    #[test]
    fn fragments_select_and_exclude() -> Result<()> {
        let temp = tempfile::tempdir().unwrap();
        let mut catalog = SqliteCatalog::open(&temp.path().join("catalog.sqlite3"))?;
        catalog.upsert(&entry("img_1", "id-1", 1, 1))?;
        catalog.upsert(&entry("doc_1", "id-2", 1, 2))?;
        catalog.upsert(&entry("100%_img_", "id-3", 1, 3))?;

        let matching: Vec<_> =
            catalog.select_by_fragment("img_", false)?.into_iter().map(|r| r.key).collect();
        assert_eq!(matching, ["img_1", "100%_img_"]);
        let others: Vec<_> =
            catalog.select_by_fragment("img_", true)?.into_iter().map(|r| r.key).collect();
        assert_eq!(others, ["doc_1"]);
        Ok(())
    }

    #[test]
    fn garbage_file_is_reported_as_corrupt() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("catalog.sqlite3");
        std::fs::write(&path, vec![0x42; 4096]).unwrap();

        let err = SqliteCatalog::open(&path).unwrap_err();
        assert!(matches!(err, CacheError::CatalogCorrupt { .. }));
    }
}
