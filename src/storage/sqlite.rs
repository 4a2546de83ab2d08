//! SQLite change log store.
//!
//! One rusqlite connection behind a `ReentrantMutex<RefCell<_>>`: a batch
//! holds the lock for its whole duration and the log calls made inside the
//! batch lock it again on the same thread.

use std::cell::{Cell, RefCell};
use std::path::Path;

use parking_lot::ReentrantMutex;
use rusqlite::{params, OptionalExtension};

use crate::error::{OfflineError, Result, StorageError};
use crate::types::{
    AttributeAddition, AttributeValueChange, CommitNo, DatasetHandle, FeatureId, Field, FieldType,
    Geometry, GeometryChange, PendingChanges,
};

use super::traits::ChangeLogBackend;

/// Counter that allocates dataset handles. Global, stored under dataset -1.
const DATASET_ID_COUNTER: &str = "dataset_id";
/// Per-dataset commit counter.
const COMMIT_NO_COUNTER: &str = "commit_no";
const GLOBAL_SCOPE: DatasetHandle = -1;

/// Tables holding change rows, keyed by `layer_id`.
const CHANGE_TABLES: [&str; 5] = [
    "log_added_attrs",
    "log_added_features",
    "log_removed_features",
    "log_feature_updates",
    "log_geometry_updates",
];

/// Tables whose rows carry a `commit_no`.
const COMMIT_TABLES: [&str; 3] = [
    "log_added_attrs",
    "log_feature_updates",
    "log_geometry_updates",
];

/// Map a rusqlite error to an `OfflineError`.
pub(crate) fn storage_err(e: rusqlite::Error) -> OfflineError {
    OfflineError::Storage(StorageError::Sqlite(e))
}

/// Connection tuning applied when the store is opened.
#[derive(Debug, Clone)]
pub struct LogStoreOptions {
    /// How long a writer waits on a lock held by another connection.
    pub busy_timeout_ms: u32,
    /// Use write-ahead logging (ignored for in-memory stores).
    pub wal: bool,
}

impl Default for LogStoreOptions {
    fn default() -> Self {
        Self {
            busy_timeout_ms: 5000,
            wal: true,
        }
    }
}

// ============================================================================
// SqliteLogStore
// ============================================================================

/// SQLite-backed change log and identifier map.
pub struct SqliteLogStore {
    pub(crate) conn: ReentrantMutex<RefCell<rusqlite::Connection>>,
}

impl SqliteLogStore {
    /// Open (creating if needed) a file-backed log with default options.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::open_with(path, &LogStoreOptions::default())
    }

    pub fn open_with(path: impl AsRef<Path>, options: &LogStoreOptions) -> Result<Self> {
        let conn = rusqlite::Connection::open(path.as_ref()).map_err(storage_err)?;
        let store = Self {
            conn: ReentrantMutex::new(RefCell::new(conn)),
        };
        store.initialize(options, true)?;
        Ok(store)
    }

    /// Open an in-memory log (useful for tests).
    pub fn open_in_memory() -> Result<Self> {
        let conn = rusqlite::Connection::open_in_memory().map_err(storage_err)?;
        let store = Self {
            conn: ReentrantMutex::new(RefCell::new(conn)),
        };
        store.initialize(&LogStoreOptions::default(), false)?;
        Ok(store)
    }

    /// Apply pragmas and create the logging tables.
    fn initialize(&self, options: &LogStoreOptions, file_backed: bool) -> Result<()> {
        let guard = self.conn.lock();
        let conn = guard.borrow();

        let journal = if file_backed && options.wal {
            "PRAGMA journal_mode=WAL;"
        } else {
            ""
        };
        conn.execute_batch(&format!(
            "{journal}
             PRAGMA synchronous=NORMAL;
             PRAGMA busy_timeout={};",
            options.busy_timeout_ms
        ))
        .map_err(storage_err)?;

        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS log_indices (
                name        TEXT NOT NULL,
                dataset_id  INTEGER NOT NULL,
                last_index  INTEGER NOT NULL,
                PRIMARY KEY (name, dataset_id)
            );
            CREATE TABLE IF NOT EXISTS log_layer_ids (
                id    INTEGER PRIMARY KEY,
                name  TEXT NOT NULL UNIQUE
            );
            CREATE TABLE IF NOT EXISTS log_fids (
                layer_id     INTEGER NOT NULL,
                offline_fid  INTEGER NOT NULL,
                remote_fid   INTEGER NOT NULL,
                PRIMARY KEY (layer_id, offline_fid)
            );
            CREATE INDEX IF NOT EXISTS idx_log_fids_remote
                ON log_fids(layer_id, remote_fid);
            CREATE TABLE IF NOT EXISTS log_added_attrs (
                layer_id   INTEGER NOT NULL,
                commit_no  INTEGER NOT NULL,
                name       TEXT NOT NULL,
                type       TEXT NOT NULL,
                length     INTEGER NOT NULL,
                precision  INTEGER NOT NULL,
                comment    TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS log_added_features (
                layer_id  INTEGER NOT NULL,
                fid       INTEGER NOT NULL
            );
            CREATE TABLE IF NOT EXISTS log_removed_features (
                layer_id  INTEGER NOT NULL,
                fid       INTEGER NOT NULL
            );
            CREATE TABLE IF NOT EXISTS log_feature_updates (
                layer_id   INTEGER NOT NULL,
                commit_no  INTEGER NOT NULL,
                fid        INTEGER NOT NULL,
                attr       INTEGER NOT NULL,
                value      TEXT
            );
            CREATE TABLE IF NOT EXISTS log_geometry_updates (
                layer_id   INTEGER NOT NULL,
                commit_no  INTEGER NOT NULL,
                fid        INTEGER NOT NULL,
                geom_wkt   TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_log_added_features
                ON log_added_features(layer_id, fid);",
        )
        .map_err(storage_err)?;

        conn.execute(
            "INSERT OR IGNORE INTO log_indices (name, dataset_id, last_index) VALUES (?1, ?2, 0)",
            params![DATASET_ID_COUNTER, GLOBAL_SCOPE],
        )
        .map_err(storage_err)?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Internal helpers
    // -----------------------------------------------------------------------

    /// Execute `f` with a shared reference to the underlying connection.
    pub(crate) fn with_conn<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&rusqlite::Connection) -> rusqlite::Result<T>,
    {
        let guard = self.conn.lock();
        let conn = guard.borrow();
        f(&conn).map_err(storage_err)
    }

    fn read_counter(&self, name: &str, scope: DatasetHandle) -> Result<i64> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT last_index FROM log_indices WHERE name = ?1 AND dataset_id = ?2",
                params![name, scope],
                |row| row.get::<_, i64>(0),
            )
            .optional()
            .map(|v| v.unwrap_or(0))
        })
    }

    fn write_counter(&self, name: &str, scope: DatasetHandle, value: i64) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT OR REPLACE INTO log_indices (name, dataset_id, last_index) \
                 VALUES (?1, ?2, ?3)",
                params![name, scope, value],
            )
            .map(|_| ())
        })
    }

    fn query_fids(&self, sql: &str, handle: DatasetHandle) -> Result<Vec<FeatureId>> {
        let guard = self.conn.lock();
        let conn = guard.borrow();
        let mut stmt = conn.prepare_cached(sql).map_err(storage_err)?;
        let rows = stmt
            .query_map(params![handle], |row| row.get::<_, FeatureId>(0))
            .map_err(storage_err)?;
        let fids: rusqlite::Result<Vec<_>> = rows.collect();
        fids.map_err(storage_err)
    }

    fn count_rows(&self, table: &str, handle: DatasetHandle) -> Result<usize> {
        let sql = format!("SELECT COUNT(*) FROM {table} WHERE layer_id = ?1");
        self.with_conn(|conn| {
            conn.query_row(&sql, params![handle], |row| row.get::<_, i64>(0))
                .map(|n| n as usize)
        })
    }
}

// ============================================================================
// ChangeLogBackend implementation
// ============================================================================

impl ChangeLogBackend for SqliteLogStore {
    fn dataset_handle(&self, name: &str) -> Result<Option<DatasetHandle>> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT id FROM log_layer_ids WHERE name = ?1",
                params![name],
                |row| row.get::<_, DatasetHandle>(0),
            )
            .optional()
        })
    }

    fn get_or_create_dataset_handle(&self, name: &str) -> Result<DatasetHandle> {
        self.transaction(|store| {
            if let Some(handle) = store.dataset_handle(name)? {
                return Ok(handle);
            }
            let handle = store.read_counter(DATASET_ID_COUNTER, GLOBAL_SCOPE)?;
            store.with_conn(|conn| {
                conn.execute(
                    "INSERT INTO log_layer_ids (id, name) VALUES (?1, ?2)",
                    params![handle, name],
                )
                .map(|_| ())
            })?;
            store.write_counter(DATASET_ID_COUNTER, GLOBAL_SCOPE, handle + 1)?;
            Ok(handle)
        })
    }

    fn datasets(&self) -> Result<Vec<(DatasetHandle, String)>> {
        let guard = self.conn.lock();
        let conn = guard.borrow();
        let mut stmt = conn
            .prepare_cached("SELECT id, name FROM log_layer_ids ORDER BY id")
            .map_err(storage_err)?;
        let rows = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))
            .map_err(storage_err)?;
        let datasets: rusqlite::Result<Vec<_>> = rows.collect();
        datasets.map_err(storage_err)
    }

    fn commit_no(&self, handle: DatasetHandle) -> Result<CommitNo> {
        self.read_counter(COMMIT_NO_COUNTER, handle)
    }

    fn increase_commit_no(&self, handle: DatasetHandle) -> Result<CommitNo> {
        self.transaction(|store| {
            let next = store.commit_no(handle)? + 1;
            store.write_counter(COMMIT_NO_COUNTER, handle, next)?;
            Ok(next)
        })
    }

    fn reset_commit_no(&self, handle: DatasetHandle) -> Result<()> {
        self.write_counter(COMMIT_NO_COUNTER, handle, 0)
    }

    fn log_attribute_addition(
        &self,
        handle: DatasetHandle,
        commit: CommitNo,
        field: &Field,
    ) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO log_added_attrs \
                 (layer_id, commit_no, name, type, length, precision, comment) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    handle,
                    commit,
                    field.name,
                    field.field_type.tag(),
                    field.length,
                    field.precision,
                    field.comment,
                ],
            )
            .map(|_| ())
        })
    }

    fn log_feature_addition(&self, handle: DatasetHandle, fid: FeatureId) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO log_added_features (layer_id, fid) VALUES (?1, ?2)",
                params![handle, fid],
            )
            .map(|_| ())
        })
    }

    fn log_feature_removal(&self, handle: DatasetHandle, fid: FeatureId) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO log_removed_features (layer_id, fid) VALUES (?1, ?2)",
                params![handle, fid],
            )
            .map(|_| ())
        })
    }

    fn remove_feature_addition(&self, handle: DatasetHandle, fid: FeatureId) -> Result<bool> {
        self.with_conn(|conn| {
            conn.execute(
                "DELETE FROM log_added_features WHERE layer_id = ?1 AND fid = ?2",
                params![handle, fid],
            )
            .map(|n| n > 0)
        })
    }

    fn log_attribute_value_change(
        &self,
        handle: DatasetHandle,
        commit: CommitNo,
        fid: FeatureId,
        field_index: usize,
        value: Option<&str>,
    ) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO log_feature_updates (layer_id, commit_no, fid, attr, value) \
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![handle, commit, fid, field_index as i64, value],
            )
            .map(|_| ())
        })
    }

    fn log_geometry_change(
        &self,
        handle: DatasetHandle,
        commit: CommitNo,
        fid: FeatureId,
        geometry: &Geometry,
    ) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO log_geometry_updates (layer_id, commit_no, fid, geom_wkt) \
                 VALUES (?1, ?2, ?3, ?4)",
                params![handle, commit, fid, geometry.as_wkt()],
            )
            .map(|_| ())
        })
    }

    fn is_added_feature(&self, handle: DatasetHandle, fid: FeatureId) -> Result<bool> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT COUNT(*) FROM log_added_features WHERE layer_id = ?1 AND fid = ?2",
                params![handle, fid],
                |row| row.get::<_, i64>(0),
            )
            .map(|n| n > 0)
        })
    }

    fn attribute_additions(
        &self,
        handle: DatasetHandle,
        commit: CommitNo,
    ) -> Result<Vec<AttributeAddition>> {
        let rows: Vec<(String, String, i32, i32, String)> = {
            let guard = self.conn.lock();
            let conn = guard.borrow();
            let mut stmt = conn
                .prepare_cached(
                    "SELECT name, type, length, precision, comment FROM log_added_attrs \
                     WHERE layer_id = ?1 AND commit_no = ?2 ORDER BY rowid",
                )
                .map_err(storage_err)?;
            let rows = stmt
                .query_map(params![handle, commit], |row| {
                    Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?))
                })
                .map_err(storage_err)?;
            let rows: rusqlite::Result<Vec<_>> = rows.collect();
            rows.map_err(storage_err)?
        };

        rows.into_iter()
            .map(|(name, tag, length, precision, comment)| {
                let field_type = FieldType::from_tag(&tag).ok_or_else(|| {
                    OfflineError::Storage(StorageError::Corruption {
                        table: "log_added_attrs".to_string(),
                        column: "type".to_string(),
                        message: format!("unknown field type \"{tag}\""),
                    })
                })?;
                Ok(AttributeAddition {
                    commit,
                    field: Field {
                        name,
                        field_type,
                        type_name: None,
                        length,
                        precision,
                        comment,
                    },
                })
            })
            .collect()
    }

    fn feature_additions(&self, handle: DatasetHandle) -> Result<Vec<FeatureId>> {
        self.query_fids(
            "SELECT fid FROM log_added_features WHERE layer_id = ?1 ORDER BY rowid",
            handle,
        )
    }

    fn feature_removals(&self, handle: DatasetHandle) -> Result<Vec<FeatureId>> {
        self.query_fids(
            "SELECT fid FROM log_removed_features WHERE layer_id = ?1 ORDER BY rowid",
            handle,
        )
    }

    fn attribute_value_changes(
        &self,
        handle: DatasetHandle,
        commit: CommitNo,
    ) -> Result<Vec<AttributeValueChange>> {
        let rows: Vec<(FeatureId, i64, Option<String>)> = {
            let guard = self.conn.lock();
            let conn = guard.borrow();
            let mut stmt = conn
                .prepare_cached(
                    "SELECT fid, attr, value FROM log_feature_updates \
                     WHERE layer_id = ?1 AND commit_no = ?2 ORDER BY rowid",
                )
                .map_err(storage_err)?;
            let rows = stmt
                .query_map(params![handle, commit], |row| {
                    Ok((row.get(0)?, row.get(1)?, row.get(2)?))
                })
                .map_err(storage_err)?;
            let rows: rusqlite::Result<Vec<_>> = rows.collect();
            rows.map_err(storage_err)?
        };

        rows.into_iter()
            .map(|(fid, attr, value)| {
                let field_index = usize::try_from(attr).map_err(|_| {
                    OfflineError::Storage(StorageError::Corruption {
                        table: "log_feature_updates".to_string(),
                        column: "attr".to_string(),
                        message: format!("negative field index {attr}"),
                    })
                })?;
                Ok(AttributeValueChange {
                    commit,
                    fid,
                    field_index,
                    value,
                })
            })
            .collect()
    }

    fn geometry_changes(
        &self,
        handle: DatasetHandle,
        commit: CommitNo,
    ) -> Result<Vec<GeometryChange>> {
        let guard = self.conn.lock();
        let conn = guard.borrow();
        let mut stmt = conn
            .prepare_cached(
                "SELECT fid, geom_wkt FROM log_geometry_updates \
                 WHERE layer_id = ?1 AND commit_no = ?2 ORDER BY rowid",
            )
            .map_err(storage_err)?;
        let rows = stmt
            .query_map(params![handle, commit], |row| {
                Ok(GeometryChange {
                    commit,
                    fid: row.get(0)?,
                    geometry: Geometry::from_wkt(row.get::<_, String>(1)?),
                })
            })
            .map_err(storage_err)?;
        let changes: rusqlite::Result<Vec<_>> = rows.collect();
        changes.map_err(storage_err)
    }

    fn pending_changes(&self, handle: DatasetHandle) -> Result<PendingChanges> {
        Ok(PendingChanges {
            commits: self.commit_no(handle)?,
            added_fields: self.count_rows("log_added_attrs", handle)?,
            added_features: self.count_rows("log_added_features", handle)?,
            removed_features: self.count_rows("log_removed_features", handle)?,
            value_changes: self.count_rows("log_feature_updates", handle)?,
            geometry_changes: self.count_rows("log_geometry_updates", handle)?,
        })
    }

    fn purge(&self, handle: DatasetHandle, commit: Option<CommitNo>) -> Result<()> {
        self.transaction(|store| {
            match commit {
                Some(commit) => {
                    for table in COMMIT_TABLES {
                        let sql =
                            format!("DELETE FROM {table} WHERE layer_id = ?1 AND commit_no = ?2");
                        store.with_conn(|conn| conn.execute(&sql, params![handle, commit]))?;
                    }
                }
                None => {
                    for table in CHANGE_TABLES {
                        let sql = format!("DELETE FROM {table} WHERE layer_id = ?1");
                        store.with_conn(|conn| conn.execute(&sql, params![handle]))?;
                    }
                }
            }
            Ok(())
        })
    }

    fn transaction<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Self) -> Result<T>,
    {
        // Savepoint names are unique per thread so batches nest.
        thread_local! {
            static SP_COUNTER: Cell<u64> = const { Cell::new(0) };
        }
        let sp_name = SP_COUNTER.with(|c| {
            let n = c.get();
            c.set(n + 1);
            format!("sp_{n}")
        });

        // Held for the whole batch so no other thread interleaves writes.
        let guard = self.conn.lock();
        guard
            .borrow()
            .execute(&format!("SAVEPOINT {sp_name}"), [])
            .map_err(storage_err)?;

        match f(self) {
            Ok(v) => {
                let released = guard
                    .borrow()
                    .execute(&format!("RELEASE SAVEPOINT {sp_name}"), []);
                match released {
                    Ok(_) => Ok(v),
                    Err(e) => {
                        let _ = guard
                            .borrow()
                            .execute(&format!("ROLLBACK TO SAVEPOINT {sp_name}"), []);
                        Err(OfflineError::Storage(StorageError::Transaction {
                            message: "RELEASE SAVEPOINT failed".to_string(),
                            source: Some(Box::new(e)),
                        }))
                    }
                }
            }
            Err(e) => {
                let conn = guard.borrow();
                let _ = conn.execute(&format!("ROLLBACK TO SAVEPOINT {sp_name}"), []);
                let _ = conn.execute(&format!("RELEASE SAVEPOINT {sp_name}"), []);
                Err(e)
            }
        }
    }
}
