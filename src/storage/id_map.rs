//! `IdentifierMap` over the `log_fids` table of [`SqliteLogStore`].

use rusqlite::{params, OptionalExtension};

use crate::error::Result;
use crate::types::{DatasetHandle, FeatureId};

use super::sqlite::SqliteLogStore;
use super::traits::{ChangeLogBackend, IdentifierMap};

impl IdentifierMap for SqliteLogStore {
    fn record_mapping(
        &self,
        handle: DatasetHandle,
        local: FeatureId,
        remote: FeatureId,
    ) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT OR REPLACE INTO log_fids (layer_id, offline_fid, remote_fid) \
                 VALUES (?1, ?2, ?3)",
                params![handle, local, remote],
            )
            .map(|_| ())
        })
    }

    fn record_mappings(
        &self,
        handle: DatasetHandle,
        pairs: &[(FeatureId, FeatureId)],
    ) -> Result<()> {
        self.transaction(|store| {
            for &(local, remote) in pairs {
                store.record_mapping(handle, local, remote)?;
            }
            Ok(())
        })
    }

    fn remote_id_for(&self, handle: DatasetHandle, local: FeatureId) -> Result<Option<FeatureId>> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT remote_fid FROM log_fids WHERE layer_id = ?1 AND offline_fid = ?2",
                params![handle, local],
                |row| row.get(0),
            )
            .optional()
        })
    }

    fn local_id_for(&self, handle: DatasetHandle, remote: FeatureId) -> Result<Option<FeatureId>> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT offline_fid FROM log_fids WHERE layer_id = ?1 AND remote_fid = ?2 \
                 ORDER BY offline_fid LIMIT 1",
                params![handle, remote],
                |row| row.get(0),
            )
            .optional()
        })
    }

    fn remove_mapping(&self, handle: DatasetHandle, local: FeatureId) -> Result<bool> {
        self.with_conn(|conn| {
            conn.execute(
                "DELETE FROM log_fids WHERE layer_id = ?1 AND offline_fid = ?2",
                params![handle, local],
            )
            .map(|n| n > 0)
        })
    }

    fn mapping_count(&self, handle: DatasetHandle) -> Result<usize> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT COUNT(*) FROM log_fids WHERE layer_id = ?1",
                params![handle],
                |row| row.get::<_, i64>(0),
            )
            .map(|n| n as usize)
        })
    }
}
