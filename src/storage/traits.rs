/// Change log storage traits.
///
/// `ChangeLogBackend` is the durable record of offline edits plus the
/// sequencing counters; `IdentifierMap` is the local <-> remote feature id
/// table. Both are implemented by `SqliteLogStore`; the recorder and the
/// replay engine are generic over [`LogStore`].
use crate::error::Result;
use crate::types::{
    AttributeAddition, AttributeValueChange, CommitNo, DatasetHandle, FeatureId, Field, Geometry,
    GeometryChange, PendingChanges,
};

/// Append-only change log with per-dataset commit sequencing.
///
/// Implementors must be `Send + Sync` so recorder callbacks can share them.
pub trait ChangeLogBackend: Send + Sync {
    // -- dataset handles ---------------------------------------------------

    /// Handle of an already logged dataset.
    fn dataset_handle(&self, name: &str) -> Result<Option<DatasetHandle>>;

    /// Handle of `name`, allocated from the `dataset_id` counter on first use.
    fn get_or_create_dataset_handle(&self, name: &str) -> Result<DatasetHandle>;

    /// Every logged dataset as `(handle, name)`, ascending by handle.
    fn datasets(&self) -> Result<Vec<(DatasetHandle, String)>>;

    // -- commit sequence ---------------------------------------------------

    /// Current commit number of the dataset (0 when nothing was committed).
    fn commit_no(&self, handle: DatasetHandle) -> Result<CommitNo>;

    /// Advance the dataset's commit number by one and return the new value.
    fn increase_commit_no(&self, handle: DatasetHandle) -> Result<CommitNo>;

    fn reset_commit_no(&self, handle: DatasetHandle) -> Result<()>;

    // -- writes ------------------------------------------------------------

    fn log_attribute_addition(
        &self,
        handle: DatasetHandle,
        commit: CommitNo,
        field: &Field,
    ) -> Result<()>;

    fn log_feature_addition(&self, handle: DatasetHandle, fid: FeatureId) -> Result<()>;

    fn log_feature_removal(&self, handle: DatasetHandle, fid: FeatureId) -> Result<()>;

    /// Retire a pending feature addition. Returns `false` if there was none.
    fn remove_feature_addition(&self, handle: DatasetHandle, fid: FeatureId) -> Result<bool>;

    fn log_attribute_value_change(
        &self,
        handle: DatasetHandle,
        commit: CommitNo,
        fid: FeatureId,
        field_index: usize,
        value: Option<&str>,
    ) -> Result<()>;

    fn log_geometry_change(
        &self,
        handle: DatasetHandle,
        commit: CommitNo,
        fid: FeatureId,
        geometry: &Geometry,
    ) -> Result<()>;

    // -- queries (insertion order) -------------------------------------------

    fn is_added_feature(&self, handle: DatasetHandle, fid: FeatureId) -> Result<bool>;

    fn attribute_additions(
        &self,
        handle: DatasetHandle,
        commit: CommitNo,
    ) -> Result<Vec<AttributeAddition>>;

    fn feature_additions(&self, handle: DatasetHandle) -> Result<Vec<FeatureId>>;

    fn feature_removals(&self, handle: DatasetHandle) -> Result<Vec<FeatureId>>;

    fn attribute_value_changes(
        &self,
        handle: DatasetHandle,
        commit: CommitNo,
    ) -> Result<Vec<AttributeValueChange>>;

    fn geometry_changes(&self, handle: DatasetHandle, commit: CommitNo)
        -> Result<Vec<GeometryChange>>;

    fn pending_changes(&self, handle: DatasetHandle) -> Result<PendingChanges>;

    // -- deletes -----------------------------------------------------------

    /// Delete logged rows of a dataset. With `commit`, only the commit-numbered
    /// rows (attribute additions, value and geometry changes) of that commit go;
    /// without it every change row of the dataset goes.
    fn purge(&self, handle: DatasetHandle, commit: Option<CommitNo>) -> Result<()>;

    /// Execute a closure as one atomic batch.
    ///
    /// Implementations begin a transaction (or savepoint) before calling `f`
    /// and commit after it returns `Ok`, rolling back otherwise. Batches nest.
    fn transaction<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Self) -> Result<T>;
}

/// Bidirectional local <-> remote feature id map, one row per
/// `(dataset, local id)`.
pub trait IdentifierMap {
    /// Insert or replace the mapping of `local`.
    fn record_mapping(&self, handle: DatasetHandle, local: FeatureId, remote: FeatureId)
        -> Result<()>;

    /// Record `(local, remote)` pairs as one atomic batch.
    fn record_mappings(&self, handle: DatasetHandle, pairs: &[(FeatureId, FeatureId)])
        -> Result<()>;

    fn remote_id_for(&self, handle: DatasetHandle, local: FeatureId) -> Result<Option<FeatureId>>;

    fn local_id_for(&self, handle: DatasetHandle, remote: FeatureId) -> Result<Option<FeatureId>>;

    /// Returns `false` if `local` had no mapping.
    fn remove_mapping(&self, handle: DatasetHandle, local: FeatureId) -> Result<bool>;

    fn mapping_count(&self, handle: DatasetHandle) -> Result<usize>;
}

/// Everything the recorder and the replay engine need from a log store.
pub trait LogStore: ChangeLogBackend + IdentifierMap {}

impl<T: ChangeLogBackend + IdentifierMap> LogStore for T {}
