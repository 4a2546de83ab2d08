//! `OfflineEditing`, the entry point embedders use.
//!
//! Owns one change log store and wires the recorder and the replay engine to
//! it. Recording and replay of the same dataset are mutually exclusive: a
//! dataset must be detached from the recorder before it can be synchronized.

use std::path::Path;
use std::sync::Arc;

use crate::dataset::{Dataset, DatasetProvider, ObservableDataset};
use crate::error::{Result, SyncError};
use crate::recorder::{ChangeRecorder, RecorderOptions};
use crate::storage::{LogStore, LogStoreOptions, SqliteLogStore};
use crate::sync::{ReplayEngine, ReplayState, SyncOptions, SyncReport};
use crate::types::{DatasetHandle, FeatureId, PendingChanges};

/// Options for [`OfflineEditing`].
#[derive(Clone, Default)]
pub struct OfflineOptions {
    pub store: LogStoreOptions,
    pub recorder: RecorderOptions,
    pub sync: SyncOptions,
}

pub struct OfflineEditing<B: LogStore = SqliteLogStore> {
    store: Arc<B>,
    recorder: ChangeRecorder<B>,
    engine: ReplayEngine<B>,
}

impl OfflineEditing<SqliteLogStore> {
    /// Open (or create) the SQLite change log at `path`.
    pub fn open(
        path: impl AsRef<Path>,
        provider: Arc<dyn DatasetProvider>,
        options: OfflineOptions,
    ) -> std::result::Result<Self, SyncError> {
        let path = path.as_ref();
        let store = SqliteLogStore::open_with(path, &options.store).map_err(|e| {
            tracing::error!(path = %path.display(), error = %e, "cannot open change log");
            SyncError::StoreUnavailable {
                message: format!("{}: {e}", path.display()),
            }
        })?;
        Ok(Self::new(Arc::new(store), provider, options))
    }
}

impl<B: LogStore + 'static> OfflineEditing<B> {
    pub fn new(store: Arc<B>, provider: Arc<dyn DatasetProvider>, options: OfflineOptions) -> Self {
        Self {
            recorder: ChangeRecorder::new(Arc::clone(&store), options.recorder),
            engine: ReplayEngine::new(Arc::clone(&store), provider, options.sync),
            store,
        }
    }

    pub fn store(&self) -> &Arc<B> {
        &self.store
    }

    // -----------------------------------------------------------------------
    // Offline phase
    // -----------------------------------------------------------------------

    /// Mark `dataset` as detached and record the id mappings the bulk copy
    /// produced for its pre-existing features, as one batch.
    pub fn register_detached(
        &self,
        dataset: &str,
        pairs: &[(FeatureId, FeatureId)],
    ) -> Result<DatasetHandle> {
        let handle = self.store.transaction(|store| {
            let handle = store.get_or_create_dataset_handle(dataset)?;
            store.record_mappings(handle, pairs)?;
            Ok(handle)
        })?;
        tracing::info!(dataset, handle, mappings = pairs.len(), "registered detached dataset");
        Ok(handle)
    }

    pub fn start_recording(&self, dataset: &dyn ObservableDataset) -> bool {
        self.recorder.start_recording(dataset)
    }

    pub fn stop_recording(&self, dataset: &dyn ObservableDataset) -> bool {
        self.recorder.stop_recording(dataset)
    }

    pub fn is_recording(&self, dataset: &str) -> bool {
        self.recorder.is_recording(dataset)
    }

    /// Whether `dataset` has an entry in the change log.
    pub fn is_offline(&self, dataset: &str) -> Result<bool> {
        Ok(self.store.dataset_handle(dataset)?.is_some())
    }

    /// What is waiting to be replayed for `dataset`; empty if it never was
    /// logged.
    pub fn pending_changes(&self, dataset: &str) -> Result<PendingChanges> {
        match self.store.dataset_handle(dataset)? {
            Some(handle) => self.store.pending_changes(handle),
            None => Ok(PendingChanges::default()),
        }
    }

    /// Names of all logged datasets, in handle order.
    pub fn datasets(&self) -> Result<Vec<String>> {
        Ok(self
            .store
            .datasets()?
            .into_iter()
            .map(|(_, name)| name)
            .collect())
    }

    // -----------------------------------------------------------------------
    // Reconnect phase
    // -----------------------------------------------------------------------

    /// Replay the logged edits of `local` onto the dataset at `remote_locator`.
    pub fn synchronize(
        &self,
        local: &dyn Dataset,
        remote_locator: &str,
    ) -> std::result::Result<SyncReport, SyncError> {
        if self.recorder.is_recording(local.name()) {
            return Err(SyncError::StillRecording(local.name().to_string()));
        }
        self.engine.synchronize(local, remote_locator)
    }

    /// Synchronize several datasets one after another; a failure in one does
    /// not stop the rest.
    pub fn synchronize_all(
        &self,
        targets: &[(&dyn Dataset, &str)],
    ) -> Vec<(String, std::result::Result<SyncReport, SyncError>)> {
        let total = targets.len();
        targets
            .iter()
            .enumerate()
            .map(|(i, &(local, locator))| {
                self.engine.dataset_started(i + 1, total, local.name());
                (local.name().to_string(), self.synchronize(local, locator))
            })
            .collect()
    }

    pub fn replay_state(&self, dataset: &str) -> ReplayState {
        self.engine.state(dataset)
    }
}
