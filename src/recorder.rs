//! Change recorder: turns committed-edit notifications of an offline dataset
//! into change log rows.
//!
//! Rules:
//! - added features are logged with the ids the local store assigned;
//! - removing a feature that is still a pending addition retires the
//!   addition instead of logging a removal;
//! - value and geometry changes of pending additions are not logged, the
//!   addition replays the feature's final state;
//! - field additions, value changes and geometry changes of one local commit
//!   share the dataset's current commit number, which advances by one when
//!   the commit finishes.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::codec::encode_value;
use crate::dataset::{EditEvent, ListenerId, ObservableDataset};
use crate::error::Result;
use crate::storage::LogStore;
use crate::types::{AttributeChanges, FeatureId, Field, GeometryChanges};

/// A log write that failed inside a notification callback.
#[derive(Debug, Clone)]
pub struct RecorderError {
    pub dataset: String,
    pub error: String,
}

/// Callback type for recorder failures.
pub type RecorderErrorCallback = dyn Fn(&RecorderError) + Send + Sync;

/// Configuration for `ChangeRecorder`.
#[derive(Clone, Default)]
pub struct RecorderOptions {
    /// Called when a notification could not be written to the log
    pub on_error: Option<Arc<RecorderErrorCallback>>,
}

// ============================================================================
// DatasetRecorder
// ============================================================================

/// Records the notifications of a single dataset.
pub struct DatasetRecorder<B: LogStore> {
    store: Arc<B>,
    dataset: String,
    /// Set once a commit-numbered row (or skip) happened in the open commit
    sequenced: AtomicBool,
}

impl<B: LogStore> DatasetRecorder<B> {
    pub fn new(store: Arc<B>, dataset: impl Into<String>) -> Self {
        Self {
            store,
            dataset: dataset.into(),
            sequenced: AtomicBool::new(false),
        }
    }

    pub fn dataset(&self) -> &str {
        &self.dataset
    }

    /// Write one notification to the log as an atomic batch.
    pub fn handle_event(&self, event: &EditEvent) -> Result<()> {
        if event.is_sequenced() {
            self.sequenced.store(true, Ordering::SeqCst);
        }
        match event {
            EditEvent::FieldsAdded(fields) => self.fields_added(fields),
            EditEvent::FeaturesAdded(ids) => self.features_added(ids),
            EditEvent::FeaturesRemoved(ids) => self.features_removed(ids),
            EditEvent::AttributeValuesChanged(changes) => self.values_changed(changes),
            EditEvent::GeometriesChanged(changes) => self.geometries_changed(changes),
            EditEvent::CommitFinished => self.commit_finished(),
        }
    }

    fn fields_added(&self, fields: &[Field]) -> Result<()> {
        self.store.transaction(|store| {
            let handle = store.get_or_create_dataset_handle(&self.dataset)?;
            let commit = store.commit_no(handle)?;
            for field in fields {
                store.log_attribute_addition(handle, commit, field)?;
            }
            tracing::debug!(dataset = %self.dataset, commit, count = fields.len(), "logged field additions");
            Ok(())
        })
    }

    fn features_added(&self, ids: &[FeatureId]) -> Result<()> {
        self.store.transaction(|store| {
            let handle = store.get_or_create_dataset_handle(&self.dataset)?;
            for &fid in ids {
                store.log_feature_addition(handle, fid)?;
            }
            tracing::debug!(dataset = %self.dataset, count = ids.len(), "logged feature additions");
            Ok(())
        })
    }

    fn features_removed(&self, ids: &[FeatureId]) -> Result<()> {
        self.store.transaction(|store| {
            let handle = store.get_or_create_dataset_handle(&self.dataset)?;
            let mut retired = 0usize;
            for &fid in ids {
                if store.remove_feature_addition(handle, fid)? {
                    retired += 1;
                } else {
                    store.log_feature_removal(handle, fid)?;
                }
            }
            tracing::debug!(
                dataset = %self.dataset,
                removed = ids.len() - retired,
                retired,
                "logged feature removals"
            );
            Ok(())
        })
    }

    fn values_changed(&self, changes: &AttributeChanges) -> Result<()> {
        self.store.transaction(|store| {
            let handle = store.get_or_create_dataset_handle(&self.dataset)?;
            let commit = store.commit_no(handle)?;
            for (&fid, attributes) in changes {
                if store.is_added_feature(handle, fid)? {
                    continue;
                }
                for (&index, value) in attributes {
                    let text = encode_value(value);
                    store.log_attribute_value_change(handle, commit, fid, index, text.as_deref())?;
                }
            }
            Ok(())
        })
    }

    fn geometries_changed(&self, changes: &GeometryChanges) -> Result<()> {
        self.store.transaction(|store| {
            let handle = store.get_or_create_dataset_handle(&self.dataset)?;
            let commit = store.commit_no(handle)?;
            for (&fid, geometry) in changes {
                if store.is_added_feature(handle, fid)? {
                    continue;
                }
                store.log_geometry_change(handle, commit, fid, geometry)?;
            }
            Ok(())
        })
    }

    fn commit_finished(&self) -> Result<()> {
        if !self.sequenced.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        let handle = self.store.get_or_create_dataset_handle(&self.dataset)?;
        let next = self.store.increase_commit_no(handle)?;
        tracing::debug!(dataset = %self.dataset, commit = next, "advanced commit number");
        Ok(())
    }
}

// ============================================================================
// ChangeRecorder
// ============================================================================

/// Attaches [`DatasetRecorder`]s to observable datasets.
pub struct ChangeRecorder<B: LogStore> {
    store: Arc<B>,
    on_error: Option<Arc<RecorderErrorCallback>>,
    /// Listener registered per attached dataset name
    attached: Mutex<HashMap<String, ListenerId>>,
}

impl<B: LogStore + 'static> ChangeRecorder<B> {
    pub fn new(store: Arc<B>, options: RecorderOptions) -> Self {
        Self {
            store,
            on_error: options.on_error,
            attached: Mutex::new(HashMap::new()),
        }
    }

    /// Start logging the committed edits of `dataset`. Returns `false` if it
    /// was already attached.
    pub fn start_recording(&self, dataset: &dyn ObservableDataset) -> bool {
        let name = dataset.name().to_string();
        let mut attached = self.attached.lock();
        if attached.contains_key(&name) {
            return false;
        }

        let recorder = DatasetRecorder::new(Arc::clone(&self.store), name.clone());
        let on_error = self.on_error.clone();
        let listener = dataset.edit_events().on(move |event: &EditEvent| {
            if let Err(e) = recorder.handle_event(event) {
                tracing::error!(dataset = %recorder.dataset(), error = %e, "failed to log edit");
                if let Some(ref on_error) = on_error {
                    let failure = RecorderError {
                        dataset: recorder.dataset().to_string(),
                        error: e.to_string(),
                    };
                    let _ = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                        on_error(&failure);
                    }));
                }
            }
        });

        tracing::info!(dataset = %name, "started recording");
        attached.insert(name, listener);
        true
    }

    /// Stop logging `dataset`. Returns `false` if it was not attached.
    pub fn stop_recording(&self, dataset: &dyn ObservableDataset) -> bool {
        match self.attached.lock().remove(dataset.name()) {
            Some(listener) => {
                dataset.edit_events().off(listener);
                tracing::info!(dataset = %dataset.name(), "stopped recording");
                true
            }
            None => false,
        }
    }

    pub fn is_recording(&self, dataset: &str) -> bool {
        self.attached.lock().contains_key(dataset)
    }
}
