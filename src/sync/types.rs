//! Replay state, progress events, warnings and reports.

use std::sync::Arc;

use crate::types::{CommitNo, FeatureId, FieldType};

/// Where a dataset's replay currently is.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplayState {
    Idle,
    OpeningRemote,
    ReplayingSchema { commit: CommitNo },
    ReplayingAdds,
    ReplayingRemoves,
    Committing,
    UpdatingIdMap,
    Purged,
    Failed,
}

/// Which kind of work a progress phase counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgressMode {
    AddFields,
    UpdateFeatures,
    UpdateGeometries,
    AddFeatures,
    RemoveFeatures,
    ProcessFeatures,
}

/// Progress callback payload.
#[derive(Debug, Clone, PartialEq)]
pub enum ProgressEvent {
    /// A multi-dataset pass moved on to dataset `index` (1-based) of `total`.
    DatasetStarted {
        index: usize,
        total: usize,
        dataset: String,
    },
    PhaseStarted {
        dataset: String,
        mode: ProgressMode,
        total_steps: usize,
    },
    /// `step` is 1-based and never exceeds the phase's `total_steps`.
    StepCompleted {
        dataset: String,
        mode: ProgressMode,
        step: usize,
    },
    StateChanged {
        dataset: String,
        state: ReplayState,
    },
}

/// Non-fatal replay outcomes. Collected in `SyncReport.warnings`, never thrown.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncWarning {
    /// The remote driver refused a field added offline; the field is skipped.
    SchemaFieldRejected {
        dataset: String,
        field: String,
        field_type: FieldType,
        reason: String,
    },
    /// A logged change references a feature the remote side does not know.
    MappingMiss {
        dataset: String,
        local_id: FeatureId,
        operation: &'static str,
    },
    /// A local field has no counterpart in the remote schema.
    UnmappedAttribute {
        dataset: String,
        local_field: String,
    },
}

/// What one successful synchronization did.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SyncReport {
    pub dataset: String,
    pub commits: CommitNo,
    pub fields_added: usize,
    pub features_added: usize,
    pub features_removed: usize,
    pub values_changed: usize,
    pub geometries_changed: usize,
    pub mappings_added: usize,
    pub warnings: Vec<SyncWarning>,
}

impl SyncReport {
    pub fn new(dataset: impl Into<String>) -> Self {
        Self {
            dataset: dataset.into(),
            ..Default::default()
        }
    }

    /// Whether the replay wrote anything to the remote dataset.
    pub fn wrote_remote(&self) -> bool {
        self.fields_added
            + self.features_added
            + self.features_removed
            + self.values_changed
            + self.geometries_changed
            > 0
    }
}

/// Callback type for progress updates.
pub type ProgressCallback = dyn Fn(&ProgressEvent) + Send + Sync;

/// Callback type for replay warnings.
pub type WarningCallback = dyn Fn(&SyncWarning) + Send + Sync;

/// Configuration for `ReplayEngine`.
#[derive(Clone, Default)]
pub struct SyncOptions {
    /// Called to report progress
    pub on_progress: Option<Arc<ProgressCallback>>,
    /// Called for each non-fatal warning
    pub on_warning: Option<Arc<WarningCallback>>,
}
