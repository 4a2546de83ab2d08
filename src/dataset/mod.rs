//! Interfaces the change-capture and replay core consumes from the dataset
//! layer: feature CRUD with edit sessions, a field catalog, native type
//! lookup, and committed-edit notifications.
//!
//! Concrete spatial drivers live outside this crate. [`memory`] provides an
//! in-process driver for embedders and tests.

pub mod events;
pub mod memory;

use serde_json::Value;

use crate::error::DatasetError;
use crate::types::{Feature, FeatureId, Field, FieldType, Geometry};

pub use events::{EditEvent, EventEmitter, ListenerId};
pub use memory::{MemoryDataset, MemoryProvider};

/// Result type for driver calls.
pub type DatasetResult<T> = std::result::Result<T, DatasetError>;

/// Outcome of a successful `commit_edit`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EditCommit {
    /// Ids the store assigned to features added in the session, in the order
    /// they were added. Drivers that cannot echo ids leave this empty.
    pub added_ids: Vec<FeatureId>,
}

/// A feature collection with edit sessions.
///
/// Reads always see committed state plus, while a session is open, the
/// session's own buffered changes (`fields()` includes added fields).
pub trait Dataset: Send {
    /// Stable external name of the dataset (used as the change log key).
    fn name(&self) -> &str;

    /// Whether the dataset opened correctly and is structurally usable.
    fn is_valid(&self) -> bool {
        true
    }

    /// Ordered field catalog.
    fn fields(&self) -> Vec<Field>;

    /// Driver type name for a semantic type, `None` if unsupported.
    fn native_type_for(&self, field_type: &FieldType) -> Option<String>;

    /// Default value the store applies to the field at `field_index` when a
    /// new feature leaves it unset.
    fn default_value(&self, field_index: usize) -> Option<Value>;

    /// Ids of all features, ascending.
    fn feature_ids(&self) -> DatasetResult<Vec<FeatureId>>;

    /// Features with the given ids, in the requested order. Ids that do not
    /// exist are omitted.
    fn get_features(&self, ids: &[FeatureId]) -> DatasetResult<Vec<Feature>>;

    fn begin_edit(&mut self) -> DatasetResult<()>;

    fn add_field(&mut self, field: Field) -> DatasetResult<()>;

    /// Buffer a new feature. Returns a provisional id valid until commit.
    fn add_feature(
        &mut self,
        geometry: Option<Geometry>,
        attributes: Vec<Value>,
    ) -> DatasetResult<FeatureId>;

    /// Returns `false` if no such feature exists.
    fn delete_feature(&mut self, id: FeatureId) -> DatasetResult<bool>;

    /// Returns `false` if no such feature exists.
    fn change_attribute_value(
        &mut self,
        id: FeatureId,
        field_index: usize,
        value: Value,
    ) -> DatasetResult<bool>;

    /// Returns `false` if no such feature exists.
    fn change_geometry(&mut self, id: FeatureId, geometry: Geometry) -> DatasetResult<bool>;

    /// Commit the session as one logical transaction.
    fn commit_edit(&mut self) -> DatasetResult<EditCommit>;

    /// Drop all buffered changes of the open session.
    fn discard_edit(&mut self);
}

/// A dataset that publishes its committed edits.
pub trait ObservableDataset: Dataset {
    fn edit_events(&self) -> &EventEmitter<EditEvent>;
}

/// Opens datasets by identifier.
pub trait DatasetProvider: Send + Sync {
    /// Open the local replica created by the detach step.
    fn open_offline(&self, source_id: &str) -> DatasetResult<Box<dyn Dataset>>;

    /// Open a fresh connection to the original data source.
    fn open_remote(&self, locator: &str) -> DatasetResult<Box<dyn Dataset>>;
}
