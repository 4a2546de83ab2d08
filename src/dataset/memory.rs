//! In-process dataset driver.
//!
//! Committed state lives in a shared table; every [`MemoryDataset`] is one
//! connection to it with its own edit buffer and its own event emitter, so a
//! replay can open a fresh connection to the same data the way a real driver
//! reconnects to a server.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;

use crate::error::DatasetError;
use crate::types::{AttributeChanges, Feature, FeatureId, Field, FieldType, Geometry, GeometryChanges};

use super::events::{EditEvent, EventEmitter};
use super::{Dataset, DatasetProvider, DatasetResult, EditCommit, ObservableDataset};

struct Table {
    name: String,
    fields: Vec<Field>,
    features: BTreeMap<FeatureId, Feature>,
    next_id: FeatureId,
    defaults: HashMap<String, Value>,
    /// `None` accepts every type under its tag name.
    native_types: Option<HashMap<FieldType, String>>,
    fail_next_commit: Option<String>,
    echo_ids: bool,
    valid: bool,
    commits: usize,
}

impl Table {
    fn insert(&mut self, geometry: Option<Geometry>, mut attributes: Vec<Value>) -> FeatureId {
        let id = self.next_id;
        self.next_id += 1;
        attributes.resize(self.fields.len(), Value::Null);
        self.features.insert(id, Feature::new(id, attributes, geometry));
        id
    }
}

#[derive(Default)]
struct EditBuffer {
    added_fields: Vec<Field>,
    /// Provisional id and feature, in insertion order
    added: Vec<Feature>,
    removed: BTreeSet<FeatureId>,
    values: AttributeChanges,
    geometries: GeometryChanges,
}

impl EditBuffer {
    fn is_empty(&self) -> bool {
        self.added_fields.is_empty()
            && self.added.is_empty()
            && self.removed.is_empty()
            && self.values.is_empty()
            && self.geometries.is_empty()
    }
}

/// One connection to an in-memory feature table.
pub struct MemoryDataset {
    table: Arc<Mutex<Table>>,
    name: String,
    edit: Option<EditBuffer>,
    next_provisional: FeatureId,
    events: EventEmitter<EditEvent>,
}

impl MemoryDataset {
    pub fn new(name: impl Into<String>, fields: Vec<Field>) -> Self {
        let name = name.into();
        let table = Table {
            name: name.clone(),
            fields,
            features: BTreeMap::new(),
            next_id: 1,
            defaults: HashMap::new(),
            native_types: None,
            fail_next_commit: None,
            echo_ids: true,
            valid: true,
            commits: 0,
        };
        Self::from_table(Arc::new(Mutex::new(table)))
    }

    /// Start assigning feature ids at `first_id` instead of 1.
    pub fn with_next_id(self, first_id: FeatureId) -> Self {
        self.table.lock().next_id = first_id;
        self
    }

    fn from_table(table: Arc<Mutex<Table>>) -> Self {
        let name = table.lock().name.clone();
        Self {
            table,
            name,
            edit: None,
            next_provisional: -1,
            events: EventEmitter::new(),
        }
    }

    /// Open another connection to the same table.
    pub fn connect(&self) -> MemoryDataset {
        Self::from_table(Arc::clone(&self.table))
    }

    /// Write a feature straight into committed state without an edit session
    /// or notifications, as a bulk copy does.
    pub fn seed_feature(&self, geometry: Option<Geometry>, attributes: Vec<Value>) -> FeatureId {
        self.table.lock().insert(geometry, attributes)
    }

    pub fn feature(&self, id: FeatureId) -> Option<Feature> {
        self.table.lock().features.get(&id).cloned()
    }

    /// All committed features, ascending by id.
    pub fn features(&self) -> Vec<Feature> {
        self.table.lock().features.values().cloned().collect()
    }

    pub fn feature_count(&self) -> usize {
        self.table.lock().features.len()
    }

    /// Index of a committed or buffered field.
    pub fn field_index(&self, name: &str) -> Option<usize> {
        self.fields().iter().position(|f| f.name == name)
    }

    /// Number of commits that changed anything.
    pub fn commit_count(&self) -> usize {
        self.table.lock().commits
    }

    pub fn is_editing(&self) -> bool {
        self.edit.is_some()
    }

    pub fn set_default(&self, field: impl Into<String>, value: Value) {
        self.table.lock().defaults.insert(field.into(), value);
    }

    /// Restrict the field types this table accepts.
    pub fn set_native_types(&self, types: impl IntoIterator<Item = (FieldType, String)>) {
        self.table.lock().native_types = Some(types.into_iter().collect());
    }

    /// Make the next commit on any connection fail with `message`.
    pub fn fail_next_commit(&self, message: impl Into<String>) {
        self.table.lock().fail_next_commit = Some(message.into());
    }

    /// Whether `commit_edit` reports the ids assigned to added features.
    pub fn set_echo_ids(&self, echo: bool) {
        self.table.lock().echo_ids = echo;
    }

    pub fn set_valid(&self, valid: bool) {
        self.table.lock().valid = valid;
    }

    fn edit_mut(&mut self) -> DatasetResult<&mut EditBuffer> {
        let name = &self.name;
        self.edit
            .as_mut()
            .ok_or_else(|| DatasetError::new(format!("dataset \"{name}\" is not in edit mode")))
    }

    fn is_live(&self, id: FeatureId) -> bool {
        let exists = self.table.lock().features.contains_key(&id);
        exists && !self.edit.as_ref().is_some_and(|e| e.removed.contains(&id))
    }

    fn check_field_index(&self, field_index: usize) -> DatasetResult<()> {
        let count = self.fields().len();
        if field_index >= count {
            return Err(DatasetError::new(format!(
                "field index {field_index} out of range ({count} fields)"
            )));
        }
        Ok(())
    }
}

impl Dataset for MemoryDataset {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_valid(&self) -> bool {
        self.table.lock().valid
    }

    fn fields(&self) -> Vec<Field> {
        let mut fields = self.table.lock().fields.clone();
        if let Some(edit) = &self.edit {
            fields.extend(edit.added_fields.iter().cloned());
        }
        fields
    }

    fn native_type_for(&self, field_type: &FieldType) -> Option<String> {
        match &self.table.lock().native_types {
            None => Some(field_type.tag()),
            Some(types) => types.get(field_type).cloned(),
        }
    }

    fn default_value(&self, field_index: usize) -> Option<Value> {
        let field = self.fields().into_iter().nth(field_index)?;
        self.table.lock().defaults.get(&field.name).cloned()
    }

    fn feature_ids(&self) -> DatasetResult<Vec<FeatureId>> {
        let table = self.table.lock();
        Ok(table
            .features
            .keys()
            .copied()
            .filter(|id| !self.edit.as_ref().is_some_and(|e| e.removed.contains(id)))
            .collect())
    }

    fn get_features(&self, ids: &[FeatureId]) -> DatasetResult<Vec<Feature>> {
        let field_count = self.fields().len();
        let table = self.table.lock();
        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            let mut feature = match &self.edit {
                Some(edit) if edit.removed.contains(id) => continue,
                Some(edit) if *id < 0 => match edit.added.iter().find(|f| f.id == *id) {
                    Some(f) => f.clone(),
                    None => continue,
                },
                _ => match table.features.get(id) {
                    Some(f) => f.clone(),
                    None => continue,
                },
            };
            if let Some(edit) = &self.edit {
                if let Some(changes) = edit.values.get(id) {
                    for (index, value) in changes {
                        if feature.attributes.len() <= *index {
                            feature.attributes.resize(*index + 1, Value::Null);
                        }
                        feature.attributes[*index] = value.clone();
                    }
                }
                if let Some(geometry) = edit.geometries.get(id) {
                    feature.geometry = Some(geometry.clone());
                }
            }
            feature.attributes.resize(field_count, Value::Null);
            out.push(feature);
        }
        Ok(out)
    }

    fn begin_edit(&mut self) -> DatasetResult<()> {
        if self.edit.is_none() {
            self.edit = Some(EditBuffer::default());
        }
        Ok(())
    }

    fn add_field(&mut self, mut field: Field) -> DatasetResult<()> {
        if self.fields().iter().any(|f| f.name == field.name) {
            return Err(DatasetError::new(format!(
                "field \"{}\" already exists",
                field.name
            )));
        }
        let Some(type_name) = self.native_type_for(&field.field_type) else {
            return Err(DatasetError::new(format!(
                "unsupported field type {} for \"{}\"",
                field.field_type, field.name
            )));
        };
        field.type_name.get_or_insert(type_name);
        self.edit_mut()?.added_fields.push(field);
        Ok(())
    }

    fn add_feature(
        &mut self,
        geometry: Option<Geometry>,
        mut attributes: Vec<Value>,
    ) -> DatasetResult<FeatureId> {
        let field_count = self.fields().len();
        if attributes.len() > field_count {
            return Err(DatasetError::new(format!(
                "feature has {} attributes but the dataset has {field_count} fields",
                attributes.len()
            )));
        }
        attributes.resize(field_count, Value::Null);
        let id = self.next_provisional;
        self.edit_mut()?
            .added
            .push(Feature::new(id, attributes, geometry));
        self.next_provisional -= 1;
        Ok(id)
    }

    fn delete_feature(&mut self, id: FeatureId) -> DatasetResult<bool> {
        let live = self.is_live(id);
        let edit = self.edit_mut()?;
        if let Some(pos) = edit.added.iter().position(|f| f.id == id) {
            edit.added.remove(pos);
            return Ok(true);
        }
        if !live {
            return Ok(false);
        }
        edit.values.remove(&id);
        edit.geometries.remove(&id);
        edit.removed.insert(id);
        Ok(true)
    }

    fn change_attribute_value(
        &mut self,
        id: FeatureId,
        field_index: usize,
        value: Value,
    ) -> DatasetResult<bool> {
        self.check_field_index(field_index)?;
        let live = self.is_live(id);
        let edit = self.edit_mut()?;
        if let Some(feature) = edit.added.iter_mut().find(|f| f.id == id) {
            if feature.attributes.len() <= field_index {
                feature.attributes.resize(field_index + 1, Value::Null);
            }
            feature.attributes[field_index] = value;
            return Ok(true);
        }
        if !live {
            return Ok(false);
        }
        edit.values.entry(id).or_default().insert(field_index, value);
        Ok(true)
    }

    fn change_geometry(&mut self, id: FeatureId, geometry: Geometry) -> DatasetResult<bool> {
        let live = self.is_live(id);
        let edit = self.edit_mut()?;
        if let Some(feature) = edit.added.iter_mut().find(|f| f.id == id) {
            feature.geometry = Some(geometry);
            return Ok(true);
        }
        if !live {
            return Ok(false);
        }
        edit.geometries.insert(id, geometry);
        Ok(true)
    }

    fn commit_edit(&mut self) -> DatasetResult<EditCommit> {
        let edit = self.edit.take().ok_or_else(|| {
            DatasetError::new(format!("dataset \"{}\" is not in edit mode", self.name))
        })?;

        let mut table = self.table.lock();
        if let Some(message) = table.fail_next_commit.take() {
            drop(table);
            // A rejected commit keeps the session open, like a real driver.
            self.edit = Some(edit);
            return Err(DatasetError::new(message));
        }

        let changed = !edit.is_empty();
        let EditBuffer {
            added_fields,
            added,
            removed,
            values,
            geometries,
        } = edit;

        table.fields.extend(added_fields.iter().cloned());
        let field_count = table.fields.len();
        for feature in table.features.values_mut() {
            feature.attributes.resize(field_count, Value::Null);
        }

        for id in &removed {
            table.features.remove(id);
        }
        for (id, changes) in &values {
            if let Some(feature) = table.features.get_mut(id) {
                for (index, value) in changes {
                    if *index < feature.attributes.len() {
                        feature.attributes[*index] = value.clone();
                    }
                }
            }
        }
        for (id, geometry) in &geometries {
            if let Some(feature) = table.features.get_mut(id) {
                feature.geometry = Some(geometry.clone());
            }
        }
        let added_ids: Vec<FeatureId> = added
            .into_iter()
            .map(|f| table.insert(f.geometry, f.attributes))
            .collect();

        if changed {
            table.commits += 1;
        }
        let echo_ids = table.echo_ids;
        drop(table);
        self.next_provisional = -1;

        if !added_fields.is_empty() {
            self.events.emit(&EditEvent::FieldsAdded(added_fields));
        }
        if !removed.is_empty() {
            self.events
                .emit(&EditEvent::FeaturesRemoved(removed.into_iter().collect()));
        }
        if !added_ids.is_empty() {
            self.events.emit(&EditEvent::FeaturesAdded(added_ids.clone()));
        }
        if !values.is_empty() {
            self.events.emit(&EditEvent::AttributeValuesChanged(values));
        }
        if !geometries.is_empty() {
            self.events.emit(&EditEvent::GeometriesChanged(geometries));
        }
        self.events.emit(&EditEvent::CommitFinished);

        Ok(EditCommit {
            added_ids: if echo_ids { added_ids } else { Vec::new() },
        })
    }

    fn discard_edit(&mut self) {
        self.edit = None;
        self.next_provisional = -1;
    }
}

impl ObservableDataset for MemoryDataset {
    fn edit_events(&self) -> &EventEmitter<EditEvent> {
        &self.events
    }
}

// ============================================================================
// MemoryProvider
// ============================================================================

/// Registry of in-memory tables addressable by locator.
#[derive(Default)]
pub struct MemoryProvider {
    tables: Mutex<HashMap<String, Arc<Mutex<Table>>>>,
}

impl MemoryProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `dataset`'s table reachable under `locator`.
    pub fn register(&self, locator: impl Into<String>, dataset: &MemoryDataset) {
        self.tables
            .lock()
            .insert(locator.into(), Arc::clone(&dataset.table));
    }

    pub fn unregister(&self, locator: &str) {
        self.tables.lock().remove(locator);
    }

    fn open(&self, locator: &str) -> DatasetResult<Box<dyn Dataset>> {
        let table = self
            .tables
            .lock()
            .get(locator)
            .cloned()
            .ok_or_else(|| DatasetError::new(format!("no dataset at \"{locator}\"")))?;
        Ok(Box::new(MemoryDataset::from_table(table)))
    }
}

impl DatasetProvider for MemoryProvider {
    fn open_offline(&self, source_id: &str) -> DatasetResult<Box<dyn Dataset>> {
        self.open(source_id)
    }

    fn open_remote(&self, locator: &str) -> DatasetResult<Box<dyn Dataset>> {
        self.open(locator)
    }
}
