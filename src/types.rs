use std::collections::BTreeMap;
use std::fmt;

use serde_json::Value;

/// Feature identifier, assigned independently by each store.
pub type FeatureId = i64;

/// Small integer standing in for a dataset name inside the change log.
pub type DatasetHandle = i64;

/// Sequential number of one offline commit.
pub type CommitNo = i64;

/// Changed attribute values per feature: `fid -> (field index -> new value)`.
pub type AttributeChanges = BTreeMap<FeatureId, BTreeMap<usize, Value>>;

/// Changed geometries per feature.
pub type GeometryChanges = BTreeMap<FeatureId, Geometry>;

// ============================================================================
// Schema
// ============================================================================

/// Semantic attribute type. Drivers translate it to their own type names
/// through `Dataset::native_type_for`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum FieldType {
    Integer,
    Integer64,
    Real,
    Text,
    Boolean,
    Date,
    DateTime,
    StringList,
    /// List of values of the given element type
    List(Box<FieldType>),
}

impl FieldType {
    /// Text tag stored in the `log_added_attrs.type` column.
    pub fn tag(&self) -> String {
        match self {
            FieldType::Integer => "integer".to_string(),
            FieldType::Integer64 => "integer64".to_string(),
            FieldType::Real => "real".to_string(),
            FieldType::Text => "text".to_string(),
            FieldType::Boolean => "boolean".to_string(),
            FieldType::Date => "date".to_string(),
            FieldType::DateTime => "datetime".to_string(),
            FieldType::StringList => "stringlist".to_string(),
            FieldType::List(sub) => format!("list<{}>", sub.tag()),
        }
    }

    /// Inverse of [`FieldType::tag`].
    pub fn from_tag(tag: &str) -> Option<FieldType> {
        let ty = match tag {
            "integer" => FieldType::Integer,
            "integer64" => FieldType::Integer64,
            "real" => FieldType::Real,
            "text" => FieldType::Text,
            "boolean" => FieldType::Boolean,
            "date" => FieldType::Date,
            "datetime" => FieldType::DateTime,
            "stringlist" => FieldType::StringList,
            other => {
                let inner = other.strip_prefix("list<")?.strip_suffix('>')?;
                FieldType::List(Box::new(FieldType::from_tag(inner)?))
            }
        };
        Some(ty)
    }

    pub fn is_list(&self) -> bool {
        matches!(self, FieldType::StringList | FieldType::List(_))
    }
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.tag())
    }
}

/// One attribute column of a dataset.
#[derive(Debug, Clone, PartialEq)]
pub struct Field {
    pub name: String,
    pub field_type: FieldType,
    /// Driver-specific type name, filled in by the driver that owns the field
    pub type_name: Option<String>,
    pub length: i32,
    pub precision: i32,
    pub comment: String,
}

impl Field {
    pub fn new(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            field_type,
            type_name: None,
            length: 0,
            precision: 0,
            comment: String::new(),
        }
    }

    pub fn with_length(mut self, length: i32) -> Self {
        self.length = length;
        self
    }

    pub fn with_precision(mut self, precision: i32) -> Self {
        self.precision = precision;
        self
    }

    pub fn with_comment(mut self, comment: impl Into<String>) -> Self {
        self.comment = comment.into();
        self
    }
}

// ============================================================================
// Features
// ============================================================================

/// Geometry kept in well-known-text form. The change log never interprets it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Geometry(String);

impl Geometry {
    pub fn from_wkt(wkt: impl Into<String>) -> Self {
        Geometry(wkt.into())
    }

    pub fn as_wkt(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Geometry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A feature: attribute values in the owning dataset's field order plus an
/// optional geometry.
#[derive(Debug, Clone, PartialEq)]
pub struct Feature {
    pub id: FeatureId,
    pub attributes: Vec<Value>,
    pub geometry: Option<Geometry>,
}

impl Feature {
    pub fn new(id: FeatureId, attributes: Vec<Value>, geometry: Option<Geometry>) -> Self {
        Self {
            id,
            attributes,
            geometry,
        }
    }

    /// Attribute at `index`, `Null` when the feature is shorter than the schema.
    pub fn attribute(&self, index: usize) -> &Value {
        self.attributes.get(index).unwrap_or(&Value::Null)
    }
}

// ============================================================================
// Change log rows
// ============================================================================

/// A field added while offline.
#[derive(Debug, Clone, PartialEq)]
pub struct AttributeAddition {
    pub commit: CommitNo,
    pub field: Field,
}

/// A logged attribute value change. `value` is the textual serialization
/// produced by `codec::encode_value`; `None` is a null attribute.
#[derive(Debug, Clone, PartialEq)]
pub struct AttributeValueChange {
    pub commit: CommitNo,
    pub fid: FeatureId,
    pub field_index: usize,
    pub value: Option<String>,
}

/// A logged geometry change.
#[derive(Debug, Clone, PartialEq)]
pub struct GeometryChange {
    pub commit: CommitNo,
    pub fid: FeatureId,
    pub geometry: Geometry,
}

/// Row counts of everything waiting to be replayed for one dataset.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PendingChanges {
    pub commits: CommitNo,
    pub added_fields: usize,
    pub added_features: usize,
    pub removed_features: usize,
    pub value_changes: usize,
    pub geometry_changes: usize,
}

impl PendingChanges {
    pub fn is_empty(&self) -> bool {
        self.added_fields == 0
            && self.added_features == 0
            && self.removed_features == 0
            && self.value_changes == 0
            && self.geometry_changes == 0
    }
}
