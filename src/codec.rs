//! Textual value encoding for the change log.
//!
//! Attribute values are stored as UTF-8 text. Scalars use their plain text
//! form, lists and objects are stored as JSON text. Decoding is driven by the
//! type of the field the value is written into, so a value logged against a
//! local text column can land in a remote list column and vice versa.

use serde_json::{Number, Value};

use crate::types::FieldType;

/// Serialize an attribute value for the `log_feature_updates.value` column.
/// Returns `None` for a null attribute.
pub fn encode_value(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Number(n) => Some(n.to_string()),
        other => Some(other.to_string()),
    }
}

/// Decode a logged value into the native representation of `field_type`.
///
/// Text that does not parse as the target type is kept as a string so the
/// remote driver gets a chance to coerce or reject it.
pub fn decode_value(text: Option<&str>, field_type: &FieldType) -> Value {
    let Some(text) = text else {
        return Value::Null;
    };

    match field_type {
        FieldType::Text | FieldType::Date | FieldType::DateTime => Value::String(text.to_string()),
        FieldType::Integer | FieldType::Integer64 => match text.trim().parse::<i64>() {
            Ok(i) => Value::from(i),
            Err(_) => Value::String(text.to_string()),
        },
        FieldType::Real => text
            .trim()
            .parse::<f64>()
            .ok()
            .and_then(Number::from_f64)
            .map(Value::Number)
            .unwrap_or_else(|| Value::String(text.to_string())),
        FieldType::Boolean => match text.trim() {
            "true" | "1" => Value::Bool(true),
            "false" | "0" => Value::Bool(false),
            _ => Value::String(text.to_string()),
        },
        FieldType::StringList | FieldType::List(_) => parse_array(text, field_type),
    }
}

/// Convert a value read from the local dataset into the type of the remote
/// field it is copied to.
pub fn convert_value(value: Value, field_type: &FieldType) -> Value {
    match (value, field_type) {
        (Value::Null, _) => Value::Null,
        (Value::Array(items), FieldType::StringList) => {
            Value::Array(items.into_iter().map(into_string_item).collect())
        }
        (Value::Array(items), FieldType::List(sub)) => Value::Array(
            items
                .into_iter()
                .map(|item| convert_value(item, sub))
                .collect(),
        ),
        (Value::String(s), ty) => decode_value(Some(&s), ty),
        (Value::Number(n), FieldType::Text) => Value::String(n.to_string()),
        (Value::Bool(b), FieldType::Text) => Value::String(b.to_string()),
        (other, ty) if ty.is_list() => Value::Array(vec![convert_list_item(other, ty)]),
        (other, _) => other,
    }
}

fn parse_array(text: &str, field_type: &FieldType) -> Value {
    if text.trim().is_empty() {
        return Value::Array(Vec::new());
    }
    match serde_json::from_str::<Value>(text) {
        Ok(Value::Array(items)) => convert_value(Value::Array(items), field_type),
        // Not JSON array text: a single bare element.
        _ => Value::Array(vec![convert_list_item(
            Value::String(text.to_string()),
            field_type,
        )]),
    }
}

fn convert_list_item(item: Value, list_type: &FieldType) -> Value {
    match list_type {
        FieldType::List(sub) => match item {
            Value::String(s) if !sub.is_list() => decode_value(Some(&s), sub),
            other => convert_value(other, sub),
        },
        _ => into_string_item(item),
    }
}

fn into_string_item(item: Value) -> Value {
    match item {
        Value::String(s) => Value::String(s),
        Value::Null => Value::Null,
        other => Value::String(other.to_string()),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
