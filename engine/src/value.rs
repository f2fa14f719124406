//! Typed field values.
//!
//! Backend objects are schema-less, but every value still has one of a small
//! set of shapes. [`FieldValue`] names those shapes so the codec and the queue
//! never have to poke at raw JSON.

use crate::{BackendObject, ClassName, RemoteId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A single field value on a [`BackendObject`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "camelCase")]
pub enum FieldValue {
    Null,
    Bool(bool),
    /// Kept as the exact JSON number so integers never lose precision.
    Number(serde_json::Number),
    String(String),
    Date(DateTime<Utc>),
    Bytes(Vec<u8>),
    /// Pointer to an object that already exists on the backend.
    #[serde(rename_all = "camelCase")]
    Reference {
        class_name: ClassName,
        remote_id: RemoteId,
    },
    /// An embedded object, possibly not yet saved.
    Object(Box<BackendObject>),
    List(Vec<FieldValue>),
    /// Free-form dictionary.
    Map(BTreeMap<String, FieldValue>),
}

impl FieldValue {
    /// Build a number from a float. Returns `None` for NaN and infinities,
    /// which have no transport representation.
    pub fn float(value: f64) -> Option<Self> {
        serde_json::Number::from_f64(value).map(FieldValue::Number)
    }

    /// Build a reference to a saved object.
    pub fn reference(class_name: impl Into<ClassName>, remote_id: impl Into<RemoteId>) -> Self {
        FieldValue::Reference {
            class_name: class_name.into(),
            remote_id: remote_id.into(),
        }
    }

    /// Build an embedded object value.
    pub fn object(object: BackendObject) -> Self {
        FieldValue::Object(Box::new(object))
    }

    pub fn is_null(&self) -> bool {
        matches!(self, FieldValue::Null)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            FieldValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            FieldValue::Number(n) => n.as_i64(),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<&BackendObject> {
        match self {
            FieldValue::Object(obj) => Some(obj),
            _ => None,
        }
    }

    /// Visit every embedded object, depth first.
    pub fn for_each_object<'a>(&'a self, visit: &mut dyn FnMut(&'a BackendObject)) {
        match self {
            FieldValue::Object(obj) => visit(obj.as_ref()),
            FieldValue::List(items) => {
                for item in items {
                    item.for_each_object(visit);
                }
            }
            FieldValue::Map(entries) => {
                for item in entries.values() {
                    item.for_each_object(visit);
                }
            }
            _ => {}
        }
    }

    /// Mutable variant of [`FieldValue::for_each_object`].
    pub fn for_each_object_mut(&mut self, visit: &mut dyn FnMut(&mut BackendObject)) {
        match self {
            FieldValue::Object(obj) => visit(obj.as_mut()),
            FieldValue::List(items) => {
                for item in items {
                    item.for_each_object_mut(visit);
                }
            }
            FieldValue::Map(entries) => {
                for item in entries.values_mut() {
                    item.for_each_object_mut(visit);
                }
            }
            _ => {}
        }
    }

    /// Name of the variant, used in error messages.
    pub fn type_name(&self) -> &'static str {
        match self {
            FieldValue::Null => "Null",
            FieldValue::Bool(_) => "Bool",
            FieldValue::Number(_) => "Number",
            FieldValue::String(_) => "String",
            FieldValue::Date(_) => "Date",
            FieldValue::Bytes(_) => "Bytes",
            FieldValue::Reference { .. } => "Pointer",
            FieldValue::Object(_) => "Object",
            FieldValue::List(_) => "List",
            FieldValue::Map(_) => "Map",
        }
    }
}

impl From<bool> for FieldValue {
    fn from(value: bool) -> Self {
        FieldValue::Bool(value)
    }
}

impl From<i64> for FieldValue {
    fn from(value: i64) -> Self {
        FieldValue::Number(value.into())
    }
}

impl From<i32> for FieldValue {
    fn from(value: i32) -> Self {
        FieldValue::Number(value.into())
    }
}

impl From<u64> for FieldValue {
    fn from(value: u64) -> Self {
        FieldValue::Number(value.into())
    }
}

impl From<&str> for FieldValue {
    fn from(value: &str) -> Self {
        FieldValue::String(value.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(value: String) -> Self {
        FieldValue::String(value)
    }
}

impl From<DateTime<Utc>> for FieldValue {
    fn from(value: DateTime<Utc>) -> Self {
        FieldValue::Date(value)
    }
}

impl From<Vec<u8>> for FieldValue {
    fn from(value: Vec<u8>) -> Self {
        FieldValue::Bytes(value)
    }
}

impl From<Vec<FieldValue>> for FieldValue {
    fn from(value: Vec<FieldValue>) -> Self {
        FieldValue::List(value)
    }
}

impl From<BackendObject> for FieldValue {
    fn from(value: BackendObject) -> Self {
        FieldValue::object(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn float_rejects_non_finite() {
        assert!(FieldValue::float(1.5).is_some());
        assert!(FieldValue::float(f64::NAN).is_none());
        assert!(FieldValue::float(f64::INFINITY).is_none());
    }

    #[test]
    fn visits_nested_objects() {
        let inner = BackendObject::new("Tag");
        let value = FieldValue::List(vec![
            FieldValue::from(3),
            FieldValue::Map(BTreeMap::from([(
                "tag".to_string(),
                FieldValue::object(inner.clone()),
            )])),
        ]);

        let mut seen = Vec::new();
        value.for_each_object(&mut |obj| seen.push(obj.handle()));
        assert_eq!(seen, vec![inner.handle()]);
    }

    #[test]
    fn serde_roundtrip() {
        let value = FieldValue::List(vec![
            FieldValue::Null,
            FieldValue::from("text"),
            FieldValue::reference("Post", "p1"),
            FieldValue::Bytes(vec![0, 1, 255]),
        ]);

        let json = serde_json::to_string(&value).unwrap();
        assert!(json.contains(r#""type":"reference""#));
        let parsed: FieldValue = serde_json::from_str(&json).unwrap();
        assert_eq!(value, parsed);
    }
}
