//! Field codec: [`BackendObject`] to and from transport mappings.
//!
//! The transport form is the backend's REST dialect. Scalars map to plain
//! JSON, and everything else is a tagged object:
//!
//! | value        | transport                                              |
//! |--------------|--------------------------------------------------------|
//! | date         | `{"__type":"Date","iso":"2024-01-01T00:00:00.000Z"}`   |
//! | bytes        | `{"__type":"Bytes","base64":"AAE="}`                   |
//! | reference    | `{"__type":"Pointer","className":..,"objectId":..}`    |
//! | object       | `{"__type":"Object","className":..,...fields}`         |
//!
//! Encoding for a durable command only ever emits pointers for embedded
//! objects, so every embedded object must already have a remote id.

use crate::{error::Result, BackendObject, ClassName, Error, FieldName, FieldValue};
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::Value;
use std::collections::BTreeMap;

/// A transport-safe name to value mapping.
pub type Mapping = serde_json::Map<String, Value>;

pub const KEY_TYPE: &str = "__type";
pub const KEY_CLASS_NAME: &str = "className";
pub const KEY_OBJECT_ID: &str = "objectId";
pub const KEY_CREATED_AT: &str = "createdAt";
pub const KEY_UPDATED_AT: &str = "updatedAt";
pub const KEY_LOCAL_ID: &str = "localId";

const RESERVED_KEYS: [&str; 6] = [
    KEY_TYPE,
    KEY_CLASS_NAME,
    KEY_OBJECT_ID,
    KEY_CREATED_AT,
    KEY_UPDATED_AT,
    KEY_LOCAL_ID,
];

/// Whether a top-level key carries identity or bookkeeping instead of a field.
pub fn is_reserved_key(key: &str) -> bool {
    RESERVED_KEYS.contains(&key)
}

/// Refuse a field name that would collide with an identity key on the wire.
pub fn check_field_name(name: &str) -> Result<()> {
    if is_reserved_key(name) {
        return Err(Error::Schema(format!("'{}' is reserved and cannot name a field", name)));
    }
    Ok(())
}

/// Check that a set of fields can be encoded without losing anything: no
/// reserved top-level names, and no `__type` key in any free-form map.
pub fn validate_fields(fields: &BTreeMap<FieldName, FieldValue>) -> Result<()> {
    for (name, value) in fields {
        check_field_name(name)?;
        validate_value(value)?;
    }
    Ok(())
}

fn validate_value(value: &FieldValue) -> Result<()> {
    match value {
        FieldValue::List(items) => items.iter().try_for_each(validate_value),
        FieldValue::Map(entries) => {
            check_map_key_set(entries)?;
            entries.values().try_for_each(validate_value)
        }
        FieldValue::Object(object) => validate_fields(object.fields()),
        _ => Ok(()),
    }
}

fn check_map_key_set(entries: &BTreeMap<String, FieldValue>) -> Result<()> {
    if entries.contains_key(KEY_TYPE) {
        return Err(Error::Serialization(format!(
            "map key '{}' is reserved for tagged values",
            KEY_TYPE
        )));
    }
    Ok(())
}

/// Where an encoding is headed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncodeContext {
    /// Responses and synchronous traffic: embedded objects are written in full.
    Immediate,
    /// Payloads of queued commands: embedded objects become pointers and must
    /// already be identified.
    Durable,
}

/// Encode a whole object, identity included.
pub fn encode(object: &BackendObject, ctx: EncodeContext) -> Result<Mapping> {
    let mut map = Mapping::new();
    map.insert(KEY_CLASS_NAME.into(), Value::String(object.class_name().to_string()));
    if let Some(remote_id) = object.remote_id() {
        map.insert(KEY_OBJECT_ID.into(), Value::String(remote_id.clone()));
    }
    if let Some(created_at) = object.created_at() {
        map.insert(KEY_CREATED_AT.into(), Value::String(format_date(&created_at)));
    }
    if let Some(updated_at) = object.updated_at() {
        map.insert(KEY_UPDATED_AT.into(), Value::String(format_date(&updated_at)));
    }
    for (name, value) in object.fields() {
        check_field_name(name)?;
        map.insert(name.clone(), encode_value(value, ctx)?);
    }
    Ok(map)
}

/// Encode a set of fields, without identity keys.
pub fn encode_fields(fields: &BTreeMap<FieldName, FieldValue>, ctx: EncodeContext) -> Result<Mapping> {
    fields
        .iter()
        .map(|(name, value)| {
            check_field_name(name)?;
            Ok((name.clone(), encode_value(value, ctx)?))
        })
        .collect()
}

/// Encode a single value.
pub fn encode_value(value: &FieldValue, ctx: EncodeContext) -> Result<Value> {
    Ok(match value {
        FieldValue::Null => Value::Null,
        FieldValue::Bool(b) => Value::Bool(*b),
        FieldValue::Number(n) => Value::Number(n.clone()),
        FieldValue::String(s) => Value::String(s.clone()),
        FieldValue::Date(date) => tagged("Date", [("iso", Value::String(format_date(date)))]),
        FieldValue::Bytes(bytes) => {
            tagged("Bytes", [("base64", Value::String(STANDARD.encode(bytes)))])
        }
        FieldValue::Reference {
            class_name,
            remote_id,
        } => pointer(class_name, remote_id),
        FieldValue::Object(object) => match ctx {
            EncodeContext::Durable => {
                let remote_id = object.remote_id().ok_or_else(|| {
                    Error::Serialization(format!(
                        "embedded {} object (local {}) has no remote id; save it first",
                        object.class_name(),
                        object.handle()
                    ))
                })?;
                pointer(object.class_name(), remote_id)
            }
            EncodeContext::Immediate => {
                let mut map = encode(object, ctx)?;
                map.insert(KEY_TYPE.into(), Value::String("Object".into()));
                Value::Object(map)
            }
        },
        FieldValue::List(items) => Value::Array(
            items
                .iter()
                .map(|item| encode_value(item, ctx))
                .collect::<Result<_>>()?,
        ),
        FieldValue::Map(entries) => {
            check_map_key_set(entries)?;
            Value::Object(
                entries
                    .iter()
                    .map(|(k, v)| Ok((k.clone(), encode_value(v, ctx)?)))
                    .collect::<Result<_>>()?,
            )
        }
    })
}

/// Decode a transport mapping into an object.
///
/// `expected_class` is used when the mapping carries no `className`, and must
/// agree with it when it does.
pub fn decode(mapping: &Mapping, expected_class: Option<&str>) -> Result<BackendObject> {
    let class_name = match (mapping.get(KEY_CLASS_NAME), expected_class) {
        (Some(Value::String(found)), Some(expected)) if found != expected => {
            return Err(Error::Schema(format!(
                "expected class '{}', mapping claims '{}'",
                expected, found
            )))
        }
        (Some(Value::String(found)), _) => found.clone(),
        (Some(other), _) => {
            return Err(Error::Schema(format!("className must be a string, got {}", other)))
        }
        (None, Some(expected)) => expected.to_string(),
        (None, None) => return Err(Error::Schema("missing className".into())),
    };

    let created_at = decode_timestamp(mapping.get(KEY_CREATED_AT))?;
    let updated_at = decode_timestamp(mapping.get(KEY_UPDATED_AT))?;

    let mut object = match mapping.get(KEY_OBJECT_ID) {
        Some(Value::String(id)) if !id.is_empty() => BackendObject::without_data(&class_name, id),
        Some(Value::String(_)) | Some(Value::Null) | None => {
            if created_at.is_some() || updated_at.is_some() {
                return Err(Error::Schema(format!(
                    "persisted {} object is missing objectId",
                    class_name
                )));
            }
            BackendObject::new(&class_name)
        }
        Some(other) => {
            return Err(Error::Schema(format!("objectId must be a string, got {}", other)))
        }
    };

    object.set_timestamps(created_at, updated_at);
    for (name, value) in decode_fields(mapping)? {
        object.insert_clean(name, value);
    }
    Ok(object)
}

/// Decode every non-reserved key of a mapping.
pub fn decode_fields(mapping: &Mapping) -> Result<BTreeMap<FieldName, FieldValue>> {
    mapping
        .iter()
        .filter(|(key, _)| !is_reserved_key(key))
        .map(|(key, value)| Ok((key.clone(), decode_value(value)?)))
        .collect()
}

/// Decode a single transport value.
pub fn decode_value(value: &Value) -> Result<FieldValue> {
    Ok(match value {
        Value::Null => FieldValue::Null,
        Value::Bool(b) => FieldValue::Bool(*b),
        Value::Number(n) => FieldValue::Number(n.clone()),
        Value::String(s) => FieldValue::String(s.clone()),
        Value::Array(items) => {
            FieldValue::List(items.iter().map(decode_value).collect::<Result<_>>()?)
        }
        Value::Object(map) => match map.get(KEY_TYPE) {
            None => FieldValue::Map(
                map.iter()
                    .map(|(k, v)| Ok((k.clone(), decode_value(v)?)))
                    .collect::<Result<_>>()?,
            ),
            Some(Value::String(kind)) => decode_tagged(kind, map)?,
            Some(other) => {
                return Err(Error::Serialization(format!(
                    "__type must be a string, got {}",
                    other
                )))
            }
        },
    })
}

fn decode_tagged(kind: &str, map: &Mapping) -> Result<FieldValue> {
    match kind {
        "Date" => {
            let iso = string_key(map, "iso", Error::Serialization)?;
            Ok(FieldValue::Date(parse_date(iso)?))
        }
        "Bytes" => {
            let encoded = string_key(map, "base64", Error::Serialization)?;
            let bytes = STANDARD
                .decode(encoded)
                .map_err(|e| Error::Serialization(format!("invalid base64: {}", e)))?;
            Ok(FieldValue::Bytes(bytes))
        }
        "Pointer" => {
            let class_name = string_key(map, KEY_CLASS_NAME, Error::Schema)?;
            let remote_id = string_key(map, KEY_OBJECT_ID, Error::Schema)?;
            Ok(FieldValue::reference(class_name, remote_id))
        }
        "Object" => Ok(FieldValue::object(decode(map, None)?)),
        other => Err(Error::Serialization(format!(
            "unsupported transport type '{}'",
            other
        ))),
    }
}

/// Read a top-level `createdAt`/`updatedAt`, which the backend sends either
/// as a bare ISO string or as a `Date` value.
pub fn decode_timestamp(value: Option<&Value>) -> Result<Option<DateTime<Utc>>> {
    match value {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(iso)) => parse_date(iso).map(Some),
        Some(other) => match decode_value(other)? {
            FieldValue::Date(date) => Ok(Some(date)),
            found => Err(Error::Serialization(format!(
                "expected a date, got {}",
                found.type_name()
            ))),
        },
    }
}

/// Canonical ISO-8601 form: UTC, `Z` suffix, as many sub-second digits as needed.
pub fn format_date(date: &DateTime<Utc>) -> String {
    date.to_rfc3339_opts(SecondsFormat::AutoSi, true)
}

fn parse_date(iso: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(iso)
        .map(|d| d.with_timezone(&Utc))
        .map_err(|e| Error::Serialization(format!("invalid date '{}': {}", iso, e)))
}

fn string_key<'a>(map: &'a Mapping, key: &str, err: fn(String) -> Error) -> Result<&'a str> {
    map.get(key)
        .and_then(Value::as_str)
        .ok_or_else(|| err(format!("missing '{}'", key)))
}

fn tagged<const N: usize>(kind: &str, entries: [(&str, Value); N]) -> Value {
    let mut map = Mapping::new();
    map.insert(KEY_TYPE.into(), Value::String(kind.into()));
    for (key, value) in entries {
        map.insert(key.into(), value);
    }
    Value::Object(map)
}

fn pointer(class_name: &str, remote_id: &str) -> Value {
    tagged(
        "Pointer",
        [
            (KEY_CLASS_NAME, Value::String(class_name.into())),
            (KEY_OBJECT_ID, Value::String(remote_id.into())),
        ],
    )
}

/// Class name of a mapping, if present.
pub fn class_name_of(mapping: &Mapping) -> Option<ClassName> {
    mapping
        .get(KEY_CLASS_NAME)
        .and_then(Value::as_str)
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn as_map(value: Value) -> Mapping {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn encode_scalars_and_identity() {
        let mut object = BackendObject::without_data("GameScore", "xWMyZ4YEGZ")
            .with("score", 1337)
            .with("cheatMode", false)
            .with("playerName", "Sean Plott");
        object.set_timestamps(Some(Utc.with_ymd_and_hms(2022, 1, 1, 0, 0, 0).unwrap()), None);

        let map = encode(&object, EncodeContext::Immediate).unwrap();
        assert_eq!(
            Value::Object(map),
            json!({
                "className": "GameScore",
                "objectId": "xWMyZ4YEGZ",
                "createdAt": "2022-01-01T00:00:00Z",
                "score": 1337,
                "cheatMode": false,
                "playerName": "Sean Plott"
            })
        );
    }

    #[test]
    fn dates_and_bytes_use_tagged_form() {
        let date = Utc.with_ymd_and_hms(2011, 8, 21, 18, 2, 52).unwrap()
            + chrono::Duration::milliseconds(249);
        let value = encode_value(&FieldValue::Date(date), EncodeContext::Durable).unwrap();
        assert_eq!(value, json!({"__type": "Date", "iso": "2011-08-21T18:02:52.249Z"}));

        let value = encode_value(&FieldValue::Bytes(vec![1, 2, 3]), EncodeContext::Durable).unwrap();
        assert_eq!(value, json!({"__type": "Bytes", "base64": "AQID"}));
        assert_eq!(decode_value(&value).unwrap(), FieldValue::Bytes(vec![1, 2, 3]));
    }

    #[test]
    fn durable_encoding_requires_identified_children() {
        let child = BackendObject::new("Comment").with("text", "first");
        let parent = BackendObject::new("Post").with("latest", child);

        let err = encode(&parent, EncodeContext::Durable).unwrap_err();
        assert!(matches!(err, Error::Serialization(_)));

        let map = encode(&parent, EncodeContext::Immediate).unwrap();
        assert_eq!(
            map["latest"],
            json!({"__type": "Object", "className": "Comment", "text": "first"})
        );
    }

    #[test]
    fn durable_encoding_writes_pointers() {
        let child = BackendObject::without_data("Comment", "c1").with("text", "first");
        let parent = BackendObject::new("Post").with("latest", child);

        let map = encode(&parent, EncodeContext::Durable).unwrap();
        assert_eq!(
            map["latest"],
            json!({"__type": "Pointer", "className": "Comment", "objectId": "c1"})
        );
    }

    #[test]
    fn decode_with_expected_class() {
        let map = as_map(json!({"objectId": "abc", "title": "hello"}));
        let object = decode(&map, Some("Post")).unwrap();
        assert_eq!(object.class_name(), "Post");
        assert_eq!(object.remote_id().map(String::as_str), Some("abc"));
        assert!(!object.is_dirty());
    }

    #[test]
    fn decode_rejects_missing_identity() {
        let map = as_map(json!({"title": "hello"}));
        assert!(matches!(decode(&map, None), Err(Error::Schema(_))));

        let map = as_map(json!({"className": "Post", "createdAt": "2022-01-01T00:00:00Z"}));
        assert!(matches!(decode(&map, None), Err(Error::Schema(_))));

        let map = as_map(json!({"className": "Post"}));
        assert!(matches!(decode(&map, Some("Comment")), Err(Error::Schema(_))));

        let pointer = json!({"__type": "Pointer", "className": "Post"});
        assert!(matches!(decode_value(&pointer), Err(Error::Schema(_))));
    }

    #[test]
    fn decode_rejects_unknown_types() {
        let value = json!({"__type": "GeoPoint", "latitude": 1.0, "longitude": 2.0});
        assert!(matches!(decode_value(&value), Err(Error::Serialization(_))));

        let value = json!({"__type": "Date", "iso": "yesterday"});
        assert!(matches!(decode_value(&value), Err(Error::Serialization(_))));
    }

    #[test]
    fn reserved_keys_are_not_fields() {
        let map = as_map(json!({
            "className": "Post",
            "objectId": "p1",
            "localId": 42,
            "updatedAt": {"__type": "Date", "iso": "2022-01-01T00:00:00Z"},
            "title": "x"
        }));
        let object = decode(&map, None).unwrap();
        assert_eq!(object.fields().len(), 1);
        assert!(object.updated_at().is_some());
    }

    #[test]
    fn roundtrip_nested() {
        let date = Utc.timestamp_opt(1_700_000_000, 123_456_789).unwrap();
        let comment = BackendObject::without_data("Comment", "c1").with("at", date);
        let object = BackendObject::without_data("Post", "p1")
            .with("comment", comment)
            .with("author", FieldValue::reference("_User", "u1"))
            .with(
                "meta",
                FieldValue::Map(BTreeMap::from([(
                    "tags".to_string(),
                    FieldValue::List(vec!["a".into(), "b".into()]),
                )])),
            );

        let map = encode(&object, EncodeContext::Immediate).unwrap();
        let decoded = decode(&map, None).unwrap();
        assert_eq!(decoded, object);
    }

    #[test]
    fn reserved_field_names_are_refused() {
        let object = BackendObject::without_data("Post", "p1").with("localId", 7);
        let err = encode(&object, EncodeContext::Immediate).unwrap_err();
        assert!(matches!(err, Error::Schema(_)));
        assert!(encode_fields(object.fields(), EncodeContext::Durable).is_err());
        assert!(validate_fields(object.fields()).is_err());

        for key in RESERVED_KEYS {
            let object = BackendObject::without_data("Post", "p1").with(key, "x");
            assert!(encode(&object, EncodeContext::Immediate).is_err(), "{}", key);
        }
    }

    #[test]
    fn reserved_names_inside_embedded_objects_are_refused() {
        let comment = BackendObject::without_data("Comment", "c1").with("objectId", "c2");
        let object = BackendObject::without_data("Post", "p1").with("comment", comment);
        assert!(encode(&object, EncodeContext::Immediate).is_err());
        assert!(validate_fields(object.fields()).is_err());
    }

    #[test]
    fn map_with_type_key_is_refused() {
        let note = FieldValue::Map(BTreeMap::from([("__type".to_string(), "note".into())]));
        let object = BackendObject::without_data("Post", "p1").with("meta", note.clone());
        let err = encode(&object, EncodeContext::Immediate).unwrap_err();
        assert!(matches!(err, Error::Serialization(_)));

        let nested = FieldValue::List(vec![note]);
        assert!(encode_value(&nested, EncodeContext::Durable).is_err());

        // Identity key names are ordinary keys inside a map.
        let meta = FieldValue::Map(BTreeMap::from([("className".to_string(), "x".into())]));
        let object = BackendObject::without_data("Post", "p1").with("meta", meta);
        let map = encode(&object, EncodeContext::Immediate).unwrap();
        assert_eq!(decode(&map, None).unwrap(), object);
    }
}
