//! Record helpers
//!
//! A `Record` is one stored document: an insertion-ordered JSON object.
//! Field paths use dot notation (`status.progress`).

use serde_json::{Map, Value};

use crate::error::{DbError, StoreError};
use crate::object_id::ObjectId;

/// One stored document.
pub type Record = Map<String, Value>;

/// Internal identifier field, as stored.
pub const INTERNAL_ID: &str = "_id";

/// Public alias of the internal identifier.
pub const PUBLIC_ID: &str = "id";

/// Resolve a dot-notation path.
pub fn get_path<'a>(record: &'a Record, path: &str) -> Option<&'a Value> {
    let mut parts = path.split('.');
    let first = parts.next()?;
    let mut current = record.get(first)?;
    for part in parts {
        current = match current {
            Value::Object(map) => map.get(part)?,
            Value::Array(items) => items.get(part.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

/// Set a dot-notation path, creating intermediate objects.
///
/// A non-object value in the way is replaced by an object.
pub fn set_path(record: &mut Record, path: &str, value: Value) {
    match path.split_once('.') {
        None => {
            record.insert(path.to_string(), value);
        }
        Some((head, rest)) => {
            let slot = record
                .entry(head.to_string())
                .or_insert_with(|| Value::Object(Map::new()));
            if !slot.is_object() {
                *slot = Value::Object(Map::new());
            }
            if let Value::Object(child) = slot {
                set_path(child, rest, value);
            }
        }
    }
}

/// Remove a dot-notation path, returning the removed value.
pub fn remove_path(record: &mut Record, path: &str) -> Option<Value> {
    match path.split_once('.') {
        None => record.shift_remove(path),
        Some((head, rest)) => match record.get_mut(head) {
            Some(Value::Object(child)) => remove_path(child, rest),
            _ => None,
        },
    }
}

/// Recursively merge `patch` into `target`.
///
/// Objects merge key by key; every other value (arrays included) replaces.
pub fn deep_merge(target: &mut Record, patch: Record) {
    for (key, value) in patch {
        match (target.get_mut(&key), value) {
            (Some(Value::Object(existing)), Value::Object(incoming)) => {
                deep_merge(existing, incoming);
            }
            (_, value) => {
                target.insert(key, value);
            }
        }
    }
}

/// Internal id of a stored record.
pub fn internal_id(record: &Record) -> Result<ObjectId, StoreError> {
    match record.get(INTERNAL_ID) {
        Some(Value::String(hex)) => ObjectId::parse_str(hex)
            .map_err(|_| StoreError::Backend(format!("stored document has malformed _id {hex}"))),
        _ => Err(StoreError::Backend("stored document has no _id".to_string())),
    }
}

/// Strip the internal id and republish it as `id`.
///
/// A record whose projection removed `_id` comes back without `id`.
pub fn publish_id(mut record: Record) -> Record {
    if let Some(id) = record.shift_remove(INTERNAL_ID) {
        record.insert(PUBLIC_ID.to_string(), id);
    }
    record
}

/// Serialize an entity into a record; entities must serialize to objects.
pub fn to_record<T: serde::Serialize>(entity: &T) -> Result<Record, DbError> {
    match serde_json::to_value(entity)? {
        Value::Object(map) => Ok(map),
        other => Err(DbError::InvalidParams(format!(
            "entity must serialize to an object, got {}",
            type_name(&other)
        ))),
    }
}

pub fn from_record<T: serde::de::DeserializeOwned>(record: Record) -> Result<T, DbError> {
    Ok(serde_json::from_value(Value::Object(record))?)
}

/// Render a selector value for error messages.
pub fn display_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

pub(crate) fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn rec(v: Value) -> Record {
        v.as_object().cloned().unwrap()
    }

    #[test]
    fn paths_resolve_through_objects_and_arrays() {
        let r = rec(json!({"status": {"progress": 40}, "nodes": [{"id": "a"}, {"id": "b"}]}));
        assert_eq!(get_path(&r, "status.progress"), Some(&json!(40)));
        assert_eq!(get_path(&r, "nodes.1.id"), Some(&json!("b")));
        assert_eq!(get_path(&r, "status.missing"), None);
    }

    #[test]
    fn set_path_creates_intermediates() {
        let mut r = rec(json!({"status": "flat"}));
        set_path(&mut r, "status.progress", json!(10));
        set_path(&mut r, "result.data.count", json!(3));
        assert_eq!(
            Value::Object(r),
            json!({"status": {"progress": 10}, "result": {"data": {"count": 3}}})
        );
    }

    #[test]
    fn deep_merge_keeps_sibling_fields() {
        let mut target = rec(json!({"status": {"status": "active", "progress": 10}, "tags": [1, 2]}));
        deep_merge(
            &mut target,
            rec(json!({"status": {"progress": 50}, "tags": [3]})),
        );
        assert_eq!(
            Value::Object(target),
            json!({"status": {"status": "active", "progress": 50}, "tags": [3]})
        );
    }

    #[test]
    fn publish_id_renames_internal_id() {
        let r = publish_id(rec(json!({"_id": "5f1b2c3d4e5f6a7b8c9d0e1f", "name": "x"})));
        assert_eq!(r.get("id"), Some(&json!("5f1b2c3d4e5f6a7b8c9d0e1f")));
        assert!(!r.contains_key("_id"));

        let untouched = publish_id(rec(json!({"name": "x"})));
        assert!(!untouched.contains_key("id"));
    }

    #[test]
    fn remove_path_drops_nested_field() {
        let mut r = rec(json!({"a": {"b": 1, "c": 2}}));
        assert_eq!(remove_path(&mut r, "a.b"), Some(json!(1)));
        assert_eq!(Value::Object(r), json!({"a": {"c": 2}}));
    }

    #[test]
    fn non_object_entities_are_rejected() {
        let err = to_record(&vec![1, 2]).unwrap_err();
        assert!(matches!(err, DbError::InvalidParams(_)));
    }
}
