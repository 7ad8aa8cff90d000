//! Backend-independent document operations shared by both stores
//!
//! - `ensure_id`: assign or validate `_id`
//! - `apply_update`: `$set` / `$unset` / `$inc`
//! - `upsert_seed`: document created by an upsert that matched nothing
//! - `diff_fields`: changed dot-paths between two versions
//! - `TxOp`: buffered transaction writes, replaces guarded by the version read

use serde_json::Value;

use crate::error::StoreError;
use crate::object_id::ObjectId;
use crate::query::{Query, Sort, SortKey, SortOrder, Update};
use crate::record::{get_path, remove_path, set_path, Record, INTERNAL_ID};

use super::matcher::sort_cmp;

use super::{IndexSpec, StoreResult};

/// A buffered transaction write, applied in order at commit.
#[derive(Debug, Clone, PartialEq)]
pub enum TxOp {
    Insert {
        collection: String,
        doc: Record,
    },
    /// Replace a document. With `expected`, the commit fails with
    /// `WriteConflict` unless the stored version still equals it.
    Put {
        collection: String,
        id: ObjectId,
        doc: Record,
        expected: Option<Record>,
    },
    Remove {
        collection: String,
        id: ObjectId,
    },
}

/// Ensure `doc` carries a valid `_id` in first position and return it.
pub fn ensure_id(doc: &mut Record) -> StoreResult<ObjectId> {
    let id = match doc.shift_remove(INTERNAL_ID) {
        None => ObjectId::new(),
        Some(Value::String(hex)) => ObjectId::parse_str(&hex)
            .map_err(|_| StoreError::Backend(format!("invalid _id {hex}")))?,
        Some(other) => {
            return Err(StoreError::Backend(format!("invalid _id {other}")));
        }
    };
    let mut ordered = Record::with_capacity(doc.len() + 1);
    ordered.insert(INTERNAL_ID.to_string(), Value::String(id.to_hex()));
    ordered.extend(std::mem::take(doc));
    *doc = ordered;
    Ok(id)
}

/// Apply update operators in place. Returns whether anything changed.
pub fn apply_update(doc: &mut Record, update: &Update) -> StoreResult<bool> {
    let before = doc.clone();
    for (op, fields) in update.operators() {
        let Value::Object(fields) = fields else {
            return Err(StoreError::Backend(format!("{op} expects an object")));
        };
        for (path, value) in fields {
            if path == INTERNAL_ID || path.starts_with("_id.") {
                return Err(StoreError::Backend("_id is immutable".to_string()));
            }
            match op.as_str() {
                "$set" => set_path(doc, &path, value),
                "$unset" => {
                    remove_path(doc, &path);
                }
                "$inc" => {
                    let current = get_path(doc, &path).cloned().unwrap_or(Value::from(0));
                    let next = match (current.as_i64(), value.as_i64()) {
                        (Some(a), Some(b)) => Value::from(a + b),
                        _ => match (current.as_f64(), value.as_f64()) {
                            (Some(a), Some(b)) => Value::from(a + b),
                            _ => {
                                return Err(StoreError::Backend(format!(
                                    "$inc on non-numeric field {path}"
                                )))
                            }
                        },
                    };
                    set_path(doc, &path, next);
                }
                other => {
                    return Err(StoreError::Unsupported(format!("update operator {other}")));
                }
            }
        }
    }
    Ok(*doc != before)
}

/// Seed document for an upsert: the query's plain equality fields, then
/// the update applied on top.
pub fn upsert_seed(query: &Query, update: &Update) -> StoreResult<Record> {
    let mut doc = Record::new();
    for (path, value) in query.as_record() {
        let is_operator_value =
            matches!(value, Value::Object(map) if map.keys().any(|k| k.starts_with('$')));
        if path.starts_with('$') || is_operator_value {
            continue;
        }
        set_path(&mut doc, path, value.clone());
    }
    apply_update(&mut doc, update)?;
    Ok(doc)
}

/// Dot-paths that differ between `old` and `new`.
///
/// Nested objects present on both sides are compared field by field, any
/// other difference reports the whole value.
pub fn diff_fields(old: &Record, new: &Record) -> (Record, Vec<String>) {
    let mut updated = Record::new();
    let mut removed = Vec::new();
    diff_into("", old, new, &mut updated, &mut removed);
    (updated, removed)
}

fn diff_into(prefix: &str, old: &Record, new: &Record, updated: &mut Record, removed: &mut Vec<String>) {
    for (key, new_value) in new {
        let path = if prefix.is_empty() {
            key.clone()
        } else {
            format!("{prefix}.{key}")
        };
        match (old.get(key), new_value) {
            (Some(Value::Object(o)), Value::Object(n)) => diff_into(&path, o, n, updated, removed),
            (Some(o), n) if o == n => {}
            (_, n) => {
                updated.insert(path, n.clone());
            }
        }
    }
    for key in old.keys() {
        if !new.contains_key(key) {
            removed.push(if prefix.is_empty() {
                key.clone()
            } else {
                format!("{prefix}.{key}")
            });
        }
    }
}

/// Order `(position, record)` pairs. `SortKey::Natural` and ties use the
/// position.
pub fn sort_positioned(hits: &mut [(usize, &Record)], sort: &Sort) {
    if sort.is_empty() {
        return;
    }
    hits.sort_by(|(ia, a), (ib, b)| {
        for (key, order) in sort.clauses() {
            let ord = match key {
                SortKey::Field(path) => sort_cmp(get_path(a, path), get_path(b, path)),
                SortKey::Natural => ia.cmp(ib),
            };
            let ord = match order {
                SortOrder::Asc => ord,
                SortOrder::Desc => ord.reverse(),
            };
            if ord.is_ne() {
                return ord;
            }
        }
        ia.cmp(ib)
    });
}

/// Values of an index's fields in `doc`; missing fields index as null.
pub fn index_key(doc: &Record, index: &IndexSpec) -> Vec<Value> {
    index
        .fields
        .iter()
        .map(|f| get_path(doc, f).cloned().unwrap_or(Value::Null))
        .collect()
}

/// Render an index key for error messages.
pub fn render_key(key: &[Value]) -> String {
    key.iter()
        .map(|v| v.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn rec(v: Value) -> Record {
        v.as_object().cloned().unwrap()
    }

    #[test]
    fn ensure_id_assigns_and_moves_to_front() {
        let mut doc = rec(json!({"name": "a"}));
        let id = ensure_id(&mut doc).unwrap();
        assert_eq!(doc.keys().next().map(String::as_str), Some("_id"));
        assert_eq!(doc.get("_id"), Some(&json!(id.to_hex())));

        let mut bad = rec(json!({"_id": "nope"}));
        assert!(ensure_id(&mut bad).is_err());
    }

    #[test]
    fn update_operators_apply_in_place() {
        let mut doc = rec(json!({"status": {"status": "active"}, "retries": 1, "tmp": true}));
        let update = Update::from(rec(json!({
            "$set": {"status.progress": 30},
            "$inc": {"retries": 2},
            "$unset": {"tmp": ""}
        })));
        assert!(apply_update(&mut doc, &update).unwrap());
        assert_eq!(
            Value::Object(doc),
            json!({"status": {"status": "active", "progress": 30}, "retries": 3})
        );
    }

    #[test]
    fn setting_id_is_rejected() {
        let mut doc = rec(json!({"_id": "5f1b2c3d4e5f6a7b8c9d0e1f"}));
        let err = apply_update(&mut doc, &Update::set_field("_id", "x")).unwrap_err();
        assert!(matches!(err, StoreError::Backend(_)));
    }

    #[test]
    fn upsert_seed_combines_equality_fields_and_update() {
        let query = Query::try_from(json!({"name": "algo", "version": {"$gt": 1}})).unwrap();
        let seed = upsert_seed(&query, &Update::set_field("cpu", 2)).unwrap();
        assert_eq!(Value::Object(seed), json!({"name": "algo", "cpu": 2}));
    }

    #[test]
    fn sort_breaks_ties_by_position() {
        let a = rec(json!({"name": "b"}));
        let b = rec(json!({"name": "a"}));
        let c = rec(json!({"name": "b"}));
        let mut hits = vec![(0, &a), (1, &b), (2, &c)];
        sort_positioned(&mut hits, &Sort::new().asc("name"));
        assert_eq!(hits.iter().map(|(i, _)| *i).collect::<Vec<_>>(), vec![1, 0, 2]);

        sort_positioned(&mut hits, &Sort::newest_first());
        assert_eq!(hits.iter().map(|(i, _)| *i).collect::<Vec<_>>(), vec![2, 1, 0]);
    }

    #[test]
    fn diff_reports_nested_paths() {
        let old = rec(json!({"status": {"status": "active", "progress": 10}, "gone": 1}));
        let new = rec(json!({"status": {"status": "active", "progress": 60}, "result": {"ok": true}}));
        let (updated, removed) = diff_fields(&old, &new);
        assert_eq!(
            Value::Object(updated),
            json!({"status.progress": 60, "result": {"ok": true}})
        );
        assert_eq!(removed, vec!["gone".to_string()]);
    }
}
