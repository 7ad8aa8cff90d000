//! Filter evaluation over in-memory records
//!
//! Used by `MemoryStore` for queries and by every backend for change-stream
//! match stages.

use std::cmp::Ordering;

use regex::RegexBuilder;
use serde_json::Value;
use tracing::debug;

use crate::query::{Query, EXPR_KEY, TEXT_KEY};
use crate::record::{get_path, Record};

/// Whether `record` satisfies every clause of `query`.
pub fn matches(record: &Record, query: &Query) -> bool {
    matches_map(record, query.as_record())
}

fn matches_map(record: &Record, query: &Record) -> bool {
    query.iter().all(|(key, condition)| match key.as_str() {
        "$and" => sub_queries(condition).iter().all(|q| matches_map(record, q)),
        "$or" => sub_queries(condition).iter().any(|q| matches_map(record, q)),
        "$nor" => !sub_queries(condition).iter().any(|q| matches_map(record, q)),
        TEXT_KEY => text_matches(record, condition),
        EXPR_KEY => truthy(&eval_expr(record, condition)),
        path => value_matches(get_path(record, path), condition),
    })
}

fn sub_queries(condition: &Value) -> Vec<&Record> {
    match condition {
        Value::Array(items) => items.iter().filter_map(Value::as_object).collect(),
        _ => Vec::new(),
    }
}

fn is_operator_object(condition: &Value) -> bool {
    matches!(condition, Value::Object(map) if map.keys().any(|k| k.starts_with('$')))
}

fn value_matches(value: Option<&Value>, condition: &Value) -> bool {
    if !is_operator_object(condition) {
        return equals(value, condition);
    }
    let Value::Object(ops) = condition else {
        return false;
    };
    ops.iter().all(|(op, operand)| match op.as_str() {
        "$eq" => equals(value, operand),
        "$ne" => !equals(value, operand),
        "$gt" => compare(value, operand) == Some(Ordering::Greater),
        "$gte" => matches!(compare(value, operand), Some(Ordering::Greater | Ordering::Equal)),
        "$lt" => compare(value, operand) == Some(Ordering::Less),
        "$lte" => matches!(compare(value, operand), Some(Ordering::Less | Ordering::Equal)),
        "$in" => match operand {
            Value::Array(options) => options.iter().any(|o| equals(value, o)),
            _ => false,
        },
        "$nin" => match operand {
            Value::Array(options) => !options.iter().any(|o| equals(value, o)),
            _ => true,
        },
        "$exists" => value.is_some() == truthy(operand),
        "$size" => match (value, operand.as_u64()) {
            (Some(Value::Array(items)), Some(n)) => items.len() as u64 == n,
            _ => false,
        },
        "$regex" => regex_matches(value, operand, ops.get("$options")),
        "$options" => true,
        other => {
            debug!(operator = other, "unknown query operator never matches");
            false
        }
    })
}

/// Equality; a `null` condition also matches a missing field.
fn equals(value: Option<&Value>, condition: &Value) -> bool {
    match (value, condition) {
        (None, Value::Null) => true,
        (None, _) => false,
        (Some(Value::Number(a)), Value::Number(b)) => a.as_f64() == b.as_f64(),
        (Some(v), c) => v == c,
    }
}

fn compare(value: Option<&Value>, operand: &Value) -> Option<Ordering> {
    match (value?, operand) {
        (Value::Number(a), Value::Number(b)) => a.as_f64()?.partial_cmp(&b.as_f64()?),
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        (Value::Bool(a), Value::Bool(b)) => Some(a.cmp(b)),
        _ => None,
    }
}

fn regex_matches(value: Option<&Value>, pattern: &Value, options: Option<&Value>) -> bool {
    let (Some(Value::String(text)), Value::String(pattern)) = (value, pattern) else {
        return false;
    };
    let insensitive = options
        .and_then(Value::as_str)
        .map(|o| o.contains('i'))
        .unwrap_or(false);
    match RegexBuilder::new(pattern).case_insensitive(insensitive).build() {
        Ok(re) => re.is_match(text),
        Err(e) => {
            debug!(pattern = %pattern, error = %e, "invalid regex never matches");
            false
        }
    }
}

/// Any search term appears in any string value of the document.
fn text_matches(record: &Record, condition: &Value) -> bool {
    let Some(search) = condition.get("$search").and_then(Value::as_str) else {
        return false;
    };
    let terms: Vec<String> = search
        .split_whitespace()
        .map(|t| t.to_lowercase())
        .collect();
    if terms.is_empty() {
        return false;
    }
    let root = Value::Object(record.clone());
    let mut strings = Vec::new();
    collect_strings(&root, &mut strings);
    strings.iter().any(|s| {
        let s = s.to_lowercase();
        terms.iter().any(|t| s.contains(t.as_str()))
    })
}

fn collect_strings<'a>(value: &'a Value, out: &mut Vec<&'a str>) {
    match value {
        Value::String(s) => out.push(s),
        Value::Array(items) => items.iter().for_each(|v| collect_strings(v, out)),
        Value::Object(map) => map.values().for_each(|v| collect_strings(v, out)),
        _ => {}
    }
}

fn eval_expr(record: &Record, expr: &Value) -> Value {
    match expr {
        Value::String(s) if s.starts_with('$') => {
            get_path(record, &s[1..]).cloned().unwrap_or(Value::Null)
        }
        Value::Object(map) if map.len() == 1 => {
            let Some((op, args)) = map.iter().next() else {
                return Value::Null;
            };
            match op.as_str() {
                "$size" => match eval_expr(record, args) {
                    Value::Array(items) => Value::from(items.len()),
                    _ => Value::Null,
                },
                "$and" => Value::Bool(
                    args.as_array()
                        .map(|a| a.iter().all(|e| truthy(&eval_expr(record, e))))
                        .unwrap_or(false),
                ),
                "$or" => Value::Bool(
                    args.as_array()
                        .map(|a| a.iter().any(|e| truthy(&eval_expr(record, e))))
                        .unwrap_or(false),
                ),
                "$eq" | "$ne" | "$gt" | "$gte" | "$lt" | "$lte" => {
                    let Some([left, right]) = args.as_array().map(Vec::as_slice).and_then(|a| {
                        <&[Value; 2]>::try_from(a).ok()
                    }) else {
                        return Value::Bool(false);
                    };
                    let left = eval_expr(record, left);
                    let right = eval_expr(record, right);
                    let ordering = if left.is_null() {
                        None
                    } else {
                        compare(Some(&left), &right)
                    };
                    Value::Bool(match op.as_str() {
                        "$eq" => equals(Some(&left), &right),
                        "$ne" => !equals(Some(&left), &right),
                        "$gt" => ordering == Some(Ordering::Greater),
                        "$gte" => matches!(ordering, Some(Ordering::Greater | Ordering::Equal)),
                        "$lt" => ordering == Some(Ordering::Less),
                        _ => matches!(ordering, Some(Ordering::Less | Ordering::Equal)),
                    })
                }
                _ => Value::Null,
            }
        }
        literal => literal.clone(),
    }
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        _ => true,
    }
}

fn type_rank(value: Option<&Value>) -> u8 {
    match value {
        None | Some(Value::Null) => 0,
        Some(Value::Number(_)) => 1,
        Some(Value::String(_)) => 2,
        Some(Value::Object(_)) => 3,
        Some(Value::Array(_)) => 4,
        Some(Value::Bool(_)) => 5,
    }
}

/// Total order used for sorting: missing/null < numbers < strings < objects
/// < arrays < booleans; values of one type compare naturally.
pub fn sort_cmp(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    let rank = type_rank(a).cmp(&type_rank(b));
    if rank != Ordering::Equal {
        return rank;
    }
    match (a, b) {
        (Some(Value::Number(x)), Some(Value::Number(y))) => x
            .as_f64()
            .partial_cmp(&y.as_f64())
            .unwrap_or(Ordering::Equal),
        (Some(Value::String(x)), Some(Value::String(y))) => x.cmp(y),
        (Some(Value::Bool(x)), Some(Value::Bool(y))) => x.cmp(y),
        (Some(x), Some(y)) => x.to_string().cmp(&y.to_string()),
        _ => Ordering::Equal,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::{DateRange, QueryBuilder};
    use chrono::{TimeZone, Utc};
    use serde_json::json;

    fn job() -> Record {
        json!({
            "jobId": "job-1",
            "pipeline": {"name": "green-pipe", "experimentName": "main", "nodes": [{"n": 1}, {"n": 2}]},
            "status": {"status": "active"},
            "startTime": Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap().timestamp_millis(),
            "priority": 3
        })
        .as_object()
        .cloned()
        .unwrap()
    }

    fn q(v: Value) -> Query {
        Query::try_from(v).unwrap()
    }

    #[test]
    fn equality_and_nested_paths() {
        assert!(matches(&job(), &q(json!({"jobId": "job-1", "status.status": "active"}))));
        assert!(!matches(&job(), &q(json!({"status.status": "completed"}))));
        assert!(matches(&job(), &q(json!({"missing": null}))));
    }

    #[test]
    fn builder_output_matches_expected_documents() {
        let query = QueryBuilder::new()
            .add_param("pipeline.experimentName", Some("main"))
            .add_in_array("status.status", Some(vec!["active", "pending"]))
            .add_regex_search("pipeline.name", Some("GREEN"))
            .add_exists("result", Some(false))
            .add_array_length_at_least("pipeline.nodes", Some(true), 2)
            .add_date_range(
                "startTime",
                Some(DateRange::new(
                    Some(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()),
                    Some(Utc.with_ymd_and_hms(2024, 12, 31, 0, 0, 0).unwrap()),
                )),
            )
            .build();
        assert!(matches(&job(), &query));

        let too_many_nodes = QueryBuilder::new()
            .add_array_length_at_least("pipeline.nodes", Some(true), 3)
            .build();
        assert!(!matches(&job(), &too_many_nodes));
    }

    #[test]
    fn comparison_operators() {
        assert!(matches(&job(), &q(json!({"priority": {"$gte": 3, "$lt": 4}}))));
        assert!(!matches(&job(), &q(json!({"priority": {"$gt": 3}}))));
        assert!(matches(&job(), &q(json!({"priority": {"$nin": [1, 2]}}))));
        assert!(matches(&job(), &q(json!({"priority": {"$ne": 1}}))));
    }

    #[test]
    fn logical_combinators() {
        assert!(matches(
            &job(),
            &q(json!({"$or": [{"jobId": "other"}, {"priority": 3}]}))
        ));
        assert!(!matches(
            &job(),
            &q(json!({"$and": [{"jobId": "job-1"}, {"priority": 4}]}))
        ));
    }

    #[test]
    fn text_search_is_case_insensitive_over_string_values() {
        assert!(matches(&job(), &q(json!({"$text": {"$search": "Green"}}))));
        assert!(!matches(&job(), &q(json!({"$text": {"$search": "resnet"}}))));
    }

    #[test]
    fn sort_order_ranks_types() {
        assert_eq!(sort_cmp(None, Some(&json!(1))), Ordering::Less);
        assert_eq!(sort_cmp(Some(&json!(2)), Some(&json!(10))), Ordering::Less);
        assert_eq!(sort_cmp(Some(&json!("b")), Some(&json!("a"))), Ordering::Greater);
    }
}
