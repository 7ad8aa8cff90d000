//! Query, update and sort values, plus the `QueryBuilder`
//!
//! A `Query` is a filter document in the familiar operator dialect:
//! literals match by equality, `{"$in": [..]}` by membership, `{"$exists": b}`
//! by presence, `{"$regex": ..}` by pattern, `{"$text": {"$search": ..}}` by
//! full-text, and `{"$expr": ..}` by computed expression.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::record::Record;

/// Reserved key carrying a full-text predicate.
pub const TEXT_KEY: &str = "$text";

/// Reserved key carrying an expression predicate.
pub const EXPR_KEY: &str = "$expr";

/// An immutable filter document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Query(Record);

impl Query {
    /// Matches every document.
    pub fn all() -> Self {
        Self::default()
    }

    /// Single-field equality.
    pub fn eq(key: impl Into<String>, value: impl Into<Value>) -> Self {
        let mut map = Map::new();
        map.insert(key.into(), value.into());
        Query(map)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_record(&self) -> &Record {
        &self.0
    }

    pub fn into_record(self) -> Record {
        self.0
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    /// First value in insertion order, used to name the selector in errors.
    pub fn first_value(&self) -> Option<&Value> {
        self.0.values().next()
    }

    /// Conjunction of two filters.
    pub fn and(self, other: Query) -> Query {
        if self.is_empty() {
            return other;
        }
        if other.is_empty() {
            return self;
        }
        Query::eq("$and", json!([Value::Object(self.0), Value::Object(other.0)]))
    }
}

impl From<Record> for Query {
    fn from(record: Record) -> Self {
        Query(record)
    }
}

impl TryFrom<Value> for Query {
    type Error = crate::error::DbError;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        match value {
            Value::Object(map) => Ok(Query(map)),
            other => Err(crate::error::DbError::InvalidParams(format!(
                "query must be an object, got {other}"
            ))),
        }
    }
}

/// An update document.
///
/// Operators: `$set`, `$unset`, `$inc`. A document without operators is a
/// field-level `$set` of its top-level keys.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Update(Record);

impl Update {
    pub fn set(fields: Record) -> Self {
        let mut map = Map::new();
        map.insert("$set".to_string(), Value::Object(fields));
        Update(map)
    }

    pub fn set_field(path: impl Into<String>, value: impl Into<Value>) -> Self {
        let mut fields = Map::new();
        fields.insert(path.into(), value.into());
        Self::set(fields)
    }

    pub fn unset(paths: &[&str]) -> Self {
        let fields = paths
            .iter()
            .map(|p| (p.to_string(), Value::from("")))
            .collect();
        let mut map = Map::new();
        map.insert("$unset".to_string(), Value::Object(fields));
        Update(map)
    }

    pub fn as_record(&self) -> &Record {
        &self.0
    }

    /// Normalized operator map: operator-free documents become `$set`.
    pub fn operators(&self) -> Record {
        if self.0.keys().any(|k| k.starts_with('$')) {
            self.0.clone()
        } else {
            let mut map = Map::new();
            map.insert("$set".to_string(), Value::Object(self.0.clone()));
            map
        }
    }
}

impl From<Record> for Update {
    fn from(record: Record) -> Self {
        Update(record)
    }
}

/// Sort direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    Asc,
    Desc,
}

/// What a sort clause orders by.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SortKey {
    Field(String),
    /// Insertion order
    Natural,
}

/// Ordered list of sort clauses. Ties always fall back to insertion order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Sort(Vec<(SortKey, SortOrder)>);

impl Sort {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn asc(mut self, field: impl Into<String>) -> Self {
        self.0.push((SortKey::Field(field.into()), SortOrder::Asc));
        self
    }

    pub fn desc(mut self, field: impl Into<String>) -> Self {
        self.0.push((SortKey::Field(field.into()), SortOrder::Desc));
        self
    }

    pub fn by(mut self, field: impl Into<String>, order: SortOrder) -> Self {
        self.0.push((SortKey::Field(field.into()), order));
        self
    }

    /// Most recently inserted first.
    pub fn newest_first() -> Self {
        Sort(vec![(SortKey::Natural, SortOrder::Desc)])
    }

    pub fn clauses(&self) -> &[(SortKey, SortOrder)] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Inclusive bounds on a timestamp field, stored as epoch milliseconds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DateRange {
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
}

impl DateRange {
    pub fn new(from: Option<DateTime<Utc>>, to: Option<DateTime<Utc>>) -> Self {
        Self { from, to }
    }
}

/// Incrementally assembles a `Query` from optional conditions.
///
/// Every `add_*` is a no-op when its input is absent. Values are not
/// validated beyond presence.
#[derive(Debug, Default)]
pub struct QueryBuilder {
    query: Record,
}

impl QueryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// `query[key] = value`
    pub fn add_param<V: Into<Value>>(mut self, key: &str, value: Option<V>) -> Self {
        if let Some(value) = value {
            self.query.insert(key.to_string(), value.into());
        }
        self
    }

    /// `query[key] = {"$in": values}` for a non-empty sequence.
    pub fn add_in_array<V: Into<Value>>(mut self, key: &str, values: Option<Vec<V>>) -> Self {
        if let Some(values) = values.filter(|v| !v.is_empty()) {
            let values: Vec<Value> = values.into_iter().map(Into::into).collect();
            self.query.insert(key.to_string(), json!({ "$in": values }));
        }
        self
    }

    /// Full-text predicate on the reserved text key.
    pub fn add_text_search(mut self, value: Option<&str>) -> Self {
        if let Some(value) = value {
            self.query
                .insert(TEXT_KEY.to_string(), json!({ "$search": value }));
        }
        self
    }

    /// Substring match: `.*value.*`, case-insensitive. `value` is not escaped.
    pub fn add_regex_search(mut self, key: &str, value: Option<&str>) -> Self {
        if let Some(value) = value {
            self.query.insert(
                key.to_string(),
                json!({ "$regex": format!(".*{value}.*"), "$options": "i" }),
            );
        }
        self
    }

    /// `query[key] = {"$exists": exists}`
    pub fn add_exists(mut self, key: &str, exists: Option<bool>) -> Self {
        if let Some(exists) = exists {
            self.query
                .insert(key.to_string(), json!({ "$exists": exists }));
        }
        self
    }

    /// Field exists and `len(field) >= min_size`, when `trigger` is set.
    pub fn add_array_length_at_least<V>(mut self, key: &str, trigger: Option<V>, min_size: usize) -> Self {
        if trigger.is_some() {
            self.query
                .insert(key.to_string(), json!({ "$exists": true }));
            let predicate = json!({ "$gte": [{ "$size": format!("${key}") }, min_size] });
            let expr = match self.query.shift_remove(EXPR_KEY) {
                Some(existing) => json!({ "$and": [existing, predicate] }),
                None => predicate,
            };
            self.query.insert(EXPR_KEY.to_string(), expr);
        }
        self
    }

    /// Min/max bound on a timestamp field.
    pub fn add_date_range(mut self, key: &str, range: Option<DateRange>) -> Self {
        if let Some(range) = range {
            let mut bounds = Map::new();
            if let Some(from) = range.from {
                bounds.insert("$gte".to_string(), json!(from.timestamp_millis()));
            }
            if let Some(to) = range.to {
                bounds.insert("$lte".to_string(), json!(to.timestamp_millis()));
            }
            if !bounds.is_empty() {
                self.query.insert(key.to_string(), Value::Object(bounds));
            }
        }
        self
    }

    pub fn build(self) -> Query {
        Query(self.query)
    }
}
