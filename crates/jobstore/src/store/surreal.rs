//! SurrealDB-backed document store
//!
//! Each document is one row `{ _id, doc, seq }` keyed by
//! `type::thing(table, _id)`; `seq` is a creation stamp that orders rows by
//! insertion.
//!
//! Filters are translated to SurrealQL `WHERE` clauses (`doc.<path>`),
//! unique indexes become `DEFINE INDEX ... UNIQUE`, transactions are sent as
//! a single `BEGIN ... COMMIT` batch and change streams ride on
//! `LIVE SELECT`. A transaction's replaces re-check the version it read
//! inside the batch and abort it with `THROW` when another writer got there
//! first.
//!
//! Filters the translator cannot express fail with `StoreError::Unsupported`
//! instead of silently matching something else.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use futures::future::ready;
use futures::StreamExt;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use surrealdb::engine::any::Any;
use surrealdb::opt::auth::{Database, Root};
use surrealdb::{Action, Notification, Surreal};
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, info, instrument};

use super::matcher;
use super::ops::{apply_update, diff_fields, ensure_id, sort_positioned, upsert_seed, TxOp};
use super::{
    ChangeEvent, ChangeStream, DocumentStore, FindOptions, IndexSpec, InsertManyOutcome,
    OperationType, StoreResult, StoreTransaction, StreamCounter, UpdateOutcome,
};
use crate::config::{StoreConfig, DEFAULT_URL};
use crate::error::StoreError;
use crate::object_id::ObjectId;
use crate::query::{Query, Sort, SortKey, SortOrder, Update, EXPR_KEY, TEXT_KEY};
use crate::record::{Record, INTERNAL_ID};

/// Prefix of the errors thrown by guarded replaces
const WRITE_CONFLICT: &str = "write conflict: ";

/// Map a SurrealDB error message onto a `StoreError`.
///
/// Unique index violations read
/// ``Database index `idx` already contains 'key', with record `tb:id` ``
/// and record id clashes ``Database record `tb:id` already exists``.
pub fn classify_error(message: &str) -> StoreError {
    if let Some((_, detail)) = message.split_once(WRITE_CONFLICT) {
        return StoreError::WriteConflict(detail.trim().to_string());
    }
    if message.contains("already contains") {
        let index = backticked(message).unwrap_or("unknown").to_string();
        let key = message
            .split_once("already contains ")
            .map(|(_, rest)| rest.split(", with record").next().unwrap_or(rest).trim())
            .map(str::to_string);
        return StoreError::DuplicateKey { index, key };
    }
    if message.contains("already exists") && message.contains("record") {
        return StoreError::DuplicateKey {
            index: "_id_".to_string(),
            key: backticked(message).map(str::to_string),
        };
    }
    let lower = message.to_lowercase();
    if lower.contains("connection") || lower.contains("websocket") {
        return StoreError::Connection(message.to_string());
    }
    if lower.contains("can be retried") || lower.contains("conflict") {
        return StoreError::WriteConflict(message.to_string());
    }
    StoreError::Backend(message.to_string())
}

fn backticked(message: &str) -> Option<&str> {
    let start = message.find('`')? + 1;
    let len = message[start..].find('`')?;
    Some(&message[start..start + len])
}

/// A document as stored
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct StoredRow {
    #[serde(rename = "_id", default)]
    key: String,
    #[serde(default)]
    doc: Record,
    /// Creation stamp; rows written before it existed sort first
    #[serde(default)]
    seq: i64,
}

impl StoredRow {
    fn from_record(mut doc: Record) -> StoreResult<(ObjectId, Self)> {
        let id = ensure_id(&mut doc)?;
        doc.shift_remove(INTERNAL_ID);
        Ok((
            id,
            StoredRow {
                key: id.to_hex(),
                doc,
                seq: 0,
            },
        ))
    }

    fn id(&self) -> StoreResult<ObjectId> {
        ObjectId::parse_str(&self.key)
            .map_err(|_| StoreError::Backend(format!("stored row has malformed _id '{}'", self.key)))
    }

    fn into_record(self) -> Record {
        let mut record = Record::with_capacity(self.doc.len() + 1);
        record.insert(INTERNAL_ID.to_string(), Value::String(self.key));
        record.extend(self.doc);
        record
    }
}

#[derive(Debug, Deserialize)]
struct CountRow {
    count: u64,
}

fn check_ident(kind: &str, name: &str) -> StoreResult<()> {
    if !name.is_empty() && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        Ok(())
    } else {
        Err(StoreError::Unsupported(format!("{kind} name '{name}'")))
    }
}

/// SurrealQL reference for a document path.
fn field_ref(path: &str) -> StoreResult<String> {
    if path == INTERNAL_ID {
        return Ok(INTERNAL_ID.to_string());
    }
    for segment in path.split('.') {
        check_ident("field", segment)?;
    }
    Ok(format!("doc.{path}"))
}

/// `ORDER BY` for `sort`; insertion order (`seq`, then `_id`) breaks ties.
fn order_clause(sort: &Sort) -> StoreResult<String> {
    let mut parts = Vec::new();
    for (key, order) in sort.clauses() {
        let direction = match order {
            SortOrder::Asc => "ASC",
            SortOrder::Desc => "DESC",
        };
        match key {
            SortKey::Field(path) => parts.push(format!("{} {direction}", field_ref(path)?)),
            SortKey::Natural => {
                parts.push(format!("seq {direction}"));
                parts.push(format!("{INTERNAL_ID} {direction}"));
            }
        }
    }
    if !sort.clauses().iter().any(|(k, _)| *k == SortKey::Natural) {
        parts.push("seq ASC".to_string());
        parts.push(format!("{INTERNAL_ID} ASC"));
    }
    Ok(format!(" ORDER BY {}", parts.join(", ")))
}

fn is_operator_object(value: &Value) -> bool {
    matches!(value, Value::Object(map) if map.keys().any(|k| k.starts_with('$')))
}

/// Filter document -> `WHERE` clause, collecting bound parameters.
#[derive(Debug, Default)]
struct Filter {
    params: Map<String, Value>,
}

impl Filter {
    fn param(&mut self, value: Value) -> String {
        let name = format!("p{}", self.params.len());
        self.params.insert(name.clone(), value);
        format!("${name}")
    }

    fn condition(&mut self, query: &Record) -> StoreResult<String> {
        let mut clauses = Vec::with_capacity(query.len());
        for (key, condition) in query {
            clauses.push(match key.as_str() {
                "$and" => self.combine(condition, "AND")?,
                "$or" => self.combine(condition, "OR")?,
                "$nor" => format!("!{}", self.combine(condition, "OR")?),
                TEXT_KEY => self.text(condition)?,
                EXPR_KEY => self.expr(condition)?,
                path => self.field_condition(path, condition)?,
            });
        }
        Ok(if clauses.is_empty() {
            "true".to_string()
        } else {
            clauses.join(" AND ")
        })
    }

    fn combine(&mut self, condition: &Value, joiner: &str) -> StoreResult<String> {
        let Value::Array(items) = condition else {
            return Err(StoreError::Unsupported(format!(
                "logical operator expects an array, got {condition}"
            )));
        };
        if items.is_empty() {
            return Ok(if joiner == "AND" { "true" } else { "false" }.to_string());
        }
        let parts = items
            .iter()
            .map(|item| match item {
                Value::Object(query) => self.condition(query).map(|c| format!("({c})")),
                other => Err(StoreError::Unsupported(format!("sub-query {other}"))),
            })
            .collect::<StoreResult<Vec<_>>>()?;
        Ok(format!("({})", parts.join(&format!(" {joiner} "))))
    }

    fn equality(&mut self, field: &str, value: &Value) -> String {
        if value.is_null() {
            format!("({field} = NONE OR {field} = NULL)")
        } else {
            format!("{field} = {}", self.param(value.clone()))
        }
    }

    fn field_condition(&mut self, path: &str, condition: &Value) -> StoreResult<String> {
        let field = field_ref(path)?;
        let Value::Object(ops) = condition else {
            return Ok(self.equality(&field, condition));
        };
        if !is_operator_object(condition) {
            return Ok(self.equality(&field, condition));
        }

        let mut parts = Vec::with_capacity(ops.len());
        for (op, operand) in ops {
            let part = match op.as_str() {
                "$eq" => self.equality(&field, operand),
                "$ne" => format!("!({})", self.equality(&field, operand)),
                "$gt" | "$gte" | "$lt" | "$lte" => {
                    let symbol = match op.as_str() {
                        "$gt" => ">",
                        "$gte" => ">=",
                        "$lt" => "<",
                        _ => "<=",
                    };
                    let p = self.param(operand.clone());
                    format!("({field} != NONE AND {field} {symbol} {p})")
                }
                "$in" => format!("{field} IN {}", self.param(operand.clone())),
                "$nin" => format!("{field} NOT IN {}", self.param(operand.clone())),
                "$exists" => {
                    if matches!(operand, Value::Bool(false) | Value::Null) {
                        format!("{field} = NONE")
                    } else {
                        format!("{field} != NONE")
                    }
                }
                "$size" => format!("array::len({field} ?? []) = {}", self.param(operand.clone())),
                "$regex" => self.regex(&field, operand, ops.get("$options"))?,
                "$options" => continue,
                other => {
                    return Err(StoreError::Unsupported(format!("query operator {other}")));
                }
            };
            parts.push(part);
        }
        Ok(parts.join(" AND "))
    }

    /// Only substring patterns (`.*literal.*`) translate.
    fn regex(&mut self, field: &str, pattern: &Value, options: Option<&Value>) -> StoreResult<String> {
        let literal = pattern
            .as_str()
            .and_then(|p| p.strip_prefix(".*"))
            .and_then(|p| p.strip_suffix(".*"))
            .filter(|p| !p.chars().any(|c| "\\^$.|?*+()[]{}".contains(c)));
        let Some(literal) = literal else {
            return Err(StoreError::Unsupported(format!("regex {pattern}")));
        };
        let insensitive = options
            .and_then(Value::as_str)
            .map(|o| o.contains('i'))
            .unwrap_or(false);
        Ok(if insensitive {
            let p = self.param(Value::String(literal.to_lowercase()));
            format!("(type::is::string({field}) AND string::contains(string::lowercase({field}), {p}))")
        } else {
            let p = self.param(Value::String(literal.to_string()));
            format!("(type::is::string({field}) AND string::contains({field}, {p}))")
        })
    }

    /// Any search term appears in the rendered document.
    fn text(&mut self, condition: &Value) -> StoreResult<String> {
        let Some(search) = condition.get("$search").and_then(Value::as_str) else {
            return Err(StoreError::Unsupported(format!("text predicate {condition}")));
        };
        let terms: Vec<String> = search
            .split_whitespace()
            .map(|t| {
                let p = self.param(Value::String(t.to_lowercase()));
                format!("string::contains(string::lowercase(<string> doc), {p})")
            })
            .collect();
        Ok(if terms.is_empty() {
            "false".to_string()
        } else {
            format!("({})", terms.join(" OR "))
        })
    }

    fn expr(&mut self, expr: &Value) -> StoreResult<String> {
        match expr {
            Value::String(s) if s.starts_with('$') => field_ref(&s[1..]),
            Value::Object(map) if map.len() == 1 => {
                let Some((op, args)) = map.iter().next() else {
                    return Err(StoreError::Unsupported("empty expression".to_string()));
                };
                match op.as_str() {
                    "$size" => Ok(format!("array::len({} ?? [])", self.expr(args)?)),
                    "$and" | "$or" => {
                        let joiner = if op == "$and" { " AND " } else { " OR " };
                        let parts = args
                            .as_array()
                            .ok_or_else(|| StoreError::Unsupported(format!("{op} expects an array")))?
                            .iter()
                            .map(|e| self.expr(e))
                            .collect::<StoreResult<Vec<_>>>()?;
                        Ok(format!("({})", parts.join(joiner)))
                    }
                    "$eq" | "$ne" | "$gt" | "$gte" | "$lt" | "$lte" => {
                        let [left, right] = args
                            .as_array()
                            .map(Vec::as_slice)
                            .and_then(|a| <&[Value; 2]>::try_from(a).ok())
                            .ok_or_else(|| {
                                StoreError::Unsupported(format!("{op} expects two operands"))
                            })?;
                        let symbol = match op.as_str() {
                            "$eq" => "=",
                            "$ne" => "!=",
                            "$gt" => ">",
                            "$gte" => ">=",
                            "$lt" => "<",
                            _ => "<=",
                        };
                        Ok(format!("({} {symbol} {})", self.expr(left)?, self.expr(right)?))
                    }
                    other => Err(StoreError::Unsupported(format!("expression operator {other}"))),
                }
            }
            literal => Ok(self.param(literal.clone())),
        }
    }
}

struct Inner {
    db: Surreal<Any>,
    tx_lock: Arc<tokio::sync::Mutex<()>>,
    streams: StreamCounter,
    connected: AtomicBool,
    last_seq: AtomicI64,
}

impl Inner {
    /// Wall-clock nanoseconds, strictly increasing within this process.
    fn next_seq(&self) -> i64 {
        let now = Utc::now().timestamp_nanos_opt().unwrap_or(i64::MAX - 1);
        match self
            .last_seq
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |last| Some(now.max(last + 1)))
        {
            Ok(last) | Err(last) => now.max(last + 1),
        }
    }

    fn ensure_open(&self) -> StoreResult<()> {
        if self.connected.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StoreError::Closed)
        }
    }

    async fn select_rows(
        &self,
        table: &str,
        query: &Query,
        sort: &Sort,
        limit: usize,
    ) -> StoreResult<Vec<StoredRow>> {
        self.ensure_open()?;
        check_ident("table", table)?;
        let mut filter = Filter::default();
        let condition = filter.condition(query.as_record())?;
        let order = order_clause(sort)?;
        let limit = if limit == 0 {
            String::new()
        } else {
            format!(" LIMIT {limit}")
        };
        let sql = format!("SELECT * OMIT id FROM type::table($tb) WHERE {condition}{order}{limit}");
        debug!(%sql, "select");

        let mut request = self.db.query(sql).bind(("tb", table.to_string()));
        if !filter.params.is_empty() {
            request = request.bind(filter.params);
        }
        let mut response = request.await?;
        let rows: Vec<StoredRow> = response.take(0)?;
        Ok(rows)
    }

    async fn find(&self, table: &str, query: &Query, options: &FindOptions) -> StoreResult<Vec<Record>> {
        let rows = self
            .select_rows(table, query, &options.sort, options.limit)
            .await?;
        Ok(rows
            .into_iter()
            .map(|row| options.projection.apply(row.into_record()))
            .collect())
    }

    async fn create_row(&self, table: &str, doc: Record) -> StoreResult<ObjectId> {
        self.ensure_open()?;
        check_ident("table", table)?;
        let (id, mut row) = StoredRow::from_record(doc)?;
        row.seq = self.next_seq();
        self.db
            .query("CREATE type::thing($tb, $id) CONTENT $row")
            .bind(("tb", table.to_string()))
            .bind(("id", id.to_hex()))
            .bind(("row", row))
            .await?
            .check()?;
        Ok(id)
    }

    async fn put_row(&self, table: &str, id: &ObjectId, doc: Record) -> StoreResult<()> {
        let mut doc = doc;
        doc.shift_remove(INTERNAL_ID);
        self.db
            .query("UPDATE type::thing($tb, $id) SET doc = $doc")
            .bind(("tb", table.to_string()))
            .bind(("id", id.to_hex()))
            .bind(("doc", doc))
            .await?
            .check()?;
        Ok(())
    }

    /// Apply `ops` in one SurrealDB transaction.
    ///
    /// A `Put` carrying an expected version first re-reads the stored
    /// document and throws a write conflict when it changed or disappeared,
    /// which aborts the whole batch.
    async fn run_batch(&self, ops: &[TxOp]) -> StoreResult<()> {
        self.ensure_open()?;
        if ops.is_empty() {
            return Ok(());
        }
        let mut sql = String::from("BEGIN TRANSACTION;\n");
        let mut params = Map::new();
        for (i, op) in ops.iter().enumerate() {
            let (collection, statement) = match op {
                TxOp::Insert { collection, doc } => {
                    let (id, mut row) = StoredRow::from_record(doc.clone())?;
                    row.seq = self.next_seq();
                    params.insert(format!("id{i}"), Value::String(id.to_hex()));
                    params.insert(format!("row{i}"), serde_json::to_value(row)?);
                    (collection, format!("CREATE type::thing($tb{i}, $id{i}) CONTENT $row{i};\n"))
                }
                TxOp::Put {
                    collection,
                    id,
                    doc,
                    expected,
                } => {
                    check_ident("table", collection)?;
                    let mut doc = doc.clone();
                    doc.shift_remove(INTERNAL_ID);
                    params.insert(format!("id{i}"), Value::String(id.to_hex()));
                    params.insert(format!("doc{i}"), Value::Object(doc));
                    let mut statement = String::new();
                    if let Some(expected) = expected {
                        let mut expected = expected.clone();
                        expected.shift_remove(INTERNAL_ID);
                        params.insert(format!("prev{i}"), Value::Object(expected));
                        statement.push_str(&format!(
                            "LET $cur{i} = (SELECT VALUE doc FROM ONLY type::thing($tb{i}, $id{i}));\n\
                             IF $cur{i} = NONE {{ THROW \"{WRITE_CONFLICT}{collection} document {id} was removed concurrently\" }} \
                             ELSE IF $cur{i} != $prev{i} {{ THROW \"{WRITE_CONFLICT}{collection} document {id} was changed concurrently\" }};\n"
                        ));
                    }
                    statement.push_str(&format!("UPDATE type::thing($tb{i}, $id{i}) SET doc = $doc{i};\n"));
                    (collection, statement)
                }
                TxOp::Remove { collection, id } => {
                    params.insert(format!("id{i}"), Value::String(id.to_hex()));
                    (collection, format!("DELETE type::thing($tb{i}, $id{i});\n"))
                }
            };
            check_ident("table", collection)?;
            params.insert(format!("tb{i}"), Value::String(collection.clone()));
            sql.push_str(&statement);
        }
        sql.push_str("COMMIT TRANSACTION;");

        let mut response = self.db.query(sql).bind(params).await?;
        let mut errors: Vec<(usize, String)> = response
            .take_errors()
            .into_iter()
            .map(|(i, e)| (i, e.to_string()))
            .collect();
        errors.sort_by_key(|(i, _)| *i);
        // Statements after the failing one only report the aborted transaction
        let cause = errors
            .iter()
            .find(|(_, m)| !m.contains("failed transaction"))
            .or_else(|| errors.first());
        match cause {
            Some((_, message)) => Err(classify_error(message)),
            None => Ok(()),
        }
    }
}

/// SurrealDB document store.
#[derive(Clone)]
pub struct SurrealStore {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for SurrealStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SurrealStore")
            .field("connected", &self.inner.connected.load(Ordering::SeqCst))
            .field("open_streams", &self.inner.streams.current())
            .finish()
    }
}

impl SurrealStore {
    /// Connect, sign in when credentials are configured, and select the
    /// namespace and database.
    #[instrument(skip(config), fields(url = %config.url, namespace = %config.namespace, database = %config.database))]
    pub async fn connect(config: &StoreConfig) -> StoreResult<Self> {
        info!("Connecting to SurrealDB");

        let db = surrealdb::engine::any::connect(&config.url)
            .await
            .map_err(|e| {
                StoreError::Connection(format!("Failed to connect to {}: {}", config.url, e))
            })?;

        if let Some(credentials) = &config.credentials {
            if credentials.root {
                db.signin(Root {
                    username: &credentials.username,
                    password: &credentials.password,
                })
                .await
                .map_err(|e| StoreError::Connection(format!("Root authentication failed: {}", e)))?;
            } else {
                db.signin(Database {
                    namespace: &config.namespace,
                    database: &config.database,
                    username: &credentials.username,
                    password: &credentials.password,
                })
                .await
                .map_err(|e| {
                    StoreError::Connection(format!("Database authentication failed: {}", e))
                })?;
            }
        }

        db.use_ns(&config.namespace)
            .use_db(&config.database)
            .await
            .map_err(|e| {
                StoreError::Connection(format!("Failed to select namespace/database: {}", e))
            })?;

        info!("SurrealDB connected");
        Ok(Self {
            inner: Arc::new(Inner {
                db,
                tx_lock: Arc::new(tokio::sync::Mutex::new(())),
                streams: StreamCounter::default(),
                connected: AtomicBool::new(true),
                last_seq: AtomicI64::new(0),
            }),
        })
    }

    /// Embedded in-memory SurrealDB
    pub async fn in_memory() -> StoreResult<Self> {
        Self::connect(&StoreConfig::surreal(DEFAULT_URL)).await
    }
}

#[async_trait]
impl DocumentStore for SurrealStore {
    fn backend(&self) -> &'static str {
        "surreal"
    }

    #[instrument(skip(self, index), fields(index = %index.name))]
    async fn ensure_index(&self, collection: &str, index: &IndexSpec) -> StoreResult<()> {
        self.inner.ensure_open()?;
        check_ident("table", collection)?;
        check_ident("index", &index.name)?;
        let fields = index
            .fields
            .iter()
            .map(|f| field_ref(f))
            .collect::<StoreResult<Vec<_>>>()?
            .join(", ");
        let unique = if index.unique { " UNIQUE" } else { "" };
        let sql = format!(
            "DEFINE TABLE IF NOT EXISTS {collection} SCHEMALESS;\n\
             DEFINE INDEX IF NOT EXISTS {name} ON TABLE {collection} FIELDS {fields}{unique};",
            name = index.name
        );
        self.inner.db.query(sql).await?.check()?;
        debug!("index defined");
        Ok(())
    }

    async fn insert_one(&self, collection: &str, doc: Record) -> StoreResult<ObjectId> {
        self.inner.create_row(collection, doc).await
    }

    async fn insert_many(
        &self,
        collection: &str,
        docs: Vec<Record>,
        ordered: bool,
    ) -> StoreResult<InsertManyOutcome> {
        let mut outcome = InsertManyOutcome::default();
        for doc in docs {
            match self.inner.create_row(collection, doc).await {
                Ok(id) => outcome.inserted.push(id),
                Err(e) if ordered => return Err(e),
                Err(e) => outcome.failures.push(e),
            }
        }
        Ok(outcome)
    }

    async fn find(
        &self,
        collection: &str,
        query: &Query,
        options: &FindOptions,
    ) -> StoreResult<Vec<Record>> {
        self.inner.find(collection, query, options).await
    }

    async fn count(&self, collection: &str, query: &Query) -> StoreResult<u64> {
        self.inner.ensure_open()?;
        check_ident("table", collection)?;
        let mut filter = Filter::default();
        let condition = filter.condition(query.as_record())?;
        let sql = format!("SELECT count() FROM type::table($tb) WHERE {condition} GROUP ALL");
        let mut request = self.inner.db.query(sql).bind(("tb", collection.to_string()));
        if !filter.params.is_empty() {
            request = request.bind(filter.params);
        }
        let mut response = request.await?;
        let rows: Vec<CountRow> = response.take(0)?;
        Ok(rows.first().map(|r| r.count).unwrap_or(0))
    }

    async fn update_one(
        &self,
        collection: &str,
        query: &Query,
        update: &Update,
        upsert: bool,
    ) -> StoreResult<UpdateOutcome> {
        let rows = self
            .inner
            .select_rows(collection, query, &Sort::new(), 1)
            .await?;
        let Some(row) = rows.into_iter().next() else {
            if !upsert {
                return Ok(UpdateOutcome::default());
            }
            let id = self
                .inner
                .create_row(collection, upsert_seed(query, update)?)
                .await?;
            return Ok(UpdateOutcome {
                upserted_id: Some(id),
                ..Default::default()
            });
        };

        let id = row.id()?;
        let mut doc = row.into_record();
        let modified = apply_update(&mut doc, update)?;
        if modified {
            self.inner.put_row(collection, &id, doc).await?;
        }
        Ok(UpdateOutcome {
            matched: 1,
            modified: modified as u64,
            upserted_id: None,
        })
    }

    async fn update_many(
        &self,
        collection: &str,
        query: &Query,
        update: &Update,
        upsert: bool,
    ) -> StoreResult<UpdateOutcome> {
        let rows = self
            .inner
            .select_rows(collection, query, &Sort::new(), 0)
            .await?;
        if rows.is_empty() {
            return self.update_one(collection, query, update, upsert).await;
        }

        let matched = rows.len() as u64;
        let mut ops = Vec::new();
        for row in rows {
            let id = row.id()?;
            let mut doc = row.into_record();
            if apply_update(&mut doc, update)? {
                ops.push(TxOp::Put {
                    collection: collection.to_string(),
                    id,
                    doc,
                    expected: None,
                });
            }
        }
        self.inner.run_batch(&ops).await?;
        Ok(UpdateOutcome {
            matched,
            modified: ops.len() as u64,
            upserted_id: None,
        })
    }

    async fn delete_one(&self, collection: &str, query: &Query) -> StoreResult<u64> {
        let rows = self
            .inner
            .select_rows(collection, query, &Sort::new(), 1)
            .await?;
        let Some(row) = rows.into_iter().next() else {
            return Ok(0);
        };
        self.inner
            .db
            .query("DELETE type::thing($tb, $id)")
            .bind(("tb", collection.to_string()))
            .bind(("id", row.key))
            .await?
            .check()?;
        Ok(1)
    }

    async fn delete_many(&self, collection: &str, query: &Query) -> StoreResult<u64> {
        self.inner.ensure_open()?;
        check_ident("table", collection)?;
        let mut filter = Filter::default();
        let condition = filter.condition(query.as_record())?;
        let sql = format!("DELETE type::table($tb) WHERE {condition} RETURN BEFORE");
        let mut request = self.inner.db.query(sql).bind(("tb", collection.to_string()));
        if !filter.params.is_empty() {
            request = request.bind(filter.params);
        }
        let mut response = request.await?;
        let removed: Vec<StoredRow> = response.take(0)?;
        Ok(removed.len() as u64)
    }

    async fn begin(&self) -> StoreResult<Box<dyn StoreTransaction>> {
        self.inner.ensure_open()?;
        let guard = self.inner.tx_lock.clone().lock_owned().await;
        self.inner.ensure_open()?;
        Ok(Box::new(SurrealTransaction {
            inner: self.inner.clone(),
            _guard: guard,
            ops: Vec::new(),
            pending: HashMap::new(),
            seen: HashMap::new(),
            written: HashSet::new(),
        }))
    }

    #[instrument(skip(self, pipeline))]
    async fn watch(&self, collection: &str, pipeline: &[Query]) -> StoreResult<ChangeStream> {
        self.inner.ensure_open()?;
        check_ident("table", collection)?;

        // Versions delivered by this stream, for updated-field diffs
        let mut cache: HashMap<String, Record> = HashMap::new();

        let mut response = self
            .inner
            .db
            .query(format!(
                "DEFINE TABLE IF NOT EXISTS {collection} SCHEMALESS;\nLIVE SELECT * FROM {collection};"
            ))
            .await?;
        let notifications = response.stream::<Notification<StoredRow>>(1)?;
        let guard = self.inner.streams.open();
        let name = collection.to_string();
        let pipeline = pipeline.to_vec();

        let events = notifications
            .filter_map(move |item| {
                ready(match item {
                    Ok(notification) => to_change_event(&name, &mut cache, notification).map(Ok),
                    Err(e) => Some(Err(StoreError::from(e))),
                })
            })
            .filter(move |item| {
                ready(match item {
                    Ok(event) => event.matches(&pipeline),
                    Err(_) => true,
                })
            })
            .boxed();

        debug!("live query started");
        Ok(ChangeStream::new(events, guard))
    }

    fn open_change_streams(&self) -> usize {
        self.inner.streams.current()
    }

    async fn close(&self, force: bool) -> StoreResult<()> {
        if !force {
            let _guard = self.inner.tx_lock.lock().await;
            self.inner.connected.store(false, Ordering::SeqCst);
        } else {
            self.inner.connected.store(false, Ordering::SeqCst);
        }
        info!(force, "SurrealDB store closed");
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::SeqCst)
    }
}

fn to_change_event(
    collection: &str,
    cache: &mut HashMap<String, Record>,
    notification: Notification<StoredRow>,
) -> Option<ChangeEvent> {
    let row = notification.data;
    let Ok(id) = row.id() else {
        debug!(key = %row.key, "ignoring live notification without a document id");
        return None;
    };
    let (operation, full_document, updated_fields, removed_fields) = match notification.action {
        Action::Create => {
            cache.insert(row.key.clone(), row.doc.clone());
            (OperationType::Insert, Some(row.into_record()), None, Vec::new())
        }
        Action::Update => {
            // A document first seen through an update reports every field
            let previous = cache
                .insert(row.key.clone(), row.doc.clone())
                .unwrap_or_default();
            let (updated, removed) = diff_fields(&previous, &row.doc);
            (OperationType::Update, Some(row.into_record()), Some(updated), removed)
        }
        Action::Delete => {
            cache.remove(&row.key);
            (OperationType::Delete, None, None, Vec::new())
        }
        #[allow(unreachable_patterns)]
        _ => return None,
    };
    Some(ChangeEvent {
        operation,
        collection: collection.to_string(),
        document_key: id,
        full_document,
        updated_fields,
        removed_fields,
    })
}

/// Transaction over a `SurrealStore`.
///
/// Reads see committed data overlaid with this transaction's own buffered
/// writes. Unique indexes are checked by the database at commit, and so is
/// every replaced document against the version this transaction first read.
pub struct SurrealTransaction {
    inner: Arc<Inner>,
    _guard: OwnedMutexGuard<()>,
    ops: Vec<TxOp>,
    /// collection -> id -> buffered version (`None` = removed)
    pending: HashMap<String, IndexMap<ObjectId, Option<Staged>>>,
    /// First committed version read per document
    seen: HashMap<(String, ObjectId), Record>,
    /// Documents this transaction inserted or replaced
    written: HashSet<(String, ObjectId)>,
}

/// A buffered document with its insertion stamp
#[derive(Debug, Clone)]
struct Staged {
    /// `i64::MAX` for documents inserted by the transaction itself
    seq: i64,
    doc: Record,
}

impl SurrealTransaction {
    fn stage(&mut self, collection: &str, id: ObjectId, staged: Option<Staged>) {
        self.pending
            .entry(collection.to_string())
            .or_default()
            .insert(id, staged);
    }

    fn remember(&mut self, collection: &str, id: ObjectId, doc: &Record) {
        self.seen
            .entry((collection.to_string(), id))
            .or_insert_with(|| doc.clone());
    }

    async fn current(&mut self, collection: &str, id: &ObjectId) -> StoreResult<Option<Staged>> {
        if let Some(state) = self.pending.get(collection).and_then(|p| p.get(id)) {
            return Ok(state.clone());
        }
        let rows = self
            .inner
            .select_rows(collection, &Query::eq(INTERNAL_ID, id.to_hex()), &Sort::new(), 1)
            .await?;
        let Some(row) = rows.into_iter().next() else {
            return Ok(None);
        };
        let seq = row.seq;
        let doc = row.into_record();
        self.remember(collection, *id, &doc);
        Ok(Some(Staged { seq, doc }))
    }
}

#[async_trait]
impl StoreTransaction for SurrealTransaction {
    async fn find(
        &mut self,
        collection: &str,
        query: &Query,
        options: &FindOptions,
    ) -> StoreResult<Vec<Record>> {
        let has_overlay = self
            .pending
            .get(collection)
            .is_some_and(|overlay| !overlay.is_empty());
        if !has_overlay {
            let rows = self
                .inner
                .select_rows(collection, query, &options.sort, options.limit)
                .await?;
            let mut out = Vec::with_capacity(rows.len());
            for row in rows {
                let id = row.id()?;
                let doc = row.into_record();
                self.remember(collection, id, &doc);
                out.push(options.projection.apply(doc));
            }
            return Ok(out);
        }

        let rows = self
            .inner
            .select_rows(collection, query, &Sort::new(), 0)
            .await?;
        let mut docs: IndexMap<ObjectId, Staged> = IndexMap::with_capacity(rows.len());
        for row in rows {
            let id = row.id()?;
            let seq = row.seq;
            let doc = row.into_record();
            self.remember(collection, id, &doc);
            docs.insert(id, Staged { seq, doc });
        }
        if let Some(overlay) = self.pending.get(collection) {
            for (id, state) in overlay {
                docs.shift_remove(id);
                if let Some(staged) = state {
                    if matcher::matches(&staged.doc, query) {
                        docs.insert(*id, staged.clone());
                    }
                }
            }
        }
        // Stable: equal stamps keep the order they were staged in
        docs.sort_by(|_, a, _, b| a.seq.cmp(&b.seq));

        let mut hits: Vec<(usize, &Record)> = docs.values().map(|s| &s.doc).enumerate().collect();
        sort_positioned(&mut hits, &options.sort);
        let limit = if options.limit == 0 {
            usize::MAX
        } else {
            options.limit
        };
        Ok(hits
            .into_iter()
            .take(limit)
            .map(|(_, doc)| options.projection.apply(doc.clone()))
            .collect())
    }

    async fn count(&mut self, collection: &str, query: &Query) -> StoreResult<u64> {
        let docs = self.find(collection, query, &FindOptions::new()).await?;
        Ok(docs.len() as u64)
    }

    async fn insert_one(&mut self, collection: &str, doc: Record) -> StoreResult<ObjectId> {
        self.inner.ensure_open()?;
        check_ident("table", collection)?;
        let mut doc = doc;
        let id = ensure_id(&mut doc)?;
        self.written.insert((collection.to_string(), id));
        self.stage(
            collection,
            id,
            Some(Staged {
                seq: i64::MAX,
                doc: doc.clone(),
            }),
        );
        self.ops.push(TxOp::Insert {
            collection: collection.to_string(),
            doc,
        });
        Ok(id)
    }

    async fn replace_one(
        &mut self,
        collection: &str,
        id: &ObjectId,
        doc: Record,
    ) -> StoreResult<bool> {
        let Some(current) = self.current(collection, id).await? else {
            return Ok(false);
        };
        let mut doc = doc;
        doc.insert(INTERNAL_ID.to_string(), Value::String(id.to_hex()));
        ensure_id(&mut doc)?;

        let key = (collection.to_string(), *id);
        let expected = if self.written.insert(key.clone()) {
            self.seen.get(&key).cloned()
        } else {
            None
        };
        self.stage(
            collection,
            *id,
            Some(Staged {
                seq: current.seq,
                doc: doc.clone(),
            }),
        );
        self.ops.push(TxOp::Put {
            collection: collection.to_string(),
            id: *id,
            doc,
            expected,
        });
        Ok(true)
    }

    async fn update_one(
        &mut self,
        collection: &str,
        query: &Query,
        update: &Update,
        upsert: bool,
    ) -> StoreResult<UpdateOutcome> {
        let found = self
            .find(collection, query, &FindOptions::new().limit(1))
            .await?;
        let Some(mut doc) = found.into_iter().next() else {
            if !upsert {
                return Ok(UpdateOutcome::default());
            }
            let id = self
                .insert_one(collection, upsert_seed(query, update)?)
                .await?;
            return Ok(UpdateOutcome {
                upserted_id: Some(id),
                ..Default::default()
            });
        };

        let id = crate::record::internal_id(&doc)?;
        let modified = apply_update(&mut doc, update)?;
        if modified {
            self.replace_one(collection, &id, doc).await?;
        }
        Ok(UpdateOutcome {
            matched: 1,
            modified: modified as u64,
            upserted_id: None,
        })
    }

    async fn delete_many(&mut self, collection: &str, query: &Query) -> StoreResult<u64> {
        let docs = self.find(collection, query, &FindOptions::new()).await?;
        for doc in &docs {
            let id = crate::record::internal_id(doc)?;
            self.stage(collection, id, None);
            self.ops.push(TxOp::Remove {
                collection: collection.to_string(),
                id,
            });
        }
        Ok(docs.len() as u64)
    }

    async fn commit(self: Box<Self>) -> StoreResult<()> {
        let ops = self.ops.len();
        self.inner.run_batch(&self.ops).await?;
        debug!(ops, "transaction committed");
        Ok(())
    }

    async fn abort(self: Box<Self>) -> StoreResult<()> {
        debug!(discarded = self.ops.len(), "transaction aborted");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn condition(query: Value) -> (String, Map<String, Value>) {
        let mut filter = Filter::default();
        let sql = filter
            .condition(query.as_object().unwrap())
            .unwrap();
        (sql, filter.params)
    }

    #[test]
    fn classifies_unique_index_violation() {
        let err = classify_error(
            "Database index `idx_algorithms_name` already contains 'sort', with record `algorithms:abc`",
        );
        assert_eq!(
            err,
            StoreError::DuplicateKey {
                index: "idx_algorithms_name".into(),
                key: Some("'sort'".into()),
            }
        );
    }

    #[test]
    fn classifies_other_errors_as_backend() {
        assert!(matches!(
            classify_error("Parse error: unexpected token"),
            StoreError::Backend(_)
        ));
    }

    #[test]
    fn translates_equality_and_operators() {
        let (sql, params) = condition(json!({
            "name": "algo",
            "status.status": {"$in": ["active", "pending"]},
            "result": {"$exists": false}
        }));
        assert_eq!(
            sql,
            "doc.name = $p0 AND doc.status.status IN $p1 AND doc.result = NONE"
        );
        assert_eq!(params.get("p1"), Some(&json!(["active", "pending"])));
    }

    #[test]
    fn translates_substring_regex() {
        let (sql, params) = condition(json!({"name": {"$regex": ".*Green.*", "$options": "i"}}));
        assert_eq!(
            sql,
            "(type::is::string(doc.name) AND string::contains(string::lowercase(doc.name), $p0))"
        );
        assert_eq!(params.get("p0"), Some(&json!("green")));
    }

    #[test]
    fn rejects_untranslatable_filters() {
        let mut filter = Filter::default();
        let err = filter
            .condition(json!({"name": {"$regex": "^abc"}}).as_object().unwrap())
            .unwrap_err();
        assert!(matches!(err, StoreError::Unsupported(_)));

        let err = field_ref("nodes.0.name; DROP").unwrap_err();
        assert!(matches!(err, StoreError::Unsupported(_)));
    }

    #[test]
    fn translates_array_length_expression() {
        let (sql, _) = condition(json!({
            "$expr": {"$gte": [{"$size": "$nodes"}, 2]}
        }));
        assert_eq!(sql, "(array::len(doc.nodes ?? []) >= $p0)");
    }

    #[test]
    fn empty_query_matches_everything() {
        let (sql, params) = condition(json!({}));
        assert_eq!(sql, "true");
        assert!(params.is_empty());
    }

    #[test]
    fn order_falls_back_to_insertion_stamp() {
        assert_eq!(
            order_clause(&Sort::new().desc("startTime")).unwrap(),
            " ORDER BY doc.startTime DESC, seq ASC, _id ASC"
        );
        assert_eq!(
            order_clause(&Sort::newest_first()).unwrap(),
            " ORDER BY seq DESC, _id DESC"
        );
    }

    #[test]
    fn classifies_thrown_write_conflict() {
        let err = classify_error(
            "An error occurred: write conflict: jobs document 5f1b2c3d4e5f6a7b8c9d0e1f was removed concurrently",
        );
        assert_eq!(
            err,
            StoreError::WriteConflict(
                "jobs document 5f1b2c3d4e5f6a7b8c9d0e1f was removed concurrently".into()
            )
        );
    }
}
