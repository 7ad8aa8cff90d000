//! Document store abstraction
//!
//! `DocumentStore` is the seam between collections and a concrete backend:
//! - `MemoryStore`: in-process engine (tests, embedded use)
//! - `SurrealStore`: SurrealDB over `mem://`, `surrealkv://` or `ws(s)://`
//!
//! Every stored document carries `_id`, a hex `ObjectId` the store assigns
//! on insert when absent. Unique-index violations surface as
//! `StoreError::DuplicateKey`; translating them is the collection's job.

use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::Stream;
use serde_json::{json, Value};

use crate::error::StoreError;
use crate::object_id::ObjectId;
use crate::projection::Projection;
use crate::query::{Query, Sort, Update};
use crate::record::Record;

pub mod matcher;
pub mod memory;
pub mod ops;
pub mod surreal;

pub use memory::MemoryStore;
pub use surreal::SurrealStore;

/// Result type for store operations
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Index declaration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexSpec {
    pub name: String,
    pub fields: Vec<String>,
    pub unique: bool,
}

impl IndexSpec {
    pub fn new(name: impl Into<String>, fields: &[&str], unique: bool) -> Self {
        Self {
            name: name.into(),
            fields: fields.iter().map(|f| f.to_string()).collect(),
            unique,
        }
    }
}

/// Options for `find`
#[derive(Debug, Clone, Default)]
pub struct FindOptions {
    pub projection: Projection,
    pub sort: Sort,
    /// 0 = unlimited
    pub limit: usize,
}

impl FindOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn projection(mut self, projection: Projection) -> Self {
        self.projection = projection;
        self
    }

    pub fn sort(mut self, sort: Sort) -> Self {
        self.sort = sort;
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }
}

/// Outcome of a bulk insert
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InsertManyOutcome {
    pub inserted: Vec<ObjectId>,
    /// Per-document failures (unordered inserts only)
    pub failures: Vec<StoreError>,
}

/// Outcome of an update
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpdateOutcome {
    pub matched: u64,
    pub modified: u64,
    pub upserted_id: Option<ObjectId>,
}

/// Kind of change reported by a change stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationType {
    Insert,
    Update,
    Delete,
}

impl OperationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationType::Insert => "insert",
            OperationType::Update => "update",
            OperationType::Delete => "delete",
        }
    }
}

/// One change-stream event
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeEvent {
    pub operation: OperationType,
    pub collection: String,
    pub document_key: ObjectId,
    /// Post-change document (absent for deletes)
    pub full_document: Option<Record>,
    /// Dot-path -> new value, for updates
    pub updated_fields: Option<Record>,
    pub removed_fields: Vec<String>,
}

impl ChangeEvent {
    /// Event as a document, the shape match stages are evaluated against.
    pub fn to_record(&self) -> Record {
        let mut out = Record::new();
        out.insert("operationType".into(), json!(self.operation.as_str()));
        out.insert("ns".into(), json!({ "coll": self.collection }));
        out.insert(
            "documentKey".into(),
            json!({ "_id": self.document_key.to_hex() }),
        );
        if let Some(doc) = &self.full_document {
            out.insert("fullDocument".into(), Value::Object(doc.clone()));
        }
        if let Some(updated) = &self.updated_fields {
            out.insert(
                "updateDescription".into(),
                json!({
                    "updatedFields": Value::Object(updated.clone()),
                    "removedFields": self.removed_fields,
                }),
            );
        }
        out
    }

    /// Whether every match stage accepts this event.
    pub fn matches(&self, pipeline: &[Query]) -> bool {
        if pipeline.is_empty() {
            return true;
        }
        let record = self.to_record();
        pipeline
            .iter()
            .all(|stage| matcher::matches(&record, stage))
    }
}

/// Counts open change streams; a stream releases its slot when dropped.
#[derive(Debug, Default, Clone)]
pub struct StreamCounter(Arc<AtomicUsize>);

impl StreamCounter {
    pub fn open(&self) -> StreamGuard {
        self.0.fetch_add(1, Ordering::SeqCst);
        StreamGuard(self.0.clone())
    }

    pub fn current(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug)]
pub struct StreamGuard(Arc<AtomicUsize>);

impl Drop for StreamGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// A live feed of change events. Dropping it closes the underlying cursor.
pub struct ChangeStream {
    events: BoxStream<'static, StoreResult<ChangeEvent>>,
    _guard: StreamGuard,
}

impl ChangeStream {
    pub fn new(events: BoxStream<'static, StoreResult<ChangeEvent>>, guard: StreamGuard) -> Self {
        Self {
            events,
            _guard: guard,
        }
    }

    /// Explicit close; equivalent to dropping.
    pub fn close(self) {}
}

impl Stream for ChangeStream {
    type Item = StoreResult<ChangeEvent>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.events.as_mut().poll_next(cx)
    }
}

impl std::fmt::Debug for ChangeStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChangeStream").finish_non_exhaustive()
    }
}

/// Backend-agnostic document store.
///
/// Guarantees:
/// - Inserts assign `_id` when absent and enforce declared unique indexes.
/// - `find` returns documents in insertion order unless sorted; sort ties
///   fall back to insertion order.
/// - Writes outside a transaction are independent: concurrent
///   read-modify-write cycles may lose updates.
/// - Transactions are serialized per store and apply atomically on commit.
///   A document a transaction read and then replaced must be unchanged at
///   commit, otherwise the commit fails with `StoreError::WriteConflict`.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Backend name for logs.
    fn backend(&self) -> &'static str;

    /// Create an index if it does not exist yet.
    async fn ensure_index(&self, collection: &str, index: &IndexSpec) -> StoreResult<()>;

    async fn insert_one(&self, collection: &str, doc: Record) -> StoreResult<ObjectId>;

    /// `ordered` stops at the first failure and returns it; otherwise each
    /// document succeeds or fails on its own.
    async fn insert_many(
        &self,
        collection: &str,
        docs: Vec<Record>,
        ordered: bool,
    ) -> StoreResult<InsertManyOutcome>;

    async fn find(
        &self,
        collection: &str,
        query: &Query,
        options: &FindOptions,
    ) -> StoreResult<Vec<Record>>;

    async fn count(&self, collection: &str, query: &Query) -> StoreResult<u64>;

    async fn update_one(
        &self,
        collection: &str,
        query: &Query,
        update: &Update,
        upsert: bool,
    ) -> StoreResult<UpdateOutcome>;

    async fn update_many(
        &self,
        collection: &str,
        query: &Query,
        update: &Update,
        upsert: bool,
    ) -> StoreResult<UpdateOutcome>;

    /// Deletes the first match in insertion order. Returns the count (0 or 1).
    async fn delete_one(&self, collection: &str, query: &Query) -> StoreResult<u64>;

    async fn delete_many(&self, collection: &str, query: &Query) -> StoreResult<u64>;

    /// Start a transaction. Waits while another transaction is open.
    async fn begin(&self) -> StoreResult<Box<dyn StoreTransaction>>;

    /// Open a change stream over `collection`, keeping events every match
    /// stage accepts (see `ChangeEvent::to_record` for the matched shape).
    async fn watch(&self, collection: &str, pipeline: &[Query]) -> StoreResult<ChangeStream>;

    /// Number of change streams currently open.
    fn open_change_streams(&self) -> usize;

    async fn close(&self, force: bool) -> StoreResult<()>;

    fn is_connected(&self) -> bool;
}

/// A unit of work with all-or-nothing visibility.
///
/// Writes are buffered and applied on `commit`; `abort` (or dropping the
/// transaction) discards them.
#[async_trait]
pub trait StoreTransaction: Send {
    async fn find(
        &mut self,
        collection: &str,
        query: &Query,
        options: &FindOptions,
    ) -> StoreResult<Vec<Record>>;

    async fn count(&mut self, collection: &str, query: &Query) -> StoreResult<u64>;

    async fn insert_one(&mut self, collection: &str, doc: Record) -> StoreResult<ObjectId>;

    /// Replace a whole document by id. Returns false when it does not exist.
    async fn replace_one(&mut self, collection: &str, id: &ObjectId, doc: Record)
        -> StoreResult<bool>;

    async fn update_one(
        &mut self,
        collection: &str,
        query: &Query,
        update: &Update,
        upsert: bool,
    ) -> StoreResult<UpdateOutcome>;

    async fn delete_many(&mut self, collection: &str, query: &Query) -> StoreResult<u64>;

    async fn commit(self: Box<Self>) -> StoreResult<()>;

    async fn abort(self: Box<Self>) -> StoreResult<()>;
}
