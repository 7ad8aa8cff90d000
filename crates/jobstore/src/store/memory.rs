//! In-process document store
//!
//! Collections are insertion-ordered maps guarded by one `RwLock`.
//! Transactions hold a store-wide async lock, work on lazily cloned
//! collections, and replay their op log against live data on commit, so a
//! commit either applies completely or not at all. Change events go out on
//! a broadcast channel after each write or commit.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::ready;
use futures::StreamExt;
use indexmap::IndexMap;
use parking_lot::{Mutex, RwLock};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, info, warn};

use super::matcher;
use super::ops::{
    apply_update, diff_fields, ensure_id, index_key, render_key, sort_positioned, upsert_seed,
    TxOp,
};
use super::{
    ChangeEvent, ChangeStream, DocumentStore, FindOptions, IndexSpec, InsertManyOutcome,
    OperationType, StoreResult, StoreTransaction, StreamCounter, UpdateOutcome,
};
use crate::error::StoreError;
use crate::object_id::ObjectId;
use crate::query::{Query, Update};
use crate::record::Record;

const EVENT_BUFFER: usize = 1024;
const ID_INDEX: &str = "_id_";

#[derive(Debug, Clone, Default)]
struct CollectionData {
    docs: IndexMap<ObjectId, Record>,
    indexes: Vec<IndexSpec>,
}

impl CollectionData {
    fn check_unique(&self, doc: &Record, skip: Option<&ObjectId>) -> StoreResult<()> {
        for index in self.indexes.iter().filter(|i| i.unique) {
            let key = index_key(doc, index);
            let clash = self
                .docs
                .iter()
                .filter(|(id, _)| Some(*id) != skip)
                .any(|(_, other)| index_key(other, index) == key);
            if clash {
                return Err(StoreError::DuplicateKey {
                    index: index.name.clone(),
                    key: Some(render_key(&key)),
                });
            }
        }
        Ok(())
    }

    fn insert(&mut self, mut doc: Record) -> StoreResult<(ObjectId, Record)> {
        let id = ensure_id(&mut doc)?;
        if self.docs.contains_key(&id) {
            return Err(StoreError::DuplicateKey {
                index: ID_INDEX.to_string(),
                key: Some(id.to_hex()),
            });
        }
        self.check_unique(&doc, None)?;
        self.docs.insert(id, doc.clone());
        Ok((id, doc))
    }

    /// Replace an existing document, returning the previous version.
    fn put(&mut self, id: &ObjectId, mut doc: Record) -> StoreResult<Option<(Record, Record)>> {
        if !self.docs.contains_key(id) {
            return Ok(None);
        }
        doc.insert("_id".to_string(), serde_json::Value::String(id.to_hex()));
        ensure_id(&mut doc)?;
        self.check_unique(&doc, Some(id))?;
        let old = self.docs.insert(*id, doc.clone());
        Ok(old.map(|old| (old, doc)))
    }

    fn remove(&mut self, id: &ObjectId) -> Option<Record> {
        self.docs.shift_remove(id)
    }

    fn matching_ids(&self, query: &Query) -> Vec<ObjectId> {
        self.docs
            .iter()
            .filter(|(_, doc)| matcher::matches(doc, query))
            .map(|(id, _)| *id)
            .collect()
    }

    fn select(&self, query: &Query, options: &FindOptions) -> Vec<Record> {
        let mut hits: Vec<(usize, &Record)> = self
            .docs
            .values()
            .enumerate()
            .filter(|(_, doc)| matcher::matches(doc, query))
            .collect();

        sort_positioned(&mut hits, &options.sort);

        let limit = if options.limit == 0 {
            usize::MAX
        } else {
            options.limit
        };
        hits.into_iter()
            .take(limit)
            .map(|(_, doc)| options.projection.apply(doc.clone()))
            .collect()
    }

    /// Update the first match, or seed a new document on upsert.
    fn update_one(
        &mut self,
        collection: &str,
        query: &Query,
        update: &Update,
        upsert: bool,
    ) -> StoreResult<(UpdateOutcome, Vec<ChangeEvent>)> {
        let Some(id) = self.matching_ids(query).into_iter().next() else {
            return self.upsert(collection, query, update, upsert);
        };
        let mut doc = self.docs[&id].clone();
        let modified = apply_update(&mut doc, update)?;
        let mut events = Vec::new();
        if modified {
            if let Some((old, new)) = self.put(&id, doc)? {
                events.push(update_event(collection, id, &old, new));
            }
        }
        Ok((
            UpdateOutcome {
                matched: 1,
                modified: modified as u64,
                upserted_id: None,
            },
            events,
        ))
    }

    fn update_many(
        &mut self,
        collection: &str,
        query: &Query,
        update: &Update,
        upsert: bool,
    ) -> StoreResult<(UpdateOutcome, Vec<ChangeEvent>)> {
        let ids = self.matching_ids(query);
        if ids.is_empty() {
            return self.upsert(collection, query, update, upsert);
        }
        let mut outcome = UpdateOutcome {
            matched: ids.len() as u64,
            ..Default::default()
        };
        let mut events = Vec::new();
        for id in ids {
            let mut doc = self.docs[&id].clone();
            if apply_update(&mut doc, update)? {
                if let Some((old, new)) = self.put(&id, doc)? {
                    outcome.modified += 1;
                    events.push(update_event(collection, id, &old, new));
                }
            }
        }
        Ok((outcome, events))
    }

    fn upsert(
        &mut self,
        collection: &str,
        query: &Query,
        update: &Update,
        upsert: bool,
    ) -> StoreResult<(UpdateOutcome, Vec<ChangeEvent>)> {
        if !upsert {
            return Ok((UpdateOutcome::default(), Vec::new()));
        }
        let (id, doc) = self.insert(upsert_seed(query, update)?)?;
        Ok((
            UpdateOutcome {
                matched: 0,
                modified: 0,
                upserted_id: Some(id),
            },
            vec![insert_event(collection, id, doc)],
        ))
    }
}

fn insert_event(collection: &str, id: ObjectId, doc: Record) -> ChangeEvent {
    ChangeEvent {
        operation: OperationType::Insert,
        collection: collection.to_string(),
        document_key: id,
        full_document: Some(doc),
        updated_fields: None,
        removed_fields: Vec::new(),
    }
}

fn update_event(collection: &str, id: ObjectId, old: &Record, new: Record) -> ChangeEvent {
    let (updated, removed) = diff_fields(old, &new);
    ChangeEvent {
        operation: OperationType::Update,
        collection: collection.to_string(),
        document_key: id,
        full_document: Some(new),
        updated_fields: Some(updated),
        removed_fields: removed,
    }
}

fn delete_event(collection: &str, id: ObjectId) -> ChangeEvent {
    ChangeEvent {
        operation: OperationType::Delete,
        collection: collection.to_string(),
        document_key: id,
        full_document: None,
        updated_fields: None,
        removed_fields: Vec::new(),
    }
}

struct Inner {
    collections: RwLock<HashMap<String, CollectionData>>,
    tx_lock: Arc<tokio::sync::Mutex<()>>,
    events: Mutex<Option<broadcast::Sender<ChangeEvent>>>,
    streams: StreamCounter,
    connected: AtomicBool,
}

impl Inner {
    fn ensure_open(&self) -> StoreResult<()> {
        if self.connected.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StoreError::Closed)
        }
    }

    fn publish(&self, events: Vec<ChangeEvent>) {
        if events.is_empty() {
            return;
        }
        if let Some(sender) = self.events.lock().as_ref() {
            for event in events {
                // No receivers is not an error
                let _ = sender.send(event);
            }
        }
    }

    /// Run `f` against one live collection under the write lock.
    fn write<R>(
        &self,
        collection: &str,
        f: impl FnOnce(&mut CollectionData) -> StoreResult<(R, Vec<ChangeEvent>)>,
    ) -> StoreResult<R> {
        self.ensure_open()?;
        let (result, events) = {
            let mut collections = self.collections.write();
            f(collections.entry(collection.to_string()).or_default())?
        };
        self.publish(events);
        Ok(result)
    }

    fn read<R>(&self, collection: &str, f: impl FnOnce(&CollectionData) -> R) -> StoreResult<R> {
        self.ensure_open()?;
        let collections = self.collections.read();
        Ok(match collections.get(collection) {
            Some(data) => f(data),
            None => f(&CollectionData::default()),
        })
    }
}

/// In-memory document store.
#[derive(Clone)]
pub struct MemoryStore {
    inner: Arc<Inner>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryStore")
            .field("collections", &self.inner.collections.read().len())
            .field("open_streams", &self.inner.streams.current())
            .finish()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(EVENT_BUFFER);
        info!("Memory document store created");
        Self {
            inner: Arc::new(Inner {
                collections: RwLock::new(HashMap::new()),
                tx_lock: Arc::new(tokio::sync::Mutex::new(())),
                events: Mutex::new(Some(sender)),
                streams: StreamCounter::default(),
                connected: AtomicBool::new(true),
            }),
        }
    }

    /// Indexes declared on a collection.
    pub fn indexes(&self, collection: &str) -> Vec<IndexSpec> {
        self.inner
            .collections
            .read()
            .get(collection)
            .map(|c| c.indexes.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    fn backend(&self) -> &'static str {
        "memory"
    }

    async fn ensure_index(&self, collection: &str, index: &IndexSpec) -> StoreResult<()> {
        self.inner.write(collection, |data| {
            if data.indexes.iter().any(|i| i.name == index.name) {
                return Ok(((), Vec::new()));
            }
            if index.unique {
                let mut seen = Vec::new();
                for doc in data.docs.values() {
                    let key = index_key(doc, index);
                    if seen.contains(&key) {
                        return Err(StoreError::DuplicateKey {
                            index: index.name.clone(),
                            key: Some(render_key(&key)),
                        });
                    }
                    seen.push(key);
                }
            }
            debug!(collection, index = %index.name, "index created");
            data.indexes.push(index.clone());
            Ok(((), Vec::new()))
        })
    }

    async fn insert_one(&self, collection: &str, doc: Record) -> StoreResult<ObjectId> {
        self.inner.write(collection, |data| {
            let (id, doc) = data.insert(doc)?;
            Ok((id, vec![insert_event(collection, id, doc)]))
        })
    }

    async fn insert_many(
        &self,
        collection: &str,
        docs: Vec<Record>,
        ordered: bool,
    ) -> StoreResult<InsertManyOutcome> {
        self.inner.write(collection, |data| {
            let mut outcome = InsertManyOutcome::default();
            let mut events = Vec::new();
            for doc in docs {
                match data.insert(doc) {
                    Ok((id, doc)) => {
                        outcome.inserted.push(id);
                        events.push(insert_event(collection, id, doc));
                    }
                    Err(e) if ordered => {
                        // Earlier documents stay inserted, as with an ordered bulk write
                        let published = events.clone();
                        self.inner.publish(published);
                        return Err(e);
                    }
                    Err(e) => outcome.failures.push(e),
                }
            }
            Ok((outcome, events))
        })
    }

    async fn find(
        &self,
        collection: &str,
        query: &Query,
        options: &FindOptions,
    ) -> StoreResult<Vec<Record>> {
        self.inner
            .read(collection, |data| data.select(query, options))
    }

    async fn count(&self, collection: &str, query: &Query) -> StoreResult<u64> {
        self.inner
            .read(collection, |data| data.matching_ids(query).len() as u64)
    }

    async fn update_one(
        &self,
        collection: &str,
        query: &Query,
        update: &Update,
        upsert: bool,
    ) -> StoreResult<UpdateOutcome> {
        self.inner.write(collection, |data| {
            data.update_one(collection, query, update, upsert)
        })
    }

    async fn update_many(
        &self,
        collection: &str,
        query: &Query,
        update: &Update,
        upsert: bool,
    ) -> StoreResult<UpdateOutcome> {
        self.inner.write(collection, |data| {
            // Work on a copy so a unique violation midway leaves nothing applied
            let mut staged = data.clone();
            let result = staged.update_many(collection, query, update, upsert)?;
            *data = staged;
            Ok(result)
        })
    }

    async fn delete_one(&self, collection: &str, query: &Query) -> StoreResult<u64> {
        self.inner.write(collection, |data| {
            match data.matching_ids(query).into_iter().next() {
                Some(id) => {
                    data.remove(&id);
                    Ok((1, vec![delete_event(collection, id)]))
                }
                None => Ok((0, Vec::new())),
            }
        })
    }

    async fn delete_many(&self, collection: &str, query: &Query) -> StoreResult<u64> {
        self.inner.write(collection, |data| {
            let ids = data.matching_ids(query);
            let events = ids
                .iter()
                .filter_map(|id| data.remove(id).map(|_| delete_event(collection, *id)))
                .collect::<Vec<_>>();
            Ok((events.len() as u64, events))
        })
    }

    async fn begin(&self) -> StoreResult<Box<dyn StoreTransaction>> {
        self.inner.ensure_open()?;
        let guard = self.inner.tx_lock.clone().lock_owned().await;
        self.inner.ensure_open()?;
        Ok(Box::new(MemoryTransaction {
            inner: self.inner.clone(),
            _guard: guard,
            working: HashMap::new(),
            written: HashSet::new(),
            ops: Vec::new(),
        }))
    }

    async fn watch(&self, collection: &str, pipeline: &[Query]) -> StoreResult<ChangeStream> {
        self.inner.ensure_open()?;
        let receiver = match self.inner.events.lock().as_ref() {
            Some(sender) => sender.subscribe(),
            None => return Err(StoreError::Closed),
        };
        let guard = self.inner.streams.open();
        let collection = collection.to_string();
        let pipeline = pipeline.to_vec();

        let events = futures::stream::unfold(receiver, |mut receiver| async move {
            loop {
                match receiver.recv().await {
                    Ok(event) => return Some((event, receiver)),
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "change stream lagged, events dropped");
                    }
                    Err(RecvError::Closed) => return None,
                }
            }
        })
        .filter(move |event| ready(event.collection == collection && event.matches(&pipeline)))
        .map(Ok)
        .boxed();

        Ok(ChangeStream::new(events, guard))
    }

    fn open_change_streams(&self) -> usize {
        self.inner.streams.current()
    }

    async fn close(&self, force: bool) -> StoreResult<()> {
        if !force {
            // Let an in-flight transaction finish
            let _guard = self.inner.tx_lock.lock().await;
            self.inner.connected.store(false, Ordering::SeqCst);
        } else {
            self.inner.connected.store(false, Ordering::SeqCst);
        }
        self.inner.events.lock().take();
        info!(force, "Memory document store closed");
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::SeqCst)
    }
}

/// Transaction over a `MemoryStore`.
pub struct MemoryTransaction {
    inner: Arc<Inner>,
    _guard: OwnedMutexGuard<()>,
    working: HashMap<String, CollectionData>,
    /// Documents this transaction inserted or replaced
    written: HashSet<(String, ObjectId)>,
    ops: Vec<TxOp>,
}

impl MemoryTransaction {
    fn view(&mut self, collection: &str) -> &mut CollectionData {
        if !self.working.contains_key(collection) {
            let snapshot = self
                .inner
                .collections
                .read()
                .get(collection)
                .cloned()
                .unwrap_or_default();
            self.working.insert(collection.to_string(), snapshot);
        }
        self.working
            .entry(collection.to_string())
            .or_default()
    }

    /// Version a replace must still find at commit: the snapshot version,
    /// unless this transaction already wrote the document.
    fn expectation(&mut self, collection: &str, id: ObjectId, previous: Record) -> Option<Record> {
        self.written
            .insert((collection.to_string(), id))
            .then_some(previous)
    }
}

#[async_trait]
impl StoreTransaction for MemoryTransaction {
    async fn find(
        &mut self,
        collection: &str,
        query: &Query,
        options: &FindOptions,
    ) -> StoreResult<Vec<Record>> {
        self.inner.ensure_open()?;
        Ok(self.view(collection).select(query, options))
    }

    async fn count(&mut self, collection: &str, query: &Query) -> StoreResult<u64> {
        self.inner.ensure_open()?;
        Ok(self.view(collection).matching_ids(query).len() as u64)
    }

    async fn insert_one(&mut self, collection: &str, doc: Record) -> StoreResult<ObjectId> {
        self.inner.ensure_open()?;
        let (id, doc) = self.view(collection).insert(doc)?;
        self.written.insert((collection.to_string(), id));
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
        self.inner.ensure_open()?;
        match self.view(collection).put(id, doc)? {
            Some((old, new)) => {
                let expected = self.expectation(collection, *id, old);
                self.ops.push(TxOp::Put {
                    collection: collection.to_string(),
                    id: *id,
                    doc: new,
                    expected,
                });
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn update_one(
        &mut self,
        collection: &str,
        query: &Query,
        update: &Update,
        upsert: bool,
    ) -> StoreResult<UpdateOutcome> {
        self.inner.ensure_open()?;
        let view = self.view(collection);
        let previous = view
            .matching_ids(query)
            .first()
            .and_then(|id| view.docs.get(id).cloned());
        let (outcome, events) = view.update_one(collection, query, update, upsert)?;
        for event in events {
            let Some(doc) = event.full_document else {
                continue;
            };
            let op = match (event.operation, previous.clone()) {
                (OperationType::Update, Some(previous)) => TxOp::Put {
                    collection: collection.to_string(),
                    id: event.document_key,
                    doc,
                    expected: self.expectation(collection, event.document_key, previous),
                },
                _ => {
                    self.written
                        .insert((collection.to_string(), event.document_key));
                    TxOp::Insert {
                        collection: collection.to_string(),
                        doc,
                    }
                }
            };
            self.ops.push(op);
        }
        Ok(outcome)
    }

    async fn delete_many(&mut self, collection: &str, query: &Query) -> StoreResult<u64> {
        self.inner.ensure_open()?;
        let view = self.view(collection);
        let ids = view.matching_ids(query);
        for id in &ids {
            view.remove(id);
        }
        self.ops.extend(ids.iter().map(|id| TxOp::Remove {
            collection: collection.to_string(),
            id: *id,
        }));
        Ok(ids.len() as u64)
    }

    async fn commit(self: Box<Self>) -> StoreResult<()> {
        self.inner.ensure_open()?;
        let MemoryTransaction { inner, ops, .. } = *self;
        if ops.is_empty() {
            return Ok(());
        }

        let events = {
            let mut live = inner.collections.write();
            let mut staged: HashMap<String, CollectionData> = HashMap::new();
            let mut events = Vec::with_capacity(ops.len());

            for op in ops {
                let name = match &op {
                    TxOp::Insert { collection, .. }
                    | TxOp::Put { collection, .. }
                    | TxOp::Remove { collection, .. } => collection.clone(),
                };
                let data = staged
                    .entry(name.clone())
                    .or_insert_with(|| live.get(&name).cloned().unwrap_or_default());
                match op {
                    TxOp::Insert { doc, .. } => {
                        let (id, doc) = data.insert(doc)?;
                        events.push(insert_event(&name, id, doc));
                    }
                    TxOp::Put {
                        id, doc, expected, ..
                    } => {
                        if let Some(expected) = expected {
                            match data.docs.get(&id) {
                                Some(current) if *current == expected => {}
                                Some(_) => {
                                    return Err(StoreError::WriteConflict(format!(
                                        "{name} document {id} was changed concurrently"
                                    )))
                                }
                                None => {
                                    return Err(StoreError::WriteConflict(format!(
                                        "{name} document {id} was removed concurrently"
                                    )))
                                }
                            }
                        }
                        match data.put(&id, doc)? {
                            Some((old, new)) => events.push(update_event(&name, id, &old, new)),
                            None => {
                                return Err(StoreError::WriteConflict(format!(
                                    "{name} document {id} was removed concurrently"
                                )))
                            }
                        }
                    }
                    TxOp::Remove { id, .. } => {
                        if data.remove(&id).is_some() {
                            events.push(delete_event(&name, id));
                        }
                    }
                }
            }

            live.extend(staged);
            events
        };

        debug!(events = events.len(), "transaction committed");
        inner.publish(events);
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
    use serde_json::{json, Value};

    fn rec(v: Value) -> Record {
        v.as_object().cloned().unwrap()
    }

    async fn store_with_unique_name() -> MemoryStore {
        let store = MemoryStore::new();
        store
            .ensure_index("algorithms", &IndexSpec::new("idx_name", &["name"], true))
            .await
            .unwrap();
        store
    }

    #[tokio::test]
    async fn unique_index_rejects_duplicates() {
        let store = store_with_unique_name().await;
        store.insert_one("algorithms", rec(json!({"name": "a"}))).await.unwrap();
        let err = store
            .insert_one("algorithms", rec(json!({"name": "a"})))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::DuplicateKey { ref index, .. } if index == "idx_name"));
        assert_eq!(store.count("algorithms", &Query::all()).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn ensure_index_is_idempotent() {
        let store = store_with_unique_name().await;
        store
            .ensure_index("algorithms", &IndexSpec::new("idx_name", &["name"], true))
            .await
            .unwrap();
        assert_eq!(store.indexes("algorithms").len(), 1);
    }

    #[tokio::test]
    async fn unordered_insert_many_continues_past_failures() {
        let store = store_with_unique_name().await;
        let docs = vec![
            rec(json!({"name": "a"})),
            rec(json!({"name": "a"})),
            rec(json!({"name": "b"})),
        ];
        let outcome = store.insert_many("algorithms", docs.clone(), false).await.unwrap();
        assert_eq!(outcome.inserted.len(), 2);
        assert_eq!(outcome.failures.len(), 1);

        let err = store.insert_many("algorithms", docs, true).await.unwrap_err();
        assert!(matches!(err, StoreError::DuplicateKey { .. }));
    }

    #[tokio::test]
    async fn upsert_creates_then_updates() {
        let store = MemoryStore::new();
        let query = Query::eq("name", "algo");
        let first = store
            .update_one("algorithms", &query, &Update::set_field("cpu", 1), true)
            .await
            .unwrap();
        assert!(first.upserted_id.is_some());

        let second = store
            .update_one("algorithms", &query, &Update::set_field("cpu", 2), true)
            .await
            .unwrap();
        assert_eq!((second.matched, second.modified), (1, 1));

        let docs = store.find("algorithms", &query, &FindOptions::new()).await.unwrap();
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0].get("cpu"), Some(&json!(2)));
    }

    #[tokio::test]
    async fn aborted_transaction_leaves_no_trace() {
        let store = MemoryStore::new();
        let mut tx = store.begin().await.unwrap();
        tx.insert_one("jobs", rec(json!({"jobId": "j1"}))).await.unwrap();
        assert_eq!(tx.count("jobs", &Query::all()).await.unwrap(), 1);
        tx.abort().await.unwrap();

        assert_eq!(store.count("jobs", &Query::all()).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn commit_is_all_or_nothing() {
        let store = store_with_unique_name().await;
        store.insert_one("algorithms", rec(json!({"name": "taken"}))).await.unwrap();

        let mut tx = store.begin().await.unwrap();
        tx.insert_one("other", rec(json!({"x": 1}))).await.unwrap();
        tx.insert_one("algorithms", rec(json!({"name": "fresh"}))).await.unwrap();
        // A concurrent writer claims the name before commit
        store.insert_one("algorithms", rec(json!({"name": "fresh"}))).await.unwrap();

        let err = tx.commit().await.unwrap_err();
        assert!(matches!(err, StoreError::DuplicateKey { .. }));
        assert_eq!(store.count("other", &Query::all()).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn replace_of_concurrently_changed_document_fails_commit() {
        let store = MemoryStore::new();
        let id = store.insert_one("jobs", rec(json!({"jobId": "j1", "v": 1}))).await.unwrap();

        let mut tx = store.begin().await.unwrap();
        let doc = tx.find("jobs", &Query::all(), &FindOptions::new()).await.unwrap().remove(0);
        let mut next = doc.clone();
        next.insert("v".into(), json!(2));
        assert!(tx.replace_one("jobs", &id, next.clone()).await.unwrap());
        // A second replace of the same document stays guarded by the first read
        assert!(tx.replace_one("jobs", &id, next).await.unwrap());

        store
            .update_one("jobs", &Query::all(), &Update::set_field("other", true), false)
            .await
            .unwrap();

        let err = tx.commit().await.unwrap_err();
        assert!(matches!(err, StoreError::WriteConflict(ref msg) if msg.contains("changed")));
        let docs = store.find("jobs", &Query::all(), &FindOptions::new()).await.unwrap();
        assert_eq!(docs[0].get("v"), Some(&json!(1)));
        assert_eq!(docs[0].get("other"), Some(&json!(true)));
    }

    #[tokio::test]
    async fn update_of_concurrently_removed_document_fails_commit() {
        let store = MemoryStore::new();
        store.insert_one("jobs", rec(json!({"jobId": "j1"}))).await.unwrap();

        let mut tx = store.begin().await.unwrap();
        tx.update_one("jobs", &Query::eq("jobId", "j1"), &Update::set_field("v", 2), false)
            .await
            .unwrap();
        store.delete_many("jobs", &Query::all()).await.unwrap();

        let err = tx.commit().await.unwrap_err();
        assert!(matches!(err, StoreError::WriteConflict(ref msg) if msg.contains("removed")));
        assert_eq!(store.count("jobs", &Query::all()).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn change_stream_reports_updated_fields() {
        let store = MemoryStore::new();
        let id = store
            .insert_one("jobs", rec(json!({"jobId": "j1", "status": {"status": "pending"}})))
            .await
            .unwrap();

        let mut stream = store.watch("jobs", &[]).await.unwrap();
        assert_eq!(store.open_change_streams(), 1);

        store
            .update_one(
                "jobs",
                &Query::eq("jobId", "j1"),
                &Update::set_field("status.status", "active"),
                false,
            )
            .await
            .unwrap();

        let event = stream.next().await.unwrap().unwrap();
        assert_eq!(event.operation, OperationType::Update);
        assert_eq!(event.document_key, id);
        assert_eq!(
            event.updated_fields,
            Some(rec(json!({"status.status": "active"})))
        );

        drop(stream);
        assert_eq!(store.open_change_streams(), 0);
    }

    #[tokio::test]
    async fn closed_store_rejects_operations() {
        let store = MemoryStore::new();
        store.close(false).await.unwrap();
        assert!(!store.is_connected());
        let err = store.count("jobs", &Query::all()).await.unwrap_err();
        assert_eq!(err, StoreError::Closed);
    }
}
