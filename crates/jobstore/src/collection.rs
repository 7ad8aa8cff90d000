//! Generic entity collection
//!
//! `Collection<T>` wraps one store collection for an entity type and owns the
//! rules every repository shares:
//! - duplicate-key violations become `DbError::Conflict(entity, field)`
//! - caller-supplied ids are validated before reaching the store
//! - `_id` never leaves this layer; results carry it as `id`
//! - `patch` runs fetch-merge-write inside a transaction
//!
//! Non-transactional updates (`update_one`, `update_many`) are not serialized
//! against `patch` or each other, so two of them racing on one document are
//! last-write-wins. A plain update landing inside a patch is kept and the
//! patch fails with a write conflict instead. Use `patch` when the write
//! depends on the current value.

use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

use futures::StreamExt;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, instrument, warn};

use crate::error::{DbError, StoreError};
use crate::object_id::ObjectId;
use crate::projection::{Fields, Projection};
use crate::query::{Query, Sort, Update};
use crate::record::{
    deep_merge, display_value, from_record, internal_id, publish_id, to_record, Record,
    INTERNAL_ID, PUBLIC_ID,
};
use crate::store::{
    DocumentStore, FindOptions, IndexSpec, OperationType, StoreTransaction, UpdateOutcome,
};
use crate::Result;

/// Index declared for a collection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexDescriptor {
    pub fields: Vec<String>,
    pub unique: bool,
}

impl IndexDescriptor {
    pub fn unique(field: impl Into<String>) -> Self {
        Self {
            fields: vec![field.into()],
            unique: true,
        }
    }

    pub fn non_unique(field: impl Into<String>) -> Self {
        Self {
            fields: vec![field.into()],
            unique: false,
        }
    }

    pub fn compound(fields: &[&str], unique: bool) -> Self {
        Self {
            fields: fields.iter().map(|f| f.to_string()).collect(),
            unique,
        }
    }

    /// Name reported in conflicts
    pub fn field_name(&self) -> String {
        self.fields.join(", ")
    }

    fn store_name(&self, collection: &str) -> String {
        let fields = self.fields.join("_").replace('.', "_");
        format!("idx_{collection}_{fields}")
    }

    fn spec(&self, collection: &str) -> IndexSpec {
        IndexSpec {
            name: self.store_name(collection),
            fields: self.fields.clone(),
            unique: self.unique,
        }
    }
}

/// Static description of a collection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectionDescriptor {
    /// Store collection name
    pub name: String,
    /// Entity name used in error messages
    pub entity_name: String,
    pub indexes: Vec<IndexDescriptor>,
}

impl CollectionDescriptor {
    pub fn new(name: impl Into<String>, entity_name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            entity_name: entity_name.into(),
            indexes: Vec::new(),
        }
    }

    pub fn with_index(mut self, index: IndexDescriptor) -> Self {
        self.indexes.push(index);
        self
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct CreateOptions {
    /// Return the created entity with its assigned `id`
    pub apply_id: bool,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct CreateManyOptions {
    /// Stop at the first failure and report it
    pub ordered: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct DeleteOptions {
    /// Treat a selector `id` as the internal id
    pub by_internal_id: bool,
    pub allow_not_found: bool,
}

impl Default for DeleteOptions {
    fn default() -> Self {
        Self {
            by_internal_id: true,
            allow_not_found: false,
        }
    }
}

impl DeleteOptions {
    pub fn allow_not_found() -> Self {
        Self {
            allow_not_found: true,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchOptions {
    pub fields: Option<Fields>,
    /// Treat a query `id` as the internal id
    pub by_internal_id: bool,
    pub exclude_id: bool,
}

impl Default for FetchOptions {
    fn default() -> Self {
        Self {
            fields: None,
            by_internal_id: true,
            exclude_id: false,
        }
    }
}

impl FetchOptions {
    pub fn fields(fields: Fields) -> Self {
        Self {
            fields: Some(fields),
            ..Self::default()
        }
    }

    pub fn exclude_id(mut self) -> Self {
        self.exclude_id = true;
        self
    }
}

/// Selector for `fetch_many`: exactly one list must be non-empty.
#[derive(Debug, Clone, Default)]
pub struct FetchManySelector {
    pub names: Vec<String>,
    pub ids: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct FetchManyOptions {
    pub fields: Option<Fields>,
    pub exclude_id: bool,
}

#[derive(Debug, Clone, Default)]
pub struct FetchAllOptions {
    pub query: Query,
    pub fields: Option<Fields>,
    pub exclude_id: bool,
    pub sort: Sort,
    /// 0 = unlimited
    pub limit: usize,
}

impl FetchAllOptions {
    pub fn query(query: Query) -> Self {
        Self {
            query,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeleteOutcome {
    pub deleted: u64,
}

/// An open store transaction shared by the steps of one unit of work.
///
/// Obtained from `Collection::transaction`; the session is committed or
/// aborted when the work returns and cannot be used afterwards.
#[derive(Clone)]
pub struct Session {
    tx: Arc<Mutex<Option<Box<dyn StoreTransaction>>>>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session").finish_non_exhaustive()
    }
}

impl Session {
    fn new(tx: Box<dyn StoreTransaction>) -> Self {
        Self {
            tx: Arc::new(Mutex::new(Some(tx))),
        }
    }

    async fn release(&self) -> Option<Box<dyn StoreTransaction>> {
        self.tx.lock().await.take()
    }
}

/// A change delivered to a `watch` callback
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeNotice {
    pub operation: OperationType,
    /// Post-change document, id published as `id`
    pub document: Record,
    /// Changed dot-paths and their new values (updates only)
    pub updated_fields: Option<Record>,
    pub removed_fields: Vec<String>,
}

/// A running change-stream consumer. Dropping it stops delivery.
#[derive(Debug)]
pub struct Subscription {
    task: Option<JoinHandle<()>>,
}

impl Subscription {
    /// Stop delivery and wait until the underlying stream is closed.
    pub async fn close(mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
            let _ = task.await;
        }
    }

    pub fn is_active(&self) -> bool {
        self.task.as_ref().is_some_and(|t| !t.is_finished())
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

/// Typed access to one store collection.
pub struct Collection<T = Record> {
    store: Arc<dyn DocumentStore>,
    descriptor: Arc<CollectionDescriptor>,
    _entity: PhantomData<fn() -> T>,
}

impl<T> Clone for Collection<T> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            descriptor: self.descriptor.clone(),
            _entity: PhantomData,
        }
    }
}

impl<T> std::fmt::Debug for Collection<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Collection")
            .field("name", &self.descriptor.name)
            .field("backend", &self.store.backend())
            .finish()
    }
}

impl<T> Collection<T>
where
    T: Serialize + DeserializeOwned + Send + Sync,
{
    pub fn new(store: Arc<dyn DocumentStore>, descriptor: CollectionDescriptor) -> Self {
        Self {
            store,
            descriptor: Arc::new(descriptor),
            _entity: PhantomData,
        }
    }

    pub fn name(&self) -> &str {
        &self.descriptor.name
    }

    pub fn entity_name(&self) -> &str {
        &self.descriptor.entity_name
    }

    pub fn store(&self) -> &Arc<dyn DocumentStore> {
        &self.store
    }

    /// Ensure every declared index exists. Safe to call repeatedly.
    #[instrument(skip(self), fields(collection = %self.descriptor.name))]
    pub async fn init(&self) -> Result<()> {
        for index in &self.descriptor.indexes {
            self.store
                .ensure_index(&self.descriptor.name, &index.spec(&self.descriptor.name))
                .await
                .map_err(|e| self.translate(e))?;
        }
        debug!(indexes = self.descriptor.indexes.len(), "collection initialized");
        Ok(())
    }

    /// Insert one entity.
    ///
    /// An `id` carried by the entity is used as the internal id.
    #[instrument(skip(self, entity), fields(collection = %self.descriptor.name))]
    pub async fn create(&self, entity: &T, options: CreateOptions) -> Result<T> {
        let (doc, mut output) = self.prepare_insert(entity)?;
        let id = self
            .store
            .insert_one(&self.descriptor.name, doc)
            .await
            .map_err(|e| self.translate(e))?;
        debug!(%id, "created");
        if options.apply_id {
            output.insert(PUBLIC_ID.to_string(), Value::String(id.to_hex()));
        }
        from_record(output)
    }

    /// Insert many entities; returns how many were inserted.
    #[instrument(skip(self, entities), fields(collection = %self.descriptor.name, count = entities.len()))]
    pub async fn create_many(&self, entities: &[T], options: CreateManyOptions) -> Result<usize> {
        let docs = entities
            .iter()
            .map(|e| self.prepare_insert(e).map(|(doc, _)| doc))
            .collect::<Result<Vec<_>>>()?;
        let outcome = self
            .store
            .insert_many(&self.descriptor.name, docs, options.ordered)
            .await
            .map_err(|e| self.translate(e))?;
        for failure in &outcome.failures {
            warn!(error = %failure, "document skipped by bulk insert");
        }
        Ok(outcome.inserted.len())
    }

    /// Delete the first document matching `selector`.
    #[instrument(skip(self), fields(collection = %self.descriptor.name))]
    pub async fn delete(
        &self,
        selector: &Query,
        options: DeleteOptions,
    ) -> Result<Option<DeleteOutcome>> {
        let resolved = self.resolve(selector, options.by_internal_id)?;
        let deleted = self
            .store
            .delete_one(&self.descriptor.name, &resolved)
            .await?;
        if deleted == 0 {
            return if options.allow_not_found {
                Ok(None)
            } else {
                Err(self.not_found(selector))
            };
        }
        Ok(Some(DeleteOutcome { deleted }))
    }

    /// Delete every document matching `selector`.
    #[instrument(skip(self), fields(collection = %self.descriptor.name))]
    pub async fn delete_many(&self, selector: &Query, allow_not_found: bool) -> Result<DeleteOutcome> {
        let resolved = self.resolve(selector, true)?;
        let deleted = self
            .store
            .delete_many(&self.descriptor.name, &resolved)
            .await?;
        if deleted == 0 && !allow_not_found {
            return Err(self.not_found(selector));
        }
        Ok(DeleteOutcome { deleted })
    }

    /// Most recently inserted document matching `query`.
    pub async fn fetch(&self, query: &Query, options: FetchOptions) -> Result<T> {
        from_record(self.fetch_record(query, options).await?)
    }

    /// `fetch` without decoding, for partial projections.
    #[instrument(skip(self, options), fields(collection = %self.descriptor.name))]
    pub async fn fetch_record(&self, query: &Query, options: FetchOptions) -> Result<Record> {
        let projection = Projection::new(options.fields.as_ref(), options.exclude_id)?;
        let resolved = self.resolve(query, options.by_internal_id)?;
        let found = self
            .store
            .find(
                &self.descriptor.name,
                &resolved,
                &FindOptions::new()
                    .projection(projection)
                    .sort(Sort::newest_first())
                    .limit(1),
            )
            .await?;
        found
            .into_iter()
            .next()
            .map(publish_id)
            .ok_or_else(|| self.not_found(query))
    }

    /// Documents whose `name` or `id` is in the given list.
    #[instrument(skip(self, options), fields(collection = %self.descriptor.name))]
    pub async fn fetch_many(
        &self,
        selector: &FetchManySelector,
        options: FetchManyOptions,
    ) -> Result<Vec<T>> {
        let query = match (selector.names.is_empty(), selector.ids.is_empty()) {
            (true, true) => return Err(DbError::MissingParam("names | ids".to_string())),
            (false, false) => {
                return Err(DbError::InvalidParams(
                    "provide either names or ids, not both".to_string(),
                ))
            }
            (false, true) => Query::eq("name", json!({ "$in": selector.names })),
            (true, false) => {
                let ids = selector
                    .ids
                    .iter()
                    .map(|id| ObjectId::parse_str(id).map(|oid| oid.to_hex()))
                    .collect::<Result<Vec<_>>>()?;
                Query::eq(INTERNAL_ID, json!({ "$in": ids }))
            }
        };
        self.fetch_all(FetchAllOptions {
            query,
            fields: options.fields,
            exclude_id: options.exclude_id,
            ..Default::default()
        })
        .await
    }

    /// Every matching document, materialized.
    pub async fn fetch_all(&self, options: FetchAllOptions) -> Result<Vec<T>> {
        self.fetch_all_records(options)
            .await?
            .into_iter()
            .map(from_record)
            .collect()
    }

    #[instrument(skip(self, options), fields(collection = %self.descriptor.name, limit = options.limit))]
    pub async fn fetch_all_records(&self, options: FetchAllOptions) -> Result<Vec<Record>> {
        let projection = Projection::new(options.fields.as_ref(), options.exclude_id)?;
        let resolved = self.resolve(&options.query, true)?;
        let found = self
            .store
            .find(
                &self.descriptor.name,
                &resolved,
                &FindOptions::new()
                    .projection(projection)
                    .sort(options.sort)
                    .limit(options.limit),
            )
            .await?;
        debug!(found = found.len(), "fetched");
        Ok(found.into_iter().map(publish_id).collect())
    }

    pub async fn count(&self, query: &Query) -> Result<u64> {
        let resolved = self.resolve(query, true)?;
        Ok(self.store.count(&self.descriptor.name, &resolved).await?)
    }

    /// Direct update of the first match. Not serialized against `patch`.
    #[instrument(skip(self, update), fields(collection = %self.descriptor.name))]
    pub async fn update_one(&self, filter: &Query, update: &Update, upsert: bool) -> Result<UpdateOutcome> {
        let resolved = self.resolve(filter, true)?;
        self.store
            .update_one(&self.descriptor.name, &resolved, update, upsert)
            .await
            .map_err(|e| self.translate(e))
    }

    /// Direct update of every match. Not serialized against `patch`.
    #[instrument(skip(self, update), fields(collection = %self.descriptor.name))]
    pub async fn update_many(&self, filter: &Query, update: &Update, upsert: bool) -> Result<UpdateOutcome> {
        let resolved = self.resolve(filter, true)?;
        self.store
            .update_many(&self.descriptor.name, &resolved, update, upsert)
            .await
            .map_err(|e| self.translate(e))
    }

    /// Deep-merge `data` into the current document, atomically.
    pub async fn patch(&self, query: &Query, data: Record) -> Result<T> {
        self.patch_with(query, move |mut current| async move {
            deep_merge(&mut current, data);
            Ok(current)
        })
        .await
    }

    /// Replace the current document with `on_fetch(current)`, atomically
    /// with respect to other transactions on this store.
    ///
    /// `on_fetch` receives the document with its id published as `id`.
    #[instrument(skip(self, on_fetch), fields(collection = %self.descriptor.name))]
    pub async fn patch_with<F, Fut>(&self, query: &Query, on_fetch: F) -> Result<T>
    where
        F: FnOnce(Record) -> Fut + Send,
        Fut: Future<Output = Result<Record>> + Send,
    {
        let resolved = self.resolve(query, true)?;
        let patched = self
            .transaction(|session| async move {
                let scoped = self.in_session(&session);
                let current = scoped
                    .find_one(&resolved)
                    .await?
                    .ok_or_else(|| self.not_found(query))?;
                let id = internal_id(&current)?;

                let mut next = on_fetch(publish_id(current)).await?;
                next.shift_remove(PUBLIC_ID);
                if !scoped.replace(&id, next.clone()).await? {
                    return Err(DbError::Internal(format!(
                        "{} {id} vanished during patch",
                        self.descriptor.entity_name
                    )));
                }
                next.insert(PUBLIC_ID.to_string(), Value::String(id.to_hex()));
                Ok(next)
            })
            .await?;
        from_record(patched)
    }

    /// Run `work` inside a store transaction.
    ///
    /// Commits when `work` returns `Ok`, aborts when it returns `Err`; the
    /// session is released on every path, including cancellation.
    pub async fn transaction<F, Fut, R>(&self, work: F) -> Result<R>
    where
        F: FnOnce(Session) -> Fut + Send,
        Fut: Future<Output = Result<R>> + Send,
        R: Send,
    {
        let session = Session::new(self.store.begin().await?);
        let outcome = work(session.clone()).await;
        let tx = session.release().await;

        match (outcome, tx) {
            (Ok(value), Some(tx)) => {
                tx.commit().await.map_err(|e| self.translate(e))?;
                Ok(value)
            }
            (Ok(_), None) => Err(DbError::Internal(
                "transaction session released before commit".to_string(),
            )),
            (Err(err), Some(tx)) => {
                if let Err(abort_err) = tx.abort().await {
                    warn!(error = %abort_err, "transaction abort failed");
                }
                Err(err)
            }
            (Err(err), None) => Err(err),
        }
    }

    /// Operations on this collection through an open session.
    pub fn in_session<'a>(&'a self, session: &'a Session) -> SessionCollection<'a, T> {
        SessionCollection {
            collection: self,
            session,
        }
    }

    /// Deliver insert and update events accepted by `pipeline` to
    /// `on_change` until the subscription is closed or dropped.
    #[instrument(skip(self, pipeline, on_change), fields(collection = %self.descriptor.name))]
    pub async fn watch<F>(&self, pipeline: Vec<Query>, on_change: F) -> Result<Subscription>
    where
        F: Fn(ChangeNotice) + Send + Sync + 'static,
    {
        let mut stages = vec![Query::eq(
            "operationType",
            json!({ "$in": [OperationType::Insert.as_str(), OperationType::Update.as_str()] }),
        )];
        stages.extend(pipeline);

        let mut stream = self.store.watch(&self.descriptor.name, &stages).await?;
        let collection = self.descriptor.name.clone();
        let task = tokio::spawn(async move {
            while let Some(item) = stream.next().await {
                match item {
                    Ok(event) => {
                        let Some(document) = event.full_document else {
                            continue;
                        };
                        on_change(ChangeNotice {
                            operation: event.operation,
                            document: publish_id(document),
                            updated_fields: event.updated_fields,
                            removed_fields: event.removed_fields,
                        });
                    }
                    Err(e) => {
                        warn!(%collection, error = %e, "change stream failed");
                        break;
                    }
                }
            }
            debug!(%collection, "change stream ended");
        });
        Ok(Subscription { task: Some(task) })
    }

    fn prepare_insert(&self, entity: &T) -> Result<(Record, Record)> {
        let mut output = to_record(entity)?;
        let mut doc = output.clone();
        match doc.shift_remove(PUBLIC_ID) {
            None | Some(Value::Null) => {}
            Some(Value::String(id)) => {
                let id = ObjectId::parse_str(&id)?;
                doc.insert(INTERNAL_ID.to_string(), Value::String(id.to_hex()));
            }
            Some(other) => return Err(DbError::InvalidId(display_value(&other))),
        }
        output.shift_remove(INTERNAL_ID);
        Ok((doc, output))
    }

    /// Map a public `id` (or `_id`) selector onto the validated internal id.
    fn resolve(&self, query: &Query, by_internal_id: bool) -> Result<Query> {
        if !by_internal_id
            || !(query.get(PUBLIC_ID).is_some() || query.get(INTERNAL_ID).is_some())
        {
            return Ok(query.clone());
        }
        let mut out = Record::new();
        for (key, value) in query.as_record() {
            if key == PUBLIC_ID || key == INTERNAL_ID {
                out.insert(INTERNAL_ID.to_string(), Self::validate_id(value)?);
            } else {
                out.insert(key.clone(), value.clone());
            }
        }
        Ok(Query::from(out))
    }

    fn validate_id(value: &Value) -> Result<Value> {
        match value {
            Value::String(id) => Ok(Value::String(ObjectId::parse_str(id)?.to_hex())),
            Value::Object(ops) if ops.contains_key("$in") => {
                let ids = ops
                    .get("$in")
                    .and_then(Value::as_array)
                    .map(|ids| ids.iter().map(Self::validate_id).collect::<Result<Vec<_>>>())
                    .transpose()?
                    .unwrap_or_default();
                Ok(json!({ "$in": ids }))
            }
            other => Err(DbError::InvalidId(display_value(other))),
        }
    }

    fn not_found(&self, selector: &Query) -> DbError {
        let key = selector
            .first_value()
            .map(display_value)
            .unwrap_or_default();
        DbError::not_found(&self.descriptor.entity_name, key)
    }

    /// Duplicate keys become conflicts; every other store error passes through.
    fn translate(&self, err: StoreError) -> DbError {
        match err {
            StoreError::DuplicateKey { index, key } => {
                let field = self
                    .descriptor
                    .indexes
                    .iter()
                    .find(|i| i.store_name(&self.descriptor.name) == index)
                    .map(IndexDescriptor::field_name)
                    .unwrap_or_else(|| {
                        if index == "_id_" {
                            PUBLIC_ID.to_string()
                        } else {
                            index.clone()
                        }
                    });
                debug!(%index, key = ?key, "duplicate key");
                DbError::conflict(&self.descriptor.entity_name, field)
            }
            other => DbError::Store(other),
        }
    }
}

/// A collection bound to an open `Session`.
pub struct SessionCollection<'a, T> {
    collection: &'a Collection<T>,
    session: &'a Session,
}

impl<'a, T> SessionCollection<'a, T>
where
    T: Serialize + DeserializeOwned + Send + Sync,
{
    async fn with_tx<R, F>(&self, op: F) -> Result<R>
    where
        F: for<'t> FnOnce(
                &'t mut Box<dyn StoreTransaction>,
            ) -> futures::future::BoxFuture<'t, std::result::Result<R, StoreError>>
            + Send,
    {
        let mut guard = self.session.tx.lock().await;
        let tx = guard
            .as_mut()
            .ok_or_else(|| DbError::Internal("transaction session already released".to_string()))?;
        op(tx).await.map_err(|e| self.collection.translate(e))
    }

    /// Newest matching raw document, `_id` included.
    async fn find_one(&self, resolved: &Query) -> Result<Option<Record>> {
        let name = self.collection.descriptor.name.clone();
        let query = resolved.clone();
        let found = self
            .with_tx(move |tx| {
                Box::pin(async move {
                    tx.find(
                        &name,
                        &query,
                        &FindOptions::new().sort(Sort::newest_first()).limit(1),
                    )
                    .await
                })
            })
            .await?;
        Ok(found.into_iter().next())
    }

    async fn replace(&self, id: &ObjectId, doc: Record) -> Result<bool> {
        let name = self.collection.descriptor.name.clone();
        let id = *id;
        self.with_tx(move |tx| Box::pin(async move { tx.replace_one(&name, &id, doc).await }))
            .await
    }

    pub async fn fetch(&self, query: &Query, options: FetchOptions) -> Result<T> {
        from_record(self.fetch_record(query, options).await?)
    }

    pub async fn fetch_record(&self, query: &Query, options: FetchOptions) -> Result<Record> {
        let projection = Projection::new(options.fields.as_ref(), options.exclude_id)?;
        let resolved = self.collection.resolve(query, options.by_internal_id)?;
        let name = self.collection.descriptor.name.clone();
        let found = self
            .with_tx(move |tx| {
                Box::pin(async move {
                    tx.find(
                        &name,
                        &resolved,
                        &FindOptions::new()
                            .projection(projection)
                            .sort(Sort::newest_first())
                            .limit(1),
                    )
                    .await
                })
            })
            .await?;
        found
            .into_iter()
            .next()
            .map(publish_id)
            .ok_or_else(|| self.collection.not_found(query))
    }

    pub async fn count(&self, query: &Query) -> Result<u64> {
        let resolved = self.collection.resolve(query, true)?;
        let name = self.collection.descriptor.name.clone();
        self.with_tx(move |tx| Box::pin(async move { tx.count(&name, &resolved).await }))
            .await
    }

    pub async fn create(&self, entity: &T, options: CreateOptions) -> Result<T> {
        let (doc, mut output) = self.collection.prepare_insert(entity)?;
        let name = self.collection.descriptor.name.clone();
        let id = self
            .with_tx(move |tx| Box::pin(async move { tx.insert_one(&name, doc).await }))
            .await?;
        if options.apply_id {
            output.insert(PUBLIC_ID.to_string(), Value::String(id.to_hex()));
        }
        from_record(output)
    }

    pub async fn update_one(&self, filter: &Query, update: &Update, upsert: bool) -> Result<UpdateOutcome> {
        let resolved = self.collection.resolve(filter, true)?;
        let name = self.collection.descriptor.name.clone();
        let update = update.clone();
        self.with_tx(move |tx| {
            Box::pin(async move { tx.update_one(&name, &resolved, &update, upsert).await })
        })
        .await
    }

    pub async fn delete_many(&self, selector: &Query) -> Result<DeleteOutcome> {
        let resolved = self.collection.resolve(selector, true)?;
        let name = self.collection.descriptor.name.clone();
        let deleted = self
            .with_tx(move |tx| Box::pin(async move { tx.delete_many(&name, &resolved).await }))
            .await?;
        Ok(DeleteOutcome { deleted })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::store::MemoryStore;
    use serde::Deserialize;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Algo {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<String>,
        name: String,
        cpu: u32,
    }

    fn algo(name: &str, cpu: u32) -> Algo {
        Algo {
            id: None,
            name: name.to_string(),
            cpu,
        }
    }

    async fn algorithms() -> Collection<Algo> {
        let collection = Collection::new(
            Arc::new(MemoryStore::new()),
            CollectionDescriptor::new("algorithms", "algorithm")
                .with_index(IndexDescriptor::unique("name")),
        );
        collection.init().await.unwrap();
        collection
    }

    #[tokio::test]
    async fn create_applies_id_only_on_request() {
        let algorithms = algorithms().await;
        let plain = algorithms.create(&algo("a", 1), CreateOptions::default()).await.unwrap();
        assert_eq!(plain.id, None);

        let with_id = algorithms
            .create(&algo("b", 1), CreateOptions { apply_id: true })
            .await
            .unwrap();
        let id = with_id.id.clone().unwrap();
        assert!(ObjectId::is_valid(&id));

        let fetched = algorithms
            .fetch(&Query::eq("id", id), FetchOptions::default())
            .await
            .unwrap();
        assert_eq!(fetched, with_id);
    }

    #[tokio::test]
    async fn duplicate_create_is_a_conflict_on_the_index_field() {
        let algorithms = algorithms().await;
        algorithms.create(&algo("a", 1), CreateOptions::default()).await.unwrap();
        let err = algorithms
            .create(&algo("a", 2), CreateOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Conflict);
        assert_eq!(err.to_string(), "could not create algorithm, name already exists");
    }

    #[tokio::test]
    async fn init_twice_is_harmless() {
        let algorithms = algorithms().await;
        algorithms.init().await.unwrap();
    }

    #[tokio::test]
    async fn failed_transaction_leaves_no_writes() {
        let algorithms = algorithms().await;
        let err = algorithms
            .transaction(|session| {
                let algorithms = algorithms.clone();
                async move {
                    algorithms
                        .in_session(&session)
                        .create(&algo("ghost", 1), CreateOptions::default())
                        .await?;
                    Err::<(), _>(DbError::InvalidParams("abandon".to_string()))
                }
            })
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidParams);
        assert_eq!(algorithms.count(&Query::all()).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn patch_deep_merges_data() {
        let algorithms = algorithms().await;
        algorithms.create(&algo("a", 1), CreateOptions::default()).await.unwrap();
        let patched = algorithms
            .patch(
                &Query::eq("name", "a"),
                json!({"cpu": 4}).as_object().cloned().unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(patched.cpu, 4);
        assert!(patched.id.is_some());
    }

    #[tokio::test]
    async fn patch_of_missing_document_is_not_found() {
        let algorithms = algorithms().await;
        let err = algorithms
            .patch(&Query::eq("name", "nope"), Record::new())
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "algorithm nope Not Found");
    }
}
