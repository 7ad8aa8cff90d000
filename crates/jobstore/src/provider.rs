//! Database - Connection Facade
//!
//! Owns the store connection and hands it to every repository:
//! - init: connect the configured backend, optionally provision indexes
//! - close: stop watch subscriptions, then close the store
//! - purge_job: delete a job with its tasks and trigger tree in one transaction

use std::sync::Arc;

use tracing::{info, instrument};

use crate::collection::{Collection, CollectionDescriptor};
use crate::config::{Backend, StoreConfig};
use crate::error::DbError;
use crate::query::Query;
use crate::record::Record;
use crate::repositories::{Algorithms, DataSources, Jobs, Pipelines, Tasks, TriggersTree};
use crate::store::{DocumentStore, MemoryStore, SurrealStore};
use crate::Result;

/// Options for `Database::init`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InitOptions {
    /// Provision every repository's indexes after connecting
    pub create_indices: bool,
}

impl Default for InitOptions {
    fn default() -> Self {
        Self {
            create_indices: true,
        }
    }
}

/// What `purge_job` removed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PurgeOutcome {
    pub jobs: u64,
    pub tasks: u64,
    pub trigger_trees: u64,
}

/// A connected store and the repositories bound to it.
#[derive(Clone)]
pub struct Database {
    store: Arc<dyn DocumentStore>,
    algorithms: Algorithms,
    pipelines: Pipelines,
    jobs: Arc<Jobs>,
    tasks: Tasks,
    data_sources: DataSources,
    triggers_tree: TriggersTree,
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("backend", &self.store.backend())
            .field("connected", &self.store.is_connected())
            .finish_non_exhaustive()
    }
}

impl Database {
    /// Connect the backend named by `config`.
    #[instrument(skip(config), fields(backend = %config.backend, url = %config.url))]
    pub async fn init(config: &StoreConfig, options: InitOptions) -> Result<Self> {
        let store: Arc<dyn DocumentStore> = match config.backend {
            Backend::Memory => Arc::new(MemoryStore::new()),
            Backend::Surreal => Arc::new(SurrealStore::connect(config).await?),
        };
        let db = Self::from_store(store);
        if options.create_indices {
            db.create_indices().await?;
        }
        info!("database ready");
        Ok(db)
    }

    /// Fresh in-process database with indexes provisioned.
    pub async fn in_memory() -> Result<Self> {
        Self::init(&StoreConfig::memory(), InitOptions::default()).await
    }

    /// Bind repositories to an already open store. Indexes are not touched.
    pub fn from_store(store: Arc<dyn DocumentStore>) -> Self {
        Self {
            algorithms: Algorithms::new(store.clone()),
            pipelines: Pipelines::new(store.clone()),
            jobs: Arc::new(Jobs::new(store.clone())),
            tasks: Tasks::new(store.clone()),
            data_sources: DataSources::new(store.clone()),
            triggers_tree: TriggersTree::new(store.clone()),
            store,
        }
    }

    /// Provision the indexes of every repository. Idempotent.
    #[instrument(skip(self), fields(backend = self.store.backend()))]
    pub async fn create_indices(&self) -> Result<()> {
        self.algorithms.init().await?;
        self.pipelines.init().await?;
        self.jobs.init().await?;
        self.tasks.init().await?;
        self.data_sources.init().await?;
        self.triggers_tree.init().await?;
        info!("indexes provisioned");
        Ok(())
    }

    /// Stop every watch subscription, then close the store.
    ///
    /// `force` skips waiting for an in-flight transaction.
    #[instrument(skip(self), fields(backend = self.store.backend()))]
    pub async fn close(&self, force: bool) -> Result<()> {
        let stopped = self.jobs.unwatch_all().await;
        self.store.close(force).await?;
        info!(stopped, "database closed");
        Ok(())
    }

    pub fn is_connected(&self) -> bool {
        self.store.is_connected()
    }

    /// Untyped access to any collection, for admin tooling.
    pub fn collection(&self, name: &str) -> Collection<Record> {
        Collection::new(self.store.clone(), CollectionDescriptor::new(name, name))
    }

    pub fn store(&self) -> &Arc<dyn DocumentStore> {
        &self.store
    }

    pub fn algorithms(&self) -> &Algorithms {
        &self.algorithms
    }

    pub fn pipelines(&self) -> &Pipelines {
        &self.pipelines
    }

    pub fn jobs(&self) -> &Jobs {
        &self.jobs
    }

    pub fn tasks(&self) -> &Tasks {
        &self.tasks
    }

    pub fn data_sources(&self) -> &DataSources {
        &self.data_sources
    }

    pub fn triggers_tree(&self) -> &TriggersTree {
        &self.triggers_tree
    }

    /// Delete a job, its tasks and its trigger tree atomically.
    #[instrument(skip(self))]
    pub async fn purge_job(&self, job_id: &str) -> Result<PurgeOutcome> {
        let by_job = Query::eq("jobId", job_id);
        let jobs = self.jobs.collection();
        let outcome = jobs
            .transaction(|session| async move {
                let removed = jobs.in_session(&session).delete_many(&by_job).await?;
                if removed.deleted == 0 {
                    return Err(DbError::not_found(jobs.entity_name(), job_id));
                }
                let tasks = self
                    .tasks
                    .collection()
                    .in_session(&session)
                    .delete_many(&by_job)
                    .await?;
                let trees = self
                    .triggers_tree
                    .collection()
                    .in_session(&session)
                    .delete_many(&by_job)
                    .await?;
                Ok(PurgeOutcome {
                    jobs: removed.deleted,
                    tasks: tasks.deleted,
                    trigger_trees: trees.deleted,
                })
            })
            .await?;
        info!(tasks = outcome.tasks, "job purged");
        Ok(outcome)
    }
}
