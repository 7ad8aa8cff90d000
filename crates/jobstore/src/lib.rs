//! Jobstore: Document Store Access Layer for Job Orchestration
//!
//! This crate persists pipelines, algorithms, jobs, tasks and related
//! entities in a document store, behind typed repositories.
//!
//! ## Layers
//!
//! - `store`: the `DocumentStore` seam with an in-process backend
//!   (`MemoryStore`) and a SurrealDB backend (`SurrealStore`)
//! - `collection`: generic `Collection<T>` with CRUD, projections,
//!   transactional patching, conflict translation and change watching
//! - `repositories`: one thin wrapper per entity
//! - `provider`: the `Database` facade owning the connection lifecycle
//!
//! ## Key Components
//!
//! - `QueryBuilder`: assembles filters from optional search parameters
//! - `ObjectId`: store-generated document id, published to callers as `id`
//! - `DbError`: the error taxonomy callers branch on via `DbError::kind`

pub mod collection;
pub mod config;
mod error;
pub mod object_id;
pub mod projection;
pub mod provider;
pub mod query;
pub mod record;
pub mod repositories;
pub mod store;
pub mod watch;

pub use collection::{
    ChangeNotice, Collection, CollectionDescriptor, CreateManyOptions, CreateOptions,
    DeleteOptions, DeleteOutcome, FetchAllOptions, FetchManyOptions, FetchManySelector,
    FetchOptions, IndexDescriptor, Session, SessionCollection, Subscription,
};
pub use config::{Backend, Credentials, StoreConfig};
pub use error::{DbError, ErrorKind, StoreError};
pub use object_id::ObjectId;
pub use projection::{Fields, Projection};
pub use provider::{Database, InitOptions, PurgeOutcome};
pub use query::{DateRange, Query, QueryBuilder, Sort, SortKey, SortOrder, Update};
pub use record::Record;
pub use store::{DocumentStore, MemoryStore, StoreTransaction, SurrealStore};
pub use watch::{WatchEvent, WatchKey, Watcher};

/// Result type for jobstore operations
pub type Result<T> = std::result::Result<T, DbError>;
