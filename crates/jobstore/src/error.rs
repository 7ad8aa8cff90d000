//! Error types for jobstore
//!
//! Two layers:
//! - `StoreError`: what a backend reports (connection, duplicate key, ...)
//! - `DbError`: the taxonomy callers branch on, produced at the collection boundary

use thiserror::Error;

/// Errors reported by a `DocumentStore` backend
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StoreError {
    /// Backend connection error
    #[error("Database connection failed: {0}")]
    Connection(String),

    /// Invalid or incomplete configuration
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// A unique index rejected a write
    #[error("Duplicate key on index {index}{}", .key.as_deref().map(|k| format!(": {k}")).unwrap_or_default())]
    DuplicateKey { index: String, key: Option<String> },

    /// A transaction could not be applied because its view went stale
    #[error("Write conflict: {0}")]
    WriteConflict(String),

    /// The backend cannot express the requested filter or operation
    #[error("Unsupported by backend: {0}")]
    Unsupported(String),

    /// Any other backend failure
    #[error("Database query failed: {0}")]
    Backend(String),

    /// Document (de)serialization failure inside the backend
    #[error("Serialization failed: {0}")]
    Serialization(String),

    /// The store was closed
    #[error("Store is closed")]
    Closed,
}

impl From<surrealdb::Error> for StoreError {
    fn from(err: surrealdb::Error) -> Self {
        crate::store::surreal::classify_error(&err.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Serialization(err.to_string())
    }
}

/// Coarse classification of a `DbError`, for callers that branch on kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    NotFound,
    Conflict,
    InvalidId,
    MissingParam,
    InvalidParams,
    Internal,
    Store,
}

/// Errors surfaced by collections and repositories
#[derive(Error, Debug)]
pub enum DbError {
    /// A selector matched zero documents
    #[error("{entity} {key} Not Found")]
    NotFound { entity: String, key: String },

    /// An insert or upsert violated a unique index
    #[error("could not create {entity}, {index} already exists")]
    Conflict { entity: String, index: String },

    /// A caller-supplied internal id is malformed
    #[error("id {0} is not a valid object id")]
    InvalidId(String),

    /// A multi-selector operation received no usable selector
    #[error("missing required parameter: {0}")]
    MissingParam(String),

    /// An incoherent combination of optional parameters
    #[error("invalid parameters: {0}")]
    InvalidParams(String),

    /// A supposedly-safe operation failed unexpectedly
    #[error("internal error: {0}")]
    Internal(String),

    /// Unrecognized backend failure, passed through unchanged
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Record (de)serialization failure
    #[error("Serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl DbError {
    pub fn not_found(entity: impl Into<String>, key: impl Into<String>) -> Self {
        DbError::NotFound {
            entity: entity.into(),
            key: key.into(),
        }
    }

    pub fn conflict(entity: impl Into<String>, index: impl Into<String>) -> Self {
        DbError::Conflict {
            entity: entity.into(),
            index: index.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            DbError::NotFound { .. } => ErrorKind::NotFound,
            DbError::Conflict { .. } => ErrorKind::Conflict,
            DbError::InvalidId(_) => ErrorKind::InvalidId,
            DbError::MissingParam(_) => ErrorKind::MissingParam,
            DbError::InvalidParams(_) => ErrorKind::InvalidParams,
            DbError::Internal(_) => ErrorKind::Internal,
            DbError::Store(_) | DbError::Serialization(_) => ErrorKind::Store,
        }
    }
}
