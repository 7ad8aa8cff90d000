//! Data sources repository
//!
//! Several versions of a data source share one name; each version is its own
//! record. Partial versions (`isPartial`) are never returned as the latest.

use std::collections::HashSet;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, instrument};

use crate::collection::{
    Collection, CollectionDescriptor, CreateOptions, DeleteOutcome, FetchAllOptions,
    FetchOptions, IndexDescriptor,
};
use crate::error::DbError;
use crate::query::{Query, Sort};
use crate::record::{Record, PUBLIC_ID};
use crate::store::DocumentStore;
use crate::Result;

pub const COLLECTION: &str = "dataSources";

/// One version of a data source. Versions of the same source share `name`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataSource {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version_description: Option<String>,
    /// Set while files of the version are still being uploaded
    #[serde(default)]
    pub is_partial: bool,
    #[serde(default)]
    pub files: Vec<Value>,
    #[serde(flatten)]
    pub extra: Record,
}

impl DataSource {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: None,
            name: name.into(),
            version_description: None,
            is_partial: false,
            files: Vec::new(),
            extra: Record::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DataSources {
    collection: Collection<DataSource>,
}

impl DataSources {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self {
            collection: Collection::new(
                store,
                CollectionDescriptor::new(COLLECTION, "dataSource")
                    .with_index(IndexDescriptor::non_unique("name")),
            ),
        }
    }

    pub fn collection(&self) -> &Collection<DataSource> {
        &self.collection
    }

    pub async fn init(&self) -> Result<()> {
        self.collection.init().await
    }

    /// Create the first version of a new data source.
    ///
    /// The name check and the insert run in one transaction, so two
    /// concurrent creates of the same name cannot both succeed.
    #[instrument(skip(self, source), fields(name = %source.name))]
    pub async fn create(&self, source: &DataSource) -> Result<DataSource> {
        self.collection
            .transaction(|session| async move {
                let scoped = self.collection.in_session(&session);
                if scoped.count(&Query::eq("name", source.name.as_str())).await? > 0 {
                    return Err(DbError::conflict(self.collection.entity_name(), "name"));
                }
                scoped.create(source, CreateOptions { apply_id: true }).await
            })
            .await
    }

    /// Add a version to an existing data source.
    #[instrument(skip(self, source), fields(name = %source.name))]
    pub async fn create_version(&self, source: &DataSource) -> Result<DataSource> {
        let created = self
            .collection
            .transaction(|session| async move {
                let scoped = self.collection.in_session(&session);
                if scoped.count(&Query::eq("name", source.name.as_str())).await? == 0 {
                    return Err(DbError::not_found(self.collection.entity_name(), &source.name));
                }
                scoped.create(source, CreateOptions { apply_id: true }).await
            })
            .await?;
        debug!(id = ?created.id, "version created");
        Ok(created)
    }

    pub async fn fetch(&self, id: &str) -> Result<DataSource> {
        self.collection
            .fetch(&Query::eq(PUBLIC_ID, id), FetchOptions::default())
            .await
    }

    /// Newest complete version of `name`.
    pub async fn fetch_latest(&self, name: &str) -> Result<DataSource> {
        let mut filter = Query::eq("name", name).into_record();
        filter.insert("isPartial".to_string(), json!({ "$ne": true }));
        self.collection
            .fetch(&Query::from(filter), FetchOptions::default())
            .await
    }

    /// Newest complete version of every data source, newest first.
    pub async fn list(&self) -> Result<Vec<DataSource>> {
        let versions = self
            .collection
            .fetch_all(FetchAllOptions {
                query: Query::eq("isPartial", json!({ "$ne": true })),
                sort: Sort::newest_first(),
                ..Default::default()
            })
            .await?;
        let mut seen = HashSet::new();
        Ok(versions
            .into_iter()
            .filter(|version| seen.insert(version.name.clone()))
            .collect())
    }

    /// Delete every version of `name`.
    pub async fn delete(&self, name: &str) -> Result<DeleteOutcome> {
        self.collection
            .delete_many(&Query::eq("name", name), false)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::store::MemoryStore;

    async fn repo() -> DataSources {
        let repo = DataSources::new(Arc::new(MemoryStore::new()));
        repo.init().await.unwrap();
        repo
    }

    fn version(name: &str, description: &str, partial: bool) -> DataSource {
        DataSource {
            version_description: Some(description.to_string()),
            is_partial: partial,
            ..DataSource::new(name)
        }
    }

    #[tokio::test]
    async fn create_rejects_existing_name() {
        let repo = repo().await;
        let first = repo.create(&DataSource::new("ds1")).await.unwrap();
        assert!(first.id.is_some());

        let err = repo.create(&DataSource::new("ds1")).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Conflict);
        assert_eq!(err.to_string(), "could not create dataSource, name already exists");
    }

    #[tokio::test]
    async fn versions_resolve_to_latest_complete() {
        let repo = repo().await;
        repo.create(&version("images", "v1", false)).await.unwrap();
        repo.create_version(&version("images", "v2", false)).await.unwrap();
        repo.create_version(&version("images", "v3", true)).await.unwrap();
        repo.create(&version("labels", "v1", false)).await.unwrap();

        let latest = repo.fetch_latest("images").await.unwrap();
        assert_eq!(latest.version_description.as_deref(), Some("v2"));

        let listed: Vec<_> = repo
            .list()
            .await
            .unwrap()
            .into_iter()
            .map(|ds| (ds.name, ds.version_description.unwrap_or_default()))
            .collect();
        assert_eq!(
            listed,
            vec![
                ("labels".to_string(), "v1".to_string()),
                ("images".to_string(), "v2".to_string()),
            ]
        );

        assert_eq!(repo.delete("images").await.unwrap().deleted, 3);
        assert_eq!(
            repo.fetch_latest("images").await.unwrap_err().to_string(),
            "dataSource images Not Found"
        );
    }

    #[tokio::test]
    async fn create_version_requires_existing_source() {
        let repo = repo().await;
        let err = repo
            .create_version(&version("ghost", "v2", false))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }
}
