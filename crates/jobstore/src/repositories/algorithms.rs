//! Algorithms repository

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::instrument;

use crate::collection::{
    Collection, CollectionDescriptor, CreateOptions, DeleteOptions, DeleteOutcome,
    FetchAllOptions, FetchManyOptions, FetchManySelector, FetchOptions, IndexDescriptor,
};
use crate::query::{Query, QueryBuilder, Sort, Update};
use crate::record::{to_record, Record, PUBLIC_ID};
use crate::store::{DocumentStore, UpdateOutcome};
use crate::Result;

pub const COLLECTION: &str = "algorithms";

/// An algorithm definition. Fields beyond the indexed ones are opaque.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Algorithm {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub algorithm_image: Option<String>,
    #[serde(flatten)]
    pub spec: Record,
}

impl Algorithm {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: None,
            name: name.into(),
            kind: None,
            algorithm_image: None,
            spec: Record::new(),
        }
    }
}

/// Search filters; `None` fields do not constrain.
#[derive(Debug, Clone, Default)]
pub struct AlgorithmSearch {
    /// Case-insensitive substring of the name
    pub name: Option<String>,
    pub kind: Option<String>,
    pub has_image: Option<bool>,
    pub sort: Sort,
    pub limit: usize,
}

#[derive(Debug, Clone)]
pub struct Algorithms {
    collection: Collection<Algorithm>,
}

impl Algorithms {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self {
            collection: Collection::new(
                store,
                CollectionDescriptor::new(COLLECTION, "algorithm")
                    .with_index(IndexDescriptor::unique("name")),
            ),
        }
    }

    pub fn collection(&self) -> &Collection<Algorithm> {
        &self.collection
    }

    pub async fn init(&self) -> Result<()> {
        self.collection.init().await
    }

    pub async fn create(&self, algorithm: &Algorithm) -> Result<Algorithm> {
        self.collection
            .create(algorithm, CreateOptions { apply_id: true })
            .await
    }

    pub async fn fetch(&self, name: &str) -> Result<Algorithm> {
        self.collection
            .fetch(&Query::eq("name", name), FetchOptions::default())
            .await
    }

    pub async fn fetch_by_id(&self, id: &str) -> Result<Algorithm> {
        self.collection
            .fetch(&Query::eq(PUBLIC_ID, id), FetchOptions::default())
            .await
    }

    pub async fn fetch_all(&self) -> Result<Vec<Algorithm>> {
        self.collection.fetch_all(FetchAllOptions::default()).await
    }

    pub async fn fetch_many(&self, selector: &FetchManySelector) -> Result<Vec<Algorithm>> {
        self.collection
            .fetch_many(selector, FetchManyOptions::default())
            .await
    }

    #[instrument(skip(self))]
    pub async fn search(&self, search: AlgorithmSearch) -> Result<Vec<Algorithm>> {
        let query = QueryBuilder::new()
            .add_regex_search("name", search.name.as_deref())
            .add_param("kind", search.kind)
            .add_exists("algorithmImage", search.has_image)
            .build();
        self.collection
            .fetch_all(FetchAllOptions {
                query,
                sort: search.sort,
                limit: search.limit,
                ..Default::default()
            })
            .await
    }

    /// Upsert by name.
    pub async fn update(&self, algorithm: &Algorithm) -> Result<UpdateOutcome> {
        let mut fields = to_record(algorithm)?;
        fields.shift_remove(PUBLIC_ID);
        self.collection
            .update_one(&Query::eq("name", algorithm.name.as_str()), &Update::set(fields), true)
            .await
    }

    pub async fn delete(&self, name: &str) -> Result<DeleteOutcome> {
        let outcome = self
            .collection
            .delete(&Query::eq("name", name), DeleteOptions::default())
            .await?;
        Ok(outcome.unwrap_or(DeleteOutcome { deleted: 0 }))
    }

    pub async fn count(&self) -> Result<u64> {
        self.collection.count(&Query::all()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::query::SortOrder;
    use crate::store::MemoryStore;

    async fn repo() -> Algorithms {
        let repo = Algorithms::new(Arc::new(MemoryStore::new()));
        repo.init().await.unwrap();
        repo
    }

    fn image(name: &str, kind: &str, image: Option<&str>) -> Algorithm {
        Algorithm {
            kind: Some(kind.to_string()),
            algorithm_image: image.map(str::to_string),
            ..Algorithm::new(name)
        }
    }

    #[tokio::test]
    async fn search_combines_filters() {
        let repo = repo().await;
        repo.create(&image("green-sort", "algorithm", Some("img/sort"))).await.unwrap();
        repo.create(&image("green-debug", "debug", Some("img/debug"))).await.unwrap();
        repo.create(&image("blue-sort", "algorithm", None)).await.unwrap();

        let found = repo
            .search(AlgorithmSearch {
                name: Some("GREEN".to_string()),
                kind: Some("algorithm".to_string()),
                has_image: Some(true),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].name, "green-sort");

        let sorted = repo
            .search(AlgorithmSearch {
                sort: Sort::new().by("name", SortOrder::Desc),
                limit: 2,
                ..Default::default()
            })
            .await
            .unwrap();
        let names: Vec<_> = sorted.iter().map(|a| a.name.as_str()).collect();
        assert_eq!(names, vec!["green-sort", "green-debug"]);
    }

    #[tokio::test]
    async fn update_upserts_by_name_and_keeps_opaque_fields() {
        let repo = repo().await;
        let mut algorithm = Algorithm::new("resize");
        algorithm.spec.insert("cpu".to_string(), 2.into());
        repo.update(&algorithm).await.unwrap();
        assert_eq!(repo.count().await.unwrap(), 1);

        algorithm.spec.insert("cpu".to_string(), 4.into());
        let outcome = repo.update(&algorithm).await.unwrap();
        assert_eq!(outcome.matched, 1);

        let fetched = repo.fetch("resize").await.unwrap();
        assert_eq!(fetched.spec.get("cpu"), Some(&4.into()));
        assert!(fetched.id.is_some());
    }

    #[tokio::test]
    async fn delete_unknown_name_is_not_found() {
        let repo = repo().await;
        let err = repo.delete("ghost").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert_eq!(err.to_string(), "algorithm ghost Not Found");
    }
}
