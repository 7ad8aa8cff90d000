//! Pipelines repository: pipeline definitions, unique by name.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::instrument;

use crate::collection::{
    Collection, CollectionDescriptor, CreateOptions, DeleteOptions, DeleteOutcome,
    FetchAllOptions, FetchOptions, IndexDescriptor,
};
use crate::query::{Query, QueryBuilder, Sort, Update};
use crate::record::{to_record, Record, PUBLIC_ID};
use crate::store::{DocumentStore, UpdateOutcome};
use crate::Result;

pub const COLLECTION: &str = "pipelines";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Pipeline {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub experiment_name: Option<String>,
    #[serde(default)]
    pub nodes: Vec<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub triggers: Option<Value>,
    #[serde(flatten)]
    pub spec: Record,
}

impl Pipeline {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: None,
            name: name.into(),
            experiment_name: None,
            nodes: Vec::new(),
            triggers: None,
            spec: Record::new(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct PipelineSearch {
    /// Case-insensitive substring of the name
    pub name: Option<String>,
    pub experiment_name: Option<String>,
    /// Only pipelines triggered by at least one other pipeline
    pub has_triggers: Option<bool>,
    /// Only pipelines with at least this many nodes
    pub min_nodes: Option<usize>,
    pub sort: Sort,
    pub limit: usize,
}

#[derive(Debug, Clone)]
pub struct Pipelines {
    collection: Collection<Pipeline>,
}

impl Pipelines {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self {
            collection: Collection::new(
                store,
                CollectionDescriptor::new(COLLECTION, "pipeline")
                    .with_index(IndexDescriptor::unique("name")),
            ),
        }
    }

    pub fn collection(&self) -> &Collection<Pipeline> {
        &self.collection
    }

    pub async fn init(&self) -> Result<()> {
        self.collection.init().await
    }

    pub async fn create(&self, pipeline: &Pipeline) -> Result<Pipeline> {
        self.collection
            .create(pipeline, CreateOptions { apply_id: true })
            .await
    }

    pub async fn fetch(&self, name: &str) -> Result<Pipeline> {
        self.collection
            .fetch(&Query::eq("name", name), FetchOptions::default())
            .await
    }

    #[instrument(skip(self))]
    pub async fn search(&self, search: PipelineSearch) -> Result<Vec<Pipeline>> {
        let query = QueryBuilder::new()
            .add_regex_search("name", search.name.as_deref())
            .add_param("experimentName", search.experiment_name)
            .add_array_length_at_least("triggers.pipelines", search.has_triggers.filter(|h| *h), 1)
            .add_array_length_at_least("nodes", search.min_nodes, search.min_nodes.unwrap_or(0))
            .build();
        let query = match search.has_triggers {
            Some(false) => query.and(Query::eq("triggers.pipelines.0", Value::Null)),
            _ => query,
        };
        self.collection
            .fetch_all(FetchAllOptions {
                query,
                sort: search.sort,
                limit: search.limit,
                ..Default::default()
            })
            .await
    }

    /// Replace the stored definition of `pipeline.name`.
    pub async fn update(&self, pipeline: &Pipeline) -> Result<UpdateOutcome> {
        let mut fields = to_record(pipeline)?;
        fields.shift_remove(PUBLIC_ID);
        let outcome = self
            .collection
            .update_one(&Query::eq("name", pipeline.name.as_str()), &Update::set(fields), false)
            .await?;
        if outcome.matched == 0 {
            return Err(crate::error::DbError::not_found("pipeline", &pipeline.name));
        }
        Ok(outcome)
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
    use serde_json::json;
    use crate::store::MemoryStore;

    fn pipeline(name: &str, nodes: usize, triggered_by: &[&str]) -> Pipeline {
        let mut p = Pipeline::new(name);
        p.experiment_name = Some("main".to_string());
        p.nodes = (0..nodes).map(|i| json!({"nodeName": format!("n{i}")})).collect();
        if !triggered_by.is_empty() {
            p.triggers = Some(json!({"pipelines": triggered_by}));
        }
        p
    }

    #[tokio::test]
    async fn search_by_node_count_and_triggers() {
        let repo = Pipelines::new(Arc::new(MemoryStore::new()));
        repo.init().await.unwrap();
        repo.create(&pipeline("ingest", 1, &[])).await.unwrap();
        repo.create(&pipeline("train", 3, &["ingest"])).await.unwrap();
        repo.create(&pipeline("report", 2, &[])).await.unwrap();

        let big = repo
            .search(PipelineSearch {
                min_nodes: Some(2),
                ..Default::default()
            })
            .await
            .unwrap();
        let names: Vec<_> = big.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["train", "report"]);

        let triggered = repo
            .search(PipelineSearch {
                has_triggers: Some(true),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(triggered.len(), 1);
        assert_eq!(triggered[0].name, "train");

        let untriggered = repo
            .search(PipelineSearch {
                has_triggers: Some(false),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(untriggered.len(), 2);
    }

    #[tokio::test]
    async fn update_requires_existing_pipeline() {
        let repo = Pipelines::new(Arc::new(MemoryStore::new()));
        let err = repo.update(&pipeline("missing", 1, &[])).await.unwrap_err();
        assert_eq!(err.to_string(), "pipeline missing Not Found");
    }
}
