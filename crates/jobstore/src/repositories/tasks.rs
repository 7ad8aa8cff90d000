//! Tasks repository: per-node task records of a job, keyed by `taskId`.

use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::collection::{
    Collection, CollectionDescriptor, CreateManyOptions, CreateOptions, DeleteOutcome,
    FetchAllOptions, FetchOptions, IndexDescriptor,
};
use crate::query::{Query, QueryBuilder, Sort};
use crate::record::{deep_merge, Record};
use crate::store::DocumentStore;
use crate::Result;

pub const COLLECTION: &str = "tasks";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub task_id: String,
    pub job_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(flatten)]
    pub extra: Record,
}

impl Task {
    pub fn new(task_id: impl Into<String>, job_id: impl Into<String>) -> Self {
        Self {
            id: None,
            task_id: task_id.into(),
            job_id: job_id.into(),
            node_name: None,
            status: None,
            extra: Record::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Tasks {
    collection: Collection<Task>,
}

impl Tasks {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self {
            collection: Collection::new(
                store,
                CollectionDescriptor::new(COLLECTION, "task")
                    .with_index(IndexDescriptor::unique("taskId"))
                    .with_index(IndexDescriptor::non_unique("jobId")),
            ),
        }
    }

    pub fn collection(&self) -> &Collection<Task> {
        &self.collection
    }

    pub async fn init(&self) -> Result<()> {
        self.collection.init().await
    }

    pub async fn create(&self, task: &Task) -> Result<Task> {
        self.collection.create(task, CreateOptions::default()).await
    }

    /// Unordered bulk insert; tasks that already exist are skipped.
    pub async fn create_many(&self, tasks: &[Task]) -> Result<usize> {
        self.collection
            .create_many(tasks, CreateManyOptions { ordered: false })
            .await
    }

    pub async fn fetch(&self, task_id: &str) -> Result<Task> {
        self.collection
            .fetch(&Query::eq("taskId", task_id), FetchOptions::default())
            .await
    }

    /// Tasks of a job in creation order, optionally narrowed by status.
    pub async fn search(&self, job_id: &str, statuses: Option<Vec<String>>) -> Result<Vec<Task>> {
        let query = QueryBuilder::new()
            .add_param("jobId", Some(job_id))
            .add_in_array("status", statuses)
            .build();
        self.collection
            .fetch_all(FetchAllOptions {
                query,
                sort: Sort::new(),
                ..Default::default()
            })
            .await
    }

    /// Set the task status, merging `details` into the task.
    pub async fn update_status(
        &self,
        task_id: &str,
        status: &str,
        details: Option<Record>,
    ) -> Result<Task> {
        let status = status.to_string();
        self.collection
            .patch_with(&Query::eq("taskId", task_id), move |mut task| async move {
                if let Some(details) = details {
                    deep_merge(&mut task, details);
                }
                task.insert("status".to_string(), Value::String(status));
                task.insert("updatedAt".to_string(), Utc::now().timestamp_millis().into());
                Ok(task)
            })
            .await
    }

    pub async fn delete_by_job(&self, job_id: &str) -> Result<DeleteOutcome> {
        self.collection
            .delete_many(&Query::eq("jobId", job_id), true)
            .await
    }
}
