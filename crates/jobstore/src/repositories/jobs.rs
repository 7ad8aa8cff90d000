//! Jobs repository
//!
//! A job record keeps `pipeline`, `status`, `result` and `graph` as
//! sub-documents. Status and result updates merge into their sub-document
//! through `patch_with`, so concurrent updates to different keys of the same
//! sub-document are both kept.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{instrument, warn};

use crate::collection::{
    Collection, CollectionDescriptor, CreateOptions, FetchAllOptions, FetchOptions,
    IndexDescriptor,
};
use crate::projection::Fields;
use crate::query::{DateRange, Query, QueryBuilder, Sort};
use crate::record::{deep_merge, display_value, get_path, Record};
use crate::store::DocumentStore;
use crate::watch::{WatchEvent, WatchKey, Watcher};
use crate::Result;

pub const COLLECTION: &str = "jobs";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub job_id: String,
    /// Pipeline snapshot (`name`, `experimentName`, `type`, `nodes`, ...)
    #[serde(default)]
    pub pipeline: Record,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<Record>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Record>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub graph: Option<Value>,
    /// Epoch milliseconds
    #[serde(default)]
    pub start_time: i64,
    #[serde(flatten)]
    pub extra: Record,
}

impl Job {
    pub fn new(job_id: impl Into<String>, pipeline: Record) -> Self {
        Self {
            id: None,
            job_id: job_id.into(),
            pipeline,
            status: None,
            result: None,
            graph: None,
            start_time: Utc::now().timestamp_millis(),
            extra: Record::new(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct JobSearch {
    pub experiment_name: Option<String>,
    /// Case-insensitive substring of the pipeline name
    pub pipeline_name: Option<String>,
    pub pipeline_type: Option<String>,
    pub statuses: Option<Vec<String>>,
    pub date_range: Option<DateRange>,
    pub has_result: Option<bool>,
    pub fields: Option<Fields>,
    pub sort: Sort,
    pub limit: usize,
}

/// Number of jobs per pipeline and status
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobStats {
    pub pipeline_name: String,
    pub status: String,
    pub count: u64,
}

#[derive(Debug)]
pub struct Jobs {
    collection: Collection<Job>,
    watcher: Watcher,
}

impl Jobs {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self {
            collection: Collection::new(
                store,
                CollectionDescriptor::new(COLLECTION, "job")
                    .with_index(IndexDescriptor::unique("jobId"))
                    .with_index(IndexDescriptor::non_unique("pipeline.name")),
            ),
            watcher: Watcher::new(COLLECTION),
        }
    }

    pub fn collection(&self) -> &Collection<Job> {
        &self.collection
    }

    pub async fn init(&self) -> Result<()> {
        self.collection.init().await
    }

    pub async fn create(&self, job: &Job) -> Result<Job> {
        self.collection
            .create(job, CreateOptions { apply_id: true })
            .await
    }

    pub async fn fetch(&self, job_id: &str) -> Result<Job> {
        self.collection
            .fetch(&Self::key(job_id), FetchOptions::default())
            .await
    }

    pub async fn fetch_status(&self, job_id: &str) -> Result<Option<Record>> {
        self.fetch_sub_document(job_id, "status").await
    }

    pub async fn fetch_result(&self, job_id: &str) -> Result<Option<Record>> {
        self.fetch_sub_document(job_id, "result").await
    }

    async fn fetch_sub_document(&self, job_id: &str, field: &str) -> Result<Option<Record>> {
        let record = self
            .collection
            .fetch_record(
                &Self::key(job_id),
                FetchOptions::fields(Fields::include([field])).exclude_id(),
            )
            .await?;
        Ok(get_path(&record, field).and_then(Value::as_object).cloned())
    }

    /// Merge `status` into the job's status sub-document.
    #[instrument(skip(self, status))]
    pub async fn update_status(&self, job_id: &str, status: Record) -> Result<Job> {
        self.merge_sub_document(job_id, "status", status).await
    }

    /// Merge `result` into the job's result sub-document.
    #[instrument(skip(self, result))]
    pub async fn update_result(&self, job_id: &str, result: Record) -> Result<Job> {
        self.merge_sub_document(job_id, "result", result).await
    }

    async fn merge_sub_document(&self, job_id: &str, field: &str, data: Record) -> Result<Job> {
        let field = field.to_string();
        self.collection
            .patch_with(&Self::key(job_id), move |mut job| async move {
                let mut current = match job.shift_remove(&field) {
                    Some(Value::Object(current)) => current,
                    _ => Record::new(),
                };
                deep_merge(&mut current, data);
                current.insert("timestamp".to_string(), Utc::now().timestamp_millis().into());
                job.insert(field, Value::Object(current));
                Ok(job)
            })
            .await
    }

    /// Replace the job graph.
    pub async fn patch_graph(&self, job_id: &str, graph: Value) -> Result<Job> {
        self.collection
            .patch_with(&Self::key(job_id), move |mut job| async move {
                job.insert("graph".to_string(), graph);
                Ok(job)
            })
            .await
    }

    #[instrument(skip(self))]
    pub async fn search(&self, search: JobSearch) -> Result<Vec<Job>> {
        let query = QueryBuilder::new()
            .add_param("pipeline.experimentName", search.experiment_name)
            .add_regex_search("pipeline.name", search.pipeline_name.as_deref())
            .add_param("pipeline.type", search.pipeline_type)
            .add_in_array("status.status", search.statuses)
            .add_date_range("startTime", search.date_range)
            .add_exists("result", search.has_result)
            .build();
        self.collection
            .fetch_all(FetchAllOptions {
                query,
                fields: search.fields,
                sort: search.sort,
                limit: search.limit,
                ..Default::default()
            })
            .await
    }

    /// Job counts grouped by pipeline name and status.
    #[instrument(skip(self))]
    pub async fn fetch_stats(&self, experiment_name: Option<&str>) -> Result<Vec<JobStats>> {
        let query = QueryBuilder::new()
            .add_param("pipeline.experimentName", experiment_name)
            .build();
        let records = self
            .collection
            .fetch_all_records(FetchAllOptions {
                query,
                fields: Some(Fields::include(["pipeline.name", "status.status"])),
                exclude_id: true,
                ..Default::default()
            })
            .await?;

        let mut groups: BTreeMap<(String, String), u64> = BTreeMap::new();
        for record in &records {
            let name = get_path(record, "pipeline.name")
                .map(display_value)
                .unwrap_or_default();
            let status = get_path(record, "status.status")
                .map(display_value)
                .unwrap_or_default();
            *groups.entry((name, status)).or_default() += 1;
        }
        Ok(groups
            .into_iter()
            .map(|((pipeline_name, status), count)| JobStats {
                pipeline_name,
                status,
                count,
            })
            .collect())
    }

    /// Deliver changes of one job to `on_change`. Returns false when that job
    /// is already watched.
    pub async fn watch<F>(&self, job_id: &str, on_change: F) -> Result<bool>
    where
        F: Fn(WatchEvent<Job>) + Send + Sync + 'static,
    {
        let stages = vec![Query::eq("fullDocument.jobId", job_id)];
        self.subscribe(WatchKey::Id(job_id.to_string()), stages, on_change)
            .await
    }

    /// Deliver changes of every job to `on_change`.
    pub async fn watch_all<F>(&self, on_change: F) -> Result<bool>
    where
        F: Fn(WatchEvent<Job>) + Send + Sync + 'static,
    {
        self.subscribe(WatchKey::All, Vec::new(), on_change).await
    }

    pub async fn unwatch(&self, key: &WatchKey) -> bool {
        self.watcher.unwatch(key).await
    }

    pub async fn unwatch_all(&self) -> usize {
        self.watcher.unwatch_all().await
    }

    pub async fn is_watching(&self, key: &WatchKey) -> bool {
        self.watcher.is_watching(key).await
    }

    async fn subscribe<F>(&self, key: WatchKey, stages: Vec<Query>, on_change: F) -> Result<bool>
    where
        F: Fn(WatchEvent<Job>) + Send + Sync + 'static,
    {
        let collection = &self.collection;
        self.watcher
            .watch(key, || async move {
                collection
                    .watch(stages, move |notice| match WatchEvent::<Job>::decode(notice) {
                        Ok(event) => on_change(event),
                        Err(e) => warn!(error = %e, "undecodable job change event"),
                    })
                    .await
            })
            .await
    }

    fn key(job_id: &str) -> Query {
        Query::eq("jobId", job_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use serde_json::json;

    fn pipeline(name: &str) -> Record {
        json!({"name": name, "experimentName": "main", "type": "stored"})
            .as_object()
            .cloned()
            .unwrap()
    }

    fn rec(v: Value) -> Record {
        v.as_object().cloned().unwrap()
    }

    async fn repo() -> Jobs {
        let jobs = Jobs::new(Arc::new(MemoryStore::new()));
        jobs.init().await.unwrap();
        jobs
    }

    #[tokio::test]
    async fn status_updates_merge_into_sub_document() {
        let jobs = repo().await;
        jobs.create(&Job::new("job-1", pipeline("p"))).await.unwrap();

        jobs.update_status("job-1", rec(json!({"status": "active", "progress": 10})))
            .await
            .unwrap();
        jobs.update_status("job-1", rec(json!({"progress": 50})))
            .await
            .unwrap();

        let status = jobs.fetch_status("job-1").await.unwrap().unwrap();
        assert_eq!(status.get("status"), Some(&json!("active")));
        assert_eq!(status.get("progress"), Some(&json!(50)));
        assert!(jobs.fetch_result("job-1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn stats_group_by_pipeline_and_status() {
        let jobs = repo().await;
        for (id, name, status) in [
            ("j1", "a", "completed"),
            ("j2", "a", "completed"),
            ("j3", "a", "failed"),
            ("j4", "b", "active"),
        ] {
            jobs.create(&Job::new(id, pipeline(name))).await.unwrap();
            jobs.update_status(id, rec(json!({"status": status})))
                .await
                .unwrap();
        }

        let stats = jobs.fetch_stats(Some("main")).await.unwrap();
        assert_eq!(
            stats,
            vec![
                JobStats { pipeline_name: "a".into(), status: "completed".into(), count: 2 },
                JobStats { pipeline_name: "a".into(), status: "failed".into(), count: 1 },
                JobStats { pipeline_name: "b".into(), status: "active".into(), count: 1 },
            ]
        );
    }

    #[tokio::test]
    async fn search_by_pipeline_and_result() {
        let jobs = repo().await;
        jobs.create(&Job::new("j1", pipeline("green-train"))).await.unwrap();
        jobs.create(&Job::new("j2", pipeline("blue-train"))).await.unwrap();
        jobs.update_result("j1", rec(json!({"data": [1, 2]})))
            .await
            .unwrap();

        let found = jobs
            .search(JobSearch {
                pipeline_name: Some("green".into()),
                has_result: Some(true),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].job_id, "j1");

        let without = jobs
            .search(JobSearch {
                has_result: Some(false),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(without.len(), 1);
        assert_eq!(without[0].job_id, "j2");
    }

    #[tokio::test]
    async fn patch_graph_replaces_whole_graph() {
        let jobs = repo().await;
        let mut job = Job::new("j1", pipeline("p"));
        job.graph = Some(json!({"nodes": [{"id": "a"}], "edges": []}));
        jobs.create(&job).await.unwrap();

        let patched = jobs
            .patch_graph("j1", json!({"nodes": [{"id": "b"}]}))
            .await
            .unwrap();
        assert_eq!(patched.graph, Some(json!({"nodes": [{"id": "b"}]})));
    }
}
