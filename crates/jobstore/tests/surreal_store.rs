//! Smoke tests for the SurrealDB backend on an embedded `mem://` engine.

use std::sync::Arc;

use jobstore::repositories::{Algorithm, AlgorithmSearch, DataSource, Job, Task, TriggerNode};
use jobstore::{Database, DocumentStore, ErrorKind, Query, Sort, SurrealStore};
use serde_json::json;

async fn database() -> Database {
    let store = SurrealStore::in_memory().await.unwrap();
    let db = Database::from_store(Arc::new(store));
    db.create_indices().await.unwrap();
    db
}

fn job(job_id: &str) -> Job {
    Job::new(
        job_id,
        json!({"name": "train", "experimentName": "main"})
            .as_object()
            .cloned()
            .unwrap(),
    )
}

#[tokio::test]
async fn create_fetch_and_conflict() {
    let db = database().await;
    let created = db.algorithms().create(&Algorithm::new("sort")).await.unwrap();
    let id = created.id.clone().unwrap();

    let fetched = db.algorithms().fetch_by_id(&id).await.unwrap();
    assert_eq!(fetched.name, "sort");

    let err = db.algorithms().create(&Algorithm::new("sort")).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict);
    assert_eq!(err.to_string(), "could not create algorithm, name already exists");
    assert_eq!(db.algorithms().count().await.unwrap(), 1);
}

#[tokio::test]
async fn search_sorts_and_limits() {
    let db = database().await;
    for (name, kind) in [("b-sort", "algorithm"), ("a-debug", "debug"), ("c-sort", "algorithm")] {
        db.algorithms()
            .create(&Algorithm {
                kind: Some(kind.to_string()),
                ..Algorithm::new(name)
            })
            .await
            .unwrap();
    }

    let found = db
        .algorithms()
        .search(AlgorithmSearch {
            name: Some("SORT".to_string()),
            sort: Sort::new().desc("name"),
            ..Default::default()
        })
        .await
        .unwrap();
    let names: Vec<_> = found.iter().map(|a| a.name.as_str()).collect();
    assert_eq!(names, vec!["c-sort", "b-sort"]);

    let first = db
        .algorithms()
        .search(AlgorithmSearch {
            kind: Some("algorithm".to_string()),
            sort: Sort::new().asc("name"),
            limit: 1,
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(first.len(), 1);
    assert_eq!(first[0].name, "b-sort");
}

#[tokio::test]
async fn patch_merges_into_sub_document() {
    let db = database().await;
    db.jobs().create(&job("j1")).await.unwrap();

    let active = json!({"status": "active", "progress": 10});
    db.jobs()
        .update_status("j1", active.as_object().cloned().unwrap())
        .await
        .unwrap();
    let progress = json!({"progress": 60});
    let job = db
        .jobs()
        .update_status("j1", progress.as_object().cloned().unwrap())
        .await
        .unwrap();

    let status = job.status.unwrap();
    assert_eq!(status.get("status"), Some(&json!("active")));
    assert_eq!(status.get("progress"), Some(&json!(60)));

    let stored = db.jobs().fetch_status("j1").await.unwrap().unwrap();
    assert_eq!(stored.get("progress"), Some(&json!(60)));
}

#[tokio::test]
async fn transactional_create_and_purge() {
    let db = database().await;
    db.data_sources().create(&DataSource::new("ds1")).await.unwrap();
    let err = db.data_sources().create(&DataSource::new("ds1")).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict);

    db.jobs().create(&job("j1")).await.unwrap();
    db.tasks()
        .create_many(&[Task::new("t1", "j1"), Task::new("t2", "j1")])
        .await
        .unwrap();
    db.triggers_tree()
        .add_child("j1", "j1", TriggerNode::new("j2", None))
        .await
        .unwrap();

    let outcome = db.purge_job("j1").await.unwrap();
    assert_eq!((outcome.jobs, outcome.tasks, outcome.trigger_trees), (1, 2, 1));
    assert_eq!(db.store().count("tasks", &Query::all()).await.unwrap(), 0);
}

#[tokio::test]
async fn invalid_id_never_reaches_the_store() {
    let db = database().await;
    let err = db.algorithms().fetch_by_id("not-an-id").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidId);

    let err = db
        .algorithms()
        .fetch_by_id("0123456789abcdef01234567")
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
}

#[tokio::test]
async fn close_disconnects() {
    let db = database().await;
    assert!(db.is_connected());
    db.close(true).await.unwrap();
    assert!(!db.is_connected());
    assert!(db.algorithms().count().await.is_err());
}
