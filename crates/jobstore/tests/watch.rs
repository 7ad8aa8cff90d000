//! Keyed watch subscriptions over the job repository.

use std::time::Duration;

use jobstore::repositories::Job;
use jobstore::store::OperationType;
use jobstore::{Database, WatchEvent, WatchKey};
use serde_json::json;
use tokio::sync::mpsc;
use tokio::time::timeout;

fn job(job_id: &str) -> Job {
    Job::new(
        job_id,
        json!({"name": "train", "experimentName": "main"})
            .as_object()
            .cloned()
            .unwrap(),
    )
}

fn sink(tx: mpsc::UnboundedSender<WatchEvent<Job>>) -> impl Fn(WatchEvent<Job>) + Send + Sync + 'static {
    move |event| {
        let _ = tx.send(event);
    }
}

async fn next(rx: &mut mpsc::UnboundedReceiver<WatchEvent<Job>>) -> WatchEvent<Job> {
    timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("no change event within 2s")
        .expect("subscription closed")
}

#[tokio::test]
async fn watching_the_same_key_twice_opens_one_stream() {
    let db = Database::in_memory().await.unwrap();
    let jobs = db.jobs();
    let (tx, _rx) = mpsc::unbounded_channel();
    let tx2 = tx.clone();

    assert!(jobs.watch("j1", sink(tx)).await.unwrap());
    assert!(!jobs.watch("j1", sink(tx2)).await.unwrap());
    assert_eq!(db.store().open_change_streams(), 1);
    assert!(jobs.is_watching(&WatchKey::Id("j1".to_string())).await);

    assert!(jobs.unwatch(&WatchKey::Id("j1".to_string())).await);
    assert_eq!(db.store().open_change_streams(), 0);
    // Unknown or already closed keys are a no-op
    assert!(!jobs.unwatch(&WatchKey::Id("j1".to_string())).await);
    assert!(!jobs.unwatch(&WatchKey::All).await);
}

#[tokio::test]
async fn keyed_watch_delivers_only_its_job() {
    let db = Database::in_memory().await.unwrap();
    let jobs = db.jobs();
    let (tx, mut rx) = mpsc::unbounded_channel();
    jobs.watch("j1", sink(tx)).await.unwrap();

    jobs.create(&job("j2")).await.unwrap();
    jobs.create(&job("j1")).await.unwrap();

    let created = next(&mut rx).await;
    assert_eq!(created.operation, OperationType::Insert);
    assert_eq!(created.document.job_id, "j1");
    assert!(created.updated_fields.is_none());

    let status = json!({"status": "active", "progress": 40});
    jobs.update_status("j1", status.as_object().cloned().unwrap())
        .await
        .unwrap();

    let updated = next(&mut rx).await;
    assert_eq!(updated.operation, OperationType::Update);
    assert_eq!(updated.document.job_id, "j1");
    let status = updated.document.status.unwrap();
    assert_eq!(status.get("status"), Some(&json!("active")));
    assert!(updated.updated_fields.is_some_and(|fields| !fields.is_empty()));
}

#[tokio::test]
async fn no_callback_after_unwatch() {
    let db = Database::in_memory().await.unwrap();
    let jobs = db.jobs();
    jobs.create(&job("j1")).await.unwrap();

    let (tx, mut rx) = mpsc::unbounded_channel();
    jobs.watch("j1", sink(tx)).await.unwrap();
    jobs.unwatch(&WatchKey::Id("j1".to_string())).await;

    let status = json!({"status": "completed"});
    jobs.update_status("j1", status.as_object().cloned().unwrap())
        .await
        .unwrap();

    let delivered = timeout(Duration::from_millis(100), rx.recv()).await;
    assert!(!matches!(delivered, Ok(Some(_))));
}

#[tokio::test]
async fn close_stops_every_subscription() {
    let db = Database::in_memory().await.unwrap();
    let jobs = db.jobs();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let tx2 = tx.clone();
    jobs.watch_all(sink(tx)).await.unwrap();
    jobs.watch("j1", sink(tx2)).await.unwrap();
    assert_eq!(db.store().open_change_streams(), 2);

    jobs.create(&job("j7")).await.unwrap();
    assert_eq!(next(&mut rx).await.document.job_id, "j7");

    db.close(false).await.unwrap();
    assert!(!db.is_connected());
    assert_eq!(db.store().open_change_streams(), 0);
    assert!(!jobs.is_watching(&WatchKey::All).await);
}
