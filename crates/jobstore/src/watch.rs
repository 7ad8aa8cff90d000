//! Keyed change-stream subscriptions
//!
//! A `Watcher` belongs to one repository and maps a key (one entity, or all
//! of them) to at most one open `Subscription`. Watching an open key is a
//! no-op; unwatching a closed or unknown key is a no-op.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;

use serde::de::DeserializeOwned;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::collection::{ChangeNotice, Subscription};
use crate::record::{from_record, Record};
use crate::store::OperationType;
use crate::Result;

/// Subscription key
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum WatchKey {
    /// Every entity of the collection
    All,
    /// One entity, by its domain key
    Id(String),
}

impl fmt::Display for WatchKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WatchKey::All => write!(f, "*"),
            WatchKey::Id(id) => write!(f, "{id}"),
        }
    }
}

/// A decoded change event handed to repository callbacks
#[derive(Debug, Clone, PartialEq)]
pub struct WatchEvent<T> {
    pub operation: OperationType,
    pub document: T,
    /// Changed dot-paths (updates only); use with `document` to tell what moved
    pub updated_fields: Option<Record>,
}

impl<T: DeserializeOwned> WatchEvent<T> {
    pub fn decode(notice: ChangeNotice) -> Result<Self> {
        Ok(Self {
            operation: notice.operation,
            document: from_record(notice.document)?,
            updated_fields: notice.updated_fields,
        })
    }
}

/// Per-repository subscription map
#[derive(Default)]
pub struct Watcher {
    name: String,
    subscriptions: Mutex<HashMap<WatchKey, Subscription>>,
}

impl fmt::Debug for Watcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Watcher").field("name", &self.name).finish()
    }
}

impl Watcher {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            subscriptions: Mutex::new(HashMap::new()),
        }
    }

    /// Open a subscription under `key` unless one is already open.
    ///
    /// `open` runs only when a stream is actually needed. Returns whether a
    /// new stream was opened.
    pub async fn watch<F, Fut>(&self, key: WatchKey, open: F) -> Result<bool>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Subscription>>,
    {
        let mut subscriptions = self.subscriptions.lock().await;
        if subscriptions.get(&key).is_some_and(Subscription::is_active) {
            debug!(watcher = %self.name, %key, "already watching");
            return Ok(false);
        }
        let subscription = open().await?;
        if let Some(stale) = subscriptions.insert(key.clone(), subscription) {
            stale.close().await;
        }
        info!(watcher = %self.name, %key, "watch started");
        Ok(true)
    }

    /// Close the subscription under `key`, if any.
    pub async fn unwatch(&self, key: &WatchKey) -> bool {
        let removed = self.subscriptions.lock().await.remove(key);
        match removed {
            Some(subscription) => {
                subscription.close().await;
                info!(watcher = %self.name, %key, "watch stopped");
                true
            }
            None => false,
        }
    }

    /// Close every subscription.
    pub async fn unwatch_all(&self) -> usize {
        let drained: Vec<(WatchKey, Subscription)> =
            self.subscriptions.lock().await.drain().collect();
        let count = drained.len();
        for (_, subscription) in drained {
            subscription.close().await;
        }
        if count > 0 {
            info!(watcher = %self.name, count, "all watches stopped");
        }
        count
    }

    pub async fn is_watching(&self, key: &WatchKey) -> bool {
        self.subscriptions
            .lock()
            .await
            .get(key)
            .is_some_and(Subscription::is_active)
    }

    pub async fn active(&self) -> usize {
        self.subscriptions
            .lock()
            .await
            .values()
            .filter(|s| s.is_active())
            .count()
    }
}
