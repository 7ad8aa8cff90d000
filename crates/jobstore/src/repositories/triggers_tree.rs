//! Trigger trees
//!
//! One record per root job holds the nested tree of jobs its pipelines
//! triggered. Children are attached with `patch_with`, so concurrent
//! attachments to the same tree are all kept.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use crate::collection::{
    Collection, CollectionDescriptor, CreateOptions, DeleteOptions, DeleteOutcome, FetchOptions,
    IndexDescriptor,
};
use crate::error::DbError;
use crate::query::Query;
use crate::record::{from_record, to_record};
use crate::store::DocumentStore;
use crate::Result;

pub const COLLECTION: &str = "triggersTree";

/// A job and the jobs its pipeline triggered.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TriggerNode {
    pub job_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pipeline_name: Option<String>,
    #[serde(default)]
    pub children: Vec<TriggerNode>,
}

impl TriggerNode {
    pub fn new(job_id: impl Into<String>, pipeline_name: Option<String>) -> Self {
        Self {
            job_id: job_id.into(),
            pipeline_name,
            children: Vec::new(),
        }
    }

    /// Depth-first search for `job_id` in this subtree.
    pub fn find(&self, job_id: &str) -> Option<&TriggerNode> {
        if self.job_id == job_id {
            return Some(self);
        }
        self.children.iter().find_map(|child| child.find(job_id))
    }

    pub fn find_mut(&mut self, job_id: &str) -> Option<&mut TriggerNode> {
        if self.job_id == job_id {
            return Some(self);
        }
        self.children
            .iter_mut()
            .find_map(|child| child.find_mut(job_id))
    }

    /// Number of nodes in this subtree.
    pub fn size(&self) -> usize {
        1 + self.children.iter().map(TriggerNode::size).sum::<usize>()
    }
}

/// The trigger tree rooted at one job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TriggerTree {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub job_id: String,
    pub root: TriggerNode,
}

#[derive(Debug, Clone)]
pub struct TriggersTree {
    collection: Collection<TriggerTree>,
}

impl TriggersTree {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self {
            collection: Collection::new(
                store,
                CollectionDescriptor::new(COLLECTION, "triggersTree")
                    .with_index(IndexDescriptor::unique("jobId")),
            ),
        }
    }

    pub fn collection(&self) -> &Collection<TriggerTree> {
        &self.collection
    }

    pub async fn init(&self) -> Result<()> {
        self.collection.init().await
    }

    pub async fn fetch(&self, root_job_id: &str) -> Result<TriggerTree> {
        self.collection
            .fetch(&Query::eq("jobId", root_job_id), FetchOptions::default())
            .await
    }

    /// Attach `child` under `parent_job_id` in the tree of `root_job_id`.
    ///
    /// The tree is created on first use when the parent is the root itself.
    /// An unknown parent is `NotFound` and leaves the tree untouched.
    #[instrument(skip(self, child), fields(child = %child.job_id))]
    pub async fn add_child(
        &self,
        root_job_id: &str,
        parent_job_id: &str,
        child: TriggerNode,
    ) -> Result<TriggerTree> {
        let query = Query::eq("jobId", root_job_id);
        if parent_job_id == root_job_id && self.collection.count(&query).await? == 0 {
            let mut root = TriggerNode::new(root_job_id, None);
            root.children.push(child.clone());
            let tree = TriggerTree {
                id: None,
                job_id: root_job_id.to_string(),
                root,
            };
            match self
                .collection
                .create(&tree, CreateOptions { apply_id: true })
                .await
            {
                Ok(created) => {
                    debug!("trigger tree created");
                    return Ok(created);
                }
                // Lost the race to another creator; attach to theirs
                Err(DbError::Conflict { .. }) => {}
                Err(err) => return Err(err),
            }
        }

        let parent = parent_job_id.to_string();
        self.collection
            .patch_with(&query, move |current| async move {
                let mut tree: TriggerTree = from_record(current)?;
                let node = tree
                    .root
                    .find_mut(&parent)
                    .ok_or_else(|| DbError::not_found("trigger", &parent))?;
                node.children.push(child);
                to_record(&tree)
            })
            .await
    }

    pub async fn delete(&self, root_job_id: &str) -> Result<Option<DeleteOutcome>> {
        self.collection
            .delete(&Query::eq("jobId", root_job_id), DeleteOptions::allow_not_found())
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::store::MemoryStore;

    fn node(job_id: &str) -> TriggerNode {
        TriggerNode::new(job_id, Some(format!("pipe-{job_id}")))
    }

    #[tokio::test]
    async fn add_child_builds_nested_tree() {
        let repo = TriggersTree::new(Arc::new(MemoryStore::new()));
        repo.init().await.unwrap();

        repo.add_child("root", "root", node("a")).await.unwrap();
        repo.add_child("root", "root", node("b")).await.unwrap();
        let tree = repo.add_child("root", "a", node("a1")).await.unwrap();
        assert_eq!(tree.root.size(), 4);

        let fetched = repo.fetch("root").await.unwrap();
        assert_eq!(fetched.root, tree.root);
        let a = fetched.root.find("a").unwrap();
        assert_eq!(a.children.len(), 1);
        assert_eq!(a.children[0].job_id, "a1");
        assert_eq!(a.children[0].pipeline_name.as_deref(), Some("pipe-a1"));
    }

    #[tokio::test]
    async fn unknown_parent_leaves_tree_untouched() {
        let repo = TriggersTree::new(Arc::new(MemoryStore::new()));
        repo.add_child("root", "root", node("a")).await.unwrap();

        let err = repo.add_child("root", "nope", node("x")).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert_eq!(repo.fetch("root").await.unwrap().root.size(), 2);

        let err = repo.add_child("other", "other-parent", node("x")).await.unwrap_err();
        assert_eq!(err.to_string(), "triggersTree other Not Found");
    }
}
