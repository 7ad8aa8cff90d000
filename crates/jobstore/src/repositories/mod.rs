//! Entity repositories
//!
//! Each repository embeds a `Collection<T>` for its entity, declares the
//! collection's indexes and exposes the operations callers need:
//! - `Algorithms`: algorithm definitions, unique by name
//! - `Pipelines`: pipeline definitions, unique by name
//! - `Jobs`: job runs with patchable status/result/graph sub-documents and
//!   keyed change subscriptions
//! - `Tasks`: per-node task records of a job
//! - `DataSources`: versioned data sources sharing a name
//! - `TriggersTree`: the tree of pipelines triggered from a root job

mod algorithms;
mod data_sources;
mod jobs;
mod pipelines;
mod tasks;
mod triggers_tree;

pub use algorithms::{Algorithm, AlgorithmSearch, Algorithms};
pub use data_sources::{DataSource, DataSources};
pub use jobs::{Job, JobSearch, JobStats, Jobs};
pub use pipelines::{Pipeline, PipelineSearch, Pipelines};
pub use tasks::{Task, Tasks};
pub use triggers_tree::{TriggerNode, TriggerTree, TriggersTree};
