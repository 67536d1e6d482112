//! # Reclust
//!
//! Clusters test failures and keeps the clustering current as algorithms and
//! failure association rules change.
//!
//! Each chunk of failures is clustered when ingested, and the result is
//! stored together with the algorithms and rules versions that produced it.
//! Every few minutes the [`orchestrator`] schedules a run per project that
//! splits the chunk keyspace into shards. [`worker`]s bring the stale chunks
//! of each shard up to the run's target versions. Membership changes are
//! handed to an [`analysis::AnalysisSink`].

pub mod algorithms;
pub mod analysis;
pub mod chunkstore;
pub mod clock;
pub mod config;
pub mod db;
pub mod error;
pub mod keyspace;
pub mod model;
pub mod orchestrator;
pub mod rules;
pub mod runs;
pub mod state;
pub mod tasks;
pub mod test_support;
pub mod update;
pub mod worker;

// Re-export main types for convenience
pub use algorithms::{AlgorithmSet, ALGORITHMS_VERSION};
pub use analysis::{AnalysisSink, ClusteredFailureRow};
pub use chunkstore::{ChunkStore, PersistentChunkStore};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{ConfigError, ConfigOverrides, ReclustConfig};
pub use db::Database;
pub use error::{Error, MultiError, Result};
pub use model::{Chunk, ClusterId, ClusterResults, ClusterUpdate, Entry, Failure};
pub use orchestrator::{Orchestrator, OrchestratorConfig};
pub use rules::{FailureAssociationRule, RuleStore, Ruleset, RulesetCache};
pub use runs::{ReclusteringProgress, ReclusteringRun, RunStore};
pub use state::ClusteringStateStore;
pub use tasks::{ReclusterChunks, TaskQueue};
pub use update::{UpdateOutcome, Updater};
pub use worker::{TaskOutcome, Worker, WorkerConfig};
