//! Consumers of cluster membership changes.
//!
//! Every committed re-clustering with a non-empty diff is handed to an
//! [`AnalysisSink`]. The diff is also flattened into clustered-failure rows:
//! one row per (cluster, failure) whose inclusion or priority changed.

use crate::algorithms::rules;
use crate::error::Result;
use crate::model::{ClusterId, ClusterUpdate};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use time::OffsetDateTime;
use tracing::info;

pub trait AnalysisSink: Send + Sync {
    /// Called after the write producing `update` committed at `commit_time`.
    fn handle_updated_clusters(&self, update: &ClusterUpdate, commit_time: OffsetDateTime)
        -> Result<()>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusteredFailureRow {
    pub project: String,
    pub cluster_algorithm: String,
    pub cluster_id: String,
    pub chunk_id: String,
    pub test_result_id: String,
    pub test_id: String,
    pub is_included: bool,
    pub is_included_with_high_priority: bool,
    pub last_updated: OffsetDateTime,
}

/// Inclusion and priority of each cluster a failure belongs to. Failures in
/// a rules cluster count towards their rules clusters with high priority
/// and towards suggested clusters with low priority.
fn membership(clusters: &[ClusterId]) -> BTreeMap<&ClusterId, bool> {
    let in_rule = clusters.iter().any(|c| c.algorithm == rules::ALGORITHM_NAME);
    clusters
        .iter()
        .map(|c| (c, !in_rule || c.algorithm == rules::ALGORITHM_NAME))
        .collect()
}

pub fn clustered_failure_rows(
    update: &ClusterUpdate,
    commit_time: OffsetDateTime,
) -> Vec<ClusteredFailureRow> {
    let mut rows = Vec::new();
    for failure in &update.updates {
        let before = membership(&failure.previous_clusters);
        let after = membership(&failure.new_clusters);
        let mut push = |cluster: &ClusterId, is_included: bool, high_priority: bool| {
            rows.push(ClusteredFailureRow {
                project: update.project.clone(),
                cluster_algorithm: cluster.algorithm.clone(),
                cluster_id: cluster.id.clone(),
                chunk_id: update.chunk_id.clone(),
                test_result_id: failure.test_result.test_result_id.clone(),
                test_id: failure.test_result.test_id.clone(),
                is_included,
                is_included_with_high_priority: high_priority,
                last_updated: commit_time,
            });
        };
        for (cluster, high_priority) in &after {
            if before.get(cluster) != Some(high_priority) {
                push(*cluster, true, *high_priority);
            }
        }
        for cluster in before.keys() {
            if !after.contains_key(cluster) {
                push(*cluster, false, false);
            }
        }
    }
    rows
}

/// Keeps every update and the rows derived from it in memory.
#[derive(Debug, Default)]
pub struct RecordingSink {
    updates: Mutex<Vec<(ClusterUpdate, OffsetDateTime)>>,
    rows: Mutex<Vec<ClusteredFailureRow>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn updates(&self) -> Vec<(ClusterUpdate, OffsetDateTime)> {
        self.updates.lock().clone()
    }

    pub fn rows(&self) -> Vec<ClusteredFailureRow> {
        self.rows.lock().clone()
    }

    pub fn clear(&self) {
        self.updates.lock().clear();
        self.rows.lock().clear();
    }
}

impl AnalysisSink for RecordingSink {
    fn handle_updated_clusters(
        &self,
        update: &ClusterUpdate,
        commit_time: OffsetDateTime,
    ) -> Result<()> {
        self.rows
            .lock()
            .extend(clustered_failure_rows(update, commit_time));
        self.updates.lock().push((update.clone(), commit_time));
        Ok(())
    }
}

/// Logs each update's size.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl AnalysisSink for TracingSink {
    fn handle_updated_clusters(
        &self,
        update: &ClusterUpdate,
        commit_time: OffsetDateTime,
    ) -> Result<()> {
        let rows = clustered_failure_rows(update, commit_time);
        info!(
            project = %update.project,
            chunk_id = %update.chunk_id,
            failures = update.updates.len(),
            rows = rows.len(),
            commit_time = %commit_time,
            "cluster membership changed"
        );
        Ok(())
    }
}
