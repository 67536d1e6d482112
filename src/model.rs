//! # Data Model
//!
//! Cluster identifiers, per-chunk clustering snapshots, the failures that make
//! up a chunk, and the diff emitted when a chunk's clustering changes.

use crate::error::{Error, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::LazyLock;
use time::OffsetDateTime;

static PROJECT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z0-9\-]{1,40}$").expect("project pattern"));
static CHUNK_ID_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[0-9a-f]{32}$").expect("chunk ID pattern"));
static ALGORITHM_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[0-9a-z\-.]{1,32}$").expect("algorithm pattern"));
static RULE_ID_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[0-9a-f]{32}$").expect("rule ID pattern"));

pub fn is_valid_project(project: &str) -> bool {
    PROJECT_RE.is_match(project)
}

pub fn is_valid_chunk_id(chunk_id: &str) -> bool {
    CHUNK_ID_RE.is_match(chunk_id)
}

pub fn is_valid_algorithm(name: &str) -> bool {
    ALGORITHM_RE.is_match(name)
}

pub fn is_valid_rule_id(rule_id: &str) -> bool {
    RULE_ID_RE.is_match(rule_id)
}

pub fn validate_project(project: &str) -> Result<()> {
    if !is_valid_project(project) {
        return Err(Error::validation(format!("project {project:?} is not valid")));
    }
    Ok(())
}

pub fn validate_chunk_id(chunk_id: &str) -> Result<()> {
    if !is_valid_chunk_id(chunk_id) {
        return Err(Error::validation(format!("chunk ID {chunk_id:?} is not valid")));
    }
    Ok(())
}

/// Identifies a cluster. The algorithm name carries its version so results
/// from superseded logic are recognisably stale.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ClusterId {
    pub algorithm: String,
    pub id: String,
}

impl ClusterId {
    pub fn new(algorithm: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            algorithm: algorithm.into(),
            id: id.into(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if !is_valid_algorithm(&self.algorithm) {
            return Err(Error::validation("algorithm not valid"));
        }
        if self.id.is_empty() {
            return Err(Error::validation("ID is empty"));
        }
        Ok(())
    }
}

impl fmt::Display for ClusterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.algorithm, self.id)
    }
}

/// Sorts clusters into canonical (algorithm, id) order.
pub fn sort_clusters(clusters: &mut [ClusterId]) {
    clusters.sort_unstable();
}

/// Order-independent equality of two cluster lists.
pub fn clusters_equal(a: &[ClusterId], b: &[ClusterId]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut a = a.to_vec();
    let mut b = b.to_vec();
    sort_clusters(&mut a);
    sort_clusters(&mut b);
    a == b
}

/// The clustering of every failure in one chunk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterResults {
    pub algorithms_version: i64,
    pub rules_version: OffsetDateTime,
    /// Every algorithm that contributed to `clusters`.
    pub algorithms: BTreeSet<String>,
    /// Index-aligned with the chunk's failures.
    pub clusters: Vec<Vec<ClusterId>>,
}

impl ClusterResults {
    /// The clustering of a chunk that has never been clustered: every
    /// failure belongs to no cluster.
    pub fn unclustered(failures: usize) -> Self {
        Self {
            algorithms_version: 0,
            rules_version: OffsetDateTime::UNIX_EPOCH,
            algorithms: BTreeSet::new(),
            clusters: vec![Vec::new(); failures],
        }
    }

    /// True if both results have the same algorithms and the same clusters
    /// per failure, ignoring order within each failure.
    pub fn same_clusters(&self, other: &ClusterResults) -> bool {
        self.algorithms == other.algorithms
            && self.clusters.len() == other.clusters.len()
            && self
                .clusters
                .iter()
                .zip(&other.clusters)
                .all(|(a, b)| clusters_equal(a, b))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct FailureReason {
    pub primary_error_message: String,
}

/// One failed test result inside a chunk.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Failure {
    pub test_result_id: String,
    pub test_id: String,
    #[serde(default)]
    pub variant: BTreeMap<String, String>,
    #[serde(default)]
    pub failure_reason: Option<FailureReason>,
    #[serde(default)]
    pub is_exonerated: bool,
}

impl Failure {
    /// The primary error message, if one was recorded and is non-empty.
    pub fn primary_error_message(&self) -> Option<&str> {
        self.failure_reason
            .as_ref()
            .map(|reason| reason.primary_error_message.as_str())
            .filter(|message| !message.is_empty())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Chunk {
    pub failures: Vec<Failure>,
}

/// Persisted clustering state of one chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub project: String,
    pub chunk_id: String,
    pub partition_time: OffsetDateTime,
    pub object_id: String,
    pub clustering: ClusterResults,
    /// Commit timestamp of the last write; `None` before the entry is created.
    pub last_updated: Option<OffsetDateTime>,
}

impl Entry {
    pub fn validate(&self) -> Result<()> {
        validate_project(&self.project)?;
        validate_chunk_id(&self.chunk_id)?;
        if self.partition_time == OffsetDateTime::UNIX_EPOCH {
            return Err(Error::validation("partition time must be specified"));
        }
        if self.object_id.is_empty() {
            return Err(Error::validation("object ID must be specified"));
        }
        validate_cluster_results(&self.clustering)
    }
}

pub fn validate_cluster_results(results: &ClusterResults) -> Result<()> {
    if results.algorithms_version <= 0 {
        return Err(Error::validation("algorithms version must be specified"));
    }
    if results.rules_version == OffsetDateTime::UNIX_EPOCH {
        return Err(Error::validation("rules version must be specified"));
    }
    if results.clusters.is_empty() {
        return Err(Error::validation(
            "there must be clustered test results in the chunk",
        ));
    }
    for algorithm in &results.algorithms {
        if !is_valid_algorithm(algorithm) {
            return Err(Error::validation(format!(
                "algorithm {algorithm:?} is not valid"
            )));
        }
    }
    for (i, clusters) in results.clusters.iter().enumerate() {
        for (j, cluster) in clusters.iter().enumerate() {
            cluster.validate().map_err(|err| {
                Error::validation(format!(
                    "test result {i}: cluster {j}: cluster ID is not valid: {}",
                    validation_message(&err)
                ))
            })?;
            if !results.algorithms.contains(&cluster.algorithm) {
                return Err(Error::validation(format!(
                    "test result {i}: cluster {j}: a test result was clustered with an unregistered algorithm"
                )));
            }
        }
    }
    Ok(())
}

fn validation_message(err: &Error) -> String {
    match err {
        Error::Validation(message) => message.clone(),
        other => other.to_string(),
    }
}

/// Change in cluster membership of one failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureUpdate {
    pub test_result: Failure,
    pub previous_clusters: Vec<ClusterId>,
    pub new_clusters: Vec<ClusterId>,
}

/// Membership changes of one chunk, limited to failures that changed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterUpdate {
    pub project: String,
    pub chunk_id: String,
    pub updates: Vec<FailureUpdate>,
}
