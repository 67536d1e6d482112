//! Clustering State Store.
//!
//! One row per (project, chunk) holding the chunk's current clustering.
//! Version metadata and the encoded clusters live in separate column
//! families so a re-clustering that changes nothing but versions rewrites
//! only the small metadata record.

use crate::db::{self, Database, CF_STATE, CF_STATE_CLUSTERS};
use crate::error::{Error, Result};
use crate::keyspace::{self, ESTIMATE_SAMPLE_ROWS};
use crate::model::{
    self, validate_chunk_id, validate_project, ClusterId, ClusterResults, Entry,
};
use rocksdb::{Direction, IteratorMode, WriteBatch};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use time::OffsetDateTime;
use tracing::debug;

#[derive(Debug, Serialize, Deserialize)]
struct StoredEntry {
    partition_time: OffsetDateTime,
    object_id: String,
    algorithms_version: i64,
    rules_version: OffsetDateTime,
    last_updated: OffsetDateTime,
}

/// Compact form of a chunk's clusters: each distinct cluster is stored once
/// and failures refer to clusters by index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkClusters {
    pub algorithms: Vec<String>,
    pub referenced_clusters: Vec<ReferencedCluster>,
    pub result_clusters: Vec<Vec<u32>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReferencedCluster {
    pub algorithm: u32,
    pub id: String,
}

/// Encodes the algorithm set and per-failure clusters of `results`.
pub fn encode_clusters(results: &ClusterResults) -> Result<Vec<u8>> {
    let algorithms: Vec<String> = results.algorithms.iter().cloned().collect();
    let algorithm_index: HashMap<&str, u32> = algorithms
        .iter()
        .enumerate()
        .map(|(i, name)| (name.as_str(), i as u32))
        .collect();

    let mut referenced_clusters = Vec::new();
    let mut cluster_index: HashMap<&ClusterId, u32> = HashMap::new();
    let mut result_clusters = Vec::with_capacity(results.clusters.len());
    for clusters in &results.clusters {
        let mut refs = Vec::with_capacity(clusters.len());
        for cluster in clusters {
            let index = match cluster_index.get(cluster) {
                Some(index) => *index,
                None => {
                    let algorithm = *algorithm_index.get(cluster.algorithm.as_str()).ok_or_else(
                        || {
                            Error::validation(format!(
                                "cluster {cluster} uses unregistered algorithm"
                            ))
                        },
                    )?;
                    let index = referenced_clusters.len() as u32;
                    referenced_clusters.push(ReferencedCluster {
                        algorithm,
                        id: cluster.id.clone(),
                    });
                    cluster_index.insert(cluster, index);
                    index
                }
            };
            refs.push(index);
        }
        result_clusters.push(refs);
    }

    let encoded = ChunkClusters {
        algorithms,
        referenced_clusters,
        result_clusters,
    };
    Ok(bincode::serialize(&encoded)?)
}

/// Inverse of [`encode_clusters`].
pub fn decode_clusters(bytes: &[u8]) -> Result<(BTreeSet<String>, Vec<Vec<ClusterId>>)> {
    let encoded: ChunkClusters = bincode::deserialize(bytes)?;
    let referenced: Vec<ClusterId> = encoded
        .referenced_clusters
        .iter()
        .map(|cluster| {
            encoded
                .algorithms
                .get(cluster.algorithm as usize)
                .map(|algorithm| ClusterId::new(algorithm.clone(), cluster.id.clone()))
                .ok_or_else(|| {
                    Error::Corrupt(format!(
                        "cluster references algorithm {} of {}",
                        cluster.algorithm,
                        encoded.algorithms.len()
                    ))
                })
        })
        .collect::<Result<_>>()?;
    let clusters = encoded
        .result_clusters
        .iter()
        .map(|refs| {
            refs.iter()
                .map(|index| {
                    referenced.get(*index as usize).cloned().ok_or_else(|| {
                        Error::Corrupt(format!(
                            "failure references cluster {index} of {}",
                            referenced.len()
                        ))
                    })
                })
                .collect::<Result<Vec<_>>>()
        })
        .collect::<Result<Vec<_>>>()?;
    Ok((encoded.algorithms.into_iter().collect(), clusters))
}

/// Selects entries still stale relative to target versions, in
/// `(start_chunk_id, end_chunk_id]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadNextOptions {
    pub start_chunk_id: String,
    pub end_chunk_id: String,
    pub algorithms_version: i64,
    pub rules_version: OffsetDateTime,
}

#[derive(Debug, Clone)]
pub struct ClusteringStateStore {
    db: Arc<Database>,
}

impl ClusteringStateStore {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Inserts a new entry, returning its commit timestamp.
    pub fn create(&self, entry: &Entry) -> Result<OffsetDateTime> {
        entry.validate()?;
        let clusters = encode_clusters(&entry.clustering)?;
        let key = state_key(&entry.project, &entry.chunk_id);
        let (commit_time, ()) = self.db.transact(|db, commit_time| {
            let state_cf = db.cf(CF_STATE)?;
            if db.raw().get_pinned_cf(state_cf, &key)?.is_some() {
                return Err(Error::AlreadyExists(format!(
                    "state entry for project {} chunk {}",
                    entry.project, entry.chunk_id
                )));
            }
            let stored = StoredEntry {
                partition_time: entry.partition_time,
                object_id: entry.object_id.clone(),
                algorithms_version: entry.clustering.algorithms_version,
                rules_version: entry.clustering.rules_version,
                last_updated: commit_time,
            };
            let mut batch = WriteBatch::default();
            batch.put_cf(state_cf, &key, bincode::serialize(&stored)?);
            batch.put_cf(db.cf(CF_STATE_CLUSTERS)?, &key, &clusters);
            Ok((batch, ()))
        })?;
        debug!(project = %entry.project, chunk_id = %entry.chunk_id, "created state entry");
        Ok(commit_time)
    }

    pub fn read(&self, project: &str, chunk_id: &str) -> Result<Entry> {
        validate_project(project)?;
        validate_chunk_id(chunk_id)?;
        let key = state_key(project, chunk_id);
        let state_cf = self.db.cf(CF_STATE)?;
        let bytes = self.db.raw().get_cf(state_cf, &key)?.ok_or_else(|| {
            Error::not_found(format!("state entry for project {project} chunk {chunk_id}"))
        })?;
        let stored: StoredEntry = bincode::deserialize(&bytes)?;
        self.load_entry(project, chunk_id, &key, stored)
    }

    /// Replaces the clustering of `previous` if it has not been written since
    /// it was read, returning the new commit timestamp. Fails with
    /// [`Error::UpdateRace`] otherwise.
    pub fn update_clustering(
        &self,
        previous: &Entry,
        clustering: &ClusterResults,
    ) -> Result<OffsetDateTime> {
        validate_project(&previous.project)?;
        validate_chunk_id(&previous.chunk_id)?;
        model::validate_cluster_results(clustering)?;
        let expected = previous.last_updated.ok_or_else(|| {
            Error::validation("previous entry has not been created; use create")
        })?;
        let rewrite_clusters = !previous.clustering.same_clusters(clustering);
        let clusters = if rewrite_clusters {
            Some(encode_clusters(clustering)?)
        } else {
            None
        };
        let key = state_key(&previous.project, &previous.chunk_id);
        let (commit_time, ()) = self.db.transact(|db, commit_time| {
            let state_cf = db.cf(CF_STATE)?;
            let current = match db.raw().get_cf(state_cf, &key)? {
                Some(bytes) => bincode::deserialize::<StoredEntry>(&bytes)?,
                None => return Err(race(previous)),
            };
            if current.last_updated != expected {
                return Err(race(previous));
            }
            let stored = StoredEntry {
                algorithms_version: clustering.algorithms_version,
                rules_version: clustering.rules_version,
                last_updated: commit_time,
                ..current
            };
            let mut batch = WriteBatch::default();
            batch.put_cf(state_cf, &key, bincode::serialize(&stored)?);
            if let Some(clusters) = &clusters {
                batch.put_cf(db.cf(CF_STATE_CLUSTERS)?, &key, clusters);
            }
            Ok((batch, ()))
        })?;
        debug!(
            project = %previous.project,
            chunk_id = %previous.chunk_id,
            rewrite_clusters,
            "updated clustering"
        );
        Ok(commit_time)
    }

    /// Up to `n` stale entries in ascending chunk ID order.
    pub fn read_next_n(
        &self,
        project: &str,
        options: &ReadNextOptions,
        n: usize,
    ) -> Result<Vec<Entry>> {
        validate_project(project)?;
        let prefix = db::project_prefix(project);
        let start_key = state_key(project, &options.start_chunk_id);
        let state_cf = self.db.cf(CF_STATE)?;
        let iter = self
            .db
            .raw()
            .iterator_cf(state_cf, IteratorMode::From(&start_key, Direction::Forward));

        let mut stale = Vec::new();
        for item in iter {
            if stale.len() >= n {
                break;
            }
            let (key, value) = item?;
            let Some(chunk_id) = chunk_id_from_key(&prefix, &key)? else {
                break;
            };
            if chunk_id <= options.start_chunk_id.as_str() {
                continue;
            }
            if chunk_id > options.end_chunk_id.as_str() {
                break;
            }
            let stored: StoredEntry = bincode::deserialize(&value)?;
            if stored.algorithms_version < options.algorithms_version
                || stored.rules_version < options.rules_version
            {
                stale.push((chunk_id.to_string(), key.to_vec(), stored));
            }
        }

        stale
            .into_iter()
            .map(|(chunk_id, key, stored)| self.load_entry(project, &chunk_id, &key, stored))
            .collect()
    }

    /// Estimates how many chunks the project has from the ID of its 100th
    /// chunk. Returns 99 when there are fewer than 100.
    pub fn estimate_chunks(&self, project: &str) -> Result<i64> {
        validate_project(project)?;
        let prefix = db::project_prefix(project);
        let state_cf = self.db.cf(CF_STATE)?;
        let iter = self
            .db
            .raw()
            .iterator_cf(state_cf, IteratorMode::From(&prefix, Direction::Forward));
        let mut seen = 0usize;
        for item in iter {
            let (key, _) = item?;
            let Some(chunk_id) = chunk_id_from_key(&prefix, &key)? else {
                break;
            };
            seen += 1;
            if seen == ESTIMATE_SAMPLE_ROWS {
                return keyspace::estimate_chunks_from_id(chunk_id);
            }
        }
        Ok(ESTIMATE_SAMPLE_ROWS as i64 - 1)
    }

    fn load_entry(
        &self,
        project: &str,
        chunk_id: &str,
        key: &[u8],
        stored: StoredEntry,
    ) -> Result<Entry> {
        let clusters_cf = self.db.cf(CF_STATE_CLUSTERS)?;
        let bytes = self.db.raw().get_cf(clusters_cf, key)?.ok_or_else(|| {
            Error::Corrupt(format!(
                "clusters missing for project {project} chunk {chunk_id}"
            ))
        })?;
        let (algorithms, clusters) = decode_clusters(&bytes)?;
        Ok(Entry {
            project: project.to_string(),
            chunk_id: chunk_id.to_string(),
            partition_time: stored.partition_time,
            object_id: stored.object_id,
            clustering: ClusterResults {
                algorithms_version: stored.algorithms_version,
                rules_version: stored.rules_version,
                algorithms,
                clusters,
            },
            last_updated: Some(stored.last_updated),
        })
    }
}

fn race(entry: &Entry) -> Error {
    Error::UpdateRace {
        project: entry.project.clone(),
        chunk_id: entry.chunk_id.clone(),
    }
}

fn state_key(project: &str, chunk_id: &str) -> Vec<u8> {
    db::project_key(project, chunk_id.as_bytes())
}

/// The chunk ID of a state key, or `None` once past the project's keys.
fn chunk_id_from_key<'a>(prefix: &[u8], key: &'a [u8]) -> Result<Option<&'a str>> {
    match key.strip_prefix(prefix) {
        Some(suffix) => std::str::from_utf8(suffix)
            .map(Some)
            .map_err(|err| Error::Corrupt(format!("state key is not UTF-8: {err}"))),
        None => Ok(None),
    }
}
