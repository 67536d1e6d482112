//! Re-clustering orchestrator.
//!
//! Invoked once a minute. On minutes that start an interval it schedules,
//! for every configured project, a run covering the next interval and one
//! task per shard of the chunk keyspace:
//!
//! ```text
//!   attempt_start            attempt_end (= run attempt_timestamp)
//!        |<------ interval ------>|
//!   now -^  tasks work until attempt_end, then stop
//! ```
//!
//! A run targets the latest algorithms and rules versions only if the
//! previous run finished; otherwise it keeps the previous targets so that
//! work converges instead of chasing a moving version.

use crate::algorithms::ALGORITHMS_VERSION;
use crate::clock::{self, Clock};
use crate::error::{Error, MultiError, Result};
use crate::keyspace::shard_ranges;
use crate::rules::RuleStore;
use crate::runs::{ReclusteringRun, RunStore};
use crate::state::ClusteringStateStore;
use crate::tasks::ReclusterChunks;
use std::sync::Arc;
use time::{Duration, OffsetDateTime};
use tracing::{error, info, instrument, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OrchestratorConfig {
    /// Total shards that may run concurrently across all projects.
    pub workers: i64,
    pub interval: Duration,
    /// Target chunks per shard.
    pub rows_per_shard: i64,
}

pub struct Orchestrator {
    projects: Vec<String>,
    config: OrchestratorConfig,
    runs: RunStore,
    state: ClusteringStateStore,
    rules: RuleStore,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("projects", &self.projects)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Orchestrator {
    pub fn new(
        mut projects: Vec<String>,
        config: OrchestratorConfig,
        runs: RunStore,
        state: ClusteringStateStore,
        rules: RuleStore,
        clock: Arc<dyn Clock>,
    ) -> Self {
        projects.sort();
        projects.dedup();
        Self {
            projects,
            config,
            runs,
            state,
            rules,
            clock,
        }
    }

    /// Schedules the next interval's runs if now is an interval boundary.
    /// Failures of individual projects do not stop the others and are
    /// returned together.
    pub fn run_once(&self) -> Result<Vec<ReclusteringRun>> {
        if self.config.workers <= 0 || self.config.interval <= Duration::ZERO {
            warn!(
                workers = self.config.workers,
                interval = %self.config.interval,
                "reclustering disabled"
            );
            return Ok(Vec::new());
        }
        let now = self.clock.now();
        let attempt_start = clock::truncate(now, self.config.interval);
        if attempt_start != clock::truncate(now, Duration::MINUTE) {
            info!(now = %now, "not at an interval boundary, nothing to schedule");
            return Ok(Vec::new());
        }
        let attempt_end = attempt_start + self.config.interval;

        let mut errors = MultiError::default();
        let mut estimates = Vec::with_capacity(self.projects.len());
        for project in &self.projects {
            match self.state.estimate_chunks(project) {
                Ok(estimate) => estimates.push((project.as_str(), estimate)),
                Err(err) => {
                    error!(project = %project, error = %err, "estimating chunks failed");
                    errors.push(err);
                }
            }
        }
        let chunk_counts: Vec<i64> = estimates.iter().map(|(_, estimate)| *estimate).collect();
        let worker_counts = match project_worker_counts(&chunk_counts, self.config.workers) {
            Ok(counts) => counts,
            Err(err) => {
                error!(error = %err, "allocating workers failed");
                errors.push(err);
                return Err(Error::Multi(errors));
            }
        };

        let mut scheduled = Vec::new();
        for ((project, estimate), workers) in estimates.into_iter().zip(worker_counts) {
            match self.schedule_project(project, attempt_start, attempt_end, estimate, workers) {
                Ok(run) => scheduled.push(run),
                Err(err) => {
                    error!(project, error = %err, "scheduling reclustering failed");
                    errors.push(err);
                }
            }
        }
        errors.into_result()?;
        Ok(scheduled)
    }

    #[instrument(skip(self), fields(attempt = %attempt_end))]
    fn schedule_project(
        &self,
        project: &str,
        attempt_start: OffsetDateTime,
        attempt_end: OffsetDateTime,
        estimated_chunks: i64,
        workers: i64,
    ) -> Result<ReclusteringRun> {
        let last = self.runs.read_last(project)?;
        if last.attempt_timestamp > attempt_start {
            return Err(Error::Overlap {
                project: project.to_string(),
                last_attempt: last.attempt_timestamp.to_string(),
                proposed_start: attempt_start.to_string(),
            });
        }

        let (algorithms_version, rules_version) = if last.is_complete() {
            (ALGORITHMS_VERSION, self.rules.read_last_updated(project)?)
        } else {
            (last.algorithms_version, last.rules_version)
        };

        let shard_count = shard_count(estimated_chunks, self.config.rows_per_shard, workers);
        let run = ReclusteringRun::new(
            project,
            attempt_end,
            algorithms_version,
            rules_version,
            shard_count,
        );
        let tasks: Vec<ReclusterChunks> = shard_ranges(shard_count as usize)?
            .into_iter()
            .map(|range| ReclusterChunks {
                project: project.to_string(),
                attempt_time: attempt_end,
                start_chunk_id: range.start,
                end_chunk_id: range.end,
            })
            .collect();
        self.runs.create_with_tasks(&run, &tasks)?;
        info!(
            project,
            shards = shard_count,
            estimated_chunks,
            algorithms_version,
            rules_version = %rules_version,
            "scheduled reclustering"
        );
        Ok(run)
    }
}

/// `ceil(estimate / rows_per_shard)`, at least 1 and at most `workers`.
pub fn shard_count(estimated_chunks: i64, rows_per_shard: i64, workers: i64) -> i64 {
    let rows_per_shard = rows_per_shard.max(1);
    let wanted = (estimated_chunks.max(0) + rows_per_shard - 1) / rows_per_shard;
    wanted.min(workers).max(1)
}

/// Splits `workers` between projects: one each, plus a share of the rest
/// proportional to each project's chunk count.
pub fn project_worker_counts(chunk_counts: &[i64], workers: i64) -> Result<Vec<i64>> {
    let projects = chunk_counts.len() as i64;
    if projects > workers {
        return Err(Error::validation(format!(
            "more projects configured for reclustering ({projects}) than workers available ({workers})"
        )));
    }
    let total: i128 = chunk_counts.iter().map(|c| *c.max(&0) as i128).sum();
    let remaining = (workers - projects) as i128;
    Ok(chunk_counts
        .iter()
        .map(|count| {
            let share = if total == 0 {
                0
            } else {
                remaining * (*count.max(&0) as i128) / total
            };
            1 + share as i64
        })
        .collect())
}
