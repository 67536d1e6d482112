//! Re-clustering worker.
//!
//! Executes one shard task: walks the stale chunks of its range in chunk ID
//! order, re-clusters each, and reports progress until the shard is drained
//! or the task's attempt time passes.

use crate::algorithms::AlgorithmSet;
use crate::analysis::AnalysisSink;
use crate::chunkstore::ChunkStore;
use crate::clock::Clock;
use crate::error::{Error, Result};
use crate::keyspace::{calculate_progress, PROGRESS_COMPLETE};
use crate::rules::RulesetCache;
use crate::runs::RunStore;
use crate::state::{ClusteringStateStore, ReadNextOptions};
use crate::tasks::{ReclusterChunks, TaskQueue};
use crate::update::{UpdateOutcome, Updater};
use rand::Rng;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: std::time::Duration,
    pub max_backoff: std::time::Duration,
}

impl RetryPolicy {
    /// Exponential backoff for the given 1-based attempt, capped, plus up to
    /// 50% random jitter.
    pub fn backoff(&self, attempt: u32) -> std::time::Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        let base = self
            .initial_backoff
            .saturating_mul(1 << exponent)
            .min(self.max_backoff);
        let jitter_ms = (base.as_millis() as u64) / 2;
        let jitter = if jitter_ms == 0 {
            0
        } else {
            rand::rng().random_range(0..=jitter_ms)
        };
        base + std::time::Duration::from_millis(jitter)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerConfig {
    pub batch_size: usize,
    pub retry: RetryPolicy,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome {
    /// Every chunk in the range is up to date.
    Completed,
    /// The attempt time passed; `current_chunk_id` is the last chunk done.
    DeadlineReached { current_chunk_id: String },
}

pub struct Worker {
    config: WorkerConfig,
    runs: RunStore,
    state: ClusteringStateStore,
    chunks: Arc<dyn ChunkStore>,
    rulesets: Arc<RulesetCache>,
    updater: Updater,
    default_algorithms: Arc<AlgorithmSet>,
    project_algorithms: HashMap<String, Arc<AlgorithmSet>>,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("config", &self.config)
            .field("projects", &self.project_algorithms.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

impl Worker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: WorkerConfig,
        runs: RunStore,
        state: ClusteringStateStore,
        chunks: Arc<dyn ChunkStore>,
        rulesets: Arc<RulesetCache>,
        sink: Arc<dyn AnalysisSink>,
        default_algorithms: AlgorithmSet,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let updater = Updater::new(state.clone(), sink);
        Self {
            config,
            runs,
            state,
            chunks,
            rulesets,
            updater,
            default_algorithms: Arc::new(default_algorithms),
            project_algorithms: HashMap::new(),
            clock,
        }
    }

    /// Uses `algorithms` instead of the default set for `project`.
    pub fn with_project_algorithms(mut self, project: &str, algorithms: AlgorithmSet) -> Self {
        self.project_algorithms
            .insert(project.to_string(), Arc::new(algorithms));
        self
    }

    fn algorithms_for(&self, project: &str) -> &AlgorithmSet {
        self.project_algorithms
            .get(project)
            .unwrap_or(&self.default_algorithms)
    }

    /// Runs one task invocation. An [`Error::UpdateRace`] aborts the
    /// invocation; calling again resumes after the chunks already done.
    #[instrument(skip(self, task), fields(project = %task.project, end = %task.end_chunk_id))]
    pub fn do_task(&self, task: &ReclusterChunks) -> Result<TaskOutcome> {
        let run = self.runs.read(&task.project, task.attempt_time)?;
        let algorithms = self.algorithms_for(&task.project);
        if run.algorithms_version > algorithms.version() {
            return Err(Error::validation(format!(
                "run targets algorithms version {} but this worker runs version {}",
                run.algorithms_version,
                algorithms.version()
            )));
        }
        let token = self.runs.progress_token(task);
        let mut current = task.start_chunk_id.clone();

        while self.clock.now() < task.attempt_time {
            let options = ReadNextOptions {
                start_chunk_id: current.clone(),
                end_chunk_id: task.end_chunk_id.clone(),
                algorithms_version: run.algorithms_version,
                rules_version: run.rules_version,
            };
            let entries = self
                .state
                .read_next_n(&task.project, &options, self.config.batch_size)?;
            if entries.is_empty() {
                token.report_progress(PROGRESS_COMPLETE)?;
                info!("shard complete");
                return Ok(TaskOutcome::Completed);
            }

            for entry in entries {
                if self.clock.now() >= task.attempt_time {
                    break;
                }
                let progress =
                    calculate_progress(&task.start_chunk_id, &task.end_chunk_id, &entry.chunk_id)?;
                token.report_progress(progress)?;

                let chunk = self.chunks.get(&task.project, &entry.object_id)?;
                // Another writer may have clustered the chunk with rules
                // newer than the cached ruleset.
                let min_rules_version = run.rules_version.max(entry.clustering.rules_version);
                let ruleset = self
                    .rulesets
                    .ruleset_at_least(&task.project, min_rules_version)?;
                let outcome = self.updater.update(algorithms, &ruleset, &chunk, &entry)?;
                if outcome == UpdateOutcome::Skipped {
                    debug!(chunk_id = %entry.chunk_id, "chunk already newer than target");
                }
                current = entry.chunk_id;
            }
        }

        info!(current_chunk_id = %current, "attempt time reached");
        Ok(TaskOutcome::DeadlineReached {
            current_chunk_id: current,
        })
    }

    /// [`Worker::do_task`], retried with backoff while it fails transiently.
    pub fn do_task_with_retry(&self, task: &ReclusterChunks) -> Result<TaskOutcome> {
        let mut attempt = 1;
        loop {
            match self.do_task(task) {
                Err(err) if err.is_transient() && attempt < self.config.retry.max_attempts => {
                    let backoff = self.config.retry.backoff(attempt);
                    warn!(
                        project = %task.project,
                        attempt,
                        backoff_ms = backoff.as_millis() as u64,
                        error = %err,
                        "transient failure, retrying task"
                    );
                    std::thread::sleep(backoff);
                    attempt += 1;
                }
                result => return result,
            }
        }
    }

    /// Leases and runs the next queued task. Returns `Ok(None)` if the queue
    /// is empty. Failed tasks are released for redelivery until their
    /// attempt time passes, after which they are dropped.
    pub fn process_next(
        &self,
        queue: &TaskQueue,
        lease: time::Duration,
    ) -> Result<Option<TaskOutcome>> {
        let Some(leased) = queue.lease(lease)? else {
            return Ok(None);
        };
        match self.do_task_with_retry(&leased.task) {
            Ok(outcome) => {
                queue.ack(&leased)?;
                Ok(Some(outcome))
            }
            Err(err) => {
                if self.clock.now() >= leased.task.attempt_time {
                    warn!(project = %leased.task.project, error = %err, "dropping expired task");
                    queue.ack(&leased)?;
                } else {
                    queue.release(&leased)?;
                }
                Err(err)
            }
        }
    }
}
