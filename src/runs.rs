//! Re-clustering runs.
//!
//! A run records one scheduled attempt to bring a project's clustering up
//! to target algorithms and rules versions, together with the progress its
//! shards have reported. `progress` is the sum of the latest progress of
//! every shard that reported, so it ranges over `0..=1000 * shard_count`.

use crate::algorithms::ALGORITHMS_VERSION;
use crate::db::{self, Database, CF_RUNS};
use crate::error::{Error, Result};
use crate::keyspace::PROGRESS_COMPLETE;
use crate::model::{is_valid_project, validate_project};
use crate::rules::STARTING_EPOCH;
use crate::tasks::{self, ReclusterChunks};
use rocksdb::{Direction, IteratorMode, WriteBatch};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use time::OffsetDateTime;
use tracing::{debug, info};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReclusteringRun {
    pub project: String,
    /// End of the attempt's interval; tasks stop working at this time.
    pub attempt_timestamp: OffsetDateTime,
    pub algorithms_version: i64,
    pub rules_version: OffsetDateTime,
    pub shard_count: i64,
    pub shards_reported: i64,
    pub progress: i64,
    /// Latest progress reported by each shard, keyed by the shard's end
    /// chunk ID.
    #[serde(default)]
    pub shard_progress: BTreeMap<String, i64>,
}

impl ReclusteringRun {
    pub fn new(
        project: impl Into<String>,
        attempt_timestamp: OffsetDateTime,
        algorithms_version: i64,
        rules_version: OffsetDateTime,
        shard_count: i64,
    ) -> Self {
        Self {
            project: project.into(),
            attempt_timestamp,
            algorithms_version,
            rules_version,
            shard_count,
            shards_reported: 0,
            progress: 0,
            shard_progress: BTreeMap::new(),
        }
    }

    /// The run returned for projects that have never been re-clustered. It
    /// is complete, so the first real run targets the latest versions.
    pub fn starting(project: &str) -> Self {
        Self {
            project: project.to_string(),
            attempt_timestamp: STARTING_EPOCH,
            algorithms_version: 1,
            rules_version: STARTING_EPOCH,
            shard_count: 1,
            shards_reported: 1,
            progress: PROGRESS_COMPLETE,
            shard_progress: BTreeMap::new(),
        }
    }

    /// Progress over the whole run, 0 to 1000. Only meaningful once every
    /// shard has reported.
    pub fn progress_per_mille(&self) -> i64 {
        if self.shard_count <= 0 {
            return 0;
        }
        self.progress / self.shard_count
    }

    pub fn all_shards_reported(&self) -> bool {
        self.shards_reported == self.shard_count
    }

    pub fn is_complete(&self) -> bool {
        self.progress == PROGRESS_COMPLETE * self.shard_count
    }

    pub fn validate(&self) -> Result<()> {
        if !is_valid_project(&self.project) {
            return Err(Error::validation("project must be valid"));
        }
        if self.attempt_timestamp <= STARTING_EPOCH {
            return Err(Error::validation("attempt timestamp must be set"));
        }
        if self.algorithms_version <= 0 {
            return Err(Error::validation("algorithms version must be valid"));
        }
        if self.rules_version < STARTING_EPOCH {
            return Err(Error::validation("rules version must be valid"));
        }
        if self.shard_count <= 0 {
            return Err(Error::validation("shard count must be valid"));
        }
        if self.shards_reported < 0 || self.shards_reported > self.shard_count {
            return Err(Error::validation("shards reported must be valid"));
        }
        if self.progress < 0 || self.progress > PROGRESS_COMPLETE * self.shard_count {
            return Err(Error::validation("progress must be valid"));
        }
        Ok(())
    }
}

/// How far a project's clustering has caught up with its rules and
/// algorithms.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReclusteringProgress {
    pub project: String,
    /// Per-mille progress of the latest run all shards have reported on.
    pub progress_per_mille: i64,
    pub last: ReclusteringRun,
    pub last_with_progress: ReclusteringRun,
    pub last_completed: ReclusteringRun,
}

impl ReclusteringProgress {
    /// True if every chunk has been clustered with at least `rules_version`.
    pub fn incorporates_rules_version(&self, rules_version: OffsetDateTime) -> bool {
        self.last_completed.rules_version >= rules_version
    }

    /// True if every chunk has been clustered with the current algorithms.
    pub fn incorporates_latest_algorithms(&self) -> bool {
        self.last_completed.algorithms_version >= ALGORITHMS_VERSION
    }

    pub fn is_reclustering(&self) -> bool {
        !self.last.is_complete()
    }
}

#[derive(Debug, Clone)]
pub struct RunStore {
    db: Arc<Database>,
}

impl RunStore {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    pub fn create(&self, run: &ReclusteringRun) -> Result<()> {
        self.create_with_tasks(run, &[])
    }

    /// Creates `run` and enqueues `tasks` atomically.
    pub fn create_with_tasks(&self, run: &ReclusteringRun, tasks: &[ReclusterChunks]) -> Result<()> {
        run.validate()?;
        for task in tasks {
            if task.project != run.project || task.attempt_time != run.attempt_timestamp {
                return Err(Error::validation(format!(
                    "task for {} at {} does not belong to run for {} at {}",
                    task.project, task.attempt_time, run.project, run.attempt_timestamp
                )));
            }
        }
        let key = run_key(&run.project, run.attempt_timestamp);
        self.db.transact(|db, _| {
            let cf = db.cf(CF_RUNS)?;
            if db.raw().get_pinned_cf(cf, &key)?.is_some() {
                return Err(Error::AlreadyExists(format!(
                    "run for project {} at {}",
                    run.project, run.attempt_timestamp
                )));
            }
            let mut batch = WriteBatch::default();
            batch.put_cf(cf, &key, bincode::serialize(run)?);
            tasks::enqueue_into(db, &mut batch, tasks)?;
            Ok((batch, ()))
        })?;
        info!(
            project = %run.project,
            attempt = %run.attempt_timestamp,
            shards = run.shard_count,
            tasks = tasks.len(),
            "created reclustering run"
        );
        Ok(())
    }

    pub fn read(&self, project: &str, attempt_timestamp: OffsetDateTime) -> Result<ReclusteringRun> {
        validate_project(project)?;
        let cf = self.db.cf(CF_RUNS)?;
        let bytes = self
            .db
            .raw()
            .get_cf(cf, run_key(project, attempt_timestamp))?
            .ok_or_else(|| {
                Error::not_found(format!(
                    "reclustering run for project {project} at {attempt_timestamp}"
                ))
            })?;
        Ok(bincode::deserialize(&bytes)?)
    }

    /// The most recent run, or [`ReclusteringRun::starting`] if none.
    pub fn read_last(&self, project: &str) -> Result<ReclusteringRun> {
        self.read_last_where(project, |_| true)
    }

    /// The most recent run every shard has reported progress on.
    pub fn read_last_with_progress(&self, project: &str) -> Result<ReclusteringRun> {
        self.read_last_where(project, ReclusteringRun::all_shards_reported)
    }

    /// The most recent run that finished.
    pub fn read_last_complete(&self, project: &str) -> Result<ReclusteringRun> {
        self.read_last_where(project, ReclusteringRun::is_complete)
    }

    pub fn read_reclustering_progress(&self, project: &str) -> Result<ReclusteringProgress> {
        let last = self.read_last(project)?;
        let last_with_progress = self.read_last_with_progress(project)?;
        let last_completed = self.read_last_complete(project)?;
        Ok(ReclusteringProgress {
            project: project.to_string(),
            progress_per_mille: last_with_progress.progress_per_mille(),
            last,
            last_with_progress,
            last_completed,
        })
    }

    /// A handle for one shard of a run to report its progress through.
    pub fn progress_token(&self, task: &ReclusterChunks) -> ProgressToken {
        ProgressToken {
            store: self.clone(),
            project: task.project.clone(),
            attempt_timestamp: task.attempt_time,
            shard: task.end_chunk_id.clone(),
        }
    }

    fn report_progress(
        &self,
        project: &str,
        attempt_timestamp: OffsetDateTime,
        shard: &str,
        value: i64,
    ) -> Result<ReclusteringRun> {
        if !(0..=PROGRESS_COMPLETE).contains(&value) {
            return Err(Error::validation(format!(
                "progress value {value} must be between 0 and {PROGRESS_COMPLETE}"
            )));
        }
        let key = run_key(project, attempt_timestamp);
        let (_, run) = self.db.transact(|db, _| {
            let cf = db.cf(CF_RUNS)?;
            let mut run: ReclusteringRun = match db.raw().get_cf(cf, &key)? {
                Some(bytes) => bincode::deserialize(&bytes)?,
                None => {
                    return Err(Error::not_found(format!(
                        "reclustering run for project {project} at {attempt_timestamp}"
                    )))
                }
            };
            let mut batch = WriteBatch::default();
            let previous = run.shard_progress.get(shard).copied();
            if previous.is_some_and(|p| p >= value) {
                return Ok((batch, run));
            }
            if previous.is_none() {
                run.shards_reported += 1;
            }
            run.progress += value - previous.unwrap_or(0);
            run.shard_progress.insert(shard.to_string(), value);
            run.validate()?;
            batch.put_cf(cf, &key, bincode::serialize(&run)?);
            Ok((batch, run))
        })?;
        debug!(
            project,
            shard,
            value,
            run_progress = run.progress,
            shards_reported = run.shards_reported,
            "reported progress"
        );
        Ok(run)
    }

    fn read_last_where(
        &self,
        project: &str,
        keep: impl Fn(&ReclusteringRun) -> bool,
    ) -> Result<ReclusteringRun> {
        validate_project(project)?;
        let cf = self.db.cf(CF_RUNS)?;
        let prefix = db::project_prefix(project);
        let upper = db::project_key(project, &[0xff; 17]);
        let iter = self
            .db
            .raw()
            .iterator_cf(cf, IteratorMode::From(&upper, Direction::Reverse));
        for item in iter {
            let (key, value) = item?;
            if !key.starts_with(&prefix) {
                break;
            }
            let run: ReclusteringRun = bincode::deserialize(&value)?;
            if keep(&run) {
                return Ok(run);
            }
        }
        Ok(ReclusteringRun::starting(project))
    }
}

/// Reports the progress of one shard. Reports never lower a shard's
/// progress; the first report from a shard counts it as reported.
#[derive(Debug, Clone)]
pub struct ProgressToken {
    store: RunStore,
    project: String,
    attempt_timestamp: OffsetDateTime,
    shard: String,
}

impl ProgressToken {
    pub fn report_progress(&self, value: i64) -> Result<ReclusteringRun> {
        self.store
            .report_progress(&self.project, self.attempt_timestamp, &self.shard, value)
    }
}

fn run_key(project: &str, attempt_timestamp: OffsetDateTime) -> Vec<u8> {
    db::project_key(project, &db::encode_timestamp(attempt_timestamp))
}
