//! Re-clustering shard tasks and the durable queue that delivers them.
//!
//! Tasks are written in the same batch as the run they belong to. A worker
//! leases a task, processes it, and either acks it (done, or failed
//! permanently) or releases it for redelivery.

use crate::db::{self, Database, CF_TASKS};
use crate::error::{Error, Result};
use crate::keyspace::ChunkRange;
use rocksdb::{IteratorMode, WriteBatch};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use time::{Duration, OffsetDateTime};
use tracing::debug;

/// Re-cluster the chunks of one shard of a run.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ReclusterChunks {
    pub project: String,
    /// Identifies the run; also the soft deadline for the task.
    pub attempt_time: OffsetDateTime,
    /// Exclusive; empty for the start of the table.
    pub start_chunk_id: String,
    /// Inclusive; may be the end-of-table sentinel.
    pub end_chunk_id: String,
}

impl ReclusterChunks {
    pub fn range(&self) -> ChunkRange {
        ChunkRange {
            start: self.start_chunk_id.clone(),
            end: self.end_chunk_id.clone(),
        }
    }

    fn key(&self) -> Vec<u8> {
        let mut key = db::encode_timestamp(self.attempt_time).to_vec();
        key.extend_from_slice(&db::project_key(&self.project, self.end_chunk_id.as_bytes()));
        key
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct TaskRecord {
    task: ReclusterChunks,
    leased_until: Option<OffsetDateTime>,
    deliveries: u32,
}

/// A task handed to a worker; ack or release it when done.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeasedTask {
    pub task: ReclusterChunks,
    pub leased_until: OffsetDateTime,
    /// 1 on first delivery.
    pub delivery: u32,
    key: Vec<u8>,
}

/// Adds `tasks` to `batch`.
pub(crate) fn enqueue_into(
    db: &Database,
    batch: &mut WriteBatch,
    tasks: &[ReclusterChunks],
) -> Result<()> {
    let cf = db.cf(CF_TASKS)?;
    for task in tasks {
        let record = TaskRecord {
            task: task.clone(),
            leased_until: None,
            deliveries: 0,
        };
        batch.put_cf(cf, task.key(), bincode::serialize(&record)?);
    }
    Ok(())
}

#[derive(Debug, Clone)]
pub struct TaskQueue {
    db: Arc<Database>,
}

impl TaskQueue {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Leases the oldest task that is not currently leased. A task runs
    /// until its attempt time, so the lease lasts at least until then plus
    /// `lease`.
    pub fn lease(&self, lease: Duration) -> Result<Option<LeasedTask>> {
        let (_, leased) = self.db.transact(|db, now| {
            let cf = db.cf(CF_TASKS)?;
            let mut batch = WriteBatch::default();
            for item in db.raw().iterator_cf(cf, IteratorMode::Start) {
                let (key, value) = item?;
                let mut record: TaskRecord = bincode::deserialize(&value)?;
                if record.leased_until.is_some_and(|until| until > now) {
                    continue;
                }
                let leased_until = (now + lease).max(record.task.attempt_time + lease);
                record.leased_until = Some(leased_until);
                record.deliveries += 1;
                batch.put_cf(cf, &key, bincode::serialize(&record)?);
                let leased = LeasedTask {
                    task: record.task,
                    leased_until,
                    delivery: record.deliveries,
                    key: key.to_vec(),
                };
                return Ok((batch, Some(leased)));
            }
            Ok((batch, None))
        })?;
        if let Some(task) = &leased {
            debug!(
                project = %task.task.project,
                end_chunk_id = %task.task.end_chunk_id,
                delivery = task.delivery,
                "leased task"
            );
        }
        Ok(leased)
    }

    /// Removes a finished task.
    pub fn ack(&self, leased: &LeasedTask) -> Result<()> {
        let cf = self.db.cf(CF_TASKS)?;
        self.db.raw().delete_cf(cf, &leased.key)?;
        Ok(())
    }

    /// Makes a task immediately available for redelivery.
    pub fn release(&self, leased: &LeasedTask) -> Result<()> {
        self.db.transact(|db, _| {
            let cf = db.cf(CF_TASKS)?;
            let mut batch = WriteBatch::default();
            let bytes = db.raw().get_cf(cf, &leased.key)?.ok_or_else(|| {
                Error::not_found(format!(
                    "task for project {} ending at {}",
                    leased.task.project, leased.task.end_chunk_id
                ))
            })?;
            let mut record: TaskRecord = bincode::deserialize(&bytes)?;
            record.leased_until = None;
            batch.put_cf(cf, &leased.key, bincode::serialize(&record)?);
            Ok((batch, ()))
        })?;
        Ok(())
    }

    /// Every queued task, leased or not, oldest first.
    pub fn pending(&self) -> Result<Vec<ReclusterChunks>> {
        let cf = self.db.cf(CF_TASKS)?;
        self.db
            .raw()
            .iterator_cf(cf, IteratorMode::Start)
            .map(|item| {
                let (_, value) = item?;
                let record: TaskRecord = bincode::deserialize(&value)?;
                Ok(record.task)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, ManualClock};
    use crate::keyspace::END_OF_TABLE;
    use tempfile::{tempdir, TempDir};
    use time::macros::datetime;

    fn open() -> (TempDir, ManualClock, Arc<Database>, TaskQueue) {
        let dir = tempdir().unwrap();
        let clock = ManualClock::new(datetime!(2030-01-01 0:00 UTC));
        let db = Arc::new(Database::open(dir.path(), Arc::new(clock.clone())).unwrap());
        (dir, clock, db.clone(), TaskQueue::new(db))
    }

    fn task(project: &str, minute: u8) -> ReclusterChunks {
        ReclusterChunks {
            project: project.to_string(),
            attempt_time: datetime!(2030-01-01 0:00 UTC) + Duration::minutes(minute.into()),
            start_chunk_id: String::new(),
            end_chunk_id: END_OF_TABLE.to_string(),
        }
    }

    fn enqueue(db: &Database, tasks: &[ReclusterChunks]) {
        let mut batch = WriteBatch::default();
        enqueue_into(db, &mut batch, tasks).unwrap();
        db.raw().write(batch).unwrap();
    }

    #[test]
    fn leases_oldest_first_and_skips_leased() {
        let (_dir, _clock, db, queue) = open();
        enqueue(&db, &[task("b", 10), task("a", 5)]);

        let first = queue.lease(Duration::minutes(1)).unwrap().unwrap();
        assert_eq!(first.task, task("a", 5));
        assert_eq!(first.delivery, 1);
        let second = queue.lease(Duration::minutes(1)).unwrap().unwrap();
        assert_eq!(second.task, task("b", 10));
        assert!(queue.lease(Duration::minutes(1)).unwrap().is_none());

        queue.ack(&first).unwrap();
        queue.ack(&second).unwrap();
        assert!(queue.pending().unwrap().is_empty());
    }

    #[test]
    fn expired_and_released_leases_redeliver() {
        let (_dir, clock, db, queue) = open();
        enqueue(&db, &[task("a", 5)]);

        let first = queue.lease(Duration::minutes(1)).unwrap().unwrap();
        clock.advance(Duration::minutes(7));
        let again = queue.lease(Duration::minutes(1)).unwrap().unwrap();
        assert_eq!(again.delivery, 2);

        queue.release(&again).unwrap();
        let third = queue.lease(Duration::minutes(1)).unwrap().unwrap();
        assert_eq!(third.delivery, 3);
        assert_eq!(third.task, first.task);
        assert_eq!(queue.pending().unwrap().len(), 1);
    }

    #[test]
    fn lease_covers_the_whole_attempt() {
        let (_dir, clock, db, queue) = open();
        enqueue(&db, &[task("a", 15)]);

        let first = queue.lease(Duration::minutes(1)).unwrap().unwrap();
        assert_eq!(first.leased_until, task("a", 15).attempt_time + Duration::minutes(1));

        // Still running well past the nominal lease.
        clock.advance(Duration::minutes(10));
        assert!(queue.lease(Duration::minutes(1)).unwrap().is_none());
        clock.advance(Duration::minutes(5));
        assert!(queue.lease(Duration::minutes(1)).unwrap().is_none());

        clock.advance(Duration::minutes(1));
        let again = queue.lease(Duration::minutes(1)).unwrap().unwrap();
        assert_eq!(again.delivery, 2);
        assert_eq!(again.leased_until, clock.now() + Duration::minutes(1));
    }
}
