//! RocksDB handle shared by every store.
//!
//! Each store owns a column family. Writes that depend on a prior read go
//! through [`Database::transact`], which serializes them and stamps each
//! commit with a strictly increasing timestamp.

use crate::clock::Clock;
use crate::error::{Error, Result};
use parking_lot::Mutex;
use rocksdb::{
    checkpoint::Checkpoint, ColumnFamily, ColumnFamilyDescriptor, Options, WriteBatch, DB,
};
use std::path::Path;
use std::sync::Arc;
use time::{Duration, OffsetDateTime};
use tracing::info;

pub(crate) const CF_STATE: &str = "state";
pub(crate) const CF_STATE_CLUSTERS: &str = "state_clusters";
pub(crate) const CF_RUNS: &str = "runs";
pub(crate) const CF_RULES: &str = "rules";
pub(crate) const CF_CHUNKS: &str = "chunks";
pub(crate) const CF_TASKS: &str = "tasks";
pub(crate) const CF_METADATA: &str = "metadata";

const KEY_MANIFEST: &[u8] = b"manifest";

const STORAGE_FORMAT_VERSION: u32 = 1;

#[derive(Debug, serde::Serialize, serde::Deserialize)]
struct StorageManifest {
    format_version: u32,
    app_version: String,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct OpenOptions {
    pub repair: bool,
}

pub struct Database {
    db: DB,
    clock: Arc<dyn Clock>,
    last_commit: Mutex<OffsetDateTime>,
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("path", &self.db.path())
            .finish_non_exhaustive()
    }
}

impl Database {
    pub fn open(path: impl AsRef<Path>, clock: Arc<dyn Clock>) -> Result<Self> {
        Self::open_with_options(path, clock, OpenOptions::default())
    }

    pub fn open_with_options(
        path: impl AsRef<Path>,
        clock: Arc<dyn Clock>,
        options: OpenOptions,
    ) -> Result<Self> {
        if options.repair {
            repair_db(path.as_ref())?;
        }
        let db = open_db(path.as_ref())?;
        validate_or_init_manifest(&db)?;
        info!(path = %path.as_ref().display(), "opened clustering database");
        Ok(Self {
            db,
            clock,
            last_commit: Mutex::new(OffsetDateTime::UNIX_EPOCH),
        })
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub(crate) fn raw(&self) -> &DB {
        &self.db
    }

    pub(crate) fn cf(&self, name: &str) -> Result<&ColumnFamily> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| Error::Corrupt(format!("missing {name} column family")))
    }

    /// Runs a read-modify-write transaction. `f` sees the commit timestamp
    /// the batch will be written at; no other transaction commits between
    /// its reads and the write of the batch it returns.
    pub(crate) fn transact<T>(
        &self,
        f: impl FnOnce(&Self, OffsetDateTime) -> Result<(WriteBatch, T)>,
    ) -> Result<(OffsetDateTime, T)> {
        let mut last_commit = self.last_commit.lock();
        let commit_time = next_commit_time(self.clock.now(), *last_commit);
        let (batch, value) = f(self, commit_time)?;
        if !batch.is_empty() {
            self.db.write(batch)?;
        }
        *last_commit = commit_time;
        Ok((commit_time, value))
    }

    pub fn checkpoint(&self, path: impl AsRef<Path>) -> Result<()> {
        let checkpoint = Checkpoint::new(&self.db)?;
        checkpoint.create_checkpoint(path)?;
        Ok(())
    }

    pub fn flush(&self) -> Result<()> {
        self.db.flush()?;
        Ok(())
    }
}

/// Commit timestamps have microsecond precision and strictly increase.
fn next_commit_time(now: OffsetDateTime, last: OffsetDateTime) -> OffsetDateTime {
    let micros = now.unix_timestamp_nanos() / 1_000 * 1_000;
    let now = OffsetDateTime::from_unix_timestamp_nanos(micros).unwrap_or(now);
    if now > last {
        now
    } else {
        last + Duration::microseconds(1)
    }
}

/// Order-preserving key encoding of a timestamp.
pub(crate) fn encode_timestamp(t: OffsetDateTime) -> [u8; 16] {
    let nanos = t.unix_timestamp_nanos() as u128 ^ (1u128 << 127);
    nanos.to_be_bytes()
}

pub(crate) fn decode_timestamp(bytes: &[u8]) -> Result<OffsetDateTime> {
    let raw: [u8; 16] = bytes
        .try_into()
        .map_err(|_| Error::Corrupt(format!("timestamp key has {} bytes", bytes.len())))?;
    let nanos = (u128::from_be_bytes(raw) ^ (1u128 << 127)) as i128;
    OffsetDateTime::from_unix_timestamp_nanos(nanos)
        .map_err(|err| Error::Corrupt(format!("timestamp out of range: {err}")))
}

/// `project\0` key prefix; project names never contain NUL.
pub(crate) fn project_prefix(project: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(project.len() + 1);
    key.extend_from_slice(project.as_bytes());
    key.push(0);
    key
}

pub(crate) fn project_key(project: &str, suffix: &[u8]) -> Vec<u8> {
    let mut key = project_prefix(project);
    key.extend_from_slice(suffix);
    key
}

fn open_db(path: &Path) -> Result<DB> {
    let mut options = Options::default();
    options.create_if_missing(true);
    options.create_missing_column_families(true);
    options.set_paranoid_checks(true);
    let cfs = vec![
        ColumnFamilyDescriptor::new(CF_STATE, Options::default()),
        ColumnFamilyDescriptor::new(CF_STATE_CLUSTERS, Options::default()),
        ColumnFamilyDescriptor::new(CF_RUNS, Options::default()),
        ColumnFamilyDescriptor::new(CF_RULES, Options::default()),
        ColumnFamilyDescriptor::new(CF_CHUNKS, Options::default()),
        ColumnFamilyDescriptor::new(CF_TASKS, Options::default()),
        ColumnFamilyDescriptor::new(CF_METADATA, Options::default()),
    ];
    Ok(DB::open_cf_descriptors(&options, path, cfs)?)
}

fn repair_db(path: &Path) -> Result<()> {
    let mut options = Options::default();
    options.create_if_missing(true);
    DB::repair(&options, path)?;
    Ok(())
}

fn validate_or_init_manifest(db: &DB) -> Result<()> {
    let metadata_cf = db
        .cf_handle(CF_METADATA)
        .ok_or_else(|| Error::Corrupt("missing metadata column family".to_string()))?;
    if let Some(bytes) = db.get_cf(metadata_cf, KEY_MANIFEST)? {
        let manifest: StorageManifest = bincode::deserialize(&bytes)?;
        if manifest.format_version != STORAGE_FORMAT_VERSION {
            return Err(Error::Corrupt(format!(
                "storage format version mismatch: expected {}, found {}",
                STORAGE_FORMAT_VERSION, manifest.format_version
            )));
        }
        return Ok(());
    }

    let manifest = StorageManifest {
        format_version: STORAGE_FORMAT_VERSION,
        app_version: env!("CARGO_PKG_VERSION").to_string(),
    };
    let bytes = bincode::serialize(&manifest)?;
    db.put_cf(metadata_cf, KEY_MANIFEST, bytes)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use tempfile::tempdir;
    use time::macros::datetime;

    #[test]
    fn commit_times_strictly_increase_under_a_frozen_clock() {
        let dir = tempdir().unwrap();
        let clock = ManualClock::new(datetime!(2030-01-01 0:00 UTC));
        let db = Database::open(dir.path(), Arc::new(clock)).unwrap();
        let (first, _) = db.transact(|_, _| Ok((WriteBatch::default(), ()))).unwrap();
        let (second, _) = db.transact(|_, _| Ok((WriteBatch::default(), ()))).unwrap();
        assert_eq!(first, datetime!(2030-01-01 0:00 UTC));
        assert!(second > first);
    }

    #[test]
    fn failed_transaction_writes_nothing() {
        let dir = tempdir().unwrap();
        let clock = ManualClock::new(datetime!(2030-01-01 0:00 UTC));
        let db = Database::open(dir.path(), Arc::new(clock)).unwrap();
        let result: Result<(OffsetDateTime, ())> = db.transact(|db, _| {
            let mut batch = WriteBatch::default();
            batch.put_cf(db.cf(CF_RULES)?, b"k", b"v");
            Err(Error::validation("abort"))
        });
        assert!(result.is_err());
        let cf = db.cf(CF_RULES).unwrap();
        assert!(db.raw().get_cf(cf, b"k").unwrap().is_none());
    }

    #[test]
    fn timestamp_keys_sort_chronologically() {
        let early = encode_timestamp(datetime!(1900-01-01 0:00 UTC));
        let epoch = encode_timestamp(OffsetDateTime::UNIX_EPOCH);
        let late = encode_timestamp(datetime!(2030-01-01 0:00 UTC));
        assert!(early < epoch && epoch < late);
        assert_eq!(
            decode_timestamp(&early).unwrap(),
            datetime!(1900-01-01 0:00 UTC)
        );
    }

    #[test]
    fn reopen_keeps_manifest() {
        let dir = tempdir().unwrap();
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::new(datetime!(2030-01-01 0:00 UTC)));
        drop(Database::open(dir.path(), clock.clone()).unwrap());
        Database::open(dir.path(), clock).unwrap();
    }
}
