use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use reclust_rs::algorithms::{Algorithm, TestNameAlgorithm};
use reclust_rs::analysis::RecordingSink;
use reclust_rs::model::ClusterResults;
use reclust_rs::rules::{generate_id, BugId, Ruleset};
use reclust_rs::test_support::{chunk_id_for, generate_chunk};
use reclust_rs::worker::RetryPolicy;
use reclust_rs::{
    AlgorithmSet, Chunk, ChunkStore, ClusteringStateStore, Database, Entry,
    FailureAssociationRule, ManualClock, Orchestrator, OrchestratorConfig, PersistentChunkStore,
    RuleStore, RulesetCache, RunStore, TaskQueue, Updater, Worker, WorkerConfig,
};
use tempfile::TempDir;
use time::macros::datetime;
use time::{Duration, OffsetDateTime};

#[allow(dead_code)]
pub const PROJECT: &str = "testproject";

#[allow(dead_code)]
pub const START: OffsetDateTime = datetime!(2030-01-01 0:00 UTC);

/// Algorithms of an older release, so freshly ingested chunks are stale.
#[allow(dead_code)]
pub fn old_algorithms() -> AlgorithmSet {
    AlgorithmSet::with_algorithms(
        1,
        vec![Algorithm::TestName {
            name: "testname-v1".to_string(),
            algorithm: TestNameAlgorithm::new(&[]).unwrap(),
        }],
    )
}

#[allow(dead_code)]
pub fn orchestrator_config() -> OrchestratorConfig {
    OrchestratorConfig {
        workers: 4,
        interval: Duration::minutes(5),
        rows_per_shard: 10,
    }
}

#[allow(dead_code)]
pub fn worker_config() -> WorkerConfig {
    WorkerConfig {
        batch_size: 4,
        retry: RetryPolicy {
            max_attempts: 3,
            initial_backoff: std::time::Duration::from_millis(1),
            max_backoff: std::time::Duration::from_millis(5),
        },
    }
}

/// Everything a reclustering deployment needs, over one temporary database
/// and a manual clock starting at [`START`].
#[allow(dead_code)]
pub struct Harness {
    pub clock: ManualClock,
    pub db: Arc<Database>,
    pub state: ClusteringStateStore,
    pub runs: RunStore,
    pub rules: RuleStore,
    pub chunks: PersistentChunkStore,
    pub queue: TaskQueue,
    pub sink: Arc<RecordingSink>,
    pub dir: TempDir,
}

#[allow(dead_code)]
impl Harness {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let clock = ManualClock::new(START);
        let db = Arc::new(Database::open(dir.path(), Arc::new(clock.clone())).unwrap());
        Self {
            clock,
            state: ClusteringStateStore::new(db.clone()),
            runs: RunStore::new(db.clone()),
            rules: RuleStore::new(db.clone()),
            chunks: PersistentChunkStore::new(db.clone()),
            queue: TaskQueue::new(db.clone()),
            sink: Arc::new(RecordingSink::new()),
            db,
            dir,
        }
    }

    /// Stores `count` chunks of five failures and clusters them with
    /// [`old_algorithms`] and no rules. Returns their chunk IDs, sorted.
    pub fn ingest(&self, project: &str, count: u64) -> Vec<String> {
        let updater = Updater::new(self.state.clone(), self.sink.clone());
        let algorithms = old_algorithms();
        let ruleset = Ruleset::empty(project);
        let mut ids = Vec::new();
        for i in 0..count {
            let chunk = generate_chunk(5, i);
            let object_id = self.chunks.put(project, &chunk).unwrap();
            let entry = Entry {
                project: project.to_string(),
                chunk_id: chunk_id_for(i),
                partition_time: START - Duration::days(1),
                object_id,
                clustering: ClusterResults::unclustered(chunk.failures.len()),
                last_updated: None,
            };
            updater
                .update(&algorithms, &ruleset, &chunk, &entry)
                .unwrap();
            ids.push(entry.chunk_id);
        }
        self.sink.clear();
        ids.sort();
        ids
    }

    /// Creates an active rule and returns it with its commit timestamp.
    pub fn add_rule(&self, project: &str, definition: &str) -> FailureAssociationRule {
        let rule = FailureAssociationRule::new(
            project,
            generate_id(),
            definition,
            BugId::new("buganizer", "1234"),
        );
        self.rules.create(&rule, "someone@example.com").unwrap()
    }

    pub fn orchestrator(&self, projects: &[&str], config: OrchestratorConfig) -> Orchestrator {
        Orchestrator::new(
            projects.iter().map(|p| p.to_string()).collect(),
            config,
            self.runs.clone(),
            self.state.clone(),
            self.rules.clone(),
            Arc::new(self.clock.clone()),
        )
    }

    pub fn worker(&self) -> Worker {
        self.worker_with_chunks(Arc::new(self.chunks.clone()))
    }

    pub fn worker_with_chunks(&self, chunks: Arc<dyn ChunkStore>) -> Worker {
        let rulesets = Arc::new(RulesetCache::new(
            Arc::new(self.rules.clone()),
            Arc::new(self.clock.clone()),
            16,
            Duration::minutes(1),
        ));
        Worker::new(
            worker_config(),
            self.runs.clone(),
            self.state.clone(),
            chunks,
            rulesets,
            self.sink.clone(),
            AlgorithmSet::current(&[]).unwrap(),
            Arc::new(self.clock.clone()),
        )
    }

    /// Processes queued tasks until the queue is empty. Returns the number
    /// of tasks processed.
    pub fn drain(&self, worker: &Worker) -> usize {
        let mut processed = 0;
        while worker
            .process_next(&self.queue, Duration::minutes(10))
            .unwrap()
            .is_some()
        {
            processed += 1;
        }
        processed
    }

    /// Chunk IDs of `project` not yet clustered with the given versions.
    pub fn stale(
        &self,
        project: &str,
        algorithms_version: i64,
        rules_version: OffsetDateTime,
    ) -> Vec<String> {
        let options = reclust_rs::state::ReadNextOptions {
            start_chunk_id: String::new(),
            end_chunk_id: reclust_rs::keyspace::END_OF_TABLE.to_string(),
            algorithms_version,
            rules_version,
        };
        self.state
            .read_next_n(project, &options, usize::MAX)
            .unwrap()
            .into_iter()
            .map(|entry| entry.chunk_id)
            .collect()
    }
}

/// Wraps a chunk store to run a hook before the n-th read of an object.
#[allow(dead_code)]
pub struct HookedChunkStore {
    inner: PersistentChunkStore,
    reads: AtomicUsize,
    hooks: Mutex<HashMap<usize, Box<dyn FnOnce() + Send>>>,
}

#[allow(dead_code)]
impl HookedChunkStore {
    pub fn new(inner: PersistentChunkStore) -> Self {
        Self {
            inner,
            reads: AtomicUsize::new(0),
            hooks: Mutex::new(HashMap::new()),
        }
    }

    /// Runs `hook` when the `read`-th (1-based) chunk is fetched.
    pub fn before_read(&self, read: usize, hook: impl FnOnce() + Send + 'static) {
        self.hooks.lock().insert(read, Box::new(hook));
    }

    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }
}

impl ChunkStore for HookedChunkStore {
    fn get(&self, project: &str, object_id: &str) -> reclust_rs::Result<Chunk> {
        let read = self.reads.fetch_add(1, Ordering::SeqCst) + 1;
        let hook = self.hooks.lock().remove(&read);
        if let Some(hook) = hook {
            hook();
        }
        self.inner.get(project, object_id)
    }
}
