//! Default constants for reclust configuration.
//!
//! All magic numbers are centralized here with documentation.

// =============================================================================
// Storage Defaults
// =============================================================================

/// Default RocksDB directory
pub const DEFAULT_DATA_DIR: &str = "./reclust-data";

// =============================================================================
// Reclustering Defaults
// =============================================================================

/// Default total number of shards that may run at once across projects.
/// Zero disables reclustering.
pub const DEFAULT_WORKERS: i64 = 8;

/// Default length of a reclustering attempt in minutes.
/// Runs are scheduled at multiples of this interval; zero disables reclustering.
pub const DEFAULT_INTERVAL_MINUTES: i64 = 5;

/// Default target number of chunks per shard.
pub const DEFAULT_ROWS_PER_SHARD: i64 = 100;

/// Default number of stale chunks fetched per state store read.
pub const DEFAULT_BATCH_SIZE: usize = 10;

/// Default number of concurrent worker loops in the daemon.
pub const DEFAULT_WORKER_THREADS: usize = 4;

/// Default task lease in seconds.
/// A task not acked within the lease after its attempt time is delivered again.
pub const DEFAULT_TASK_LEASE_SECS: i64 = 600;

// =============================================================================
// Retry Defaults
// =============================================================================

/// Default attempts of a task invocation failing with a transient error.
pub const DEFAULT_RETRY_MAX_ATTEMPTS: u32 = 5;

/// Initial backoff between attempts in milliseconds.
pub const DEFAULT_RETRY_INITIAL_BACKOFF_MS: u64 = 100;

/// Upper bound on backoff between attempts in milliseconds.
pub const DEFAULT_RETRY_MAX_BACKOFF_MS: u64 = 5_000;

// =============================================================================
// Ruleset Cache Defaults
// =============================================================================

/// Default number of project rulesets kept in memory.
pub const DEFAULT_RULES_CACHE_CAPACITY: usize = 1_000;

/// Seconds after which a cached ruleset is refreshed on access.
pub const DEFAULT_RULES_REFRESH_SECS: i64 = 60;
