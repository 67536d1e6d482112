//! Configuration for the reclustering daemon and admin tool.
//!
//! Configuration is loaded with precedence: CLI args > Env vars > Config file > Defaults
//!
//! # Example config file (reclust.toml)
//! ```toml
//! data_dir = "/var/lib/reclust"
//!
//! [reclustering]
//! workers = 16
//! interval_minutes = 5
//!
//! [projects.chromium]
//! test_name_rules = [
//!   { name = "blink web tests", pattern = "^ninja://:blink_web_tests/(?P<testname>.*)$", like_template = "ninja://:blink\\_web\\_tests/${testname}%" },
//! ]
//!
//! [projects.fuchsia]
//! ```

mod defaults;

pub use defaults::*;

use crate::algorithms::testname::TestNameRule;
use crate::algorithms::AlgorithmSet;
use crate::error::Result;
use crate::model::validate_project;
use crate::orchestrator::OrchestratorConfig;
use crate::worker::{RetryPolicy, WorkerConfig};
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Main configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReclustConfig {
    /// Directory of the clustering database
    pub data_dir: PathBuf,
    /// Scheduling and worker settings
    pub reclustering: ReclusteringConfig,
    /// In-memory ruleset cache
    pub rules_cache: RulesCacheConfig,
    /// Projects to recluster, by name
    pub projects: BTreeMap<String, ProjectConfig>,
}

impl Default for ReclustConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from(DEFAULT_DATA_DIR),
            reclustering: ReclusteringConfig::default(),
            rules_cache: RulesCacheConfig::default(),
            projects: BTreeMap::new(),
        }
    }
}

impl ReclustConfig {
    /// Load configuration with precedence: CLI args > Env > File > Defaults
    ///
    /// # Arguments
    /// * `config_path` - Optional path to TOML config file
    /// * `overrides` - CLI overrides to apply on top
    pub fn load(
        config_path: Option<&str>,
        overrides: ConfigOverrides,
    ) -> std::result::Result<Self, ConfigError> {
        let mut figment = Figment::new().merge(Serialized::defaults(ReclustConfig::default()));

        // Layer 1: Config file (if provided)
        if let Some(path) = config_path {
            figment = figment.merge(Toml::file(path));
        }

        // Layer 2: Environment variables, e.g. RECLUST_RECLUSTERING__WORKERS=4
        figment = figment.merge(Env::prefixed("RECLUST_").split("__"));

        // Layer 3: CLI overrides
        figment = figment.merge(Serialized::defaults(overrides));

        let config: Self = figment.extract()?;
        config.validate()?;
        Ok(config)
    }

    /// Load from environment and optional config file only (no CLI overrides)
    pub fn from_env(config_path: Option<&str>) -> std::result::Result<Self, ConfigError> {
        Self::load(config_path, ConfigOverrides::default())
    }

    fn validate(&self) -> std::result::Result<(), ConfigError> {
        for (project, project_config) in &self.projects {
            validate_project(project).map_err(|err| ConfigError {
                message: format!("project {project:?}: {err}"),
            })?;
            for rule in &project_config.test_name_rules {
                crate::algorithms::testname::TestNameMatcher::compile(rule).map_err(|err| {
                    ConfigError {
                        message: format!("project {project}: test name rule {:?}: {err}", rule.name),
                    }
                })?;
            }
        }
        if self.reclustering.rows_per_shard <= 0 {
            return Err(ConfigError {
                message: "reclustering.rows_per_shard must be positive".to_string(),
            });
        }
        if self.reclustering.batch_size == 0 {
            return Err(ConfigError {
                message: "reclustering.batch_size must be positive".to_string(),
            });
        }
        Ok(())
    }

    pub fn project_names(&self) -> Vec<String> {
        self.projects.keys().cloned().collect()
    }

    /// The algorithm set a project's chunks are clustered with.
    pub fn algorithms_for(&self, project: &str) -> Result<AlgorithmSet> {
        let rules = self
            .projects
            .get(project)
            .map(|p| p.test_name_rules.as_slice())
            .unwrap_or_default();
        AlgorithmSet::current(rules)
    }

    pub fn orchestrator_config(&self) -> OrchestratorConfig {
        OrchestratorConfig {
            workers: self.reclustering.workers,
            interval: time::Duration::minutes(self.reclustering.interval_minutes),
            rows_per_shard: self.reclustering.rows_per_shard,
        }
    }

    pub fn worker_config(&self) -> WorkerConfig {
        WorkerConfig {
            batch_size: self.reclustering.batch_size,
            retry: self.reclustering.retry.policy(),
        }
    }

    pub fn task_lease(&self) -> time::Duration {
        time::Duration::seconds(self.reclustering.task_lease_secs)
    }

    pub fn rules_refresh_interval(&self) -> time::Duration {
        time::Duration::seconds(self.rules_cache.refresh_interval_secs)
    }
}

/// Reclustering schedule and worker settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReclusteringConfig {
    /// Shards that may run concurrently across all projects (0 = disabled)
    pub workers: i64,
    /// Length of each reclustering attempt (0 = disabled)
    pub interval_minutes: i64,
    /// Target chunks per shard
    pub rows_per_shard: i64,
    /// Chunks read from the state store per batch
    pub batch_size: usize,
    /// Worker loops run by the daemon
    pub worker_threads: usize,
    /// Seconds a leased task stays invisible to other workers
    pub task_lease_secs: i64,
    /// Retry of transient task failures
    pub retry: RetryConfig,
}

impl Default for ReclusteringConfig {
    fn default() -> Self {
        Self {
            workers: DEFAULT_WORKERS,
            interval_minutes: DEFAULT_INTERVAL_MINUTES,
            rows_per_shard: DEFAULT_ROWS_PER_SHARD,
            batch_size: DEFAULT_BATCH_SIZE,
            worker_threads: DEFAULT_WORKER_THREADS,
            task_lease_secs: DEFAULT_TASK_LEASE_SECS,
            retry: RetryConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_RETRY_MAX_ATTEMPTS,
            initial_backoff_ms: DEFAULT_RETRY_INITIAL_BACKOFF_MS,
            max_backoff_ms: DEFAULT_RETRY_MAX_BACKOFF_MS,
        }
    }
}

impl RetryConfig {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts.max(1),
            initial_backoff: std::time::Duration::from_millis(self.initial_backoff_ms),
            max_backoff: std::time::Duration::from_millis(self.max_backoff_ms),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RulesCacheConfig {
    /// Project rulesets kept in memory
    pub capacity: usize,
    /// Age after which a cached ruleset is refreshed (seconds)
    pub refresh_interval_secs: i64,
}

impl Default for RulesCacheConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_RULES_CACHE_CAPACITY,
            refresh_interval_secs: DEFAULT_RULES_REFRESH_SECS,
        }
    }
}

/// Per-project settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProjectConfig {
    /// Test name clustering rules, tried in order
    pub test_name_rules: Vec<TestNameRule>,
}

/// CLI overrides that take precedence over file and env config.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfigOverrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data_dir: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reclustering: Option<ReclusteringOverrides>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ReclusteringOverrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub workers: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub interval_minutes: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub worker_threads: Option<usize>,
}

/// Configuration error.
#[derive(Debug)]
pub struct ConfigError {
    pub message: String,
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "configuration error: {}", self.message)
    }
}

impl std::error::Error for ConfigError {}

impl From<figment::Error> for ConfigError {
    fn from(e: figment::Error) -> Self {
        Self {
            message: e.to_string(),
        }
    }
}
