use std::sync::Arc;
use std::time::Duration;

use reclust_rs::analysis::TracingSink;
use reclust_rs::config::{ConfigOverrides, ReclusteringOverrides};
use reclust_rs::db::OpenOptions;
use reclust_rs::{
    AlgorithmSet, Clock, ClusteringStateStore, Database, Orchestrator, PersistentChunkStore,
    ReclustConfig, RuleStore, RulesetCache, RunStore, SystemClock, TaskQueue, Worker,
};
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// How long an idle worker loop waits before polling the queue again.
const IDLE_POLL: Duration = Duration::from_secs(1);

fn parse_arg(flag: &str) -> Option<String> {
    let mut args = std::env::args();
    while let Some(arg) = args.next() {
        if arg == flag {
            return args.next();
        }
    }
    None
}

fn has_flag(flag: &str) -> bool {
    std::env::args().any(|arg| arg == flag)
}

fn print_help() {
    eprintln!(
        r#"reclustd - test failure reclustering daemon

USAGE:
    reclustd [OPTIONS]

OPTIONS:
    -c, --config <FILE>       Path to config file (TOML)
    -d, --data-dir <DIR>      Override database directory
        --workers <N>         Override shards that may run at once (0 disables)
        --interval <MIN>      Override reclustering interval in minutes
        --threads <N>         Override worker loops in this process
        --repair              Repair the database before opening
    -h, --help                Print help

ENVIRONMENT:
    RECLUST_CONFIG                        Path to config file
    RECLUST_DATA_DIR                      Database directory
    RECLUST_RECLUSTERING__WORKERS         Shards that may run at once
    RECLUST_RECLUSTERING__INTERVAL_MINUTES

CONFIG FILE (reclust.toml):
    data_dir = "/var/lib/reclust"

    [reclustering]
    workers = 8
    interval_minutes = 5

    [projects.chromium]
"#
    );
}

fn overrides_from_args() -> anyhow::Result<ConfigOverrides> {
    let mut overrides = ConfigOverrides::default();
    let mut reclustering = ReclusteringOverrides::default();

    if let Some(dir) = parse_arg("--data-dir").or_else(|| parse_arg("-d")) {
        overrides.data_dir = Some(dir.into());
    }
    if let Some(workers) = parse_arg("--workers") {
        reclustering.workers = Some(workers.parse()?);
    }
    if let Some(interval) = parse_arg("--interval") {
        reclustering.interval_minutes = Some(interval.parse()?);
    }
    if let Some(threads) = parse_arg("--threads") {
        reclustering.worker_threads = Some(threads.parse()?);
    }
    if reclustering.workers.is_some()
        || reclustering.interval_minutes.is_some()
        || reclustering.worker_threads.is_some()
    {
        overrides.reclustering = Some(reclustering);
    }
    Ok(overrides)
}

fn build_worker(
    config: &ReclustConfig,
    db: &Arc<Database>,
    clock: Arc<dyn Clock>,
) -> anyhow::Result<Worker> {
    let rules = RuleStore::new(db.clone());
    let rulesets = Arc::new(RulesetCache::new(
        Arc::new(rules),
        clock.clone(),
        config.rules_cache.capacity,
        config.rules_refresh_interval(),
    ));
    let mut worker = Worker::new(
        config.worker_config(),
        RunStore::new(db.clone()),
        ClusteringStateStore::new(db.clone()),
        Arc::new(PersistentChunkStore::new(db.clone())),
        rulesets,
        Arc::new(TracingSink),
        AlgorithmSet::current(&[])?,
        clock,
    );
    for project in config.project_names() {
        let algorithms = config.algorithms_for(&project)?;
        worker = worker.with_project_algorithms(&project, algorithms);
    }
    Ok(worker)
}

async fn orchestrate(orchestrator: Arc<Orchestrator>) {
    // Ticks land just after each wall clock minute.
    let now = SystemClock.now();
    let into_minute = Duration::from_secs(u64::from(now.second()))
        + Duration::from_nanos(u64::from(now.nanosecond()));
    let first_tick = Duration::from_secs(60).saturating_sub(into_minute) + Duration::from_secs(1);
    let mut ticker = tokio::time::interval_at(
        tokio::time::Instant::now() + first_tick,
        Duration::from_secs(60),
    );
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        ticker.tick().await;
        let orchestrator = orchestrator.clone();
        match tokio::task::spawn_blocking(move || orchestrator.run_once()).await {
            Ok(Ok(runs)) if !runs.is_empty() => info!(runs = runs.len(), "scheduled runs"),
            Ok(Ok(_)) => {}
            Ok(Err(err)) => error!(error = %err, "orchestrator tick failed"),
            Err(err) => error!(error = %err, "orchestrator tick panicked"),
        }
    }
}

async fn work(id: usize, worker: Arc<Worker>, queue: TaskQueue, lease: time::Duration) {
    loop {
        let worker = worker.clone();
        let queue = queue.clone();
        let result =
            tokio::task::spawn_blocking(move || worker.process_next(&queue, lease)).await;
        match result {
            Ok(Ok(Some(outcome))) => info!(worker = id, ?outcome, "task finished"),
            Ok(Ok(None)) => tokio::time::sleep(IDLE_POLL).await,
            Ok(Err(err)) => {
                warn!(worker = id, error = %err, "task failed");
                tokio::time::sleep(IDLE_POLL).await;
            }
            Err(err) => {
                error!(worker = id, error = %err, "worker panicked");
                tokio::time::sleep(IDLE_POLL).await;
            }
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if has_flag("-h") || has_flag("--help") {
        print_help();
        return Ok(());
    }

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    // Load config: CLI > Env > File > Defaults
    let config_path = parse_arg("--config")
        .or_else(|| parse_arg("-c"))
        .or_else(|| std::env::var("RECLUST_CONFIG").ok());
    let config = ReclustConfig::load(config_path.as_deref(), overrides_from_args()?)?;

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let db = Arc::new(Database::open_with_options(
        &config.data_dir,
        clock.clone(),
        OpenOptions {
            repair: has_flag("--repair"),
        },
    )?);

    let orchestrator = Arc::new(Orchestrator::new(
        config.project_names(),
        config.orchestrator_config(),
        RunStore::new(db.clone()),
        ClusteringStateStore::new(db.clone()),
        RuleStore::new(db.clone()),
        clock.clone(),
    ));
    let worker = Arc::new(build_worker(&config, &db, clock)?);
    let queue = TaskQueue::new(db.clone());

    info!(
        data_dir = %config.data_dir.display(),
        projects = ?config.project_names(),
        workers = config.reclustering.workers,
        interval_minutes = config.reclustering.interval_minutes,
        threads = config.reclustering.worker_threads,
        "reclustd started"
    );

    let mut handles = Vec::new();
    handles.push(tokio::spawn(orchestrate(orchestrator)));
    for id in 0..config.reclustering.worker_threads.max(1) {
        handles.push(tokio::spawn(work(
            id,
            worker.clone(),
            queue.clone(),
            config.task_lease(),
        )));
    }

    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    for handle in handles {
        handle.abort();
    }
    db.flush()?;
    Ok(())
}
