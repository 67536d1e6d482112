use std::fs;
use std::sync::Arc;

use anyhow::{anyhow, bail, Context};
use reclust_rs::analysis::TracingSink;
use reclust_rs::model::{validate_chunk_id, ClusterResults};
use reclust_rs::rules::{generate_id, BugId};
use reclust_rs::{
    Chunk, Clock, ClusteringStateStore, Database, Entry, FailureAssociationRule,
    PersistentChunkStore, ReclustConfig, RuleStore, RulesetCache, RunStore, SystemClock,
    UpdateOutcome, Updater,
};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

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

fn required_arg(flag: &str) -> anyhow::Result<String> {
    parse_arg(flag).ok_or_else(|| anyhow!("missing {flag}"))
}

fn print_help() {
    eprintln!(
        r#"reclust_admin - inspect and modify the clustering database

USAGE:
    reclust_admin <COMMAND> [OPTIONS]

COMMANDS:
    rules add --project <P> --rule <EXPR> --bug <SYSTEM/ID> [--user <U>]
    rules list --project <P> [--active]
    rules deactivate --project <P> --rule-id <ID> [--user <U>]
    chunks put --project <P> --file <JSON> [--chunk-id <ID>] [--partition-time <RFC3339>]
    progress --project <P>
    estimate --project <P>
    checkpoint --dest <DIR>

OPTIONS:
    -c, --config <FILE>     Path to config file (TOML)
    -d, --data-dir <DIR>    Override database directory
    -h, --help              Print help
"#
    );
}

struct Admin {
    config: ReclustConfig,
    db: Arc<Database>,
    clock: Arc<dyn Clock>,
}

impl Admin {
    fn rules_add(&self) -> anyhow::Result<()> {
        let project = required_arg("--project")?;
        let definition = required_arg("--rule")?;
        let bug = required_arg("--bug")?;
        let (system, id) = bug
            .split_once('/')
            .ok_or_else(|| anyhow!("bug must be written as SYSTEM/ID, got {bug:?}"))?;
        let user = parse_arg("--user").unwrap_or_else(|| "admin".to_string());

        let rule = FailureAssociationRule::new(
            project,
            generate_id(),
            definition,
            BugId::new(system, id),
        );
        let stored = RuleStore::new(self.db.clone()).create(&rule, &user)?;
        println!("{}", serde_json::to_string_pretty(&stored)?);
        Ok(())
    }

    fn rules_list(&self) -> anyhow::Result<()> {
        let project = required_arg("--project")?;
        let store = RuleStore::new(self.db.clone());
        let rules = if has_flag("--active") {
            store.read_active(&project)?
        } else {
            store.read_all(&project)?
        };
        println!("{}", serde_json::to_string_pretty(&rules)?);
        Ok(())
    }

    fn rules_deactivate(&self) -> anyhow::Result<()> {
        let project = required_arg("--project")?;
        let rule_id = required_arg("--rule-id")?;
        let user = parse_arg("--user").unwrap_or_else(|| "admin".to_string());

        let store = RuleStore::new(self.db.clone());
        let mut rule = store.read(&project, &rule_id)?;
        if !rule.is_active {
            bail!("rule {rule_id} is already inactive");
        }
        rule.is_active = false;
        let stored = store.update(&rule, &user)?;
        println!("deactivated rule {} at {}", stored.rule_id, stored.last_updated);
        Ok(())
    }

    /// Stores a chunk and clusters it for the first time.
    fn chunks_put(&self) -> anyhow::Result<()> {
        let project = required_arg("--project")?;
        let path = required_arg("--file")?;
        let raw = fs::read_to_string(&path).with_context(|| format!("reading {path}"))?;
        let chunk: Chunk = serde_json::from_str(&raw)?;
        if chunk.failures.is_empty() {
            bail!("chunk {path} has no failures");
        }
        let partition_time = match parse_arg("--partition-time") {
            Some(value) => OffsetDateTime::parse(&value, &Rfc3339)?,
            None => self.clock.now(),
        };

        let object_id = PersistentChunkStore::new(self.db.clone()).put(&project, &chunk)?;
        let chunk_id = parse_arg("--chunk-id").unwrap_or_else(|| object_id.clone());
        validate_chunk_id(&chunk_id)?;

        let rulesets = RulesetCache::new(
            Arc::new(RuleStore::new(self.db.clone())),
            self.clock.clone(),
            1,
            self.config.rules_refresh_interval(),
        );
        let ruleset = rulesets.ruleset(&project)?;
        let algorithms = self.config.algorithms_for(&project)?;
        let updater = Updater::new(
            ClusteringStateStore::new(self.db.clone()),
            Arc::new(TracingSink),
        );
        let entry = Entry {
            project: project.clone(),
            chunk_id: chunk_id.clone(),
            partition_time,
            object_id,
            clustering: ClusterResults::unclustered(chunk.failures.len()),
            last_updated: None,
        };
        match updater.update(&algorithms, &ruleset, &chunk, &entry)? {
            UpdateOutcome::Written { changed, .. } => {
                println!("chunk {chunk_id}: {changed} failures clustered")
            }
            UpdateOutcome::Skipped => println!("chunk {chunk_id}: already clustered"),
        }
        Ok(())
    }

    fn progress(&self) -> anyhow::Result<()> {
        let project = required_arg("--project")?;
        let progress = RunStore::new(self.db.clone()).read_reclustering_progress(&project)?;
        println!("project:               {}", progress.project);
        println!("progress:              {}/1000", progress.progress_per_mille);
        println!("reclustering:          {}", progress.is_reclustering());
        println!(
            "latest algorithms:     {}",
            progress.incorporates_latest_algorithms()
        );
        println!("{}", serde_json::to_string_pretty(&progress.last)?);
        Ok(())
    }

    fn estimate(&self) -> anyhow::Result<()> {
        let project = required_arg("--project")?;
        let estimate = ClusteringStateStore::new(self.db.clone()).estimate_chunks(&project)?;
        println!("{estimate}");
        Ok(())
    }

    fn checkpoint(&self) -> anyhow::Result<()> {
        let dest = required_arg("--dest")?;
        self.db.checkpoint(&dest)?;
        println!("checkpoint written to {dest}");
        Ok(())
    }
}

fn main() -> anyhow::Result<()> {
    if has_flag("-h") || has_flag("--help") {
        print_help();
        return Ok(());
    }

    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .init();

    let config_path = parse_arg("--config")
        .or_else(|| parse_arg("-c"))
        .or_else(|| std::env::var("RECLUST_CONFIG").ok());
    let mut overrides = reclust_rs::ConfigOverrides::default();
    if let Some(dir) = parse_arg("--data-dir").or_else(|| parse_arg("-d")) {
        overrides.data_dir = Some(dir.into());
    }
    let config = ReclustConfig::load(config_path.as_deref(), overrides)?;

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let db = Arc::new(Database::open(&config.data_dir, clock.clone())?);
    let admin = Admin { config, db, clock };

    let words: Vec<String> = std::env::args()
        .skip(1)
        .take_while(|arg| !arg.starts_with('-'))
        .take(2)
        .collect();
    match words.iter().map(String::as_str).collect::<Vec<_>>().as_slice() {
        ["rules", "add", ..] => admin.rules_add(),
        ["rules", "list", ..] => admin.rules_list(),
        ["rules", "deactivate", ..] => admin.rules_deactivate(),
        ["chunks", "put", ..] => admin.chunks_put(),
        ["progress", ..] => admin.progress(),
        ["estimate", ..] => admin.estimate(),
        ["checkpoint", ..] => admin.checkpoint(),
        _ => {
            print_help();
            bail!("unknown command");
        }
    }
}
