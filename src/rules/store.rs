//! Durable store of failure association rules.

use super::lang::RuleExpression;
use super::STARTING_EPOCH;
use crate::db::{self, Database, CF_RULES};
use crate::error::{Error, Result};
use crate::model::{is_valid_rule_id, validate_project, ClusterId};
use rand::RngCore;
use rocksdb::{Direction, IteratorMode, WriteBatch};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use time::OffsetDateTime;
use tracing::info;

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct BugId {
    pub system: String,
    pub id: String,
}

impl BugId {
    pub fn new(system: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            system: system.into(),
            id: id.into(),
        }
    }
}

impl fmt::Display for BugId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.system, self.id)
    }
}

/// A rule associating failures matching `rule_definition` with a bug.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureAssociationRule {
    pub project: String,
    /// 32 lowercase hex characters.
    pub rule_id: String,
    pub rule_definition: String,
    pub bug_id: BugId,
    pub is_active: bool,
    pub creation_time: OffsetDateTime,
    pub creation_user: String,
    /// Commit timestamp of the last create or update.
    pub last_updated: OffsetDateTime,
    pub last_updated_user: String,
    /// The suggested cluster the rule was created from, if any.
    pub source_cluster: Option<ClusterId>,
}

impl FailureAssociationRule {
    /// A new active rule; timestamps are assigned when it is stored.
    pub fn new(
        project: impl Into<String>,
        rule_id: impl Into<String>,
        rule_definition: impl Into<String>,
        bug_id: BugId,
    ) -> Self {
        Self {
            project: project.into(),
            rule_id: rule_id.into(),
            rule_definition: rule_definition.into(),
            bug_id,
            is_active: true,
            creation_time: STARTING_EPOCH,
            creation_user: String::new(),
            last_updated: STARTING_EPOCH,
            last_updated_user: String::new(),
            source_cluster: None,
        }
    }

    pub fn validate(&self) -> Result<()> {
        validate_project(&self.project)?;
        if !is_valid_rule_id(&self.rule_id) {
            return Err(Error::validation(format!(
                "rule ID {:?} is not valid",
                self.rule_id
            )));
        }
        if self.bug_id.system.is_empty() || self.bug_id.id.is_empty() {
            return Err(Error::validation("bug ID is not valid"));
        }
        if let Some(cluster) = &self.source_cluster {
            cluster.validate().map_err(|err| {
                Error::validation(format!("source cluster ID is not valid: {err}"))
            })?;
        }
        RuleExpression::parse(&self.rule_definition)?;
        Ok(())
    }
}

/// Random 128-bit rule identifier.
pub fn generate_id() -> String {
    let mut bytes = [0u8; 16];
    rand::rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

#[derive(Debug, Clone)]
pub struct RuleStore {
    db: Arc<Database>,
}

impl RuleStore {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    pub fn create(&self, rule: &FailureAssociationRule, user: &str) -> Result<FailureAssociationRule> {
        rule.validate()?;
        let key = db::project_key(&rule.project, rule.rule_id.as_bytes());
        let (_, stored) = self.db.transact(|db, commit_time| {
            let cf = db.cf(CF_RULES)?;
            if db.raw().get_pinned_cf(cf, &key)?.is_some() {
                return Err(Error::AlreadyExists(format!(
                    "rule {} in project {}",
                    rule.rule_id, rule.project
                )));
            }
            let stored = FailureAssociationRule {
                creation_time: commit_time,
                creation_user: user.to_string(),
                last_updated: commit_time,
                last_updated_user: user.to_string(),
                ..rule.clone()
            };
            let mut batch = WriteBatch::default();
            batch.put_cf(cf, &key, bincode::serialize(&stored)?);
            Ok((batch, stored))
        })?;
        info!(project = %stored.project, rule_id = %stored.rule_id, "created rule");
        Ok(stored)
    }

    /// Updates the definition, bug and active state of an existing rule.
    pub fn update(&self, rule: &FailureAssociationRule, user: &str) -> Result<FailureAssociationRule> {
        rule.validate()?;
        let key = db::project_key(&rule.project, rule.rule_id.as_bytes());
        let (_, stored) = self.db.transact(|db, commit_time| {
            let cf = db.cf(CF_RULES)?;
            let existing: FailureAssociationRule = match db.raw().get_cf(cf, &key)? {
                Some(bytes) => bincode::deserialize(&bytes)?,
                None => {
                    return Err(Error::not_found(format!(
                        "rule {} in project {}",
                        rule.rule_id, rule.project
                    )))
                }
            };
            let stored = FailureAssociationRule {
                rule_definition: rule.rule_definition.clone(),
                bug_id: rule.bug_id.clone(),
                is_active: rule.is_active,
                source_cluster: rule.source_cluster.clone(),
                last_updated: commit_time,
                last_updated_user: user.to_string(),
                ..existing
            };
            let mut batch = WriteBatch::default();
            batch.put_cf(cf, &key, bincode::serialize(&stored)?);
            Ok((batch, stored))
        })?;
        info!(
            project = %stored.project,
            rule_id = %stored.rule_id,
            is_active = stored.is_active,
            "updated rule"
        );
        Ok(stored)
    }

    pub fn read(&self, project: &str, rule_id: &str) -> Result<FailureAssociationRule> {
        validate_project(project)?;
        let cf = self.db.cf(CF_RULES)?;
        let key = db::project_key(project, rule_id.as_bytes());
        let bytes = self
            .db
            .raw()
            .get_cf(cf, key)?
            .ok_or_else(|| Error::not_found(format!("rule {rule_id} in project {project}")))?;
        Ok(bincode::deserialize(&bytes)?)
    }

    /// Every rule of the project, active or not, ordered by rule ID.
    pub fn read_all(&self, project: &str) -> Result<Vec<FailureAssociationRule>> {
        self.scan(project, |_| true)
    }

    /// Active rules ordered by rule ID.
    pub fn read_active(&self, project: &str) -> Result<Vec<FailureAssociationRule>> {
        self.scan(project, |rule| rule.is_active)
    }

    /// Rules, active or not, last updated at or after `since`.
    pub fn read_delta(
        &self,
        project: &str,
        since: OffsetDateTime,
    ) -> Result<Vec<FailureAssociationRule>> {
        self.scan(project, |rule| rule.last_updated >= since)
    }

    /// The latest update time of any rule of the project, or
    /// [`STARTING_EPOCH`] if it has none.
    pub fn read_last_updated(&self, project: &str) -> Result<OffsetDateTime> {
        Ok(self
            .read_all(project)?
            .iter()
            .map(|rule| rule.last_updated)
            .max()
            .unwrap_or(STARTING_EPOCH))
    }

    fn scan(
        &self,
        project: &str,
        keep: impl Fn(&FailureAssociationRule) -> bool,
    ) -> Result<Vec<FailureAssociationRule>> {
        validate_project(project)?;
        let cf = self.db.cf(CF_RULES)?;
        let prefix = db::project_prefix(project);
        let mut rules = Vec::new();
        let iter = self
            .db
            .raw()
            .iterator_cf(cf, IteratorMode::From(&prefix, Direction::Forward));
        for item in iter {
            let (key, value) = item?;
            if !key.starts_with(&prefix) {
                break;
            }
            let rule: FailureAssociationRule = bincode::deserialize(&value)?;
            if keep(&rule) {
                rules.push(rule);
            }
        }
        Ok(rules)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use tempfile::{tempdir, TempDir};
    use time::macros::datetime;
    use time::Duration;

    fn open() -> (TempDir, ManualClock, RuleStore) {
        let dir = tempdir().unwrap();
        let clock = ManualClock::new(datetime!(2030-01-01 0:00 UTC));
        let db = Database::open(dir.path(), Arc::new(clock.clone())).unwrap();
        (dir, clock, RuleStore::new(Arc::new(db)))
    }

    fn rule(rule_id: &str, definition: &str) -> FailureAssociationRule {
        FailureAssociationRule::new("testproject", rule_id, definition, BugId::new("monorail", "chromium/1"))
    }

    #[test]
    fn generated_ids_are_valid_and_distinct() {
        let a = generate_id();
        let b = generate_id();
        assert!(is_valid_rule_id(&a));
        assert_ne!(a, b);
    }

    #[test]
    fn create_assigns_commit_time() {
        let (_dir, _clock, store) = open();
        let created = store
            .create(&rule(&"a".repeat(32), "reason = 'x'"), "user@example.com")
            .unwrap();
        assert_eq!(created.creation_time, datetime!(2030-01-01 0:00 UTC));
        assert_eq!(created.last_updated, created.creation_time);
        assert_eq!(created.creation_user, "user@example.com");
        assert_eq!(store.read("testproject", &created.rule_id).unwrap(), created);
    }

    #[test]
    fn create_rejects_bad_rules_and_duplicates() {
        let (_dir, _clock, store) = open();
        assert!(store.create(&rule("not-hex", "TRUE"), "u").is_err());
        assert!(store.create(&rule(&"a".repeat(32), "reason =="), "u").is_err());
        let mut no_bug = rule(&"a".repeat(32), "TRUE");
        no_bug.bug_id = BugId::default();
        assert!(store.create(&no_bug, "u").is_err());

        store.create(&rule(&"a".repeat(32), "TRUE"), "u").unwrap();
        assert!(matches!(
            store.create(&rule(&"a".repeat(32), "TRUE"), "u"),
            Err(Error::AlreadyExists(_))
        ));
    }

    #[test]
    fn update_keeps_creation_and_bumps_last_updated() {
        let (_dir, clock, store) = open();
        let created = store.create(&rule(&"a".repeat(32), "TRUE"), "creator").unwrap();
        clock.advance(Duration::minutes(3));
        let mut changed = created.clone();
        changed.rule_definition = "FALSE".to_string();
        changed.is_active = false;
        changed.creation_user = "ignored".to_string();
        let updated = store.update(&changed, "editor").unwrap();
        assert_eq!(updated.creation_user, "creator");
        assert_eq!(updated.creation_time, created.creation_time);
        assert_eq!(updated.last_updated, created.last_updated + Duration::minutes(3));
        assert_eq!(updated.last_updated_user, "editor");
        assert!(!updated.is_active);

        let missing = rule(&"b".repeat(32), "TRUE");
        assert!(store.update(&missing, "u").unwrap_err().is_not_found());
    }

    #[test]
    fn reads_filter_by_activity_and_time() {
        let (_dir, clock, store) = open();
        assert_eq!(store.read_last_updated("testproject").unwrap(), STARTING_EPOCH);

        let first = store.create(&rule(&"b".repeat(32), "TRUE"), "u").unwrap();
        clock.advance(Duration::minutes(1));
        let mut second = store.create(&rule(&"a".repeat(32), "TRUE"), "u").unwrap();
        clock.advance(Duration::minutes(1));
        second.is_active = false;
        let second = store.update(&second, "u").unwrap();

        let active = store.read_active("testproject").unwrap();
        assert_eq!(active, vec![first.clone()]);
        let all: Vec<String> = store
            .read_all("testproject")
            .unwrap()
            .into_iter()
            .map(|r| r.rule_id)
            .collect();
        assert_eq!(all, vec!["a".repeat(32), "b".repeat(32)]);

        let delta = store.read_delta("testproject", second.last_updated).unwrap();
        assert_eq!(delta, vec![second.clone()]);
        assert_eq!(
            store.read_last_updated("testproject").unwrap(),
            second.last_updated
        );
        assert!(store.read_active("otherproject").unwrap().is_empty());
    }
}
