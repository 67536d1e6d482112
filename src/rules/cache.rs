//! Per-project cache of compiled rulesets.
//!
//! Entries never expire from the LRU on their own. An access finding an
//! entry older than the refresh interval pulls the rules changed since the
//! cached version and merges them. If that refresh fails the stale ruleset
//! is served instead.

use super::lang::{Attributes, RuleExpression};
use super::store::{FailureAssociationRule, RuleStore};
use super::STARTING_EPOCH;
use crate::clock::Clock;
use crate::error::{Error, Result};
use lru::LruCache;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::num::NonZeroUsize;
use std::sync::Arc;
use time::{Duration, OffsetDateTime};
use tracing::{debug, warn};

/// Where rulesets are loaded from.
pub trait RulesetSource: Send + Sync {
    /// Rules, active or not, updated at or after `since`.
    fn read_delta(&self, project: &str, since: OffsetDateTime)
        -> Result<Vec<FailureAssociationRule>>;
}

impl RulesetSource for RuleStore {
    fn read_delta(
        &self,
        project: &str,
        since: OffsetDateTime,
    ) -> Result<Vec<FailureAssociationRule>> {
        RuleStore::read_delta(self, project, since)
    }
}

#[derive(Debug, Clone)]
pub struct CachedRule {
    pub rule_id: String,
    pub expr: RuleExpression,
    pub last_updated: OffsetDateTime,
}

impl CachedRule {
    pub fn compile(rule: &FailureAssociationRule) -> Result<Self> {
        let expr = RuleExpression::parse(&rule.rule_definition).map_err(|err| {
            Error::validation(format!("rule {}: {err}", rule.rule_id))
        })?;
        Ok(Self {
            rule_id: rule.rule_id.clone(),
            expr,
            last_updated: rule.last_updated,
        })
    }
}

/// Compiled snapshot of a project's active rules.
#[derive(Debug, Clone)]
pub struct Ruleset {
    pub project: String,
    /// Active rules ordered by rule ID.
    pub active_rules: Vec<CachedRule>,
    /// Latest update, including deactivations, reflected in this snapshot.
    pub rules_version: OffsetDateTime,
    pub last_refresh: OffsetDateTime,
}

impl Ruleset {
    pub fn empty(project: &str) -> Self {
        Self {
            project: project.to_string(),
            active_rules: Vec::new(),
            rules_version: STARTING_EPOCH,
            last_refresh: STARTING_EPOCH,
        }
    }

    /// A ruleset of exactly `rules`, for callers that already hold them.
    pub fn from_rules(
        project: &str,
        rules: &[FailureAssociationRule],
        refreshed_at: OffsetDateTime,
    ) -> Result<Self> {
        Self::empty(project).apply_delta(rules, refreshed_at)
    }

    /// Applies changed rules on top of this snapshot.
    pub fn apply_delta(
        &self,
        delta: &[FailureAssociationRule],
        refreshed_at: OffsetDateTime,
    ) -> Result<Self> {
        let mut rules: BTreeMap<String, CachedRule> = self
            .active_rules
            .iter()
            .map(|rule| (rule.rule_id.clone(), rule.clone()))
            .collect();
        let mut rules_version = self.rules_version;
        for rule in delta {
            rules.remove(&rule.rule_id);
            if rule.is_active {
                rules.insert(rule.rule_id.clone(), CachedRule::compile(rule)?);
            }
            rules_version = rules_version.max(rule.last_updated);
        }
        Ok(Self {
            project: self.project.clone(),
            active_rules: rules.into_values().collect(),
            rules_version,
            last_refresh: refreshed_at,
        })
    }

    /// IDs of active rules matching the failure, in rule ID order.
    pub fn matching_rules(&self, attrs: &Attributes<'_>) -> Vec<&str> {
        self.active_rules
            .iter()
            .filter(|rule| rule.expr.evaluate(attrs))
            .map(|rule| rule.rule_id.as_str())
            .collect()
    }
}

pub struct RulesetCache {
    source: Arc<dyn RulesetSource>,
    clock: Arc<dyn Clock>,
    refresh_interval: Duration,
    entries: Mutex<LruCache<String, Arc<Ruleset>>>,
}

impl std::fmt::Debug for RulesetCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RulesetCache")
            .field("refresh_interval", &self.refresh_interval)
            .field("entries", &self.entries.lock().len())
            .finish()
    }
}

impl RulesetCache {
    pub fn new(
        source: Arc<dyn RulesetSource>,
        clock: Arc<dyn Clock>,
        capacity: usize,
        refresh_interval: Duration,
    ) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            source,
            clock,
            refresh_interval,
            entries: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// The project's ruleset, refreshed if older than the refresh interval.
    /// A failed refresh of a cached entry is logged and the stale entry
    /// returned; it is an error only when nothing is cached yet.
    pub fn ruleset(&self, project: &str) -> Result<Arc<Ruleset>> {
        let cached = self.entries.lock().get(project).cloned();
        let now = self.clock.now();
        if let Some(ruleset) = &cached {
            if now - ruleset.last_refresh < self.refresh_interval {
                return Ok(ruleset.clone());
            }
        }
        match self.refresh(project, cached.as_deref(), now) {
            Ok(ruleset) => Ok(ruleset),
            Err(err) => match cached {
                Some(stale) => {
                    warn!(project, error = %err, "ruleset refresh failed, serving stale ruleset");
                    Ok(stale)
                }
                None => Err(err),
            },
        }
    }

    /// A ruleset at least as new as `min_version`, refreshing immediately
    /// if the cached one is older.
    pub fn ruleset_at_least(
        &self,
        project: &str,
        min_version: OffsetDateTime,
    ) -> Result<Arc<Ruleset>> {
        let ruleset = self.ruleset(project)?;
        if ruleset.rules_version >= min_version {
            return Ok(ruleset);
        }
        let refreshed = self.refresh(project, Some(&ruleset), self.clock.now())?;
        if refreshed.rules_version < min_version {
            return Err(Error::not_found(format!(
                "ruleset of version {min_version} for project {project} (latest is {})",
                refreshed.rules_version
            )));
        }
        Ok(refreshed)
    }

    fn refresh(
        &self,
        project: &str,
        cached: Option<&Ruleset>,
        now: OffsetDateTime,
    ) -> Result<Arc<Ruleset>> {
        let empty;
        let base = match cached {
            Some(current) => current,
            None => {
                empty = Ruleset::empty(project);
                &empty
            }
        };
        let delta = self.source.read_delta(project, base.rules_version)?;
        let ruleset = base.apply_delta(&delta, now)?;
        debug!(
            project,
            rules = ruleset.active_rules.len(),
            rules_version = %ruleset.rules_version,
            "refreshed ruleset"
        );
        let ruleset = Arc::new(ruleset);
        self.entries.lock().put(project.to_string(), ruleset.clone());
        Ok(ruleset)
    }
}
