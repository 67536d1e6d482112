//! (Re-)clustering of a single chunk.

use crate::algorithms::AlgorithmSet;
use crate::analysis::AnalysisSink;
use crate::error::{Error, Result};
use crate::model::{clusters_equal, sort_clusters, Chunk, ClusterResults, ClusterUpdate, Entry, FailureUpdate};
use crate::rules::Ruleset;
use crate::state::ClusteringStateStore;
use std::sync::Arc;
use time::OffsetDateTime;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOutcome {
    /// The new clustering was committed; `changed` failures changed clusters.
    Written {
        commit_time: OffsetDateTime,
        changed: usize,
    },
    /// The entry was already clustered with newer algorithms.
    Skipped,
}

#[derive(Clone)]
pub struct Updater {
    state: ClusteringStateStore,
    sink: Arc<dyn AnalysisSink>,
}

impl std::fmt::Debug for Updater {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Updater").finish_non_exhaustive()
    }
}

impl Updater {
    pub fn new(state: ClusteringStateStore, sink: Arc<dyn AnalysisSink>) -> Self {
        Self { state, sink }
    }

    /// Re-clusters `chunk`, whose current state is `existing`, and writes
    /// the result. An `existing` entry without `last_updated` has never been
    /// written and is created. Membership changes go to the analysis sink
    /// once the write has committed; version-only changes do not.
    ///
    /// `ruleset` must be at least as new as the rules `existing` was
    /// clustered with.
    pub fn update(
        &self,
        algorithms: &AlgorithmSet,
        ruleset: &Ruleset,
        chunk: &Chunk,
        existing: &Entry,
    ) -> Result<UpdateOutcome> {
        let failures = chunk.failures.len();
        let previous = match existing.last_updated {
            None => ClusterResults::unclustered(failures),
            Some(_) => {
                let stored = existing.clustering.clusters.len();
                if stored != failures {
                    return Err(Error::validation(format!(
                        "chunk {} of project {} has {failures} failures but its clustering has {stored}",
                        existing.chunk_id, existing.project
                    )));
                }
                if existing.clustering.algorithms_version > algorithms.version() {
                    debug!(
                        project = %existing.project,
                        chunk_id = %existing.chunk_id,
                        "chunk already clustered with newer algorithms"
                    );
                    return Ok(UpdateOutcome::Skipped);
                }
                if existing.clustering.rules_version > ruleset.rules_version {
                    return Err(Error::validation(format!(
                        "chunk {} of project {} was clustered with rules version {} but the ruleset is at {}",
                        existing.chunk_id,
                        existing.project,
                        existing.clustering.rules_version,
                        ruleset.rules_version
                    )));
                }
                existing.clustering.clone()
            }
        };

        let clustering = algorithms.cluster(ruleset, &chunk.failures);
        let commit_time = match existing.last_updated {
            None => self.state.create(&Entry {
                clustering: clustering.clone(),
                ..existing.clone()
            })?,
            Some(_) => self.state.update_clustering(existing, &clustering)?,
        };

        let update = diff(existing, chunk, &previous, &clustering);
        let changed = update.updates.len();
        if changed > 0 {
            self.sink.handle_updated_clusters(&update, commit_time)?;
        }
        debug!(
            project = %existing.project,
            chunk_id = %existing.chunk_id,
            changed,
            "clustered chunk"
        );
        Ok(UpdateOutcome::Written {
            commit_time,
            changed,
        })
    }
}

/// Failures whose cluster set differs between `previous` and `next`.
pub fn diff(
    entry: &Entry,
    chunk: &Chunk,
    previous: &ClusterResults,
    next: &ClusterResults,
) -> ClusterUpdate {
    let updates = chunk
        .failures
        .iter()
        .zip(previous.clusters.iter().zip(&next.clusters))
        .filter(|(_, (before, after))| !clusters_equal(before, after))
        .map(|(failure, (before, after))| {
            let mut previous_clusters = before.clone();
            let mut new_clusters = after.clone();
            sort_clusters(&mut previous_clusters);
            sort_clusters(&mut new_clusters);
            FailureUpdate {
                test_result: failure.clone(),
                previous_clusters,
                new_clusters,
            }
        })
        .collect();
    ClusterUpdate {
        project: entry.project.clone(),
        chunk_id: entry.chunk_id.clone(),
        updates,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algorithms::{rules, AlgorithmSet};
    use crate::analysis::RecordingSink;
    use crate::clock::ManualClock;
    use crate::db::Database;
    use crate::model::{ClusterId, FailureReason};
    use crate::rules::{BugId, FailureAssociationRule};
    use crate::test_support::{chunk_id_for, failure};
    use tempfile::{tempdir, TempDir};
    use time::macros::datetime;
    use time::Duration;

    struct Fixture {
        _dir: TempDir,
        state: ClusteringStateStore,
        sink: Arc<RecordingSink>,
        updater: Updater,
        algorithms: AlgorithmSet,
    }

    fn fixture() -> Fixture {
        let dir = tempdir().unwrap();
        let clock = ManualClock::new(datetime!(2030-01-01 0:00 UTC));
        let db = Arc::new(Database::open(dir.path(), Arc::new(clock)).unwrap());
        let state = ClusteringStateStore::new(db);
        let sink = Arc::new(RecordingSink::new());
        let updater = Updater::new(state.clone(), sink.clone());
        Fixture {
            _dir: dir,
            state,
            sink,
            updater,
            algorithms: AlgorithmSet::current(&[]).unwrap(),
        }
    }

    fn new_entry(failures: usize) -> Entry {
        Entry {
            project: "testproject".to_string(),
            chunk_id: chunk_id_for(1),
            partition_time: datetime!(2029-12-31 0:00 UTC),
            object_id: "object".to_string(),
            clustering: ClusterResults::unclustered(failures),
            last_updated: None,
        }
    }

    fn reason_rule(at: OffsetDateTime) -> FailureAssociationRule {
        let mut rule = FailureAssociationRule::new(
            "testproject",
            "e".repeat(32),
            "reason = \"reason_b\"",
            BugId::new("buganizer", "1"),
        );
        rule.last_updated = at;
        rule
    }

    fn reason_b_chunk() -> Chunk {
        let mut f = failure(0);
        f.failure_reason = Some(FailureReason {
            primary_error_message: "reason_b".to_string(),
        });
        Chunk {
            failures: vec![f, failure(1)],
        }
    }

    #[test]
    fn first_clustering_creates_entry_and_reports_everything() {
        let fx = fixture();
        let chunk = Chunk {
            failures: vec![failure(0), failure(1), failure(2)],
        };
        let ruleset = Ruleset::empty("testproject");
        let outcome = fx
            .updater
            .update(&fx.algorithms, &ruleset, &chunk, &new_entry(3))
            .unwrap();
        assert!(matches!(outcome, UpdateOutcome::Written { changed: 3, .. }));

        let stored = fx.state.read("testproject", &chunk_id_for(1)).unwrap();
        assert_eq!(stored.clustering.algorithms_version, fx.algorithms.version());
        let updates = fx.sink.updates();
        assert_eq!(updates.len(), 1);
        assert_eq!(Some(updates[0].1), stored.last_updated);
        assert!(updates[0].0.updates.iter().all(|u| u.previous_clusters.is_empty()));
    }

    #[test]
    fn second_update_is_idempotent() {
        let fx = fixture();
        let chunk = reason_b_chunk();
        let ruleset = Ruleset::empty("testproject");
        fx.updater
            .update(&fx.algorithms, &ruleset, &chunk, &new_entry(2))
            .unwrap();
        fx.sink.clear();

        let existing = fx.state.read("testproject", &chunk_id_for(1)).unwrap();
        let outcome = fx
            .updater
            .update(&fx.algorithms, &ruleset, &chunk, &existing)
            .unwrap();
        assert!(matches!(outcome, UpdateOutcome::Written { changed: 0, .. }));
        assert!(fx.sink.updates().is_empty());
    }

    #[test]
    fn new_rule_adds_rules_cluster() {
        let fx = fixture();
        let chunk = reason_b_chunk();
        fx.updater
            .update(&fx.algorithms, &Ruleset::empty("testproject"), &chunk, &new_entry(2))
            .unwrap();
        fx.sink.clear();

        let at = datetime!(2030-01-01 0:00 UTC);
        let rule = reason_rule(at);
        let ruleset = Ruleset::from_rules("testproject", &[rule.clone()], at).unwrap();
        let existing = fx.state.read("testproject", &chunk_id_for(1)).unwrap();
        fx.updater
            .update(&fx.algorithms, &ruleset, &chunk, &existing)
            .unwrap();

        let expected = ClusterId::new(rules::ALGORITHM_NAME, rule.rule_id.clone());
        let stored = fx.state.read("testproject", &chunk_id_for(1)).unwrap();
        assert!(stored.clustering.clusters[0].contains(&expected));
        assert!(!stored.clustering.clusters[1].contains(&expected));
        assert_eq!(stored.clustering.rules_version, at);

        let updates = fx.sink.updates();
        assert_eq!(updates.len(), 1);
        let diff = &updates[0].0;
        assert_eq!(diff.updates.len(), 1);
        assert_eq!(diff.updates[0].test_result, chunk.failures[0]);
        assert!(diff.updates[0].new_clusters.contains(&expected));
        assert!(!diff.updates[0].previous_clusters.contains(&expected));
    }

    #[test]
    fn mismatched_failure_count_is_fatal() {
        let fx = fixture();
        let ruleset = Ruleset::empty("testproject");
        fx.updater
            .update(&fx.algorithms, &ruleset, &reason_b_chunk(), &new_entry(2))
            .unwrap();
        let existing = fx.state.read("testproject", &chunk_id_for(1)).unwrap();
        let bigger = Chunk {
            failures: vec![failure(0), failure(1), failure(2)],
        };
        let err = fx
            .updater
            .update(&fx.algorithms, &ruleset, &bigger, &existing)
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
        assert!(!err.is_transient());
    }

    #[test]
    fn stale_entry_surfaces_race() {
        let fx = fixture();
        let ruleset = Ruleset::empty("testproject");
        let chunk = reason_b_chunk();
        fx.updater
            .update(&fx.algorithms, &ruleset, &chunk, &new_entry(2))
            .unwrap();
        let existing = fx.state.read("testproject", &chunk_id_for(1)).unwrap();

        let at = datetime!(2030-01-01 0:00 UTC);
        let newer = Ruleset::from_rules("testproject", &[reason_rule(at)], at).unwrap();
        fx.updater
            .update(&fx.algorithms, &newer, &chunk, &existing)
            .unwrap();
        fx.sink.clear();
        let err = fx
            .updater
            .update(&fx.algorithms, &newer, &chunk, &existing)
            .unwrap_err();
        assert!(err.is_transient());
        assert!(fx.sink.updates().is_empty());
    }

    #[test]
    fn newer_algorithms_are_not_downgraded() {
        let fx = fixture();
        let chunk = reason_b_chunk();
        let ruleset = Ruleset::empty("testproject");
        fx.updater
            .update(&fx.algorithms, &ruleset, &chunk, &new_entry(2))
            .unwrap();
        let existing = fx.state.read("testproject", &chunk_id_for(1)).unwrap();

        let older = AlgorithmSet::with_algorithms(fx.algorithms.version() - 1, Vec::new());
        let outcome = fx
            .updater
            .update(&older, &ruleset, &chunk, &existing)
            .unwrap();
        assert_eq!(outcome, UpdateOutcome::Skipped);
        let after = fx.state.read("testproject", &chunk_id_for(1)).unwrap();
        assert_eq!(after.last_updated, existing.last_updated);
    }

    #[test]
    fn older_ruleset_than_entry_is_refused() {
        let fx = fixture();
        let at = datetime!(2030-01-01 0:00 UTC);
        let ruleset = Ruleset::from_rules("testproject", &[reason_rule(at)], at).unwrap();
        let chunk = reason_b_chunk();
        fx.updater
            .update(&fx.algorithms, &ruleset, &chunk, &new_entry(2))
            .unwrap();
        let existing = fx.state.read("testproject", &chunk_id_for(1)).unwrap();
        fx.sink.clear();

        let mut older = Ruleset::empty("testproject");
        older.rules_version = at - Duration::hours(1);
        let err = fx
            .updater
            .update(&fx.algorithms, &older, &chunk, &existing)
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
        let after = fx.state.read("testproject", &chunk_id_for(1)).unwrap();
        assert_eq!(after.last_updated, existing.last_updated);
        assert!(fx.sink.updates().is_empty());
    }
}
