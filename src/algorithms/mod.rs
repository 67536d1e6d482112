//! Clustering algorithms.
//!
//! The set of algorithms is closed: every variant of [`Algorithm`] maps a
//! failure to zero or more clusters under a versioned name. Changing what an
//! algorithm produces means changing its name and bumping
//! [`ALGORITHMS_VERSION`], so previously stored results read as stale.

pub mod failurereason;
pub mod rules;
pub mod testname;

use crate::error::Result;
use crate::model::{sort_clusters, ClusterId, ClusterResults, Failure};
use crate::rules::Ruleset;
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;

pub use failurereason::FailureReasonAlgorithm;
pub use rules::RulesAlgorithm;
pub use testname::{TestNameAlgorithm, TestNameRule};

/// Version of the current algorithm set.
pub const ALGORITHMS_VERSION: i64 = 3;

/// Opaque cluster ID derived from a LIKE expression: the first 16 bytes of
/// its SHA-256, hex encoded.
pub fn hash_cluster_id(expression: &str) -> String {
    let digest = Sha256::digest(expression.as_bytes());
    hex::encode(&digest[..16])
}

#[derive(Debug, Clone)]
pub enum Algorithm {
    TestName {
        name: String,
        algorithm: TestNameAlgorithm,
    },
    FailureReason {
        name: String,
        algorithm: FailureReasonAlgorithm,
    },
    Rules {
        name: String,
        algorithm: RulesAlgorithm,
    },
}

impl Algorithm {
    pub fn name(&self) -> &str {
        match self {
            Algorithm::TestName { name, .. }
            | Algorithm::FailureReason { name, .. }
            | Algorithm::Rules { name, .. } => name,
        }
    }

    /// Appends the clusters of `failure` to `out`.
    pub fn cluster(&self, ruleset: &Ruleset, failure: &Failure, out: &mut Vec<ClusterId>) {
        match self {
            Algorithm::TestName { name, algorithm } => out.push(algorithm.cluster(name, failure)),
            Algorithm::FailureReason { name, algorithm } => {
                out.extend(algorithm.cluster(name, failure))
            }
            Algorithm::Rules { name, algorithm } => {
                out.extend(algorithm.cluster(name, ruleset, failure))
            }
        }
    }
}

/// The ordered list of algorithms a project's failures are clustered with.
#[derive(Debug, Clone)]
pub struct AlgorithmSet {
    version: i64,
    algorithms: Vec<Algorithm>,
}

impl AlgorithmSet {
    /// The current algorithms, with the project's test name rules.
    pub fn current(test_name_rules: &[TestNameRule]) -> Result<Self> {
        Ok(Self {
            version: ALGORITHMS_VERSION,
            algorithms: vec![
                Algorithm::FailureReason {
                    name: failurereason::ALGORITHM_NAME.to_string(),
                    algorithm: FailureReasonAlgorithm,
                },
                Algorithm::Rules {
                    name: rules::ALGORITHM_NAME.to_string(),
                    algorithm: RulesAlgorithm,
                },
                Algorithm::TestName {
                    name: testname::ALGORITHM_NAME.to_string(),
                    algorithm: TestNameAlgorithm::new(test_name_rules)?,
                },
            ],
        })
    }

    /// An explicit version and algorithm list, e.g. to reproduce results of
    /// an older release.
    pub fn with_algorithms(version: i64, algorithms: Vec<Algorithm>) -> Self {
        Self {
            version,
            algorithms,
        }
    }

    pub fn version(&self) -> i64 {
        self.version
    }

    pub fn algorithms(&self) -> &[Algorithm] {
        &self.algorithms
    }

    pub fn names(&self) -> BTreeSet<String> {
        self.algorithms
            .iter()
            .map(|algorithm| algorithm.name().to_string())
            .collect()
    }

    /// Clusters of a single failure, in canonical order without duplicates.
    pub fn cluster_failure(&self, ruleset: &Ruleset, failure: &Failure) -> Vec<ClusterId> {
        let mut clusters = Vec::new();
        for algorithm in &self.algorithms {
            algorithm.cluster(ruleset, failure, &mut clusters);
        }
        sort_clusters(&mut clusters);
        clusters.dedup();
        clusters
    }

    /// Clusters every failure of a chunk.
    pub fn cluster(&self, ruleset: &Ruleset, failures: &[Failure]) -> ClusterResults {
        ClusterResults {
            algorithms_version: self.version,
            rules_version: ruleset.rules_version,
            algorithms: self.names(),
            clusters: failures
                .iter()
                .map(|failure| self.cluster_failure(ruleset, failure))
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::FailureReason;
    use crate::rules::{BugId, FailureAssociationRule};
    use time::macros::datetime;

    fn failure(test_id: &str, reason: Option<&str>) -> Failure {
        Failure {
            test_result_id: format!("{test_id}-result"),
            test_id: test_id.to_string(),
            failure_reason: reason.map(|r| FailureReason {
                primary_error_message: r.to_string(),
            }),
            ..Failure::default()
        }
    }

    #[test]
    fn hash_is_sixteen_bytes_hex() {
        let id = hash_cluster_id("ninja://test");
        assert_eq!(id.len(), 32);
        assert!(id.bytes().all(|b| b.is_ascii_hexdigit()));
        assert_eq!(id, hash_cluster_id("ninja://test"));
    }

    #[test]
    fn clusters_every_failure_with_all_algorithms() {
        let at = datetime!(2030-01-01 0:00 UTC);
        let mut rule = FailureAssociationRule::new(
            "testproject",
            "1".repeat(32),
            "reason = 'reason_b'",
            BugId::new("buganizer", "1"),
        );
        rule.last_updated = at;
        let ruleset = Ruleset::from_rules("testproject", &[rule], at).unwrap();
        let set = AlgorithmSet::current(&[]).unwrap();

        let results = set.cluster(
            &ruleset,
            &[failure("t1", Some("reason_b")), failure("t2", None)],
        );
        assert_eq!(results.algorithms_version, ALGORITHMS_VERSION);
        assert_eq!(results.rules_version, at);
        assert_eq!(results.algorithms.len(), 3);

        let first: Vec<&str> = results.clusters[0].iter().map(|c| c.algorithm.as_str()).collect();
        assert_eq!(
            first,
            vec![
                failurereason::ALGORITHM_NAME,
                rules::ALGORITHM_NAME,
                testname::ALGORITHM_NAME
            ]
        );
        // No primary error message: failure reason clustering is skipped.
        let second: Vec<&str> = results.clusters[1].iter().map(|c| c.algorithm.as_str()).collect();
        assert_eq!(second, vec![testname::ALGORITHM_NAME]);

        let mut sorted = results.clusters[0].clone();
        sort_clusters(&mut sorted);
        assert_eq!(sorted, results.clusters[0]);
    }

    #[test]
    fn older_algorithm_sets_are_reproducible() {
        let ruleset = Ruleset::empty("testproject");
        let old = AlgorithmSet::with_algorithms(
            1,
            vec![Algorithm::TestName {
                name: "testname-v1".to_string(),
                algorithm: TestNameAlgorithm::new(&[]).unwrap(),
            }],
        );
        let results = old.cluster(&ruleset, &[failure("t1", Some("boom"))]);
        assert_eq!(results.algorithms_version, 1);
        assert_eq!(
            results.clusters[0],
            vec![ClusterId::new("testname-v1", hash_cluster_id("t1"))]
        );
    }
}
