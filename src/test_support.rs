//! Builders for chunks, failures and clustering state entries used by tests
//! and benchmarks.

use crate::model::{Chunk, ClusterId, ClusterResults, Entry, Failure, FailureReason};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};
use time::macros::datetime;
use time::OffsetDateTime;

/// A deterministic, well distributed chunk ID.
pub fn chunk_id_for(i: u64) -> String {
    let digest = Sha256::digest(format!("chunk-{i}").as_bytes());
    hex::encode(&digest[..16])
}

/// A failure of test `ninja://test/{i % 7}` without a failure reason.
pub fn failure(i: usize) -> Failure {
    Failure {
        test_result_id: format!("result-{i}"),
        test_id: format!("ninja://test/{}", i % 7),
        variant: BTreeMap::from([("builder".to_string(), "linux-rel".to_string())]),
        failure_reason: None,
        is_exonerated: false,
    }
}

/// A failure with the given primary error message.
pub fn failure_with_reason(i: usize, message: &str) -> Failure {
    Failure {
        failure_reason: Some(FailureReason {
            primary_error_message: message.to_string(),
        }),
        ..failure(i)
    }
}

/// A chunk of `size` failures. Reasons are drawn from a small vocabulary so
/// that failures share clusters.
pub fn generate_chunk(size: usize, seed: u64) -> Chunk {
    const REASONS: [&str; 5] = [
        "Check failed: buffer != nullptr",
        "timeout after 30s waiting for 0x7ffe1234",
        "reason_b",
        "assertion failed: left == right (3 vs 4)",
        "",
    ];
    let mut rng = StdRng::seed_from_u64(seed);
    let failures = (0..size)
        .map(|i| {
            let reason = REASONS[rng.random_range(0..REASONS.len())];
            if reason.is_empty() {
                failure(i)
            } else {
                failure_with_reason(i, reason)
            }
        })
        .collect();
    Chunk { failures }
}

pub fn entry_builder(i: u64) -> EntryBuilder {
    EntryBuilder::new(i)
}

/// Builds valid, already clustered entries.
#[derive(Debug, Clone)]
pub struct EntryBuilder {
    index: u64,
    project: String,
    failures: usize,
    algorithms_version: i64,
    rules_version: OffsetDateTime,
}

impl EntryBuilder {
    pub fn new(index: u64) -> Self {
        Self {
            index,
            project: "testproject".to_string(),
            failures: 2,
            algorithms_version: 1,
            rules_version: datetime!(2029-12-01 0:00 UTC),
        }
    }

    pub fn with_project(mut self, project: &str) -> Self {
        self.project = project.to_string();
        self
    }

    pub fn with_failures(mut self, failures: usize) -> Self {
        self.failures = failures.max(1);
        self
    }

    pub fn with_algorithms_version(mut self, version: i64) -> Self {
        self.algorithms_version = version;
        self
    }

    pub fn with_rules_version(mut self, version: OffsetDateTime) -> Self {
        self.rules_version = version;
        self
    }

    pub fn build(self) -> Entry {
        let algorithms: BTreeSet<String> = ["alg-a", "alg-b"].iter().map(|s| s.to_string()).collect();
        let clusters = (0..self.failures)
            .map(|f| {
                let mut clusters = vec![ClusterId::new("alg-a", format!("{:02x}", f % 3))];
                if f % 2 == 0 {
                    clusters.push(ClusterId::new("alg-b", format!("{:02x}", self.index % 5)));
                }
                clusters
            })
            .collect();
        Entry {
            project: self.project,
            chunk_id: chunk_id_for(self.index),
            partition_time: datetime!(2029-11-30 0:00 UTC),
            object_id: format!("object-{}", self.index),
            clustering: ClusterResults {
                algorithms_version: self.algorithms_version,
                rules_version: self.rules_version,
                algorithms,
                clusters,
            },
            last_updated: None,
        }
    }
}
