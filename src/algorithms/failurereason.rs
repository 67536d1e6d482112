//! Clusters failures by their primary error message, with volatile parts
//! such as numbers, hex digests and base64 blobs masked out.

use super::hash_cluster_id;
use crate::model::{ClusterId, Failure};
use crate::rules::lang::like_escape;
use regex::Regex;
use std::sync::LazyLock;

pub const ALGORITHM_NAME: &str = "reason-v2";

static MASK_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"[/+0-9a-zA-Z]{10,}=+|[\-0-9a-fA-F \t]{16,}|[0-9a-fA-Fx]{8,}|[0-9]+")
        .expect("failure reason mask pattern")
});

/// LIKE expression matching messages that differ from `message` only in
/// masked parts.
pub fn like_expression(message: &str) -> String {
    let mut like = String::with_capacity(message.len());
    let mut last = 0;
    for m in MASK_RE.find_iter(message) {
        like.push_str(&like_escape(&message[last..m.start()]));
        like.push('%');
        last = m.end();
    }
    like.push_str(&like_escape(&message[last..]));
    like
}

#[derive(Debug, Clone, Copy, Default)]
pub struct FailureReasonAlgorithm;

impl FailureReasonAlgorithm {
    /// `None` for failures without a primary error message.
    pub fn cluster(&self, name: &str, failure: &Failure) -> Option<ClusterId> {
        let message = failure.primary_error_message()?;
        Some(ClusterId::new(name, hash_cluster_id(&like_expression(message))))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::FailureReason;

    fn failure(message: Option<&str>) -> Failure {
        Failure {
            test_id: "t".to_string(),
            failure_reason: message.map(|m| FailureReason {
                primary_error_message: m.to_string(),
            }),
            ..Failure::default()
        }
    }

    #[test]
    fn masks_volatile_parts() {
        assert_eq!(
            like_expression("Expected 12 but got 345 at 0xdeadbeef00"),
            "Expected % but got % at %"
        );
        assert_eq!(
            like_expression("hash a1b2c3d4-e5f60718-29304a5b mismatch"),
            "hash%mismatch"
        );
        assert_eq!(
            like_expression("token dGhpc2lzYXRva2Vu== rejected"),
            "token % rejected"
        );
        assert_eq!(like_expression("100%_done"), "%\\%\\_done");
    }

    #[test]
    fn similar_messages_cluster_together() {
        let algorithm = FailureReasonAlgorithm;
        let a = algorithm
            .cluster(ALGORITHM_NAME, &failure(Some("timeout after 30s")))
            .unwrap();
        let b = algorithm
            .cluster(ALGORITHM_NAME, &failure(Some("timeout after 45s")))
            .unwrap();
        let c = algorithm
            .cluster(ALGORITHM_NAME, &failure(Some("crash in renderer")))
            .unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn skipped_without_message() {
        let algorithm = FailureReasonAlgorithm;
        assert!(algorithm.cluster(ALGORITHM_NAME, &failure(None)).is_none());
        assert!(algorithm.cluster(ALGORITHM_NAME, &failure(Some(""))).is_none());
    }
}
