//! Clusters failures by the failure association rules they match.

use crate::model::{ClusterId, Failure};
use crate::rules::{Attributes, Ruleset};

pub const ALGORITHM_NAME: &str = "rules-v0";

#[derive(Debug, Clone, Copy, Default)]
pub struct RulesAlgorithm;

impl RulesAlgorithm {
    /// One cluster per matching active rule, in rule ID order.
    pub fn cluster(&self, name: &str, ruleset: &Ruleset, failure: &Failure) -> Vec<ClusterId> {
        let attrs = Attributes {
            test: &failure.test_id,
            reason: failure.primary_error_message().unwrap_or(""),
        };
        ruleset
            .matching_rules(&attrs)
            .into_iter()
            .map(|rule_id| ClusterId::new(name, rule_id))
            .collect()
    }
}
