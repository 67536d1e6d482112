//! Failure association rules: expression language, durable store, and the
//! per-project compiled ruleset cache.

pub mod cache;
pub mod lang;
pub mod store;

pub use cache::{CachedRule, Ruleset, RulesetCache, RulesetSource};
pub use lang::{Attributes, RuleExpression};
pub use store::{generate_id, BugId, FailureAssociationRule, RuleStore};

use time::macros::datetime;
use time::OffsetDateTime;

/// Rules version of a project that has never had a rule, and the attempt
/// time of the synthetic run returned for projects never re-clustered.
pub const STARTING_EPOCH: OffsetDateTime = datetime!(1900-01-01 0:00 UTC);
