//! Clusters failures by test name.
//!
//! Projects configure rules of the form `{pattern, like_template}`. The first
//! rule whose pattern matches the test ID turns it into a LIKE expression by
//! substituting named capture groups into the template; the cluster ID is a
//! hash of that expression. Tests no rule matches are clustered by their
//! exact ID.

use super::hash_cluster_id;
use crate::error::{Error, Result};
use crate::model::{ClusterId, Failure};
use crate::rules::lang::like_escape;
use regex::Regex;
use serde::{Deserialize, Serialize};

pub const ALGORITHM_NAME: &str = "testname-v3";

/// A test name clustering rule as written in project configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestNameRule {
    pub name: String,
    /// Regex matched against the test ID; use named groups to capture parts.
    pub pattern: String,
    /// LIKE expression with `${group}` substitutions and `$$` for a literal `$`.
    pub like_template: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum TemplatePart {
    Literal(String),
    Group(String),
}

/// A compiled [`TestNameRule`].
#[derive(Debug, Clone)]
pub struct TestNameMatcher {
    name: String,
    pattern: Regex,
    template: Vec<TemplatePart>,
}

impl TestNameMatcher {
    pub fn compile(rule: &TestNameRule) -> Result<Self> {
        let pattern = Regex::new(&rule.pattern).map_err(|err| {
            Error::validation(format!("test name rule {:?}: pattern: {err}", rule.name))
        })?;
        let template = parse_template(&rule.like_template).map_err(|err| {
            Error::validation(format!("test name rule {:?}: like_template: {err}", rule.name))
        })?;
        for part in &template {
            if let TemplatePart::Group(group) = part {
                if !pattern.capture_names().flatten().any(|name| name == group) {
                    return Err(Error::validation(format!(
                        "test name rule {:?}: like_template references unknown group {group:?}",
                        rule.name
                    )));
                }
            }
        }
        Ok(Self {
            name: rule.name.clone(),
            pattern,
            template,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The LIKE expression for `test_id`, if the pattern matches it.
    pub fn evaluate(&self, test_id: &str) -> Option<String> {
        let captures = self.pattern.captures(test_id)?;
        let mut like = String::new();
        for part in &self.template {
            match part {
                TemplatePart::Literal(text) => like.push_str(text),
                TemplatePart::Group(group) => {
                    if let Some(value) = captures.name(group) {
                        like.push_str(&like_escape(value.as_str()));
                    }
                }
            }
        }
        Some(like)
    }
}

fn parse_template(template: &str) -> std::result::Result<Vec<TemplatePart>, String> {
    let mut parts = Vec::new();
    let mut literal = String::new();
    let mut rest = template;
    while let Some(pos) = rest.find('$') {
        literal.push_str(&rest[..pos]);
        let after = &rest[pos + 1..];
        if let Some(stripped) = after.strip_prefix('$') {
            literal.push('$');
            rest = stripped;
        } else if let Some(body) = after.strip_prefix('{') {
            let end = body
                .find('}')
                .ok_or_else(|| "unterminated ${ substitution".to_string())?;
            let group = &body[..end];
            if group.is_empty() || !group.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
                return Err(format!("invalid substitution ${{{group}}}"));
            }
            if !literal.is_empty() {
                parts.push(TemplatePart::Literal(std::mem::take(&mut literal)));
            }
            parts.push(TemplatePart::Group(group.to_string()));
            rest = &body[end + 1..];
        } else {
            return Err("invalid use of $; use $$ for a literal $".to_string());
        }
    }
    literal.push_str(rest);
    if !literal.is_empty() {
        parts.push(TemplatePart::Literal(literal));
    }
    Ok(parts)
}

#[derive(Debug, Clone)]
pub struct TestNameAlgorithm {
    matchers: Vec<TestNameMatcher>,
}

impl TestNameAlgorithm {
    pub fn new(rules: &[TestNameRule]) -> Result<Self> {
        let matchers = rules
            .iter()
            .map(TestNameMatcher::compile)
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { matchers })
    }

    /// The LIKE expression identifying the failure's cluster.
    pub fn like_expression(&self, test_id: &str) -> String {
        self.matchers
            .iter()
            .find_map(|matcher| matcher.evaluate(test_id))
            .unwrap_or_else(|| like_escape(test_id))
    }

    pub fn cluster(&self, name: &str, failure: &Failure) -> ClusterId {
        ClusterId::new(name, hash_cluster_id(&self.like_expression(&failure.test_id)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn blink_rule() -> TestNameRule {
        TestNameRule {
            name: "Blink Web Tests".to_string(),
            pattern: r"^ninja://:blink_web_tests/(virtual/[^/]+/)?(?P<testname>([^/]+/)+[^/]+\.[a-zA-Z]+).*$".to_string(),
            like_template: "ninja://:blink\\_web\\_tests/%${testname}%".to_string(),
        }
    }

    #[test]
    fn substitutes_and_escapes_groups() {
        let matcher = TestNameMatcher::compile(&blink_rule()).unwrap();
        assert_eq!(
            matcher
                .evaluate("ninja://:blink_web_tests/virtual/abc/fast/my_test.html?q=1")
                .unwrap(),
            "ninja://:blink\\_web\\_tests/%fast/my\\_test.html%"
        );
        assert_eq!(matcher.evaluate("ninja://:other/test.html"), None);
    }

    #[test]
    fn dollar_escapes() {
        let rule = TestNameRule {
            name: "dollars".to_string(),
            pattern: "^(?P<id>.*)$".to_string(),
            like_template: "$$${id}$$".to_string(),
        };
        let matcher = TestNameMatcher::compile(&rule).unwrap();
        assert_eq!(matcher.evaluate("x").unwrap(), "$x$");
    }

    #[test]
    fn invalid_templates_rejected() {
        for template in ["${", "$x", "${unknown}", "${bad-name}", "trailing$"] {
            let rule = TestNameRule {
                name: "r".to_string(),
                pattern: "^(?P<id>.*)$".to_string(),
                like_template: template.to_string(),
            };
            assert!(
                TestNameMatcher::compile(&rule).is_err(),
                "{template:?} should be rejected"
            );
        }
        let bad_pattern = TestNameRule {
            name: "r".to_string(),
            pattern: "(".to_string(),
            like_template: "%".to_string(),
        };
        assert!(TestNameMatcher::compile(&bad_pattern).is_err());
    }

    #[test]
    fn first_matching_rule_wins_and_default_is_exact() {
        let algorithm = TestNameAlgorithm::new(&[
            blink_rule(),
            TestNameRule {
                name: "catch-all".to_string(),
                pattern: "^ninja://(?P<rest>.*)$".to_string(),
                like_template: "ninja://${rest}".to_string(),
            },
        ])
        .unwrap();
        assert_eq!(
            algorithm.like_expression("ninja://:blink_web_tests/a/b.html"),
            "ninja://:blink\\_web\\_tests/%a/b.html%"
        );
        assert_eq!(algorithm.like_expression("ninja://x_y"), "ninja://x\\_y");
        assert_eq!(algorithm.like_expression("plain_test"), "plain\\_test");
    }

    #[test]
    fn equivalent_tests_share_a_cluster() {
        let algorithm = TestNameAlgorithm::new(&[blink_rule()]).unwrap();
        let a = Failure {
            test_id: "ninja://:blink_web_tests/virtual/v1/fast/t.html".to_string(),
            ..Failure::default()
        };
        let b = Failure {
            test_id: "ninja://:blink_web_tests/fast/t.html".to_string(),
            ..Failure::default()
        };
        assert_eq!(
            algorithm.cluster(ALGORITHM_NAME, &a),
            algorithm.cluster(ALGORITHM_NAME, &b)
        );
        assert_eq!(algorithm.cluster(ALGORITHM_NAME, &a).id.len(), 32);
    }
}
