//! Default-deny mutation policy.
//!
//! Reads are always allowed. REST writes and GraphQL mutations need an explicit allow pattern;
//! GraphQL subscriptions are never allowed. Authorization runs before any network access.

use crate::error::{BridgeError, Result};
use reqwest::Method;
use serde::Serialize;
use unrelated_http_tools::call::{CallSpec, GraphqlCall, RestCall};
use unrelated_http_tools::glob::{glob_match, matches_any};
use unrelated_http_tools::semantics::{
    GraphqlOperationKind, MethodClass, classify_method, parse_graphql_operations,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum PolicyMode {
    ReadOnly,
    Extended,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SafetyPolicy {
    allow_patterns: Vec<String>,
    poll_patterns: Vec<String>,
}

impl SafetyPolicy {
    #[must_use]
    pub fn new(allow_patterns: Vec<String>, poll_patterns: Vec<String>) -> Self {
        Self {
            allow_patterns,
            poll_patterns,
        }
    }

    #[must_use]
    pub fn read_only() -> Self {
        Self::new(Vec::new(), Vec::new())
    }

    #[must_use]
    pub fn mode(&self) -> PolicyMode {
        if self.allow_patterns.is_empty() {
            PolicyMode::ReadOnly
        } else {
            PolicyMode::Extended
        }
    }

    #[must_use]
    pub fn allow_patterns(&self) -> &[String] {
        &self.allow_patterns
    }

    #[must_use]
    pub fn poll_patterns(&self) -> &[String] {
        &self.poll_patterns
    }

    #[must_use]
    pub fn is_poll_path(&self, path: &str) -> bool {
        matches_any(&self.poll_patterns, path)
    }

    /// Decide whether `call` may execute.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::PolicyDenied`] (message contains "not allowed") or
    /// [`BridgeError::Validation`] for an unparseable GraphQL document.
    pub fn authorize(&self, call: &CallSpec) -> Result<()> {
        match call {
            CallSpec::Rest(c) => self.authorize_rest(c),
            CallSpec::Graphql(c) => self.authorize_graphql(c),
        }
    }

    fn authorize_rest(&self, call: &RestCall) -> Result<()> {
        let method = call.method.to_ascii_uppercase();
        let class = Method::from_bytes(method.as_bytes())
            .map_or(MethodClass::Unknown, |m| classify_method(&m));
        match class {
            MethodClass::Read => Ok(()),
            MethodClass::Write if matches_any(&self.allow_patterns, &call.path) => Ok(()),
            MethodClass::Write => Err(BridgeError::PolicyDenied(format!(
                "{method} {} not allowed (read-only mode; add a matching Allow-Unsafe-Paths pattern)",
                call.path
            ))),
            MethodClass::Unknown => Err(BridgeError::PolicyDenied(format!(
                "method {method} not allowed"
            ))),
        }
    }

    fn authorize_graphql(&self, call: &GraphqlCall) -> Result<()> {
        let ops = parse_graphql_operations(&call.query)
            .map_err(|e| BridgeError::Validation(format!("invalid GraphQL document: {e}")))?;
        // Multi-operation documents: only the selected operation runs.
        let selected: Vec<_> = match &call.operation_name {
            Some(name) => ops
                .iter()
                .filter(|op| op.name.as_deref() == Some(name.as_str()))
                .collect(),
            None => ops.iter().collect(),
        };
        if selected.is_empty() {
            return Err(BridgeError::Validation(
                "GraphQL document has no matching operation".to_string(),
            ));
        }

        for op in selected {
            match op.kind {
                GraphqlOperationKind::Query => {}
                GraphqlOperationKind::Subscription => {
                    return Err(BridgeError::PolicyDenied(
                        "GraphQL subscriptions are not allowed".to_string(),
                    ));
                }
                GraphqlOperationKind::Mutation => {
                    let by_name = op
                        .name
                        .as_deref()
                        .is_some_and(|n| matches_any(&self.allow_patterns, n));
                    let by_fields = !op.root_fields.is_empty()
                        && op.root_fields.iter().all(|f| {
                            self.allow_patterns.iter().any(|p| glob_match(p, f))
                        });
                    if !(by_name || by_fields) {
                        let label = op
                            .name
                            .clone()
                            .unwrap_or_else(|| op.root_fields.join(", "));
                        return Err(BridgeError::PolicyDenied(format!(
                            "mutation {label} not allowed (read-only mode; add a matching Allow-Unsafe-Paths pattern)"
                        )));
                    }
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    fn rest(method: &str, path: &str) -> CallSpec {
        CallSpec::rest(method, path)
    }

    #[test]
    fn reads_always_pass() {
        let p = SafetyPolicy::read_only();
        for m in ["GET", "head", "OPTIONS"] {
            p.authorize(&rest(m, "/anything")).expect("read allowed");
        }
        assert_eq!(p.mode(), PolicyMode::ReadOnly);
    }

    #[test]
    fn writes_need_a_matching_glob() {
        let p = SafetyPolicy::new(vec!["/api/booking/search/*".to_string()], Vec::new());
        assert_eq!(p.mode(), PolicyMode::Extended);
        p.authorize(&rest("POST", "/api/booking/search/flights"))
            .expect("matched");
        let err = p
            .authorize(&rest("POST", "/api/booking/search"))
            .expect_err("prefix only");
        assert_eq!(err.kind(), ErrorKind::PolicyDenied);
        assert!(err.to_string().contains("not allowed"));

        for m in ["PUT", "DELETE", "PATCH"] {
            let err = SafetyPolicy::read_only()
                .authorize(&rest(m, "/users/1"))
                .expect_err("write denied");
            assert!(err.to_string().contains("not allowed"));
        }
    }

    #[test]
    fn unknown_methods_are_denied() {
        let p = SafetyPolicy::new(vec!["*".to_string()], Vec::new());
        let err = p.authorize(&rest("PURGE", "/cache")).expect_err("unknown");
        assert_eq!(err.kind(), ErrorKind::PolicyDenied);
    }

    #[test]
    fn graphql_mutations_default_deny() {
        let p = SafetyPolicy::read_only();
        p.authorize(&CallSpec::graphql("{ characters { results { name } } }"))
            .expect("query allowed");
        let err = p
            .authorize(&CallSpec::graphql(
                "mutation { createCharacter(name: \"x\") { id } }",
            ))
            .expect_err("mutation denied");
        assert_eq!(err.kind(), ErrorKind::PolicyDenied);
        assert!(err.to_string().contains("not allowed"));
    }

    #[test]
    fn graphql_mutations_allowed_by_name_or_all_root_fields() {
        let p = SafetyPolicy::new(vec!["create*".to_string()], Vec::new());
        p.authorize(&CallSpec::graphql(
            "mutation { createUser(name: \"a\") { id } createTeam(name: \"b\") { id } }",
        ))
        .expect("all fields match");
        p.authorize(&CallSpec::graphql(
            "mutation createStuff { deleteUser(id: 1) { id } }",
        ))
        .expect("operation name matches");
        p.authorize(&CallSpec::graphql(
            "mutation { createUser(name: \"a\") { id } deleteUser(id: 1) { id } }",
        ))
        .expect_err("one field unmatched");
    }

    #[test]
    fn subscriptions_never_pass() {
        let p = SafetyPolicy::new(vec!["*".to_string()], Vec::new());
        let err = p
            .authorize(&CallSpec::graphql("subscription { ticks { at } }"))
            .expect_err("subscription");
        assert!(err.to_string().contains("not allowed"));
    }

    #[test]
    fn poll_patterns_match_paths() {
        let p = SafetyPolicy::new(Vec::new(), vec!["/jobs/*".to_string()]);
        assert!(p.is_poll_path("/jobs/42"));
        assert!(!p.is_poll_path("/users/42"));
    }
}
