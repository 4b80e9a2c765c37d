//! Normalized capability model shared by GraphQL and REST targets.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApiKind {
    Graphql,
    Rest,
}

impl ApiKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Graphql => "graphql",
            Self::Rest => "rest",
        }
    }

    /// Label used in tool descriptions (`REST`, `GraphQL`).
    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            Self::Graphql => "GraphQL",
            Self::Rest => "REST",
        }
    }
}

impl fmt::Display for ApiKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ApiKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "graphql" => Ok(Self::Graphql),
            "rest" => Ok(Self::Rest),
            other => Err(format!("unknown API type '{other}' (expected graphql or rest)")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    /// GraphQL query root field.
    Query,
    /// GraphQL mutation root field.
    Mutation,
    /// REST safe method.
    Read,
    /// REST state-changing method.
    Write,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParamLocation {
    Path,
    Query,
    Header,
    Cookie,
    Body,
    /// GraphQL field argument.
    Argument,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParamSpec {
    pub name: String,
    pub location: ParamLocation,
    pub required: bool,
    /// Compact type notation (`str`, `int[]`, `ID!`, `User`).
    pub type_ref: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Operation {
    /// Stable identifier: GraphQL field name, or REST canonical `method_path`.
    pub name: String,
    pub kind: OperationKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    /// REST path template (`/users/{id}`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operation_id: Option<String>,
    pub params: Vec<ParamSpec>,
    pub returns: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CapabilityModel {
    pub operations: Vec<Operation>,
    /// Size-bounded text rendering for the planner.
    pub schema_context: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
}

impl CapabilityModel {
    /// Find the REST operation whose path template matches a concrete `path`.
    ///
    /// Exact template matches win over placeholder matches.
    #[must_use]
    pub fn match_rest(&self, method: &str, path: &str) -> Option<&Operation> {
        let path = path.split('?').next().unwrap_or(path);
        let mut best: Option<(&Operation, usize)> = None;
        for op in &self.operations {
            let (Some(m), Some(template)) = (&op.method, &op.path) else {
                continue;
            };
            if !m.eq_ignore_ascii_case(method) {
                continue;
            }
            let Some(literals) = template_matches(template, path) else {
                continue;
            };
            if best.is_none_or(|(_, n)| literals > n) {
                best = Some((op, literals));
            }
        }
        best.map(|(op, _)| op)
    }

    #[must_use]
    pub fn operation(&self, name: &str) -> Option<&Operation> {
        self.operations.iter().find(|op| op.name == name)
    }
}

/// Match `path` against a `{param}` template; returns the number of literal segments matched.
fn template_matches(template: &str, path: &str) -> Option<usize> {
    let t: Vec<&str> = template.trim_matches('/').split('/').collect();
    let p: Vec<&str> = path.trim_matches('/').split('/').collect();
    if t.len() != p.len() {
        return None;
    }
    let mut literals = 0usize;
    for (ts, ps) in t.iter().zip(&p) {
        if ts.starts_with('{') && ts.ends_with('}') {
            if ps.is_empty() {
                return None;
            }
        } else if ts == ps {
            literals += 1;
        } else {
            return None;
        }
    }
    Some(literals)
}

/// A resolved target API: immutable, shared as `Arc`.
#[derive(Debug, Clone)]
pub struct TargetDescriptor {
    pub kind: ApiKind,
    /// GraphQL endpoint or REST spec location.
    pub target_url: String,
    /// Effective base URL for calls (GraphQL endpoint, or REST server URL).
    pub base_url: Option<String>,
    pub auth_headers: BTreeMap<String, String>,
    /// Pretty-printed raw introspection result or OpenAPI document.
    pub raw_schema: Arc<String>,
    pub capability: CapabilityModel,
    pub resolved_at: Instant,
}

impl TargetDescriptor {
    #[must_use]
    pub fn schema_context(&self) -> &str {
        &self.capability.schema_context
    }

    /// Regex search over the raw schema, see [`crate::search::search_schema`].
    ///
    /// # Errors
    ///
    /// Returns an error if `pattern` is not a valid regex.
    pub fn search_schema(
        &self,
        pattern: &str,
        options: &crate::search::SearchOptions,
    ) -> crate::error::Result<String> {
        crate::search::search_schema(&self.raw_schema, pattern, options)
    }
}
