//! Call specifications and classified call results.

use crate::semantics::parse_graphql_operations;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// GraphQL call: `{query, variables}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct GraphqlCall {
    pub query: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variables: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operation_name: Option<String>,
    /// Table name override for ingestion.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

/// REST call: `{method, path, params, body}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct RestCall {
    pub method: String,
    pub path: String,
    #[serde(default, alias = "path_params", skip_serializing_if = "Map::is_empty")]
    pub path_params: Map<String, Value>,
    #[serde(
        default,
        alias = "query_params",
        alias = "query",
        skip_serializing_if = "Map::is_empty"
    )]
    pub query_params: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<Value>,
    /// Table name override for ingestion.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CallSpec {
    Graphql(GraphqlCall),
    Rest(RestCall),
}

impl CallSpec {
    #[must_use]
    pub fn rest(method: &str, path: &str) -> Self {
        Self::Rest(RestCall {
            method: method.to_ascii_uppercase(),
            path: path.to_string(),
            path_params: Map::new(),
            query_params: Map::new(),
            body: None,
            name: None,
        })
    }

    #[must_use]
    pub fn graphql(query: &str) -> Self {
        Self::Graphql(GraphqlCall {
            query: query.to_string(),
            variables: None,
            operation_name: None,
            name: None,
        })
    }

    #[must_use]
    pub fn name_override(&self) -> Option<&str> {
        match self {
            Self::Graphql(c) => c.name.as_deref(),
            Self::Rest(c) => c.name.as_deref(),
        }
    }

    /// Path used for policy and poll-pattern matching. For GraphQL this is the operation name
    /// (falling back to the first root field).
    #[must_use]
    pub fn match_target(&self) -> String {
        match self {
            Self::Rest(c) => c.path.clone(),
            Self::Graphql(c) => graphql_label(c).unwrap_or_default(),
        }
    }

    /// Default table signature when neither a name override nor a capability-model match exists.
    #[must_use]
    pub fn default_signature(&self) -> String {
        if let Some(n) = self.name_override() {
            return n.to_string();
        }
        match self {
            Self::Rest(c) => canonical_name(&c.method, &c.path),
            Self::Graphql(c) => graphql_label(c).unwrap_or_else(|| "graphql_result".to_string()),
        }
    }

    /// Short human-readable description for logs and call listings.
    #[must_use]
    pub fn describe(&self) -> String {
        match self {
            Self::Rest(c) => format!("{} {}", c.method.to_ascii_uppercase(), c.path),
            Self::Graphql(c) => {
                let label = graphql_label(c).unwrap_or_else(|| "anonymous".to_string());
                format!("graphql {label}")
            }
        }
    }
}

fn graphql_label(call: &GraphqlCall) -> Option<String> {
    if let Some(op) = &call.operation_name {
        return Some(op.clone());
    }
    let ops = parse_graphql_operations(&call.query).ok()?;
    let op = ops.first()?;
    op.name
        .clone()
        .or_else(|| op.root_fields.first().cloned())
}

/// Generate a canonical identifier from method and path: `GET /users/{id}` → `get_users_id`.
#[must_use]
pub fn canonical_name(method: &str, path: &str) -> String {
    let raw = format!("{}_{}", method.to_ascii_lowercase(), path);
    let mut name = String::with_capacity(raw.len());
    let mut last_underscore = false;
    for ch in raw.chars() {
        if ch.is_ascii_alphanumeric() {
            name.push(ch);
            last_underscore = false;
        } else if !last_underscore {
            name.push('_');
            last_underscore = true;
        }
    }
    let mut name = name.trim_matches('_').to_string();
    name.truncate(64);
    name
}

/// Where a call is sent and which headers are forwarded.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Endpoint {
    /// GraphQL endpoint URL, or REST base URL. `None` when a REST spec declares no server.
    pub base_url: Option<String>,
    pub headers: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallStatus {
    Ok,
    Pending,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CallErrorKind {
    Network,
    Auth,
    RateLimited,
    Validation,
    Upstream,
    /// Rejected by outbound safety before leaving the process.
    Blocked,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallError {
    pub kind: CallErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HttpMeta {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
    pub attempts: u32,
    pub latency_ms: u64,
    /// `Location` header of an accepted (async) response.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    /// GraphQL `errors` returned alongside partial `data`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub graphql_errors: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallResult {
    pub status: CallStatus,
    pub payload: Value,
    pub meta: HttpMeta,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<CallError>,
}

impl CallResult {
    #[must_use]
    pub fn failed(kind: CallErrorKind, message: impl Into<String>, meta: HttpMeta) -> Self {
        Self {
            status: CallStatus::Error,
            payload: Value::Null,
            meta,
            error: Some(CallError {
                kind,
                message: message.into(),
            }),
        }
    }

    #[must_use]
    pub fn is_ok(&self) -> bool {
        self.status == CallStatus::Ok
    }

    #[must_use]
    pub fn is_pending(&self) -> bool {
        self.status == CallStatus::Pending
    }
}
