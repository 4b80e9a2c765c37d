//! Public tool names and descriptions for a bound target.

use crate::binding::RequestBinding;
use serde::Serialize;
use serde_json::{Value, json};
use unrelated_api_descriptor::capability::ApiKind;
use url::Url;

pub const MAX_PREFIX_LEN: usize = 32;

const QUERY_DESCRIPTION: &str = "Ask questions about the API in natural language. The bridge reads \
the schema, runs the needed calls, loads the results into a queryable store and can post-process \
them with SQL. Returns the answer and the calls made (reusable with the execute tool).";

const EXECUTE_DESCRIPTION: &str = "Execute a GraphQL query or REST call directly and load the \
result into the session store. Returns a size-bounded view of the resulting table.";

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolDescriptor {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
}

/// Host portion of a target URL; file targets use their file stem.
#[must_use]
pub fn target_host(target_url: &str) -> String {
    match Url::parse(target_url) {
        Ok(url) if url.scheme() != "file" => url.host_str().unwrap_or_default().to_string(),
        Ok(url) => stem(url.path()),
        Err(_) => stem(target_url),
    }
}

fn stem(path: &str) -> String {
    let file = path.rsplit('/').next().unwrap_or(path);
    file.split('.').next().unwrap_or(file).to_string()
}

/// Tool prefix from the `API-Name` header, or derived from the target host with its TLD dropped.
#[must_use]
pub fn tool_prefix(api_name: Option<&str>, target_url: &str) -> String {
    let raw = match api_name {
        Some(name) => name.to_string(),
        None => {
            let host = target_host(target_url);
            match host.rsplit_once('.') {
                Some((rest, tld)) if is_tld(tld) => rest.to_string(),
                _ => host,
            }
        }
    };
    let mut prefix: String = raw
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_lowercase()
            } else {
                '_'
            }
        })
        .collect();
    prefix.truncate(MAX_PREFIX_LEN);
    let prefix = prefix.trim_matches('_');
    if prefix.is_empty() {
        "api".to_string()
    } else {
        prefix.to_string()
    }
}

fn is_tld(label: &str) -> bool {
    !label.is_empty() && label.chars().all(|c| c.is_ascii_alphabetic())
}

/// `[<host> REST API] <description>`.
#[must_use]
pub fn describe(kind: ApiKind, host: &str, description: &str) -> String {
    format!("[{host} {} API] {description}", kind.label())
}

/// The two public tools for `binding`: `<prefix>_query` and `<prefix>_execute`.
#[must_use]
pub fn tools(binding: &RequestBinding) -> Vec<ToolDescriptor> {
    let prefix = tool_prefix(binding.api_name.as_deref(), &binding.target_url);
    let host = target_host(&binding.target_url);
    vec![
        ToolDescriptor {
            name: format!("{prefix}_query"),
            description: describe(binding.api_kind, &host, QUERY_DESCRIPTION),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "question": {"type": "string", "description": "Natural language question about the API"}
                },
                "required": ["question"]
            }),
        },
        ToolDescriptor {
            name: format!("{prefix}_execute"),
            description: describe(binding.api_kind, &host, EXECUTE_DESCRIPTION),
            input_schema: execute_schema(binding.api_kind),
        },
    ]
}

fn execute_schema(kind: ApiKind) -> Value {
    let call = match kind {
        ApiKind::Graphql => json!({
            "type": "object",
            "properties": {
                "query": {"type": "string"},
                "variables": {"type": "object"},
                "operationName": {"type": "string"},
                "name": {"type": "string", "description": "Table name for the result"}
            },
            "required": ["query"]
        }),
        ApiKind::Rest => json!({
            "type": "object",
            "properties": {
                "method": {"type": "string"},
                "path": {"type": "string"},
                "pathParams": {"type": "object"},
                "query": {"type": "object"},
                "body": {},
                "name": {"type": "string", "description": "Table name for the result"}
            },
            "required": ["method", "path"]
        }),
    };
    json!({
        "type": "object",
        "properties": {
            "call": call,
            "poll": {
                "type": "object",
                "properties": {
                    "check": {"type": "object"},
                    "doneField": {"type": "string"},
                    "doneValue": {"type": "string"},
                    "delayMs": {"type": "integer"}
                }
            }
        },
        "required": ["call"]
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefix_drops_tld_and_sanitizes() {
        assert_eq!(
            tool_prefix(None, "https://flights-api.example.com/openapi.json"),
            "flights_api_example"
        );
        assert_eq!(tool_prefix(Some("Rick & Morty"), "https://x.dev"), "rick___morty");
        assert_eq!(tool_prefix(None, "/specs/petstore.yaml"), "petstore");
        assert_eq!(tool_prefix(None, "http://127.0.0.1:8080/graphql"), "127_0_0_1");
        let long = tool_prefix(Some(&"a".repeat(50)), "https://x.dev");
        assert_eq!(long.len(), MAX_PREFIX_LEN);
    }

    #[test]
    fn descriptions_carry_host_and_kind() {
        assert_eq!(
            describe(ApiKind::Rest, "flights-api.example.com", "Ask questions."),
            "[flights-api.example.com REST API] Ask questions."
        );
        assert_eq!(
            describe(ApiKind::Graphql, "catalog-graphql.example.com", ""),
            "[catalog-graphql.example.com GraphQL API] "
        );
    }
}
