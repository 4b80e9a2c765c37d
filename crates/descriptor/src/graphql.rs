//! GraphQL introspection and SDL-like context rendering.

use crate::capability::{Operation, OperationKind, ParamLocation, ParamSpec};
use crate::error::{DescriptorError, Result};
use reqwest::Client;
use serde_json::{Value, json};
use std::collections::BTreeMap;
use unrelated_http_tools::error::HttpToolsError;
use unrelated_http_tools::request::read_body_limited;
use unrelated_http_tools::safety::OutboundHttpSafety;
use url::Url;

pub const INTROSPECTION_QUERY: &str = r"{
  __schema {
    queryType {
      name
      fields { name description args { name type { ...TypeRef } defaultValue } type { ...TypeRef } }
    }
    mutationType {
      name
      fields { name description args { name type { ...TypeRef } defaultValue } type { ...TypeRef } }
    }
    subscriptionType { name }
    types {
      name kind description
      fields { name description args { name type { ...TypeRef } defaultValue } type { ...TypeRef } }
      enumValues { name description }
      inputFields { name type { ...TypeRef } defaultValue }
      interfaces { name }
      possibleTypes { name }
    }
  }
}
fragment TypeRef on __Type {
  name kind ofType { name kind ofType { name kind ofType { name } } }
}";

/// POST the introspection query and return `data.__schema`.
///
/// # Errors
///
/// `Unreachable` for blocked, failed or non-2xx requests; `InvalidSpec` when the body carries
/// no `__schema`.
pub async fn fetch_introspection(
    client: &Client,
    safety: &OutboundHttpSafety,
    endpoint: &str,
    headers: &BTreeMap<String, String>,
) -> Result<Value> {
    let url = Url::parse(endpoint)
        .map_err(|e| DescriptorError::invalid_spec(endpoint, format!("invalid endpoint: {e}")))?;
    safety
        .check_url(&url)
        .await
        .map_err(|e| DescriptorError::from_http(endpoint, &e))?;

    tracing::info!(target_url = %endpoint, "fetching GraphQL introspection");
    let mut request = client
        .post(url)
        .json(&json!({ "query": INTROSPECTION_QUERY }));
    for (name, value) in headers {
        request = request.header(name, value);
    }
    let response = request
        .send()
        .await
        .map_err(|e| DescriptorError::from_http(endpoint, &HttpToolsError::from(e)))?;
    let status = response.status();
    let bytes = read_body_limited(response, safety.max_response_bytes)
        .await
        .map_err(|e| DescriptorError::from_http(endpoint, &e))?;

    if !status.is_success() {
        let body = String::from_utf8_lossy(&bytes);
        let snippet: String = body.chars().take(300).collect();
        return Err(DescriptorError::unreachable(
            endpoint,
            format!("introspection returned {status}: {snippet}"),
        ));
    }

    let mut body: Value = serde_json::from_slice(&bytes).map_err(|e| {
        DescriptorError::invalid_spec(endpoint, format!("introspection body is not JSON: {e}"))
    })?;
    match body.pointer_mut("/data/__schema").map(Value::take) {
        Some(schema) if schema.is_object() => Ok(schema),
        _ => {
            let errors = body
                .get("errors")
                .map_or_else(|| "no __schema in response".to_string(), Value::to_string);
            Err(DescriptorError::invalid_spec(
                endpoint,
                format!("introspection failed: {errors}"),
            ))
        }
    }
}

/// Compact notation for an introspection type ref: `[User!]!`.
#[must_use]
pub fn format_type(t: Option<&Value>) -> String {
    let Some(t) = t.filter(|t| t.as_object().is_some_and(|o| !o.is_empty())) else {
        return "?".to_string();
    };
    match t.get("kind").and_then(Value::as_str) {
        Some("NON_NULL") => format!("{}!", format_type(t.get("ofType"))),
        Some("LIST") => format!("[{}]", format_type(t.get("ofType"))),
        _ => t
            .get("name")
            .and_then(Value::as_str)
            .unwrap_or("?")
            .to_string(),
    }
}

fn is_required(t: Option<&Value>) -> bool {
    t.and_then(|t| t.get("kind"))
        .and_then(Value::as_str)
        .is_some_and(|k| k == "NON_NULL")
}

fn str_field<'a>(v: &'a Value, key: &str) -> &'a str {
    v.get(key).and_then(Value::as_str).unwrap_or_default()
}

fn list<'a>(v: &'a Value, key: &str) -> &'a [Value] {
    v.get(key)
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or_default()
}

fn description_suffix(v: &Value) -> String {
    match v.get("description").and_then(Value::as_str) {
        Some(d) if !d.is_empty() => format!(" # {d}"),
        _ => String::new(),
    }
}

/// `name: Type` or `name: Type = default`.
#[must_use]
pub fn format_arg(arg: &Value) -> String {
    let ty = format_type(arg.get("type"));
    match arg.get("defaultValue").and_then(Value::as_str) {
        Some(default) => format!("{}: {ty} = {default}", str_field(arg, "name")),
        None => format!("{}: {ty}", str_field(arg, "name")),
    }
}

/// Indented type field with all args: `  name(a: T): Ret # desc`.
#[must_use]
pub fn format_field(field: &Value) -> String {
    let args = list(field, "args");
    let arg_str = if args.is_empty() {
        String::new()
    } else {
        let parts: Vec<String> = args.iter().map(format_arg).collect();
        format!("({})", parts.join(", "))
    };
    format!(
        "  {}{arg_str}: {}{}",
        str_field(field, "name"),
        format_type(field.get("type")),
        description_suffix(field)
    )
}

fn format_root_field(field: &Value) -> String {
    let required: Vec<String> = list(field, "args")
        .iter()
        .filter(|a| is_required(a.get("type")))
        .map(format_arg)
        .collect();
    format!(
        "{}({}) -> {}{}",
        str_field(field, "name"),
        required.join(", "),
        format_type(field.get("type")),
        description_suffix(field)
    )
}

fn of_kind<'a>(types: &[&'a Value], kind: &str) -> Vec<&'a Value> {
    types
        .iter()
        .copied()
        .filter(|t| str_field(t, "kind") == kind)
        .collect()
}

/// Render the SDL-like context for an introspected `__schema`.
#[must_use]
pub fn build_schema_context(schema: &Value) -> String {
    let queries = schema
        .get("queryType")
        .map(|q| list(q, "fields"))
        .unwrap_or_default();
    let mutations = schema
        .get("mutationType")
        .map(|q| list(q, "fields"))
        .unwrap_or_default();

    let mut root_names: Vec<&str> = vec!["Query", "Mutation", "Subscription"];
    for key in ["queryType", "mutationType", "subscriptionType"] {
        if let Some(name) = schema.pointer(&format!("/{key}/name")).and_then(Value::as_str) {
            root_names.push(name);
        }
    }

    let types: Vec<&Value> = list(schema, "types")
        .iter()
        .filter(|t| !str_field(t, "name").starts_with("__"))
        .collect();
    let objects: Vec<&Value> = of_kind(&types, "OBJECT")
        .into_iter()
        .filter(|t| !root_names.contains(&str_field(t, "name")))
        .collect();
    let enums = of_kind(&types, "ENUM");
    let inputs = of_kind(&types, "INPUT_OBJECT");
    let interfaces = of_kind(&types, "INTERFACE");
    let unions = of_kind(&types, "UNION");

    let mut lines = vec!["<queries>".to_string()];
    lines.extend(queries.iter().map(format_root_field));

    if !mutations.is_empty() {
        lines.push("\n<mutations>".to_string());
        lines.extend(mutations.iter().map(format_root_field));
    }

    if !interfaces.is_empty() {
        lines.push("\n<interfaces>".to_string());
        for t in interfaces {
            let implementors: Vec<&str> = list(t, "possibleTypes")
                .iter()
                .map(|p| str_field(p, "name"))
                .collect();
            let impl_str = if implementors.is_empty() {
                String::new()
            } else {
                format!(" # implemented by: {}", implementors.join(", "))
            };
            let fields: Vec<String> = list(t, "fields").iter().map(format_field).collect();
            lines.push(format!(
                "{} {{{impl_str}\n{}\n}}",
                str_field(t, "name"),
                fields.join("\n")
            ));
        }
    }

    if !unions.is_empty() {
        lines.push("\n<unions>".to_string());
        for t in unions {
            let members: Vec<&str> = list(t, "possibleTypes")
                .iter()
                .map(|p| str_field(p, "name"))
                .collect();
            lines.push(format!("{}: {}", str_field(t, "name"), members.join(" | ")));
        }
    }

    lines.push("\n<types>".to_string());
    for t in objects {
        let implemented: Vec<&str> = list(t, "interfaces")
            .iter()
            .map(|i| str_field(i, "name"))
            .collect();
        let impl_str = if implemented.is_empty() {
            String::new()
        } else {
            format!(" implements {}", implemented.join(", "))
        };
        let fields: Vec<String> = list(t, "fields").iter().map(format_field).collect();
        lines.push(format!(
            "{}{impl_str} {{\n{}\n}}",
            str_field(t, "name"),
            fields.join("\n")
        ));
    }

    lines.push("\n<enums>".to_string());
    for e in enums {
        let values: Vec<&str> = list(e, "enumValues")
            .iter()
            .map(|v| str_field(v, "name"))
            .collect();
        lines.push(format!("{}: {}", str_field(e, "name"), values.join(" | ")));
    }

    lines.push("\n<inputs>".to_string());
    for input in inputs {
        let fields: Vec<String> = list(input, "inputFields")
            .iter()
            .filter(|f| is_required(f.get("type")))
            .map(|f| format!("{}: {}", str_field(f, "name"), format_type(f.get("type"))))
            .collect();
        lines.push(format!("{} {{ {} }}", str_field(input, "name"), fields.join(", ")));
    }

    lines.join("\n")
}

/// Query and mutation root fields as operations. Subscriptions are never exposed.
#[must_use]
pub fn operations(schema: &Value) -> Vec<Operation> {
    let mut out = Vec::new();
    for (key, kind) in [
        ("queryType", OperationKind::Query),
        ("mutationType", OperationKind::Mutation),
    ] {
        let Some(root) = schema.get(key) else {
            continue;
        };
        for field in list(root, "fields") {
            let params = list(field, "args")
                .iter()
                .map(|a| ParamSpec {
                    name: str_field(a, "name").to_string(),
                    location: ParamLocation::Argument,
                    required: is_required(a.get("type")),
                    type_ref: format_type(a.get("type")),
                })
                .collect();
            out.push(Operation {
                name: str_field(field, "name").to_string(),
                kind,
                method: None,
                path: None,
                operation_id: None,
                params,
                returns: format_type(field.get("type")),
                summary: field
                    .get("description")
                    .and_then(Value::as_str)
                    .map(str::to_string),
            });
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scalar(name: &str) -> Value {
        json!({"name": name, "kind": "SCALAR"})
    }

    fn non_null(inner: Value) -> Value {
        json!({"kind": "NON_NULL", "ofType": inner})
    }

    fn list_of(inner: Value) -> Value {
        json!({"kind": "LIST", "ofType": inner})
    }

    #[test]
    fn type_refs_render_compactly() {
        assert_eq!(format_type(Some(&scalar("String"))), "String");
        assert_eq!(
            format_type(Some(&non_null(list_of(non_null(scalar("User")))))),
            "[User!]!"
        );
        assert_eq!(format_type(None), "?");
        assert_eq!(format_type(Some(&json!({}))), "?");
    }

    #[test]
    fn args_and_fields_show_defaults_and_descriptions() {
        let arg = json!({"name": "order", "type": scalar("String"), "defaultValue": "\"ASC\""});
        assert_eq!(format_arg(&arg), "order: String = \"ASC\"");

        let field = json!({
            "name": "team",
            "args": [],
            "type": {"name": "Team", "kind": "OBJECT"},
            "description": "Owner team"
        });
        assert_eq!(format_field(&field), "  team: Team # Owner team");
    }

    fn sample_schema() -> Value {
        json!({
            "queryType": {
                "name": "Query",
                "fields": [
                    {
                        "name": "characters",
                        "description": "List characters",
                        "args": [
                            {"name": "page", "type": scalar("Int")},
                            {"name": "token", "type": non_null(scalar("String"))}
                        ],
                        "type": {"name": "Characters", "kind": "OBJECT"}
                    }
                ]
            },
            "mutationType": {
                "name": "Mutation",
                "fields": [
                    {"name": "deleteCharacter", "args": [{"name": "id", "type": non_null(scalar("ID"))}],
                     "type": scalar("Boolean")}
                ]
            },
            "subscriptionType": {"name": "Subscription"},
            "types": [
                {"name": "Query", "kind": "OBJECT", "fields": []},
                {"name": "Mutation", "kind": "OBJECT", "fields": []},
                {"name": "__Schema", "kind": "OBJECT", "fields": []},
                {"name": "Character", "kind": "OBJECT", "interfaces": [{"name": "Node"}],
                 "fields": [{"name": "name", "args": [], "type": scalar("String"), "description": "Full name"}]},
                {"name": "Node", "kind": "INTERFACE", "possibleTypes": [{"name": "Character"}],
                 "fields": [{"name": "id", "args": [], "type": non_null(scalar("ID"))}]},
                {"name": "SearchResult", "kind": "UNION", "possibleTypes": [{"name": "Character"}, {"name": "Episode"}]},
                {"name": "Status", "kind": "ENUM", "enumValues": [{"name": "ALIVE"}, {"name": "DEAD"}]},
                {"name": "Filter", "kind": "INPUT_OBJECT", "inputFields": [
                    {"name": "id", "type": non_null(scalar("ID"))},
                    {"name": "name", "type": scalar("String")}
                ]}
            ]
        })
    }

    #[test]
    fn context_has_all_sections() {
        let ctx = build_schema_context(&sample_schema());
        assert!(ctx.contains("<queries>\ncharacters(token: String!) -> Characters # List characters"));
        assert!(ctx.contains("<mutations>\ndeleteCharacter(id: ID!) -> Boolean"));
        assert!(ctx.contains("Node { # implemented by: Character\n  id: ID!\n}"));
        assert!(ctx.contains("SearchResult: Character | Episode"));
        assert!(ctx.contains("Character implements Node {\n  name: String # Full name\n}"));
        assert!(ctx.contains("Status: ALIVE | DEAD"));
        assert!(ctx.contains("Filter { id: ID! }"));
        assert!(!ctx.contains("__Schema"));
        assert!(!ctx.contains("\nQuery "));
        assert!(!ctx.contains("\nMutation "));
    }

    #[test]
    fn empty_schema_still_has_core_sections() {
        let ctx = build_schema_context(&json!({}));
        for section in ["<queries>", "<types>", "<enums>", "<inputs>"] {
            assert!(ctx.contains(section), "{section}");
        }
        assert!(!ctx.contains("<mutations>"));
    }

    #[test]
    fn operations_cover_queries_and_mutations_only() {
        let ops = operations(&sample_schema());
        assert_eq!(ops.len(), 2);
        assert_eq!(ops[0].kind, OperationKind::Query);
        assert_eq!(ops[0].params[1].type_ref, "String!");
        assert!(ops[0].params[1].required);
        assert_eq!(ops[1].kind, OperationKind::Mutation);
        assert_eq!(ops[1].name, "deleteCharacter");
    }
}
