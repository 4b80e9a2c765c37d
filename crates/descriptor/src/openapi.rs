//! OpenAPI loading, normalization and compact context rendering.

use crate::capability::{Operation, OperationKind, ParamLocation, ParamSpec};
use crate::error::{DescriptorError, Result};
use crate::resolver::{DocId, RefResolver, is_http};
use openapiv3::{
    OpenAPI, Operation as ApiOperation, Parameter, ParameterSchemaOrContent, ReferenceOr, Schema,
    StatusCode,
};
use reqwest::{Client, Method};
use serde_json::{Map, Value};
use std::collections::HashMap;
use unrelated_http_tools::call::canonical_name;
use unrelated_http_tools::error::HttpToolsError;
use unrelated_http_tools::request::read_body_limited;
use unrelated_http_tools::safety::OutboundHttpSafety;
use unrelated_http_tools::semantics::{MethodClass, classify_method};
use url::Url;

/// Everything the resolver needs from a REST target.
#[derive(Debug, Clone)]
pub struct RestDescription {
    pub raw: Value,
    pub base_url: Option<String>,
    pub operations: Vec<Operation>,
    pub context: String,
    pub title: Option<String>,
}

/// Load, parse and normalize the OpenAPI document at `location`.
///
/// # Errors
///
/// `Unreachable` when the document cannot be fetched or read, `InvalidSpec` when it does not
/// parse as OpenAPI 3.x.
pub async fn describe(
    location: &str,
    base_url_override: Option<&str>,
    client: &Client,
    safety: &OutboundHttpSafety,
) -> Result<RestDescription> {
    let content = load_spec_text(location, client, safety).await?;

    // JSON is a subset of YAML, so serde_yaml alone is enough.
    let raw: Value = serde_yaml::from_str(&content)
        .map_err(|e| DescriptorError::invalid_spec(location, format!("unparseable document: {e}")))?;
    if !raw.is_object() {
        return Err(DescriptorError::invalid_spec(
            location,
            "document is not an object",
        ));
    }
    let spec: OpenAPI = serde_json::from_value(raw.clone())
        .map_err(|e| DescriptorError::invalid_spec(location, format!("not OpenAPI 3.x: {e}")))?;

    let base_url = match base_url_override.map(str::trim).filter(|b| !b.is_empty()) {
        Some(b) => Some(b.to_string()),
        None => spec
            .servers
            .first()
            .and_then(|server| resolve_server_url(location, server)),
    };

    let root_doc = DocId::parse(location)?;
    let resolver = RefResolver::new(root_doc, &spec, client, safety)?;
    let operations = normalize(&spec, &resolver).await;
    let context = build_schema_context(&raw);

    tracing::info!(
        spec = %location,
        operations = operations.len(),
        base_url = base_url.as_deref().unwrap_or("<none>"),
        "OpenAPI spec normalized"
    );

    Ok(RestDescription {
        raw,
        base_url,
        operations,
        context,
        title: Some(spec.info.title.clone()).filter(|t| !t.is_empty()),
    })
}

async fn load_spec_text(
    location: &str,
    client: &Client,
    safety: &OutboundHttpSafety,
) -> Result<String> {
    if !is_http(location) {
        tracing::info!(spec = %location, "loading OpenAPI spec from file");
        let path = location.strip_prefix("file://").unwrap_or(location);
        return tokio::fs::read_to_string(path)
            .await
            .map_err(|e| DescriptorError::unreachable(location, e.to_string()));
    }

    tracing::info!(spec = %location, "fetching OpenAPI spec");
    let url = Url::parse(location)
        .map_err(|e| DescriptorError::invalid_spec(location, format!("invalid spec URL: {e}")))?;
    safety
        .check_url(&url)
        .await
        .map_err(|e| DescriptorError::from_http(location, &e))?;
    let resp = client
        .get(url)
        .send()
        .await
        .map_err(|e| DescriptorError::from_http(location, &HttpToolsError::from(e)))?;
    let status = resp.status();
    if !status.is_success() {
        return Err(DescriptorError::unreachable(
            location,
            format!("spec fetch returned {status}"),
        ));
    }
    let bytes = read_body_limited(resp, safety.max_response_bytes)
        .await
        .map_err(|e| DescriptorError::from_http(location, &e))?;
    String::from_utf8(bytes)
        .map_err(|e| DescriptorError::invalid_spec(location, format!("spec is not UTF-8: {e}")))
}

/// Resolve `servers[0]` (substituting variable defaults), joining relative URLs against the
/// spec URL.
fn resolve_server_url(location: &str, server: &openapiv3::Server) -> Option<String> {
    let mut url = server.url.clone();
    if let Some(vars) = &server.variables {
        for (name, var) in vars {
            url = url.replace(&format!("{{{name}}}"), &var.default);
        }
    }
    if is_http(&url) {
        return Some(url);
    }
    if is_http(location) {
        let mut spec_url = Url::parse(location).ok()?;
        spec_url.set_fragment(None);
        return spec_url.join(&url).ok().map(|u| u.to_string());
    }
    tracing::warn!(
        spec = %location,
        server = %url,
        "relative server URL in a file spec; set Base-URL"
    );
    None
}

const METHODS: [&str; 7] = ["GET", "POST", "PUT", "DELETE", "PATCH", "HEAD", "OPTIONS"];

/// Normalize every path/method into an [`Operation`]; unresolvable ones are skipped.
pub async fn normalize(spec: &OpenAPI, resolver: &RefResolver<'_>) -> Vec<Operation> {
    let mut out = Vec::new();
    for (path, path_item) in &spec.paths.paths {
        let (path_doc, path_item) = match resolver.resolve(resolver.root(), path_item).await {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!(path = %path, error = %e, "skipping unresolvable path");
                continue;
            }
        };

        let method_ops = [
            &path_item.get,
            &path_item.post,
            &path_item.put,
            &path_item.delete,
            &path_item.patch,
            &path_item.head,
            &path_item.options,
        ];
        for (method, op) in METHODS.iter().zip(method_ops) {
            let Some(op) = op else {
                continue;
            };
            match normalize_operation(resolver, &path_doc, method, path, &path_item.parameters, op)
                .await
            {
                Ok(operation) => out.push(operation),
                Err(e) => {
                    tracing::warn!(
                        method = %method,
                        path = %path,
                        error = %e,
                        "skipping unresolvable operation"
                    );
                }
            }
        }
    }
    out
}

async fn normalize_operation(
    resolver: &RefResolver<'_>,
    doc: &DocId,
    method: &str,
    path: &str,
    path_params: &[ReferenceOr<Parameter>],
    op: &ApiOperation,
) -> Result<Operation> {
    let mut params = Vec::new();
    for (_, param) in merge_parameters(resolver, doc, path_params, &op.parameters).await? {
        let (location, data) = match &param {
            Parameter::Path { parameter_data, .. } => (ParamLocation::Path, parameter_data),
            Parameter::Query { parameter_data, .. } => (ParamLocation::Query, parameter_data),
            Parameter::Header { parameter_data, .. } => (ParamLocation::Header, parameter_data),
            Parameter::Cookie { parameter_data, .. } => (ParamLocation::Cookie, parameter_data),
        };
        let type_ref = match &data.format {
            ParameterSchemaOrContent::Schema(s) => schema_ref_type(s, &data.name),
            ParameterSchemaOrContent::Content(_) => "str".to_string(),
        };
        params.push(ParamSpec {
            name: data.name.clone(),
            location,
            required: data.required || location == ParamLocation::Path,
            type_ref,
        });
    }

    if let Some(body) = &op.request_body {
        let (_, body) = resolver.resolve(doc, body).await?;
        if let Some(schema) = json_media(&body.content).and_then(|m| m.schema.as_ref()) {
            params.push(ParamSpec {
                name: "body".to_string(),
                location: ParamLocation::Body,
                required: body.required,
                type_ref: schema_ref_type(schema, ""),
            });
        }
    }

    let returns = response_type(resolver, doc, op).await?;
    let parsed_method = Method::from_bytes(method.as_bytes()).unwrap_or(Method::GET);
    let kind = match classify_method(&parsed_method) {
        MethodClass::Read => OperationKind::Read,
        MethodClass::Write | MethodClass::Unknown => OperationKind::Write,
    };

    Ok(Operation {
        name: canonical_name(method, path),
        kind,
        method: Some(method.to_string()),
        path: Some(path.to_string()),
        operation_id: op.operation_id.clone(),
        params,
        returns,
        summary: op.summary.clone().or_else(|| op.description.clone()),
    })
}

fn json_media(
    content: &openapiv3::Content,
) -> Option<&openapiv3::MediaType> {
    content.get("application/json").or_else(|| {
        content.iter().find_map(|(k, v)| {
            let lower = k.to_ascii_lowercase();
            lower.contains("json").then_some(v)
        })
    })
}

async fn response_type(
    resolver: &RefResolver<'_>,
    doc: &DocId,
    op: &ApiOperation,
) -> Result<String> {
    let mut explicit_2xx: Vec<(u16, &ReferenceOr<openapiv3::Response>)> = Vec::new();
    let mut range_2xx = None;
    for (code, resp) in &op.responses.responses {
        match code {
            StatusCode::Code(n) if (200..300).contains(n) => explicit_2xx.push((*n, resp)),
            StatusCode::Range(2) => range_2xx = Some(resp),
            _ => {}
        }
    }
    explicit_2xx.sort_by_key(|(n, _)| *n);
    let resp_ref = explicit_2xx
        .first()
        .map(|(_, r)| *r)
        .or(range_2xx)
        .or(op.responses.default.as_ref());
    let Some(resp_ref) = resp_ref else {
        return Ok("any".to_string());
    };

    let (_, resp) = resolver.resolve(doc, resp_ref).await?;
    let Some(schema) = json_media(&resp.content).and_then(|m| m.schema.as_ref()) else {
        return Ok("any".to_string());
    };
    Ok(schema_ref_type(schema, ""))
}

fn schema_ref_type(schema: &ReferenceOr<Schema>, field_name: &str) -> String {
    match schema {
        ReferenceOr::Reference { reference } => ref_name(reference).to_string(),
        ReferenceOr::Item(item) => serde_json::to_value(item)
            .map(|v| schema_to_type(Some(&v), field_name))
            .unwrap_or_else(|_| "any".to_string()),
    }
}

async fn merge_parameters(
    resolver: &RefResolver<'_>,
    current_doc: &DocId,
    path_item_params: &[ReferenceOr<Parameter>],
    operation_params: &[ReferenceOr<Parameter>],
) -> Result<Vec<(DocId, Parameter)>> {
    fn key_for(p: &Parameter) -> (&'static str, String) {
        match p {
            Parameter::Path { parameter_data, .. } => ("path", parameter_data.name.clone()),
            Parameter::Query { parameter_data, .. } => ("query", parameter_data.name.clone()),
            Parameter::Header { parameter_data, .. } => ("header", parameter_data.name.clone()),
            Parameter::Cookie { parameter_data, .. } => ("cookie", parameter_data.name.clone()),
        }
    }

    let mut merged: Vec<(DocId, Parameter)> = Vec::new();
    let mut index: HashMap<(&'static str, String), usize> = HashMap::new();

    for p in path_item_params.iter().chain(operation_params) {
        let (doc, rp) = resolver.resolve(current_doc, p).await?;
        let k = key_for(&rp);
        if let Some(i) = index.get(&k).copied() {
            merged[i] = (doc, rp);
        } else {
            index.insert(k, merged.len());
            merged.push((doc, rp));
        }
    }

    Ok(merged)
}

fn ref_name(reference: &str) -> &str {
    reference.rsplit('/').next().unwrap_or(reference)
}

/// Infer a string format from a field name (`departDateTime` → `date-time`).
#[must_use]
pub fn infer_string_format(field_name: &str) -> &'static str {
    let lower = field_name.to_ascii_lowercase();
    if lower.is_empty() || lower.contains("update") {
        ""
    } else if lower.ends_with("datetime") {
        "date-time"
    } else if lower.ends_with("date") {
        "date"
    } else if lower.ends_with("time") {
        "time"
    } else {
        ""
    }
}

/// Compact type notation for a raw JSON schema.
#[must_use]
pub fn schema_to_type(schema: Option<&Value>, field_name: &str) -> String {
    let Some(obj) = schema.and_then(Value::as_object).filter(|o| !o.is_empty()) else {
        return "any".to_string();
    };
    if let Some(reference) = obj.get("$ref").and_then(Value::as_str) {
        return ref_name(reference).to_string();
    }

    let ty = match obj.get("type") {
        Some(Value::String(t)) => Some(t.as_str()),
        // OpenAPI 3.1 nullable types: ["string", "null"].
        Some(Value::Array(types)) => Some(
            types
                .iter()
                .filter_map(Value::as_str)
                .find(|t| *t != "null")
                .unwrap_or("null"),
        ),
        _ => None,
    };

    match ty {
        Some("string") => {
            let format = obj
                .get("format")
                .and_then(Value::as_str)
                .filter(|f| !f.is_empty())
                .unwrap_or_else(|| infer_string_format(field_name));
            if format.is_empty() {
                "str".to_string()
            } else {
                format!("str({format})")
            }
        }
        Some("integer") => "int".to_string(),
        Some("number") => "float".to_string(),
        Some("boolean") => "bool".to_string(),
        Some("array") => format!("{}[]", schema_to_type(obj.get("items"), "")),
        Some("object") => match obj.get("additionalProperties") {
            Some(ap @ Value::Object(_)) => format!("dict[str, {}]", schema_to_type(Some(ap), "")),
            _ => "object".to_string(),
        },
        Some(_) => "any".to_string(),
        None => composite_type(obj).unwrap_or_else(|| {
            if obj.contains_key("properties") {
                "object".to_string()
            } else {
                "any".to_string()
            }
        }),
    }
}

fn composite_type(obj: &Map<String, Value>) -> Option<String> {
    for (key, sep) in [("oneOf", " | "), ("anyOf", " | "), ("allOf", " & ")] {
        if let Some(Value::Array(parts)) = obj.get(key) {
            let rendered: Vec<String> = parts
                .iter()
                .map(|p| schema_to_type(Some(p), ""))
                .filter(|t| t != "any")
                .collect();
            if !rendered.is_empty() {
                return Some(rendered.join(sep));
            }
        }
    }
    None
}

fn required_names(schema: &Map<String, Value>) -> Vec<&str> {
    // Malformed specs put lists or objects into `required`; only strings count.
    schema
        .get("required")
        .and_then(Value::as_array)
        .map(|r| r.iter().filter_map(Value::as_str).collect())
        .unwrap_or_default()
}

/// Render one named component schema.
#[must_use]
pub fn format_schema(name: &str, schema: &Value) -> String {
    let Some(obj) = schema.as_object() else {
        return format!("{name}: any");
    };
    if let Some(Value::Array(values)) = obj.get("enum") {
        let values: Vec<String> = values
            .iter()
            .map(|v| match v {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            })
            .collect();
        return format!("{name}: enum({})", values.join(" | "));
    }
    if let Some(Value::Object(props)) = obj.get("properties") {
        let required = required_names(obj);
        let fields: Vec<String> = props
            .iter()
            .filter(|(field, _)| required.contains(&field.as_str()))
            .map(|(field, s)| format!("{field}: {}!", schema_to_type(Some(s), field)))
            .collect();
        return format!("{name} {{ {} }}", fields.join(", "));
    }
    format!("{name}: {}", schema_to_type(Some(schema), name))
}

fn resolve_local<'a>(raw: &'a Value, v: &'a Value) -> &'a Value {
    match v.get("$ref").and_then(Value::as_str) {
        Some(r) if r.starts_with("#/") => raw.pointer(&r[1..]).unwrap_or(v),
        _ => v,
    }
}

fn format_params(raw: &Value, params: &[&Value]) -> Vec<String> {
    params
        .iter()
        .map(|p| resolve_local(raw, p))
        .filter(|p| {
            p.get("in").and_then(Value::as_str) == Some("path")
                || p.get("required").and_then(Value::as_bool) == Some(true)
        })
        .map(|p| {
            let name = p.get("name").and_then(Value::as_str).unwrap_or_default();
            format!("{name}: {}", schema_to_type(p.get("schema"), name))
        })
        .collect()
}

fn json_schema_of<'a>(content: Option<&'a Value>) -> Option<&'a Value> {
    let content = content?.as_object()?;
    let media = content.get("application/json").or_else(|| {
        content
            .iter()
            .find(|(k, _)| k.to_ascii_lowercase().contains("json"))
            .map(|(_, v)| v)
    })?;
    media.get("schema")
}

fn endpoint_return(raw: &Value, op: &Value) -> String {
    let Some(responses) = op.get("responses").and_then(Value::as_object) else {
        return "any".to_string();
    };
    let mut codes: Vec<&String> = responses.keys().filter(|c| c.starts_with('2')).collect();
    codes.sort();
    let resp = codes
        .first()
        .and_then(|c| responses.get(*c))
        .or_else(|| responses.get("default"));
    let Some(resp) = resp.map(|r| resolve_local(raw, r)) else {
        return "any".to_string();
    };
    schema_to_type(json_schema_of(resp.get("content")), "")
}

fn format_endpoint(raw: &Value, method: &str, path: &str, item: &Value, op: &Value) -> String {
    let mut params: Vec<&Value> = Vec::new();
    let mut seen: Vec<(String, String)> = Vec::new();
    // Operation-level parameters override path-level ones with the same name and location.
    for p in op
        .get("parameters")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .chain(item.get("parameters").and_then(Value::as_array).into_iter().flatten())
    {
        let resolved = resolve_local(raw, p);
        let key = (
            resolved.get("name").and_then(Value::as_str).unwrap_or_default().to_string(),
            resolved.get("in").and_then(Value::as_str).unwrap_or_default().to_string(),
        );
        if !seen.contains(&key) {
            seen.push(key);
            params.push(p);
        }
    }

    let mut parts = format_params(raw, &params);
    if let Some(body) = op.get("requestBody").map(|b| resolve_local(raw, b))
        && let Some(schema) = json_schema_of(body.get("content"))
    {
        let required = body.get("required").and_then(Value::as_bool) == Some(true);
        let bang = if required { "!" } else { "" };
        parts.push(format!("body: {}{bang}", schema_to_type(Some(schema), "")));
    }

    let summary = op
        .get("summary")
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(|s| format!(" # {s}"))
        .unwrap_or_default();
    format!(
        "{} {path}({}) -> {}{summary}",
        method.to_ascii_uppercase(),
        parts.join(", "),
        endpoint_return(raw, op)
    )
}

fn format_auth(name: &str, scheme: &Value) -> String {
    let get = |k: &str| scheme.get(k).and_then(Value::as_str).unwrap_or_default();
    match get("type") {
        "http" => {
            let mut s = format!("{name}: HTTP {}", get("scheme"));
            if !get("bearerFormat").is_empty() {
                s.push(' ');
                s.push_str(get("bearerFormat"));
            }
            s
        }
        "apiKey" => format!("{name}: API key in {} '{}'", get("in"), get("name")),
        "oauth2" => format!("{name}: OAuth2"),
        "openIdConnect" => format!("{name}: OpenID Connect"),
        other => format!("{name}: {other}"),
    }
}

/// Render `<endpoints>`, `<schemas>` and `<auth>` for a raw OpenAPI document.
///
/// Sections without content are omitted; an empty document renders as an empty string.
#[must_use]
pub fn build_schema_context(raw: &Value) -> String {
    let mut sections: Vec<String> = Vec::new();

    let mut endpoints = Vec::new();
    if let Some(paths) = raw.get("paths").and_then(Value::as_object) {
        for (path, item) in paths {
            let item = resolve_local(raw, item);
            for method in METHODS {
                if let Some(op) = item.get(method.to_ascii_lowercase()) {
                    endpoints.push(format_endpoint(raw, method, path, item, op));
                }
            }
        }
    }
    if !endpoints.is_empty() {
        sections.push(format!("<endpoints>\n{}", endpoints.join("\n")));
    }

    let components = raw.get("components");
    if let Some(schemas) = components
        .and_then(|c| c.get("schemas"))
        .and_then(Value::as_object)
        .filter(|s| !s.is_empty())
    {
        let rendered: Vec<String> = schemas
            .iter()
            .map(|(name, schema)| format_schema(name, schema))
            .collect();
        sections.push(format!("<schemas>\n{}", rendered.join("\n")));
    }

    if let Some(schemes) = components
        .and_then(|c| c.get("securitySchemes"))
        .and_then(Value::as_object)
        .filter(|s| !s.is_empty())
    {
        let rendered: Vec<String> = schemes
            .iter()
            .map(|(name, scheme)| format_auth(name, resolve_local(raw, scheme)))
            .collect();
        sections.push(format!("<auth>\n{}", rendered.join("\n")));
    }

    sections.join("\n\n")
}
