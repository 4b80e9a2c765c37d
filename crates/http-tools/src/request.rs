//! Request building helpers shared by the executor and the descriptor fetchers.

use crate::error::{HttpToolsError, Result};
use base64::Engine as _;
use mime::Mime;
use serde_json::{Map, Value, json};
use url::Url;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryPair {
    pub key: String,
    pub value: String,
}

/// Substitute `{name}` placeholders in `path` with `path_params` values.
///
/// # Errors
///
/// Returns an error if a placeholder remains without a value.
pub fn substitute_path_params(path: &str, path_params: &Map<String, Value>) -> Result<String> {
    let mut out = if path.starts_with('/') {
        path.to_string()
    } else {
        format!("/{path}")
    };
    for (name, value) in path_params {
        let encoded = encode_path_segment(&value_to_string(value));
        out = out.replace(&format!("{{{name}}}"), &encoded);
    }
    if let (Some(open), Some(close)) = (out.find('{'), out.find('}'))
        && open < close
    {
        return Err(HttpToolsError::InvalidRequest(format!(
            "Missing path parameter '{}' for path '{path}'",
            &out[open + 1..close]
        )));
    }
    Ok(out)
}

/// Flatten a JSON object of query parameters into ordered pairs.
///
/// `null` values are dropped, arrays repeat the key (form/explode), objects are JSON-encoded.
#[must_use]
pub fn query_pairs(params: &Map<String, Value>) -> Vec<QueryPair> {
    let mut out = Vec::new();
    for (key, value) in params {
        match value {
            Value::Null => {}
            Value::Array(items) => {
                for item in items.iter().filter(|v| !v.is_null()) {
                    out.push(QueryPair {
                        key: key.clone(),
                        value: value_to_string(item),
                    });
                }
            }
            other => out.push(QueryPair {
                key: key.clone(),
                value: value_to_string(other),
            }),
        }
    }
    out
}

/// Join `base_url` and `path`, then append the encoded query string.
///
/// # Errors
///
/// Returns an error if no base URL is provided or the joined URL is invalid.
pub fn build_url(base_url: Option<&str>, path: &str, query_params: &[QueryPair]) -> Result<Url> {
    let base_url = base_url.map(str::trim).unwrap_or_default();
    if base_url.is_empty() {
        return Err(HttpToolsError::InvalidRequest(
            "No base URL provided (set the Base-URL header or declare servers in the spec)"
                .to_string(),
        ));
    }
    let url = format!("{}{}", base_url.trim_end_matches('/'), path);
    let mut url =
        Url::parse(&url).map_err(|e| HttpToolsError::InvalidRequest(format!("Invalid URL: {e}")))?;

    if !query_params.is_empty() {
        let mut query = url.query().map(str::to_string).unwrap_or_default();
        for p in query_params {
            if !query.is_empty() {
                query.push('&');
            }
            query.push_str(&encode_query_component(&p.key));
            query.push('=');
            query.push_str(&encode_query_component(&p.value));
        }
        url.set_query(Some(&query));
    }

    Ok(url)
}

fn encode_query_component(s: &str) -> String {
    percent_encode(s, |b| is_unreserved(b))
}

fn encode_path_segment(s: &str) -> String {
    percent_encode(s, |b| is_unreserved(b) || matches!(b, b':' | b'@'))
}

fn percent_encode(s: &str, keep: impl Fn(u8) -> bool) -> String {
    const HEX: &[u8; 16] = b"0123456789ABCDEF";
    let mut out = String::with_capacity(s.len());
    for &b in s.as_bytes() {
        if keep(b) {
            out.push(b as char);
        } else {
            out.push('%');
            out.push(HEX[(b >> 4) as usize] as char);
            out.push(HEX[(b & 0x0F) as usize] as char);
        }
    }
    out
}

fn is_unreserved(b: u8) -> bool {
    matches!(b, b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'.' | b'_' | b'~')
}

#[must_use]
pub fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Null => String::new(),
        _ => value.to_string(),
    }
}

/// Read a response body, enforcing `max_bytes` when set.
///
/// # Errors
///
/// Returns [`HttpToolsError::TooLarge`] if the body exceeds the limit, or a transport error if
/// reading fails.
pub async fn read_body_limited(
    mut response: reqwest::Response,
    max_bytes: Option<usize>,
) -> Result<Vec<u8>> {
    let Some(max) = max_bytes else {
        let bytes = response.bytes().await.map_err(HttpToolsError::from)?;
        return Ok(bytes.to_vec());
    };

    if let Some(len) = response.content_length()
        && len > max as u64
    {
        return Err(HttpToolsError::TooLarge(format!(
            "{len} bytes (limit {max})"
        )));
    }

    let mut out: Vec<u8> = Vec::new();
    while let Some(chunk) = response.chunk().await.map_err(HttpToolsError::from)? {
        if out.len().saturating_add(chunk.len()) > max {
            return Err(HttpToolsError::TooLarge(format!("exceeded {max} bytes")));
        }
        out.extend_from_slice(&chunk);
    }

    Ok(out)
}

/// Decode a response body: JSON when it parses, plain text otherwise, base64 for binary.
#[must_use]
pub fn decode_body(bytes: &[u8], content_type: Option<&str>) -> Value {
    if bytes.is_empty() {
        return Value::Null;
    }
    let Ok(text) = std::str::from_utf8(bytes) else {
        let b64 = base64::engine::general_purpose::STANDARD.encode(bytes);
        return json!({
            "encoding": "base64",
            "mimeType": content_type,
            "data": b64
        });
    };

    let looks_json = content_type
        .and_then(|ct| ct.parse::<Mime>().ok())
        .is_some_and(|m| m.subtype() == mime::JSON || m.suffix() == Some(mime::JSON));
    match serde_json::from_str::<Value>(text) {
        Ok(v) => v,
        Err(_) if looks_json => Value::String(text.to_string()),
        Err(_) => Value::String(text.to_string()),
    }
}
