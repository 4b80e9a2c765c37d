//! `${name.dot.path}` placeholders inside JSON call specs.

use serde_json::Value;
use unrelated_http_tools::request::value_to_string;

/// Look up a dot path (`results.0.id`) in `value`; numeric segments index arrays.
#[must_use]
pub fn value_at_path<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    if path.is_empty() {
        return Some(value);
    }
    let mut current = value;
    for key in path.split('.') {
        current = match current {
            Value::Object(map) => map.get(key)?,
            Value::Array(items) => items.get(key.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    if current.is_null() { None } else { Some(current) }
}

/// Names referenced by placeholders anywhere in `value` (the part before the first `.`).
#[must_use]
pub fn referenced_names(value: &Value) -> Vec<String> {
    let mut out = Vec::new();
    walk_strings(value, &mut |s| {
        for expr in placeholders(s) {
            let name = expr.split('.').next().unwrap_or(expr).to_string();
            if !out.contains(&name) {
                out.push(name);
            }
        }
    });
    out
}

/// Replace placeholders using `resolve(name)` as the root of each path.
///
/// A string that is exactly one placeholder takes the referenced JSON value as-is; otherwise
/// values are interpolated as text.
///
/// # Errors
///
/// Returns the unresolved expression when a name or path does not exist.
pub fn render<'a>(
    value: &Value,
    resolve: &dyn Fn(&str) -> Option<&'a Value>,
) -> Result<Value, String> {
    match value {
        Value::String(s) => render_str(s, resolve),
        Value::Array(items) => items
            .iter()
            .map(|v| render(v, resolve))
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Array),
        Value::Object(map) => {
            let mut out = serde_json::Map::new();
            for (k, v) in map {
                out.insert(k.clone(), render(v, resolve)?);
            }
            Ok(Value::Object(out))
        }
        other => Ok(other.clone()),
    }
}

fn render_str<'a>(s: &str, resolve: &dyn Fn(&str) -> Option<&'a Value>) -> Result<Value, String> {
    let lookup = |expr: &str| -> Result<&'a Value, String> {
        let (name, path) = expr.split_once('.').unwrap_or((expr, ""));
        resolve(name)
            .and_then(|root| value_at_path(root, path))
            .ok_or_else(|| format!("unresolved reference ${{{expr}}}"))
    };

    let exprs = placeholders(s);
    if exprs.is_empty() {
        return Ok(Value::String(s.to_string()));
    }
    if exprs.len() == 1 && s.trim() == format!("${{{}}}", exprs[0]) {
        return lookup(exprs[0]).cloned();
    }

    let mut out = String::with_capacity(s.len());
    let mut rest = s;
    while let Some(start) = rest.find("${") {
        let Some(len) = rest[start + 2..].find('}') else {
            break;
        };
        out.push_str(&rest[..start]);
        out.push_str(&value_to_string(lookup(&rest[start + 2..start + 2 + len])?));
        rest = &rest[start + 2 + len + 1..];
    }
    out.push_str(rest);
    Ok(Value::String(out))
}

fn placeholders(s: &str) -> Vec<&str> {
    let mut out = Vec::new();
    let mut rest = s;
    while let Some(start) = rest.find("${") {
        let Some(len) = rest[start + 2..].find('}') else {
            break;
        };
        let expr = rest[start + 2..start + 2 + len].trim();
        if !expr.is_empty() {
            out.push(expr);
        }
        rest = &rest[start + 2 + len + 1..];
    }
    out
}

fn walk_strings(value: &Value, f: &mut dyn FnMut(&str)) {
    match value {
        Value::String(s) => f(s),
        Value::Array(items) => items.iter().for_each(|v| walk_strings(v, f)),
        Value::Object(map) => map.values().for_each(|v| walk_strings(v, f)),
        _ => {}
    }
}
