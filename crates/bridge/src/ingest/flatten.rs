//! Payload → rows: row extraction, nested-object flattening and column typing.

use serde::Serialize;
use serde_json::{Map, Value};
use std::fmt;

/// Nesting depth up to which objects are flattened into `parent_child` columns.
pub const MAX_FLATTEN_DEPTH: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ColumnType {
    Integer,
    Real,
    Text,
    Boolean,
    /// Arrays and objects nested deeper than [`MAX_FLATTEN_DEPTH`], stored as JSON text.
    Opaque,
}

impl ColumnType {
    /// Observed type of a JSON value; `null` fixes no type.
    #[must_use]
    pub fn of(value: &Value) -> Option<Self> {
        match value {
            Value::Null => None,
            Value::Bool(_) => Some(Self::Boolean),
            Value::Number(n) if n.is_i64() => Some(Self::Integer),
            Value::Number(_) => Some(Self::Real),
            Value::String(_) => Some(Self::Text),
            Value::Array(_) | Value::Object(_) => Some(Self::Opaque),
        }
    }

    /// Widen `self` to accept `other`. Only `integer` + `real` widens (to `real`).
    #[must_use]
    pub fn widen(self, other: Self) -> Option<Self> {
        match (self, other) {
            (a, b) if a == b => Some(a),
            (Self::Integer, Self::Real) | (Self::Real, Self::Integer) => Some(Self::Real),
            _ => None,
        }
    }

    #[must_use]
    pub fn sql_type(self) -> &'static str {
        match self {
            Self::Integer => "INTEGER",
            Self::Real => "REAL",
            Self::Text | Self::Opaque => "TEXT",
            Self::Boolean => "BOOLEAN",
        }
    }
}

impl fmt::Display for ColumnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Integer => "INTEGER",
            Self::Real => "REAL",
            Self::Text => "TEXT",
            Self::Boolean => "BOOLEAN",
            Self::Opaque => "JSON",
        })
    }
}

/// Pick the rows out of a payload.
///
/// Arrays yield one row per element. Objects yield the first array-valued field, descend
/// through single-field object wrappers (`data`, GraphQL root fields), or become one row.
/// Scalars become `{value}`; `null` yields nothing.
#[must_use]
pub fn extract_rows(payload: &Value) -> Vec<Map<String, Value>> {
    let mut current = payload;
    loop {
        match current {
            Value::Null => return Vec::new(),
            Value::Array(items) => return items.iter().map(as_row).collect(),
            Value::Object(map) => {
                if let Some(items) = map.values().find_map(Value::as_array) {
                    return items.iter().map(as_row).collect();
                }
                if map.len() == 1
                    && let Some(inner @ Value::Object(_)) = map.values().next()
                {
                    current = inner;
                    continue;
                }
                return vec![map.clone()];
            }
            scalar => return vec![as_row(scalar)],
        }
    }
}

fn as_row(value: &Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map.clone(),
        other => {
            let mut row = Map::new();
            row.insert("value".to_string(), other.clone());
            row
        }
    }
}

/// Flatten nested objects into `parent_child` columns; arrays and objects below
/// [`MAX_FLATTEN_DEPTH`] become opaque JSON values. Keys are sanitized to SQL identifiers and
/// an existing key always wins over a flattened name.
#[must_use]
pub fn flatten_row(row: &Map<String, Value>) -> Map<String, Value> {
    let mut out = Map::new();
    flatten_into(&mut out, "", row, 1);
    out
}

fn flatten_into(out: &mut Map<String, Value>, prefix: &str, obj: &Map<String, Value>, depth: usize) {
    // Direct values first so they shadow flattened names.
    for (key, value) in obj {
        if matches!(value, Value::Object(_)) && depth < MAX_FLATTEN_DEPTH {
            continue;
        }
        insert_unique(out, column_name(&format!("{prefix}{key}")), value.clone());
    }
    for (key, value) in obj {
        if let Value::Object(nested) = value
            && depth < MAX_FLATTEN_DEPTH
        {
            flatten_into(out, &format!("{prefix}{key}_"), nested, depth + 1);
        }
    }
}

fn insert_unique(out: &mut Map<String, Value>, name: String, value: Value) {
    if out.keys().any(|k| k.eq_ignore_ascii_case(&name)) {
        return;
    }
    out.insert(name, value);
}

/// Sanitize to a SQL identifier: `[A-Za-z0-9_]`, not starting with a digit, never empty.
#[must_use]
pub fn column_name(raw: &str) -> String {
    let mut name: String = raw
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
        .collect();
    if name.is_empty() {
        name.push_str("col");
    }
    if name.starts_with(|c: char| c.is_ascii_digit()) {
        name.insert(0, '_');
    }
    name
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn graphql_wrappers_descend_to_the_list() {
        let payload = json!({"characters": {"info": {"count": 2}, "results": [
            {"id": "1", "name": "Rick"},
            {"id": "2", "name": "Morty"}
        ]}});
        let rows = extract_rows(&payload);
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[1]["name"], "Morty");
    }

    #[test]
    fn shapes_without_lists() {
        assert!(extract_rows(&Value::Null).is_empty());
        assert_eq!(extract_rows(&json!(5))[0]["value"], 5);
        assert_eq!(extract_rows(&json!(["a", {"b": 1}]))[0]["value"], "a");
        let rows = extract_rows(&json!({"id": 1, "owner": {"name": "x"}}));
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["owner"]["name"], "x");
        assert!(extract_rows(&json!([])).is_empty());
    }

    #[test]
    fn nested_objects_flatten_to_depth_three() {
        let row = json!({
            "id": 1,
            "origin": {"name": "Earth", "geo": {"lat": 1.5, "deep": {"x": 1}}},
            "episodes": ["S01E01"],
            "origin_name": "kept"
        });
        let flat = flatten_row(row.as_object().expect("object"));
        assert_eq!(flat["origin_name"], "kept");
        assert_eq!(flat["origin_geo_lat"], 1.5);
        assert_eq!(flat["origin_geo_deep"], json!({"x": 1}));
        assert_eq!(flat["episodes"], json!(["S01E01"]));
        assert!(!flat.contains_key("origin"));
    }

    #[test]
    fn column_names_are_identifiers() {
        assert_eq!(column_name("first-name"), "first_name");
        assert_eq!(column_name("2fa"), "_2fa");
        assert_eq!(column_name(""), "col");
    }

    #[test]
    fn only_numeric_types_widen() {
        assert_eq!(
            ColumnType::Integer.widen(ColumnType::Real),
            Some(ColumnType::Real)
        );
        assert_eq!(ColumnType::Text.widen(ColumnType::Integer), None);
        assert_eq!(ColumnType::of(&json!(1)), Some(ColumnType::Integer));
        assert_eq!(ColumnType::of(&json!(1.25)), Some(ColumnType::Real));
        assert_eq!(ColumnType::of(&Value::Null), None);
    }
}
