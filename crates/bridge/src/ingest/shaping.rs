//! Bounding table views for the caller's context window.

use super::flatten::ColumnType;
use serde_json::{Map, Value, json};

pub const DEFAULT_MAX_CONTEXT_CHARS: usize = 32_000;

/// Shape `rows` of `table` into `{table, rows, truncated, data}`.
///
/// When the serialized rows exceed `max_chars`, `data` keeps the longest prefix of whole rows
/// that fits and `showing`, `schema` and `hint` are added.
#[must_use]
pub fn truncate_for_context(rows: &[Map<String, Value>], table: &str, max_chars: usize) -> Value {
    let full = serde_json::to_string(rows).unwrap_or_default();
    if full.len() <= max_chars {
        return json!({
            "table": table,
            "rows": rows.len(),
            "truncated": false,
            "data": rows,
        });
    }

    // `[` + rows joined by `,` + `]`
    let mut used = 2usize;
    let mut keep = 0usize;
    for (i, row) in rows.iter().enumerate() {
        let len = serde_json::to_string(row).map(|s| s.len()).unwrap_or(usize::MAX);
        let cost = len.saturating_add(usize::from(i > 0));
        if used.saturating_add(cost) > max_chars {
            break;
        }
        used += cost;
        keep += 1;
    }

    json!({
        "table": table,
        "rows": rows.len(),
        "truncated": true,
        "showing": keep,
        "data": &rows[..keep],
        "schema": schema_summary(rows),
        "hint": format!(
            "Showing {keep} of {} rows. Query table '{table}' with SQL to filter or aggregate the rest.",
            rows.len()
        ),
    })
}

/// `column TYPE, ...` in first-seen order, typed by the first non-null value.
#[must_use]
pub fn schema_summary(rows: &[Map<String, Value>]) -> String {
    let mut columns: Vec<(&str, Option<ColumnType>)> = Vec::new();
    for row in rows {
        for (name, value) in row {
            match columns.iter_mut().find(|(n, _)| *n == name.as_str()) {
                Some((_, ty)) => {
                    if ty.is_none() {
                        *ty = ColumnType::of(value);
                    }
                }
                None => columns.push((name.as_str(), ColumnType::of(value))),
            }
        }
    }
    columns
        .into_iter()
        .map(|(name, ty)| match ty {
            Some(ty) => format!("{name} {ty}"),
            None => format!("{name} NULL"),
        })
        .collect::<Vec<_>>()
        .join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rows(n: usize, width: usize) -> Vec<Map<String, Value>> {
        (0..n)
            .map(|i| {
                json!({"id": i, "content": "x".repeat(width)})
                    .as_object()
                    .expect("object")
                    .clone()
            })
            .collect()
    }

    #[test]
    fn small_results_pass_through() {
        let data = rows(2, 5);
        let out = truncate_for_context(&data, "users", DEFAULT_MAX_CONTEXT_CHARS);
        assert_eq!(out["truncated"], false);
        assert_eq!(out["rows"], 2);
        assert_eq!(out["table"], "users");
        assert!(out.get("hint").is_none());
    }

    #[test]
    fn large_results_keep_whole_rows() {
        let data = rows(100, 1000);
        let out = truncate_for_context(&data, "big_table", DEFAULT_MAX_CONTEXT_CHARS);
        assert_eq!(out["truncated"], true);
        assert_eq!(out["rows"], 100);
        let showing = out["showing"].as_u64().expect("showing");
        assert!(showing > 0 && showing < 100);
        assert_eq!(out["data"].as_array().map(Vec::len), Some(showing as usize));
        assert!(out["hint"].as_str().expect("hint").contains("big_table"));
        assert!(out["schema"].as_str().expect("schema").contains("id INTEGER"));
    }

    #[test]
    fn kept_prefix_fits_the_budget() {
        let data = rows(50, 100);
        let out = truncate_for_context(&data, "t", 500);
        let kept = serde_json::to_string(&out["data"]).expect("serialize");
        assert!(kept.len() <= 500);
    }

    #[test]
    fn exact_fit_is_not_truncated() {
        let data = vec![json!({"id": 1}).as_object().expect("object").clone()];
        let limit = serde_json::to_string(&data).expect("serialize").len();
        let out = truncate_for_context(&data, "t", limit);
        assert_eq!(out["truncated"], false);
    }
}
