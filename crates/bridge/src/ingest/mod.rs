//! Ingestion pipeline: raw payload → flattened rows → typed table in the session store.

pub mod flatten;
pub mod shaping;
pub mod store;

use crate::error::Result;
use serde::Serialize;
use serde_json::Value;
use store::QueryableStore;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestionResult {
    pub table: String,
    pub rows_ingested: usize,
    /// Rows in the table after this ingestion.
    pub total_rows: u64,
    /// Rows beyond the per-ingestion cap were dropped.
    pub truncated: bool,
    pub columns: Vec<String>,
}

/// Table name for a call signature.
#[must_use]
pub fn table_name(signature: &str) -> String {
    flatten::column_name(signature.trim())
}

/// Land `payload` in the table for `signature`.
///
/// # Errors
///
/// Propagates type conflicts and store failures; nothing is committed on error.
pub async fn ingest(
    store: &QueryableStore,
    payload: &Value,
    signature: &str,
    max_rows: usize,
) -> Result<IngestionResult> {
    let table = table_name(signature);
    let mut rows = flatten::extract_rows(payload);
    let truncated = rows.len() > max_rows;
    if truncated {
        tracing::warn!(table = %table, rows = rows.len(), max_rows, "row cap reached, dropping excess rows");
        rows.truncate(max_rows);
    }
    let rows: Vec<_> = rows.iter().map(flatten::flatten_row).collect();
    let stats = store.write_rows(&table, &rows).await?;
    tracing::info!(
        table = %table,
        rows = stats.inserted,
        total_rows = stats.total_rows,
        columns = stats.columns.len(),
        "payload ingested"
    );
    Ok(IngestionResult {
        table,
        rows_ingested: stats.inserted,
        total_rows: stats.total_rows,
        truncated,
        columns: stats.columns,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn differing_payloads_union_into_one_table() {
        let store = QueryableStore::open().await.expect("open");
        let a = ingest(&store, &json!([{"id": 1, "name": "a"}]), "get_users", 100)
            .await
            .expect("a");
        let b = ingest(
            &store,
            &json!({"users": [{"id": 2, "team": {"name": "core"}}, {"id": 3}]}),
            "get_users",
            100,
        )
        .await
        .expect("b");
        assert_eq!(a.table, b.table);
        assert_eq!(b.total_rows, 3);
        assert_eq!(b.columns, vec!["id", "name", "team_name"]);
    }

    #[tokio::test]
    async fn row_cap_truncates() {
        let store = QueryableStore::open().await.expect("open");
        let payload = Value::Array((0..10).map(|i| json!({"i": i})).collect());
        let r = ingest(&store, &payload, "nums", 4).await.expect("ingest");
        assert!(r.truncated);
        assert_eq!(r.rows_ingested, 4);
        assert_eq!(r.total_rows, 4);
    }

    #[tokio::test]
    async fn null_payload_creates_empty_table() {
        let store = QueryableStore::open().await.expect("open");
        let r = ingest(&store, &Value::Null, "post-jobs", 10).await.expect("ingest");
        assert_eq!(r.table, "post_jobs");
        assert_eq!(r.total_rows, 0);
        assert!(store.table_names().contains(&"post_jobs".to_string()));
    }
}
