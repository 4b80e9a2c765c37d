//! Per-session queryable store on in-memory SQLite.
//!
//! Tables only ever widen: new columns are added as nullable, `integer` columns widen to
//! `real`, nothing is dropped. Writers to one table are serialized; each ingestion commits in a
//! single transaction.

use super::flatten::ColumnType;
use crate::error::{BridgeError, Result};
use parking_lot::Mutex;
use serde_json::{Map, Value};
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::{Column as _, Row as _, TypeInfo as _, ValueRef as _};
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnSchema {
    pub name: String,
    /// `None` until a non-null value has been observed.
    pub ty: Option<ColumnType>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TableSchema {
    pub columns: Vec<ColumnSchema>,
}

impl TableSchema {
    fn position(&self, name: &str) -> Option<usize> {
        self.columns
            .iter()
            .position(|c| c.name.eq_ignore_ascii_case(name))
    }

    /// `name TYPE, ...` summary for context shaping.
    #[must_use]
    pub fn describe(&self) -> String {
        self.columns
            .iter()
            .map(|c| match c.ty {
                Some(ty) => format!("{} {ty}", c.name),
                None => format!("{} NULL", c.name),
            })
            .collect::<Vec<_>>()
            .join(", ")
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteStats {
    pub inserted: usize,
    pub total_rows: u64,
    pub columns: Vec<String>,
    pub added_columns: Vec<String>,
}

pub struct QueryableStore {
    pool: SqlitePool,
    tables: Mutex<HashMap<String, Arc<tokio::sync::Mutex<TableSchema>>>>,
}

impl QueryableStore {
    /// Open a private in-memory database.
    ///
    /// # Errors
    ///
    /// Returns an error if SQLite cannot be opened.
    pub async fn open() -> Result<Self> {
        // One long-lived connection: every `:memory:` connection is its own database.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await?;
        Ok(Self {
            pool,
            tables: Mutex::new(HashMap::new()),
        })
    }

    #[must_use]
    pub fn table_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tables.lock().keys().cloned().collect();
        names.sort();
        names
    }

    pub async fn schema(&self, table: &str) -> Option<TableSchema> {
        let lock = self.tables.lock().get(&table_key(table)).cloned()?;
        let schema = lock.lock().await;
        Some(schema.clone())
    }

    fn table_lock(&self, table: &str) -> Arc<tokio::sync::Mutex<TableSchema>> {
        Arc::clone(
            self.tables
                .lock()
                .entry(table_key(table))
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(TableSchema::default()))),
        )
    }

    /// Write flattened rows into `table`, creating or widening it as needed.
    ///
    /// # Errors
    ///
    /// [`BridgeError::Ingestion`] on a type conflict; [`BridgeError::Store`] on SQLite failure.
    pub async fn write_rows(&self, table: &str, rows: &[Map<String, Value>]) -> Result<WriteStats> {
        let lock = self.table_lock(table);
        let mut current = lock.lock().await;
        let created = current.columns.is_empty() && !self.exists(table).await?;

        let mut next = current.clone();
        let mut added = Vec::new();
        for row in rows {
            for (name, value) in row {
                let observed = ColumnType::of(value);
                match next.position(name) {
                    Some(i) => {
                        let col = &mut next.columns[i];
                        col.ty = match (col.ty, observed) {
                            (Some(have), Some(seen)) => {
                                Some(have.widen(seen).ok_or_else(|| {
                                    BridgeError::Ingestion(format!(
                                        "column '{}' of table '{table}' is {have} but received {seen}",
                                        col.name
                                    ))
                                })?)
                            }
                            (have, seen) => have.or(seen),
                        };
                    }
                    None => {
                        next.columns.push(ColumnSchema {
                            name: name.clone(),
                            ty: observed,
                        });
                        added.push(name.clone());
                    }
                }
            }
        }

        let mut tx = self.pool.begin().await?;
        if created {
            let cols = next
                .columns
                .iter()
                .map(column_ddl)
                .collect::<Vec<_>>()
                .join(", ");
            let ddl = if cols.is_empty() {
                format!("CREATE TABLE {} (_row INTEGER)", quote(table))
            } else {
                format!("CREATE TABLE {} ({cols})", quote(table))
            };
            sqlx::query(&ddl).execute(&mut *tx).await?;
        } else {
            for name in &added {
                if let Some(col) = next.columns.iter().find(|c| &c.name == name) {
                    let ddl = format!("ALTER TABLE {} ADD COLUMN {}", quote(table), column_ddl(col));
                    sqlx::query(&ddl).execute(&mut *tx).await?;
                }
            }
        }

        for row in rows {
            if row.is_empty() {
                continue;
            }
            let names: Vec<&String> = row.keys().collect();
            let sql = format!(
                "INSERT INTO {} ({}) VALUES ({})",
                quote(table),
                names.iter().map(|n| quote(n)).collect::<Vec<_>>().join(", "),
                vec!["?"; names.len()].join(", ")
            );
            let mut query = sqlx::query(&sql);
            for name in &names {
                let ty = next.position(name).and_then(|i| next.columns[i].ty);
                query = bind_value(query, &row[name.as_str()], ty);
            }
            query.execute(&mut *tx).await?;
        }
        tx.commit().await?;

        let total_rows: i64 = sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {}", quote(table)))
            .fetch_one(&self.pool)
            .await?;

        *current = next;
        if created {
            tracing::debug!(table = %table, columns = current.columns.len(), "table created");
        } else if !added.is_empty() {
            tracing::debug!(table = %table, added = ?added, "table widened");
        }

        Ok(WriteStats {
            inserted: rows.iter().filter(|r| !r.is_empty()).count(),
            total_rows: u64::try_from(total_rows).unwrap_or_default(),
            columns: current.columns.iter().map(|c| c.name.clone()).collect(),
            added_columns: if created { Vec::new() } else { added },
        })
    }

    async fn exists(&self, table: &str) -> Result<bool> {
        let found: Option<String> =
            sqlx::query_scalar("SELECT name FROM sqlite_master WHERE type = 'table' AND name = ? COLLATE NOCASE")
                .bind(table)
                .fetch_optional(&self.pool)
                .await?;
        Ok(found.is_some())
    }

    /// Run one read-only statement (`SELECT` / `WITH`) and return rows as JSON objects.
    ///
    /// # Errors
    ///
    /// [`BridgeError::Validation`] for non-read statements, invalid SQL or unknown tables.
    pub async fn run_sql(&self, sql: &str) -> Result<Vec<Map<String, Value>>> {
        let statement = sql.trim().trim_end_matches(';').trim_end();
        let head = statement
            .split_whitespace()
            .next()
            .unwrap_or_default()
            .to_ascii_uppercase();
        if !matches!(head.as_str(), "SELECT" | "WITH") || statement.contains(';') {
            return Err(BridgeError::Validation(
                "only a single read-only SELECT or WITH statement is allowed".to_string(),
            ));
        }

        // SQLite rejects writes on this connection while `query_only` is on, whatever the
        // statement is dressed up as (`WITH ... DELETE`, `INSERT ... SELECT`).
        let mut conn = self.pool.acquire().await?;
        sqlx::query("PRAGMA query_only = ON").execute(&mut *conn).await?;
        let fetched = sqlx::query(statement).fetch_all(&mut *conn).await;
        sqlx::query("PRAGMA query_only = OFF").execute(&mut *conn).await?;
        let rows = fetched.map_err(|e| match e {
            sqlx::Error::Database(db) => BridgeError::Validation(format!("SQL error: {db}")),
            other => BridgeError::Store(other),
        })?;
        rows.iter().map(row_to_json).collect()
    }

    /// Every row of `table`, restricted to its tracked columns.
    ///
    /// # Errors
    ///
    /// [`BridgeError::Validation`] if the table was never ingested.
    pub async fn read_table(&self, table: &str) -> Result<Vec<Map<String, Value>>> {
        let schema = self
            .schema(table)
            .await
            .ok_or_else(|| BridgeError::Validation(format!("unknown table '{table}'")))?;
        if schema.columns.is_empty() {
            return Ok(Vec::new());
        }
        let columns = schema
            .columns
            .iter()
            .map(|c| quote(&c.name))
            .collect::<Vec<_>>()
            .join(", ");
        let rows = sqlx::query(&format!("SELECT {columns} FROM {}", quote(table)))
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_json).collect()
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

/// Store failures after which the session's store cannot be trusted.
#[must_use]
pub fn is_fatal(err: &BridgeError) -> bool {
    matches!(
        err,
        BridgeError::Store(
            sqlx::Error::PoolClosed
                | sqlx::Error::PoolTimedOut
                | sqlx::Error::Io(_)
                | sqlx::Error::WorkerCrashed
        )
    )
}

/// SQLite identifiers are case-insensitive, so schemas are tracked under one spelling.
fn table_key(table: &str) -> String {
    table.to_ascii_lowercase()
}

fn quote(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

fn column_ddl(col: &ColumnSchema) -> String {
    match col.ty {
        Some(ty) => format!("{} {}", quote(&col.name), ty.sql_type()),
        None => quote(&col.name),
    }
}

type SqliteQuery<'q> = sqlx::query::Query<'q, sqlx::Sqlite, sqlx::sqlite::SqliteArguments<'q>>;

fn bind_value<'q>(query: SqliteQuery<'q>, value: &Value, ty: Option<ColumnType>) -> SqliteQuery<'q> {
    match value {
        Value::Null => query.bind(None::<String>),
        Value::Bool(b) => query.bind(*b),
        Value::Number(n) => match (ty, n.as_i64()) {
            (Some(ColumnType::Real), _) | (_, None) => query.bind(n.as_f64()),
            (_, Some(i)) => query.bind(i),
        },
        Value::String(s) => query.bind(s.clone()),
        other => query.bind(other.to_string()),
    }
}

fn row_to_json(row: &SqliteRow) -> Result<Map<String, Value>> {
    let mut out = Map::new();
    for (i, column) in row.columns().iter().enumerate() {
        let declared_bool = column.type_info().name() == "BOOLEAN";
        let raw = row.try_get_raw(i)?;
        let value = if raw.is_null() {
            Value::Null
        } else {
            let storage = raw.type_info().name().to_string();
            match storage.as_str() {
                "INTEGER" | "BOOLEAN" if declared_bool => Value::Bool(row.try_get::<bool, _>(i)?),
                "INTEGER" => Value::from(row.try_get::<i64, _>(i)?),
                "REAL" => Value::from(row.try_get::<f64, _>(i)?),
                "BLOB" => Value::String(hex::encode(row.try_get::<Vec<u8>, _>(i)?)),
                _ => Value::String(row.try_get::<String, _>(i)?),
            }
        };
        out.insert(column.name().to_string(), value);
    }
    Ok(out)
}
