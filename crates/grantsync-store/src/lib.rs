//! Store handle for the sync pipeline: a small trait over the three local
//! tables plus the Postgres implementation behind it.

use std::collections::BTreeMap;

use async_trait::async_trait;
use grantsync_core::{key_string, Row, Table};
use serde_json::Value;
use sqlx::postgres::{PgArguments, PgPoolOptions, PgRow};
use sqlx::{Column, PgPool, Row as SqlxRow, TypeInfo};
use thiserror::Error;
use tracing::debug;

pub mod memory;

pub const CRATE_NAME: &str = "grantsync-store";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Explicit store handle passed into each pipeline stage. Acquired once at
/// run start and released once at run end, on every exit path.
#[async_trait]
pub trait Store: Send + Sync {
    /// All rows of a table, keyed by the given column's value.
    async fn read_all(&self, table: Table, key: &str) -> Result<BTreeMap<String, Row>, StoreError>;

    /// Configuration rows in stable table order.
    async fn read_config(&self, table: Table) -> Result<Vec<Row>, StoreError>;

    async fn insert(&self, table: Table, row: &Row) -> Result<(), StoreError>;

    /// Overwrites exactly the columns present in `changes` on the row whose
    /// `key` column equals `key_value`. A null change clears the column.
    async fn update(
        &self,
        table: Table,
        key: &str,
        key_value: &Value,
        changes: &Row,
    ) -> Result<(), StoreError>;

    async fn close(&self);
}

const SCHEMA_DDL: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS grants (
        grant_id TEXT PRIMARY KEY,
        status TEXT,
        grant_number TEXT,
        agency_code TEXT,
        award_ceiling BIGINT,
        cost_sharing TEXT,
        title TEXT,
        cfda_list TEXT,
        open_date TEXT,
        close_date TEXT,
        notes TEXT,
        search_terms TEXT,
        reviewer_name TEXT,
        opportunity_category TEXT
    )",
    "CREATE TABLE IF NOT EXISTS eligibility_codes (
        code TEXT PRIMARY KEY,
        label TEXT,
        enabled BOOLEAN NOT NULL DEFAULT FALSE
    )",
    "CREATE TABLE IF NOT EXISTS keywords (
        id BIGSERIAL PRIMARY KEY,
        mode TEXT,
        search_term TEXT
    )",
];

/// Postgres-backed store. Queries are built at runtime from the column
/// names carried by each row, so the same primitives serve all tables.
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(4)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    /// Idempotent schema setup for the three sync tables.
    pub async fn ensure_schema(&self) -> Result<(), StoreError> {
        for ddl in SCHEMA_DDL {
            sqlx::query(ddl).execute(&self.pool).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl Store for PgStore {
    async fn read_all(&self, table: Table, key: &str) -> Result<BTreeMap<String, Row>, StoreError> {
        let sql = format!("SELECT * FROM {}", table.name());
        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;
        let mut out = BTreeMap::new();
        for pg_row in &rows {
            let row = row_to_json(pg_row)?;
            let Some(key_value) = row.get(key) else {
                continue;
            };
            out.insert(key_string(key_value), row);
        }
        debug!(table = table.name(), rows = out.len(), "read_all");
        Ok(out)
    }

    async fn read_config(&self, table: Table) -> Result<Vec<Row>, StoreError> {
        let sql = format!(
            "SELECT * FROM {} ORDER BY {}",
            table.name(),
            order_column(table)
        );
        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;
        rows.iter().map(row_to_json).collect()
    }

    async fn insert(&self, table: Table, row: &Row) -> Result<(), StoreError> {
        let present: Vec<(&String, &Value)> =
            row.iter().filter(|(_, value)| !value.is_null()).collect();
        let columns = present
            .iter()
            .map(|(name, _)| name.as_str())
            .collect::<Vec<_>>()
            .join(", ");
        let placeholders = (1..=present.len())
            .map(|i| format!("${i}"))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "INSERT INTO {} ({columns}) VALUES ({placeholders})",
            table.name()
        );
        let mut query = sqlx::query(&sql);
        for (_, value) in &present {
            query = bind_value(query, *value);
        }
        query.execute(&self.pool).await?;
        debug!(table = table.name(), "inserted row");
        Ok(())
    }

    async fn update(
        &self,
        table: Table,
        key: &str,
        key_value: &Value,
        changes: &Row,
    ) -> Result<(), StoreError> {
        if changes.is_empty() {
            return Ok(());
        }
        let mut assignments = Vec::new();
        let mut binds: Vec<&Value> = Vec::new();
        let mut position = 1;
        for (column, value) in changes {
            if value.is_null() {
                assignments.push(format!("{column} = NULL"));
            } else {
                assignments.push(format!("{column} = ${position}"));
                binds.push(value);
                position += 1;
            }
        }
        let sql = format!(
            "UPDATE {} SET {} WHERE {key} = ${position}",
            table.name(),
            assignments.join(", ")
        );
        let mut query = sqlx::query(&sql);
        for value in binds {
            query = bind_value(query, value);
        }
        query = query.bind(key_string(key_value));
        query.execute(&self.pool).await?;
        debug!(
            table = table.name(),
            columns = changes.len(),
            "updated row"
        );
        Ok(())
    }

    async fn close(&self) {
        self.pool.close().await;
    }
}

fn order_column(table: Table) -> &'static str {
    match table {
        Table::Grants => "grant_id",
        Table::EligibilityCodes => "code",
        Table::Keywords => "id",
    }
}

type PgQuery<'q> = sqlx::query::Query<'q, sqlx::Postgres, PgArguments>;

fn bind_value<'q>(query: PgQuery<'q>, value: &'q Value) -> PgQuery<'q> {
    match value {
        Value::Bool(b) => query.bind(*b),
        Value::Number(n) if n.is_i64() => query.bind(n.as_i64().unwrap_or_default()),
        Value::Number(n) => query.bind(n.as_f64().unwrap_or_default()),
        Value::String(s) => query.bind(s.as_str()),
        other => query.bind(other.to_string()),
    }
}

/// Converts a Postgres row into the generic row shape. SQL NULL columns are
/// left out entirely; the pipeline treats absent and null the same way.
fn row_to_json(pg_row: &PgRow) -> Result<Row, StoreError> {
    let mut out = Row::new();
    for column in pg_row.columns() {
        let name = column.name();
        let value = match column.type_info().name() {
            "INT8" => pg_row
                .try_get::<Option<i64>, _>(name)?
                .map(Value::from)
                .unwrap_or(Value::Null),
            "INT4" => pg_row
                .try_get::<Option<i32>, _>(name)?
                .map(Value::from)
                .unwrap_or(Value::Null),
            "BOOL" => pg_row
                .try_get::<Option<bool>, _>(name)?
                .map(Value::from)
                .unwrap_or(Value::Null),
            _ => pg_row
                .try_get::<Option<String>, _>(name)?
                .map(Value::from)
                .unwrap_or(Value::Null),
        };
        if !value.is_null() {
            out.insert(name.to_string(), value);
        }
    }
    Ok(out)
}
