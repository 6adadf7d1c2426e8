//! In-memory store used by engine tests and offline runs. Tracks write
//! counts so idempotency can be asserted directly.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use grantsync_core::{key_string, Row, Table};
use serde_json::Value;

use crate::{Store, StoreError};

#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<BTreeMap<Table, Vec<Row>>>,
    writes: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces a table's contents without counting as sync writes.
    pub fn seed(&self, table: Table, rows: Vec<Row>) {
        self.tables
            .lock()
            .expect("memory store lock")
            .insert(table, rows);
    }

    pub fn rows(&self, table: Table) -> Vec<Row> {
        self.tables
            .lock()
            .expect("memory store lock")
            .get(&table)
            .cloned()
            .unwrap_or_default()
    }

    /// Number of insert/update calls accepted since construction.
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn read_all(&self, table: Table, key: &str) -> Result<BTreeMap<String, Row>, StoreError> {
        let tables = self.tables.lock().expect("memory store lock");
        let mut out = BTreeMap::new();
        for row in tables.get(&table).into_iter().flatten() {
            if let Some(key_value) = row.get(key) {
                out.insert(key_string(key_value), row.clone());
            }
        }
        Ok(out)
    }

    async fn read_config(&self, table: Table) -> Result<Vec<Row>, StoreError> {
        Ok(self.rows(table))
    }

    async fn insert(&self, table: Table, row: &Row) -> Result<(), StoreError> {
        let mut tables = self.tables.lock().expect("memory store lock");
        tables.entry(table).or_default().push(row.clone());
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn update(
        &self,
        table: Table,
        key: &str,
        key_value: &Value,
        changes: &Row,
    ) -> Result<(), StoreError> {
        let wanted = key_string(key_value);
        let mut tables = self.tables.lock().expect("memory store lock");
        for row in tables.entry(table).or_default() {
            let matches = row
                .get(key)
                .map(|value| key_string(value) == wanted)
                .unwrap_or(false);
            if !matches {
                continue;
            }
            for (column, value) in changes {
                if value.is_null() {
                    row.remove(column);
                } else {
                    row.insert(column.clone(), value.clone());
                }
            }
        }
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn close(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn row(pairs: &[(&str, Value)]) -> Row {
        let mut out = Row::new();
        for (k, v) in pairs {
            out.insert((*k).to_string(), v.clone());
        }
        out
    }

    #[tokio::test]
    async fn read_all_keys_rows_by_requested_column() {
        let store = MemoryStore::new();
        store.seed(
            Table::Grants,
            vec![
                row(&[("grant_id", json!("12")), ("grant_number", json!("GR-A"))]),
                row(&[("grant_id", json!("300")), ("grant_number", json!("GR-B"))]),
            ],
        );

        let by_number = store.read_all(Table::Grants, "grant_number").await.unwrap();
        assert!(by_number.contains_key("GR-A"));
        let by_id = store.read_all(Table::Grants, "grant_id").await.unwrap();
        assert!(by_id.contains_key("300"));
        assert_eq!(store.write_count(), 0);
    }

    #[tokio::test]
    async fn update_touches_only_named_columns_and_clears_on_null() {
        let store = MemoryStore::new();
        store.seed(
            Table::Grants,
            vec![row(&[
                ("grant_id", json!("300")),
                ("status", json!("reviewed")),
                ("award_ceiling", json!(1000)),
            ])],
        );

        let mut changes = Row::new();
        changes.insert("award_ceiling".into(), Value::Null);
        changes.insert("close_date".into(), json!("2026-09-01"));
        store
            .update(Table::Grants, "grant_id", &json!("300"), &changes)
            .await
            .unwrap();

        let rows = store.rows(Table::Grants);
        assert_eq!(rows[0]["status"], json!("reviewed"));
        assert_eq!(rows[0]["close_date"], json!("2026-09-01"));
        assert!(!rows[0].contains_key("award_ceiling"));
        assert_eq!(store.write_count(), 1);
    }
}
