//! In-memory persistence adapter for tests and local runs.
//!
//! Deterministic O(n) scans over BTreeMap-keyed tables. Rows without an
//! `id` get a sequential string id. Ordering is a stable sort, so ties keep
//! insertion order.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::RwLock;

use crate::envelope::Row;
use crate::errors::{AdapterErrorKind, PersistenceError};

use super::{Capabilities, FilterOp, PersistenceAdapter, QueryOptions};

#[derive(Default)]
struct TableState {
    rows: Vec<Row>,
    next_id: u64,
}

/// In-memory implementation of [`PersistenceAdapter`].
pub struct InMemoryAdapter {
    tables: Arc<RwLock<BTreeMap<String, TableState>>>,
}

impl InMemoryAdapter {
    pub fn new() -> Self {
        Self {
            tables: Arc::new(RwLock::new(BTreeMap::new())),
        }
    }

    /// Test helper: drop every stored row and reset id counters.
    pub async fn clear_tables(&self) {
        self.tables.write().await.clear();
    }

    fn unsupported(op: &str, table: &str, what: &str) -> PersistenceError {
        PersistenceError::Adapter {
            op: op.into(),
            table: table.into(),
            kind: AdapterErrorKind::Permanent,
            message: format!("operator '{what}' is not supported by the in-memory adapter"),
            source: None,
        }
    }
}

impl Default for InMemoryAdapter {
    fn default() -> Self {
        Self::new()
    }
}

/// Case-insensitive match where `%` is a multi-character wildcard.
fn wildcard_match(value: &Value, pattern: &str) -> bool {
    let Some(text) = value.as_str() else {
        return false;
    };
    let haystack = text.to_lowercase();
    let pattern = pattern.to_lowercase();
    let parts: Vec<&str> = pattern.split('%').collect();

    let anchored_start = !pattern.starts_with('%');
    let anchored_end = !pattern.ends_with('%');

    let mut pos = 0usize;
    for (i, part) in parts.iter().enumerate() {
        if part.is_empty() {
            continue;
        }
        match haystack[pos..].find(part) {
            Some(idx) => {
                if i == 0 && anchored_start && idx != 0 {
                    return false;
                }
                pos += idx + part.len();
            }
            None => return false,
        }
    }
    if anchored_end {
        if let Some(last) = parts.last().filter(|p| !p.is_empty()) {
            if !haystack.ends_with(*last) {
                return false;
            }
        }
    }
    true
}

/// Total ordering over JSON scalars for `order_by`.
fn value_cmp(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    match (a, b) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
        (Some(a), Some(b)) => match (a, b) {
            (Value::Number(x), Value::Number(y)) => x
                .as_f64()
                .partial_cmp(&y.as_f64())
                .unwrap_or(Ordering::Equal),
            (Value::String(x), Value::String(y)) => x.cmp(y),
            (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
            _ => a.to_string().cmp(&b.to_string()),
        },
    }
}

fn matches_filters(row: &Row, options: &QueryOptions, table: &str) -> Result<bool, PersistenceError> {
    for (column, op) in options.filters.iter() {
        let cell = row.get(column);
        let ok = match op {
            FilterOp::Eq(expected) => cell == Some(expected),
            FilterOp::Ilike(pattern) => {
                cell.map(|v| wildcard_match(v, pattern)).unwrap_or(false)
            }
            FilterOp::In(_) => return Err(InMemoryAdapter::unsupported("query", table, "in")),
            FilterOp::Range(_, _) => {
                return Err(InMemoryAdapter::unsupported("query", table, "range"))
            }
        };
        if !ok {
            return Ok(false);
        }
    }
    Ok(true)
}

#[async_trait]
impl PersistenceAdapter for InMemoryAdapter {
    async fn write(&self, table: &str, record: Row) -> Result<Row, PersistenceError> {
        let mut tables = self.tables.write().await;
        let state = tables.entry(table.to_string()).or_default();

        let mut stored = record;
        if !stored.contains_key("id") {
            state.next_id += 1;
            stored.insert("id".into(), Value::String(state.next_id.to_string()));
        }
        state.rows.push(stored.clone());
        Ok(stored)
    }

    async fn batch_write(
        &self,
        table: &str,
        records: Vec<Row>,
    ) -> Result<Vec<Row>, PersistenceError> {
        let mut out = Vec::with_capacity(records.len());
        for record in records {
            out.push(self.write(table, record).await?);
        }
        Ok(out)
    }

    async fn upsert(
        &self,
        table: &str,
        record: Row,
        on_conflict: Option<&[String]>,
    ) -> Result<Row, PersistenceError> {
        let Some(keys) = on_conflict.filter(|k| !k.is_empty()) else {
            return self.write(table, record).await;
        };

        let mut tables = self.tables.write().await;
        let state = tables.entry(table.to_string()).or_default();

        for existing in state.rows.iter_mut() {
            let conflict = keys
                .iter()
                .all(|k| existing.get(k.as_str()) == record.get(k.as_str()));
            if conflict {
                let kept_id = existing.get("id").cloned();
                for (k, v) in &record {
                    existing.insert(k.clone(), v.clone());
                }
                if !existing.contains_key("id") {
                    if let Some(id) = kept_id {
                        existing.insert("id".into(), id);
                    }
                }
                return Ok(existing.clone());
            }
        }
        drop(tables);
        self.write(table, record).await
    }

    async fn read(
        &self,
        table: &str,
        id_value: &Value,
        id_column: &str,
    ) -> Result<Option<Row>, PersistenceError> {
        let tables = self.tables.read().await;
        Ok(tables.get(table).and_then(|state| {
            state
                .rows
                .iter()
                .find(|row| row.get(id_column) == Some(id_value))
                .cloned()
        }))
    }

    async fn query(
        &self,
        table: &str,
        options: &QueryOptions,
    ) -> Result<Vec<Row>, PersistenceError> {
        let tables = self.tables.read().await;
        let rows = tables.get(table).map(|s| s.rows.as_slice()).unwrap_or(&[]);

        let mut results: Vec<Row> = Vec::new();
        for row in rows {
            if matches_filters(row, options, table)? {
                results.push(row.clone());
            }
        }

        if let Some(order_by) = &options.order_by {
            results.sort_by(|a, b| {
                let ord = value_cmp(a.get(order_by.as_str()), b.get(order_by.as_str()));
                if options.descending {
                    ord.reverse()
                } else {
                    ord
                }
            });
        }

        if let Some(offset) = options.offset.filter(|o| *o > 0) {
            results = results.into_iter().skip(offset).collect();
        }
        if let Some(limit) = options.limit {
            results.truncate(limit);
        }

        if let Some(select) = &options.select {
            results = results
                .into_iter()
                .map(|row| {
                    select
                        .iter()
                        .map(|col| (col.clone(), row.get(col.as_str()).cloned().unwrap_or(Value::Null)))
                        .collect()
                })
                .collect();
        }

        Ok(results)
    }

    async fn get_columns(&self, table: &str) -> Result<Option<Vec<String>>, PersistenceError> {
        let tables = self.tables.read().await;
        let Some(state) = tables.get(table) else {
            return Ok(Some(Vec::new()));
        };
        let mut columns: Vec<String> = state
            .rows
            .iter()
            .flat_map(|row| row.keys().cloned())
            .collect();
        columns.sort();
        columns.dedup();
        Ok(Some(columns))
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            equality_filters: true,
            ordering: true,
            limit: true,
            projections: true,
            ilike: true,
            range_operators: false,
            in_operator: false,
            max_batch_size: 1000,
        }
    }
}
