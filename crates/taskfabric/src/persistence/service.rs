//! Allowlist-enforcing persistence service.
//!
//! The single choke point for database access. Every operation checks the
//! relevant allowlist before the adapter is touched, strips null fields
//! from outgoing records, runs under an instrumentation wrapper, and wraps
//! unexpected adapter failures as typed adapter errors.

use std::collections::BTreeSet;
use std::sync::Arc;

use serde_json::Value;
use tokio::time::Instant;

use crate::envelope::Row;
use crate::errors::PersistenceError;

use super::metrics::MetricsRegistry;
use super::{Capabilities, PersistenceAdapter, QueryOptions};

/// High-level persistence facade adding governance and cross-cutting hooks.
pub struct PersistenceService {
    adapter: Arc<dyn PersistenceAdapter>,
    read_allowlist: BTreeSet<String>,
    write_allowlist: BTreeSet<String>,
    metrics: MetricsRegistry,
}

impl PersistenceService {
    /// Build a service with independent read and write allowlists.
    ///
    /// Table names are compared case-insensitively; lists are lowercased
    /// here once.
    pub fn new(
        adapter: Arc<dyn PersistenceAdapter>,
        read_allowlist: impl IntoIterator<Item = String>,
        write_allowlist: impl IntoIterator<Item = String>,
        metrics: MetricsRegistry,
    ) -> Self {
        Self {
            adapter,
            read_allowlist: read_allowlist.into_iter().map(|t| t.to_lowercase()).collect(),
            write_allowlist: write_allowlist
                .into_iter()
                .map(|t| t.to_lowercase())
                .collect(),
            metrics,
        }
    }

    pub fn metrics(&self) -> &MetricsRegistry {
        &self.metrics
    }

    pub fn capabilities(&self) -> Capabilities {
        self.adapter.capabilities()
    }

    /// True when the service can never write anywhere.
    pub fn write_allowlist_is_empty(&self) -> bool {
        self.write_allowlist.is_empty()
    }

    fn check_read(&self, table: &str) -> Result<(), PersistenceError> {
        if self.read_allowlist.contains(&table.to_lowercase()) {
            Ok(())
        } else {
            Err(PersistenceError::table_not_allowed(table, "read"))
        }
    }

    fn check_write(&self, table: &str) -> Result<(), PersistenceError> {
        if self.write_allowlist.contains(&table.to_lowercase()) {
            Ok(())
        } else {
            Err(PersistenceError::table_not_allowed(table, "write"))
        }
    }

    /// Drop null-valued fields so unset columns never reach the backend.
    fn clean(record: Row) -> Row {
        record
            .into_iter()
            .filter(|(_, v)| !v.is_null())
            .collect()
    }

    /// Run an adapter call under timing instrumentation, wrapping failures.
    ///
    /// Permission and allowlist errors pass through untouched; anything
    /// else an adapter raises is already a typed `PersistenceError` by
    /// contract, but the elapsed time is recorded on every path.
    async fn instrumented<T, F>(&self, op: &str, table: &str, fut: F) -> Result<T, PersistenceError>
    where
        F: std::future::Future<Output = Result<T, PersistenceError>>,
    {
        let start = Instant::now();
        let result = fut.await;
        let elapsed_ms = start.elapsed().as_secs_f64() * 1000.0;
        self.metrics.observe(op, table, elapsed_ms);
        tracing::debug!(
            target: "taskfabric::persistence",
            op,
            table,
            elapsed_ms,
            ok = result.is_ok(),
        );
        result
    }

    // -- write APIs --

    pub async fn write(&self, table: &str, record: Row) -> Result<Row, PersistenceError> {
        self.check_write(table)?;
        let cleaned = Self::clean(record);
        self.instrumented("write", table, self.adapter.write(table, cleaned))
            .await
    }

    pub async fn batch_write(
        &self,
        table: &str,
        records: Vec<Row>,
    ) -> Result<Vec<Row>, PersistenceError> {
        self.check_write(table)?;
        let cleaned: Vec<Row> = records.into_iter().map(Self::clean).collect();
        self.instrumented("batch_write", table, self.adapter.batch_write(table, cleaned))
            .await
    }

    pub async fn upsert(
        &self,
        table: &str,
        record: Row,
        on_conflict: Option<&[String]>,
    ) -> Result<Row, PersistenceError> {
        self.check_write(table)?;
        let cleaned = Self::clean(record);
        self.instrumented("upsert", table, self.adapter.upsert(table, cleaned, on_conflict))
            .await
    }

    // -- read APIs --

    pub async fn read(
        &self,
        table: &str,
        id_value: &Value,
        id_column: &str,
    ) -> Result<Option<Row>, PersistenceError> {
        self.check_read(table)?;
        self.instrumented("read", table, self.adapter.read(table, id_value, id_column))
            .await
    }

    pub async fn query(
        &self,
        table: &str,
        options: &QueryOptions,
    ) -> Result<Vec<Row>, PersistenceError> {
        self.check_read(table)?;
        self.instrumented("query", table, self.adapter.query(table, options))
            .await
    }

    pub async fn get_columns(&self, table: &str) -> Result<Option<Vec<String>>, PersistenceError> {
        self.check_read(table)?;
        self.instrumented("get_columns", table, self.adapter.get_columns(table))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::InMemoryAdapter;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};

    use async_trait::async_trait;

    fn row(pairs: &[(&str, Value)]) -> Row {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    fn service_over(adapter: Arc<dyn PersistenceAdapter>) -> PersistenceService {
        PersistenceService::new(
            adapter,
            ["leads".to_string(), "messages".to_string()],
            ["leads".to_string()],
            MetricsRegistry::new(),
        )
    }

    /// Adapter that counts calls, to prove denied tables never reach it.
    struct CountingAdapter {
        inner: InMemoryAdapter,
        calls: AtomicU32,
    }

    impl CountingAdapter {
        fn new() -> Self {
            Self {
                inner: InMemoryAdapter::new(),
                calls: AtomicU32::new(0),
            }
        }
    }

    #[async_trait]
    impl PersistenceAdapter for CountingAdapter {
        async fn write(&self, table: &str, record: Row) -> Result<Row, PersistenceError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.inner.write(table, record).await
        }
        async fn batch_write(
            &self,
            table: &str,
            records: Vec<Row>,
        ) -> Result<Vec<Row>, PersistenceError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.inner.batch_write(table, records).await
        }
        async fn upsert(
            &self,
            table: &str,
            record: Row,
            on_conflict: Option<&[String]>,
        ) -> Result<Row, PersistenceError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.inner.upsert(table, record, on_conflict).await
        }
        async fn read(
            &self,
            table: &str,
            id_value: &Value,
            id_column: &str,
        ) -> Result<Option<Row>, PersistenceError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.inner.read(table, id_value, id_column).await
        }
        async fn query(
            &self,
            table: &str,
            options: &QueryOptions,
        ) -> Result<Vec<Row>, PersistenceError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.inner.query(table, options).await
        }
        async fn get_columns(
            &self,
            table: &str,
        ) -> Result<Option<Vec<String>>, PersistenceError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.inner.get_columns(table).await
        }
        fn capabilities(&self) -> Capabilities {
            self.inner.capabilities()
        }
    }

    #[tokio::test]
    async fn denied_tables_never_reach_the_adapter() {
        let adapter = Arc::new(CountingAdapter::new());
        let service = service_over(adapter.clone());

        let read_err = service
            .query("audit_log", &QueryOptions::default())
            .await
            .unwrap_err();
        assert_eq!(read_err.kind_name(), "TableNotAllowedError");

        let write_err = service
            .write("messages", row(&[("body", json!("hi"))]))
            .await
            .unwrap_err();
        assert_eq!(write_err.kind_name(), "TableNotAllowedError");

        assert_eq!(adapter.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn table_check_is_case_insensitive() {
        let service = service_over(Arc::new(InMemoryAdapter::new()));
        service
            .write("Leads", row(&[("email", json!("a@x.io"))]))
            .await
            .unwrap();
        let rows = service
            .query("LEADS", &QueryOptions::default())
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
    }

    #[tokio::test]
    async fn null_fields_are_stripped_before_write() {
        let service = service_over(Arc::new(InMemoryAdapter::new()));
        let stored = service
            .write(
                "leads",
                row(&[("email", json!("a@x.io")), ("phone", Value::Null)]),
            )
            .await
            .unwrap();
        assert!(!stored.contains_key("phone"));
        assert!(stored.contains_key("email"));
    }

    #[tokio::test]
    async fn metrics_accumulate_per_op_and_table() {
        let service = service_over(Arc::new(InMemoryAdapter::new()));
        service
            .write("leads", row(&[("email", json!("a@x.io"))]))
            .await
            .unwrap();
        service.query("leads", &QueryOptions::default()).await.unwrap();
        service.query("leads", &QueryOptions::default()).await.unwrap();

        let snapshot = service.metrics().snapshot();
        let query = snapshot.iter().find(|e| e.op == "query").unwrap();
        assert_eq!(query.count, 2);
        assert_eq!(query.table, "leads");
        assert!(snapshot.iter().any(|e| e.op == "write"));
    }

    #[tokio::test]
    async fn denied_ops_are_not_recorded_in_metrics() {
        let service = service_over(Arc::new(InMemoryAdapter::new()));
        let _ = service.query("audit_log", &QueryOptions::default()).await;
        assert!(service.metrics().snapshot().is_empty());
    }
}
