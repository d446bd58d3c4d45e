//! Read-only facade over the persistence service.
//!
//! Retrieval paths hold one of these instead of the service itself. Any
//! write-shaped call fails with a permission error before the service is
//! consulted, and the facade is constructed over a service whose write
//! allowlist is empty, so even a bypass cannot mutate state.

use std::sync::Arc;

use serde_json::Value;

use crate::envelope::Row;
use crate::errors::PersistenceError;

use super::metrics::MetricsRegistry;
use super::{Capabilities, PersistenceAdapter, PersistenceService, QueryOptions};

/// Build a service suitable for wrapping in a [`ReadOnlyFacade`]: full read
/// allowlist, empty write allowlist.
pub fn read_only_service(
    adapter: Arc<dyn PersistenceAdapter>,
    read_allowlist: impl IntoIterator<Item = String>,
    metrics: MetricsRegistry,
) -> PersistenceService {
    PersistenceService::new(adapter, read_allowlist, Vec::new(), metrics)
}

/// Forwards reads; rejects writes.
pub struct ReadOnlyFacade {
    service: Arc<PersistenceService>,
}

impl ReadOnlyFacade {
    /// Wrap a service. Logs a warning if the service can write anywhere,
    /// since that leaves the facade as the only write barrier.
    pub fn over(service: Arc<PersistenceService>) -> Self {
        if !service.write_allowlist_is_empty() {
            tracing::warn!(
                target: "taskfabric::persistence",
                "read-only facade wraps a service with a non-empty write allowlist"
            );
        }
        Self { service }
    }

    fn write_blocked(op: &str) -> PersistenceError {
        PersistenceError::permission(format!("{op} not permitted on read-only facade"))
    }

    // -- blocked write surface --

    pub async fn write(&self, _table: &str, _record: Row) -> Result<Row, PersistenceError> {
        Err(Self::write_blocked("write"))
    }

    pub async fn batch_write(
        &self,
        _table: &str,
        _records: Vec<Row>,
    ) -> Result<Vec<Row>, PersistenceError> {
        Err(Self::write_blocked("batch_write"))
    }

    pub async fn upsert(
        &self,
        _table: &str,
        _record: Row,
        _on_conflict: Option<&[String]>,
    ) -> Result<Row, PersistenceError> {
        Err(Self::write_blocked("upsert"))
    }

    // -- forwarded read surface --

    pub async fn read(
        &self,
        table: &str,
        id_value: &Value,
        id_column: &str,
    ) -> Result<Option<Row>, PersistenceError> {
        self.service.read(table, id_value, id_column).await
    }

    pub async fn query(
        &self,
        table: &str,
        options: &QueryOptions,
    ) -> Result<Vec<Row>, PersistenceError> {
        self.service.query(table, options).await
    }

    pub async fn get_columns(&self, table: &str) -> Result<Option<Vec<String>>, PersistenceError> {
        self.service.get_columns(table).await
    }

    pub fn capabilities(&self) -> Capabilities {
        self.service.capabilities()
    }
}
