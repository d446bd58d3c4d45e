//! Governed write agent.
//!
//! Consumes write tasks and performs insert/upsert/batch operations through
//! the persistence service. Permission and allowlist violations surface as
//! terminal agent errors (the runtime never retries them); transient
//! backend failures propagate with their retryable classification intact.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;

use crate::envelope::{Envelope, MetadataExtra, Row};
use crate::errors::AgentError;
use crate::persistence::PersistenceService;
use crate::registry::TaskAgent;
use crate::stream::messages::TaskMessage;

/// Write operation kinds. `insert`/`write` and `batch_insert`/`batch_write`
/// are wire synonyms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteOp {
    #[serde(alias = "write")]
    Insert,
    #[serde(alias = "batch_write")]
    BatchInsert,
    Upsert,
}

/// Wire shape of a write task payload.
#[derive(Debug, Clone, Deserialize)]
pub struct WriteTask {
    #[serde(default = "WriteTask::default_op")]
    pub op: WriteOp,
    pub table: String,
    /// A single record for insert/upsert, an array for batch inserts.
    pub values: Value,
    #[serde(default)]
    pub on_conflict: Option<Vec<String>>,
}

impl WriteTask {
    fn default_op() -> WriteOp {
        WriteOp::Insert
    }
}

fn as_row(value: &Value) -> Result<Row, AgentError> {
    value
        .as_object()
        .cloned()
        .ok_or_else(|| AgentError::validation("'values' must be a JSON object for this op"))
}

fn as_rows(value: &Value) -> Result<Vec<Row>, AgentError> {
    let items = value
        .as_array()
        .ok_or_else(|| AgentError::validation("batch_insert requires 'values' to be an array"))?;
    items
        .iter()
        .map(|item| {
            item.as_object()
                .cloned()
                .ok_or_else(|| AgentError::validation("batch entries must be JSON objects"))
        })
        .collect()
}

/// Agent executing governed writes.
pub struct WriteAgent {
    service: Arc<PersistenceService>,
}

impl WriteAgent {
    pub fn new(service: Arc<PersistenceService>) -> Self {
        Self { service }
    }

    /// Execute one parsed write task, returning the rows the backend
    /// reported back.
    pub async fn execute(&self, task: &WriteTask) -> Result<Vec<Row>, AgentError> {
        match task.op {
            WriteOp::Insert => {
                let row = as_row(&task.values)?;
                Ok(vec![self.service.write(&task.table, row).await?])
            }
            WriteOp::BatchInsert => {
                let rows = as_rows(&task.values)?;
                let max = self.service.capabilities().max_batch_size;
                if rows.len() > max {
                    return Err(AgentError::validation(format!(
                        "batch of {} exceeds the adapter's max_batch_size of {max}",
                        rows.len()
                    )));
                }
                Ok(self.service.batch_write(&task.table, rows).await?)
            }
            WriteOp::Upsert => {
                let row = as_row(&task.values)?;
                let result = self
                    .service
                    .upsert(&task.table, row, task.on_conflict.as_deref())
                    .await?;
                Ok(vec![result])
            }
        }
    }
}

#[async_trait]
impl TaskAgent for WriteAgent {
    fn name(&self) -> &str {
        "writer"
    }

    async fn handle(&self, task: &TaskMessage) -> Result<Envelope, AgentError> {
        let write_task: WriteTask = serde_json::from_value(task.payload.clone())
            .map_err(|e| AgentError::validation(format!("malformed write payload: {e}")))?;
        let rows = self.execute(&write_task).await?;
        Ok(Envelope::from_records(
            &format!("persistence.{}", write_task.table),
            rows,
            Some(&task.task_id),
            MetadataExtra::default(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PersistSettings;
    use crate::persistence::metrics::MetricsRegistry;
    use crate::persistence::{InMemoryAdapter, QueryOptions};
    use serde_json::json;

    fn agent() -> (Arc<PersistenceService>, WriteAgent) {
        let persist = PersistSettings::default();
        let service = Arc::new(PersistenceService::new(
            Arc::new(InMemoryAdapter::new()),
            persist.read_tables.iter().cloned(),
            persist.write_tables.iter().cloned(),
            MetricsRegistry::new(),
        ));
        (service.clone(), WriteAgent::new(service))
    }

    #[tokio::test]
    async fn insert_returns_the_stored_row_in_an_envelope() {
        let (_, agent) = agent();
        let task = TaskMessage::new(
            "persist.write",
            json!({"op": "insert", "table": "leads", "values": {"email": "a@x.io"}}),
        );
        let env = agent.handle(&task).await.unwrap();
        assert_eq!(env.metadata.source, "persistence.leads");
        assert_eq!(env.metadata.total_count, 1);
        assert_eq!(env.records[0].fields["email"], json!("a@x.io"));
        assert_eq!(env.records[0].fields["id"], json!("1"));
        env.validate().unwrap();
    }

    #[tokio::test]
    async fn write_alias_and_default_op() {
        let (_, agent) = agent();
        let aliased = TaskMessage::new(
            "persist.write",
            json!({"op": "write", "table": "leads", "values": {"email": "b@x.io"}}),
        );
        agent.handle(&aliased).await.unwrap();

        let defaulted = TaskMessage::new(
            "persist.write",
            json!({"table": "leads", "values": {"email": "c@x.io"}}),
        );
        agent.handle(&defaulted).await.unwrap();
    }

    #[tokio::test]
    async fn batch_insert_counts_rows() {
        let (service, agent) = agent();
        let task = TaskMessage::new(
            "persist.write",
            json!({
                "op": "batch_insert",
                "table": "leads",
                "values": [{"email": "a@x.io"}, {"email": "b@x.io"}]
            }),
        );
        let env = agent.handle(&task).await.unwrap();
        assert_eq!(env.metadata.total_count, 2);

        let stored = service.query("leads", &QueryOptions::default()).await.unwrap();
        assert_eq!(stored.len(), 2);
    }

    #[tokio::test]
    async fn batch_insert_rejects_non_array_values() {
        let (_, agent) = agent();
        let task = TaskMessage::new(
            "persist.write",
            json!({"op": "batch_insert", "table": "leads", "values": {"email": "a@x.io"}}),
        );
        let err = agent.handle(&task).await.unwrap_err();
        assert_eq!(err.kind_name(), "ValidationError");
        assert_eq!(err.retry(), crate::errors::RetryPolicy::Never);
    }

    #[tokio::test]
    async fn upsert_merges_by_conflict_keys() {
        let (service, agent) = agent();
        let insert = TaskMessage::new(
            "persist.write",
            json!({"op": "insert", "table": "leads", "values": {"email": "a@x.io", "status": "new"}}),
        );
        agent.handle(&insert).await.unwrap();

        let upsert = TaskMessage::new(
            "persist.write",
            json!({
                "op": "upsert",
                "table": "leads",
                "values": {"email": "a@x.io", "status": "warm"},
                "on_conflict": ["email"]
            }),
        );
        let env = agent.handle(&upsert).await.unwrap();
        assert_eq!(env.records[0].fields["status"], json!("warm"));

        let stored = service.query("leads", &QueryOptions::default()).await.unwrap();
        assert_eq!(stored.len(), 1);
    }

    #[tokio::test]
    async fn governance_table_write_is_terminal() {
        let (_, agent) = agent();
        let task = TaskMessage::new(
            "persist.write",
            json!({"op": "insert", "table": "clients", "values": {"name": "Acme"}}),
        );
        let err = agent.handle(&task).await.unwrap_err();
        assert_eq!(err.kind_name(), "TableNotAllowedError");
        assert_eq!(err.retry(), crate::errors::RetryPolicy::Never);
    }

    #[tokio::test]
    async fn oversized_batches_are_rejected_by_capability() {
        let (_, agent) = agent();
        let rows: Vec<Value> = (0..1001).map(|i| json!({"email": format!("u{i}@x.io")})).collect();
        let task = TaskMessage::new(
            "persist.write",
            json!({"op": "batch_insert", "table": "leads", "values": rows}),
        );
        let err = agent.handle(&task).await.unwrap_err();
        assert_eq!(err.kind_name(), "ValidationError");
        assert!(err.to_string().contains("max_batch_size"));
    }
}
