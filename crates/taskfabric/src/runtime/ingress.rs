//! Thin ingress publishing tasks and polling for their results.
//!
//! `ingest` assigns the task id and routes to the flow's domain stream;
//! callers that want a synchronous answer poll the paired results stream
//! by range scan filtered on `task_id`. The scan starts from the beginning
//! of the (trimmed) stream, so a result published before polling began is
//! still found.

use std::sync::Arc;

use serde_json::{json, Value};
use thiserror::Error;
use tokio::time::{Duration, Instant};

use crate::errors::{AgentError, StreamError};
use crate::monitoring;
use crate::registry::Registry;
use crate::stream::messages::{ResultMessage, TaskMessage};
use crate::stream::{DomainStreams, StreamClient};

/// Poll page size while scanning the results stream.
const RESULT_SCAN_COUNT: usize = 50;

/// Errors surfaced to ingress callers.
#[derive(Debug, Error)]
pub enum IngressError {
    #[error(transparent)]
    Stream(#[from] StreamError),
    #[error(transparent)]
    Agent(#[from] AgentError),
    #[error("no result for task '{task_id}' within {waited_ms}ms")]
    Timeout { task_id: String, waited_ms: u64 },
}

/// Group statistics for one domain's task stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupHealth {
    pub domain: String,
    pub stream_len: usize,
    pub pending: usize,
}

/// Publishes tasks into the fabric and reads results back out.
#[derive(Clone)]
pub struct Ingress {
    client: StreamClient,
    registry: Arc<Registry>,
    stream_maxlen: Option<usize>,
}

impl Ingress {
    pub fn new(client: StreamClient, registry: Arc<Registry>, stream_maxlen: Option<usize>) -> Self {
        Self {
            client,
            registry,
            stream_maxlen,
        }
    }

    /// Publish a task for `flow` and return its id.
    pub async fn ingest(&self, flow: &str, payload: Value) -> Result<String, IngressError> {
        let domain = self.registry.domain_of(flow)?.to_string();
        let streams = DomainStreams::new(&domain);
        let task = TaskMessage::new(flow, payload);
        let encoded = serde_json::to_value(&task)
            .map_err(|e| StreamError::decode(format!("task serialization failed: {e}")))?;
        let msg_id = self
            .client
            .publish(&streams.tasks, &encoded, self.stream_maxlen)
            .await?;
        monitoring::log_event(
            "ingress.task.published",
            &json!({
                "task_id": task.task_id,
                "flow": flow,
                "domain": domain,
                "msg_id": msg_id,
            }),
        );
        Ok(task.task_id)
    }

    /// Wait for the result of `task_id` on a domain's results stream.
    pub async fn wait_for_result(
        &self,
        domain: &str,
        task_id: &str,
        timeout: Duration,
    ) -> Result<ResultMessage, IngressError> {
        let streams = DomainStreams::new(domain);
        let deadline = Instant::now() + timeout;
        let mut after_id = "0-0".to_string();

        loop {
            let now = Instant::now();
            if now >= deadline {
                return Err(IngressError::Timeout {
                    task_id: task_id.to_string(),
                    waited_ms: timeout.as_millis() as u64,
                });
            }
            let block = (deadline - now).min(Duration::from_millis(1000));
            let entries = self
                .client
                .read_from(&streams.results, &after_id, RESULT_SCAN_COUNT, block)
                .await?;
            for entry in entries {
                after_id = entry.id.clone();
                let Ok(result) = serde_json::from_value::<ResultMessage>(entry.payload) else {
                    continue;
                };
                if result.task_id == task_id {
                    return Ok(result);
                }
            }
        }
    }

    /// Stream length and pending count for every registered domain.
    pub async fn group_health(&self) -> Result<Vec<GroupHealth>, IngressError> {
        let mut out = Vec::new();
        for domain in self.registry.domains() {
            let streams = DomainStreams::new(domain);
            let stream_len = self.client.stream_len(&streams.tasks).await?;
            let pending = self
                .client
                .pending(&streams.tasks, &streams.group)
                .await
                .map(|p| p.pending)
                .unwrap_or(0);
            out.push(GroupHealth {
                domain: domain.to_string(),
                stream_len,
                pending,
            });
        }
        Ok(out)
    }
}
