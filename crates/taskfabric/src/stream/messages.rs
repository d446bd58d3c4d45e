//! Wire messages carried on task, result, and dead-letter streams.
//!
//! Every stream entry holds one of these JSON-encoded under the `data`
//! field. `task_id` is the idempotency key across the whole fabric:
//! callers must tolerate duplicate results for the same id.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::envelope::Envelope;

/// Delivery metadata carried alongside a task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskMeta {
    pub enqueued_at: DateTime<Utc>,
    /// Zero-based retry counter; incremented on each republish.
    pub attempt: u32,
    /// Kill-switch: `Some(false)` makes workers ack without executing.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub allow_delivery: Option<bool>,
}

/// One unit of work published to `{ns}:{domain}:tasks`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskMessage {
    pub task_id: String,
    pub flow: String,
    pub payload: Value,
    pub meta: TaskMeta,
}

impl TaskMessage {
    pub fn new(flow: impl Into<String>, payload: Value) -> Self {
        Self {
            task_id: Uuid::new_v4().to_string(),
            flow: flow.into(),
            payload,
            meta: TaskMeta {
                enqueued_at: Utc::now(),
                attempt: 0,
                allow_delivery: None,
            },
        }
    }

    /// Copy for republish with the attempt counter bumped.
    pub fn next_attempt(&self) -> Self {
        let mut next = self.clone();
        next.meta.attempt += 1;
        next
    }
}

/// Task outcome published to `{ns}:{domain}:results`. Exactly one of
/// `envelope` / `error` is set, matching `status`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultMessage {
    pub task_id: String,
    pub status: ResultStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub envelope: Option<Envelope>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResultStatus {
    Success,
    Error,
}

impl ResultMessage {
    pub fn success(task_id: impl Into<String>, envelope: Envelope) -> Self {
        Self {
            task_id: task_id.into(),
            status: ResultStatus::Success,
            envelope: Some(envelope),
            error: None,
        }
    }

    pub fn error(task_id: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            task_id: task_id.into(),
            status: ResultStatus::Error,
            envelope: None,
            error: Some(error.into()),
        }
    }
}

/// Entry published to `{ns}:{domain}:dlq` on terminal failure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetter {
    /// The task as it was delivered (raw, so malformed tasks survive too).
    pub task: Value,
    pub error: String,
}
