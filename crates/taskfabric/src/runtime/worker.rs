//! Stream-consuming worker runtime.
//!
//! Per consumed entry the runtime walks CLAIMED → LOCKED → RUNNING →
//! {ACKED | RETRY | DLQ}:
//!
//! - LOCKED: `SET NX` idempotency lock per msg id; a held lock means the
//!   entry was already executed, so it is acked without re-running.
//! - RUNNING: the task is dispatched (under the agent's permit bound) to
//!   the registry agent for its flow.
//! - ACKED: the result is published to the paired results stream *before*
//!   the task is acked.
//! - RETRY: retryable failures below the attempt ceiling are republished
//!   with `attempt + 1` after the configured backoff; the original is
//!   acked.
//! - DLQ: terminal failures publish an error result and, when enabled, a
//!   dead letter; then the original is acked.
//!
//! Background loops: group creation at startup (`$` cursor) and a
//! heartbeat refreshing `{ns}:ops:hb:{domain}:{id}`.

use std::sync::Arc;

use serde_json::{json, Value};
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::Duration;
use uuid::Uuid;

use crate::config::WorkerSettings;
use crate::dispatcher::Dispatcher;
use crate::errors::{AgentError, RetryPolicy};
use crate::monitoring;
use crate::registry::Registry;
use crate::stream::messages::{DeadLetter, ResultMessage, TaskMessage};
use crate::stream::{DomainStreams, GroupStart, StreamClient};

/// Entries claimed per blocking read.
const CLAIM_BATCH: usize = 10;

/// One domain's consumer: claims from `{ns}:{domain}:tasks` in group
/// `{domain}-workers` and publishes to the paired results/DLQ streams.
pub struct WorkerRuntime {
    client: StreamClient,
    registry: Arc<Registry>,
    dispatcher: Dispatcher,
    settings: WorkerSettings,
    streams: DomainStreams,
    domain: String,
    consumer_id: String,
}

impl WorkerRuntime {
    pub fn new(
        client: StreamClient,
        registry: Arc<Registry>,
        dispatcher: Dispatcher,
        domain: impl Into<String>,
        settings: WorkerSettings,
    ) -> Self {
        let domain = domain.into();
        Self {
            client,
            registry,
            dispatcher,
            settings,
            streams: DomainStreams::new(&domain),
            domain,
            consumer_id: Uuid::new_v4().to_string(),
        }
    }

    pub fn consumer_id(&self) -> &str {
        &self.consumer_id
    }

    pub fn streams(&self) -> &DomainStreams {
        &self.streams
    }

    /// Create the consumer group at cursor `$` if absent.
    pub async fn ensure_group(&self) -> Result<bool, crate::errors::StreamError> {
        self.client
            .create_group(&self.streams.tasks, &self.streams.group, GroupStart::NewOnly)
            .await
    }

    async fn ack(&self, msg_id: &str) {
        if let Err(e) = self
            .client
            .ack(&self.streams.tasks, &self.streams.group, msg_id)
            .await
        {
            tracing::warn!(target: "taskfabric::worker", msg_id, error = %e, "ack failed");
        }
    }

    async fn publish_result(&self, result: &ResultMessage) -> bool {
        let payload = match serde_json::to_value(result) {
            Ok(v) => v,
            Err(e) => {
                tracing::error!(target: "taskfabric::worker", error = %e, "result serialization failed");
                return false;
            }
        };
        match self
            .client
            .publish(&self.streams.results, &payload, self.settings.stream_maxlen)
            .await
        {
            Ok(_) => true,
            Err(e) => {
                tracing::error!(
                    target: "taskfabric::worker",
                    task_id = %result.task_id,
                    error = %e,
                    "result publish failed"
                );
                false
            }
        }
    }

    async fn publish_dead_letter(&self, task: Value, error: String) {
        if !self.settings.enable_dlq {
            return;
        }
        let letter = DeadLetter { task, error };
        let payload = match serde_json::to_value(&letter) {
            Ok(v) => v,
            Err(_) => return,
        };
        if let Err(e) = self
            .client
            .publish(&self.streams.dlq, &payload, self.settings.stream_maxlen)
            .await
        {
            tracing::error!(target: "taskfabric::worker", error = %e, "dead-letter publish failed");
        }
    }

    /// Process one claimed entry through the full state machine.
    ///
    /// Public so replay semantics are testable without a running claim
    /// loop: feeding the same `msg_id` twice must not re-invoke the agent.
    pub async fn process(&self, msg_id: &str, payload: &Value) {
        let task: TaskMessage = match serde_json::from_value(payload.clone()) {
            Ok(task) => task,
            Err(e) => {
                let error = format!("ValidationError: malformed task payload: {e}");
                monitoring::log_event(
                    "worker.task.malformed",
                    &json!({"msg_id": msg_id, "error": error}),
                );
                self.publish_dead_letter(payload.clone(), error).await;
                self.ack(msg_id).await;
                return;
            }
        };

        if task.meta.allow_delivery == Some(false) {
            monitoring::log_event(
                "worker.task.delivery_disabled",
                &json!({"task_id": task.task_id, "flow": task.flow}),
            );
            self.ack(msg_id).await;
            return;
        }

        // Idempotency lock; on stream-store failure we proceed unlocked
        // rather than stall the domain.
        match self
            .client
            .lock_acquire(
                &self.streams.tasks,
                msg_id,
                Duration::from_secs(self.settings.idemp_ttl_secs),
            )
            .await
        {
            Ok(true) => {}
            Ok(false) => {
                monitoring::log_event(
                    "worker.task.duplicate",
                    &json!({"task_id": task.task_id, "msg_id": msg_id}),
                );
                self.ack(msg_id).await;
                return;
            }
            Err(e) => {
                tracing::warn!(target: "taskfabric::worker", msg_id, error = %e, "idempotency lock unavailable");
            }
        }

        monitoring::log_event(
            "worker.task.start",
            &json!({
                "task_id": task.task_id,
                "flow": task.flow,
                "attempt": task.meta.attempt,
                "consumer": self.consumer_id,
            }),
        );

        let outcome = match self.registry.resolve(&task.flow) {
            Ok(agent) => {
                let agent_name = agent.name().to_string();
                self.dispatcher
                    .submit(&agent_name, agent.handle(&task))
                    .await
            }
            Err(e) => Err(e),
        };

        match outcome {
            Ok(envelope) => {
                monitoring::log_event(
                    "worker.task.success",
                    &json!({"task_id": task.task_id, "records": envelope.records.len()}),
                );
                let result = ResultMessage::success(&task.task_id, envelope);
                // Publish happens-before ack. A failed publish leaves the
                // entry un-acked for redelivery.
                if self.publish_result(&result).await {
                    self.ack(msg_id).await;
                }
            }
            Err(error) => self.handle_failure(msg_id, task, error).await,
        }
    }

    async fn handle_failure(&self, msg_id: &str, task: TaskMessage, error: AgentError) {
        let ceiling = match error.retry() {
            RetryPolicy::Never => 0,
            RetryPolicy::Once => 1,
            RetryPolicy::UpToLimit => self.settings.max_retries,
        };

        if task.meta.attempt < ceiling {
            monitoring::log_event(
                "worker.task.retry",
                &json!({
                    "task_id": task.task_id,
                    "attempt": task.meta.attempt + 1,
                    "error": error.to_string(),
                }),
            );
            if self.settings.retry_backoff_ms > 0 {
                tokio::time::sleep(Duration::from_millis(self.settings.retry_backoff_ms)).await;
            }
            let retry = task.next_attempt();
            let payload = match serde_json::to_value(&retry) {
                Ok(v) => v,
                Err(_) => return,
            };
            match self
                .client
                .publish(&self.streams.tasks, &payload, self.settings.stream_maxlen)
                .await
            {
                Ok(_) => self.ack(msg_id).await,
                Err(e) => {
                    // Leave un-acked: the entry redelivers instead.
                    tracing::error!(target: "taskfabric::worker", error = %e, "retry republish failed");
                }
            }
            return;
        }

        let message = error.to_string();
        monitoring::log_event(
            "worker.task.error",
            &json!({"task_id": task.task_id, "flow": task.flow, "error": message}),
        );
        let result = ResultMessage::error(&task.task_id, message.clone());
        let published = self.publish_result(&result).await;
        self.publish_dead_letter(
            serde_json::to_value(&task).unwrap_or(Value::Null),
            message,
        )
        .await;
        if published {
            self.ack(msg_id).await;
        }
    }

    /// Spawn the claim loop (and heartbeat) and return a shutdown handle.
    pub fn start(self) -> WorkerHandle {
        let worker = Arc::new(self);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let hb = if worker.settings.hb_enabled {
            Some(tokio::spawn(heartbeat_loop(
                worker.clone(),
                shutdown_rx.clone(),
            )))
        } else {
            None
        };

        let join = tokio::spawn(claim_loop(worker, shutdown_rx, hb));
        WorkerHandle { shutdown_tx, join }
    }
}

/// Handle to a running worker. Signals shutdown and waits for drain.
pub struct WorkerHandle {
    shutdown_tx: watch::Sender<bool>,
    join: JoinHandle<()>,
}

impl WorkerHandle {
    /// Stop claiming, give in-flight tasks the configured grace period,
    /// then abandon stragglers un-acked for redelivery.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        let _ = self.join.await;
    }
}

async fn claim_loop(
    worker: Arc<WorkerRuntime>,
    mut shutdown_rx: watch::Receiver<bool>,
    hb: Option<JoinHandle<()>>,
) {
    if let Err(e) = worker.ensure_group().await {
        tracing::error!(target: "taskfabric::worker", error = %e, "consumer group creation failed");
    }
    tracing::info!(
        target: "taskfabric::worker",
        domain = %worker.domain,
        consumer = %worker.consumer_id,
        stream = %worker.streams.tasks,
        "worker listening"
    );

    let block = Duration::from_millis(worker.settings.block_ms);
    let mut inflight: JoinSet<()> = JoinSet::new();

    while !*shutdown_rx.borrow() {
        while inflight.try_join_next().is_some() {}

        let claimed = tokio::select! {
            res = worker.client.claim(
                &worker.streams.tasks,
                &worker.streams.group,
                &worker.consumer_id,
                CLAIM_BATCH,
                block,
            ) => res,
            _ = shutdown_rx.changed() => break,
        };

        match claimed {
            Ok(entries) => {
                for entry in entries {
                    let worker = worker.clone();
                    inflight.spawn(async move {
                        worker.process(&entry.id, &entry.payload).await;
                    });
                }
            }
            Err(e) => {
                tracing::warn!(target: "taskfabric::worker", error = %e, "claim failed; backing off");
                tokio::select! {
                    _ = tokio::time::sleep(block) => {}
                    _ = shutdown_rx.changed() => break,
                }
            }
        }
    }

    // Bounded drain; stragglers stay un-acked and redeliver elsewhere.
    let grace = Duration::from_millis(worker.settings.shutdown_grace_ms);
    let drained = tokio::time::timeout(grace, async {
        while inflight.join_next().await.is_some() {}
    })
    .await;
    if drained.is_err() {
        tracing::warn!(target: "taskfabric::worker", "grace period elapsed; abandoning in-flight tasks");
        inflight.abort_all();
    }
    if let Some(hb) = hb {
        hb.abort();
    }
    tracing::info!(target: "taskfabric::worker", domain = %worker.domain, "worker stopped");
}

async fn heartbeat_loop(worker: Arc<WorkerRuntime>, mut shutdown_rx: watch::Receiver<bool>) {
    let interval = Duration::from_secs(worker.settings.hb_interval_secs);
    let ttl = Duration::from_secs(worker.settings.hb_ttl_secs);
    loop {
        if let Err(e) = worker
            .client
            .heartbeat(&worker.domain, &worker.consumer_id, ttl)
            .await
        {
            tracing::warn!(target: "taskfabric::worker", error = %e, "heartbeat failed");
        }
        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    return;
                }
            }
        }
    }
}
