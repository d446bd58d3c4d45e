//! Namespaced client over a [`StreamStore`].
//!
//! Owns the fabric's key conventions: every stream and ops key is prefixed
//! `{ns}:`, task/result/DLQ streams hang off a domain, heartbeats live at
//! `ops:hb:{service}:{id}` and idempotency locks at
//! `ops:idemp:{stream}:{msg_id}`.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;

use crate::errors::StreamError;

use super::{GroupStart, PendingStats, StreamEntry, StreamStore};

/// Stream names and consumer group for one task domain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DomainStreams {
    pub tasks: String,
    pub results: String,
    pub dlq: String,
    pub group: String,
}

impl DomainStreams {
    pub fn new(domain: &str) -> Self {
        Self {
            tasks: format!("{domain}:tasks"),
            results: format!("{domain}:results"),
            dlq: format!("{domain}:dlq"),
            group: format!("{domain}-workers"),
        }
    }
}

/// Heartbeat key (without namespace) for a service instance.
pub fn hb_key(service: &str, worker_id: &str) -> String {
    format!("ops:hb:{service}:{worker_id}")
}

/// Idempotency lock key (without namespace) for a claimed entry.
pub fn idemp_key(stream: &str, msg_id: &str) -> String {
    format!("ops:idemp:{stream}:{msg_id}")
}

/// Thin wrapper adding namespacing over whichever store is plugged in.
/// Cheap to clone.
#[derive(Clone)]
pub struct StreamClient {
    store: Arc<dyn StreamStore>,
    namespace: String,
}

impl StreamClient {
    pub fn new(store: Arc<dyn StreamStore>, namespace: impl Into<String>) -> Self {
        Self {
            store,
            namespace: namespace.into(),
        }
    }

    /// Fully namespaced key.
    pub fn key(&self, name: &str) -> String {
        if self.namespace.is_empty() {
            name.to_string()
        } else {
            format!("{}:{}", self.namespace, name)
        }
    }

    pub async fn publish(
        &self,
        stream: &str,
        payload: &Value,
        maxlen: Option<usize>,
    ) -> Result<String, StreamError> {
        self.store.append(&self.key(stream), payload, maxlen).await
    }

    pub async fn create_group(
        &self,
        stream: &str,
        group: &str,
        start: GroupStart,
    ) -> Result<bool, StreamError> {
        self.store.create_group(&self.key(stream), group, start).await
    }

    pub async fn claim(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block: Duration,
    ) -> Result<Vec<StreamEntry>, StreamError> {
        self.store
            .read_group(&self.key(stream), group, consumer, count, block)
            .await
    }

    pub async fn ack(&self, stream: &str, group: &str, msg_id: &str) -> Result<bool, StreamError> {
        self.store.ack(&self.key(stream), group, msg_id).await
    }

    pub async fn pending(&self, stream: &str, group: &str) -> Result<PendingStats, StreamError> {
        self.store.pending(&self.key(stream), group).await
    }

    /// Acquire the idempotency lock for a claimed entry. `Ok(false)` means
    /// another consumer already holds (or held) it within the TTL.
    pub async fn lock_acquire(
        &self,
        stream: &str,
        msg_id: &str,
        ttl: Duration,
    ) -> Result<bool, StreamError> {
        let key = self.key(&idemp_key(stream, msg_id));
        self.store.set_nx(&key, "1", ttl).await
    }

    /// Refresh a service heartbeat key.
    pub async fn heartbeat(
        &self,
        service: &str,
        worker_id: &str,
        ttl: Duration,
    ) -> Result<(), StreamError> {
        let key = self.key(&hb_key(service, worker_id));
        let stamp = chrono::Utc::now().to_rfc3339();
        self.store.put_ttl(&key, &stamp, ttl).await
    }

    /// Range read for result polling.
    pub async fn read_from(
        &self,
        stream: &str,
        after_id: &str,
        count: usize,
        block: Duration,
    ) -> Result<Vec<StreamEntry>, StreamError> {
        self.store
            .read(&self.key(stream), after_id, count, block)
            .await
    }

    pub async fn stream_len(&self, stream: &str) -> Result<usize, StreamError> {
        self.store.stream_len(&self.key(stream)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::InMemoryStreamStore;
    use serde_json::json;

    #[test]
    fn domain_stream_names() {
        let streams = DomainStreams::new("rag");
        assert_eq!(streams.tasks, "rag:tasks");
        assert_eq!(streams.results, "rag:results");
        assert_eq!(streams.dlq, "rag:dlq");
        assert_eq!(streams.group, "rag-workers");
    }

    #[test]
    fn ops_key_shapes() {
        assert_eq!(hb_key("rag", "42"), "ops:hb:rag:42");
        assert_eq!(idemp_key("rag:tasks", "7-0"), "ops:idemp:rag:tasks:7-0");
    }

    #[tokio::test]
    async fn keys_are_namespaced() {
        let store = Arc::new(InMemoryStreamStore::new());
        let client = StreamClient::new(store.clone(), "agentic");

        client.publish("rag:tasks", &json!({"n": 1}), None).await.unwrap();
        assert_eq!(store.stream_len("agentic:rag:tasks").await.unwrap(), 1);
        assert_eq!(store.stream_len("rag:tasks").await.unwrap(), 0);
        assert_eq!(client.stream_len("rag:tasks").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn empty_namespace_leaves_keys_bare() {
        let store = Arc::new(InMemoryStreamStore::new());
        let client = StreamClient::new(store.clone(), "");
        client.publish("s", &json!({}), None).await.unwrap();
        assert_eq!(store.stream_len("s").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn lock_and_heartbeat_round_trip() {
        let store = Arc::new(InMemoryStreamStore::new());
        let client = StreamClient::new(store.clone(), "agentic");

        assert!(client
            .lock_acquire("rag:tasks", "1-0", Duration::from_secs(60))
            .await
            .unwrap());
        assert!(!client
            .lock_acquire("rag:tasks", "1-0", Duration::from_secs(60))
            .await
            .unwrap());

        client
            .heartbeat("rag", "42", Duration::from_secs(30))
            .await
            .unwrap();
        assert!(store.get_key("agentic:ops:hb:rag:42").await.is_some());
    }
}
