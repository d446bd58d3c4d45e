//! Durable stream layer.
//!
//! A [`StreamStore`] is a log store with consumer groups (Redis streams
//! semantics); [`StreamClient`] adds key namespacing and the fabric's wire
//! conventions on top of whichever store is plugged in. The in-memory store
//! carries the full group/ack/trim/TTL semantics so tests and local runs
//! exercise the same state machine as production.

mod client;
mod memory;
pub mod messages;
mod redis_store;

pub use client::{DomainStreams, StreamClient};
pub use memory::InMemoryStreamStore;
pub use redis_store::RedisStreamStore;

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::errors::StreamError;

/// One delivered stream entry: the store-assigned id plus the decoded
/// payload carried under the `data` field.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamEntry {
    pub id: String,
    pub payload: Value,
}

/// Where a newly created consumer group starts reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupStart {
    /// Only entries appended after group creation (`$`).
    NewOnly,
    /// The whole stream (`0-0`).
    Beginning,
}

/// Consumer-group statistics for health checks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PendingStats {
    /// Entries delivered to the group but not yet acknowledged.
    pub pending: usize,
}

/// A durable log store with consumer groups, TTL keys, and trimming.
///
/// Stream and key names passed here are fully namespaced; namespacing is
/// the [`StreamClient`]'s job.
#[async_trait]
pub trait StreamStore: Send + Sync {
    /// Append an entry whose `data` field is the JSON-encoded payload.
    /// Applies approximate trimming to `maxlen` when set. Returns the
    /// store-assigned entry id.
    async fn append(
        &self,
        stream: &str,
        payload: &Value,
        maxlen: Option<usize>,
    ) -> Result<String, StreamError>;

    /// Create a consumer group, creating the stream if needed. Idempotent:
    /// returns `false` when the group already existed.
    async fn create_group(
        &self,
        stream: &str,
        group: &str,
        start: GroupStart,
    ) -> Result<bool, StreamError>;

    /// Claim up to `count` new entries for `consumer`, blocking up to
    /// `block` when the stream is empty.
    async fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block: Duration,
    ) -> Result<Vec<StreamEntry>, StreamError>;

    /// Plain range read (no group): entries strictly after `after_id`
    /// (`"0-0"` reads from the beginning), blocking up to `block` when
    /// nothing is available.
    async fn read(
        &self,
        stream: &str,
        after_id: &str,
        count: usize,
        block: Duration,
    ) -> Result<Vec<StreamEntry>, StreamError>;

    async fn ack(&self, stream: &str, group: &str, msg_id: &str) -> Result<bool, StreamError>;

    async fn pending(&self, stream: &str, group: &str) -> Result<PendingStats, StreamError>;

    /// Set `key` only if absent, with a TTL. Returns whether the key was
    /// set. This is the idempotency-lock primitive.
    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, StreamError>;

    /// Unconditionally set `key` with a TTL (the heartbeat primitive).
    async fn put_ttl(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StreamError>;

    async fn stream_len(&self, stream: &str) -> Result<usize, StreamError>;
}
