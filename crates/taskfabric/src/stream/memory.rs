//! In-memory stream store for tests and local runs.
//!
//! Implements the consumer-group state machine of the remote store
//! deterministically: monotonic `{seq}-0` entry ids, per-group delivery
//! cursors and pending sets, approximate maxlen trimming, and TTL keys.
//! Blocking reads wake early on publish via a shared `Notify`.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{Mutex, Notify};
use tokio::time::{Duration, Instant};

use crate::errors::StreamError;

use super::{GroupStart, PendingStats, StreamEntry, StreamStore};

#[derive(Debug, Clone)]
struct StoredEntry {
    seq: u64,
    payload: Value,
}

#[derive(Debug, Default)]
struct GroupState {
    /// Highest seq delivered to any consumer of this group.
    cursor: u64,
    /// seq → consumer that holds the entry, until acked.
    pending: BTreeMap<u64, String>,
}

#[derive(Debug, Default)]
struct StreamState {
    entries: Vec<StoredEntry>,
    next_seq: u64,
    groups: HashMap<String, GroupState>,
}

#[derive(Default)]
struct StoreState {
    streams: HashMap<String, StreamState>,
    /// TTL string keys: key → (value, deadline).
    keys: HashMap<String, (String, Instant)>,
}

/// Deterministic in-memory implementation of [`StreamStore`].
pub struct InMemoryStreamStore {
    state: Arc<Mutex<StoreState>>,
    notify: Arc<Notify>,
}

impl InMemoryStreamStore {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(StoreState::default())),
            notify: Arc::new(Notify::new()),
        }
    }

    fn format_id(seq: u64) -> String {
        format!("{seq}-0")
    }

    fn parse_seq(id: &str) -> Result<u64, StreamError> {
        let head = id.split('-').next().unwrap_or_default();
        head.parse()
            .map_err(|_| StreamError::decode(format!("malformed entry id '{id}'")))
    }
}

impl Default for InMemoryStreamStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StreamStore for InMemoryStreamStore {
    async fn append(
        &self,
        stream: &str,
        payload: &Value,
        maxlen: Option<usize>,
    ) -> Result<String, StreamError> {
        let mut state = self.state.lock().await;
        let stream_state = state.streams.entry(stream.to_string()).or_default();
        stream_state.next_seq += 1;
        let seq = stream_state.next_seq;
        stream_state.entries.push(StoredEntry {
            seq,
            payload: payload.clone(),
        });
        if let Some(maxlen) = maxlen {
            let len = stream_state.entries.len();
            if len > maxlen {
                stream_state.entries.drain(0..len - maxlen);
            }
        }
        drop(state);
        self.notify.notify_waiters();
        Ok(Self::format_id(seq))
    }

    async fn create_group(
        &self,
        stream: &str,
        group: &str,
        start: GroupStart,
    ) -> Result<bool, StreamError> {
        let mut state = self.state.lock().await;
        let stream_state = state.streams.entry(stream.to_string()).or_default();
        if stream_state.groups.contains_key(group) {
            return Ok(false);
        }
        let cursor = match start {
            GroupStart::NewOnly => stream_state.next_seq,
            GroupStart::Beginning => 0,
        };
        stream_state.groups.insert(
            group.to_string(),
            GroupState {
                cursor,
                pending: BTreeMap::new(),
            },
        );
        Ok(true)
    }

    async fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block: Duration,
    ) -> Result<Vec<StreamEntry>, StreamError> {
        let deadline = Instant::now() + block;
        loop {
            {
                let mut state = self.state.lock().await;
                let stream_state = state.streams.entry(stream.to_string()).or_default();
                let Some(group_state) = stream_state.groups.get_mut(group) else {
                    return Err(StreamError::command(format!(
                        "NOGROUP no such consumer group '{group}' for stream '{stream}'"
                    )));
                };

                let fresh: Vec<StoredEntry> = stream_state
                    .entries
                    .iter()
                    .filter(|e| e.seq > group_state.cursor)
                    .take(count)
                    .cloned()
                    .collect();

                if !fresh.is_empty() {
                    let mut out = Vec::with_capacity(fresh.len());
                    for entry in fresh {
                        group_state.cursor = entry.seq;
                        group_state.pending.insert(entry.seq, consumer.to_string());
                        out.push(StreamEntry {
                            id: Self::format_id(entry.seq),
                            payload: entry.payload,
                        });
                    }
                    return Ok(out);
                }
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(Vec::new());
            }
            let _ = tokio::time::timeout(deadline - now, self.notify.notified()).await;
        }
    }

    async fn read(
        &self,
        stream: &str,
        after_id: &str,
        count: usize,
        block: Duration,
    ) -> Result<Vec<StreamEntry>, StreamError> {
        let after_seq = if after_id == "0-0" || after_id == "0" {
            0
        } else {
            Self::parse_seq(after_id)?
        };
        let deadline = Instant::now() + block;
        loop {
            {
                let state = self.state.lock().await;
                if let Some(stream_state) = state.streams.get(stream) {
                    let fresh: Vec<StreamEntry> = stream_state
                        .entries
                        .iter()
                        .filter(|e| e.seq > after_seq)
                        .take(count)
                        .map(|e| StreamEntry {
                            id: Self::format_id(e.seq),
                            payload: e.payload.clone(),
                        })
                        .collect();
                    if !fresh.is_empty() {
                        return Ok(fresh);
                    }
                }
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(Vec::new());
            }
            let _ = tokio::time::timeout(deadline - now, self.notify.notified()).await;
        }
    }

    async fn ack(&self, stream: &str, group: &str, msg_id: &str) -> Result<bool, StreamError> {
        let seq = Self::parse_seq(msg_id)?;
        let mut state = self.state.lock().await;
        let removed = state
            .streams
            .get_mut(stream)
            .and_then(|s| s.groups.get_mut(group))
            .map(|g| g.pending.remove(&seq).is_some())
            .unwrap_or(false);
        Ok(removed)
    }

    async fn pending(&self, stream: &str, group: &str) -> Result<PendingStats, StreamError> {
        let state = self.state.lock().await;
        let pending = state
            .streams
            .get(stream)
            .and_then(|s| s.groups.get(group))
            .map(|g| g.pending.len())
            .unwrap_or(0);
        Ok(PendingStats { pending })
    }

    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, StreamError> {
        let mut state = self.state.lock().await;
        let now = Instant::now();
        let live = state
            .keys
            .get(key)
            .map(|(_, deadline)| *deadline > now)
            .unwrap_or(false);
        if live {
            return Ok(false);
        }
        state.keys.insert(key.to_string(), (value.to_string(), now + ttl));
        Ok(true)
    }

    async fn put_ttl(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StreamError> {
        let mut state = self.state.lock().await;
        state
            .keys
            .insert(key.to_string(), (value.to_string(), Instant::now() + ttl));
        Ok(())
    }

    async fn stream_len(&self, stream: &str) -> Result<usize, StreamError> {
        let state = self.state.lock().await;
        Ok(state.streams.get(stream).map(|s| s.entries.len()).unwrap_or(0))
    }
}

impl InMemoryStreamStore {
    /// Test helper: current value of a TTL key, if unexpired.
    pub async fn get_key(&self, key: &str) -> Option<String> {
        let state = self.state.lock().await;
        state.keys.get(key).and_then(|(value, deadline)| {
            (*deadline > Instant::now()).then(|| value.clone())
        })
    }
}
