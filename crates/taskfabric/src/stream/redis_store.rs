//! Redis-backed stream store.
//!
//! Maps the [`StreamStore`] contract onto Redis streams: `XADD` with
//! approximate `MAXLEN ~` trimming, `XGROUP CREATE … MKSTREAM` tolerating
//! `BUSYGROUP`, blocking `XREADGROUP`/`XREAD`, `XACK`, `XPENDING`, and
//! plain string keys with `SET NX EX` / `SET EX` for locks and heartbeats.

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::streams::{StreamMaxlen, StreamPendingReply, StreamReadOptions, StreamReadReply};
use redis::AsyncCommands;
use serde_json::Value;

use crate::errors::StreamError;

use super::{GroupStart, PendingStats, StreamEntry, StreamStore};

/// Field under which every entry carries its JSON payload.
const DATA_FIELD: &str = "data";

/// Remote implementation of [`StreamStore`] over a shared connection
/// manager (auto-reconnecting, cheap to clone).
pub struct RedisStreamStore {
    conn: ConnectionManager,
}

impl RedisStreamStore {
    /// Connect using a full URL (`redis://` or `rediss://`).
    pub async fn connect(url: &str) -> Result<Self, StreamError> {
        let client = redis::Client::open(url).map_err(StreamError::from)?;
        let conn = ConnectionManager::new(client)
            .await
            .map_err(StreamError::from)?;
        Ok(Self { conn })
    }

    fn decode_entries(reply: StreamReadReply) -> Result<Vec<StreamEntry>, StreamError> {
        let mut out = Vec::new();
        for key in reply.keys {
            for id in key.ids {
                let raw = id.map.get(DATA_FIELD).cloned().ok_or_else(|| {
                    StreamError::decode(format!("entry {} has no '{DATA_FIELD}' field", id.id))
                })?;
                let text: String =
                    redis::from_redis_value(&raw).map_err(|e| StreamError::decode(e.to_string()))?;
                let payload: Value = serde_json::from_str(&text)
                    .map_err(|e| StreamError::decode(format!("entry {}: {e}", id.id)))?;
                out.push(StreamEntry { id: id.id, payload });
            }
        }
        Ok(out)
    }
}

#[async_trait]
impl StreamStore for RedisStreamStore {
    async fn append(
        &self,
        stream: &str,
        payload: &Value,
        maxlen: Option<usize>,
    ) -> Result<String, StreamError> {
        let mut conn = self.conn.clone();
        let encoded = payload.to_string();
        let fields = [(DATA_FIELD, encoded.as_str())];
        let id: String = match maxlen {
            Some(n) => {
                conn.xadd_maxlen(stream, StreamMaxlen::Approx(n), "*", &fields)
                    .await?
            }
            None => conn.xadd(stream, "*", &fields).await?,
        };
        Ok(id)
    }

    async fn create_group(
        &self,
        stream: &str,
        group: &str,
        start: GroupStart,
    ) -> Result<bool, StreamError> {
        let mut conn = self.conn.clone();
        let cursor = match start {
            GroupStart::NewOnly => "$",
            GroupStart::Beginning => "0-0",
        };
        let result: Result<String, redis::RedisError> =
            conn.xgroup_create_mkstream(stream, group, cursor).await;
        match result {
            Ok(_) => Ok(true),
            Err(e) if e.to_string().to_uppercase().contains("BUSYGROUP") => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block: Duration,
    ) -> Result<Vec<StreamEntry>, StreamError> {
        let mut conn = self.conn.clone();
        let options = StreamReadOptions::default()
            .group(group, consumer)
            .count(count)
            .block(block.as_millis() as usize);
        let reply: StreamReadReply = conn.xread_options(&[stream], &[">"], &options).await?;
        Self::decode_entries(reply)
    }

    async fn read(
        &self,
        stream: &str,
        after_id: &str,
        count: usize,
        block: Duration,
    ) -> Result<Vec<StreamEntry>, StreamError> {
        let mut conn = self.conn.clone();
        let options = StreamReadOptions::default()
            .count(count)
            .block(block.as_millis() as usize);
        let reply: StreamReadReply = conn.xread_options(&[stream], &[after_id], &options).await?;
        Self::decode_entries(reply)
    }

    async fn ack(&self, stream: &str, group: &str, msg_id: &str) -> Result<bool, StreamError> {
        let mut conn = self.conn.clone();
        let acked: i64 = conn.xack(stream, group, &[msg_id]).await?;
        Ok(acked > 0)
    }

    async fn pending(&self, stream: &str, group: &str) -> Result<PendingStats, StreamError> {
        let mut conn = self.conn.clone();
        let reply: StreamPendingReply = conn.xpending(stream, group).await?;
        let pending = match reply {
            StreamPendingReply::Empty => 0,
            StreamPendingReply::Data(data) => data.count,
        };
        Ok(PendingStats { pending })
    }

    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, StreamError> {
        let mut conn = self.conn.clone();
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("EX")
            .arg(ttl.as_secs().max(1))
            .query_async(&mut conn)
            .await?;
        Ok(reply.is_some())
    }

    async fn put_ttl(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StreamError> {
        let mut conn = self.conn.clone();
        let _: () = conn.set_ex(key, value, ttl.as_secs().max(1)).await?;
        Ok(())
    }

    async fn stream_len(&self, stream: &str) -> Result<usize, StreamError> {
        let mut conn = self.conn.clone();
        let len: usize = conn.xlen(stream).await?;
        Ok(len)
    }
}
