//! Canonical result envelope exchanged at every component boundary.
//!
//! An [`Envelope`] is metadata + records + per-record provenance. Envelopes
//! are created inside an agent and immutable once returned; everything that
//! crosses a stream boundary is an envelope or an error string.
//!
//! Row hashes are SHA-256 over canonical JSON bytes. `serde_json`'s default
//! `Map` is BTreeMap-backed, so object keys serialize in sorted order and
//! identical record content always produces an identical hash.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

/// A raw table row: column name → value.
pub type Row = Map<String, Value>;

/// Terminal status of an envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EnvelopeStatus {
    Success,
    Error,
}

/// Whether the retrieval cache served this envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheStatus {
    Hit,
    Miss,
}

/// How the retrieval pipeline ultimately produced records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FallbackKind {
    /// LLM-backed reasoning path produced the records.
    Agent,
    /// A relaxed filter set produced the records.
    Reformulation,
    /// The fallback budget was exhausted; zero records, no error.
    Suppressed,
}

/// One executed reformulation attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReformulationAttempt {
    pub reason: String,
    pub filters: Value,
    pub result_count: usize,
}

/// Aggregate attached when a result set is truncated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Summary {
    /// Column the counts are grouped by.
    pub group_by: String,
    pub counts: BTreeMap<String, usize>,
}

/// Envelope metadata. Optional fields are omitted from the wire when unset.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Metadata {
    pub source: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    pub retrieved_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub query_filters: Option<Value>,
    pub total_count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub offset: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache: Option<CacheStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fallback: Option<FallbackKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub truncated: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<Summary>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reformulation_attempts: Option<Vec<ReformulationAttempt>>,
}

impl Metadata {
    fn new(source: &str, task_id: Option<&str>) -> Self {
        Self {
            source: source.to_string(),
            task_id: task_id.map(str::to_string),
            retrieved_at: Utc::now(),
            query_filters: None,
            total_count: 0,
            limit: None,
            offset: None,
            cache: None,
            fallback: None,
            truncated: None,
            summary: None,
            reformulation_attempts: None,
        }
    }
}

/// Audit block carried by every record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Provenance {
    pub source: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub row_id: Option<Value>,
    pub row_hash: String,
    pub retrieved_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub raw_row: Option<Value>,
}

/// One record: arbitrary columns plus provenance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    #[serde(flatten)]
    pub fields: Row,
    pub provenance: Provenance,
}

impl Record {
    /// The record without its audit block (the original row).
    pub fn strip_provenance(&self) -> Row {
        self.fields.clone()
    }
}

/// Optional metadata supplied by the producing agent.
#[derive(Debug, Clone, Default)]
pub struct MetadataExtra {
    pub query_filters: Option<Value>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
    pub cache: Option<CacheStatus>,
    pub fallback: Option<FallbackKind>,
    pub summary: Option<Summary>,
    /// Pre-truncation count; only meaningful alongside `summary`.
    pub total_count_override: Option<usize>,
    pub reformulation_attempts: Option<Vec<ReformulationAttempt>>,
    pub include_raw: bool,
}

/// Canonical boundary value: metadata + records + provenance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub metadata: Metadata,
    pub records: Vec<Record>,
    pub status: EnvelopeStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Envelope {
    /// Build a success envelope from raw rows, attaching provenance.
    ///
    /// `total_count` is the record count unless `extra` carries a summary
    /// with a pre-truncation override.
    pub fn from_records(
        source: &str,
        rows: Vec<Row>,
        task_id: Option<&str>,
        extra: MetadataExtra,
    ) -> Self {
        let mut metadata = Metadata::new(source, task_id);
        let retrieved_at = metadata.retrieved_at;

        let records: Vec<Record> = rows
            .into_iter()
            .map(|row| {
                let provenance = Provenance {
                    source: source.to_string(),
                    row_id: row.get("id").cloned(),
                    row_hash: row_hash(&row),
                    retrieved_at,
                    raw_row: extra.include_raw.then(|| Value::Object(row.clone())),
                };
                Record {
                    fields: row,
                    provenance,
                }
            })
            .collect();

        metadata.total_count = match (&extra.summary, extra.total_count_override) {
            (Some(_), Some(n)) => n,
            _ => records.len(),
        };
        metadata.truncated = extra.summary.as_ref().map(|_| true);
        metadata.query_filters = extra.query_filters;
        metadata.limit = extra.limit;
        metadata.offset = extra.offset;
        metadata.cache = extra.cache;
        metadata.fallback = extra.fallback;
        metadata.summary = extra.summary;
        metadata.reformulation_attempts = extra.reformulation_attempts;

        Self {
            metadata,
            records,
            status: EnvelopeStatus::Success,
            error: None,
        }
    }

    /// Build an error envelope with zero records.
    pub fn error(source: &str, task_id: Option<&str>, message: impl Into<String>) -> Self {
        Self {
            metadata: Metadata::new(source, task_id),
            records: Vec::new(),
            status: EnvelopeStatus::Error,
            error: Some(message.into()),
        }
    }

    /// Structural validation; `Err` carries the first violation found.
    pub fn validate(&self) -> Result<(), String> {
        if self.metadata.source.is_empty() {
            return Err("metadata.source is empty".into());
        }
        if self.metadata.total_count != self.records.len() && self.metadata.summary.is_none() {
            return Err(format!(
                "total_count {} does not match {} records and no summary is present",
                self.metadata.total_count,
                self.records.len()
            ));
        }
        for (i, record) in self.records.iter().enumerate() {
            if record.provenance.source.is_empty() {
                return Err(format!("record {i} provenance.source is empty"));
            }
            if record.provenance.row_hash.len() != 64 {
                return Err(format!("record {i} provenance.row_hash is not a SHA-256 hex"));
            }
        }
        Ok(())
    }
}

/// SHA-256 of the canonical JSON rendering of a row, lowercase hex.
///
/// Canonical means key-sorted objects at every nesting level, which the
/// default BTreeMap-backed `serde_json::Map` provides.
pub fn row_hash(row: &Row) -> String {
    let bytes = serde_json::to_vec(row).expect("row serialization should never fail");
    let digest = Sha256::digest(&bytes);
    format!("{digest:x}")
}
