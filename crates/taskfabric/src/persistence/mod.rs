//! Governed persistence layer.
//!
//! All database access flows through [`PersistenceService`], which enforces
//! read/write allowlists over a pluggable [`PersistenceAdapter`]. Retrieval
//! paths get a [`ReadOnlyFacade`] that cannot mutate state.
//!
//! Filters are a small tagged DSL rather than stringly-typed maps; adapters
//! advertise a [`Capabilities`] set and higher layers negotiate operator
//! shape against it before dispatch.

mod facade;
mod memory;
pub mod metrics;
mod rest;
mod service;

pub use facade::{read_only_service, ReadOnlyFacade};
pub use memory::InMemoryAdapter;
pub use rest::{RestAdapter, RestAdapterConfig};
pub use service::PersistenceService;

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::envelope::Row;
use crate::errors::PersistenceError;

/// Range comparison operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RangeOp {
    Gt,
    Gte,
    Lt,
    Lte,
}

impl RangeOp {
    /// PostgREST operator token.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Gt => "gt",
            Self::Gte => "gte",
            Self::Lt => "lt",
            Self::Lte => "lte",
        }
    }
}

/// One column predicate.
///
/// Externally tagged serde gives the wire shape the rest of the system
/// speaks: `{"eq": "x"}`, `{"ilike": "%acme%"}`, `{"in": [1, 2]}`,
/// `{"range": ["gte", 5]}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FilterOp {
    Eq(Value),
    /// Case-insensitive match; `%` is the multi-character wildcard.
    Ilike(String),
    In(Vec<Value>),
    Range(RangeOp, Value),
}

/// Ordered column → predicate map. BTreeMap keeps serialization (and
/// therefore cache keys) deterministic.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FilterSet(pub BTreeMap<String, FilterOp>);

impl FilterSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, column: impl Into<String>, op: FilterOp) {
        self.0.insert(column.into(), op);
    }

    pub fn remove(&mut self, column: &str) -> Option<FilterOp> {
        self.0.remove(column)
    }

    pub fn get(&self, column: &str) -> Option<&FilterOp> {
        self.0.get(column)
    }

    pub fn contains(&self, column: &str) -> bool {
        self.0.contains_key(column)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &FilterOp)> {
        self.0.iter()
    }

    /// JSON rendering for envelope metadata and monitoring events.
    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

/// Adapter-advertised feature flags, consulted before emitting operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capabilities {
    pub equality_filters: bool,
    pub ordering: bool,
    pub limit: bool,
    pub projections: bool,
    pub ilike: bool,
    pub range_operators: bool,
    pub in_operator: bool,
    pub max_batch_size: usize,
}

/// Query shape accepted by adapters.
#[derive(Debug, Clone, Default)]
pub struct QueryOptions {
    pub filters: FilterSet,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
    pub order_by: Option<String>,
    pub descending: bool,
    /// Column projection; `None` selects everything.
    pub select: Option<Vec<String>>,
}

impl QueryOptions {
    pub fn filtered(filters: FilterSet) -> Self {
        Self {
            filters,
            ..Default::default()
        }
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn with_offset(mut self, offset: usize) -> Self {
        self.offset = Some(offset);
        self
    }
}

/// Backend-specific database driver.
///
/// Adapters are intentionally thin: validation, allowlist enforcement, and
/// instrumentation live in [`PersistenceService`]. An adapter must reject
/// operators it does not advertise in [`Capabilities`] with a permanent
/// adapter error rather than silently degrading.
#[async_trait]
pub trait PersistenceAdapter: Send + Sync {
    async fn write(&self, table: &str, record: Row) -> Result<Row, PersistenceError>;

    async fn batch_write(&self, table: &str, records: Vec<Row>)
        -> Result<Vec<Row>, PersistenceError>;

    async fn upsert(
        &self,
        table: &str,
        record: Row,
        on_conflict: Option<&[String]>,
    ) -> Result<Row, PersistenceError>;

    async fn read(
        &self,
        table: &str,
        id_value: &Value,
        id_column: &str,
    ) -> Result<Option<Row>, PersistenceError>;

    async fn query(&self, table: &str, options: &QueryOptions)
        -> Result<Vec<Row>, PersistenceError>;

    /// Column names of a table, when the backend can enumerate them.
    async fn get_columns(&self, table: &str) -> Result<Option<Vec<String>>, PersistenceError>;

    fn capabilities(&self) -> Capabilities;
}
