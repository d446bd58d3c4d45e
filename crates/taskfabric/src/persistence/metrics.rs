//! In-process metrics for persistence operations.
//!
//! Counters and latency aggregates per `(op, table)`, held behind a lock so
//! concurrent workers can update them safely. A snapshot is a plain sorted
//! list suitable for export by whatever sink the host wires up.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::Mutex;

#[derive(Debug, Clone, Copy)]
struct OpStats {
    count: u64,
    total_ms: f64,
    min_ms: f64,
    max_ms: f64,
}

/// One row of a metrics snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricsEntry {
    pub op: String,
    pub table: String,
    pub count: u64,
    pub min_ms: f64,
    pub max_ms: f64,
    pub avg_ms: f64,
}

/// Shared registry of per-operation latency stats. Cheap to clone.
#[derive(Clone, Default)]
pub struct MetricsRegistry {
    inner: Arc<Mutex<BTreeMap<(String, String), OpStats>>>,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one completed operation.
    pub fn observe(&self, op: &str, table: &str, elapsed_ms: f64) {
        let mut inner = self.inner.lock();
        let stats = inner
            .entry((op.to_string(), table.to_string()))
            .or_insert(OpStats {
                count: 0,
                total_ms: 0.0,
                min_ms: elapsed_ms,
                max_ms: elapsed_ms,
            });
        stats.count += 1;
        stats.total_ms += elapsed_ms;
        stats.min_ms = stats.min_ms.min(elapsed_ms);
        stats.max_ms = stats.max_ms.max(elapsed_ms);
    }

    /// Sorted read-only view of the accumulated stats.
    pub fn snapshot(&self) -> Vec<MetricsEntry> {
        let inner = self.inner.lock();
        inner
            .iter()
            .map(|((op, table), stats)| MetricsEntry {
                op: op.clone(),
                table: table.clone(),
                count: stats.count,
                min_ms: stats.min_ms,
                max_ms: stats.max_ms,
                avg_ms: if stats.count == 0 {
                    0.0
                } else {
                    stats.total_ms / stats.count as f64
                },
            })
            .collect()
    }
}
