//! PostgREST-style remote adapter.
//!
//! Delegates to an external table service speaking the PostgREST dialect
//! (`/rest/v1/{table}` with `eq.` / `ilike.` / `in.` operator parameters).
//! Connection failures, timeouts, 429 and 5xx responses classify as
//! transient; other non-success responses as permanent.

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde_json::Value;

use crate::envelope::Row;
use crate::errors::{AdapterErrorKind, PersistenceError};

use super::{Capabilities, FilterOp, PersistenceAdapter, QueryOptions};

/// Connection settings for a [`RestAdapter`].
#[derive(Debug, Clone)]
pub struct RestAdapterConfig {
    /// Service base URL, e.g. `https://project.example.co`.
    pub base_url: String,
    /// Service key sent as both `apikey` and bearer token.
    pub api_key: String,
    pub timeout_secs: u64,
}

impl RestAdapterConfig {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            api_key: api_key.into(),
            timeout_secs: 15,
        }
    }
}

/// Remote REST implementation of [`PersistenceAdapter`].
pub struct RestAdapter {
    client: Client,
    base_url: String,
    api_key: String,
}

impl RestAdapter {
    pub fn new(config: RestAdapterConfig) -> Result<Self, PersistenceError> {
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| PersistenceError::Adapter {
                op: "init".into(),
                table: String::new(),
                kind: AdapterErrorKind::Permanent,
                message: format!("failed to build HTTP client: {e}"),
                source: Some(Box::new(e)),
            })?;
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key,
        })
    }

    fn table_url(&self, table: &str) -> String {
        format!("{}/rest/v1/{}", self.base_url, table)
    }

    fn transport_error(
        op: &str,
        table: &str,
        err: reqwest::Error,
    ) -> PersistenceError {
        let kind = if err.is_connect() || err.is_timeout() {
            AdapterErrorKind::Transient
        } else {
            AdapterErrorKind::Permanent
        };
        PersistenceError::Adapter {
            op: op.into(),
            table: table.into(),
            kind,
            message: err.to_string(),
            source: Some(Box::new(err)),
        }
    }

    fn status_error(op: &str, table: &str, status: StatusCode, body: String) -> PersistenceError {
        let kind = if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
            AdapterErrorKind::Transient
        } else {
            AdapterErrorKind::Permanent
        };
        PersistenceError::Adapter {
            op: op.into(),
            table: table.into(),
            kind,
            message: format!("backend returned {status}: {body}"),
            source: None,
        }
    }

    async fn send_rows(
        &self,
        op: &str,
        table: &str,
        request: reqwest::RequestBuilder,
    ) -> Result<Vec<Row>, PersistenceError> {
        let response = request
            .header("apikey", &self.api_key)
            .bearer_auth(&self.api_key)
            .send()
            .await
            .map_err(|e| Self::transport_error(op, table, e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Self::status_error(op, table, status, body));
        }

        let rows: Vec<Row> = response
            .json()
            .await
            .map_err(|e| Self::transport_error(op, table, e))?;
        Ok(rows)
    }

    fn first_row(op: &str, table: &str, rows: Vec<Row>) -> Result<Row, PersistenceError> {
        rows.into_iter().next().ok_or_else(|| PersistenceError::Adapter {
            op: op.into(),
            table: table.into(),
            kind: AdapterErrorKind::Permanent,
            message: "backend returned no representation".into(),
            source: None,
        })
    }
}

/// Render a JSON scalar the way PostgREST expects it in a parameter.
fn param_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Build the query-parameter list for a [`QueryOptions`].
///
/// Pure so the operator translation is testable without a server:
/// `ilike` swaps `%` for PostgREST's `*` wildcard, `in` renders as
/// `in.(a,b)`, range operators map straight through.
fn query_params(options: &QueryOptions) -> Vec<(String, String)> {
    let mut params: Vec<(String, String)> = Vec::new();

    if let Some(select) = &options.select {
        params.push(("select".into(), select.join(",")));
    }
    for (column, op) in options.filters.iter() {
        let rendered = match op {
            FilterOp::Eq(v) => format!("eq.{}", param_value(v)),
            FilterOp::Ilike(pattern) => format!("ilike.{}", pattern.replace('%', "*")),
            FilterOp::In(values) => {
                let items: Vec<String> = values.iter().map(param_value).collect();
                format!("in.({})", items.join(","))
            }
            FilterOp::Range(op, v) => format!("{}.{}", op.as_str(), param_value(v)),
        };
        params.push((column.clone(), rendered));
    }
    if let Some(order_by) = &options.order_by {
        let direction = if options.descending { "desc" } else { "asc" };
        params.push(("order".into(), format!("{order_by}.{direction}")));
    }
    if let Some(limit) = options.limit {
        params.push(("limit".into(), limit.to_string()));
    }
    if let Some(offset) = options.offset.filter(|o| *o > 0) {
        params.push(("offset".into(), offset.to_string()));
    }
    params
}

#[async_trait]
impl PersistenceAdapter for RestAdapter {
    async fn write(&self, table: &str, record: Row) -> Result<Row, PersistenceError> {
        let request = self
            .client
            .post(self.table_url(table))
            .header("Prefer", "return=representation")
            .json(&record);
        let rows = self.send_rows("write", table, request).await?;
        Self::first_row("write", table, rows)
    }

    async fn batch_write(
        &self,
        table: &str,
        records: Vec<Row>,
    ) -> Result<Vec<Row>, PersistenceError> {
        let request = self
            .client
            .post(self.table_url(table))
            .header("Prefer", "return=representation")
            .json(&records);
        self.send_rows("batch_write", table, request).await
    }

    async fn upsert(
        &self,
        table: &str,
        record: Row,
        on_conflict: Option<&[String]>,
    ) -> Result<Row, PersistenceError> {
        let mut request = self
            .client
            .post(self.table_url(table))
            .header("Prefer", "return=representation,resolution=merge-duplicates")
            .json(&record);
        if let Some(keys) = on_conflict.filter(|k| !k.is_empty()) {
            request = request.query(&[("on_conflict", keys.join(","))]);
        }
        let rows = self.send_rows("upsert", table, request).await?;
        Self::first_row("upsert", table, rows)
    }

    async fn read(
        &self,
        table: &str,
        id_value: &Value,
        id_column: &str,
    ) -> Result<Option<Row>, PersistenceError> {
        let params = vec![
            (id_column.to_string(), format!("eq.{}", param_value(id_value))),
            ("limit".to_string(), "1".to_string()),
        ];
        let request = self.client.get(self.table_url(table)).query(&params);
        let rows = self.send_rows("read", table, request).await?;
        Ok(rows.into_iter().next())
    }

    async fn query(
        &self,
        table: &str,
        options: &QueryOptions,
    ) -> Result<Vec<Row>, PersistenceError> {
        let params = query_params(options);
        let request = self.client.get(self.table_url(table)).query(&params);
        self.send_rows("query", table, request).await
    }

    async fn get_columns(&self, table: &str) -> Result<Option<Vec<String>>, PersistenceError> {
        let request = self
            .client
            .get(self.table_url(table))
            .query(&[("limit", "1")]);
        let rows = self.send_rows("get_columns", table, request).await?;
        Ok(rows.into_iter().next().map(|row| {
            let mut columns: Vec<String> = row.keys().cloned().collect();
            columns.sort();
            columns
        }))
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            equality_filters: true,
            ordering: true,
            limit: true,
            projections: true,
            ilike: true,
            range_operators: true,
            in_operator: true,
            max_batch_size: 500,
        }
    }
}
