//! Error types for the fabric layers.
//!
//! Each layer has its own small enum so callers can match on the failure
//! kind at runtime. Retry policy lives on [`AgentError::retry`]: the worker
//! runtime consults it instead of inspecting error text.

use thiserror::Error;

/// Whether the underlying backend failure is worth retrying.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdapterErrorKind {
    /// Network-level failure, timeout, or a 5xx-class backend response.
    Transient,
    /// Shape or semantic failure the backend will keep rejecting.
    Permanent,
}

/// Errors from the persistence layer (service, facade, adapters).
#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("PersistencePermissionError: {message}")]
    Permission { message: String },
    #[error("TableNotAllowedError: {operation} access to table '{table}' is not permitted by policy")]
    TableNotAllowed { table: String, operation: String },
    #[error("AdapterError: {op} on {table} failed: {message}")]
    Adapter {
        op: String,
        table: String,
        kind: AdapterErrorKind,
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },
    #[error("ValidationError: {message}")]
    Validation { message: String },
}

impl PersistenceError {
    pub fn permission(message: impl Into<String>) -> Self {
        Self::Permission {
            message: message.into(),
        }
    }

    pub fn table_not_allowed(table: impl Into<String>, operation: impl Into<String>) -> Self {
        Self::TableNotAllowed {
            table: table.into(),
            operation: operation.into(),
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    /// Stable kind name, used when a failure is rendered into a result
    /// envelope so consumers can match without parsing prose.
    pub fn kind_name(&self) -> &'static str {
        match self {
            Self::Permission { .. } => "PersistencePermissionError",
            Self::TableNotAllowed { .. } => "TableNotAllowedError",
            Self::Adapter { .. } => "AdapterError",
            Self::Validation { .. } => "ValidationError",
        }
    }
}

/// Errors from the stream store.
#[derive(Debug, Error)]
pub enum StreamError {
    #[error("stream connection error: {message}")]
    Connection { message: String },
    #[error("stream command error: {message}")]
    Command { message: String },
    #[error("stream payload decode error: {message}")]
    Decode { message: String },
}

impl StreamError {
    pub fn command(message: impl Into<String>) -> Self {
        Self::Command {
            message: message.into(),
        }
    }

    pub fn decode(message: impl Into<String>) -> Self {
        Self::Decode {
            message: message.into(),
        }
    }
}

impl From<redis::RedisError> for StreamError {
    fn from(err: redis::RedisError) -> Self {
        if err.is_connection_refusal() || err.is_timeout() || err.is_connection_dropped() {
            Self::Connection {
                message: err.to_string(),
            }
        } else {
            Self::Command {
                message: err.to_string(),
            }
        }
    }
}

/// How the worker runtime should treat a failed task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryPolicy {
    /// Terminal: publish the error result (and dead-letter) immediately.
    Never,
    /// Retry up to the configured per-task ceiling.
    UpToLimit,
    /// Unknown failure: retry exactly once, then dead-letter.
    Once,
}

/// Errors surfaced by task agents to the worker runtime.
///
/// Agents handle their own in-domain soft failures (an empty retrieval is a
/// successful envelope, not an error); what escapes here is either a policy
/// violation, a backend failure, or a programmer error.
#[derive(Debug, Error)]
pub enum AgentError {
    #[error(transparent)]
    Persistence(#[from] PersistenceError),
    #[error("FlowUnknown: no agent registered for flow '{flow}'")]
    FlowUnknown { flow: String },
    #[error("ValidationError: {message}")]
    Validation { message: String },
    #[error("ReasoningError: {message}")]
    Reasoning { message: String },
    #[error("InternalError: {message}")]
    Internal { message: String },
}

impl AgentError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Stable kind name used in error results and dead letters.
    pub fn kind_name(&self) -> &'static str {
        match self {
            Self::Persistence(inner) => inner.kind_name(),
            Self::FlowUnknown { .. } => "FlowUnknown",
            Self::Validation { .. } => "ValidationError",
            Self::Reasoning { .. } => "ReasoningError",
            Self::Internal { .. } => "InternalError",
        }
    }

    /// Retry classification consulted by the worker runtime.
    pub fn retry(&self) -> RetryPolicy {
        match self {
            Self::Persistence(PersistenceError::Adapter {
                kind: AdapterErrorKind::Transient,
                ..
            }) => RetryPolicy::UpToLimit,
            Self::Persistence(_) => RetryPolicy::Never,
            Self::FlowUnknown { .. } => RetryPolicy::Never,
            Self::Validation { .. } => RetryPolicy::Never,
            Self::Reasoning { .. } => RetryPolicy::Never,
            Self::Internal { .. } => RetryPolicy::Once,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transient(op: &str) -> PersistenceError {
        PersistenceError::Adapter {
            op: op.into(),
            table: "leads".into(),
            kind: AdapterErrorKind::Transient,
            message: "connection reset".into(),
            source: None,
        }
    }

    #[test]
    fn kind_names_are_stable() {
        assert_eq!(
            PersistenceError::table_not_allowed("audit", "write").kind_name(),
            "TableNotAllowedError"
        );
        assert_eq!(
            PersistenceError::permission("read-only facade").kind_name(),
            "PersistencePermissionError"
        );
        assert_eq!(transient("query").kind_name(), "AdapterError");
    }

    #[test]
    fn retry_classification() {
        assert_eq!(
            AgentError::from(transient("write")).retry(),
            RetryPolicy::UpToLimit
        );
        assert_eq!(
            AgentError::from(PersistenceError::table_not_allowed("clients", "write")).retry(),
            RetryPolicy::Never
        );
        assert_eq!(
            AgentError::FlowUnknown {
                flow: "nope".into()
            }
            .retry(),
            RetryPolicy::Never
        );
        assert_eq!(AgentError::internal("panic-ish").retry(), RetryPolicy::Once);
    }

    #[test]
    fn table_not_allowed_names_table_and_operation() {
        let err = PersistenceError::table_not_allowed("clients", "write");
        let text = err.to_string();
        assert!(text.contains("TableNotAllowedError"));
        assert!(text.contains("clients"));
        assert!(text.contains("write"));
    }
}
