//! taskfabric — streams-based agent work fabric.
//!
//! A task-routing substrate: flow triggers fan out onto durable work
//! streams, workers claim them through consumer groups with at-most-once
//! effective delivery, and every boundary speaks the canonical envelope
//! (metadata + records + provenance). Database access is mediated by an
//! allowlist-enforcing persistence service; retrieval paths read through a
//! facade that cannot write.
//!
//! The crate is designed to be embedded: it carries no web server, no
//! storage schema, and no LLM provider; reasoning providers implement the
//! [`llm::ReasoningProvider`] trait (see the `taskfabric-providers` crate).

pub mod agents;
pub mod config;
pub mod dispatcher;
pub mod envelope;
pub mod errors;
pub mod llm;
pub mod monitoring;
pub mod persistence;
pub mod registry;
pub mod runtime;
pub mod stream;

// Re-export the main types at the crate level.

// agents
pub use agents::{RetrievalAgent, RetrievalRequest, WriteAgent, WriteOp, WriteTask};

// config
pub use config::{
    FabricConfig, PersistSettings, RetrievalSettings, StreamSettings, WorkerSettings, ALL_TABLES,
    GOVERNANCE_TABLES,
};

// dispatcher
pub use dispatcher::Dispatcher;

// envelope
pub use envelope::{
    row_hash, CacheStatus, Envelope, EnvelopeStatus, FallbackKind, Metadata, MetadataExtra,
    Provenance, Record, ReformulationAttempt, Row, Summary,
};

// errors
pub use errors::{AdapterErrorKind, AgentError, PersistenceError, RetryPolicy, StreamError};

// llm
pub use llm::{ReasoningError, ReasoningProvider, ReasoningRequest, ReasoningResponse};

// persistence
pub use persistence::{
    read_only_service, Capabilities, FilterOp, FilterSet, InMemoryAdapter, PersistenceAdapter,
    PersistenceService, QueryOptions, RangeOp, ReadOnlyFacade, RestAdapter, RestAdapterConfig,
};

// registry
pub use registry::{Registry, RegistryBuilder, TaskAgent};

// runtime
pub use runtime::{GroupHealth, Ingress, IngressError, WorkerHandle, WorkerRuntime};

// stream
pub use stream::messages::{DeadLetter, ResultMessage, ResultStatus, TaskMessage, TaskMeta};
pub use stream::{
    DomainStreams, GroupStart, InMemoryStreamStore, PendingStats, RedisStreamStore, StreamClient,
    StreamEntry, StreamStore,
};
