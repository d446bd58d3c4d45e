//! Reasoning provider interface for the retrieval fallback path.
//!
//! The fabric defines its own LLM abstraction; concrete providers live in
//! the `taskfabric-providers` crate. Agents receive an
//! `Option<Arc<dyn ReasoningProvider>>` at construction; absence means
//! structured-only behavior, never a runtime probe.

use async_trait::async_trait;
use thiserror::Error;

/// A single completion request.
#[derive(Debug, Clone)]
pub struct ReasoningRequest {
    /// Optional system instruction prepended to the conversation.
    pub system: Option<String>,
    pub prompt: String,
    pub temperature: f32,
    pub max_tokens: Option<u32>,
}

impl ReasoningRequest {
    /// A deterministic (temperature 0) request, the fabric's default shape.
    pub fn deterministic(prompt: impl Into<String>) -> Self {
        Self {
            system: None,
            prompt: prompt.into(),
            temperature: 0.0,
            max_tokens: None,
        }
    }

    pub fn with_system(mut self, system: impl Into<String>) -> Self {
        self.system = Some(system.into());
        self
    }
}

/// A completion response.
#[derive(Debug, Clone)]
pub struct ReasoningResponse {
    pub text: String,
    /// Model the provider actually used, when reported.
    pub model: Option<String>,
}

/// Errors from a reasoning provider.
#[derive(Debug, Error)]
pub enum ReasoningError {
    #[error("provider transport error: {message}")]
    Transport { message: String },
    #[error("provider returned an unusable response: {message}")]
    Malformed { message: String },
}

/// LLM completion interface consumed by the retrieval agent.
#[async_trait]
pub trait ReasoningProvider: Send + Sync {
    async fn complete(&self, request: ReasoningRequest)
        -> Result<ReasoningResponse, ReasoningError>;

    /// Provider name for diagnostics.
    fn name(&self) -> &str;
}
