//! Flow registry: name → (domain, agent).
//!
//! Registration happens once at startup through the builder; the resulting
//! map is immutable, so lookups are lock-free for the life of the process.
//! Agents never see the registry; the worker runtime and ingress resolve
//! through it and hand agents nothing but the task.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::envelope::Envelope;
use crate::errors::AgentError;
use crate::stream::messages::TaskMessage;

/// A task handler bound to one or more flows.
///
/// In-domain soft failures (empty retrieval, suppressed fallback) are
/// successful envelopes; only policy violations, backend failures, and
/// programmer errors come back as `Err`.
#[async_trait]
pub trait TaskAgent: Send + Sync {
    /// Stable agent name, used for dispatcher permits and diagnostics.
    fn name(&self) -> &str;

    async fn handle(&self, task: &TaskMessage) -> Result<Envelope, AgentError>;
}

#[derive(Clone)]
struct FlowBinding {
    domain: String,
    agent: Arc<dyn TaskAgent>,
}

/// Immutable flow → binding map.
#[derive(Clone, Default)]
pub struct Registry {
    flows: BTreeMap<String, FlowBinding>,
}

impl Registry {
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder {
            flows: BTreeMap::new(),
        }
    }

    /// Agent registered for a flow.
    pub fn resolve(&self, flow: &str) -> Result<Arc<dyn TaskAgent>, AgentError> {
        self.flows
            .get(flow)
            .map(|b| b.agent.clone())
            .ok_or_else(|| AgentError::FlowUnknown { flow: flow.into() })
    }

    /// Stream domain a flow's tasks are routed to.
    pub fn domain_of(&self, flow: &str) -> Result<&str, AgentError> {
        self.flows
            .get(flow)
            .map(|b| b.domain.as_str())
            .ok_or_else(|| AgentError::FlowUnknown { flow: flow.into() })
    }

    /// Registered flow names, sorted.
    pub fn flows(&self) -> Vec<&str> {
        self.flows.keys().map(String::as_str).collect()
    }

    /// Distinct domains across all registered flows, sorted.
    pub fn domains(&self) -> Vec<&str> {
        let mut domains: Vec<&str> = self.flows.values().map(|b| b.domain.as_str()).collect();
        domains.sort();
        domains.dedup();
        domains
    }
}

/// Builder collecting registrations at startup.
pub struct RegistryBuilder {
    flows: BTreeMap<String, FlowBinding>,
}

impl RegistryBuilder {
    /// Register `agent` for `flow`, routed through `domain`. Replaces any
    /// existing registration for the same flow.
    pub fn register(
        mut self,
        flow: impl Into<String>,
        domain: impl Into<String>,
        agent: Arc<dyn TaskAgent>,
    ) -> Self {
        self.flows.insert(
            flow.into(),
            FlowBinding {
                domain: domain.into(),
                agent,
            },
        );
        self
    }

    pub fn build(self) -> Registry {
        Registry { flows: self.flows }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::MetadataExtra;
    use serde_json::json;

    struct EchoAgent;

    #[async_trait]
    impl TaskAgent for EchoAgent {
        fn name(&self) -> &str {
            "echo"
        }
        async fn handle(&self, task: &TaskMessage) -> Result<Envelope, AgentError> {
            Ok(Envelope::from_records(
                "echo",
                vec![],
                Some(&task.task_id),
                MetadataExtra::default(),
            ))
        }
    }

    #[tokio::test]
    async fn resolve_and_dispatch() {
        let registry = Registry::builder()
            .register("rag.query", "rag", Arc::new(EchoAgent))
            .build();

        let agent = registry.resolve("rag.query").unwrap();
        let task = TaskMessage::new("rag.query", json!({}));
        let envelope = agent.handle(&task).await.unwrap();
        assert_eq!(envelope.metadata.task_id.as_deref(), Some(task.task_id.as_str()));
        assert_eq!(registry.domain_of("rag.query").unwrap(), "rag");
    }

    #[test]
    fn unknown_flow_is_a_typed_error() {
        let registry = Registry::builder().build();
        let err = match registry.resolve("nope") {
            Err(e) => e,
            Ok(_) => panic!("expected resolve to fail"),
        };
        assert_eq!(err.kind_name(), "FlowUnknown");
        assert!(registry.domain_of("nope").is_err());
    }

    #[test]
    fn domains_are_deduplicated() {
        let registry = Registry::builder()
            .register("rag.query", "rag", Arc::new(EchoAgent))
            .register("rag.context", "rag", Arc::new(EchoAgent))
            .register("persist.write", "persist", Arc::new(EchoAgent))
            .build();
        assert_eq!(registry.domains(), vec!["persist", "rag"]);
        assert_eq!(
            registry.flows(),
            vec!["persist.write", "rag.context", "rag.query"]
        );
    }

    #[test]
    fn later_registration_wins() {
        struct Other;
        #[async_trait]
        impl TaskAgent for Other {
            fn name(&self) -> &str {
                "other"
            }
            async fn handle(&self, _task: &TaskMessage) -> Result<Envelope, AgentError> {
                Ok(Envelope::error("other", None, "unused"))
            }
        }

        let registry = Registry::builder()
            .register("f", "rag", Arc::new(EchoAgent))
            .register("f", "persist", Arc::new(Other))
            .build();
        assert_eq!(registry.resolve("f").unwrap().name(), "other");
        assert_eq!(registry.domain_of("f").unwrap(), "persist");
    }
}
