//! Per-agent concurrency guard.
//!
//! A map of agent name → bounded permit pool. `submit` waits for a permit,
//! runs the work, and releases on every exit path (the permit is an owned
//! guard dropped with the future). Agents without an entry run unbounded.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;

use tokio::sync::Semaphore;

/// Bounded-concurrency dispatcher. Cheap to clone; built once at startup.
#[derive(Clone, Default)]
pub struct Dispatcher {
    limits: Arc<BTreeMap<String, Arc<Semaphore>>>,
}

impl Dispatcher {
    /// Build from per-agent permit counts. A zero count is treated as one
    /// permit: a silently dead agent is never the intent.
    pub fn new(limits: impl IntoIterator<Item = (String, usize)>) -> Self {
        let limits = limits
            .into_iter()
            .map(|(name, permits)| (name, Arc::new(Semaphore::new(permits.max(1)))))
            .collect();
        Self {
            limits: Arc::new(limits),
        }
    }

    /// Run `work` for `agent`, waiting for a permit when the agent is
    /// bounded.
    pub async fn submit<F, T>(&self, agent: &str, work: F) -> T
    where
        F: Future<Output = T>,
    {
        let _permit = match self.limits.get(agent) {
            Some(semaphore) => Some(
                semaphore
                    .clone()
                    .acquire_owned()
                    .await
                    .expect("dispatcher semaphore is never closed"),
            ),
            None => None,
        };
        work.await
    }

    /// Currently available permits, `None` for unbounded agents.
    pub fn available_permits(&self, agent: &str) -> Option<usize> {
        self.limits.get(agent).map(|s| s.available_permits())
    }
}
