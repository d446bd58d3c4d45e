//! Scripted mock reasoner for tests and benchmarks.

use std::collections::VecDeque;

use async_trait::async_trait;
use parking_lot::Mutex;

use taskfabric::{ReasoningError, ReasoningProvider, ReasoningRequest, ReasoningResponse};

/// Deterministic [`ReasoningProvider`] returning scripted responses in
/// order, then repeating the last one. Records every prompt it sees.
pub struct MockReasoner {
    responses: Mutex<VecDeque<String>>,
    last: Mutex<Option<String>>,
    prompts: Mutex<Vec<String>>,
}

impl MockReasoner {
    pub fn new(responses: impl IntoIterator<Item = String>) -> Self {
        Self {
            responses: Mutex::new(responses.into_iter().collect()),
            last: Mutex::new(None),
            prompts: Mutex::new(Vec::new()),
        }
    }

    /// Single fixed response for every call.
    pub fn always(response: impl Into<String>) -> Self {
        Self::new([response.into()])
    }

    /// Prompts received so far, in call order.
    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().clone()
    }

    pub fn call_count(&self) -> usize {
        self.prompts.lock().len()
    }
}

#[async_trait]
impl ReasoningProvider for MockReasoner {
    async fn complete(
        &self,
        request: ReasoningRequest,
    ) -> Result<ReasoningResponse, ReasoningError> {
        self.prompts.lock().push(request.prompt);
        let next = {
            let mut queue = self.responses.lock();
            match queue.pop_front() {
                Some(response) => {
                    *self.last.lock() = Some(response.clone());
                    Some(response)
                }
                None => self.last.lock().clone(),
            }
        };
        next.map(|text| ReasoningResponse {
            text,
            model: Some("mock".into()),
        })
        .ok_or_else(|| ReasoningError::Malformed {
            message: "mock reasoner has no scripted responses".into(),
        })
    }

    fn name(&self) -> &str {
        "mock"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn scripted_responses_in_order_then_repeat() {
        let mock = MockReasoner::new(["one".to_string(), "two".to_string()]);
        let a = mock
            .complete(ReasoningRequest::deterministic("p1"))
            .await
            .unwrap();
        let b = mock
            .complete(ReasoningRequest::deterministic("p2"))
            .await
            .unwrap();
        let c = mock
            .complete(ReasoningRequest::deterministic("p3"))
            .await
            .unwrap();
        assert_eq!(a.text, "one");
        assert_eq!(b.text, "two");
        assert_eq!(c.text, "two");
        assert_eq!(mock.prompts(), vec!["p1", "p2", "p3"]);
        assert_eq!(mock.call_count(), 3);
    }

    #[tokio::test]
    async fn empty_script_is_an_error() {
        let mock = MockReasoner::new(Vec::<String>::new());
        let err = mock
            .complete(ReasoningRequest::deterministic("p"))
            .await
            .unwrap_err();
        assert!(matches!(err, ReasoningError::Malformed { .. }));
    }
}
