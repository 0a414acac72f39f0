//! Shared test helpers for agent and orchestrator tests.

use distillery_core::error::ProviderError;
use distillery_core::provider::{Provider, ProviderRequest, ProviderResponse, Usage};
use std::sync::Mutex;
use std::time::Duration;

/// A mock provider that returns a sequence of scripted responses.
///
/// Each call to `complete` returns the next response in the queue.
/// Panics if more calls are made than responses provided.
pub struct SequentialMockProvider {
    responses: Mutex<Vec<ProviderResponse>>,
    call_count: Mutex<usize>,
    last_request: Mutex<Option<ProviderRequest>>,
}

impl SequentialMockProvider {
    pub fn new(responses: Vec<ProviderResponse>) -> Self {
        Self {
            responses: Mutex::new(responses),
            call_count: Mutex::new(0),
            last_request: Mutex::new(None),
        }
    }

    /// Create a provider that returns a single text response.
    #[allow(dead_code)]
    pub fn single_text(text: &str) -> Self {
        Self::new(vec![text_response(text)])
    }

    #[allow(dead_code)]
    pub fn call_count(&self) -> usize {
        *self.call_count.lock().unwrap()
    }

    pub fn last_request(&self) -> Option<ProviderRequest> {
        self.last_request.lock().unwrap().clone()
    }
}

#[async_trait::async_trait]
impl Provider for SequentialMockProvider {
    fn name(&self) -> &str {
        "sequential_mock"
    }

    async fn complete(&self, request: ProviderRequest) -> Result<ProviderResponse, ProviderError> {
        let mut count = self.call_count.lock().unwrap();
        let responses = self.responses.lock().unwrap();

        if *count >= responses.len() {
            panic!(
                "SequentialMockProvider: no more responses (call #{}, have {})",
                *count,
                responses.len()
            );
        }

        let response = responses[*count].clone();
        *count += 1;
        *self.last_request.lock().unwrap() = Some(request);
        Ok(response)
    }
}

/// A provider that always fails with a network error.
pub struct FailingProvider {
    name: String,
    call_count: Mutex<usize>,
}

impl FailingProvider {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.into(),
            call_count: Mutex::new(0),
        }
    }

    #[allow(dead_code)]
    pub fn call_count(&self) -> usize {
        *self.call_count.lock().unwrap()
    }
}

#[async_trait::async_trait]
impl Provider for FailingProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn complete(&self, _request: ProviderRequest) -> Result<ProviderResponse, ProviderError> {
        *self.call_count.lock().unwrap() += 1;
        Err(ProviderError::Network("connection refused".into()))
    }
}

/// A provider that answers only after a delay.
#[allow(dead_code)]
pub struct SlowProvider {
    delay: Duration,
}

#[allow(dead_code)]
impl SlowProvider {
    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }
}

#[async_trait::async_trait]
impl Provider for SlowProvider {
    fn name(&self) -> &str {
        "slow"
    }

    async fn complete(&self, _request: ProviderRequest) -> Result<ProviderResponse, ProviderError> {
        tokio::time::sleep(self.delay).await;
        Ok(text_response("{}"))
    }
}

/// Create a simple text response.
pub fn text_response(text: &str) -> ProviderResponse {
    ProviderResponse {
        content: text.into(),
        usage: Some(Usage {
            prompt_tokens: 10,
            completion_tokens: 5,
            total_tokens: 15,
        }),
        model: "mock-model".into(),
    }
}
