//! Provider chain: the default provider followed by its configured fallbacks.
//!
//! Each entry carries its own timeout and, optionally, the model to ask for
//! on that provider. A failed or timed-out entry hands the request to the
//! next one. The agent strategy only sees an error (the last entry's) once
//! every entry has failed; the chain logs what happened at each hop.
//!
//! [`FallbackProvider::budget`] is the worst-case wall time of one call
//! through the chain. Callers that bound agent calls must allow at least
//! that much, or the secondaries are never reached.

use async_trait::async_trait;
use distillery_core::error::ProviderError;
use distillery_core::provider::{Provider, ProviderRequest, ProviderResponse};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

pub struct FallbackProvider {
    name: String,
    chain: Vec<ChainEntry>,
}

struct ChainEntry {
    provider: Arc<dyn Provider>,
    timeout: Duration,
    model: Option<String>,
}

impl ChainEntry {
    /// The request as this entry should see it.
    fn request(&self, request: &ProviderRequest) -> ProviderRequest {
        let mut request = request.clone();
        if let Some(model) = &self.model {
            request.model = model.clone();
        }
        request
    }
}

impl FallbackProvider {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            chain: Vec::new(),
        }
    }

    /// Append a provider that is asked for the caller's model.
    pub fn add(self, provider: Arc<dyn Provider>, timeout: Duration) -> Self {
        self.add_with_model(provider, timeout, None)
    }

    /// Append a provider, replacing the requested model with `model` when set.
    pub fn add_with_model(
        mut self,
        provider: Arc<dyn Provider>,
        timeout: Duration,
        model: Option<String>,
    ) -> Self {
        self.chain.push(ChainEntry {
            provider,
            timeout,
            model,
        });
        self
    }

    pub fn len(&self) -> usize {
        self.chain.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chain.is_empty()
    }

    /// Provider names in attempt order.
    pub fn names(&self) -> Vec<&str> {
        self.chain.iter().map(|e| e.provider.name()).collect()
    }

    /// Sum of every entry's timeout.
    pub fn budget(&self) -> Duration {
        self.chain.iter().map(|e| e.timeout).sum()
    }
}

#[async_trait]
impl Provider for FallbackProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn complete(
        &self,
        request: ProviderRequest,
    ) -> std::result::Result<ProviderResponse, ProviderError> {
        let mut failures: Vec<String> = Vec::with_capacity(self.chain.len());
        let mut last_error = None;

        for (attempt, entry) in self.chain.iter().enumerate() {
            let provider = entry.provider.name();
            let request = entry.request(&request);
            debug!(provider, model = %request.model, attempt = attempt + 1, "Calling provider");

            let error = match tokio::time::timeout(entry.timeout, entry.provider.complete(request))
                .await
            {
                Ok(Ok(response)) => {
                    if attempt > 0 {
                        info!(provider, skipped = ?failures, "Answered by fallback provider");
                    }
                    return Ok(response);
                }
                Ok(Err(e)) => e,
                Err(_) => ProviderError::Timeout(format!(
                    "'{provider}' gave no answer within {}ms",
                    entry.timeout.as_millis()
                )),
            };

            warn!(provider, error = %error, "Provider failed, moving down the chain");
            failures.push(format!("{provider}: {error}"));
            last_error = Some(error);
        }

        match last_error {
            Some(error) => {
                warn!(chain = %self.name, failures = ?failures, "Every provider in the chain failed");
                Err(error)
            }
            None => Err(ProviderError::NotConfigured(format!(
                "provider chain '{}' has no entries",
                self.name
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use distillery_core::provider::PromptMessage;
    use std::sync::Mutex;

    /// Answers with its own name and records the model it was asked for.
    struct EchoProvider {
        name: String,
        models: Mutex<Vec<String>>,
    }

    impl EchoProvider {
        fn new(name: &str) -> Self {
            Self {
                name: name.into(),
                models: Mutex::new(Vec::new()),
            }
        }

        fn calls(&self) -> usize {
            self.models.lock().unwrap().len()
        }

        fn models(&self) -> Vec<String> {
            self.models.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Provider for EchoProvider {
        fn name(&self) -> &str {
            &self.name
        }

        async fn complete(
            &self,
            request: ProviderRequest,
        ) -> std::result::Result<ProviderResponse, ProviderError> {
            self.models.lock().unwrap().push(request.model.clone());
            Ok(ProviderResponse {
                content: format!("{{\"from\": \"{}\"}}", self.name),
                usage: None,
                model: request.model,
            })
        }
    }

    struct BrokenProvider {
        name: String,
        error: ProviderError,
    }

    #[async_trait]
    impl Provider for BrokenProvider {
        fn name(&self) -> &str {
            &self.name
        }

        async fn complete(
            &self,
            _request: ProviderRequest,
        ) -> std::result::Result<ProviderResponse, ProviderError> {
            Err(self.error.clone())
        }
    }

    fn broken(name: &str, error: ProviderError) -> Arc<BrokenProvider> {
        Arc::new(BrokenProvider {
            name: name.into(),
            error,
        })
    }

    struct HangingProvider;

    #[async_trait]
    impl Provider for HangingProvider {
        fn name(&self) -> &str {
            "hanging"
        }

        async fn complete(
            &self,
            _request: ProviderRequest,
        ) -> std::result::Result<ProviderResponse, ProviderError> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Err(ProviderError::Timeout("unreachable".into()))
        }
    }

    fn extraction_request() -> ProviderRequest {
        ProviderRequest {
            model: "gpt-4o-mini".into(),
            messages: vec![PromptMessage::user("Extract facts as JSON.")],
            temperature: 0.0,
            max_tokens: None,
            json_output: true,
        }
    }

    const FIVE_SECS: Duration = Duration::from_secs(5);

    #[tokio::test]
    async fn healthy_primary_short_circuits() {
        let primary = Arc::new(EchoProvider::new("primary"));
        let secondary = Arc::new(EchoProvider::new("secondary"));
        let chain = FallbackProvider::new("chain")
            .add(primary.clone(), FIVE_SECS)
            .add(secondary.clone(), FIVE_SECS);

        let response = chain.complete(extraction_request()).await.unwrap();
        assert!(response.content.contains("primary"));
        assert_eq!(primary.calls(), 1);
        assert_eq!(secondary.calls(), 0);
    }

    #[tokio::test]
    async fn api_error_moves_down_the_chain() {
        let secondary = Arc::new(EchoProvider::new("secondary"));
        let chain = FallbackProvider::new("chain")
            .add(
                broken(
                    "primary",
                    ProviderError::ApiError {
                        status_code: 500,
                        message: "Internal Server Error".into(),
                    },
                ),
                FIVE_SECS,
            )
            .add(secondary.clone(), FIVE_SECS);

        let response = chain.complete(extraction_request()).await.unwrap();
        assert!(response.content.contains("secondary"));
        assert_eq!(secondary.calls(), 1);
    }

    #[tokio::test]
    async fn exhausted_chain_returns_last_error() {
        let chain = FallbackProvider::new("chain")
            .add(broken("primary", ProviderError::Network("conn refused".into())), FIVE_SECS)
            .add(
                broken("secondary", ProviderError::AuthenticationFailed("bad key".into())),
                FIVE_SECS,
            );

        match chain.complete(extraction_request()).await.unwrap_err() {
            ProviderError::AuthenticationFailed(_) => {}
            other => panic!("Expected AuthenticationFailed, got: {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn hanging_primary_times_out_into_secondary() {
        let secondary = Arc::new(EchoProvider::new("secondary"));
        let chain = FallbackProvider::new("chain")
            .add(Arc::new(HangingProvider), Duration::from_secs(30))
            .add(secondary.clone(), Duration::from_secs(30));

        let response = chain.complete(extraction_request()).await.unwrap();
        assert!(response.content.contains("secondary"));
        assert_eq!(chain.budget(), Duration::from_secs(60));
    }

    #[tokio::test]
    async fn entry_model_overrides_requested_model() {
        let primary = Arc::new(EchoProvider::new("openai"));
        let secondary = Arc::new(EchoProvider::new("groq"));
        let chain = FallbackProvider::new("chain")
            .add(
                broken("down", ProviderError::RateLimited { retry_after_secs: 5 }),
                FIVE_SECS,
            )
            .add_with_model(secondary.clone(), FIVE_SECS, Some("llama-3.1-8b-instant".into()))
            .add(primary.clone(), FIVE_SECS);

        let response = chain.complete(extraction_request()).await.unwrap();
        assert_eq!(response.model, "llama-3.1-8b-instant");
        assert_eq!(secondary.models(), vec!["llama-3.1-8b-instant"]);
        assert_eq!(primary.calls(), 0);
    }

    #[tokio::test]
    async fn empty_chain_is_not_configured() {
        let chain = FallbackProvider::new("empty");
        assert!(chain.is_empty());
        assert_eq!(chain.budget(), Duration::ZERO);
        assert!(matches!(
            chain.complete(extraction_request()).await,
            Err(ProviderError::NotConfigured(_))
        ));
    }

    #[test]
    fn attempt_order_is_insertion_order() {
        let chain = FallbackProvider::new("chain")
            .add(Arc::new(EchoProvider::new("a")), FIVE_SECS)
            .add(Arc::new(EchoProvider::new("b")), Duration::from_secs(7));

        assert_eq!(chain.len(), 2);
        assert_eq!(chain.names(), vec!["a", "b"]);
        assert_eq!(chain.budget(), Duration::from_secs(12));
    }
}
