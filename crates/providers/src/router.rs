//! Provider router: selects the correct LLM provider based on config.
//!
//! Handles provider creation and assembles the ordered fallback chain used by
//! `llm_assisted` runs.

use crate::fallback::FallbackProvider;
use crate::openai_compat::OpenAiCompatProvider;
use distillery_core::provider::Provider;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

struct Registered {
    provider: Arc<dyn Provider>,
    /// Model to request from this provider instead of the run-wide default.
    model: Option<String>,
}

/// Routes LLM requests to the correct provider.
pub struct ProviderRouter {
    providers: HashMap<String, Registered>,
    default_provider: String,
    fallback: Vec<String>,
    timeout: Duration,
}

impl ProviderRouter {
    /// Create a new router with a default provider.
    pub fn new(default_provider: impl Into<String>) -> Self {
        Self {
            providers: HashMap::new(),
            default_provider: default_provider.into(),
            fallback: Vec::new(),
            timeout: Duration::from_secs(30),
        }
    }

    /// Providers tried after the default, in order, each bounded by `timeout`.
    pub fn with_fallback(mut self, names: Vec<String>, timeout: Duration) -> Self {
        self.fallback = names;
        self.timeout = timeout;
        self
    }

    /// Register a provider, optionally pinned to a model of its own.
    pub fn register(
        &mut self,
        name: impl Into<String>,
        provider: Arc<dyn Provider>,
        model: Option<String>,
    ) {
        self.providers
            .insert(name.into(), Registered { provider, model });
    }

    /// Get the default provider.
    pub fn default(&self) -> Option<Arc<dyn Provider>> {
        self.get(&self.default_provider)
    }

    /// Get a specific provider by name.
    pub fn get(&self, name: &str) -> Option<Arc<dyn Provider>> {
        self.providers.get(name).map(|r| r.provider.clone())
    }

    /// The default provider followed by every registered fallback. Unknown
    /// fallback names are skipped. The chain's [`FallbackProvider::budget`]
    /// grows with each entry.
    pub fn chain(&self) -> Option<Arc<FallbackProvider>> {
        let primary = self.providers.get(&self.default_provider)?;
        let mut chain = FallbackProvider::new("chain").add_with_model(
            primary.provider.clone(),
            self.timeout,
            primary.model.clone(),
        );

        for name in &self.fallback {
            if name == &self.default_provider {
                continue;
            }
            match self.providers.get(name) {
                Some(entry) => {
                    chain = chain.add_with_model(
                        entry.provider.clone(),
                        self.timeout,
                        entry.model.clone(),
                    );
                }
                None => warn!(provider = %name, "Fallback provider is not configured, skipping"),
            }
        }

        debug!(
            providers = ?chain.names(),
            budget_secs = chain.budget().as_secs(),
            "Provider chain assembled"
        );
        Some(Arc::new(chain))
    }
}

/// Build providers from configuration.
pub fn build_from_config(config: &distillery_config::AppConfig) -> ProviderRouter {
    let mut router = ProviderRouter::new(&config.default_provider).with_fallback(
        config.fallback.clone(),
        Duration::from_secs(config.llm_timeout_secs),
    );

    for (name, provider_config) in &config.providers {
        let api_key = provider_config
            .api_key
            .clone()
            .or_else(|| config.api_key.clone())
            .unwrap_or_default();

        let base_url = provider_config
            .api_url
            .clone()
            .unwrap_or_else(|| default_base_url(name));

        router.register(
            name.clone(),
            Arc::new(OpenAiCompatProvider::new(name, &base_url, &api_key)),
            provider_config.default_model.clone(),
        );
    }

    // Ensure the default provider exists (even if not explicitly configured)
    if router.get(&config.default_provider).is_none() {
        let api_key = config.api_key.clone().unwrap_or_default();
        let base_url = default_base_url(&config.default_provider);
        router.register(
            config.default_provider.clone(),
            Arc::new(OpenAiCompatProvider::new(
                &config.default_provider,
                &base_url,
                &api_key,
            )),
            None,
        );
    }

    router
}

/// Get the default base URL for well-known providers.
fn default_base_url(provider_name: &str) -> String {
    match provider_name {
        "openrouter" => "https://openrouter.ai/api/v1".into(),
        "openai" => "https://api.openai.com/v1".into(),
        "ollama" => "http://localhost:11434/v1".into(),
        "deepseek" => "https://api.deepseek.com/v1".into(),
        "groq" => "https://api.groq.com/openai/v1".into(),
        "together" => "https://api.together.xyz/v1".into(),
        "vllm" => "http://localhost:8000/v1".into(),
        "llamacpp" | "llama.cpp" => "http://localhost:8080/v1".into(),
        _ => format!("https://{provider_name}.api.example.com/v1"),
    }
}
