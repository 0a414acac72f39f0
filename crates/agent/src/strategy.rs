//! Agent strategies and the single fallback helper around them.
//!
//! A run's agents go through one [`AgentStrategy`]. Strict-deterministic runs
//! use [`DeterministicStrategy`] directly. LLM-assisted runs use an
//! LLM-backed strategy, and [`AgentRunner`] retries any failed call (error,
//! timeout, malformed output) once with the deterministic rules, reporting
//! the result as degraded.

use crate::compression::{self, Candidate, CompressionInput};
use crate::context::PlannerContext;
use crate::critic::{self, CriticInput, CriticReport};
use crate::planner::{self, PlannerOutput};
use crate::retrieval::{self, RetrievalInput, RetrievalResult};
use async_trait::async_trait;
use distillery_core::error::ExternalCallError;
use distillery_core::memory::AgentKind;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Name reported for the rule-based strategy.
pub const DETERMINISTIC: &str = "deterministic";

type CallResult<T> = std::result::Result<T, ExternalCallError>;

/// How the four agents of a step compute their results.
#[async_trait]
pub trait AgentStrategy: Send + Sync {
    /// Strategy name recorded in event payloads.
    fn name(&self) -> &str;

    async fn retrieve(&self, input: &RetrievalInput<'_>) -> CallResult<RetrievalResult>;

    async fn plan(&self, ctx: &PlannerContext) -> CallResult<PlannerOutput>;

    async fn critique(&self, input: &CriticInput<'_>) -> CallResult<CriticReport>;

    async fn extract(&self, input: &CompressionInput<'_>) -> CallResult<Vec<Candidate>>;
}

/// The rule-based strategy. Never fails.
#[derive(Debug, Clone, Copy, Default)]
pub struct DeterministicStrategy;

#[async_trait]
impl AgentStrategy for DeterministicStrategy {
    fn name(&self) -> &str {
        DETERMINISTIC
    }

    async fn retrieve(&self, input: &RetrievalInput<'_>) -> CallResult<RetrievalResult> {
        Ok(retrieval::select_deterministic(input))
    }

    async fn plan(&self, ctx: &PlannerContext) -> CallResult<PlannerOutput> {
        Ok(planner::compose(ctx))
    }

    async fn critique(&self, input: &CriticInput<'_>) -> CallResult<CriticReport> {
        Ok(critic::judge(input))
    }

    async fn extract(&self, input: &CompressionInput<'_>) -> CallResult<Vec<Candidate>> {
        Ok(compression::extract_deterministic(input))
    }
}

/// The value an agent call produced and how it was produced.
#[derive(Debug, Clone)]
pub struct Attempt<T> {
    pub value: T,
    pub strategy: String,
    /// The primary strategy failed and the deterministic rules answered.
    pub degraded: bool,
}

/// Runs agent calls through a primary strategy, bounded by a timeout, with
/// the deterministic rules as the fallback path.
pub struct AgentRunner {
    primary: Arc<dyn AgentStrategy>,
    timeout: Duration,
}

impl AgentRunner {
    pub fn new(primary: Arc<dyn AgentStrategy>, timeout: Duration) -> Self {
        Self { primary, timeout }
    }

    /// A runner that never leaves the deterministic rules.
    pub fn deterministic() -> Self {
        Self::new(Arc::new(DeterministicStrategy), Duration::from_secs(30))
    }

    pub fn strategy_name(&self) -> &str {
        self.primary.name()
    }

    pub async fn retrieve(&self, input: &RetrievalInput<'_>) -> Attempt<RetrievalResult> {
        self.settle(
            AgentKind::Retrieval,
            |s| async move { s.retrieve(input).await },
            || retrieval::select_deterministic(input),
        )
        .await
    }

    pub async fn plan(&self, ctx: &PlannerContext) -> Attempt<PlannerOutput> {
        self.settle(
            AgentKind::Planner,
            |s| async move { s.plan(ctx).await },
            || planner::compose(ctx),
        )
        .await
    }

    pub async fn critique(&self, input: &CriticInput<'_>) -> Attempt<CriticReport> {
        self.settle(
            AgentKind::Critic,
            |s| async move { s.critique(input).await },
            || critic::judge(input),
        )
        .await
    }

    pub async fn extract(&self, input: &CompressionInput<'_>) -> Attempt<Vec<Candidate>> {
        self.settle(
            AgentKind::Compression,
            |s| async move { s.extract(input).await },
            || compression::extract_deterministic(input),
        )
        .await
    }

    async fn settle<T, F, Fut>(
        &self,
        agent: AgentKind,
        call: F,
        fallback: impl FnOnce() -> T,
    ) -> Attempt<T>
    where
        F: FnOnce(Arc<dyn AgentStrategy>) -> Fut,
        Fut: Future<Output = CallResult<T>>,
    {
        match self.bounded(agent, call(self.primary.clone())).await {
            Ok(value) => {
                debug!(agent = %agent, strategy = self.primary.name(), "Agent call completed");
                Attempt {
                    value,
                    strategy: self.primary.name().to_string(),
                    degraded: false,
                }
            }
            Err(e) => {
                warn!(
                    agent = %agent,
                    strategy = self.primary.name(),
                    error = %e,
                    degraded = true,
                    "Agent call failed, falling back to deterministic rules"
                );
                Attempt {
                    value: fallback(),
                    strategy: DETERMINISTIC.to_string(),
                    degraded: true,
                }
            }
        }
    }

    async fn bounded<T>(
        &self,
        agent: AgentKind,
        fut: impl Future<Output = CallResult<T>>,
    ) -> CallResult<T> {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(ExternalCallError::Timeout {
                agent: agent.as_str().to_string(),
                timeout_secs: self.timeout.as_secs(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use distillery_core::memory::{Fact, FactId};

    /// A strategy whose calls always fail or hang.
    struct BrokenStrategy {
        hang: bool,
    }

    #[async_trait]
    impl AgentStrategy for BrokenStrategy {
        fn name(&self) -> &str {
            "broken"
        }

        async fn retrieve(&self, _input: &RetrievalInput<'_>) -> CallResult<RetrievalResult> {
            if self.hang {
                tokio::time::sleep(Duration::from_secs(3600)).await;
            }
            Err(ExternalCallError::MalformedOutput {
                agent: "retrieval".into(),
                reason: "not json".into(),
            })
        }

        async fn plan(&self, _ctx: &PlannerContext) -> CallResult<PlannerOutput> {
            Err(ExternalCallError::MalformedOutput {
                agent: "planner".into(),
                reason: "empty".into(),
            })
        }

        async fn critique(&self, _input: &CriticInput<'_>) -> CallResult<CriticReport> {
            unreachable!("not exercised")
        }

        async fn extract(&self, _input: &CompressionInput<'_>) -> CallResult<Vec<Candidate>> {
            unreachable!("not exercised")
        }
    }

    fn retrieval_input<'a>(facts: &'a [Fact]) -> RetrievalInput<'a> {
        RetrievalInput {
            objective: "objective",
            active_facts: facts,
            stm_window: &[],
            user_message: "hello",
            top_k: 8,
            token_budget: 512,
        }
    }

    #[tokio::test]
    async fn deterministic_runner_is_never_degraded() {
        let runner = AgentRunner::deterministic();
        let attempt = runner.retrieve(&retrieval_input(&[])).await;
        assert!(!attempt.degraded);
        assert_eq!(attempt.strategy, DETERMINISTIC);
        assert!(attempt.value.selected_fact_ids.is_empty());
    }

    #[tokio::test]
    async fn failure_falls_back_and_marks_degraded() {
        let runner = AgentRunner::new(Arc::new(BrokenStrategy { hang: false }), Duration::from_secs(5));
        let attempt = runner.retrieve(&retrieval_input(&[])).await;
        assert!(attempt.degraded);
        assert_eq!(attempt.strategy, DETERMINISTIC);
        assert_eq!(attempt.value.selected_fact_ids, Vec::<FactId>::new());

        let ctx = PlannerContext::assemble("objective", &[], &[], "hello");
        let plan = runner.plan(&ctx).await;
        assert!(plan.degraded);
        assert!(plan.value.assistant_message.contains("hello"));
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_falls_back() {
        let runner = AgentRunner::new(Arc::new(BrokenStrategy { hang: true }), Duration::from_millis(50));
        let attempt = runner.retrieve(&retrieval_input(&[])).await;
        assert!(attempt.degraded);
    }
}
