//! LLM-assisted agent strategy.
//!
//! Every call runs at temperature 0 and asks for a strict JSON object. Any
//! reply that does not parse into the expected shape is a
//! [`ExternalCallError::MalformedOutput`], which sends the call down the
//! deterministic fallback path.

use crate::compression::{Candidate, CompressionInput};
use crate::context::PlannerContext;
use crate::critic::{CriticInput, CriticReport};
use crate::planner::PlannerOutput;
use crate::retrieval::{self, RetrievalInput, RetrievalResult};
use crate::strategy::AgentStrategy;
use async_trait::async_trait;
use distillery_core::error::ExternalCallError;
use distillery_core::memory::{AgentKind, DropReason, FactId};
use distillery_core::metrics::Verdict;
use distillery_core::provider::{PromptMessage, Provider, ProviderRequest};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::json;
use std::sync::Arc;
use tracing::debug;

type CallResult<T> = std::result::Result<T, ExternalCallError>;

const RETRIEVAL_PROMPT: &str = "You are the retrieval agent of a context compression engine. \
Select the minimal set of memory facts needed to answer the new message. \
Return STRICT JSON only: {\"selected_fact_ids\": [<fact id>, ...], \"notes\": \"<short reason>\"}.";

const PLANNER_PROMPT: &str = "You are the planner agent. Answer the final user message using only \
the objective, memory and recent messages provided. \
Return STRICT JSON only: {\"assistant_message\": \"<reply>\", \"plan_steps\": [\"<step>\", ...]}.";

const CRITIC_PROMPT: &str = "You are the critic agent. Check the planner output against memory. \
Use \"inconsistent\" if it contradicts or ignores a remembered fact, \"missing_memory\" if the user \
refers to something memory does not hold, else \"ok\". \
Return STRICT JSON only: {\"verdict\": \"ok|missing_memory|inconsistent\", \"reasons\": [\"...\"]}.";

const EXTRACTION_PROMPT: &str = "You are the compression agent. Extract durable facts, decisions \
and constraints from the user messages. Use short snake_case keys. Report keys the user retracts. \
Report everything else you ignore with a reason (redundant, low_salience, stale, unparseable). \
Return STRICT JSON only: {\"facts\": [{\"key\": \"..\", \"value\": \"..\", \"step_index\": 0}], \
\"retractions\": [{\"key\": \"..\", \"step_index\": 0}], \
\"dropped\": [{\"text\": \"..\", \"reason\": \"..\", \"step_index\": 0}]}.";

/// Agent strategy backed by a [`Provider`].
pub struct LlmStrategy {
    provider: Arc<dyn Provider>,
    model: String,
    max_tokens: Option<u32>,
}

impl LlmStrategy {
    pub fn new(provider: Arc<dyn Provider>, model: impl Into<String>) -> Self {
        Self {
            provider,
            model: model.into(),
            max_tokens: None,
        }
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    async fn ask<T: DeserializeOwned>(
        &self,
        agent: AgentKind,
        messages: Vec<PromptMessage>,
    ) -> CallResult<T> {
        let request = ProviderRequest {
            model: self.model.clone(),
            messages,
            temperature: 0.0,
            max_tokens: self.max_tokens,
            json_output: true,
        };

        let response = self.provider.complete(request).await?;
        debug!(
            agent = %agent,
            provider = self.provider.name(),
            bytes = response.content.len(),
            "Structured reply received"
        );
        parse_structured(agent, &response.content)
    }
}

/// Parse a JSON reply, tolerating prose around a single object.
pub fn parse_structured<T: DeserializeOwned>(agent: AgentKind, text: &str) -> CallResult<T> {
    let malformed = |reason: String| ExternalCallError::MalformedOutput {
        agent: agent.as_str().to_string(),
        reason,
    };

    match serde_json::from_str::<T>(text.trim()) {
        Ok(value) => Ok(value),
        Err(first) => {
            let (Some(start), Some(end)) = (text.find('{'), text.rfind('}')) else {
                return Err(malformed(first.to_string()));
            };
            if end <= start {
                return Err(malformed(first.to_string()));
            }
            serde_json::from_str::<T>(&text[start..=end]).map_err(|e| malformed(e.to_string()))
        }
    }
}

// ── Reply shapes ──────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum IdValue {
    Number(u64),
    Text(String),
}

impl IdValue {
    fn as_fact_id(&self) -> Option<FactId> {
        match self {
            Self::Number(n) => Some(FactId(*n)),
            Self::Text(s) => s.trim().parse().ok().map(FactId),
        }
    }
}

#[derive(Debug, Deserialize)]
struct RetrievalReply {
    selected_fact_ids: Vec<IdValue>,
    #[serde(default)]
    notes: String,
}

#[derive(Debug, Deserialize)]
struct CriticReply {
    verdict: String,
    #[serde(default)]
    reasons: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
struct ExtractionReply {
    #[serde(default)]
    facts: Vec<ExtractedFact>,
    #[serde(default)]
    retractions: Vec<ExtractedRetraction>,
    #[serde(default)]
    dropped: Vec<ExtractedDrop>,
}

#[derive(Debug, Deserialize)]
struct ExtractedFact {
    key: String,
    value: String,
    step_index: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct ExtractedRetraction {
    key: String,
    step_index: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct ExtractedDrop {
    text: String,
    #[serde(default)]
    reason: String,
    step_index: Option<u64>,
}

impl ExtractionReply {
    /// Facts and retractions in step order (stable), then the dropped items.
    fn into_candidates(self, default_step: u64) -> Vec<Candidate> {
        let unparseable = |text: String, step| Candidate::Unusable {
            text,
            reason: DropReason::Unparseable,
            step_index: Some(step),
        };

        let mut ordered: Vec<(u64, Candidate)> = Vec::new();
        for f in self.facts {
            let step = f.step_index.unwrap_or(default_step);
            let source = format!("{}: {}", f.key, f.value);
            let candidate = Candidate::assert(&f.key, &f.value, step, source.clone())
                .unwrap_or_else(|| unparseable(source, step));
            ordered.push((step, candidate));
        }
        for r in self.retractions {
            let step = r.step_index.unwrap_or(default_step);
            let source = format!("retract {}", r.key);
            let candidate = Candidate::retract(&r.key, step, source.clone())
                .unwrap_or_else(|| unparseable(source, step));
            ordered.push((step, candidate));
        }
        ordered.sort_by_key(|(step, _)| *step);

        let mut candidates: Vec<Candidate> = ordered.into_iter().map(|(_, c)| c).collect();
        candidates.extend(self.dropped.into_iter().map(|d| Candidate::Unusable {
            text: d.text,
            reason: DropReason::parse(&d.reason).unwrap_or(DropReason::Unparseable),
            step_index: d.step_index,
        }));
        candidates
    }
}

#[async_trait]
impl AgentStrategy for LlmStrategy {
    fn name(&self) -> &str {
        "llm"
    }

    async fn retrieve(&self, input: &RetrievalInput<'_>) -> CallResult<RetrievalResult> {
        let facts: Vec<_> = input
            .active_facts
            .iter()
            .map(|f| json!({"id": f.id, "key": f.key, "value": f.value, "version": f.version}))
            .collect();
        let recent: Vec<String> = input.stm_window.iter().map(|m| m.render()).collect();
        let payload = json!({
            "objective": input.objective,
            "new_message": input.user_message,
            "facts": facts,
            "recent_messages": recent,
            "max_facts": input.top_k,
        });

        let reply: RetrievalReply = self
            .ask(
                AgentKind::Retrieval,
                vec![
                    PromptMessage::system(RETRIEVAL_PROMPT),
                    PromptMessage::user(payload.to_string()),
                ],
            )
            .await?;

        let proposed: Vec<FactId> = reply
            .selected_fact_ids
            .iter()
            .filter_map(IdValue::as_fact_id)
            .collect();

        Ok(RetrievalResult {
            selected_fact_ids: retrieval::clamp_selection(&proposed, input),
            stm_slice: input.stm_window.to_vec(),
            notes: reply.notes,
        })
    }

    async fn plan(&self, ctx: &PlannerContext) -> CallResult<PlannerOutput> {
        let mut messages = vec![PromptMessage::system(PLANNER_PROMPT)];
        messages.extend(ctx.to_prompt_messages());

        let reply: PlannerOutput = self.ask(AgentKind::Planner, messages).await?;
        if reply.assistant_message.trim().is_empty() {
            return Err(ExternalCallError::MalformedOutput {
                agent: AgentKind::Planner.as_str().to_string(),
                reason: "empty assistant_message".into(),
            });
        }
        Ok(reply)
    }

    async fn critique(&self, input: &CriticInput<'_>) -> CallResult<CriticReport> {
        let memory: Vec<_> = input
            .active_facts
            .iter()
            .map(|f| {
                json!({
                    "key": f.key,
                    "value": f.value,
                    "selected": input.selected_fact_ids.contains(&f.id),
                })
            })
            .collect();
        let payload = json!({
            "objective": input.objective,
            "user_message": input.user_message,
            "planner_output": input.planner_output,
            "memory": memory,
        });

        let reply: CriticReply = self
            .ask(
                AgentKind::Critic,
                vec![
                    PromptMessage::system(CRITIC_PROMPT),
                    PromptMessage::user(payload.to_string()),
                ],
            )
            .await?;

        let verdict = Verdict::parse(reply.verdict.trim()).ok_or_else(|| {
            ExternalCallError::MalformedOutput {
                agent: AgentKind::Critic.as_str().to_string(),
                reason: format!("unknown verdict '{}'", reply.verdict),
            }
        })?;

        Ok(CriticReport {
            verdict,
            reasons: reply.reasons,
        })
    }

    async fn extract(&self, input: &CompressionInput<'_>) -> CallResult<Vec<Candidate>> {
        let memory: Vec<_> = input
            .active_facts
            .iter()
            .map(|f| json!({"key": f.key, "value": f.value}))
            .collect();
        let messages: Vec<_> = input
            .messages
            .iter()
            .map(|m| json!({"step_index": m.step_index, "role": m.role, "content": m.content}))
            .collect();
        let payload = json!({
            "objective": input.objective,
            "active_facts": memory,
            "messages": messages,
        });

        let reply: ExtractionReply = self
            .ask(
                AgentKind::Compression,
                vec![
                    PromptMessage::system(EXTRACTION_PROMPT),
                    PromptMessage::user(payload.to_string()),
                ],
            )
            .await?;

        let default_step = input.messages.iter().map(|m| m.step_index).max().unwrap_or(0);
        Ok(reply.into_candidates(default_step))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::*;
    use chrono::Utc;
    use distillery_core::memory::{Fact, FactStatus, Provenance};
    use distillery_core::message::Message;
    use distillery_core::run::RunId;

    fn fact(id: u64, key: &str, value: &str) -> Fact {
        Fact {
            id: FactId(id),
            run_id: RunId::from("run_llm"),
            version: 1,
            key: key.into(),
            value: value.into(),
            status: FactStatus::Active,
            supersedes: None,
            provenance: Provenance {
                step_index: 1,
                agent: AgentKind::Compression,
            },
            created_at: Utc::now(),
        }
    }

    fn strategy(responses: Vec<&str>) -> (Arc<SequentialMockProvider>, LlmStrategy) {
        let provider = Arc::new(SequentialMockProvider::new(
            responses.into_iter().map(text_response).collect(),
        ));
        (provider.clone(), LlmStrategy::new(provider, "mock-model"))
    }

    #[test]
    fn parse_tolerates_surrounding_prose() {
        let reply: CriticReply =
            parse_structured(AgentKind::Critic, "Sure! {\"verdict\": \"ok\"} Done.").unwrap();
        assert_eq!(reply.verdict, "ok");
    }

    #[test]
    fn parse_rejects_non_json() {
        let err = parse_structured::<CriticReply>(AgentKind::Critic, "no json here").unwrap_err();
        assert!(matches!(err, ExternalCallError::MalformedOutput { .. }));
    }

    #[tokio::test]
    async fn retrieval_clamps_to_known_active_ids() {
        let facts = vec![fact(1, "ui", "web"), fact(2, "cli", "later")];
        let (provider, llm) =
            strategy(vec![r#"{"selected_fact_ids": [2, "1", 99, "x"], "notes": "both"}"#]);
        let input = RetrievalInput {
            objective: "o",
            active_facts: &facts,
            stm_window: &[],
            user_message: "m",
            top_k: 8,
            token_budget: 512,
        };
        let result = llm.retrieve(&input).await.unwrap();
        assert_eq!(result.selected_fact_ids, vec![FactId(2), FactId(1)]);
        assert_eq!(result.notes, "both");

        let request = provider.last_request().unwrap();
        assert!(request.json_output);
        assert_eq!(request.temperature, 0.0);
    }

    #[tokio::test]
    async fn planner_rejects_empty_message() {
        let (_, llm) = strategy(vec![r#"{"assistant_message": "  "}"#]);
        let ctx = PlannerContext::assemble("o", &[], &[], "m");
        assert!(matches!(
            llm.plan(&ctx).await,
            Err(ExternalCallError::MalformedOutput { .. })
        ));
    }

    #[tokio::test]
    async fn critic_rejects_unknown_verdict() {
        let (_, llm) = strategy(vec![r#"{"verdict": "great"}"#]);
        let input = CriticInput {
            objective: "o",
            planner_output: "p",
            user_message: "m",
            active_facts: &[],
            selected_fact_ids: &[],
        };
        assert!(llm.critique(&input).await.is_err());
    }

    #[tokio::test]
    async fn extraction_orders_by_step_then_appends_drops() {
        let (_, llm) = strategy(vec![
            r#"{
                "facts": [{"key": "UI", "value": "web only", "step_index": 4},
                          {"key": "db", "value": "sqlite", "step_index": 2}],
                "retractions": [{"key": "cli", "step_index": 3}],
                "dropped": [{"text": "hello", "reason": "low_salience", "step_index": 1}]
            }"#,
        ]);
        let messages = vec![Message::user(RunId::from("run_llm"), 4, "whatever")];
        let input = CompressionInput {
            objective: "o",
            active_facts: &[],
            messages: &messages,
        };
        let candidates = llm.extract(&input).await.unwrap();
        assert_eq!(candidates.len(), 4);
        assert!(matches!(&candidates[0], Candidate::Assert { key, .. } if key == "db"));
        assert!(matches!(&candidates[1], Candidate::Retract { key, .. } if key == "cli"));
        assert!(matches!(&candidates[2], Candidate::Assert { key, .. } if key == "ui"));
        assert!(matches!(
            &candidates[3],
            Candidate::Unusable { reason: DropReason::LowSalience, .. }
        ));
    }

    #[tokio::test]
    async fn provider_error_surfaces_as_external_call_error() {
        let llm = LlmStrategy::new(Arc::new(FailingProvider::new("down")), "m");
        let ctx = PlannerContext::assemble("o", &[], &[], "m");
        assert!(matches!(
            llm.plan(&ctx).await,
            Err(ExternalCallError::Provider(_))
        ));
    }
}
