//! Run metrics, recomputed from committed state.

use crate::context::PlannerContext;
use crate::records::{CriticRecord, RetrievalRecord};
use distillery_core::event::{Event, EventKind};
use distillery_core::memory::{Fact, Snapshot};
use distillery_core::message::Message;
use distillery_core::metrics::{self, Metrics};
use distillery_core::run::Run;
use distillery_core::token;

/// Compute metrics for a run.
///
/// `injected_tokens` is rebuilt from the references in the latest retrieval
/// event, so it always equals the planner context token count of that step.
/// Before the first step it is the objective alone.
pub fn compute(
    run: &Run,
    messages: &[Message],
    facts: &[Fact],
    events: &[Event],
    latest_snapshot: Option<&Snapshot>,
) -> distillery_core::Result<Metrics> {
    let objective_tokens = token::estimate_tokens(&run.objective);
    let baseline_tokens =
        objective_tokens + messages.iter().map(|m| m.token_estimate).sum::<usize>();

    let injected_tokens = match latest_payload::<RetrievalRecord>(events, EventKind::Retrieval)? {
        Some(record) => injected_from(run, messages, facts, &record),
        None => objective_tokens,
    };

    let critic_verdict =
        latest_payload::<CriticRecord>(events, EventKind::Critic)?.map(|r| r.verdict);

    Ok(Metrics {
        baseline_tokens,
        injected_tokens,
        reduction_pct: metrics::reduction_pct(baseline_tokens, injected_tokens),
        critic_verdict,
        last_snapshot_path: latest_snapshot.and_then(|s| s.path.clone()),
    })
}

fn injected_from(run: &Run, messages: &[Message], facts: &[Fact], record: &RetrievalRecord) -> usize {
    let selected: Vec<Fact> = record
        .selected_fact_ids
        .iter()
        .filter_map(|id| facts.iter().find(|f| f.id == *id).cloned())
        .collect();
    let end = record.stm_end.min(messages.len());
    let start = record.stm_start.min(end);
    let user_message = messages
        .get(record.user_message_index)
        .map(|m| m.content.as_str())
        .unwrap_or_default();

    PlannerContext::assemble(&run.objective, &selected, &messages[start..end], user_message)
        .token_count()
}

fn latest_payload<T: serde::de::DeserializeOwned>(
    events: &[Event],
    kind: EventKind,
) -> distillery_core::Result<Option<T>> {
    events
        .iter()
        .rev()
        .find(|e| e.kind == kind)
        .map(|e| serde_json::from_value(e.payload.clone()))
        .transpose()
        .map_err(Into::into)
}

#[cfg(test)]
mod tests {
    use super::*;
    use distillery_core::run::RunConfig;

    #[test]
    fn empty_run_injects_only_the_objective() {
        let run = Run::new("Design a compression engine", RunConfig::default()).unwrap();
        let m = compute(&run, &[], &[], &[], None).unwrap();
        let expected = token::estimate_tokens("Design a compression engine");
        assert_eq!(m.baseline_tokens, expected);
        assert_eq!(m.injected_tokens, expected);
        assert_eq!(m.reduction_pct, 0.0);
        assert!(m.critic_verdict.is_none());
        assert!(m.last_snapshot_path.is_none());
    }
}
