//! Critic agent: advisory consistency check of the planner output.
//!
//! The verdict never blocks a step. It is recorded in the `critic` event
//! and surfaced through the run metrics.

use crate::compression::referenced_keys;
use distillery_core::memory::{Fact, FactId};
use distillery_core::metrics::Verdict;
use serde::{Deserialize, Serialize};

pub struct CriticInput<'a> {
    pub objective: &'a str,
    /// Assistant message and plan steps, joined.
    pub planner_output: &'a str,
    pub user_message: &'a str,
    pub active_facts: &'a [Fact],
    pub selected_fact_ids: &'a [FactId],
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CriticReport {
    pub verdict: Verdict,
    pub reasons: Vec<String>,
}

/// Deterministic judgement by phrase matching.
///
/// `inconsistent` takes precedence over `missing_memory`.
pub fn judge(input: &CriticInput<'_>) -> CriticReport {
    let output = input.planner_output.to_lowercase();

    let inconsistent: Vec<String> = input
        .active_facts
        .iter()
        .filter(|f| f.is_active() && !input.selected_fact_ids.contains(&f.id))
        .filter(|f| {
            let phrase = f.key.replace('_', " ");
            contains_phrase(&output, &phrase) && !output.contains(&f.value.to_lowercase())
        })
        .map(|f| format!("output mentions '{}' without its remembered value", f.key))
        .collect();

    if !inconsistent.is_empty() {
        return CriticReport {
            verdict: Verdict::Inconsistent,
            reasons: inconsistent,
        };
    }

    let missing: Vec<String> = referenced_keys(input.user_message)
        .into_iter()
        .filter(|key| !input.active_facts.iter().any(|f| f.is_active() && &f.key == key))
        .map(|key| format!("message references '{key}' which is not in memory"))
        .collect();

    if !missing.is_empty() {
        return CriticReport {
            verdict: Verdict::MissingMemory,
            reasons: missing,
        };
    }

    CriticReport {
        verdict: Verdict::Ok,
        reasons: Vec::new(),
    }
}

/// Whole-word, case-sensitive containment. `haystack` is expected lowercase.
fn contains_phrase(haystack: &str, phrase: &str) -> bool {
    if phrase.is_empty() {
        return false;
    }
    haystack.match_indices(phrase).any(|(start, _)| {
        let before = haystack[..start].chars().next_back();
        let after = haystack[start + phrase.len()..].chars().next();
        !before.is_some_and(char::is_alphanumeric) && !after.is_some_and(char::is_alphanumeric)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use distillery_core::memory::{AgentKind, FactStatus, Provenance};
    use distillery_core::run::RunId;

    fn fact(id: u64, key: &str, value: &str) -> Fact {
        Fact {
            id: FactId(id),
            run_id: RunId::from("run_critic"),
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

    fn input<'a>(output: &'a str, message: &'a str, facts: &'a [Fact], selected: &'a [FactId]) -> CriticInput<'a> {
        CriticInput {
            objective: "objective",
            planner_output: output,
            user_message: message,
            active_facts: facts,
            selected_fact_ids: selected,
        }
    }

    #[test]
    fn ok_when_nothing_is_off() {
        let facts = vec![fact(1, "ui", "minimal web")];
        let report = judge(&input("Here is the plan.", "Plan it.", &facts, &[FactId(1)]));
        assert_eq!(report.verdict, Verdict::Ok);
        assert!(report.reasons.is_empty());
    }

    #[test]
    fn unselected_key_without_value_is_inconsistent() {
        let facts = vec![fact(1, "compression_threshold", "2400")];
        let report = judge(&input(
            "We will tune the compression threshold later.",
            "Plan it.",
            &facts,
            &[],
        ));
        assert_eq!(report.verdict, Verdict::Inconsistent);
    }

    #[test]
    fn stating_the_value_is_consistent() {
        let facts = vec![fact(1, "compression_threshold", "2400")];
        let report = judge(&input(
            "The compression threshold stays at 2400.",
            "Plan it.",
            &facts,
            &[],
        ));
        assert_eq!(report.verdict, Verdict::Ok);
    }

    #[test]
    fn key_match_is_whole_word() {
        let facts = vec![fact(1, "ui", "minimal web")];
        let report = judge(&input("Build a suitable backend.", "Plan it.", &facts, &[]));
        assert_eq!(report.verdict, Verdict::Ok);
    }

    #[test]
    fn reference_to_unknown_key_is_missing_memory() {
        let report = judge(&input(
            "Noted.",
            "Change request: compression threshold is now 1200",
            &[],
            &[],
        ));
        assert_eq!(report.verdict, Verdict::MissingMemory);
        assert!(report.reasons[0].contains("compression_threshold"));
    }

    #[test]
    fn inconsistent_takes_precedence() {
        let facts = vec![fact(1, "deployment_target", "edge")];
        let report = judge(&input(
            "The deployment target needs review.",
            "What is the budget?",
            &facts,
            &[],
        ));
        assert_eq!(report.verdict, Verdict::Inconsistent);
    }
}
