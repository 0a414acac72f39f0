//! Retrieval agent: pick the minimal sufficient memory for one step.
//!
//! The deterministic strategy scores each active fact by how many distinct
//! query terms (new message plus objective) appear among the fact's own
//! terms. Zero-overlap facts are never selected.

use distillery_core::memory::{Fact, FactId};
use distillery_core::message::Message;
use distillery_core::token;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet};

const MIN_TERM_LEN: usize = 3;

const STOPWORDS: &[&str] = &[
    "about", "after", "all", "also", "and", "any", "are", "but", "can", "could", "did", "does",
    "each", "for", "from", "had", "has", "have", "her", "his", "how", "into", "its", "just",
    "let", "make", "more", "most", "must", "not", "now", "our", "out", "own", "should", "some",
    "such", "than", "that", "the", "their", "them", "then", "there", "these", "they", "this",
    "those", "too", "use", "very", "was", "were", "what", "when", "where", "which", "while",
    "who", "why", "will", "with", "would", "you", "your",
];

pub struct RetrievalInput<'a> {
    pub objective: &'a str,
    /// Active facts only, ordered by id.
    pub active_facts: &'a [Fact],
    /// The last `stm_max_messages` messages preceding the new message.
    pub stm_window: &'a [Message],
    pub user_message: &'a str,
    pub top_k: usize,
    pub token_budget: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrievalResult {
    pub selected_fact_ids: Vec<FactId>,
    pub stm_slice: Vec<Message>,
    pub notes: String,
}

impl RetrievalResult {
    /// The selected facts, in selection order.
    pub fn selected_facts<'f>(&self, active: &'f [Fact]) -> Vec<&'f Fact> {
        self.selected_fact_ids
            .iter()
            .filter_map(|id| active.iter().find(|f| f.id == *id))
            .collect()
    }
}

/// Lowercase alphanumeric runs of at least three characters, minus stopwords.
pub fn terms(text: &str) -> BTreeSet<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| t.chars().count() >= MIN_TERM_LEN && !STOPWORDS.contains(t))
        .map(str::to_string)
        .collect()
}

pub fn select_deterministic(input: &RetrievalInput<'_>) -> RetrievalResult {
    let mut query = terms(input.user_message);
    query.extend(terms(input.objective));

    let mut scored: Vec<(usize, &Fact)> = input
        .active_facts
        .iter()
        .filter(|f| f.is_active())
        .map(|f| {
            let score = terms(&f.render()).intersection(&query).count();
            (score, f)
        })
        .filter(|(score, _)| *score > 0)
        .collect();

    scored.sort_by(|(sa, fa), (sb, fb)| {
        sb.cmp(sa)
            .then(fb.version.cmp(&fa.version))
            .then(fa.id.cmp(&fb.id))
    });

    let ranked: Vec<FactId> = scored.iter().map(|(_, f)| f.id).collect();
    let selected = fit_budget(&ranked, input);

    RetrievalResult {
        notes: format!(
            "selected {} of {} active facts by term overlap",
            selected.len(),
            input.active_facts.len()
        ),
        selected_fact_ids: selected,
        stm_slice: input.stm_window.to_vec(),
    }
}

/// Restrict a proposed selection to known active facts, dropping duplicates,
/// then apply the same top-k and token budget the deterministic path uses.
pub fn clamp_selection(proposed: &[FactId], input: &RetrievalInput<'_>) -> Vec<FactId> {
    let mut seen = HashSet::new();
    let known: Vec<FactId> = proposed
        .iter()
        .copied()
        .filter(|id| {
            input
                .active_facts
                .iter()
                .any(|f| f.id == *id && f.is_active())
        })
        .filter(|id| seen.insert(*id))
        .collect();
    fit_budget(&known, input)
}

/// Greedy: walk the ranking, stop at top-k, skip facts that would overflow
/// the budget.
fn fit_budget(ranked: &[FactId], input: &RetrievalInput<'_>) -> Vec<FactId> {
    let mut selected = Vec::new();
    let mut spent = 0;

    for id in ranked {
        if selected.len() >= input.top_k {
            break;
        }
        let Some(fact) = input.active_facts.iter().find(|f| f.id == *id) else {
            continue;
        };
        let cost = token::estimate_tokens(&fact.render());
        if spent + cost > input.token_budget {
            continue;
        }
        spent += cost;
        selected.push(*id);
    }

    selected
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use distillery_core::memory::{AgentKind, FactStatus, Provenance};
    use distillery_core::run::RunId;

    fn fact(id: u64, version: u64, key: &str, value: &str) -> Fact {
        Fact {
            id: FactId(id),
            run_id: RunId::from("run_ret"),
            version,
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

    fn input<'a>(facts: &'a [Fact], message: &'a str) -> RetrievalInput<'a> {
        RetrievalInput {
            objective: "Build an engine",
            active_facts: facts,
            stm_window: &[],
            user_message: message,
            top_k: 8,
            token_budget: 512,
        }
    }

    #[test]
    fn terms_drop_short_words_and_stopwords() {
        let t = terms("The UI is Minimal-web; and the DB!");
        assert!(t.contains("minimal"));
        assert!(t.contains("web"));
        assert!(!t.contains("the"));
        assert!(!t.contains("ui"));
        assert!(!t.contains("and"));
    }

    #[test]
    fn cold_start_selects_nothing() {
        let result = select_deterministic(&input(&[], "hello"));
        assert!(result.selected_fact_ids.is_empty());
        assert!(result.stm_slice.is_empty());
    }

    #[test]
    fn zero_overlap_is_not_selected() {
        let facts = vec![fact(1, 1, "database", "sqlite")];
        let result = select_deterministic(&input(&facts, "Describe the frontend layout"));
        assert!(result.selected_fact_ids.is_empty());
    }

    #[test]
    fn ranks_by_overlap_then_version_then_id() {
        let facts = vec![
            fact(1, 1, "memory_tiers", "three"),
            fact(2, 2, "memory_schema", "tiers with supersession"),
            fact(3, 2, "memory_budget", "small"),
            fact(4, 1, "memory_owner", "team"),
        ];
        let result =
            select_deterministic(&input(&facts, "How do memory tiers handle supersession?"));
        // fact 2 matches memory+tiers+supersession, fact 1 memory+tiers,
        // facts 3 and 4 only memory: version 2 beats version 1.
        assert_eq!(
            result.selected_fact_ids,
            vec![FactId(2), FactId(1), FactId(3), FactId(4)]
        );
    }

    #[test]
    fn respects_top_k_and_budget() {
        let facts = vec![
            fact(1, 1, "alpha_widget", "x".repeat(200).as_str()),
            fact(2, 1, "beta_widget", "small"),
            fact(3, 1, "gamma_widget", "small"),
        ];
        let mut inp = input(&facts, "widget");
        inp.token_budget = 20;
        let result = select_deterministic(&inp);
        assert_eq!(result.selected_fact_ids, vec![FactId(2), FactId(3)]);

        inp.token_budget = 512;
        inp.top_k = 1;
        assert_eq!(select_deterministic(&inp).selected_fact_ids.len(), 1);
    }

    #[test]
    fn clamp_discards_unknown_and_duplicate_ids() {
        let facts = vec![fact(1, 1, "ui", "web"), fact(2, 1, "cli", "later")];
        let clamped = clamp_selection(
            &[FactId(9), FactId(2), FactId(2), FactId(1)],
            &input(&facts, "anything"),
        );
        assert_eq!(clamped, vec![FactId(2), FactId(1)]);
    }
}
