//! Compression agent: distill recent messages into structured facts.
//!
//! Two phases:
//!
//! 1. **Extract** candidates from the STM since the last compression. The
//!    deterministic extractor reads user messages only, clause by clause.
//! 2. **Reconcile** candidates against the active facts: supersede changed
//!    values, deprecate retracted keys, drop everything else with a reason.
//!
//! Every candidate is accounted for exactly once:
//! `candidates == new_facts + deprecated + dropped`.

use chrono::Utc;
use distillery_core::memory::{
    AgentKind, DropReason, DroppedItem, Fact, FactId, FactStatus, Provenance, normalize_key,
};
use distillery_core::message::{Message, Role};
use distillery_core::run::{RunConfig, RunId};
use distillery_core::store::FactTransition;
use regex_lite::{Captures, Regex};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::LazyLock;

const MAX_KEY_WORDS: usize = 6;
const MAX_VALUE_CHARS: usize = 240;
const MIN_SALIENT_WORDS: usize = 4;

const PREFIXES: &[&str] = &[
    "change request:",
    "add a constraint:",
    "constraint:",
    "decision:",
    "note:",
    "fact:",
    "update:",
    "actually,",
    "now,",
    "also,",
];

const PRONOUNS: &[&str] = &["we", "i", "you", "it", "this", "that", "they", "there", "here"];

const QUESTION_WORDS: &[&str] = &[
    "what", "why", "how", "when", "where", "which", "who", "can", "could", "would", "does", "do",
    "will",
];

const LEAD_WORDS: &[&str] = &[
    "summarize", "create", "define", "design", "propose", "produce", "list", "add", "write",
    "explain", "describe", "make", "give", "show", "now", "finally", "please", "build",
];

// ── Clause patterns ───────────────────────────────────────────────────────

static RETRACT_LEADING: LazyLock<Option<Regex>> = LazyLock::new(|| {
    Regex::new(r"(?i)^(?:forget|drop|remove|discard|retract|ignore)\s+(?:about\s+)?(?P<key>.+)$")
        .ok()
});

static RETRACT_TRAILING: LazyLock<Option<Regex>> = LazyLock::new(|| {
    Regex::new(
        r"(?i)^(?P<key>.+?)\s+(?:no longer applies|no longer apply|is no longer relevant|is no longer needed|is dropped|is removed)$",
    )
    .ok()
});

static NUMERIC: LazyLock<Option<Regex>> = LazyLock::new(|| {
    Regex::new(
        r"(?i)^(?P<key>.+?)\s+(?:must|should|needs to|has to|will)\s+(?:be\s+)?(?P<value>(?:at least|at most|no more than|no less than|more than|less than|under|over|below|above)\s+\d+(?:\.\d+)?\s*%?.*)$",
    )
    .ok()
});

static UPDATE: LazyLock<Option<Regex>> = LazyLock::new(|| {
    Regex::new(
        r"(?i)^(?P<key>.+?)\s+(?:is now|are now|should now be|must now be|is changed to|has changed to|is updated to|becomes)\s+(?P<value>.+)$",
    )
    .ok()
});

static SET: LazyLock<Option<Regex>> = LazyLock::new(|| {
    Regex::new(r"(?i)^(?:set|change|update|switch)\s+(?P<key>.+?)\s+to\s+(?P<value>.+)$").ok()
});

static ASSIGN: LazyLock<Option<Regex>> = LazyLock::new(|| {
    Regex::new(
        r"(?i)^(?P<key>.+?)\s+(?:is|are|must be|should be|will be|shall be|=)\s+(?P<value>.+)$",
    )
    .ok()
});

static ASSIGN_COLON: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"^(?P<key>[^:]{1,60}):\s*(?P<value>.+)$").ok());

static ASKS_ABOUT: LazyLock<Option<Regex>> = LazyLock::new(|| {
    Regex::new(r"(?i)^(?:what|which)\s+(?:is|are|was|were)\s+(?P<key>.+?)\s*\??$").ok()
});

fn captures<'t>(pattern: &LazyLock<Option<Regex>>, text: &'t str) -> Option<Captures<'t>> {
    pattern.as_ref().and_then(|re| re.captures(text))
}

fn group<'t>(caps: &Captures<'t>, name: &str) -> &'t str {
    caps.name(name).map(|m| m.as_str()).unwrap_or_default()
}

// ── Types ─────────────────────────────────────────────────────────────────

/// One extracted item, before reconciliation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Candidate {
    Assert {
        key: String,
        value: String,
        step_index: u64,
        source: String,
    },
    Retract {
        key: String,
        step_index: u64,
        source: String,
    },
    Unusable {
        text: String,
        reason: DropReason,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        step_index: Option<u64>,
    },
}

impl Candidate {
    /// Build an assertion, normalizing the key and cleaning the value.
    /// Returns `None` if either is empty afterwards.
    pub fn assert(key: &str, value: &str, step_index: u64, source: impl Into<String>) -> Option<Self> {
        let key = normalize_key(key);
        let value = clean_value(value);
        if key.is_empty() || value.is_empty() || value.chars().count() > MAX_VALUE_CHARS {
            return None;
        }
        Some(Self::Assert {
            key,
            value,
            step_index,
            source: source.into(),
        })
    }

    pub fn retract(key: &str, step_index: u64, source: impl Into<String>) -> Option<Self> {
        let key = normalize_key(key);
        if key.is_empty() {
            return None;
        }
        Some(Self::Retract {
            key,
            step_index,
            source: source.into(),
        })
    }

    fn key(&self) -> Option<&str> {
        match self {
            Self::Assert { key, .. } | Self::Retract { key, .. } => Some(key),
            Self::Unusable { .. } => None,
        }
    }

    fn into_dropped(self, reason: DropReason) -> DroppedItem {
        match self {
            Self::Assert {
                source, step_index, ..
            }
            | Self::Retract {
                source, step_index, ..
            } => DroppedItem {
                text: source,
                reason,
                step_index: Some(step_index),
            },
            Self::Unusable {
                text, step_index, ..
            } => DroppedItem {
                text,
                reason,
                step_index,
            },
        }
    }
}

pub struct CompressionInput<'a> {
    pub objective: &'a str,
    pub active_facts: &'a [Fact],
    /// Messages since the last compression, in history order.
    pub messages: &'a [Message],
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompressionOutcome {
    pub candidates: usize,
    pub new_facts: Vec<Fact>,
    pub superseded_fact_ids: Vec<FactId>,
    pub deprecated_fact_ids: Vec<FactId>,
    pub dropped: Vec<DroppedItem>,
    pub transitions: Vec<FactTransition>,
    /// Active facts after applying this outcome, ordered by id.
    pub active_facts: Vec<Fact>,
}

/// Why a compression ran.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompressionTrigger {
    TokenThreshold,
    Interval,
    Forced,
}

impl CompressionTrigger {
    /// Decide whether a completed step should compress. The token threshold
    /// wins when both fire.
    pub fn evaluate(config: &RunConfig, step_counter: u64, injected_tokens: usize) -> Option<Self> {
        if injected_tokens >= config.compression_token_threshold {
            return Some(Self::TokenThreshold);
        }
        let interval = config.compression_interval_steps;
        if interval > 0 && step_counter % interval == 0 {
            return Some(Self::Interval);
        }
        None
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TokenThreshold => "token_threshold",
            Self::Interval => "interval",
            Self::Forced => "forced",
        }
    }
}

// ── Extraction ────────────────────────────────────────────────────────────

/// Deterministic extraction over user messages.
pub fn extract_deterministic(input: &CompressionInput<'_>) -> Vec<Candidate> {
    input
        .messages
        .iter()
        .filter(|m| m.role == Role::User)
        .flat_map(|m| {
            split_clauses(&m.content)
                .into_iter()
                .map(move |clause| classify(&clause, m.step_index))
        })
        .collect()
}

/// Split on newlines, semicolons, and sentence ends followed by whitespace.
pub fn split_clauses(text: &str) -> Vec<String> {
    let mut clauses = Vec::new();
    let mut current = String::new();
    let mut chars = text.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '\n' | ';' => flush(&mut clauses, &mut current),
            '.' | '!' | '?' if chars.peek().is_none_or(|n| n.is_whitespace()) => {
                current.push(c);
                flush(&mut clauses, &mut current);
            }
            _ => current.push(c),
        }
    }
    flush(&mut clauses, &mut current);
    clauses
}

fn flush(clauses: &mut Vec<String>, current: &mut String) {
    let clause = current.trim();
    if !clause.is_empty() {
        clauses.push(clause.to_string());
    }
    current.clear();
}

fn strip_prefixes(clause: &str) -> &str {
    let mut rest = clause.trim();
    loop {
        let before = rest;
        for prefix in PREFIXES {
            if rest
                .get(..prefix.len())
                .is_some_and(|head| head.eq_ignore_ascii_case(prefix))
            {
                rest = rest[prefix.len()..].trim_start();
            }
        }
        if rest == before {
            return rest;
        }
    }
}

fn clean_value(raw: &str) -> String {
    raw.trim()
        .trim_end_matches(['.', ',', ';', ':', '!', '?'])
        .trim()
        .trim_matches(['"', '\''])
        .trim()
        .to_string()
}

fn first_word(text: &str) -> String {
    text.split_whitespace()
        .next()
        .map(|w| {
            w.trim_matches(|c: char| !c.is_alphanumeric())
                .to_lowercase()
        })
        .unwrap_or_default()
}

fn is_question(clause: &str) -> bool {
    clause.trim_end().ends_with('?') || QUESTION_WORDS.contains(&first_word(clause).as_str())
}

fn usable_key(raw: &str) -> bool {
    let words = raw.split_whitespace().count();
    let lowered = raw.trim().to_lowercase();
    words > 0
        && words <= MAX_KEY_WORDS
        && !PRONOUNS.contains(&lowered.as_str())
        && !PRONOUNS.contains(&first_word(raw).as_str())
        && !LEAD_WORDS.contains(&first_word(raw).as_str())
}

fn classify(clause: &str, step_index: u64) -> Candidate {
    let unusable = |reason| Candidate::Unusable {
        text: clause.to_string(),
        reason,
        step_index: Some(step_index),
    };

    let body = strip_prefixes(clause);
    let body = body.trim_end_matches(['.', '!']).trim();

    if body.is_empty() {
        return unusable(DropReason::LowSalience);
    }
    if is_question(body) {
        return unusable(DropReason::LowSalience);
    }

    if let Some(candidate) = match_patterns(body, clause, step_index) {
        return candidate;
    }

    let words = body.split_whitespace().count();
    if words < MIN_SALIENT_WORDS || LEAD_WORDS.contains(&first_word(body).as_str()) {
        unusable(DropReason::LowSalience)
    } else {
        unusable(DropReason::Unparseable)
    }
}

fn match_patterns(body: &str, source: &str, step: u64) -> Option<Candidate> {
    for pattern in [&RETRACT_LEADING, &RETRACT_TRAILING] {
        if let Some(caps) = captures(pattern, body) {
            let key = group(&caps, "key");
            if usable_key(key) {
                return Candidate::retract(key, step, source);
            }
        }
    }

    if let Some(caps) = captures(&NUMERIC, body) {
        let key = group(&caps, "key");
        if usable_key(key) {
            if let Some(c) = Candidate::assert(key, group(&caps, "value"), step, source) {
                return Some(c);
            }
        }
    }

    for pattern in [&UPDATE, &SET, &ASSIGN, &ASSIGN_COLON] {
        if let Some(caps) = captures(pattern, body) {
            let key = group(&caps, "key");
            if !usable_key(key) {
                continue;
            }
            if let Some(c) = Candidate::assert(key, group(&caps, "value"), step, source) {
                return Some(c);
            }
        }
    }

    None
}

/// Keys a message updates, retracts, or asks about.
pub fn referenced_keys(text: &str) -> Vec<String> {
    let mut keys = Vec::new();

    for clause in split_clauses(text) {
        let body = strip_prefixes(&clause);
        let body = body.trim_end_matches(['.', '!']).trim();

        let key = captures(&ASKS_ABOUT, body)
            .map(|c| group(&c, "key").to_string())
            .filter(|k| usable_key(k))
            .or_else(|| {
                [&UPDATE, &SET, &RETRACT_LEADING, &RETRACT_TRAILING]
                    .into_iter()
                    .filter_map(|p| captures(p, body))
                    .map(|c| group(&c, "key").to_string())
                    .find(|k| usable_key(k))
            });

        if let Some(key) = key.map(|k| normalize_key(&k)) {
            if !key.is_empty() && !keys.contains(&key) {
                keys.push(key);
            }
        }
    }

    keys
}

// ── Reconciliation ────────────────────────────────────────────────────────

fn same_value(a: &str, b: &str) -> bool {
    a.trim().to_lowercase() == b.trim().to_lowercase()
}

/// Apply candidates to the active facts.
///
/// For each key only the last candidate counts; earlier ones are `stale`.
/// New facts get ids starting at `next_fact_id` and carry `version`.
pub fn reconcile(
    run_id: &RunId,
    active: &[Fact],
    candidates: Vec<Candidate>,
    next_fact_id: u64,
    version: u64,
) -> CompressionOutcome {
    let total = candidates.len();

    let mut last_for_key: HashMap<String, usize> = HashMap::new();
    for (i, c) in candidates.iter().enumerate() {
        if let Some(key) = c.key() {
            last_for_key.insert(key.to_string(), i);
        }
    }

    let mut current: HashMap<&str, &Fact> = active
        .iter()
        .filter(|f| f.is_active())
        .map(|f| (f.key.as_str(), f))
        .collect();

    let mut outcome = CompressionOutcome {
        candidates: total,
        new_facts: Vec::new(),
        superseded_fact_ids: Vec::new(),
        deprecated_fact_ids: Vec::new(),
        dropped: Vec::new(),
        transitions: Vec::new(),
        active_facts: Vec::new(),
    };
    let mut next_id = next_fact_id;
    let now = Utc::now();

    for (i, candidate) in candidates.into_iter().enumerate() {
        let is_last = candidate
            .key()
            .and_then(|k| last_for_key.get(k))
            .is_some_and(|last| *last == i);

        match candidate {
            Candidate::Unusable { reason, .. } => {
                let item = candidate.into_dropped(reason);
                outcome.dropped.push(item);
            }
            c if !is_last => outcome.dropped.push(c.into_dropped(DropReason::Stale)),
            Candidate::Assert {
                ref key,
                ref value,
                step_index,
                ..
            } => {
                let existing = current.get(key.as_str()).copied();
                if existing.is_some_and(|f| same_value(&f.value, value)) {
                    outcome.dropped.push(candidate.into_dropped(DropReason::Redundant));
                    continue;
                }

                let supersedes = existing.map(|f| f.id);
                if let Some(old) = supersedes {
                    outcome.superseded_fact_ids.push(old);
                    outcome.transitions.push(FactTransition {
                        fact_id: old,
                        to: FactStatus::Superseded,
                    });
                    current.remove(key.as_str());
                }

                outcome.new_facts.push(Fact {
                    id: FactId(next_id),
                    run_id: run_id.clone(),
                    version,
                    key: key.clone(),
                    value: value.clone(),
                    status: FactStatus::Active,
                    supersedes,
                    provenance: Provenance {
                        step_index,
                        agent: AgentKind::Compression,
                    },
                    created_at: now,
                });
                next_id += 1;
            }
            Candidate::Retract { ref key, .. } => match current.remove(key.as_str()) {
                Some(old) => {
                    outcome.deprecated_fact_ids.push(old.id);
                    outcome.transitions.push(FactTransition {
                        fact_id: old.id,
                        to: FactStatus::Deprecated,
                    });
                }
                None => outcome.dropped.push(candidate.into_dropped(DropReason::Stale)),
            },
        }
    }

    let mut projection: Vec<Fact> = current.into_values().cloned().collect();
    projection.extend(outcome.new_facts.iter().cloned());
    projection.sort_by_key(|f| f.id);
    outcome.active_facts = projection;

    outcome
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run_id() -> RunId {
        RunId::from("run_cmp")
    }

    fn user(step: u64, text: &str) -> Message {
        Message::user(run_id(), step, text)
    }

    fn active(id: u64, key: &str, value: &str) -> Fact {
        Fact {
            id: FactId(id),
            run_id: run_id(),
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

    fn extract(messages: &[Message]) -> Vec<Candidate> {
        extract_deterministic(&CompressionInput {
            objective: "objective",
            active_facts: &[],
            messages,
        })
    }

    fn assert_kv(c: &Candidate, k: &str, v: &str) {
        match c {
            Candidate::Assert { key, value, .. } => {
                assert_eq!(key, k);
                assert_eq!(value, v);
            }
            other => panic!("expected assertion, got {other:?}"),
        }
    }

    #[test]
    fn splits_on_sentence_ends_semicolons_and_newlines() {
        let clauses = split_clauses("One is 1. Two is 2; three is 3\nv1.2 ships? yes!");
        assert_eq!(
            clauses,
            vec!["One is 1.", "Two is 2", "three is 3", "v1.2 ships?", "yes!"]
        );
    }

    #[test]
    fn strips_stacked_prefixes() {
        assert_eq!(
            strip_prefixes("Change request: Actually, the UI is web"),
            "the UI is web"
        );
    }

    #[test]
    fn extracts_constraints_from_change_requests() {
        let candidates = extract(&[
            user(2, "Add a constraint: compression must be inspectable and deterministic."),
            user(3, "Add a constraint: token usage reduction must be at least 50%."),
            user(4, "Change request: the UI is minimal web only; no CLI."),
        ]);
        assert_eq!(candidates.len(), 4);
        assert_kv(&candidates[0], "compression", "inspectable and deterministic");
        assert_kv(&candidates[1], "token_usage_reduction", "at least 50%");
        assert_kv(&candidates[2], "ui", "minimal web only");
        assert!(matches!(
            candidates[3],
            Candidate::Unusable {
                reason: DropReason::LowSalience,
                ..
            }
        ));
    }

    #[test]
    fn update_and_set_forms() {
        let candidates = extract(&[
            user(1, "Change request: compression threshold is now 1200"),
            user(2, "Set the retrieval budget to 256 tokens."),
        ]);
        assert_kv(&candidates[0], "compression_threshold", "1200");
        assert_kv(&candidates[1], "retrieval_budget", "256 tokens");
    }

    #[test]
    fn retractions() {
        let candidates = extract(&[
            user(1, "Forget the CLI requirement."),
            user(2, "The offline mode no longer applies"),
        ]);
        assert!(matches!(&candidates[0], Candidate::Retract { key, .. } if key == "cli_requirement"));
        assert!(matches!(&candidates[1], Candidate::Retract { key, .. } if key == "offline_mode"));
    }

    #[test]
    fn questions_and_instructions_are_low_salience() {
        let candidates = extract(&[
            user(1, "What is the compression threshold?"),
            user(2, "Summarize the core objective in one sentence."),
            user(3, "We are building a multi-agent context compression engine."),
        ]);
        let reasons: Vec<DropReason> = candidates
            .iter()
            .map(|c| match c {
                Candidate::Unusable { reason, .. } => *reason,
                other => panic!("unexpected {other:?}"),
            })
            .collect();
        assert_eq!(
            reasons,
            vec![
                DropReason::LowSalience,
                DropReason::LowSalience,
                DropReason::Unparseable
            ]
        );
    }

    #[test]
    fn assistant_messages_are_ignored() {
        let candidates = extract(&[Message::assistant(run_id(), 1, "The plan is ready.")]);
        assert!(candidates.is_empty());
    }

    #[test]
    fn referenced_keys_cover_updates_and_questions() {
        assert_eq!(
            referenced_keys("Change request: compression threshold is now 1200"),
            vec!["compression_threshold"]
        );
        assert_eq!(referenced_keys("What is the deployment target?"), vec!["deployment_target"]);
        assert!(referenced_keys("Summarize the objective.").is_empty());
    }

    #[test]
    fn changed_value_supersedes() {
        let existing = vec![active(1, "compression_threshold", "2400")];
        let candidates = vec![Candidate::assert("compression threshold", "1200", 5, "src").unwrap()];
        let out = reconcile(&run_id(), &existing, candidates, 2, 2);

        assert_eq!(out.superseded_fact_ids, vec![FactId(1)]);
        assert_eq!(out.new_facts.len(), 1);
        assert_eq!(out.new_facts[0].id, FactId(2));
        assert_eq!(out.new_facts[0].supersedes, Some(FactId(1)));
        assert_eq!(out.active_facts.len(), 1);
        assert_eq!(out.active_facts[0].value, "1200");
    }

    #[test]
    fn equal_value_is_redundant() {
        let existing = vec![active(1, "ui", "Minimal web")];
        let candidates = vec![Candidate::assert("UI", "minimal web ", 3, "src").unwrap()];
        let out = reconcile(&run_id(), &existing, candidates, 2, 2);
        assert!(out.new_facts.is_empty());
        assert_eq!(out.dropped[0].reason, DropReason::Redundant);
        assert_eq!(out.active_facts, existing);
    }

    #[test]
    fn last_candidate_per_key_wins() {
        let candidates = vec![
            Candidate::assert("db", "postgres", 1, "a").unwrap(),
            Candidate::assert("db", "sqlite", 2, "b").unwrap(),
        ];
        let out = reconcile(&run_id(), &[], candidates, 1, 1);
        assert_eq!(out.new_facts.len(), 1);
        assert_eq!(out.new_facts[0].value, "sqlite");
        assert_eq!(out.dropped.len(), 1);
        assert_eq!(out.dropped[0].reason, DropReason::Stale);
        assert_eq!(out.dropped[0].text, "a");
    }

    #[test]
    fn retraction_deprecates_or_is_stale() {
        let existing = vec![active(1, "cli", "later")];
        let candidates = vec![
            Candidate::retract("cli", 4, "forget cli").unwrap(),
            Candidate::retract("mobile", 4, "forget mobile").unwrap(),
        ];
        let out = reconcile(&run_id(), &existing, candidates, 2, 2);
        assert_eq!(out.deprecated_fact_ids, vec![FactId(1)]);
        assert_eq!(out.dropped.len(), 1);
        assert_eq!(out.dropped[0].reason, DropReason::Stale);
        assert!(out.active_facts.is_empty());
    }

    #[test]
    fn every_candidate_is_accounted_for() {
        let existing = vec![active(1, "ui", "web"), active(2, "cli", "none")];
        let candidates = vec![
            Candidate::assert("ui", "web", 1, "same").unwrap(),
            Candidate::assert("budget", "50%", 1, "new").unwrap(),
            Candidate::assert("budget", "60%", 2, "newer").unwrap(),
            Candidate::retract("cli", 2, "drop cli").unwrap(),
            Candidate::Unusable {
                text: "chatter".into(),
                reason: DropReason::LowSalience,
                step_index: Some(2),
            },
        ];
        let out = reconcile(&run_id(), &existing, candidates, 3, 2);
        assert_eq!(
            out.candidates,
            out.new_facts.len() + out.deprecated_fact_ids.len() + out.dropped.len()
        );
    }

    #[test]
    fn trigger_prefers_token_threshold() {
        let config = RunConfig {
            compression_interval_steps: 3,
            ..RunConfig::default()
        };
        assert_eq!(
            CompressionTrigger::evaluate(&config, 3, 5000),
            Some(CompressionTrigger::TokenThreshold)
        );
        assert_eq!(
            CompressionTrigger::evaluate(&config, 3, 10),
            Some(CompressionTrigger::Interval)
        );
        assert_eq!(CompressionTrigger::evaluate(&config, 2, 10), None);

        let disabled = RunConfig {
            compression_interval_steps: 0,
            ..RunConfig::default()
        };
        assert_eq!(CompressionTrigger::evaluate(&disabled, 4, 10), None);
    }
}
