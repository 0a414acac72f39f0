//! Compressed working memory (CWM) and long-term memory (LTM) types.
//!
//! Facts are immutable records. The only thing that ever changes about a
//! stored fact is its status, and only forward out of `active`. Replacing a
//! value means writing a new fact that links back to the old one through
//! `supersedes`, so the full decision history stays auditable.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::run::RunId;

/// Per-run, monotonically increasing fact identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FactId(pub u64);

impl std::fmt::Display for FactId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FactStatus {
    Active,
    /// Replaced by a newer fact with the same key.
    Superseded,
    /// Retracted without a replacement.
    Deprecated,
}

impl FactStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Superseded => "superseded",
            Self::Deprecated => "deprecated",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(Self::Active),
            "superseded" => Some(Self::Superseded),
            "deprecated" => Some(Self::Deprecated),
            _ => None,
        }
    }
}

impl std::fmt::Display for FactStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The agents of the per-step pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentKind {
    Retrieval,
    Planner,
    Critic,
    Compression,
}

impl AgentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Retrieval => "retrieval",
            Self::Planner => "planner",
            Self::Critic => "critic",
            Self::Compression => "compression",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "retrieval" => Some(Self::Retrieval),
            "planner" => Some(Self::Planner),
            "critic" => Some(Self::Critic),
            "compression" => Some(Self::Compression),
            _ => None,
        }
    }
}

impl std::fmt::Display for AgentKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where a fact came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Provenance {
    /// Step index of the message the fact was extracted from.
    pub step_index: u64,
    pub agent: AgentKind,
}

/// A single structured fact in compressed working memory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fact {
    pub id: FactId,
    pub run_id: RunId,
    /// The snapshot version that created this fact.
    pub version: u64,
    pub key: String,
    pub value: String,
    pub status: FactStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub supersedes: Option<FactId>,
    pub provenance: Provenance,
    pub created_at: DateTime<Utc>,
}

impl Fact {
    pub fn is_active(&self) -> bool {
        self.status == FactStatus::Active
    }

    /// The text this fact contributes when injected into a prompt.
    pub fn render(&self) -> String {
        format!("{}: {}", self.key, self.value)
    }
}

/// Why a compression candidate did not become a fact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DropReason {
    /// Same key and value as an active fact.
    Redundant,
    /// Questions, chatter, instructions with nothing to remember.
    LowSalience,
    /// Overridden by a later candidate, or retracts a key that is not active.
    Stale,
    /// Looked like content but matched no extraction pattern.
    Unparseable,
}

impl DropReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Redundant => "redundant",
            Self::LowSalience => "low_salience",
            Self::Stale => "stale",
            Self::Unparseable => "unparseable",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "redundant" => Some(Self::Redundant),
            "low_salience" => Some(Self::LowSalience),
            "stale" => Some(Self::Stale),
            "unparseable" => Some(Self::Unparseable),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DroppedItem {
    pub text: String,
    pub reason: DropReason,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_index: Option<u64>,
}

/// An immutable record of the active-fact projection after a compression.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub run_id: RunId,
    /// 1-based, increments by one per compression.
    pub version: u64,
    /// The run's step counter when the compression ran.
    pub step_index: u64,
    pub timestamp: DateTime<Utc>,
    /// Active facts ordered by id.
    pub facts: Vec<Fact>,
    pub dropped: Vec<DroppedItem>,
    /// Location of the persisted JSON blob.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

/// Long-term memory scaffold entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LtmEntry {
    pub run_id: RunId,
    pub key: String,
    pub value: String,
    pub confidence: f32,
}

const LEADING_ARTICLES: &[&str] = &["the", "a", "an", "our", "my", "your", "its", "their"];

/// Normalize a free-text key: lowercase, leading articles dropped, every
/// run of non-alphanumeric characters collapsed to a single `_`.
///
/// ```
/// use distillery_core::normalize_key;
/// assert_eq!(normalize_key("The Compression  Threshold"), "compression_threshold");
/// assert_eq!(normalize_key("UI"), "ui");
/// ```
pub fn normalize_key(raw: &str) -> String {
    let lowered = raw.trim().to_lowercase();
    let mut words: Vec<&str> = lowered.split_whitespace().collect();
    while words.len() > 1 && LEADING_ARTICLES.contains(&words[0]) {
        words.remove(0);
    }

    let mut key = String::with_capacity(lowered.len());
    let mut pending_sep = false;
    for c in words.join(" ").chars() {
        if c.is_alphanumeric() {
            if pending_sep && !key.is_empty() {
                key.push('_');
            }
            pending_sep = false;
            key.push(c);
        } else {
            pending_sep = true;
        }
    }
    key
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_key_drops_articles_and_punctuation() {
        assert_eq!(normalize_key("the UI"), "ui");
        assert_eq!(normalize_key("Token-usage reduction"), "token_usage_reduction");
        assert_eq!(normalize_key("  our API   base/url! "), "api_base_url");
        assert_eq!(normalize_key("---"), "");
    }

    #[test]
    fn lone_article_is_kept() {
        assert_eq!(normalize_key("A"), "a");
    }

    #[test]
    fn fact_renders_as_key_value_line() {
        let fact = Fact {
            id: FactId(1),
            run_id: RunId::from("run_x"),
            version: 1,
            key: "ui".into(),
            value: "minimal web only".into(),
            status: FactStatus::Active,
            supersedes: None,
            provenance: Provenance {
                step_index: 4,
                agent: AgentKind::Compression,
            },
            created_at: Utc::now(),
        };
        assert_eq!(fact.render(), "ui: minimal web only");
        assert!(fact.is_active());
    }

    #[test]
    fn status_serializes_snake_case() {
        let json = serde_json::to_string(&DropReason::LowSalience).unwrap();
        assert_eq!(json, "\"low_salience\"");
        assert_eq!(FactStatus::parse("superseded"), Some(FactStatus::Superseded));
    }
}
