//! Run identity and per-run configuration.
//!
//! A run is one long-horizon session: an objective, a fixed configuration,
//! and a monotonically increasing step counter. Everything else (messages,
//! facts, snapshots, events) hangs off the run id.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};

/// Unique identifier for a run, rendered as `run_<12 hex chars>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(pub String);

impl RunId {
    pub fn new() -> Self {
        let hex = Uuid::new_v4().simple().to_string();
        Self(format!("run_{}", &hex[..12]))
    }

    pub fn from(s: &str) -> Self {
        Self(s.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Which strategy drives the retrieval, planner, critic, and compression agents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeterminismMode {
    /// Agents call the configured LLM provider and fall back to the
    /// deterministic strategy on any failure.
    LlmAssisted,
    /// Agents use rule-based logic only. Output is a pure function of inputs.
    #[default]
    StrictDeterministic,
}

impl DeterminismMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::LlmAssisted => "llm_assisted",
            Self::StrictDeterministic => "strict_deterministic",
        }
    }
}

impl std::fmt::Display for DeterminismMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-run tuning knobs. Fixed at run creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunConfig {
    /// How many trailing messages make up short-term memory.
    #[serde(default = "default_stm_max_messages")]
    pub stm_max_messages: usize,

    /// Compress when the planner context reaches this many tokens.
    #[serde(default = "default_compression_token_threshold")]
    pub compression_token_threshold: usize,

    /// Compress every N steps. 0 disables the interval trigger.
    #[serde(default = "default_compression_interval_steps")]
    pub compression_interval_steps: u64,

    #[serde(default)]
    pub determinism_mode: DeterminismMode,

    /// Upper bound on facts the retrieval agent may select.
    #[serde(default = "default_retrieval_top_k")]
    pub retrieval_top_k: usize,

    /// Token budget for the selected facts' rendered text.
    #[serde(default = "default_retrieval_token_budget")]
    pub retrieval_token_budget: usize,
}

fn default_stm_max_messages() -> usize {
    12
}

fn default_compression_token_threshold() -> usize {
    2400
}

fn default_compression_interval_steps() -> u64 {
    4
}

fn default_retrieval_top_k() -> usize {
    8
}

fn default_retrieval_token_budget() -> usize {
    512
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            stm_max_messages: default_stm_max_messages(),
            compression_token_threshold: default_compression_token_threshold(),
            compression_interval_steps: default_compression_interval_steps(),
            determinism_mode: DeterminismMode::default(),
            retrieval_top_k: default_retrieval_top_k(),
            retrieval_token_budget: default_retrieval_token_budget(),
        }
    }
}

impl RunConfig {
    pub fn validate(&self) -> Result<()> {
        if self.stm_max_messages == 0 {
            return Err(Error::Validation(
                "stm_max_messages must be at least 1".into(),
            ));
        }
        if self.compression_token_threshold == 0 {
            return Err(Error::Validation(
                "compression_token_threshold must be at least 1".into(),
            ));
        }
        if self.retrieval_top_k == 0 {
            return Err(Error::Validation(
                "retrieval_top_k must be at least 1".into(),
            ));
        }
        if self.retrieval_token_budget == 0 {
            return Err(Error::Validation(
                "retrieval_token_budget must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

/// A long-horizon session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Run {
    pub id: RunId,
    pub objective: String,
    pub config: RunConfig,
    /// Number of completed steps. Advances by exactly one per committed step.
    pub step_counter: u64,
    pub created_at: DateTime<Utc>,
}

impl Run {
    /// Create a fresh run at step 0. Rejects an empty objective or invalid config.
    pub fn new(objective: &str, config: RunConfig) -> Result<Self> {
        let objective = objective.trim();
        if objective.is_empty() {
            return Err(Error::Validation("objective must not be empty".into()));
        }
        config.validate()?;
        Ok(Self {
            id: RunId::new(),
            objective: objective.to_string(),
            config,
            step_counter: 0,
            created_at: Utc::now(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_ids_have_prefix_and_twelve_hex_chars() {
        let id = RunId::new();
        let hex = id.as_str().strip_prefix("run_").unwrap();
        assert_eq!(hex.len(), 12);
        assert!(hex.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(RunId::new(), id);
    }

    #[test]
    fn config_defaults() {
        let config = RunConfig::default();
        assert_eq!(config.stm_max_messages, 12);
        assert_eq!(config.compression_token_threshold, 2400);
        assert_eq!(config.compression_interval_steps, 4);
        assert_eq!(config.determinism_mode, DeterminismMode::StrictDeterministic);
        assert_eq!(config.retrieval_top_k, 8);
        assert_eq!(config.retrieval_token_budget, 512);
    }

    #[test]
    fn partial_config_fills_defaults() {
        let config: RunConfig =
            serde_json::from_str(r#"{"stm_max_messages": 4, "determinism_mode": "llm_assisted"}"#)
                .unwrap();
        assert_eq!(config.stm_max_messages, 4);
        assert_eq!(config.determinism_mode, DeterminismMode::LlmAssisted);
        assert_eq!(config.compression_interval_steps, 4);
    }

    #[test]
    fn empty_objective_rejected() {
        let err = Run::new("   ", RunConfig::default()).unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[test]
    fn zero_stm_rejected() {
        let config = RunConfig {
            stm_max_messages: 0,
            ..RunConfig::default()
        };
        assert!(Run::new("ship it", config).is_err());
    }

    #[test]
    fn new_run_starts_at_step_zero() {
        let run = Run::new("  Draft a PRD  ", RunConfig::default()).unwrap();
        assert_eq!(run.step_counter, 0);
        assert_eq!(run.objective, "Draft a PRD");
    }
}
