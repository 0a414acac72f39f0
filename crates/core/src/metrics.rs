//! Token-accounting metrics.
//!
//! Metrics are never stored; they are recomputed from committed state on
//! every read so they can not drift from what was actually injected.

use serde::{Deserialize, Serialize};

/// The critic's judgement of a planner answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Ok,
    /// The user referenced something memory does not hold.
    MissingMemory,
    /// The answer contradicts or omits memory it should have used.
    Inconsistent,
}

impl Verdict {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ok => "ok",
            Self::MissingMemory => "missing_memory",
            Self::Inconsistent => "inconsistent",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "ok" => Some(Self::Ok),
            "missing_memory" => Some(Self::MissingMemory),
            "inconsistent" => Some(Self::Inconsistent),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Metrics {
    /// Cost of sending the objective plus the full transcript.
    pub baseline_tokens: usize,
    /// Cost of the context the planner actually received on the latest step.
    pub injected_tokens: usize,
    pub reduction_pct: f64,
    pub critic_verdict: Option<Verdict>,
    pub last_snapshot_path: Option<String>,
}

/// `max(0, 100 * (baseline - injected) / baseline)`, 0 when baseline is 0.
pub fn reduction_pct(baseline_tokens: usize, injected_tokens: usize) -> f64 {
    if baseline_tokens == 0 || injected_tokens >= baseline_tokens {
        return 0.0;
    }
    let saved = (baseline_tokens - injected_tokens) as f64;
    100.0 * saved / baseline_tokens as f64
}
