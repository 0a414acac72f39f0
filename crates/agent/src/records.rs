//! Event payloads.
//!
//! Every payload carries the strategy that produced it and whether that was
//! the deterministic fallback. Payloads reference messages and facts by
//! position and id, not by copy, so metrics can be recomputed from the log.

use crate::compression::CompressionTrigger;
use crate::context::LayerStats;
use distillery_core::event::{EventKind, PendingEvent};
use distillery_core::memory::{DroppedItem, FactId};
use distillery_core::metrics::Verdict;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrievalRecord {
    pub strategy: String,
    pub degraded: bool,
    pub selected_fact_ids: Vec<FactId>,
    /// Half-open range of the STM slice in the run's message history.
    pub stm_start: usize,
    pub stm_end: usize,
    /// Position of the user message this step answered.
    pub user_message_index: usize,
    pub notes: String,
    pub injected_tokens: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlannerRecord {
    pub strategy: String,
    pub degraded: bool,
    pub assistant_message: String,
    pub plan_steps: Vec<String>,
    pub context_tokens: usize,
    pub layers: Vec<LayerStats>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CriticRecord {
    pub strategy: String,
    pub degraded: bool,
    pub verdict: Verdict,
    pub reasons: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompressionRecord {
    pub strategy: String,
    pub degraded: bool,
    pub trigger: CompressionTrigger,
    pub candidates: usize,
    pub new_fact_ids: Vec<FactId>,
    pub superseded_fact_ids: Vec<FactId>,
    pub deprecated_fact_ids: Vec<FactId>,
    pub dropped: Vec<DroppedItem>,
    pub snapshot_version: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotRecord {
    pub strategy: String,
    pub degraded: bool,
    pub version: u64,
    pub path: Option<String>,
    pub active_fact_ids: Vec<FactId>,
    pub step_index: u64,
}

/// Serialize a record into a pending event.
pub fn pending<T: Serialize>(
    step_index: u64,
    kind: EventKind,
    record: &T,
) -> distillery_core::Result<PendingEvent> {
    Ok(PendingEvent::new(
        step_index,
        kind,
        serde_json::to_value(record)?,
    ))
}
