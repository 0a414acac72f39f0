//! Run event log and in-process event bus.
//!
//! Every agent invocation leaves an [`Event`] in the run's append-only log.
//! The per-run total order of event ids is the replay contract: reading the
//! log back reproduces exactly what each agent saw and decided.
//!
//! Committed events are additionally broadcast on an [`EventBus`] so other
//! components can observe runs without polling the store.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;

use crate::run::RunId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Retrieval,
    Planner,
    Critic,
    Compression,
    Snapshot,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Retrieval => "retrieval",
            Self::Planner => "planner",
            Self::Critic => "critic",
            Self::Compression => "compression",
            Self::Snapshot => "snapshot",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "retrieval" => Some(Self::Retrieval),
            "planner" => Some(Self::Planner),
            "critic" => Some(Self::Critic),
            "compression" => Some(Self::Compression),
            "snapshot" => Some(Self::Snapshot),
            _ => None,
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A committed, immutable log entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Per-run sequence number, starting at 1.
    pub id: u64,
    pub run_id: RunId,
    pub step_index: u64,
    #[serde(rename = "type")]
    pub kind: EventKind,
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

/// An event staged in a commit. The store assigns its id and timestamp.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingEvent {
    pub step_index: u64,
    pub kind: EventKind,
    pub payload: serde_json::Value,
}

impl PendingEvent {
    pub fn new(step_index: u64, kind: EventKind, payload: serde_json::Value) -> Self {
        Self {
            step_index,
            kind,
            payload,
        }
    }

    pub fn into_event(self, run_id: RunId, id: u64) -> Event {
        Event {
            id,
            run_id,
            step_index: self.step_index,
            kind: self.kind,
            payload: self.payload,
            created_at: Utc::now(),
        }
    }
}

/// A broadcast-based event bus for committed run events.
///
/// Uses `tokio::sync::broadcast` for multi-consumer pub/sub.
/// Subscribers receive every event and filter for the runs they care about.
pub struct EventBus {
    sender: broadcast::Sender<Arc<Event>>,
}

impl EventBus {
    /// Create a new event bus with the given capacity.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publish an event to all subscribers.
    pub fn publish(&self, event: Event) {
        // No subscribers is fine
        let _ = self.sender.send(Arc::new(event));
    }

    /// Subscribe to receive events.
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<Event>> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}
