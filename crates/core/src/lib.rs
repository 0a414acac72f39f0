//! # Distillery Core
//!
//! Domain types, traits, and error definitions for the Distillery context
//! distillation engine. This crate has **no framework dependencies**: it
//! defines the run, message, fact, snapshot, and event model that the
//! storage, agent, and gateway crates implement against.
//!
//! ## Design Philosophy
//!
//! Every seam is a trait here. Implementations live in their respective crates:
//! - [`RunStore`] is implemented by the in-memory and SQLite stores
//! - [`SnapshotSink`] is implemented by the file and in-memory snapshot sinks
//! - [`Provider`] is implemented by the OpenAI-compatible client and the fallback chain

pub mod error;
pub mod token;
pub mod run;
pub mod message;
pub mod memory;
pub mod event;
pub mod metrics;
pub mod provider;
pub mod store;

// Re-export key types at crate root for ergonomics
pub use error::{
    ConsistencyViolation, Error, ExternalCallError, ProviderError, Result, StoreError,
};
pub use token::{estimate_segments, estimate_tokens};
pub use run::{DeterminismMode, Run, RunConfig, RunId};
pub use message::{Message, Role};
pub use memory::{
    AgentKind, DropReason, DroppedItem, Fact, FactId, FactStatus, LtmEntry, Provenance, Snapshot,
    normalize_key,
};
pub use event::{Event, EventBus, EventKind, PendingEvent};
pub use metrics::{Metrics, Verdict};
pub use provider::{PromptMessage, PromptRole, Provider, ProviderRequest, ProviderResponse, Usage};
pub use store::{FactTransition, RunCommit, RunStore, SnapshotSink, validate_commit};
