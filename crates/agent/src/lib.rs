//! The per-step multi-agent pipeline, the heart of Distillery.
//!
//! Every step follows a **Retrieve → Plan → Critique → maybe Compress** cycle:
//!
//! 1. **Retrieve**: pick the few active facts and the recent messages the step needs
//! 2. **Plan**: answer the user from that selection only, never the full transcript
//! 3. **Critique**: check the answer against memory (advisory, never blocking)
//! 4. **Compress**: when a trigger fires, distill recent messages into facts
//!    and persist a new snapshot
//!
//! Each agent runs through an [`AgentStrategy`]: either LLM-assisted with a
//! deterministic fallback, or strictly deterministic. Everything a step writes
//! is committed atomically by the [`Orchestrator`].

pub mod compression;
pub mod context;
pub mod critic;
pub mod llm;
pub mod locks;
pub mod metrics;
pub mod orchestrator;
pub mod planner;
pub mod records;
pub mod retrieval;
pub mod scenario;
pub mod strategy;

#[cfg(test)]
pub(crate) mod test_helpers;

pub use compression::{Candidate, CompressionInput, CompressionOutcome, CompressionTrigger};
pub use context::{ContextSegment, Layer, LayerStats, PlannerContext};
pub use critic::{CriticInput, CriticReport};
pub use llm::LlmStrategy;
pub use locks::RunLocks;
pub use orchestrator::{CompressOutcome, MemoryView, Orchestrator, StepOutcome};
pub use planner::PlannerOutput;
pub use retrieval::{RetrievalInput, RetrievalResult};
pub use scenario::Scenario;
pub use strategy::{AgentRunner, AgentStrategy, Attempt, DeterministicStrategy};
