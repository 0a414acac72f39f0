//! Planner context assembly.
//!
//! The planner never sees the full transcript. It sees four layers, in
//! injection order:
//!
//! | Layer | Source |
//! |-------|--------|
//! | 1. Objective | The run objective |
//! | 2. Memory | Facts chosen by the retrieval agent |
//! | 3. Short-term | The STM window preceding the new message |
//! | 4. User message | The message being answered |
//!
//! Token accounting reads the same segment list the planner receives, so
//! the reported injected token count and the prompt can never disagree.

pub mod assembler;

pub use assembler::{ContextSegment, Layer, LayerStats, PlannerContext};
