//! Builds the [`PlannerContext`] from a retrieval result.
//!
//! # Determinism
//!
//! Assembly is a pure function of its inputs. Facts keep the order the
//! retrieval agent chose and messages keep history order.

use distillery_core::memory::Fact;
use distillery_core::message::Message;
use distillery_core::provider::PromptMessage;
use distillery_core::token;
use serde::{Deserialize, Serialize};

// ── Types ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Layer {
    Objective,
    Memory,
    ShortTerm,
    UserMessage,
}

impl Layer {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Objective => "objective",
            Self::Memory => "memory",
            Self::ShortTerm => "short_term",
            Self::UserMessage => "user_message",
        }
    }
}

/// One piece of injected text and its token cost.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextSegment {
    pub layer: Layer,
    pub text: String,
    pub tokens: usize,
}

impl ContextSegment {
    fn new(layer: Layer, text: String) -> Self {
        let tokens = token::estimate_tokens(&text);
        Self {
            layer,
            text,
            tokens,
        }
    }
}

/// Statistics for a single context layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayerStats {
    /// Layer name.
    pub name: String,
    /// Tokens consumed by this layer.
    pub tokens: usize,
    /// Segments in this layer.
    pub items: usize,
}

/// Everything the planner is allowed to see for one step.
#[derive(Debug, Clone, PartialEq)]
pub struct PlannerContext {
    objective: String,
    facts: Vec<Fact>,
    stm: Vec<Message>,
    user_message: String,
    segments: Vec<ContextSegment>,
}

impl PlannerContext {
    /// Assemble the layered context.
    pub fn assemble(
        objective: &str,
        facts: &[Fact],
        stm_slice: &[Message],
        user_message: &str,
    ) -> Self {
        let mut segments = Vec::with_capacity(2 + facts.len() + stm_slice.len());

        // ── Layer 1: Objective ─────────────────────────────────────────────
        segments.push(ContextSegment::new(Layer::Objective, objective.to_string()));

        // ── Layer 2: Selected memory ───────────────────────────────────────
        segments.extend(
            facts
                .iter()
                .map(|f| ContextSegment::new(Layer::Memory, f.render())),
        );

        // ── Layer 3: Short-term window ─────────────────────────────────────
        segments.extend(
            stm_slice
                .iter()
                .map(|m| ContextSegment::new(Layer::ShortTerm, m.render())),
        );

        // ── Layer 4: The message being answered ────────────────────────────
        segments.push(ContextSegment::new(
            Layer::UserMessage,
            user_message.to_string(),
        ));

        Self {
            objective: objective.to_string(),
            facts: facts.to_vec(),
            stm: stm_slice.to_vec(),
            user_message: user_message.to_string(),
            segments,
        }
    }

    /// Total tokens injected for this step.
    pub fn token_count(&self) -> usize {
        self.segments.iter().map(|s| s.tokens).sum()
    }

    pub fn segments(&self) -> &[ContextSegment] {
        &self.segments
    }

    pub fn objective(&self) -> &str {
        &self.objective
    }

    pub fn facts(&self) -> &[Fact] {
        &self.facts
    }

    pub fn stm(&self) -> &[Message] {
        &self.stm
    }

    pub fn user_message(&self) -> &str {
        &self.user_message
    }

    /// Per-layer token usage, in injection order. Empty layers are reported
    /// with zero items.
    pub fn layer_stats(&self) -> Vec<LayerStats> {
        [
            Layer::Objective,
            Layer::Memory,
            Layer::ShortTerm,
            Layer::UserMessage,
        ]
        .into_iter()
        .map(|layer| {
            let (tokens, items) = self
                .segments
                .iter()
                .filter(|s| s.layer == layer)
                .fold((0, 0), |(t, n), s| (t + s.tokens, n + 1));
            LayerStats {
                name: layer.as_str().into(),
                tokens,
                items,
            }
        })
        .collect()
    }

    /// The segments as prompt messages, one per segment.
    pub fn to_prompt_messages(&self) -> Vec<PromptMessage> {
        self.segments
            .iter()
            .map(|s| PromptMessage::user(s.text.clone()))
            .collect()
    }
}
