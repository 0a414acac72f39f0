//! Planner agent: answer from the assembled context only.

use crate::context::PlannerContext;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlannerOutput {
    pub assistant_message: String,
    #[serde(default)]
    pub plan_steps: Vec<String>,
}

impl PlannerOutput {
    /// Message and steps as one text, for the critic.
    pub fn full_text(&self) -> String {
        if self.plan_steps.is_empty() {
            return self.assistant_message.clone();
        }
        format!("{}\n{}", self.assistant_message, self.plan_steps.join("\n"))
    }
}

/// Deterministic planner: a templated answer that restates the request and
/// the memory it was given.
pub fn compose(ctx: &PlannerContext) -> PlannerOutput {
    let mut lines = vec![
        format!("Working toward: {}", ctx.objective()),
        format!("Request: {}", ctx.user_message()),
    ];

    if ctx.facts().is_empty() {
        lines.push("No stored memory applies to this request yet.".into());
    } else {
        lines.push("Relevant memory:".into());
        lines.extend(
            ctx.facts()
                .iter()
                .map(|f| format!("- {} = {}", f.key, f.value)),
        );
    }

    if !ctx.stm().is_empty() {
        lines.push(format!(
            "Considering the last {} messages of this conversation.",
            ctx.stm().len()
        ));
    }

    let mut plan_steps = vec![format!("Address: {}", ctx.user_message())];
    plan_steps.extend(
        ctx.facts()
            .iter()
            .map(|f| format!("Respect {} = {}", f.key, f.value)),
    );

    PlannerOutput {
        assistant_message: lines.join("\n"),
        plan_steps,
    }
}
