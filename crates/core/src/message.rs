//! Conversation messages.
//!
//! Every step appends exactly one user message and one assistant message.
//! The full history is retained forever; short-term memory is just the tail.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::run::RunId;
use crate::token::estimate_tokens;

/// The role of a message sender in a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "user" => Some(Self::User),
            "assistant" => Some(Self::Assistant),
            _ => None,
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single message in a run's history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub run_id: RunId,

    /// The step that produced this message (1-based).
    pub step_index: u64,

    pub role: Role,

    pub content: String,

    /// Token cost of the rendered `role: content` line.
    pub token_estimate: usize,

    pub created_at: DateTime<Utc>,
}

impl Message {
    pub fn new(run_id: RunId, step_index: u64, role: Role, content: impl Into<String>) -> Self {
        let content = content.into();
        let token_estimate = estimate_tokens(&render(role, &content));
        Self {
            run_id,
            step_index,
            role,
            content,
            token_estimate,
            created_at: Utc::now(),
        }
    }

    /// Create a new user message.
    pub fn user(run_id: RunId, step_index: u64, content: impl Into<String>) -> Self {
        Self::new(run_id, step_index, Role::User, content)
    }

    /// Create a new assistant message.
    pub fn assistant(run_id: RunId, step_index: u64, content: impl Into<String>) -> Self {
        Self::new(run_id, step_index, Role::Assistant, content)
    }

    /// The text this message contributes to a prompt or a baseline.
    pub fn render(&self) -> String {
        render(self.role, &self.content)
    }
}

fn render(role: Role, content: &str) -> String {
    format!("{}: {}", role.as_str(), content)
}
