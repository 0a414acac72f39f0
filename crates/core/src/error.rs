//! Error types for the Distillery domain.
//!
//! Uses `thiserror` for ergonomic error definitions.
//! Each bounded context has its own error enum; [`Error`] is the
//! top-level type every public operation returns.

use thiserror::Error;

/// The top-level error type for all Distillery operations.
#[derive(Debug, Error)]
pub enum Error {
    // --- Input validation ---
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Run not found: {0}")]
    RunNotFound(String),

    // --- Memory model invariants ---
    #[error("Consistency violation: {0}")]
    Consistency(#[from] ConsistencyViolation),

    // --- Persistence ---
    #[error("Storage error: {0}")]
    Storage(#[from] StoreError),

    // --- LLM / external calls that could not be recovered ---
    #[error("External call failed: {0}")]
    ExternalCall(#[from] ExternalCallError),

    // --- Configuration errors ---
    #[error("Configuration error: {message}")]
    Config { message: String },

    // --- Serialization ---
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    // --- Generic ---
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// A short machine-readable code for API error bodies.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation_error",
            Self::RunNotFound(_) => "run_not_found",
            Self::Consistency(_) => "consistency_violation",
            Self::Storage(_) => "storage_error",
            Self::ExternalCall(_) => "external_call_error",
            Self::Config { .. } => "config_error",
            Self::Serialization(_) => "serialization_error",
            Self::Internal(_) => "internal_error",
        }
    }
}

/// Result type alias using our Error.
pub type Result<T> = std::result::Result<T, Error>;

// --- Bounded context errors ---

#[derive(Debug, Clone, Error)]
pub enum ProviderError {
    #[error("API request failed: {message} (status: {status_code})")]
    ApiError {
        status_code: u16,
        message: String,
    },

    #[error("Rate limited by provider, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("Provider not configured: {0}")]
    NotConfigured(String),

    #[error("Request timed out: {0}")]
    Timeout(String),

    #[error("Network error: {0}")]
    Network(String),
}

/// A failed call to an LLM-backed agent strategy.
///
/// The orchestrator recovers from all of these by retrying once with the
/// deterministic strategy, so they only surface when that retry is impossible.
#[derive(Debug, Clone, Error)]
pub enum ExternalCallError {
    #[error("{0}")]
    Provider(#[from] ProviderError),

    #[error("{agent} call exceeded {timeout_secs}s")]
    Timeout { agent: String, timeout_secs: u64 },

    #[error("{agent} returned malformed output: {reason}")]
    MalformedOutput { agent: String, reason: String },
}

/// A commit that would break the memory model.
///
/// Stores reject the whole commit when any of these is detected; nothing
/// from the rejected commit becomes visible.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConsistencyViolation {
    #[error("more than one active fact for key '{key}'")]
    DuplicateActiveFact { key: String },

    #[error("fact {fact_id} is {status}, only active facts can change status")]
    FactNotActive { fact_id: u64, status: String },

    #[error("unknown fact {fact_id}")]
    UnknownFact { fact_id: u64 },

    #[error("supersession cycle through fact {fact_id}")]
    SupersessionCycle { fact_id: u64 },

    #[error("stale step: expected step counter {expected}, found {found}")]
    StaleStep { expected: u64, found: u64 },

    #[error("immutable record: {0}")]
    ImmutableRecord(String),
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Query failed: {0}")]
    QueryFailed(String),

    #[error("Migration failed: {0}")]
    MigrationFailed(String),

    #[error("Snapshot blob error: {0}")]
    Blob(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn consistency_violation_converts_into_error() {
        let err: Error = ConsistencyViolation::StaleStep {
            expected: 3,
            found: 4,
        }
        .into();
        assert_eq!(err.code(), "consistency_violation");
        assert!(err.to_string().contains("expected step counter 3"));
    }

    #[test]
    fn provider_error_wraps_into_external_call() {
        let err: ExternalCallError = ProviderError::Network("connection reset".into()).into();
        let top: Error = err.into();
        assert_eq!(top.code(), "external_call_error");
        assert!(top.to_string().contains("connection reset"));
    }
}
