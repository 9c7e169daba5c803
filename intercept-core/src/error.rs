//! Error types for the interception engine
//!
//! Every variant below degrades to pass-through at the traffic boundary.
//! None of them is allowed to block or drop a unit on its own; only an
//! operator cancel does that, and it is an outcome, not an error.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    /// The rule persistence collaborator could not be reached
    #[error("Rule store unavailable: {0}")]
    StoreUnavailable(String),

    /// A mock rule's action payload could not be decoded
    #[error("Malformed mock payload in rule {rule_id}: {reason}")]
    MalformedMockPayload { rule_id: String, reason: String },

    /// Releasing an unknown, already released or not yet suspended breakpoint
    #[error("Invalid breakpoint transition for {id}: {reason}")]
    InvalidBreakpointTransition { id: String, reason: String },

    /// A single rule could not be evaluated and was skipped
    #[error("Rule {rule_id} skipped: {reason}")]
    MatchEvaluationError { rule_id: String, reason: String },

    #[error("Configuration error: {0}")]
    Configuration(String),

    /// The event sink rejected a finalized event
    #[error("Event sink error: {0}")]
    Sink(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl EngineError {
    pub(crate) fn rule(rule_id: &str, reason: impl Into<String>) -> Self {
        EngineError::MatchEvaluationError {
            rule_id: rule_id.to_string(),
            reason: reason.into(),
        }
    }

    pub(crate) fn transition(id: &str, reason: impl Into<String>) -> Self {
        EngineError::InvalidBreakpointTransition {
            id: id.to_string(),
            reason: reason.into(),
        }
    }

    /// Short label used in logs and annotations
    pub fn kind(&self) -> &'static str {
        match self {
            EngineError::StoreUnavailable(_) => "store_unavailable",
            EngineError::MalformedMockPayload { .. } => "malformed_mock_payload",
            EngineError::InvalidBreakpointTransition { .. } => "invalid_breakpoint_transition",
            EngineError::MatchEvaluationError { .. } => "match_evaluation_error",
            EngineError::Configuration(_) => "configuration",
            EngineError::Sink(_) => "sink",
            EngineError::Io(_) => "io",
        }
    }
}
