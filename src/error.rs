//! Error taxonomy for the orchestration engine.
//!
//! Recoverable variants ([`EngineError::RetrievalUnavailable`],
//! [`EngineError::SummarizationFailed`]) are absorbed by the pipeline and turned
//! into degradation events. Everything else aborts the current invocation.

use thiserror::Error;

pub type EngineResult<T> = std::result::Result<T, EngineError>;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("{kind} '{id}' not found")]
    NotFound { kind: &'static str, id: String },

    #[error("turn '{turn_id}' is already folded into the summary and cannot be edited")]
    ImmutableHistory { turn_id: String },

    #[error("chat '{chat_id}' was modified concurrently: {reason}")]
    ConcurrentModification { chat_id: String, reason: String },

    #[error("retrieval unavailable: {0}")]
    RetrievalUnavailable(String),

    #[error("summarization failed: {0}")]
    SummarizationFailed(String),

    #[error("generation failed: {0}")]
    GenerationFailed(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("storage error: {0}")]
    Storage(#[from] anyhow::Error),
}

impl EngineError {
    pub fn chat_not_found(chat_id: &str) -> Self {
        EngineError::NotFound {
            kind: "chat",
            id: chat_id.to_string(),
        }
    }

    pub fn turn_not_found(turn_id: &str) -> Self {
        EngineError::NotFound {
            kind: "turn",
            id: turn_id.to_string(),
        }
    }

    pub fn conflict(chat_id: &str, reason: impl Into<String>) -> Self {
        EngineError::ConcurrentModification {
            chat_id: chat_id.to_string(),
            reason: reason.into(),
        }
    }

    /// Recoverable errors degrade the turn instead of failing it.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            EngineError::RetrievalUnavailable(_) | EngineError::SummarizationFailed(_)
        )
    }

    /// Short machine-readable code used on the wire.
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::NotFound { .. } => "not_found",
            EngineError::ImmutableHistory { .. } => "immutable_history",
            EngineError::ConcurrentModification { .. } => "concurrent_modification",
            EngineError::RetrievalUnavailable(_) => "retrieval_unavailable",
            EngineError::SummarizationFailed(_) => "summarization_failed",
            EngineError::GenerationFailed(_) => "generation_failed",
            EngineError::InvalidInput(_) => "invalid_input",
            EngineError::Storage(_) => "storage",
        }
    }
}

impl From<rusqlite::Error> for EngineError {
    fn from(error: rusqlite::Error) -> Self {
        EngineError::Storage(error.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_retrieval_and_summarization_are_recoverable() {
        assert!(EngineError::RetrievalUnavailable("down".into()).is_recoverable());
        assert!(EngineError::SummarizationFailed("empty".into()).is_recoverable());
        assert!(!EngineError::GenerationFailed("boom".into()).is_recoverable());
        assert!(!EngineError::chat_not_found("c1").is_recoverable());
    }

    #[test]
    fn messages_name_the_missing_entity() {
        let err = EngineError::turn_not_found("t-9");
        assert_eq!(err.to_string(), "turn 't-9' not found");
        assert_eq!(err.code(), "not_found");
        let err = EngineError::conflict("c1", "truncated");
        assert!(err.to_string().contains("c1"));
        assert_eq!(err.code(), "concurrent_modification");
    }
}
