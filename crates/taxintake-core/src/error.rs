//! Error types for the intake engine
//!
//! Errors are split by where they can occur: the knowledge base fails at
//! startup, the completion service fails per call and is always recoverable,
//! and everything else surfaces through [`IntakeError`].

use std::time::Duration;
use thiserror::Error;

/// Result type alias for intake operations
pub type Result<T> = std::result::Result<T, IntakeError>;

/// Main error type for the intake engine
#[derive(Error, Debug)]
pub enum IntakeError {
    /// The knowledge base failed validation at load time
    #[error("Knowledge base error: {0}")]
    KnowledgeBase(#[from] KnowledgeBaseError),

    #[error("Session not found: {0}")]
    SessionNotFound(String),

    /// A completion call failed after every retry
    #[error("Completion error: {0}")]
    Completion(#[from] CompletionError),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// A state invariant was broken while building a turn
    #[error("Invariant violation: {0}")]
    InvariantViolation(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<serde_json::Error> for IntakeError {
    fn from(e: serde_json::Error) -> Self {
        IntakeError::Serialization(e.to_string())
    }
}

impl From<toml::de::Error> for IntakeError {
    fn from(e: toml::de::Error) -> Self {
        IntakeError::Serialization(e.to_string())
    }
}

impl From<toml::ser::Error> for IntakeError {
    fn from(e: toml::ser::Error) -> Self {
        IntakeError::Serialization(e.to_string())
    }
}

/// Knowledge base inconsistencies, detected once when the catalog is built
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum KnowledgeBaseError {
    #[error("Duplicate question id '{id}' (first in {first}, again in {second})")]
    DuplicateQuestion {
        id: String,
        first: String,
        second: String,
    },

    #[error("Duplicate module id '{0}'")]
    DuplicateModule(String),

    #[error("Question '{question}' references unknown module '{module}'")]
    DanglingModule { question: String, module: String },

    #[error("Question '{question}' references undefined tag '{tag}'")]
    DanglingTag { question: String, tag: String },

    #[error("Question '{question}' has unrecognised action: {action}")]
    UnknownAction { question: String, action: String },

    #[error("Knowledge base has no gating questions")]
    NoGatingQuestions,
}

/// Completion service failures. Callers always have a fallback path.
#[derive(Error, Debug, Clone)]
pub enum CompletionError {
    #[error("Completion service unavailable: {0}")]
    Unavailable(String),

    #[error("Completion timed out after {0:?}")]
    Timeout(Duration),

    #[error("Provider error: {0}")]
    Provider(String),

    #[error("Circuit breaker open for {0}")]
    CircuitOpen(String),

    #[error("Completion failed after {attempts} attempts: {last}")]
    Exhausted { attempts: u32, last: String },
}

impl IntakeError {
    /// Whether a caller may retry the same operation
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            IntakeError::Completion(_) | IntakeError::InvariantViolation(_)
        )
    }
}
