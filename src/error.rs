//! Error handling module
//!
//! Centralized error taxonomy shared across the engine.

use crate::processor::ProcessorId;

/// Engine-wide Result type
pub type EngineResult<T> = Result<T, EngineError>;

/// Engine error kinds
///
/// Violations that are part of normal operation (a losing optimistic append)
/// travel as values in `AppendOutcome`; this enum carries them only when a
/// caller-facing surface has to report them, per the command executor's
/// conversion rules.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Caller bug: malformed batch, predicate, or tag
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// No handler registered for the command type
    #[error("Invalid command '{command_type}': {reason}")]
    InvalidCommand {
        command_type: String,
        reason: String,
    },

    /// A committed event past the condition cursor matched the predicate
    #[error("Concurrency violation{}", context_suffix(.command_type))]
    ConcurrencyViolation { command_type: Option<String> },

    /// A committed event matched the idempotency predicate
    #[error("Idempotency violation{}", context_suffix(.command_type))]
    IdempotencyViolation { command_type: Option<String> },

    /// Transient store failure; the caller may retry
    #[error("Store unavailable: {0}")]
    Unavailable(#[from] sqlx::Error),

    /// Opaque failure raised by a processor handler or publisher
    #[error("Handler failure{}: {}", processor_suffix(.processor_id), .message)]
    HandlerFailure {
        processor_id: Option<ProcessorId>,
        message: String,
    },

    /// Cooperative shutdown observed mid-operation
    #[error("Shutting down")]
    Shutdown,

    /// Payload or metadata (de)serialization failure
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),
}

fn context_suffix(command_type: &Option<String>) -> String {
    match command_type {
        Some(t) => format!(" for command '{t}'"),
        None => String::new(),
    }
}

fn processor_suffix(processor_id: &Option<ProcessorId>) -> String {
    match processor_id {
        Some(id) => format!(" in processor '{id}'"),
        None => String::new(),
    }
}

impl EngineError {
    /// Short stable kind tag for logs and metrics
    pub fn kind(&self) -> &'static str {
        match self {
            EngineError::InvalidInput(_) => "invalid_input",
            EngineError::InvalidCommand { .. } => "invalid_command",
            EngineError::ConcurrencyViolation { .. } => "concurrency_violation",
            EngineError::IdempotencyViolation { .. } => "idempotency_violation",
            EngineError::Unavailable(_) => "store_unavailable",
            EngineError::HandlerFailure { .. } => "handler_failure",
            EngineError::Shutdown => "shutdown",
            EngineError::Serialization(_) => "serialization",
            EngineError::Config(_) => "config",
        }
    }

    /// Whether the caller may retry the same operation
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            EngineError::ConcurrencyViolation { .. } | EngineError::Unavailable(_)
        )
    }

    pub fn handler_failure(processor_id: &ProcessorId, message: impl Into<String>) -> Self {
        EngineError::HandlerFailure {
            processor_id: Some(processor_id.clone()),
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_tags_are_stable() {
        assert_eq!(
            EngineError::InvalidInput("x".into()).kind(),
            "invalid_input"
        );
        assert_eq!(
            EngineError::ConcurrencyViolation { command_type: None }.kind(),
            "concurrency_violation"
        );
        assert_eq!(EngineError::Shutdown.kind(), "shutdown");
    }

    #[test]
    fn test_retryable() {
        assert!(EngineError::ConcurrencyViolation { command_type: None }.is_retryable());
        assert!(!EngineError::InvalidInput("bad".into()).is_retryable());
        assert!(!EngineError::Shutdown.is_retryable());
    }

    #[test]
    fn test_display_carries_context() {
        let err = EngineError::ConcurrencyViolation {
            command_type: Some("open_wallet".into()),
        };
        assert!(err.to_string().contains("open_wallet"));

        let err = EngineError::IdempotencyViolation { command_type: None };
        assert_eq!(err.to_string(), "Idempotency violation");
    }
}
