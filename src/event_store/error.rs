//! Event Store Errors
//!
//! Error types for event store operations. Losing an optimistic append is
//! not an error here; see `AppendOutcome`.

/// Errors that can occur in the event store
#[derive(Debug, thiserror::Error)]
pub enum EventStoreError {
    /// Caller bug: empty batch, empty type, malformed tag or predicate
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Transient store failure; retryable by the caller
    #[error("Store unavailable: {0}")]
    Unavailable(#[from] sqlx::Error),

    /// Stored row could not be decoded
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl EventStoreError {
    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(self, EventStoreError::Unavailable(_))
    }
}

impl From<EventStoreError> for crate::error::EngineError {
    fn from(err: EventStoreError) -> Self {
        match err {
            EventStoreError::InvalidInput(msg) => crate::error::EngineError::InvalidInput(msg),
            EventStoreError::Unavailable(e) => crate::error::EngineError::Unavailable(e),
            EventStoreError::Serialization(e) => crate::error::EngineError::Serialization(e),
        }
    }
}
