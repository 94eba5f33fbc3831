//! Generic Event Processor framework
//!
//! Periodic per-processor workers with progress rows, error counting,
//! exponential empty-poll backoff, and leader-elected activation. The
//! outbox and view subsystems bind their filters and side effects to this
//! framework through the `EventProcessor` trait.

mod backoff;
mod config;
mod leader;
mod progress;
mod runtime;
mod worker;

use std::fmt;

use async_trait::async_trait;

use crate::error::EngineResult;
use crate::event_store::StoredEvent;

pub use backoff::{BackoffSnapshot, BackoffState};
pub use config::{BackoffConfig, ProcessorConfig};
pub use leader::{LeaderElector, LEADER_LOCK_KEY};
pub use progress::{ProcessorProgress, ProcessorStatus, ProgressStore};
pub use runtime::{ProcessorOverview, ProcessorRuntime};
pub use worker::ProcessorWorker;

/// Identity of one processor; one progress row per id
///
/// Outbox processors use `"topic:publisher"`, view processors use the view
/// name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ProcessorId(String);

impl ProcessorId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Outbox identity for a `(topic, publisher)` pair
    pub fn for_topic_publisher(topic: &str, publisher: &str) -> Self {
        Self(format!("{topic}:{publisher}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ProcessorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for ProcessorId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// One pollable event consumer
///
/// `handle` must be idempotent from the processor's perspective: delivery is
/// at-least-once, and the same batch may be handed over again after a crash
/// between side effect and progress advance.
#[async_trait]
pub trait EventProcessor: Send + Sync {
    fn id(&self) -> &ProcessorId;

    /// Committed events matching this processor's filter with
    /// `position > after_position`, ascending, at most `batch_size`
    async fn fetch(
        &self,
        after_position: i64,
        batch_size: i64,
    ) -> EngineResult<Vec<StoredEvent>>;

    /// Deliver the batch; returns the number of events handled
    async fn handle(&self, events: &[StoredEvent]) -> EngineResult<usize>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_processor_id_for_topic_publisher() {
        let id = ProcessorId::for_topic_publisher("wallet-events", "kafka");
        assert_eq!(id.as_str(), "wallet-events:kafka");
        assert_eq!(id.to_string(), "wallet-events:kafka");
    }

    #[test]
    fn test_processor_id_equality() {
        assert_eq!(ProcessorId::from("a"), ProcessorId::new("a"));
        assert_ne!(ProcessorId::from("a"), ProcessorId::from("b"));
    }
}
