//! Metrics hooks
//!
//! Fire-and-forget observation events. The engine never blocks on a sink
//! and ignores whatever it does; the default sink forwards to `tracing`.

use std::sync::Arc;

use crate::processor::ProcessorId;

/// Observation events emitted by the engine
#[derive(Debug, Clone)]
pub enum MetricEvent {
    AppendCompleted {
        transaction_id: i64,
        batch_size: usize,
    },
    AppendRejected {
        outcome: &'static str,
    },
    CommandExecuted {
        command_type: String,
        idempotent: bool,
    },
    CycleCompleted {
        processor_id: ProcessorId,
        delivered: usize,
    },
    CycleFailed {
        processor_id: ProcessorId,
    },
    EmptyPoll {
        processor_id: ProcessorId,
        consecutive: u32,
    },
    ProcessorFailed {
        processor_id: ProcessorId,
        error_count: u32,
    },
    LeaderAcquired {
        instance: String,
    },
    LeaderReleased {
        instance: String,
    },
    LeaderLost {
        instance: String,
    },
}

/// Sink receiving observation events
pub trait MetricsSink: Send + Sync {
    fn observe(&self, event: &MetricEvent);
}

/// Shared sink handle
pub type SharedMetrics = Arc<dyn MetricsSink>;

/// Sink that drops every event
#[derive(Debug, Clone, Default)]
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {
    fn observe(&self, _event: &MetricEvent) {}
}

/// Default sink forwarding observations to `tracing`
#[derive(Debug, Clone, Default)]
pub struct TracingMetrics;

impl MetricsSink for TracingMetrics {
    fn observe(&self, event: &MetricEvent) {
        match event {
            MetricEvent::AppendCompleted {
                transaction_id,
                batch_size,
            } => {
                tracing::debug!(transaction_id, batch_size, "append completed");
            }
            MetricEvent::AppendRejected { outcome } => {
                tracing::debug!(outcome, "append rejected");
            }
            MetricEvent::CommandExecuted {
                command_type,
                idempotent,
            } => {
                tracing::debug!(command_type, idempotent, "command executed");
            }
            MetricEvent::CycleCompleted {
                processor_id,
                delivered,
            } => {
                tracing::debug!(processor_id = %processor_id, delivered, "cycle completed");
            }
            MetricEvent::CycleFailed { processor_id } => {
                tracing::warn!(processor_id = %processor_id, "cycle failed");
            }
            MetricEvent::EmptyPoll {
                processor_id,
                consecutive,
            } => {
                tracing::trace!(processor_id = %processor_id, consecutive, "empty poll");
            }
            MetricEvent::ProcessorFailed {
                processor_id,
                error_count,
            } => {
                tracing::error!(processor_id = %processor_id, error_count, "processor failed");
            }
            MetricEvent::LeaderAcquired { instance } => {
                tracing::info!(instance, "leader lock acquired");
            }
            MetricEvent::LeaderReleased { instance } => {
                tracing::info!(instance, "leader lock released");
            }
            MetricEvent::LeaderLost { instance } => {
                tracing::warn!(instance, "leader lease lost");
            }
        }
    }
}

/// Create the default shared sink
pub fn tracing_metrics() -> SharedMetrics {
    Arc::new(TracingMetrics)
}
