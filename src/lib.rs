//! dcb_engine Library
//!
//! Event-sourced persistence and dispatch engine over PostgreSQL. Commands
//! project decision state from a single append-only log, append new events
//! under a dynamic-consistency-boundary condition, and leader-elected
//! background processors dispatch committed events to outbox publishers and
//! materialized read views.

pub mod clock;
pub mod command;
pub mod config;
pub mod db;
pub mod error;
pub mod event_store;
pub mod metrics;
pub mod outbox;
pub mod processor;
pub mod projection;
pub mod views;

pub use clock::{system_clock, Clock, FixedClock, InstanceId, SystemClock};
pub use command::{
    Command, CommandExecutor, CommandHandler, CommandRegistry, CommandResult, ExecutionResult,
};
pub use config::{Config, ConfigError, TransactionIsolation};
pub use db::Pools;
pub use error::{EngineError, EngineResult};
pub use event_store::{
    AppendCondition, AppendEvent, AppendOutcome, Cursor, EventStore, EventStoreError, Query,
    QueryItem, StoredEvent, Tag, TagPredicate,
};
pub use metrics::{MetricEvent, MetricsSink, NoopMetrics, TracingMetrics};
pub use outbox::{EventPublisher, OutboxProcessor, TopicConfig};
pub use processor::{
    BackoffConfig, BackoffSnapshot, EventProcessor, LeaderElector, ProcessorConfig, ProcessorId,
    ProcessorRuntime, ProcessorStatus, ProcessorWorker, ProgressStore,
};
pub use projection::{ProjectionService, StateProjector};
pub use views::{ViewProjector, ViewSubscription};
