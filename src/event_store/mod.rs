//! Event Store module
//!
//! Append-only log persistence with dynamic-consistency-boundary appends.

mod error;
mod event;
mod query;
mod repository;

pub use error::EventStoreError;
pub use event::{AppendEvent, Cursor, StoredEvent, Tag, MAX_EVENT_TYPE_LEN};
pub use query::{Query, QueryItem, TagPredicate};
pub use repository::{
    idempotency_lock_key, AppendCondition, AppendOutcome, EventStore,
};
