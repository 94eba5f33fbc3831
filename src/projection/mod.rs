//! Projection module
//!
//! Folds streams of committed events into decision state for command
//! handlers. Read-model views live in `views`; this engine only computes
//! in-memory state plus the cursor the decision was based on.

mod service;

pub use service::{ProjectionService, StateProjector};
