//! View Adapter
//!
//! Binds the generic processor framework to read-model views. Each view
//! subscribes to a slice of the log and applies idempotent upserts through
//! its projector; the batch of upserts and the progress advance commit in
//! one transaction, so a view is never ahead of or behind its own cursor.

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use sqlx::{PgPool, Postgres, Transaction};

use crate::error::{EngineError, EngineResult};
use crate::event_store::{EventStore, Query, QueryItem, StoredEvent, TagPredicate};
use crate::metrics::SharedMetrics;
use crate::processor::{
    EventProcessor, LeaderElector, ProcessorConfig, ProcessorId, ProcessorWorker, ProgressStore,
};

/// Which events a view consumes
#[derive(Debug, Clone, serde::Deserialize)]
pub struct ViewSubscription {
    pub view_name: String,
    /// Event types, empty = any
    #[serde(default)]
    pub event_types: BTreeSet<String>,
    /// Keys that must all be present
    #[serde(default)]
    pub required_tags: Vec<String>,
    /// Keys of which at least one must be present
    #[serde(default)]
    pub any_of_tags: Vec<String>,
}

impl ViewSubscription {
    pub fn new(view_name: impl Into<String>) -> Self {
        Self {
            view_name: view_name.into(),
            event_types: BTreeSet::new(),
            required_tags: Vec::new(),
            any_of_tags: Vec::new(),
        }
    }

    pub fn with_event_types<I, T>(mut self, event_types: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        self.event_types = event_types.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_required_tags<I, T>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        self.required_tags = keys.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_any_of_tags<I, T>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        self.any_of_tags = keys.into_iter().map(Into::into).collect();
        self
    }

    /// The subscription as a log query
    pub fn filter_query(&self) -> Query {
        let mut predicates = Vec::new();
        for key in &self.required_tags {
            predicates.push(TagPredicate::KeyPresent(key.clone()));
        }
        if !self.any_of_tags.is_empty() {
            predicates.push(TagPredicate::AnyOfKeys(self.any_of_tags.clone()));
        }
        Query::single(QueryItem {
            event_types: self.event_types.clone(),
            predicates,
        })
    }
}

/// Applies one event to a view's read tables
///
/// Upserts must be keyed by stable identifiers from the event payload:
/// delivery is at-least-once and the same event may be applied again.
#[async_trait]
pub trait ViewProjector: Send + Sync {
    async fn apply(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        event: &StoredEvent,
    ) -> EngineResult<()>;
}

/// Processor maintaining one view
pub struct ViewProcessor {
    id: ProcessorId,
    query: Query,
    store: EventStore,
    view_pool: PgPool,
    progress: ProgressStore,
    projector: Arc<dyn ViewProjector>,
}

impl ViewProcessor {
    pub fn new(
        subscription: &ViewSubscription,
        store: EventStore,
        view_pool: PgPool,
        progress: ProgressStore,
        projector: Arc<dyn ViewProjector>,
    ) -> Self {
        Self {
            id: ProcessorId::new(&subscription.view_name),
            query: subscription.filter_query(),
            store,
            view_pool,
            progress,
            projector,
        }
    }
}

#[async_trait]
impl EventProcessor for ViewProcessor {
    fn id(&self) -> &ProcessorId {
        &self.id
    }

    async fn fetch(
        &self,
        after_position: i64,
        batch_size: i64,
    ) -> EngineResult<Vec<StoredEvent>> {
        Ok(self
            .store
            .fetch_after(&self.query, after_position, batch_size)
            .await?)
    }

    /// Apply the batch and advance progress in one transaction
    async fn handle(&self, events: &[StoredEvent]) -> EngineResult<usize> {
        let Some(last_event) = events.last() else {
            return Ok(0);
        };

        let mut tx = self.view_pool.begin().await?;
        for event in events {
            self.projector.apply(&mut tx, event).await.map_err(|err| match err {
                EngineError::HandlerFailure { message, .. } => EngineError::HandlerFailure {
                    processor_id: Some(self.id.clone()),
                    message,
                },
                other => EngineError::handler_failure(&self.id, other.to_string()),
            })?;
        }
        self.progress
            .update_progress_in_tx(&mut tx, &self.id, last_event.position)
            .await?;
        tx.commit().await?;

        Ok(events.len())
    }
}

/// Build one worker per registered view
pub fn build_view_workers(
    store: &EventStore,
    view_pool: &PgPool,
    progress: &ProgressStore,
    leader: &Arc<LeaderElector>,
    metrics: &SharedMetrics,
    base: &ProcessorConfig,
    views: &[(ViewSubscription, Arc<dyn ViewProjector>)],
) -> Vec<Arc<ProcessorWorker>> {
    views
        .iter()
        .map(|(subscription, projector)| {
            let processor = ViewProcessor::new(
                subscription,
                store.clone(),
                view_pool.clone(),
                progress.clone(),
                Arc::clone(projector),
            );
            Arc::new(ProcessorWorker::new(
                Arc::new(processor),
                base.clone(),
                progress.clone(),
                Arc::clone(leader),
                Arc::clone(metrics),
            ))
        })
        .collect()
}
