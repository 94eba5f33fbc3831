//! Outbox Adapter
//!
//! Binds the generic processor framework to `(topic, publisher)` pairs.
//! Each pair owns an independent progress row; the publish callback is the
//! boundary to Kafka, webhooks, or whatever sits behind it. Publish and
//! progress advance are deliberately not transactional, which is where the
//! at-least-once guarantee comes from.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::{EngineError, EngineResult};
use crate::event_store::{EventStore, Query, QueryItem, StoredEvent, Tag, TagPredicate};
use crate::metrics::SharedMetrics;
use crate::processor::{
    EventProcessor, LeaderElector, ProcessorConfig, ProcessorId, ProcessorWorker, ProgressStore,
};

/// Per-topic filter and publisher fan-out
#[derive(Debug, Clone, Default, serde::Deserialize)]
pub struct TopicConfig {
    /// Keys that must all be present on an event
    #[serde(default)]
    pub required_tags: Vec<String>,
    /// Keys of which at least one must be present
    #[serde(default)]
    pub any_of_tags: Vec<String>,
    /// Exact `(key, value)` pairs that must all be present
    #[serde(default)]
    pub exact_tags: BTreeMap<String, String>,
    /// Publisher names; one processor per name
    #[serde(default)]
    pub publishers: Vec<String>,
    /// Per-publisher scheduling overrides
    #[serde(default)]
    pub publisher_overrides: BTreeMap<String, PublisherOverride>,
}

impl TopicConfig {
    /// The topic filter as a log query: conjunction of the three tag rules
    pub fn filter_query(&self) -> Query {
        let mut predicates = Vec::new();
        for key in &self.required_tags {
            predicates.push(TagPredicate::KeyPresent(key.clone()));
        }
        if !self.any_of_tags.is_empty() {
            predicates.push(TagPredicate::AnyOfKeys(self.any_of_tags.clone()));
        }
        for (key, value) in &self.exact_tags {
            predicates.push(TagPredicate::Exact(Tag::new(key, value)));
        }
        Query::single(QueryItem::of_predicates(predicates))
    }

    fn config_for(&self, publisher: &str, base: &ProcessorConfig) -> ProcessorConfig {
        match self.publisher_overrides.get(publisher) {
            Some(overrides) => overrides.apply(base),
            None => base.clone(),
        }
    }
}

/// Scheduling overrides for one publisher of a topic
#[derive(Debug, Clone, Default, serde::Deserialize)]
pub struct PublisherOverride {
    pub polling_interval_ms: Option<u64>,
    pub batch_size: Option<i64>,
    pub enabled: Option<bool>,
}

impl PublisherOverride {
    pub fn apply(&self, base: &ProcessorConfig) -> ProcessorConfig {
        let mut config = base.clone();
        if let Some(ms) = self.polling_interval_ms {
            config.polling_interval = Duration::from_millis(ms);
        }
        if let Some(batch_size) = self.batch_size {
            config.batch_size = batch_size;
        }
        if let Some(enabled) = self.enabled {
            config.enabled = enabled;
        }
        config
    }
}

/// Boundary to the external sink
///
/// Implementations should be idempotent: the same batch may arrive again
/// after a crash between publish and progress advance. Failures surface as
/// `EngineError::HandlerFailure` and count against the processor's error
/// threshold.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish(&self, topic: &str, events: &[StoredEvent]) -> EngineResult<()>;
}

/// Publisher that logs each batch; a stand-in until a real sink is wired
#[derive(Debug, Clone, Default)]
pub struct TracingPublisher;

#[async_trait]
impl EventPublisher for TracingPublisher {
    async fn publish(&self, topic: &str, events: &[StoredEvent]) -> EngineResult<()> {
        for event in events {
            tracing::info!(
                topic,
                event_type = %event.event_type,
                position = event.position,
                "publishing event"
            );
        }
        Ok(())
    }
}

/// Processor delivering one topic's events to one publisher
pub struct OutboxProcessor {
    id: ProcessorId,
    topic: String,
    query: Query,
    store: EventStore,
    publisher: Arc<dyn EventPublisher>,
}

impl OutboxProcessor {
    pub fn new(
        topic: impl Into<String>,
        publisher_name: &str,
        config: &TopicConfig,
        store: EventStore,
        publisher: Arc<dyn EventPublisher>,
    ) -> Self {
        let topic = topic.into();
        Self {
            id: ProcessorId::for_topic_publisher(&topic, publisher_name),
            query: config.filter_query(),
            topic,
            store,
            publisher,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }
}

#[async_trait]
impl EventProcessor for OutboxProcessor {
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

    async fn handle(&self, events: &[StoredEvent]) -> EngineResult<usize> {
        self.publisher
            .publish(&self.topic, events)
            .await
            .map_err(|err| match err {
                EngineError::HandlerFailure { message, .. } => EngineError::HandlerFailure {
                    processor_id: Some(self.id.clone()),
                    message,
                },
                other => EngineError::handler_failure(&self.id, other.to_string()),
            })?;
        Ok(events.len())
    }
}

/// Build one worker per `(topic, publisher)` pair
pub fn build_outbox_workers(
    store: &EventStore,
    progress: &ProgressStore,
    leader: &Arc<LeaderElector>,
    metrics: &SharedMetrics,
    base: &ProcessorConfig,
    topics: &BTreeMap<String, TopicConfig>,
    publishers: &HashMap<String, Arc<dyn EventPublisher>>,
) -> EngineResult<Vec<Arc<ProcessorWorker>>> {
    let mut workers = Vec::new();
    for (topic, topic_config) in topics {
        for publisher_name in &topic_config.publishers {
            let publisher = publishers.get(publisher_name).ok_or_else(|| {
                EngineError::InvalidInput(format!(
                    "no publisher '{publisher_name}' registered for topic '{topic}'"
                ))
            })?;
            let processor = OutboxProcessor::new(
                topic.clone(),
                publisher_name,
                topic_config,
                store.clone(),
                Arc::clone(publisher),
            );
            workers.push(Arc::new(ProcessorWorker::new(
                Arc::new(processor),
                topic_config.config_for(publisher_name, base),
                progress.clone(),
                Arc::clone(leader),
                Arc::clone(metrics),
            )));
        }
    }
    Ok(workers)
}
