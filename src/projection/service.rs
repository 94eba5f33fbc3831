//! Projection Service
//!
//! Streams events filtered by a query and folds them through declarative
//! projectors into state, returning the cursor of the last event seen.

use std::collections::BTreeSet;

use sqlx::{Postgres, Transaction};

use crate::event_store::{Cursor, EventStore, EventStoreError, Query, StoredEvent, Tag};

/// Declarative projector over a slice of the event stream
///
/// `event_types` empty means any type; `tags` are exact-match pairs, empty
/// means any tags. Deserialization of the payload is the transition's
/// concern, not the engine's.
pub struct StateProjector<S> {
    pub event_types: BTreeSet<String>,
    pub tags: Vec<Tag>,
    transition: Box<dyn Fn(S, &StoredEvent) -> S + Send + Sync>,
}

impl<S> StateProjector<S> {
    pub fn new<I, T, F>(event_types: I, tags: Vec<Tag>, transition: F) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
        F: Fn(S, &StoredEvent) -> S + Send + Sync + 'static,
    {
        Self {
            event_types: event_types.into_iter().map(Into::into).collect(),
            tags,
            transition: Box::new(transition),
        }
    }

    /// Projector accepting every event in the stream
    pub fn any<F>(transition: F) -> Self
    where
        F: Fn(S, &StoredEvent) -> S + Send + Sync + 'static,
    {
        Self::new(Vec::<String>::new(), Vec::new(), transition)
    }

    /// Whether this projector's declared filter accepts the event
    pub fn accepts(&self, event: &StoredEvent) -> bool {
        if !self.event_types.is_empty() && !self.event_types.contains(&event.event_type) {
            return false;
        }
        self.tags.iter().all(|tag| event.tags.contains(tag))
    }

    fn apply(&self, state: S, event: &StoredEvent) -> S {
        (self.transition)(state, event)
    }
}

/// Projection engine over the event store
#[derive(Clone)]
pub struct ProjectionService {
    store: EventStore,
}

impl ProjectionService {
    pub fn new(store: EventStore) -> Self {
        Self { store }
    }

    /// Fold all committed events matching `query` after `after` into state
    ///
    /// Events stream in `(transaction_id, position)` order, paged by the
    /// store's fetch size; for each event the first accepting projector
    /// runs. Returns the final state and the cursor of the last event seen,
    /// or `after` when nothing matched.
    pub async fn project<S>(
        &self,
        query: &Query,
        after: Cursor,
        initial: S,
        projectors: &[StateProjector<S>],
    ) -> Result<(S, Cursor), EventStoreError> {
        let limit = self.store.fetch_size();
        let mut state = initial;
        let mut cursor = after;

        loop {
            let page = self.store.read_page(query, cursor, limit).await?;
            let page_len = page.len() as i64;
            for event in &page {
                state = fold_event(state, event, projectors);
                cursor = event.cursor();
            }
            if page_len < limit {
                return Ok((state, cursor));
            }
        }
    }

    /// Same fold on the caller's transaction, for use inside command
    /// execution
    pub async fn project_in_tx<S>(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        query: &Query,
        after: Cursor,
        initial: S,
        projectors: &[StateProjector<S>],
    ) -> Result<(S, Cursor), EventStoreError> {
        let limit = self.store.fetch_size();
        let mut state = initial;
        let mut cursor = after;

        loop {
            let page = self.store.read_page_in_tx(tx, query, cursor, limit).await?;
            let page_len = page.len() as i64;
            for event in &page {
                state = fold_event(state, event, projectors);
                cursor = event.cursor();
            }
            if page_len < limit {
                return Ok((state, cursor));
            }
        }
    }
}

fn fold_event<S>(state: S, event: &StoredEvent, projectors: &[StateProjector<S>]) -> S {
    for projector in projectors {
        if projector.accepts(event) {
            return projector.apply(state, event);
        }
    }
    state
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn event(event_type: &str, tags: &[(&str, &str)], position: i64) -> StoredEvent {
        StoredEvent {
            event_type: event_type.to_string(),
            tags: tags.iter().map(|(k, v)| Tag::new(*k, *v)).collect(),
            data: Vec::new(),
            transaction_id: position,
            position,
            occurred_at: Utc::now(),
        }
    }

    #[test]
    fn test_projector_accepts_by_type_and_tags() {
        let projector: StateProjector<u32> = StateProjector::new(
            ["Deposited"],
            vec![Tag::new("wallet_id", "w-1")],
            |state, _| state,
        );
        assert!(projector.accepts(&event("Deposited", &[("wallet_id", "w-1")], 1)));
        assert!(!projector.accepts(&event("Withdrawn", &[("wallet_id", "w-1")], 1)));
        assert!(!projector.accepts(&event("Deposited", &[("wallet_id", "w-2")], 1)));
    }

    #[test]
    fn test_any_projector_accepts_everything() {
        let projector: StateProjector<u32> = StateProjector::any(|state, _| state + 1);
        assert!(projector.accepts(&event("X", &[], 1)));
    }

    #[test]
    fn test_fold_applies_first_accepting_projector_only() {
        let projectors = vec![
            StateProjector::new(["A"], vec![], |state: i64, _| state + 1),
            StateProjector::any(|state: i64, _| state + 100),
        ];

        // "A" hits the first projector, everything else falls through to the
        // catch-all.
        let state = fold_event(0, &event("A", &[], 1), &projectors);
        assert_eq!(state, 1);
        let state = fold_event(state, &event("B", &[], 2), &projectors);
        assert_eq!(state, 101);
    }

    #[test]
    fn test_fold_skips_unmatched_events() {
        let projectors = vec![StateProjector::new(["A"], vec![], |state: i64, _| {
            state + 1
        })];
        let state = fold_event(7, &event("B", &[], 1), &projectors);
        assert_eq!(state, 7);
    }
}
