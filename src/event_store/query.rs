//! Query model
//!
//! Tag/type predicates over the log and their SQL compilation. An event
//! matches a `Query` iff it matches at least one `QueryItem`; inside an item
//! every predicate must hold.

use std::collections::BTreeSet;

use super::event::{validate_event_type, StoredEvent, Tag};
use super::EventStoreError;

/// One condition over an event's tags
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TagPredicate {
    /// Some tag has this key
    KeyPresent(String),
    /// Some tag has a key in this set
    AnyOfKeys(Vec<String>),
    /// Some tag equals this `(key, value)` pair
    Exact(Tag),
}

impl TagPredicate {
    fn validate(&self) -> Result<(), EventStoreError> {
        let check_key = |key: &str| -> Result<(), EventStoreError> {
            if key.is_empty() || !key.is_ascii() || key.contains('=') {
                return Err(EventStoreError::InvalidInput(format!(
                    "malformed predicate key '{key}'"
                )));
            }
            Ok(())
        };
        match self {
            TagPredicate::KeyPresent(key) => check_key(key),
            TagPredicate::AnyOfKeys(keys) => {
                if keys.is_empty() {
                    return Err(EventStoreError::InvalidInput(
                        "empty key set in predicate".into(),
                    ));
                }
                keys.iter().try_for_each(|k| check_key(k))
            }
            TagPredicate::Exact(tag) => tag.validate(),
        }
    }

    fn matches(&self, tags: &[Tag]) -> bool {
        match self {
            TagPredicate::KeyPresent(key) => tags.iter().any(|t| &t.key == key),
            TagPredicate::AnyOfKeys(keys) => tags.iter().any(|t| keys.contains(&t.key)),
            TagPredicate::Exact(tag) => tags.contains(tag),
        }
    }
}

/// Conjunction of an event-type filter and tag predicates
///
/// An empty `event_types` set matches any type.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct QueryItem {
    pub event_types: BTreeSet<String>,
    pub predicates: Vec<TagPredicate>,
}

impl QueryItem {
    /// Item constrained by event types and exact tag pairs
    pub fn of_types_and_tags<I, T>(event_types: I, tags: Vec<Tag>) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        Self {
            event_types: event_types.into_iter().map(Into::into).collect(),
            predicates: tags.into_iter().map(TagPredicate::Exact).collect(),
        }
    }

    /// Item matching any type, constrained by tag predicates only
    pub fn of_predicates(predicates: Vec<TagPredicate>) -> Self {
        Self {
            event_types: BTreeSet::new(),
            predicates,
        }
    }

    pub fn validate(&self) -> Result<(), EventStoreError> {
        for event_type in &self.event_types {
            validate_event_type(event_type)?;
        }
        self.predicates.iter().try_for_each(|p| p.validate())
    }

    pub fn matches(&self, event: &StoredEvent) -> bool {
        if !self.event_types.is_empty() && !self.event_types.contains(&event.event_type) {
            return false;
        }
        self.predicates.iter().all(|p| p.matches(&event.tags))
    }
}

/// Disjunction of query items; the empty query matches nothing
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Query {
    pub items: Vec<QueryItem>,
}

impl Query {
    pub fn new(items: Vec<QueryItem>) -> Self {
        Self { items }
    }

    /// Query with a single item
    pub fn single(item: QueryItem) -> Self {
        Self { items: vec![item] }
    }

    /// Shorthand for one item of event types + exact tags
    pub fn of_types_and_tags<I, T>(event_types: I, tags: Vec<Tag>) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        Self::single(QueryItem::of_types_and_tags(event_types, tags))
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn validate(&self) -> Result<(), EventStoreError> {
        self.items.iter().try_for_each(|item| item.validate())
    }

    pub fn matches(&self, event: &StoredEvent) -> bool {
        self.items.iter().any(|item| item.matches(event))
    }

    /// Every `Exact` pair mentioned anywhere in the query
    pub(crate) fn exact_tags(&self) -> Vec<&Tag> {
        self.items
            .iter()
            .flat_map(|item| &item.predicates)
            .filter_map(|p| match p {
                TagPredicate::Exact(tag) => Some(tag),
                _ => None,
            })
            .collect()
    }

    /// Compile to a SQL boolean expression over the `events` table
    ///
    /// Placeholders start at `first_placeholder`; the produced args must be
    /// bound in order after any args already occupying lower positions.
    pub(crate) fn to_sql(&self, first_placeholder: usize) -> QuerySql {
        if self.items.is_empty() {
            return QuerySql {
                clause: "FALSE".to_string(),
                args: Vec::new(),
            };
        }

        let mut args = Vec::new();
        let mut next = first_placeholder;
        let mut item_clauses = Vec::with_capacity(self.items.len());

        for item in &self.items {
            let mut conjuncts = Vec::new();

            if !item.event_types.is_empty() {
                conjuncts.push(format!("event_type = ANY(${next})"));
                args.push(SqlArg::TextArray(
                    item.event_types.iter().cloned().collect(),
                ));
                next += 1;
            }

            for predicate in &item.predicates {
                match predicate {
                    TagPredicate::Exact(tag) => {
                        conjuncts.push(format!("tags @> ${next}"));
                        args.push(SqlArg::TextArray(vec![tag.encode()]));
                        next += 1;
                    }
                    TagPredicate::KeyPresent(key) => {
                        conjuncts.push(format!(
                            "EXISTS (SELECT 1 FROM unnest(tags) AS t(tag) \
                             WHERE split_part(t.tag, '=', 1) = ${next})"
                        ));
                        args.push(SqlArg::Text(key.clone()));
                        next += 1;
                    }
                    TagPredicate::AnyOfKeys(keys) => {
                        conjuncts.push(format!(
                            "EXISTS (SELECT 1 FROM unnest(tags) AS t(tag) \
                             WHERE split_part(t.tag, '=', 1) = ANY(${next}))"
                        ));
                        args.push(SqlArg::TextArray(keys.clone()));
                        next += 1;
                    }
                }
            }

            if conjuncts.is_empty() {
                // Unconstrained item matches every event
                item_clauses.push("TRUE".to_string());
            } else {
                item_clauses.push(format!("({})", conjuncts.join(" AND ")));
            }
        }

        QuerySql {
            clause: format!("({})", item_clauses.join(" OR ")),
            args,
        }
    }
}

/// Compiled query fragment with its positional args
#[derive(Debug, Clone)]
pub(crate) struct QuerySql {
    pub clause: String,
    pub args: Vec<SqlArg>,
}

/// Bindable argument produced by query compilation
#[derive(Debug, Clone)]
pub(crate) enum SqlArg {
    Text(String),
    TextArray(Vec<String>),
    BigInt(i64),
}

/// Bind compiled args onto a sqlx query in order
pub(crate) fn bind_args<'q>(
    mut query: sqlx::query::Query<'q, sqlx::Postgres, sqlx::postgres::PgArguments>,
    args: &'q [SqlArg],
) -> sqlx::query::Query<'q, sqlx::Postgres, sqlx::postgres::PgArguments> {
    for arg in args {
        query = match arg {
            SqlArg::Text(s) => query.bind(s),
            SqlArg::TextArray(v) => query.bind(v),
            SqlArg::BigInt(n) => query.bind(n),
        };
    }
    query
}

/// Bind compiled args onto a sqlx scalar query in order
pub(crate) fn bind_scalar_args<'q, O>(
    mut query: sqlx::query::QueryScalar<'q, sqlx::Postgres, O, sqlx::postgres::PgArguments>,
    args: &'q [SqlArg],
) -> sqlx::query::QueryScalar<'q, sqlx::Postgres, O, sqlx::postgres::PgArguments> {
    for arg in args {
        query = match arg {
            SqlArg::Text(s) => query.bind(s),
            SqlArg::TextArray(v) => query.bind(v),
            SqlArg::BigInt(n) => query.bind(n),
        };
    }
    query
}
