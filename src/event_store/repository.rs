//! Event Store Repository
//!
//! Append-only log persistence with conditional appends. A batch commits
//! only if no committed event past the condition's cursor matches the
//! failure predicate and no committed event anywhere matches the idempotency
//! predicate; concurrent attempts for the same logical operation are
//! serialized by a transaction-scoped advisory lock.

use sha2::{Digest, Sha256};
use sqlx::{PgPool, Postgres, Transaction};

use crate::clock::SharedClock;
use crate::config::TransactionIsolation;
use crate::db::Pools;

use super::event::{AppendEvent, Cursor, StoredEvent};
use super::query::{bind_args, bind_scalar_args, Query, SqlArg};
use super::EventStoreError;

/// Condition under which a batch may be appended
#[derive(Debug, Clone, Default)]
pub struct AppendCondition {
    /// Matching committed events with `position > after.position` fail the append
    pub fail_if_events_match: Query,
    /// Cursor delimiting the already-observed log prefix
    pub after: Cursor,
    /// Matching committed events anywhere in the log mark the operation as a duplicate
    pub idempotency: Option<Query>,
}

impl AppendCondition {
    pub fn new(fail_if_events_match: Query, after: Cursor) -> Self {
        Self {
            fail_if_events_match,
            after,
            idempotency: None,
        }
    }

    pub fn with_idempotency(mut self, idempotency: Query) -> Self {
        self.idempotency = Some(idempotency);
        self
    }

    /// Unconditional append
    pub fn none() -> Self {
        Self::default()
    }

    fn validate(&self) -> Result<(), EventStoreError> {
        self.fail_if_events_match.validate()?;
        if let Some(idempotency) = &self.idempotency {
            idempotency.validate()?;
            if idempotency.is_empty() {
                return Err(EventStoreError::InvalidInput(
                    "empty idempotency query".into(),
                ));
            }
        }
        Ok(())
    }
}

/// Result of a conditional append
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppendOutcome {
    /// All events committed under this transaction id
    Appended { transaction_id: i64 },
    /// A committed event past the cursor matched `fail_if_events_match`
    ConcurrencyViolation,
    /// A committed event matched the idempotency predicate
    IdempotencyViolation,
}

impl AppendOutcome {
    pub fn is_appended(&self) -> bool {
        matches!(self, AppendOutcome::Appended { .. })
    }
}

/// Event Store over the append-only log
///
/// Appends always hit the primary pool; reads go to the replica pool when
/// one is configured.
#[derive(Clone)]
pub struct EventStore {
    pools: Pools,
    clock: SharedClock,
    fetch_size: i64,
    isolation: TransactionIsolation,
}

impl EventStore {
    pub fn new(pools: Pools, clock: SharedClock, fetch_size: i64) -> Self {
        Self {
            pools,
            clock,
            fetch_size,
            isolation: TransactionIsolation::default(),
        }
    }

    /// Raise the isolation level of append transactions above the READ
    /// COMMITTED floor
    pub fn with_isolation(mut self, isolation: TransactionIsolation) -> Self {
        self.isolation = isolation;
        self
    }

    pub fn fetch_size(&self) -> i64 {
        self.fetch_size
    }

    /// Pool serving reads (replica when configured)
    pub fn read_pool(&self) -> &PgPool {
        self.pools.reads()
    }

    /// Open a transaction on the primary for a command execution
    pub async fn begin(&self) -> Result<Transaction<'static, Postgres>, EventStoreError> {
        let mut tx = self.pools.primary().begin().await?;
        if self.isolation != TransactionIsolation::ReadCommitted {
            let sql = format!(
                "SET TRANSACTION ISOLATION LEVEL {}",
                self.isolation.as_sql()
            );
            sqlx::query(&sql).execute(&mut *tx).await?;
        }
        Ok(tx)
    }

    // =========================================================================
    // Conditional append
    // =========================================================================

    /// Append a batch under a condition in its own transaction
    pub async fn append_if(
        &self,
        batch: &[AppendEvent],
        condition: &AppendCondition,
    ) -> Result<AppendOutcome, EventStoreError> {
        let mut tx = self.begin().await?;
        let outcome = self.append_if_in_tx(&mut tx, batch, condition).await?;
        match outcome {
            AppendOutcome::Appended { .. } => tx.commit().await?,
            _ => tx.rollback().await?,
        }
        Ok(outcome)
    }

    /// Append a batch under a condition inside the caller's transaction
    ///
    /// The caller owns the commit; a violation outcome leaves the
    /// transaction usable but nothing staged.
    pub async fn append_if_in_tx(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        batch: &[AppendEvent],
        condition: &AppendCondition,
    ) -> Result<AppendOutcome, EventStoreError> {
        if batch.is_empty() {
            return Err(EventStoreError::InvalidInput("empty batch".into()));
        }
        for event in batch {
            event.validate()?;
        }
        condition.validate()?;

        if let Some(idempotency) = &condition.idempotency {
            // Serialize concurrent attempts for the same logical operation.
            // The lock is released at commit or rollback.
            let key = idempotency_lock_key(idempotency);
            sqlx::query("SELECT pg_advisory_xact_lock($1)")
                .bind(key)
                .execute(&mut **tx)
                .await?;

            // Whole-log scope: a duplicate committed by a concurrent writer
            // must be visible here, so this is a plain statement-snapshot
            // read taken after the lock was granted.
            let compiled = idempotency.to_sql(1);
            let sql = format!(
                "SELECT EXISTS (SELECT 1 FROM events WHERE {})",
                compiled.clause
            );
            let duplicate: bool = bind_scalar_args(sqlx::query_scalar(&sql), &compiled.args)
                .fetch_one(&mut **tx)
                .await?;
            if duplicate {
                return Ok(AppendOutcome::IdempotencyViolation);
            }
        }

        if !condition.fail_if_events_match.is_empty() {
            // All committed events count, with no snapshot-visibility filter;
            // restricting to this transaction's snapshot would mask
            // concurrent writers.
            let compiled = condition.fail_if_events_match.to_sql(2);
            let sql = format!(
                "SELECT EXISTS (SELECT 1 FROM events WHERE position > $1 AND {})",
                compiled.clause
            );
            let mut args = vec![SqlArg::BigInt(condition.after.position)];
            args.extend(compiled.args);
            let conflict: bool = bind_scalar_args(sqlx::query_scalar(&sql), &args)
                .fetch_one(&mut **tx)
                .await?;
            if conflict {
                return Ok(AppendOutcome::ConcurrencyViolation);
            }
        }

        let transaction_id = self.insert_batch(tx, batch).await?;
        Ok(AppendOutcome::Appended { transaction_id })
    }

    async fn insert_batch(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        batch: &[AppendEvent],
    ) -> Result<i64, EventStoreError> {
        // One id per append call; every event of the batch shares it.
        let transaction_id: i64 =
            sqlx::query_scalar("SELECT pg_current_xact_id()::text::bigint")
                .fetch_one(&mut **tx)
                .await?;

        let occurred_at = self.clock.now();

        for event in batch {
            sqlx::query(
                r#"
                INSERT INTO events (transaction_id, event_type, tags, data, occurred_at)
                VALUES ($1, $2, $3, $4, $5)
                "#,
            )
            .bind(transaction_id)
            .bind(&event.event_type)
            .bind(event.encoded_tags())
            .bind(&event.data)
            .bind(occurred_at)
            .execute(&mut **tx)
            .await?;
        }

        tracing::debug!(
            transaction_id,
            batch_size = batch.len(),
            "Appended event batch"
        );

        Ok(transaction_id)
    }

    // =========================================================================
    // Reads
    // =========================================================================

    /// One keyset page of committed events matching `query` strictly after
    /// `after`, in `(transaction_id, position)` order
    pub async fn read_page(
        &self,
        query: &Query,
        after: Cursor,
        limit: i64,
    ) -> Result<Vec<StoredEvent>, EventStoreError> {
        self.read_page_on(self.pools.reads(), query, after, limit)
            .await
    }

    /// Same as `read_page`, but on the caller's transaction
    pub async fn read_page_in_tx(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        query: &Query,
        after: Cursor,
        limit: i64,
    ) -> Result<Vec<StoredEvent>, EventStoreError> {
        let compiled = query.to_sql(3);
        let sql = page_sql(&compiled.clause);
        let mut args = vec![
            SqlArg::BigInt(after.transaction_id),
            SqlArg::BigInt(after.position),
        ];
        args.extend(compiled.args);
        args.push(SqlArg::BigInt(limit));
        let rows = bind_args(sqlx::query(&sql), &args)
            .fetch_all(&mut **tx)
            .await?;
        rows_into_events(rows)
    }

    async fn read_page_on(
        &self,
        pool: &PgPool,
        query: &Query,
        after: Cursor,
        limit: i64,
    ) -> Result<Vec<StoredEvent>, EventStoreError> {
        let compiled = query.to_sql(3);
        let sql = page_sql(&compiled.clause);
        let mut args = vec![
            SqlArg::BigInt(after.transaction_id),
            SqlArg::BigInt(after.position),
        ];
        args.extend(compiled.args);
        args.push(SqlArg::BigInt(limit));
        let rows = bind_args(sqlx::query(&sql), &args).fetch_all(pool).await?;
        rows_into_events(rows)
    }

    /// Committed events matching `query` with `position > after_position`,
    /// ascending by position, at most `limit` rows
    ///
    /// This is the processor-facing fetch: progress tracks positions, so the
    /// page is keyed and ordered by position alone.
    pub async fn fetch_after(
        &self,
        query: &Query,
        after_position: i64,
        limit: i64,
    ) -> Result<Vec<StoredEvent>, EventStoreError> {
        let compiled = query.to_sql(2);
        let sql = format!(
            r#"
            SELECT event_type, tags, data, transaction_id, position, occurred_at
            FROM events
            WHERE position > $1 AND {}
            ORDER BY position ASC
            LIMIT ${}
            "#,
            compiled.clause,
            2 + compiled.args.len()
        );
        let mut args = vec![SqlArg::BigInt(after_position)];
        args.extend(compiled.args);
        args.push(SqlArg::BigInt(limit));
        let rows = bind_args(sqlx::query(&sql), &args)
            .fetch_all(self.pools.reads())
            .await?;
        rows_into_events(rows)
    }

    /// Highest committed position, 0 on an empty log
    pub async fn head_position(&self) -> Result<i64, EventStoreError> {
        let head: Option<i64> = sqlx::query_scalar("SELECT MAX(position) FROM events")
            .fetch_one(self.pools.reads())
            .await?;
        Ok(head.unwrap_or(0))
    }

    /// Cursor of the latest committed event, origin on an empty log
    pub async fn latest_cursor(&self) -> Result<Cursor, EventStoreError> {
        let row: Option<(i64, i64)> = sqlx::query_as(
            "SELECT position, transaction_id FROM events ORDER BY position DESC LIMIT 1",
        )
        .fetch_optional(self.pools.reads())
        .await?;
        Ok(row
            .map(|(position, transaction_id)| Cursor::new(position, transaction_id))
            .unwrap_or_default())
    }
}

fn page_sql(clause: &str) -> String {
    format!(
        r#"
        SELECT event_type, tags, data, transaction_id, position, occurred_at
        FROM events
        WHERE (transaction_id, position) > ($1, $2) AND {clause}
        ORDER BY transaction_id ASC, position ASC
        LIMIT ${}
        "#,
        3 + count_placeholders(clause)
    )
}

fn count_placeholders(clause: &str) -> usize {
    // Compiled clauses start binding at $3 and number sequentially.
    clause.matches('$').count()
}

fn rows_into_events(
    rows: Vec<sqlx::postgres::PgRow>,
) -> Result<Vec<StoredEvent>, EventStoreError> {
    use sqlx::Row;
    rows.into_iter()
        .map(|row| {
            StoredEvent::from_row(
                row.try_get("event_type")?,
                row.try_get("tags")?,
                row.try_get("data")?,
                row.try_get("transaction_id")?,
                row.try_get("position")?,
                row.try_get("occurred_at")?,
            )
        })
        .collect()
}

// =========================================================================
// Advisory-lock key derivation
// =========================================================================

/// Deterministic 64-bit lock key for an idempotency predicate
///
/// The exact-match pairs are sorted by `(key, value)` so two equivalent
/// predicates derive the same key regardless of tag insertion order.
pub fn idempotency_lock_key(query: &Query) -> i64 {
    let mut pairs: Vec<String> = query
        .exact_tags()
        .into_iter()
        .map(|tag| format!("{}:{}", tag.key, tag.value))
        .collect();
    pairs.sort();
    let joined = pairs.join(",");

    let digest = Sha256::digest(joined.as_bytes());
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    i64::from_be_bytes(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_store::event::Tag;
    use crate::event_store::query::QueryItem;

    #[test]
    fn test_lock_key_ignores_tag_order() {
        let a = Query::of_types_and_tags(["X"], vec![Tag::new("op", "42"), Tag::new("w", "1")]);
        let b = Query::of_types_and_tags(["X"], vec![Tag::new("w", "1"), Tag::new("op", "42")]);
        assert_eq!(idempotency_lock_key(&a), idempotency_lock_key(&b));
    }

    #[test]
    fn test_lock_key_differs_for_different_pairs() {
        let a = Query::of_types_and_tags(["X"], vec![Tag::new("op", "42")]);
        let b = Query::of_types_and_tags(["X"], vec![Tag::new("op", "43")]);
        assert_ne!(idempotency_lock_key(&a), idempotency_lock_key(&b));
    }

    #[test]
    fn test_lock_key_spans_all_items() {
        let single = Query::of_types_and_tags(["X"], vec![Tag::new("op", "42")]);
        let multi = Query::new(vec![
            QueryItem::of_types_and_tags(["X"], vec![Tag::new("op", "42")]),
            QueryItem::of_types_and_tags(["Y"], vec![Tag::new("op", "43")]),
        ]);
        assert_ne!(idempotency_lock_key(&single), idempotency_lock_key(&multi));
    }

    #[test]
    fn test_append_condition_validation() {
        let ok = AppendCondition::new(
            Query::of_types_and_tags(["A"], vec![Tag::new("w", "1")]),
            Cursor::origin(),
        );
        assert!(ok.validate().is_ok());

        let empty_idempotency =
            AppendCondition::none().with_idempotency(Query::default());
        assert!(empty_idempotency.validate().is_err());
    }

    #[test]
    fn test_append_outcome_is_appended() {
        assert!(AppendOutcome::Appended { transaction_id: 9 }.is_appended());
        assert!(!AppendOutcome::ConcurrencyViolation.is_appended());
        assert!(!AppendOutcome::IdempotencyViolation.is_appended());
    }
}
