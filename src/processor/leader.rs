//! Leader election
//!
//! One process-global Postgres advisory lock decides which instance runs
//! processor cycles. The lock is session-scoped and held on a dedicated
//! pooled connection for the whole lease; losing that connection loses the
//! lease. Followers re-probe on a retry scheduler and opportunistically on
//! worker ticks behind a cooldown.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use sqlx::pool::PoolConnection;
use sqlx::{PgPool, Postgres};
use tokio::sync::Mutex;

use crate::clock::InstanceId;
use crate::metrics::{MetricEvent, SharedMetrics};

/// Global advisory-lock key shared by every instance of the engine
pub const LEADER_LOCK_KEY: i64 = 0x6463_625f_6c64_7231;

struct Inner {
    conn: Option<PoolConnection<Postgres>>,
    last_attempt: Option<Instant>,
}

/// Process-global leader elector
pub struct LeaderElector {
    pool: PgPool,
    instance_id: InstanceId,
    lock_key: i64,
    cooldown: Duration,
    metrics: SharedMetrics,
    is_leader: AtomicBool,
    inner: Mutex<Inner>,
}

impl LeaderElector {
    pub fn new(
        pool: PgPool,
        instance_id: InstanceId,
        cooldown: Duration,
        metrics: SharedMetrics,
    ) -> Self {
        Self {
            pool,
            instance_id,
            lock_key: LEADER_LOCK_KEY,
            cooldown,
            metrics,
            is_leader: AtomicBool::new(false),
            inner: Mutex::new(Inner {
                conn: None,
                last_attempt: None,
            }),
        }
    }

    /// Distinct lock key, for tests running side by side on one database
    pub fn with_lock_key(mut self, lock_key: i64) -> Self {
        self.lock_key = lock_key;
        self
    }

    pub fn instance_id(&self) -> &InstanceId {
        &self.instance_id
    }

    /// Whether this instance currently believes it holds the lease
    pub fn is_leader(&self) -> bool {
        self.is_leader.load(Ordering::SeqCst)
    }

    /// Attempt to acquire (or verify) the lease, ignoring the cooldown
    pub async fn try_acquire(&self) -> Result<bool, sqlx::Error> {
        let mut inner = self.inner.lock().await;
        inner.last_attempt = Some(Instant::now());
        self.acquire_locked(&mut inner).await
    }

    /// Tick-time probe: verifies a held lease, otherwise retries behind the
    /// cooldown so concurrent ticks do not storm the lock
    pub async fn maybe_acquire(&self) -> Result<bool, sqlx::Error> {
        let mut inner = self.inner.lock().await;
        if inner.conn.is_none() {
            if let Some(last) = inner.last_attempt {
                if last.elapsed() < self.cooldown {
                    return Ok(false);
                }
            }
        }
        inner.last_attempt = Some(Instant::now());
        self.acquire_locked(&mut inner).await
    }

    async fn acquire_locked(&self, inner: &mut Inner) -> Result<bool, sqlx::Error> {
        if let Some(conn) = inner.conn.as_mut() {
            // The lease lives and dies with this connection.
            match sqlx::query("SELECT 1").execute(&mut **conn).await {
                Ok(_) => return Ok(true),
                Err(err) => {
                    tracing::warn!(error = %err, instance = %self.instance_id, "leader connection lost");
                    inner.conn = None;
                    self.is_leader.store(false, Ordering::SeqCst);
                    self.metrics.observe(&MetricEvent::LeaderLost {
                        instance: self.instance_id.to_string(),
                    });
                }
            }
        }

        let mut conn = self.pool.acquire().await?;
        let acquired: bool = sqlx::query_scalar("SELECT pg_try_advisory_lock($1)")
            .bind(self.lock_key)
            .fetch_one(&mut *conn)
            .await?;

        if acquired {
            inner.conn = Some(conn);
            self.is_leader.store(true, Ordering::SeqCst);
            tracing::info!(instance = %self.instance_id, "became leader");
            self.metrics.observe(&MetricEvent::LeaderAcquired {
                instance: self.instance_id.to_string(),
            });
        }
        Ok(acquired)
    }

    /// Release the lease on graceful shutdown
    pub async fn release(&self) {
        let mut inner = self.inner.lock().await;
        if let Some(mut conn) = inner.conn.take() {
            if let Err(err) = sqlx::query("SELECT pg_advisory_unlock($1)")
                .bind(self.lock_key)
                .execute(&mut *conn)
                .await
            {
                tracing::warn!(error = %err, "advisory unlock failed; dropping connection");
            }
            self.is_leader.store(false, Ordering::SeqCst);
            self.metrics.observe(&MetricEvent::LeaderReleased {
                instance: self.instance_id.to_string(),
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::NoopMetrics;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_elector_starts_as_follower() {
        let pool = PgPool::connect_lazy("postgresql://localhost/unused").unwrap();
        let elector = LeaderElector::new(
            pool,
            InstanceId::from_name("i-1"),
            Duration::from_secs(5),
            Arc::new(NoopMetrics),
        );
        assert!(!elector.is_leader());
        assert_eq!(elector.instance_id().as_str(), "i-1");
    }
}
