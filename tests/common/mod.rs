//! Common test utilities

use std::sync::Arc;

use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;

use dcb_engine::clock::system_clock;
use dcb_engine::db::Pools;
use dcb_engine::event_store::EventStore;

/// Connect to the test database, or `None` when DATABASE_URL is unset so
/// the suite degrades to a skip instead of a failure.
pub async fn try_setup_test_db() -> Option<PgPool> {
    dotenvy::dotenv().ok();
    let database_url = match std::env::var("DATABASE_URL") {
        Ok(url) => url,
        Err(_) => {
            eprintln!("DATABASE_URL not set; skipping integration test");
            return None;
        }
    };

    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(&database_url)
        .await
        .expect("Failed to connect to DB");

    apply_schema(&pool).await;
    Some(pool)
}

/// Event store over the test pool with a small page size so paging paths
/// are exercised.
pub fn test_store(pool: &PgPool) -> EventStore {
    EventStore::new(Pools::new(pool.clone()), system_clock(), 2)
}

/// Unique suffix so concurrent tests never see each other's events.
pub fn unique_id(prefix: &str) -> String {
    format!("{prefix}-{}", uuid::Uuid::new_v4())
}

// Tests do not truncate shared tables; isolation comes from unique tags and
// processor ids. Schema application is serialized across test processes.
async fn apply_schema(pool: &PgPool) {
    let mut conn = pool.acquire().await.expect("Failed to acquire connection");

    sqlx::query("SELECT pg_advisory_lock(730041)")
        .execute(&mut *conn)
        .await
        .expect("Failed to take schema lock");

    let ddl = include_str!("../../migrations/0001_schema.sql");
    for statement in ddl.split(';') {
        let statement = statement.trim();
        if statement.is_empty() {
            continue;
        }
        sqlx::query(statement)
            .execute(&mut *conn)
            .await
            .unwrap_or_else(|e| panic!("Schema statement failed: {e}\n{statement}"));
    }

    sqlx::query("SELECT pg_advisory_unlock(730041)")
        .execute(&mut *conn)
        .await
        .expect("Failed to release schema lock");
}

/// Shared no-op metrics for worker construction.
pub fn noop_metrics() -> dcb_engine::metrics::SharedMetrics {
    Arc::new(dcb_engine::metrics::NoopMetrics)
}
