//! Database module
//!
//! Pool construction, read-replica routing, and schema verification.
//! Schema DDL lives in raw SQL files under migrations/.

use std::str::FromStr;

use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use sqlx::PgPool;

use crate::config::Config;

/// Primary and optional replica pools
///
/// Appends always use the primary; projections and processor fetches use
/// the replica when one is configured.
#[derive(Debug, Clone)]
pub struct Pools {
    primary: PgPool,
    replica: Option<PgPool>,
}

impl Pools {
    pub fn new(primary: PgPool) -> Self {
        Self {
            primary,
            replica: None,
        }
    }

    pub fn with_replica(primary: PgPool, replica: PgPool) -> Self {
        Self {
            primary,
            replica: Some(replica),
        }
    }

    pub fn primary(&self) -> &PgPool {
        &self.primary
    }

    /// Pool serving reads
    pub fn reads(&self) -> &PgPool {
        self.replica.as_ref().unwrap_or(&self.primary)
    }

    pub fn has_replica(&self) -> bool {
        self.replica.is_some()
    }

    pub async fn close(&self) {
        self.primary.close().await;
        if let Some(replica) = &self.replica {
            replica.close().await;
        }
    }
}

/// Connect the primary (and replica, when enabled) pools
pub async fn connect(config: &Config) -> Result<Pools, sqlx::Error> {
    let primary = PgPoolOptions::new()
        .max_connections(config.database_max_connections)
        .connect(&config.database_url)
        .await?;

    if !config.read_replicas.enabled {
        return Ok(Pools::new(primary));
    }

    let replica_url = config
        .read_replicas
        .url
        .as_deref()
        .unwrap_or(&config.database_url);
    let mut options = PgConnectOptions::from_str(replica_url)?;
    if let Some(user) = &config.read_replicas.user {
        options = options.username(user);
    }
    if let Some(pass) = &config.read_replicas.pass {
        options = options.password(pass);
    }

    let replica = PgPoolOptions::new()
        .max_connections(config.read_replicas.pool_max)
        .min_connections(config.read_replicas.pool_min)
        .connect_with(options)
        .await?;

    tracing::info!("read replica pool connected");
    Ok(Pools::with_replica(primary, replica))
}

/// Simple connectivity check
pub async fn verify_connection(pool: &PgPool) -> Result<(), sqlx::Error> {
    sqlx::query("SELECT 1").execute(pool).await?;
    Ok(())
}

/// Check if required tables exist
pub async fn check_schema(pool: &PgPool) -> Result<bool, sqlx::Error> {
    let required_tables = vec!["events", "commands", "outbox_progress", "view_progress"];

    for table in required_tables {
        let exists: bool = sqlx::query_scalar(
            r#"
            SELECT EXISTS (
                SELECT 1 FROM information_schema.tables
                WHERE table_schema = 'public' AND table_name = $1
            )
            "#,
        )
        .bind(table)
        .fetch_one(pool)
        .await?;

        if !exists {
            tracing::error!("Required table '{}' does not exist", table);
            return Ok(false);
        }
    }

    Ok(true)
}
