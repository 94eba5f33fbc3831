//! Command audit
//!
//! Optional record of every executed command, keyed by the transaction id
//! its events committed under.

use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, Transaction};

use super::Command;

/// Stored command audit row
#[derive(Debug, Clone)]
pub struct CommandRecord {
    pub transaction_id: i64,
    pub command_type: String,
    pub data: serde_json::Value,
    pub metadata: Option<serde_json::Value>,
    pub occurred_at: DateTime<Utc>,
}

/// Repository for command audit rows
#[derive(Debug, Clone)]
pub struct CommandAuditStore {
    pool: PgPool,
}

impl CommandAuditStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Insert the audit row inside the command's own transaction
    pub async fn record_in_tx(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        transaction_id: i64,
        command: &Command,
        occurred_at: DateTime<Utc>,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            INSERT INTO commands (transaction_id, command_type, data, metadata, occurred_at)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(transaction_id)
        .bind(&command.command_type)
        .bind(&command.data)
        .bind(&command.metadata)
        .bind(occurred_at)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    pub async fn get(&self, transaction_id: i64) -> Result<Option<CommandRecord>, sqlx::Error> {
        let row: Option<(
            i64,
            String,
            serde_json::Value,
            Option<serde_json::Value>,
            DateTime<Utc>,
        )> = sqlx::query_as(
            r#"
            SELECT transaction_id, command_type, data, metadata, occurred_at
            FROM commands
            WHERE transaction_id = $1
            "#,
        )
        .bind(transaction_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(
            |(transaction_id, command_type, data, metadata, occurred_at)| CommandRecord {
                transaction_id,
                command_type,
                data,
                metadata,
                occurred_at,
            },
        ))
    }
}
