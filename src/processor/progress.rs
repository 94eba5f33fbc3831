//! Processor progress tracking
//!
//! One row per processor identity, instantiated per subsystem table
//! (`outbox_progress`, `view_progress`). Rows are created lazily on first
//! claim and written only by the leader instance.

use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, Transaction};

use crate::clock::InstanceId;

use super::ProcessorId;

/// Processor lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessorStatus {
    Active,
    Paused,
    Failed,
}

impl ProcessorStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessorStatus::Active => "active",
            ProcessorStatus::Paused => "paused",
            ProcessorStatus::Failed => "failed",
        }
    }
}

impl From<String> for ProcessorStatus {
    fn from(s: String) -> Self {
        match s.as_str() {
            "paused" => ProcessorStatus::Paused,
            "failed" => ProcessorStatus::Failed,
            _ => ProcessorStatus::Active,
        }
    }
}

impl std::fmt::Display for ProcessorStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Full progress row
#[derive(Debug, Clone)]
pub struct ProcessorProgress {
    pub processor_id: ProcessorId,
    pub last_position: i64,
    pub status: ProcessorStatus,
    pub error_count: i32,
    pub last_error: Option<String>,
    pub leader_instance: Option<String>,
    pub leader_heartbeat: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

type ProgressRow = (
    String,
    i64,
    String,
    i32,
    Option<String>,
    Option<String>,
    Option<DateTime<Utc>>,
    DateTime<Utc>,
);

fn row_into_progress(row: ProgressRow) -> ProcessorProgress {
    let (
        processor_id,
        last_position,
        status,
        error_count,
        last_error,
        leader_instance,
        leader_heartbeat,
        updated_at,
    ) = row;
    ProcessorProgress {
        processor_id: ProcessorId::new(processor_id),
        last_position,
        status: ProcessorStatus::from(status),
        error_count,
        last_error,
        leader_instance,
        leader_heartbeat,
        updated_at,
    }
}

/// Progress repository over one subsystem's table
#[derive(Debug, Clone)]
pub struct ProgressStore {
    pool: PgPool,
    table: &'static str,
}

impl ProgressStore {
    /// Progress rows for outbox processors
    pub fn outbox(pool: PgPool) -> Self {
        Self {
            pool,
            table: "outbox_progress",
        }
    }

    /// Progress rows for view processors
    pub fn views(pool: PgPool) -> Self {
        Self {
            pool,
            table: "view_progress",
        }
    }

    pub fn table(&self) -> &'static str {
        self.table
    }

    /// Create the row on first claim; existing rows are left untouched
    pub async fn auto_register(
        &self,
        id: &ProcessorId,
        instance: &InstanceId,
    ) -> Result<(), sqlx::Error> {
        let sql = format!(
            r#"
            INSERT INTO {} (processor_id, last_position, status, error_count, leader_instance, leader_heartbeat, updated_at)
            VALUES ($1, 0, 'active', 0, $2, NOW(), NOW())
            ON CONFLICT (processor_id) DO NOTHING
            "#,
            self.table
        );
        sqlx::query(&sql)
            .bind(id.as_str())
            .bind(instance.as_str())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn get(&self, id: &ProcessorId) -> Result<Option<ProcessorProgress>, sqlx::Error> {
        let sql = format!(
            r#"
            SELECT processor_id, last_position, status, error_count, last_error,
                   leader_instance, leader_heartbeat, updated_at
            FROM {}
            WHERE processor_id = $1
            "#,
            self.table
        );
        let row: Option<ProgressRow> = sqlx::query_as(&sql)
            .bind(id.as_str())
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(row_into_progress))
    }

    pub async fn list(&self) -> Result<Vec<ProcessorProgress>, sqlx::Error> {
        let sql = format!(
            r#"
            SELECT processor_id, last_position, status, error_count, last_error,
                   leader_instance, leader_heartbeat, updated_at
            FROM {}
            ORDER BY processor_id ASC
            "#,
            self.table
        );
        let rows: Vec<ProgressRow> = sqlx::query_as(&sql).fetch_all(&self.pool).await?;
        Ok(rows.into_iter().map(row_into_progress).collect())
    }

    pub async fn get_last_position(&self, id: &ProcessorId) -> Result<i64, sqlx::Error> {
        let sql = format!(
            "SELECT last_position FROM {} WHERE processor_id = $1",
            self.table
        );
        let position: Option<i64> = sqlx::query_scalar(&sql)
            .bind(id.as_str())
            .fetch_optional(&self.pool)
            .await?;
        Ok(position.unwrap_or(0))
    }

    /// Advance the position; never moves backwards
    pub async fn update_progress(
        &self,
        id: &ProcessorId,
        position: i64,
    ) -> Result<(), sqlx::Error> {
        let sql = format!(
            r#"
            UPDATE {}
            SET last_position = GREATEST(last_position, $2), updated_at = NOW()
            WHERE processor_id = $1
            "#,
            self.table
        );
        sqlx::query(&sql)
            .bind(id.as_str())
            .bind(position)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Advance the position inside the caller's transaction
    ///
    /// View processors use this so projector upserts and the progress
    /// advance commit atomically.
    pub async fn update_progress_in_tx(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        id: &ProcessorId,
        position: i64,
    ) -> Result<(), sqlx::Error> {
        let sql = format!(
            r#"
            UPDATE {}
            SET last_position = GREATEST(last_position, $2), updated_at = NOW()
            WHERE processor_id = $1
            "#,
            self.table
        );
        sqlx::query(&sql)
            .bind(id.as_str())
            .bind(position)
            .execute(&mut **tx)
            .await?;
        Ok(())
    }

    /// Count a handler error; flips `active -> failed` at `max_errors`
    pub async fn record_error(
        &self,
        id: &ProcessorId,
        message: &str,
        max_errors: u32,
    ) -> Result<ProcessorStatus, sqlx::Error> {
        let sql = format!(
            r#"
            UPDATE {}
            SET error_count = error_count + 1,
                last_error = $2,
                status = CASE
                    WHEN status = 'active' AND error_count + 1 >= $3 THEN 'failed'
                    ELSE status
                END,
                updated_at = NOW()
            WHERE processor_id = $1
            RETURNING status
            "#,
            self.table
        );
        let status: String = sqlx::query_scalar(&sql)
            .bind(id.as_str())
            .bind(message)
            .bind(max_errors as i32)
            .fetch_one(&self.pool)
            .await?;
        Ok(ProcessorStatus::from(status))
    }

    pub async fn reset_error_count(&self, id: &ProcessorId) -> Result<(), sqlx::Error> {
        let sql = format!(
            r#"
            UPDATE {}
            SET error_count = 0, last_error = NULL, updated_at = NOW()
            WHERE processor_id = $1
            "#,
            self.table
        );
        sqlx::query(&sql)
            .bind(id.as_str())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn get_status(&self, id: &ProcessorId) -> Result<ProcessorStatus, sqlx::Error> {
        let sql = format!(
            "SELECT status FROM {} WHERE processor_id = $1",
            self.table
        );
        let status: Option<String> = sqlx::query_scalar(&sql)
            .bind(id.as_str())
            .fetch_optional(&self.pool)
            .await?;
        Ok(status.map(ProcessorStatus::from).unwrap_or(ProcessorStatus::Active))
    }

    pub async fn set_status(
        &self,
        id: &ProcessorId,
        status: ProcessorStatus,
    ) -> Result<(), sqlx::Error> {
        let sql = format!(
            "UPDATE {} SET status = $2, updated_at = NOW() WHERE processor_id = $1",
            self.table
        );
        sqlx::query(&sql)
            .bind(id.as_str())
            .bind(status.as_str())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Clear errors and return the processor to `active`
    pub async fn reset(&self, id: &ProcessorId) -> Result<(), sqlx::Error> {
        let sql = format!(
            r#"
            UPDATE {}
            SET status = 'active', error_count = 0, last_error = NULL, updated_at = NOW()
            WHERE processor_id = $1
            "#,
            self.table
        );
        sqlx::query(&sql)
            .bind(id.as_str())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Record the current leader on the row
    pub async fn heartbeat(
        &self,
        id: &ProcessorId,
        instance: &InstanceId,
    ) -> Result<(), sqlx::Error> {
        let sql = format!(
            r#"
            UPDATE {}
            SET leader_instance = $2, leader_heartbeat = NOW()
            WHERE processor_id = $1
            "#,
            self.table
        );
        sqlx::query(&sql)
            .bind(id.as_str())
            .bind(instance.as_str())
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
