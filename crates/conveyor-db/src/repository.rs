use chrono::{DateTime, Utc};
use sqlx::{postgres::PgPoolOptions, Pool, Postgres, Row};

use conveyor_core::config::Settings;
use conveyor_core::health::wait_until_healthy;
use conveyor_core::{Task, TaskState};

use crate::{
    models::{AggregateStats, ExecutionLog, TaskRecord},
    Error, Result,
};

#[derive(Clone)]
pub struct Database {
    pool: Pool<Postgres>,
}

impl Database {
    /// Create new database connection
    pub async fn new(database_url: &str) -> Result<Self> {
        Self::with_max_connections(database_url, 5).await
    }

    pub async fn with_max_connections(database_url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await
            .map_err(|e| Error::Connection(e.to_string()))?;

        Ok(Self { pool })
    }

    /// Pool that connects on first use, so callers can probe a server that
    /// is still starting.
    pub fn connect_lazy(database_url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect_lazy(database_url)
            .map_err(|e| Error::Connection(e.to_string()))?;

        Ok(Self { pool })
    }

    /// Opens the configured database once it answers, or `None` when no
    /// database is configured.
    pub async fn open_when_ready(settings: &Settings) -> conveyor_core::Result<Option<Self>> {
        let Some(url) = settings.database_url() else {
            tracing::info!("No database configured; task history is not persisted");
            return Ok(None);
        };

        let db = Self::connect_lazy(&url, settings.database.max_connections)?;
        wait_until_healthy(&db, &settings.startup.health_check()).await?;
        Ok(Some(db))
    }

    /// Initialize database schema
    pub async fn init_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS tasks (
                id VARCHAR(255) PRIMARY KEY,
                name VARCHAR(255) NOT NULL,
                queue VARCHAR(255) NOT NULL,
                state VARCHAR(50) NOT NULL,
                payload JSONB NOT NULL DEFAULT 'null',
                result JSONB,
                error TEXT,
                attempts INTEGER NOT NULL DEFAULT 0,
                max_retries INTEGER NOT NULL DEFAULT 0,
                origin VARCHAR(255) NOT NULL,
                created_at TIMESTAMPTZ NOT NULL,
                started_at TIMESTAMPTZ,
                completed_at TIMESTAMPTZ,
                eta TIMESTAMPTZ
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS execution_logs (
                id SERIAL PRIMARY KEY,
                task_id VARCHAR(255) NOT NULL,
                event_type VARCHAR(100) NOT NULL,
                message TEXT NOT NULL,
                timestamp TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                FOREIGN KEY (task_id) REFERENCES tasks(id) ON DELETE CASCADE
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        // Create indexes
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_tasks_state ON tasks(state)")
            .execute(&self.pool)
            .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_tasks_created_at ON tasks(created_at DESC)")
            .execute(&self.pool)
            .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_execution_logs_task_id ON execution_logs(task_id)",
        )
        .execute(&self.pool)
        .await?;

        tracing::info!("Database schema ready");
        Ok(())
    }

    pub async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    // ========================================================================
    // Task Operations
    // ========================================================================

    /// Insert or refresh a task. Identity columns are written once, and a
    /// finished row is never rewound by a stale or late write.
    pub async fn save_task(&self, task: &Task) -> Result<()> {
        let record = TaskRecord::from(task);

        sqlx::query(
            r#"
            INSERT INTO tasks (
                id, name, queue, state, payload, result, error,
                attempts, max_retries, origin,
                created_at, started_at, completed_at, eta
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            ON CONFLICT (id) DO UPDATE SET
                state = $4,
                result = $6,
                error = $7,
                attempts = $8,
                started_at = $12,
                completed_at = $13,
                eta = $14
            WHERE tasks.state NOT IN ('Succeeded', 'Failed')
              AND EXCLUDED.attempts >= tasks.attempts
            "#,
        )
        .bind(&record.id)
        .bind(&record.name)
        .bind(&record.queue)
        .bind(&record.state)
        .bind(&record.payload)
        .bind(&record.result)
        .bind(&record.error)
        .bind(record.attempts)
        .bind(record.max_retries)
        .bind(&record.origin)
        .bind(record.created_at)
        .bind(record.started_at)
        .bind(record.completed_at)
        .bind(record.eta)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Get task by ID
    pub async fn get_task(&self, task_id: &str) -> Result<Option<TaskRecord>> {
        let record = sqlx::query_as::<_, TaskRecord>("SELECT * FROM tasks WHERE id = $1")
            .bind(task_id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(record)
    }

    /// Most recent tasks in `state`
    pub async fn get_tasks_by_state(&self, state: TaskState, limit: i64) -> Result<Vec<TaskRecord>> {
        let records = sqlx::query_as::<_, TaskRecord>(
            "SELECT * FROM tasks WHERE state = $1 ORDER BY created_at DESC LIMIT $2",
        )
        .bind(state.as_str())
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(records)
    }

    /// Get recent tasks
    pub async fn get_recent_tasks(&self, limit: i64) -> Result<Vec<TaskRecord>> {
        let records = sqlx::query_as::<_, TaskRecord>(
            "SELECT * FROM tasks ORDER BY created_at DESC LIMIT $1",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(records)
    }

    /// Delete finished tasks completed before `cutoff`, with their logs.
    pub async fn purge_finished_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let deleted = sqlx::query(
            "DELETE FROM tasks WHERE state IN ('Succeeded', 'Failed') AND completed_at < $1",
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await?;

        Ok(deleted.rows_affected())
    }

    // ========================================================================
    // Logging Operations
    // ========================================================================

    /// Add execution log
    pub async fn add_execution_log(
        &self,
        task_id: &str,
        event_type: &str,
        message: &str,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO execution_logs (task_id, event_type, message, timestamp)
            VALUES ($1, $2, $3, NOW())
            "#,
        )
        .bind(task_id)
        .bind(event_type)
        .bind(message)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Get task execution logs, newest first
    pub async fn get_execution_logs(&self, task_id: &str) -> Result<Vec<ExecutionLog>> {
        let logs = sqlx::query_as::<_, ExecutionLog>(
            "SELECT * FROM execution_logs WHERE task_id = $1 ORDER BY timestamp DESC, id DESC",
        )
        .bind(task_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(logs)
    }

    // ========================================================================
    // Statistics
    // ========================================================================

    /// Get aggregate statistics
    pub async fn get_aggregate_stats(&self) -> Result<AggregateStats> {
        let row = sqlx::query(
            r#"
            SELECT
                COUNT(*) AS total_tasks,
                COUNT(*) FILTER (WHERE state = 'Queued') AS queued_tasks,
                COUNT(*) FILTER (WHERE state = 'Running') AS running_tasks,
                COUNT(*) FILTER (WHERE state = 'Retrying') AS retrying_tasks,
                COUNT(*) FILTER (WHERE state = 'Succeeded') AS succeeded_tasks,
                COUNT(*) FILTER (WHERE state = 'Failed') AS failed_tasks,
                AVG(CASE
                    WHEN completed_at IS NOT NULL AND started_at IS NOT NULL
                    THEN EXTRACT(EPOCH FROM (completed_at - started_at)) * 1000
                END)::FLOAT8 AS avg_runtime_ms
            FROM tasks
            "#,
        )
        .fetch_one(&self.pool)
        .await?;

        Ok(AggregateStats {
            total_tasks: row.get("total_tasks"),
            queued_tasks: row.get("queued_tasks"),
            running_tasks: row.get("running_tasks"),
            retrying_tasks: row.get("retrying_tasks"),
            succeeded_tasks: row.get("succeeded_tasks"),
            failed_tasks: row.get("failed_tasks"),
            avg_runtime_ms: row.get("avg_runtime_ms"),
        })
    }
}
