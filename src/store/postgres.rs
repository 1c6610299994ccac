//! Postgres-backed execution store.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{FromRow, PgPool};
use tracing::warn;

use crate::core::{Execution, SchedulerError, TaskInstance};
use crate::store::ExecutionStore;

/// Default table name for the execution schema.
pub const DEFAULT_TABLE_NAME: &str = "scheduled_tasks";

/// Execution store on a Postgres pool.
///
/// Every conditional operation is a single statement predicated on the
/// observed `version`, so no explicit transactions are needed. The fused
/// `pick_due` claims rows with `FOR UPDATE SKIP LOCKED` in one round-trip.
pub struct PostgresExecutionStore {
    pool: PgPool,
    table: String,
    scheduler_name: String,
}

#[derive(FromRow)]
struct ExecutionRow {
    task_name: String,
    task_instance: String,
    task_data: Option<Vec<u8>>,
    execution_time: DateTime<Utc>,
    picked: bool,
    picked_by: Option<String>,
    last_success: Option<DateTime<Utc>>,
    last_failure: Option<DateTime<Utc>>,
    consecutive_failures: i32,
    last_heartbeat: Option<DateTime<Utc>>,
    version: i64,
}

impl From<ExecutionRow> for Execution {
    fn from(row: ExecutionRow) -> Self {
        Execution {
            task_instance: TaskInstance {
                task_name: row.task_name,
                instance_id: row.task_instance,
                payload: row.task_data,
            },
            execution_time: row.execution_time,
            picked: row.picked,
            picked_by: row.picked_by,
            last_heartbeat: row.last_heartbeat,
            last_success: row.last_success,
            last_failure: row.last_failure,
            consecutive_failures: row.consecutive_failures.max(0) as u32,
            version: row.version,
        }
    }
}

impl PostgresExecutionStore {
    /// A store over `pool` writing to `table`, picking rows as
    /// `scheduler_name`. The table name must have been validated by the
    /// configuration layer (identifier characters only).
    pub fn new(pool: PgPool, table: impl Into<String>, scheduler_name: impl Into<String>) -> Self {
        Self {
            pool,
            table: table.into(),
            scheduler_name: scheduler_name.into(),
        }
    }

    /// DDL statements creating the schema for `table`.
    pub fn migrations(table: &str) -> Vec<String> {
        vec![
            format!(
                r#"
CREATE TABLE IF NOT EXISTS {table} (
    task_name TEXT NOT NULL,
    task_instance TEXT NOT NULL,
    task_data BYTEA,
    execution_time TIMESTAMPTZ NOT NULL,
    picked BOOLEAN NOT NULL,
    picked_by TEXT,
    last_success TIMESTAMPTZ,
    last_failure TIMESTAMPTZ,
    consecutive_failures INT NOT NULL DEFAULT 0,
    last_heartbeat TIMESTAMPTZ,
    version BIGINT NOT NULL,
    PRIMARY KEY (task_name, task_instance)
)
"#
            ),
            format!(
                "CREATE INDEX IF NOT EXISTS idx_{table}_execution_time \
                 ON {table} (execution_time) WHERE picked = false"
            ),
        ]
    }

    /// Apply [`Self::migrations`] to the pool.
    pub async fn migrate(&self) -> Result<(), SchedulerError> {
        for statement in Self::migrations(&self.table) {
            sqlx::query(&statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    fn all_columns() -> &'static str {
        "task_name, task_instance, task_data, execution_time, picked, picked_by, \
         last_success, last_failure, consecutive_failures, last_heartbeat, version"
    }

    fn rows_to_executions(rows: Vec<PgRow>) -> Result<Vec<Execution>, SchedulerError> {
        rows.into_iter()
            .map(|row| ExecutionRow::from_row(&row).map(Execution::from))
            .collect::<Result<Vec<_>, sqlx::Error>>()
            .map_err(SchedulerError::from)
    }
}

#[async_trait]
impl ExecutionStore for PostgresExecutionStore {
    async fn create_if_not_exists(&self, execution: &Execution) -> Result<bool, SchedulerError> {
        let sql = format!(
            "INSERT INTO {} (task_name, task_instance, task_data, execution_time, \
             picked, consecutive_failures, version) \
             VALUES ($1, $2, $3, $4, false, 0, 1) \
             ON CONFLICT (task_name, task_instance) DO NOTHING",
            self.table
        );
        let result = sqlx::query(&sql)
            .bind(&execution.task_instance.task_name)
            .bind(&execution.task_instance.instance_id)
            .bind(&execution.task_instance.payload)
            .bind(execution.execution_time)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn get_due(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Execution>, SchedulerError> {
        let sql = format!(
            "SELECT {} FROM {} WHERE picked = false AND execution_time <= $1 \
             ORDER BY execution_time ASC LIMIT $2",
            Self::all_columns(),
            self.table
        );
        let rows = sqlx::query(&sql)
            .bind(now)
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await?;
        Self::rows_to_executions(rows)
    }

    async fn pick(
        &self,
        execution: &Execution,
        now: DateTime<Utc>,
    ) -> Result<Option<Execution>, SchedulerError> {
        let sql = format!(
            "UPDATE {} SET picked = true, picked_by = $1, last_heartbeat = $2, \
             version = version + 1 \
             WHERE task_name = $3 AND task_instance = $4 AND version = $5 AND picked = false \
             RETURNING {}",
            self.table,
            Self::all_columns()
        );
        let row = sqlx::query(&sql)
            .bind(&self.scheduler_name)
            .bind(now)
            .bind(&execution.task_instance.task_name)
            .bind(&execution.task_instance.instance_id)
            .bind(execution.version)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| ExecutionRow::from_row(&r).map(Execution::from))
            .transpose()
            .map_err(SchedulerError::from)
    }

    async fn pick_due(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Execution>, SchedulerError> {
        let sql = format!(
            "WITH due AS ( \
                 SELECT task_name, task_instance FROM {table} \
                 WHERE picked = false AND execution_time <= $1 \
                 ORDER BY execution_time ASC LIMIT $2 \
                 FOR UPDATE SKIP LOCKED \
             ) \
             UPDATE {table} t \
             SET picked = true, picked_by = $3, last_heartbeat = $1, version = t.version + 1 \
             FROM due \
             WHERE t.task_name = due.task_name AND t.task_instance = due.task_instance \
             RETURNING {columns}",
            table = self.table,
            columns = Self::all_columns(),
        );
        let rows = sqlx::query(&sql)
            .bind(now)
            .bind(limit as i64)
            .bind(&self.scheduler_name)
            .fetch_all(&self.pool)
            .await?;
        let mut picked = Self::rows_to_executions(rows)?;
        // RETURNING order is unspecified; restore due-time order for callers.
        picked.sort_by_key(|e| e.execution_time);
        Ok(picked)
    }

    async fn update_heartbeat(
        &self,
        execution: &Execution,
        now: DateTime<Utc>,
    ) -> Result<(), SchedulerError> {
        let sql = format!(
            "UPDATE {} SET last_heartbeat = $1 WHERE task_name = $2 AND task_instance = $3",
            self.table
        );
        let result = sqlx::query(&sql)
            .bind(now)
            .bind(&execution.task_instance.task_name)
            .bind(&execution.task_instance.instance_id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            warn!(execution = %execution.id(), "heartbeat for missing row, ignoring");
        }
        Ok(())
    }

    async fn get_old_executions(
        &self,
        older_than: DateTime<Utc>,
    ) -> Result<Vec<Execution>, SchedulerError> {
        let sql = format!(
            "SELECT {} FROM {} WHERE picked = true AND last_heartbeat < $1 \
             ORDER BY last_heartbeat ASC",
            Self::all_columns(),
            self.table
        );
        let rows = sqlx::query(&sql).bind(older_than).fetch_all(&self.pool).await?;
        Self::rows_to_executions(rows)
    }

    async fn get_executions_failing_longer_than(
        &self,
        now: DateTime<Utc>,
        duration: Duration,
    ) -> Result<Vec<Execution>, SchedulerError> {
        let boundary =
            now - chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::zero());
        let sql = format!(
            "SELECT {} FROM {} WHERE picked = false AND consecutive_failures > 0 \
             AND (last_success IS NULL OR last_success < $1) \
             ORDER BY execution_time ASC",
            Self::all_columns(),
            self.table
        );
        let rows = sqlx::query(&sql).bind(boundary).fetch_all(&self.pool).await?;
        Self::rows_to_executions(rows)
    }

    async fn reschedule(
        &self,
        execution: &Execution,
        next_execution_time: DateTime<Utc>,
        new_payload: Option<Vec<u8>>,
        last_success: Option<DateTime<Utc>>,
        last_failure: Option<DateTime<Utc>>,
        consecutive_failures: u32,
    ) -> Result<bool, SchedulerError> {
        let result = if let Some(payload) = new_payload {
            let sql = format!(
                "UPDATE {} SET picked = false, picked_by = NULL, last_heartbeat = NULL, \
                 execution_time = $1, last_success = $2, last_failure = $3, \
                 consecutive_failures = $4, task_data = $5, version = version + 1 \
                 WHERE task_name = $6 AND task_instance = $7 AND version = $8",
                self.table
            );
            sqlx::query(&sql)
                .bind(next_execution_time)
                .bind(last_success)
                .bind(last_failure)
                .bind(consecutive_failures as i32)
                .bind(payload)
                .bind(&execution.task_instance.task_name)
                .bind(&execution.task_instance.instance_id)
                .bind(execution.version)
                .execute(&self.pool)
                .await?
        } else {
            let sql = format!(
                "UPDATE {} SET picked = false, picked_by = NULL, last_heartbeat = NULL, \
                 execution_time = $1, last_success = $2, last_failure = $3, \
                 consecutive_failures = $4, version = version + 1 \
                 WHERE task_name = $5 AND task_instance = $6 AND version = $7",
                self.table
            );
            sqlx::query(&sql)
                .bind(next_execution_time)
                .bind(last_success)
                .bind(last_failure)
                .bind(consecutive_failures as i32)
                .bind(&execution.task_instance.task_name)
                .bind(&execution.task_instance.instance_id)
                .bind(execution.version)
                .execute(&self.pool)
                .await?
        };
        Ok(result.rows_affected() == 1)
    }

    async fn remove(&self, execution: &Execution) -> Result<bool, SchedulerError> {
        let sql = format!(
            "DELETE FROM {} WHERE task_name = $1 AND task_instance = $2 AND version = $3",
            self.table
        );
        let result = sqlx::query(&sql)
            .bind(&execution.task_instance.task_name)
            .bind(&execution.task_instance.instance_id)
            .bind(execution.version)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn update_payload(
        &self,
        execution: &Execution,
        new_payload: Option<Vec<u8>>,
    ) -> Result<bool, SchedulerError> {
        let sql = format!(
            "UPDATE {} SET task_data = $1, version = version + 1 \
             WHERE task_name = $2 AND task_instance = $3 AND version = $4",
            self.table
        );
        let result = sqlx::query(&sql)
            .bind(new_payload)
            .bind(&execution.task_instance.task_name)
            .bind(&execution.task_instance.instance_id)
            .bind(execution.version)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn get_execution(
        &self,
        task_name: &str,
        instance_id: &str,
    ) -> Result<Option<Execution>, SchedulerError> {
        let sql = format!(
            "SELECT {} FROM {} WHERE task_name = $1 AND task_instance = $2",
            Self::all_columns(),
            self.table
        );
        let row = sqlx::query(&sql)
            .bind(task_name)
            .bind(instance_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| ExecutionRow::from_row(&r).map(Execution::from))
            .transpose()
            .map_err(SchedulerError::from)
    }

    async fn get_executions_for_task(
        &self,
        task_name: &str,
    ) -> Result<Vec<Execution>, SchedulerError> {
        let sql = format!(
            "SELECT {} FROM {} WHERE task_name = $1 ORDER BY execution_time ASC",
            Self::all_columns(),
            self.table
        );
        let rows = sqlx::query(&sql).bind(task_name).fetch_all(&self.pool).await?;
        Self::rows_to_executions(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn migrations_create_table_and_partial_index() {
        let statements = PostgresExecutionStore::migrations(DEFAULT_TABLE_NAME);
        assert_eq!(statements.len(), 2);
        assert!(statements[0].contains("CREATE TABLE IF NOT EXISTS scheduled_tasks"));
        assert!(statements[0].contains("PRIMARY KEY (task_name, task_instance)"));
        assert!(statements[1].contains("WHERE picked = false"));
    }
}
