//! PostgreSQL schedule store

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use tracing::{debug, instrument};
use uuid::Uuid;

use crate::error::StoreError;
use crate::models::{
    CreateSchedule, Pagination, ScheduleExecutionRow, ScheduleRow, UpdateSchedule,
};
use crate::store::ScheduleStore;

const SCHEDULE_COLUMNS: &str = "id, workflow_definition_id, cron, timezone, enabled, \
     next_run_at, last_run_at, max_instances, input_data, created_at, updated_at";

const EXECUTION_COLUMNS: &str = "id, schedule_id, workflow_instance_id, status, trigger_time, \
     started_at, completed_at, duration_ms, error_message";

/// PostgreSQL implementation of [`ScheduleStore`].
#[derive(Clone)]
pub struct PgScheduleStore {
    pool: PgPool,
}

impl PgScheduleStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ScheduleStore for PgScheduleStore {
    #[instrument(skip(self, input), fields(cron = %input.cron))]
    async fn create(&self, input: CreateSchedule) -> Result<ScheduleRow, StoreError> {
        let id = Uuid::now_v7();

        let row = sqlx::query_as::<_, ScheduleRow>(&format!(
            r#"
            INSERT INTO schedules (
                id, workflow_definition_id, cron, timezone, enabled,
                next_run_at, max_instances, input_data
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            RETURNING {SCHEDULE_COLUMNS}
            "#
        ))
        .bind(id)
        .bind(input.workflow_definition_id)
        .bind(&input.cron)
        .bind(&input.timezone)
        .bind(input.enabled)
        .bind(input.next_run_at)
        .bind(input.max_instances)
        .bind(&input.input_data)
        .fetch_one(&self.pool)
        .await?;

        debug!(schedule_id = %row.id, "created schedule");
        Ok(row)
    }

    async fn update(
        &self,
        id: Uuid,
        input: UpdateSchedule,
    ) -> Result<Option<ScheduleRow>, StoreError> {
        let row = sqlx::query_as::<_, ScheduleRow>(&format!(
            r#"
            UPDATE schedules
            SET cron = COALESCE($2, cron),
                timezone = COALESCE($3, timezone),
                enabled = COALESCE($4, enabled),
                next_run_at = COALESCE($5, next_run_at),
                max_instances = COALESCE($6, max_instances),
                input_data = COALESCE($7, input_data),
                updated_at = NOW()
            WHERE id = $1
            RETURNING {SCHEDULE_COLUMNS}
            "#
        ))
        .bind(id)
        .bind(&input.cron)
        .bind(&input.timezone)
        .bind(input.enabled)
        .bind(input.next_run_at)
        .bind(input.max_instances)
        .bind(&input.input_data)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row)
    }

    async fn delete(&self, id: Uuid) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM schedules WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn get(&self, id: Uuid) -> Result<Option<ScheduleRow>, StoreError> {
        let row = sqlx::query_as::<_, ScheduleRow>(&format!(
            "SELECT {SCHEDULE_COLUMNS} FROM schedules WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row)
    }

    async fn list(&self) -> Result<Vec<ScheduleRow>, StoreError> {
        let rows = sqlx::query_as::<_, ScheduleRow>(&format!(
            "SELECT {SCHEDULE_COLUMNS} FROM schedules ORDER BY created_at ASC"
        ))
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }

    async fn set_enabled(&self, id: Uuid, enabled: bool) -> Result<bool, StoreError> {
        let result =
            sqlx::query("UPDATE schedules SET enabled = $2, updated_at = NOW() WHERE id = $1")
                .bind(id)
                .bind(enabled)
                .execute(&self.pool)
                .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn find_due(&self, now: DateTime<Utc>) -> Result<Vec<ScheduleRow>, StoreError> {
        let rows = sqlx::query_as::<_, ScheduleRow>(&format!(
            r#"
            SELECT {SCHEDULE_COLUMNS}
            FROM schedules
            WHERE enabled AND next_run_at <= $1
            ORDER BY next_run_at ASC
            "#
        ))
        .bind(now)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }

    async fn mark_triggered(
        &self,
        id: Uuid,
        last_run_at: DateTime<Utc>,
        next_run_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE schedules
            SET last_run_at = $2, next_run_at = $3, updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(last_run_at)
        .bind(next_run_at)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::ScheduleNotFound(id));
        }
        Ok(())
    }

    async fn create_execution(
        &self,
        schedule_id: Uuid,
        trigger_time: DateTime<Utc>,
    ) -> Result<ScheduleExecutionRow, StoreError> {
        let id = Uuid::now_v7();

        let row = sqlx::query_as::<_, ScheduleExecutionRow>(&format!(
            r#"
            INSERT INTO schedule_executions (id, schedule_id, status, trigger_time)
            VALUES ($1, $2, 'running', $3)
            RETURNING {EXECUTION_COLUMNS}
            "#
        ))
        .bind(id)
        .bind(schedule_id)
        .bind(trigger_time)
        .fetch_one(&self.pool)
        .await?;

        Ok(row)
    }

    async fn attach_instance(
        &self,
        execution_id: Uuid,
        workflow_instance_id: Uuid,
    ) -> Result<(), StoreError> {
        sqlx::query("UPDATE schedule_executions SET workflow_instance_id = $2 WHERE id = $1")
            .bind(execution_id)
            .bind(workflow_instance_id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn complete_execution(
        &self,
        execution_id: Uuid,
        status: &str,
        error_message: Option<&str>,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE schedule_executions
            SET status = $2,
                error_message = $3,
                completed_at = NOW(),
                duration_ms = (EXTRACT(EPOCH FROM (NOW() - started_at)) * 1000)::bigint
            WHERE id = $1 AND status = 'running'
            "#,
        )
        .bind(execution_id)
        .bind(status)
        .bind(error_message)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn running_count(&self, schedule_id: Uuid) -> Result<i64, StoreError> {
        use sqlx::Row;

        let row = sqlx::query(
            "SELECT COUNT(*) AS running FROM schedule_executions WHERE schedule_id = $1 AND status = 'running'",
        )
        .bind(schedule_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(row.get("running"))
    }

    async fn list_executions(
        &self,
        schedule_id: Uuid,
        page: Pagination,
    ) -> Result<Vec<ScheduleExecutionRow>, StoreError> {
        let rows = sqlx::query_as::<_, ScheduleExecutionRow>(&format!(
            r#"
            SELECT {EXECUTION_COLUMNS}
            FROM schedule_executions
            WHERE schedule_id = $1
            ORDER BY started_at DESC
            OFFSET $2
            LIMIT $3
            "#
        ))
        .bind(schedule_id)
        .bind(page.offset as i64)
        .bind(page.limit as i64)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }

    #[instrument(skip(self))]
    async fn cleanup_old_executions(&self, before: DateTime<Utc>) -> Result<u64, StoreError> {
        let result = sqlx::query(
            "DELETE FROM schedule_executions WHERE started_at < $1 AND status != 'running'",
        )
        .bind(before)
        .execute(&self.pool)
        .await?;

        let removed = result.rows_affected();
        if removed > 0 {
            debug!(count = removed, "cleaned up old schedule executions");
        }
        Ok(removed)
    }
}
