//! PostgreSQL queue store
//!
//! Three tables: `queue_jobs` (active), `queue_successes`, `queue_failures`.
//! Dispatch order over waiting jobs is the canonical
//! `(priority DESC, created_at ASC, id ASC)` triple; pagination uses a
//! keyset cursor over the same triple so concurrent pollers see a stable
//! order.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use tracing::{debug, instrument};
use uuid::Uuid;

use crate::error::StoreError;
use crate::models::{
    CreateQueueJob, QueueCursor, QueueFailureRow, QueueJobRow, QueueStats, QueueSuccessRow,
};
use crate::store::QueueStore;

const JOB_COLUMNS: &str = "id, queue_name, group_id, job_name, executor_name, payload, status, \
     priority, attempts, max_attempts, delay_until, locked_by, locked_until, \
     error_message, error_code, error_stack, metadata, started_at, created_at, updated_at";

/// PostgreSQL implementation of [`QueueStore`].
#[derive(Clone)]
pub struct PgQueueStore {
    pool: PgPool,
}

impl PgQueueStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl QueueStore for PgQueueStore {
    #[instrument(skip(self, job), fields(queue = %job.queue_name, executor = %job.executor_name))]
    async fn submit(&self, job: CreateQueueJob) -> Result<QueueJobRow, StoreError> {
        let id = Uuid::now_v7();
        let status = if job.delay_until.is_some() {
            "delayed"
        } else {
            "waiting"
        };

        let row = sqlx::query_as::<_, QueueJobRow>(&format!(
            r#"
            INSERT INTO queue_jobs (
                id, queue_name, group_id, job_name, executor_name, payload,
                status, priority, max_attempts, delay_until, metadata
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .bind(id)
        .bind(&job.queue_name)
        .bind(&job.group_id)
        .bind(&job.job_name)
        .bind(&job.executor_name)
        .bind(&job.payload)
        .bind(status)
        .bind(job.priority)
        .bind(job.max_attempts)
        .bind(job.delay_until)
        .bind(&job.metadata)
        .fetch_one(&self.pool)
        .await?;

        debug!(job_id = %row.id, "submitted job");
        Ok(row)
    }

    async fn get_job(&self, id: Uuid) -> Result<Option<QueueJobRow>, StoreError> {
        let row = sqlx::query_as::<_, QueueJobRow>(&format!(
            "SELECT {JOB_COLUMNS} FROM queue_jobs WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row)
    }

    #[instrument(skip(self, exclude_group_ids, cursor))]
    async fn find_pending_jobs(
        &self,
        queue_name: &str,
        limit: usize,
        exclude_group_ids: &[String],
        cursor: Option<QueueCursor>,
    ) -> Result<Vec<QueueJobRow>, StoreError> {
        // The cursor predicate continues strictly after (p, c, id) under the
        // (priority DESC, created_at ASC, id ASC) order.
        let (cursor_priority, cursor_created_at, cursor_id) = match cursor {
            Some(c) => (Some(c.priority), Some(c.created_at), Some(c.id)),
            None => (None, None, None),
        };

        let rows = sqlx::query_as::<_, QueueJobRow>(&format!(
            r#"
            SELECT {JOB_COLUMNS}
            FROM queue_jobs
            WHERE queue_name = $1
              AND status = 'waiting'
              AND (delay_until IS NULL OR delay_until <= NOW())
              AND (locked_until IS NULL OR locked_until < NOW())
              AND (group_id IS NULL OR group_id != ALL($2))
              AND (
                    $3::int IS NULL
                    OR priority < $3
                    OR (priority = $3 AND created_at > $4)
                    OR (priority = $3 AND created_at = $4 AND id > $5)
              )
            ORDER BY priority DESC, created_at ASC, id ASC
            LIMIT $6
            "#
        ))
        .bind(queue_name)
        .bind(exclude_group_ids)
        .bind(cursor_priority)
        .bind(cursor_created_at)
        .bind(cursor_id)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }

    #[instrument(skip(self))]
    async fn lock_job_for_processing(
        &self,
        id: Uuid,
        owner: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let locked_until = Utc::now() + chrono::Duration::from_std(ttl).unwrap_or_default();

        let result = sqlx::query(
            r#"
            UPDATE queue_jobs
            SET locked_by = $2,
                locked_until = $3,
                started_at = NOW(),
                updated_at = NOW()
            WHERE id = $1
              AND status = 'waiting'
              AND (locked_until IS NULL OR locked_until < NOW())
            "#,
        )
        .bind(id)
        .bind(owner)
        .bind(locked_until)
        .execute(&self.pool)
        .await?;

        let won = result.rows_affected() > 0;
        if won {
            debug!(job_id = %id, owner, "locked job for processing");
        }
        Ok(won)
    }

    async fn renew_job_lock(
        &self,
        id: Uuid,
        owner: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let locked_until = Utc::now() + chrono::Duration::from_std(ttl).unwrap_or_default();

        let result = sqlx::query(
            r#"
            UPDATE queue_jobs
            SET locked_until = $3, updated_at = NOW()
            WHERE id = $1 AND locked_by = $2 AND locked_until > NOW()
            "#,
        )
        .bind(id)
        .bind(owner)
        .bind(locked_until)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    #[instrument(skip(self))]
    async fn unlock_job(&self, id: Uuid, owner: &str) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE queue_jobs
            SET locked_by = NULL,
                locked_until = NULL,
                updated_at = NOW()
            WHERE id = $1 AND locked_by = $2
            "#,
        )
        .bind(id)
        .bind(owner)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn mark_executing(&self, id: Uuid, owner: &str) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE queue_jobs
            SET status = 'executing',
                attempts = attempts + 1,
                updated_at = NOW()
            WHERE id = $1 AND locked_by = $2 AND status = 'waiting'
            "#,
        )
        .bind(id)
        .bind(owner)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    #[instrument(skip(self))]
    async fn reset_job_to_waiting(&self, id: Uuid) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE queue_jobs
            SET status = 'waiting',
                locked_by = NULL,
                locked_until = NULL,
                delay_until = NULL,
                started_at = NULL,
                updated_at = NOW()
            WHERE id = $1 AND status IN ('executing', 'delayed', 'failed')
            "#,
        )
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn promote_due_delayed(&self, queue_name: &str) -> Result<u64, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE queue_jobs
            SET status = 'waiting', updated_at = NOW()
            WHERE queue_name = $1
              AND status = 'delayed'
              AND delay_until IS NOT NULL
              AND delay_until <= NOW()
            "#,
        )
        .bind(queue_name)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn reset_all_job_locks(&self, queue_name: &str) -> Result<u64, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE queue_jobs
            SET status = 'waiting',
                locked_by = NULL,
                locked_until = NULL,
                updated_at = NOW()
            WHERE queue_name = $1
              AND status = 'executing'
            "#,
        )
        .bind(queue_name)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    #[instrument(skip(self))]
    async fn cleanup_expired_locks(&self) -> Result<u64, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE queue_jobs
            SET status = 'waiting',
                locked_by = NULL,
                locked_until = NULL,
                updated_at = NOW()
            WHERE status = 'executing'
              AND locked_until IS NOT NULL
              AND locked_until < NOW()
            "#,
        )
        .execute(&self.pool)
        .await?;

        let reset = result.rows_affected();
        if reset > 0 {
            debug!(count = reset, "reset jobs with expired locks");
        }
        Ok(reset)
    }

    #[instrument(skip(self, result))]
    async fn move_to_success(
        &self,
        id: Uuid,
        result: Option<serde_json::Value>,
        execution_time: Duration,
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;

        // Lock the source row so a concurrent move cannot double-insert.
        let moved = sqlx::query(
            r#"
            INSERT INTO queue_successes (
                id, queue_name, job_name, executor_name, payload, result,
                attempts, execution_time_ms, started_at, completed_at, created_at
            )
            SELECT id, queue_name, job_name, executor_name, payload, $2,
                   attempts, $3, started_at, NOW(), created_at
            FROM queue_jobs
            WHERE id = $1
            FOR UPDATE
            "#,
        )
        .bind(id)
        .bind(&result)
        .bind(execution_time.as_millis() as i64)
        .execute(&mut *tx)
        .await?;

        if moved.rows_affected() == 0 {
            return Err(StoreError::JobNotFound(id));
        }

        sqlx::query("DELETE FROM queue_jobs WHERE id = $1")
            .bind(id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        debug!(job_id = %id, "moved job to success table");
        Ok(())
    }

    #[instrument(skip(self, error_stack))]
    async fn mark_as_failed(
        &self,
        id: Uuid,
        error_message: &str,
        error_code: Option<&str>,
        error_stack: Option<&str>,
    ) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE queue_jobs
            SET status = 'failed',
                error_message = $2,
                error_code = $3,
                error_stack = $4,
                locked_by = NULL,
                locked_until = NULL,
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(error_message)
        .bind(error_code)
        .bind(error_stack)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::JobNotFound(id));
        }

        debug!(job_id = %id, "marked job as failed");
        Ok(())
    }

    async fn reschedule_for_retry(
        &self,
        id: Uuid,
        delay_until: DateTime<Utc>,
        error_message: &str,
    ) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE queue_jobs
            SET status = 'delayed',
                delay_until = $2,
                error_message = $3,
                locked_by = NULL,
                locked_until = NULL,
                updated_at = NOW()
            WHERE id = $1 AND status = 'executing'
            "#,
        )
        .bind(id)
        .bind(delay_until)
        .bind(error_message)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::JobNotFound(id));
        }
        Ok(())
    }

    #[instrument(skip(self))]
    async fn retry_failed_job(&self, id: Uuid) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE queue_jobs
            SET status = 'waiting',
                error_message = NULL,
                error_code = NULL,
                error_stack = NULL,
                delay_until = NULL,
                started_at = NULL,
                updated_at = NOW()
            WHERE id = $1 AND status = 'failed'
            "#,
        )
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    #[instrument(skip(self))]
    async fn move_to_failure(&self, id: Uuid) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;

        let moved = sqlx::query(
            r#"
            INSERT INTO queue_failures (
                id, queue_name, job_name, executor_name, payload,
                attempts, error_message, error_code, error_stack, failed_at, created_at
            )
            SELECT id, queue_name, job_name, executor_name, payload,
                   attempts, error_message, error_code, error_stack, NOW(), created_at
            FROM queue_jobs
            WHERE id = $1
            FOR UPDATE
            "#,
        )
        .bind(id)
        .execute(&mut *tx)
        .await?;

        if moved.rows_affected() == 0 {
            return Err(StoreError::JobNotFound(id));
        }

        sqlx::query("DELETE FROM queue_jobs WHERE id = $1")
            .bind(id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        debug!(job_id = %id, "moved job to failure table");
        Ok(())
    }

    async fn cancel_job(&self, id: Uuid) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            DELETE FROM queue_jobs
            WHERE id = $1 AND status IN ('waiting', 'delayed', 'paused')
            "#,
        )
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    #[instrument(skip(self))]
    async fn pause_group(&self, queue_name: &str, group_id: &str) -> Result<u64, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE queue_jobs
            SET status = 'paused', updated_at = NOW()
            WHERE queue_name = $1
              AND group_id = $2
              AND status IN ('waiting', 'delayed')
            "#,
        )
        .bind(queue_name)
        .bind(group_id)
        .execute(&self.pool)
        .await?;

        debug!(queue_name, group_id, count = result.rows_affected(), "paused group");
        Ok(result.rows_affected())
    }

    #[instrument(skip(self))]
    async fn resume_group(&self, queue_name: &str, group_id: &str) -> Result<u64, StoreError> {
        // Jobs whose delay has not elapsed go back to delayed, the rest to
        // waiting.
        let result = sqlx::query(
            r#"
            UPDATE queue_jobs
            SET status = CASE
                    WHEN delay_until IS NOT NULL AND delay_until > NOW() THEN 'delayed'
                    ELSE 'waiting'
                END,
                updated_at = NOW()
            WHERE queue_name = $1
              AND group_id = $2
              AND status = 'paused'
            "#,
        )
        .bind(queue_name)
        .bind(group_id)
        .execute(&self.pool)
        .await?;

        debug!(queue_name, group_id, count = result.rows_affected(), "resumed group");
        Ok(result.rows_affected())
    }

    async fn paused_groups(&self, queue_name: &str) -> Result<Vec<String>, StoreError> {
        use sqlx::Row;

        let rows = sqlx::query(
            r#"
            SELECT DISTINCT group_id
            FROM queue_jobs
            WHERE queue_name = $1 AND status = 'paused' AND group_id IS NOT NULL
            ORDER BY group_id
            "#,
        )
        .bind(queue_name)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(|r| r.get("group_id")).collect())
    }

    async fn find_orphaned_executing_jobs(
        &self,
        older_than: Duration,
    ) -> Result<Vec<QueueJobRow>, StoreError> {
        let threshold = Utc::now() - chrono::Duration::from_std(older_than).unwrap_or_default();

        let rows = sqlx::query_as::<_, QueueJobRow>(&format!(
            r#"
            SELECT {JOB_COLUMNS}
            FROM queue_jobs
            WHERE status = 'executing'
              AND updated_at < $1
            ORDER BY updated_at ASC
            "#
        ))
        .bind(threshold)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }

    async fn get_success(&self, id: Uuid) -> Result<Option<QueueSuccessRow>, StoreError> {
        let row = sqlx::query_as::<_, QueueSuccessRow>(
            r#"
            SELECT id, queue_name, job_name, executor_name, payload, result,
                   attempts, execution_time_ms, started_at, completed_at, created_at
            FROM queue_successes
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row)
    }

    async fn get_failure(&self, id: Uuid) -> Result<Option<QueueFailureRow>, StoreError> {
        let row = sqlx::query_as::<_, QueueFailureRow>(
            r#"
            SELECT id, queue_name, job_name, executor_name, payload,
                   attempts, error_message, error_code, error_stack, failed_at, created_at
            FROM queue_failures
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row)
    }

    async fn queue_depth(&self, queue_name: &str) -> Result<i64, StoreError> {
        use sqlx::Row;

        let row = sqlx::query("SELECT COUNT(*) AS depth FROM queue_jobs WHERE queue_name = $1")
            .bind(queue_name)
            .fetch_one(&self.pool)
            .await?;

        Ok(row.get("depth"))
    }

    async fn queue_stats(&self, queue_name: &str) -> Result<QueueStats, StoreError> {
        use sqlx::Row;

        let row = sqlx::query(
            r#"
            SELECT
                (SELECT COUNT(*) FROM queue_jobs WHERE queue_name = $1 AND status = 'waiting') AS waiting,
                (SELECT COUNT(*) FROM queue_jobs WHERE queue_name = $1 AND status = 'executing') AS executing,
                (SELECT COUNT(*) FROM queue_jobs WHERE queue_name = $1 AND status = 'paused') AS paused,
                (SELECT COUNT(*) FROM queue_jobs WHERE queue_name = $1 AND status = 'delayed') AS delayed,
                (SELECT COUNT(*) FROM queue_jobs WHERE queue_name = $1 AND status = 'failed') AS failed,
                (SELECT COUNT(*) FROM queue_successes WHERE queue_name = $1) AS succeeded,
                (SELECT COUNT(*) FROM queue_failures WHERE queue_name = $1) AS rejected
            "#,
        )
        .bind(queue_name)
        .fetch_one(&self.pool)
        .await?;

        Ok(QueueStats {
            waiting: row.get("waiting"),
            executing: row.get("executing"),
            paused: row.get("paused"),
            delayed: row.get("delayed"),
            failed: row.get("failed"),
            succeeded: row.get("succeeded"),
            rejected: row.get("rejected"),
        })
    }
}
