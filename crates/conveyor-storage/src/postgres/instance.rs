//! PostgreSQL workflow instance store
//!
//! Status transitions are double-guarded: the transition table in
//! `conveyor-core` is checked first, then the UPDATE itself re-asserts the
//! expected current status so concurrent writers cannot race a terminal
//! instance back to life.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use tracing::{debug, instrument};
use uuid::Uuid;

use conveyor_core::status::InstanceStatus;

use crate::error::StoreError;
use crate::models::{
    CreateWorkflowInstance, InstanceFilter, Pagination, WorkflowInstanceRow, WorkflowStats,
};
use crate::store::InstanceStore;

const INSTANCE_COLUMNS: &str = "id, definition_id, definition_name, version, status, \
     current_node_id, input_data, result, retry_count, max_retries, error_message, \
     started_at, completed_at, created_at, updated_at";

/// PostgreSQL implementation of [`InstanceStore`].
#[derive(Clone)]
pub struct PgInstanceStore {
    pool: PgPool,
}

impl PgInstanceStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl InstanceStore for PgInstanceStore {
    #[instrument(skip(self, input), fields(definition = %input.definition_name))]
    async fn create(
        &self,
        input: CreateWorkflowInstance,
    ) -> Result<WorkflowInstanceRow, StoreError> {
        let id = Uuid::now_v7();

        let row = sqlx::query_as::<_, WorkflowInstanceRow>(&format!(
            r#"
            INSERT INTO workflow_instances (
                id, definition_id, definition_name, version, status, input_data, max_retries
            )
            VALUES ($1, $2, $3, $4, 'pending', $5, $6)
            RETURNING {INSTANCE_COLUMNS}
            "#
        ))
        .bind(id)
        .bind(input.definition_id)
        .bind(&input.definition_name)
        .bind(input.version)
        .bind(&input.input_data)
        .bind(input.max_retries)
        .fetch_one(&self.pool)
        .await?;

        debug!(instance_id = %row.id, "created workflow instance");
        Ok(row)
    }

    async fn get(&self, id: Uuid) -> Result<Option<WorkflowInstanceRow>, StoreError> {
        let row = sqlx::query_as::<_, WorkflowInstanceRow>(&format!(
            "SELECT {INSTANCE_COLUMNS} FROM workflow_instances WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row)
    }

    #[instrument(skip(self, error_message))]
    async fn update_status(
        &self,
        id: Uuid,
        status: InstanceStatus,
        error_message: Option<&str>,
    ) -> Result<WorkflowInstanceRow, StoreError> {
        let current = self.get(id).await?.ok_or(StoreError::InstanceNotFound(id))?;
        let from: InstanceStatus = current
            .parsed_status()
            .map_err(StoreError::Serialization)?;

        if !from.can_transition_to(status) {
            return Err(StoreError::invalid_transition(from, status));
        }

        let (set_started, set_completed) = match status {
            InstanceStatus::Running => (true, false),
            s if s.is_terminal() => (false, true),
            _ => (false, false),
        };

        // Re-assert the expected current status so a concurrent transition
        // loses cleanly instead of double-applying.
        let row = sqlx::query_as::<_, WorkflowInstanceRow>(&format!(
            r#"
            UPDATE workflow_instances
            SET status = $3,
                error_message = COALESCE($4, error_message),
                started_at = CASE WHEN $5 AND started_at IS NULL THEN NOW() ELSE started_at END,
                completed_at = CASE WHEN $6 THEN NOW() ELSE completed_at END,
                updated_at = NOW()
            WHERE id = $1 AND status = $2
            RETURNING {INSTANCE_COLUMNS}
            "#
        ))
        .bind(id)
        .bind(from.to_string())
        .bind(status.to_string())
        .bind(error_message)
        .bind(set_started)
        .bind(set_completed)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| StoreError::invalid_transition(from, status))?;

        debug!(instance_id = %id, from = %from, to = %status, "updated instance status");
        Ok(row)
    }

    async fn set_current_node(&self, id: Uuid, node_id: Option<&str>) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE workflow_instances SET current_node_id = $2, updated_at = NOW() WHERE id = $1",
        )
        .bind(id)
        .bind(node_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn set_result(&self, id: Uuid, result: serde_json::Value) -> Result<(), StoreError> {
        sqlx::query("UPDATE workflow_instances SET result = $2, updated_at = NOW() WHERE id = $1")
            .bind(id)
            .bind(&result)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn increment_retry_count(&self, id: Uuid) -> Result<i32, StoreError> {
        use sqlx::Row;

        let row = sqlx::query(
            r#"
            UPDATE workflow_instances
            SET retry_count = retry_count + 1, updated_at = NOW()
            WHERE id = $1
            RETURNING retry_count
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(StoreError::InstanceNotFound(id))?;

        Ok(row.get("retry_count"))
    }

    #[instrument(skip(self))]
    async fn find_interrupted_instances(&self) -> Result<Vec<WorkflowInstanceRow>, StoreError> {
        // A running instance is interrupted once its owner's workflow lock
        // is gone or expired; explicitly interrupted instances qualify too.
        let rows = sqlx::query_as::<_, WorkflowInstanceRow>(&format!(
            r#"
            SELECT {INSTANCE_COLUMNS}
            FROM workflow_instances w
            WHERE w.status = 'interrupted'
               OR (
                    w.status = 'running'
                    AND NOT EXISTS (
                        SELECT 1 FROM locks l
                        WHERE l.lock_key = 'workflow:' || w.id::text
                          AND l.expires_at > NOW()
                    )
               )
            ORDER BY w.created_at ASC
            "#
        ))
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }

    async fn list(
        &self,
        filter: InstanceFilter,
        page: Pagination,
    ) -> Result<Vec<WorkflowInstanceRow>, StoreError> {
        let rows = sqlx::query_as::<_, WorkflowInstanceRow>(&format!(
            r#"
            SELECT {INSTANCE_COLUMNS}
            FROM workflow_instances
            WHERE ($1::uuid IS NULL OR definition_id = $1)
              AND ($2::text IS NULL OR definition_name = $2)
              AND ($3::text IS NULL OR status = $3)
              AND ($4::timestamptz IS NULL OR created_at >= $4)
              AND ($5::timestamptz IS NULL OR created_at < $5)
            ORDER BY created_at DESC
            OFFSET $6
            LIMIT $7
            "#
        ))
        .bind(filter.definition_id)
        .bind(&filter.definition_name)
        .bind(filter.status.map(|s| s.to_string()))
        .bind(filter.created_after)
        .bind(filter.created_before)
        .bind(page.offset as i64)
        .bind(page.limit as i64)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }

    async fn stats(
        &self,
        definition_id: Option<Uuid>,
        since: Option<DateTime<Utc>>,
    ) -> Result<WorkflowStats, StoreError> {
        use sqlx::Row;

        let row = sqlx::query(
            r#"
            SELECT
                COUNT(*) AS total,
                COUNT(*) FILTER (WHERE status = 'pending') AS pending,
                COUNT(*) FILTER (WHERE status = 'running') AS running,
                COUNT(*) FILTER (WHERE status = 'completed') AS completed,
                COUNT(*) FILTER (WHERE status = 'failed') AS failed,
                COUNT(*) FILTER (WHERE status = 'cancelled') AS cancelled,
                COUNT(*) FILTER (WHERE status = 'interrupted') AS interrupted,
                AVG(EXTRACT(EPOCH FROM (completed_at - started_at)) * 1000)
                    FILTER (WHERE completed_at IS NOT NULL AND started_at IS NOT NULL)
                    ::double precision AS avg_duration_ms
            FROM workflow_instances
            WHERE ($1::uuid IS NULL OR definition_id = $1)
              AND ($2::timestamptz IS NULL OR created_at >= $2)
            "#,
        )
        .bind(definition_id)
        .bind(since)
        .fetch_one(&self.pool)
        .await?;

        Ok(WorkflowStats {
            total: row.get("total"),
            pending: row.get("pending"),
            running: row.get("running"),
            completed: row.get("completed"),
            failed: row.get("failed"),
            cancelled: row.get("cancelled"),
            interrupted: row.get("interrupted"),
            avg_duration_ms: row.get("avg_duration_ms"),
        })
    }

    #[instrument(skip(self))]
    async fn cleanup_expired(&self, before: DateTime<Utc>) -> Result<u64, StoreError> {
        let result = sqlx::query(
            r#"
            DELETE FROM workflow_instances
            WHERE status IN ('completed', 'failed', 'cancelled')
              AND completed_at IS NOT NULL
              AND completed_at < $1
            "#,
        )
        .bind(before)
        .execute(&self.pool)
        .await?;

        let removed = result.rows_affected();
        if removed > 0 {
            debug!(count = removed, "cleaned up expired instances");
        }
        Ok(removed)
    }
}
