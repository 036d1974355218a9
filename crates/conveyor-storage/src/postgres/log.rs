//! PostgreSQL execution log store
//!
//! Append-only. Call sites treat writes as best-effort; failures here must
//! never fail a workflow step.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use tracing::{debug, instrument};
use uuid::Uuid;

use crate::error::StoreError;
use crate::models::{CreateExecutionLog, ExecutionLogRow, Pagination};
use crate::store::ExecutionLogStore;

const LOG_COLUMNS: &str =
    "id, workflow_instance_id, node_instance_id, level, phase, message, details, created_at";

/// PostgreSQL implementation of [`ExecutionLogStore`].
#[derive(Clone)]
pub struct PgExecutionLogStore {
    pool: PgPool,
}

impl PgExecutionLogStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ExecutionLogStore for PgExecutionLogStore {
    async fn create(&self, input: CreateExecutionLog) -> Result<ExecutionLogRow, StoreError> {
        let id = Uuid::now_v7();

        let row = sqlx::query_as::<_, ExecutionLogRow>(&format!(
            r#"
            INSERT INTO execution_logs (
                id, workflow_instance_id, node_instance_id, level, phase, message, details
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            RETURNING {LOG_COLUMNS}
            "#
        ))
        .bind(id)
        .bind(input.workflow_instance_id)
        .bind(input.node_instance_id)
        .bind(&input.level)
        .bind(&input.phase)
        .bind(&input.message)
        .bind(&input.details)
        .fetch_one(&self.pool)
        .await?;

        Ok(row)
    }

    async fn create_many(&self, inputs: Vec<CreateExecutionLog>) -> Result<u64, StoreError> {
        if inputs.is_empty() {
            return Ok(0);
        }

        let mut tx = self.pool.begin().await?;
        let count = inputs.len() as u64;

        for input in &inputs {
            sqlx::query(
                r#"
                INSERT INTO execution_logs (
                    id, workflow_instance_id, node_instance_id, level, phase, message, details
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7)
                "#,
            )
            .bind(Uuid::now_v7())
            .bind(input.workflow_instance_id)
            .bind(input.node_instance_id)
            .bind(&input.level)
            .bind(&input.phase)
            .bind(&input.message)
            .bind(&input.details)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(count)
    }

    async fn find_by_workflow_instance_id(
        &self,
        workflow_instance_id: Uuid,
        page: Pagination,
    ) -> Result<Vec<ExecutionLogRow>, StoreError> {
        let rows = sqlx::query_as::<_, ExecutionLogRow>(&format!(
            r#"
            SELECT {LOG_COLUMNS}
            FROM execution_logs
            WHERE workflow_instance_id = $1
            ORDER BY created_at ASC, id ASC
            OFFSET $2
            LIMIT $3
            "#
        ))
        .bind(workflow_instance_id)
        .bind(page.offset as i64)
        .bind(page.limit as i64)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }

    async fn find_by_node_instance_id(
        &self,
        node_instance_id: Uuid,
        page: Pagination,
    ) -> Result<Vec<ExecutionLogRow>, StoreError> {
        let rows = sqlx::query_as::<_, ExecutionLogRow>(&format!(
            r#"
            SELECT {LOG_COLUMNS}
            FROM execution_logs
            WHERE node_instance_id = $1
            ORDER BY created_at ASC, id ASC
            OFFSET $2
            LIMIT $3
            "#
        ))
        .bind(node_instance_id)
        .bind(page.offset as i64)
        .bind(page.limit as i64)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }

    async fn find_by_level(
        &self,
        level: &str,
        page: Pagination,
    ) -> Result<Vec<ExecutionLogRow>, StoreError> {
        let rows = sqlx::query_as::<_, ExecutionLogRow>(&format!(
            r#"
            SELECT {LOG_COLUMNS}
            FROM execution_logs
            WHERE level = $1
            ORDER BY created_at DESC, id DESC
            OFFSET $2
            LIMIT $3
            "#
        ))
        .bind(level)
        .bind(page.offset as i64)
        .bind(page.limit as i64)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }

    #[instrument(skip(self))]
    async fn delete_expired_logs(&self, before: DateTime<Utc>) -> Result<u64, StoreError> {
        let result = sqlx::query("DELETE FROM execution_logs WHERE created_at < $1")
            .bind(before)
            .execute(&self.pool)
            .await?;

        let removed = result.rows_affected();
        if removed > 0 {
            debug!(count = removed, "deleted expired execution logs");
        }
        Ok(removed)
    }
}
