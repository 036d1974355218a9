//! PostgreSQL node instance store
//!
//! Sub-node identity is `(workflow_instance_id, parent_node_id, child_index)`
//! (unique partial index), which makes the loop fan-out transaction
//! idempotent under replay: a redo after a crash conflicts instead of
//! double-creating children. Descendant traversal is a recursive CTE with a
//! depth cap for cycle safety.

use async_trait::async_trait;
use sqlx::PgPool;
use tracing::{debug, instrument};
use uuid::Uuid;

use conveyor_core::status::{LoopProgress, NodeStatus};

use crate::error::StoreError;
use crate::models::{CreateNodeInstance, NodeInstanceRow};
use crate::store::NodeStore;

const NODE_COLUMNS: &str = "id, workflow_instance_id, parent_node_id, node_id, node_name, \
     node_type, status, child_index, input_data, result, loop_progress, job_id, retry_count, \
     error_message, error_details, started_at, completed_at, created_at, updated_at";

/// PostgreSQL implementation of [`NodeStore`].
#[derive(Clone)]
pub struct PgNodeStore {
    pool: PgPool,
}

impl PgNodeStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn insert_one<'e, E>(
        executor: E,
        input: &CreateNodeInstance,
    ) -> Result<NodeInstanceRow, StoreError>
    where
        E: sqlx::Executor<'e, Database = sqlx::Postgres>,
    {
        let id = Uuid::now_v7();

        let row = sqlx::query_as::<_, NodeInstanceRow>(&format!(
            r#"
            INSERT INTO node_instances (
                id, workflow_instance_id, parent_node_id, node_id, node_name,
                node_type, status, child_index, input_data
            )
            VALUES ($1, $2, $3, $4, $5, $6, 'pending', $7, $8)
            RETURNING {NODE_COLUMNS}
            "#
        ))
        .bind(id)
        .bind(input.workflow_instance_id)
        .bind(input.parent_node_id)
        .bind(&input.node_id)
        .bind(&input.node_name)
        .bind(&input.node_type)
        .bind(input.child_index)
        .bind(&input.input_data)
        .fetch_one(executor)
        .await?;

        Ok(row)
    }
}

#[async_trait]
impl NodeStore for PgNodeStore {
    #[instrument(skip(self, input), fields(node_id = %input.node_id))]
    async fn create(&self, input: CreateNodeInstance) -> Result<NodeInstanceRow, StoreError> {
        let row = Self::insert_one(&self.pool, &input).await?;
        debug!(node_instance_id = %row.id, "created node instance");
        Ok(row)
    }

    async fn create_many(
        &self,
        inputs: Vec<CreateNodeInstance>,
    ) -> Result<Vec<NodeInstanceRow>, StoreError> {
        let mut tx = self.pool.begin().await?;

        let mut rows = Vec::with_capacity(inputs.len());
        for input in &inputs {
            rows.push(Self::insert_one(&mut *tx, input).await?);
        }

        tx.commit().await?;
        Ok(rows)
    }

    #[instrument(skip(self, children, progress), fields(count = children.len()))]
    async fn create_loop_children(
        &self,
        parent_instance_id: Uuid,
        children: Vec<CreateNodeInstance>,
        progress: LoopProgress,
    ) -> Result<Vec<NodeInstanceRow>, StoreError> {
        let progress_json = serde_json::to_value(&progress)?;

        let mut tx = self.pool.begin().await?;

        let mut rows = Vec::with_capacity(children.len());
        for child in &children {
            rows.push(Self::insert_one(&mut *tx, child).await?);
        }

        let updated = sqlx::query(
            r#"
            UPDATE node_instances
            SET loop_progress = $2, updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(parent_instance_id)
        .bind(&progress_json)
        .execute(&mut *tx)
        .await?;

        if updated.rows_affected() == 0 {
            // Parent vanished; roll the children back with the transaction.
            return Err(StoreError::NodeNotFound(parent_instance_id));
        }

        tx.commit().await?;

        debug!(parent = %parent_instance_id, count = rows.len(), "created loop children");
        Ok(rows)
    }

    async fn get(&self, id: Uuid) -> Result<Option<NodeInstanceRow>, StoreError> {
        let row = sqlx::query_as::<_, NodeInstanceRow>(&format!(
            "SELECT {NODE_COLUMNS} FROM node_instances WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row)
    }

    async fn find_by_workflow_and_node_id(
        &self,
        workflow_instance_id: Uuid,
        node_id: &str,
    ) -> Result<Option<NodeInstanceRow>, StoreError> {
        let row = sqlx::query_as::<_, NodeInstanceRow>(&format!(
            r#"
            SELECT {NODE_COLUMNS}
            FROM node_instances
            WHERE workflow_instance_id = $1
              AND node_id = $2
              AND parent_node_id IS NULL
            "#
        ))
        .bind(workflow_instance_id)
        .bind(node_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row)
    }

    async fn find_top_level(
        &self,
        workflow_instance_id: Uuid,
    ) -> Result<Vec<NodeInstanceRow>, StoreError> {
        let rows = sqlx::query_as::<_, NodeInstanceRow>(&format!(
            r#"
            SELECT {NODE_COLUMNS}
            FROM node_instances
            WHERE workflow_instance_id = $1 AND parent_node_id IS NULL
            ORDER BY created_at ASC, id ASC
            "#
        ))
        .bind(workflow_instance_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }

    async fn find_child_nodes(
        &self,
        parent_instance_id: Uuid,
    ) -> Result<Vec<NodeInstanceRow>, StoreError> {
        let rows = sqlx::query_as::<_, NodeInstanceRow>(&format!(
            r#"
            SELECT {NODE_COLUMNS}
            FROM node_instances
            WHERE parent_node_id = $1
            ORDER BY child_index ASC, id ASC
            "#
        ))
        .bind(parent_instance_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }

    async fn find_all_child_nodes(
        &self,
        parent_instance_id: Uuid,
    ) -> Result<Vec<NodeInstanceRow>, StoreError> {
        // Depth-capped recursive CTE; the cap makes the traversal terminate
        // even if parent pointers were ever corrupted into a cycle.
        let rows = sqlx::query_as::<_, NodeInstanceRow>(&format!(
            r#"
            WITH RECURSIVE descendants AS (
                SELECT n.*, 1 AS depth
                FROM node_instances n
                WHERE n.parent_node_id = $1
                UNION ALL
                SELECT n.*, d.depth + 1
                FROM node_instances n
                JOIN descendants d ON n.parent_node_id = d.id
                WHERE d.depth < 32
            )
            SELECT {NODE_COLUMNS}
            FROM descendants
            ORDER BY depth ASC, child_index ASC, id ASC
            "#
        ))
        .bind(parent_instance_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }

    async fn find_pending_child_nodes(
        &self,
        parent_instance_id: Uuid,
    ) -> Result<Vec<NodeInstanceRow>, StoreError> {
        let rows = sqlx::query_as::<_, NodeInstanceRow>(&format!(
            r#"
            SELECT {NODE_COLUMNS}
            FROM node_instances
            WHERE parent_node_id = $1 AND status = 'pending'
            ORDER BY child_index ASC, id ASC
            "#
        ))
        .bind(parent_instance_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }

    async fn find_by_status(
        &self,
        workflow_instance_id: Uuid,
        status: NodeStatus,
    ) -> Result<Vec<NodeInstanceRow>, StoreError> {
        let rows = sqlx::query_as::<_, NodeInstanceRow>(&format!(
            r#"
            SELECT {NODE_COLUMNS}
            FROM node_instances
            WHERE workflow_instance_id = $1 AND status = $2
            ORDER BY created_at ASC, id ASC
            "#
        ))
        .bind(workflow_instance_id)
        .bind(status.to_string())
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }

    #[instrument(skip(self, error_message, error_details))]
    async fn update_status(
        &self,
        id: Uuid,
        status: NodeStatus,
        error_message: Option<&str>,
        error_details: Option<serde_json::Value>,
    ) -> Result<NodeInstanceRow, StoreError> {
        let current = self.get(id).await?.ok_or(StoreError::NodeNotFound(id))?;
        let from: NodeStatus = current.parsed_status().map_err(StoreError::Serialization)?;

        if !from.can_transition_to(status) {
            return Err(StoreError::invalid_transition(from, status));
        }

        let (set_started, set_completed) = match status {
            NodeStatus::Running => (true, false),
            s if s.is_terminal() => (false, true),
            _ => (false, false),
        };

        let row = sqlx::query_as::<_, NodeInstanceRow>(&format!(
            r#"
            UPDATE node_instances
            SET status = $3,
                error_message = COALESCE($4, error_message),
                error_details = COALESCE($5, error_details),
                started_at = CASE WHEN $6 AND started_at IS NULL THEN NOW() ELSE started_at END,
                completed_at = CASE WHEN $7 THEN NOW() ELSE completed_at END,
                updated_at = NOW()
            WHERE id = $1 AND status = $2
            RETURNING {NODE_COLUMNS}
            "#
        ))
        .bind(id)
        .bind(from.to_string())
        .bind(status.to_string())
        .bind(error_message)
        .bind(&error_details)
        .bind(set_started)
        .bind(set_completed)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| StoreError::invalid_transition(from, status))?;

        debug!(node_instance_id = %id, from = %from, to = %status, "updated node status");
        Ok(row)
    }

    async fn set_result(&self, id: Uuid, result: serde_json::Value) -> Result<(), StoreError> {
        sqlx::query("UPDATE node_instances SET result = $2, updated_at = NOW() WHERE id = $1")
            .bind(id)
            .bind(&result)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn set_job_id(&self, id: Uuid, job_id: Option<Uuid>) -> Result<(), StoreError> {
        sqlx::query("UPDATE node_instances SET job_id = $2, updated_at = NOW() WHERE id = $1")
            .bind(id)
            .bind(job_id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn increment_retry_count(&self, id: Uuid) -> Result<i32, StoreError> {
        use sqlx::Row;

        let row = sqlx::query(
            r#"
            UPDATE node_instances
            SET retry_count = retry_count + 1, updated_at = NOW()
            WHERE id = $1
            RETURNING retry_count
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(StoreError::NodeNotFound(id))?;

        Ok(row.get("retry_count"))
    }

    async fn update_loop_progress(
        &self,
        id: Uuid,
        progress: LoopProgress,
    ) -> Result<(), StoreError> {
        let progress_json = serde_json::to_value(&progress)?;

        let result = sqlx::query(
            "UPDATE node_instances SET loop_progress = $2, updated_at = NOW() WHERE id = $1",
        )
        .bind(id)
        .bind(&progress_json)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NodeNotFound(id));
        }
        Ok(())
    }
}
