//! PostgreSQL workflow definition store
//!
//! A partial unique index enforces at most one active version per name;
//! activation swaps the flag inside one transaction.

use async_trait::async_trait;
use sqlx::PgPool;
use tracing::{debug, instrument};
use uuid::Uuid;

use crate::error::StoreError;
use crate::models::{CreateWorkflowDefinition, WorkflowDefinitionRow};
use crate::store::DefinitionStore;

const DEFINITION_COLUMNS: &str = "id, name, version, graph, is_active, created_at, updated_at";

/// PostgreSQL implementation of [`DefinitionStore`].
#[derive(Clone)]
pub struct PgDefinitionStore {
    pool: PgPool,
}

impl PgDefinitionStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl DefinitionStore for PgDefinitionStore {
    #[instrument(skip(self, input), fields(name = %input.name, version = input.version))]
    async fn create(
        &self,
        input: CreateWorkflowDefinition,
    ) -> Result<WorkflowDefinitionRow, StoreError> {
        let id = Uuid::now_v7();
        let mut tx = self.pool.begin().await?;

        if input.activate {
            sqlx::query("UPDATE workflow_definitions SET is_active = FALSE, updated_at = NOW() WHERE name = $1 AND is_active")
                .bind(&input.name)
                .execute(&mut *tx)
                .await?;
        }

        let row = sqlx::query_as::<_, WorkflowDefinitionRow>(&format!(
            r#"
            INSERT INTO workflow_definitions (id, name, version, graph, is_active)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING {DEFINITION_COLUMNS}
            "#
        ))
        .bind(id)
        .bind(&input.name)
        .bind(input.version)
        .bind(&input.graph)
        .bind(input.activate)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;

        debug!(definition_id = %row.id, "created workflow definition");
        Ok(row)
    }

    async fn update_graph(
        &self,
        id: Uuid,
        graph: serde_json::Value,
    ) -> Result<Option<WorkflowDefinitionRow>, StoreError> {
        let row = sqlx::query_as::<_, WorkflowDefinitionRow>(&format!(
            r#"
            UPDATE workflow_definitions
            SET graph = $2, updated_at = NOW()
            WHERE id = $1
            RETURNING {DEFINITION_COLUMNS}
            "#
        ))
        .bind(id)
        .bind(&graph)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row)
    }

    async fn get_by_id(&self, id: Uuid) -> Result<Option<WorkflowDefinitionRow>, StoreError> {
        let row = sqlx::query_as::<_, WorkflowDefinitionRow>(&format!(
            "SELECT {DEFINITION_COLUMNS} FROM workflow_definitions WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row)
    }

    async fn get_by_name_and_version(
        &self,
        name: &str,
        version: i32,
    ) -> Result<Option<WorkflowDefinitionRow>, StoreError> {
        let row = sqlx::query_as::<_, WorkflowDefinitionRow>(&format!(
            "SELECT {DEFINITION_COLUMNS} FROM workflow_definitions WHERE name = $1 AND version = $2"
        ))
        .bind(name)
        .bind(version)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row)
    }

    async fn get_active_by_name(
        &self,
        name: &str,
    ) -> Result<Option<WorkflowDefinitionRow>, StoreError> {
        let row = sqlx::query_as::<_, WorkflowDefinitionRow>(&format!(
            "SELECT {DEFINITION_COLUMNS} FROM workflow_definitions WHERE name = $1 AND is_active"
        ))
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row)
    }

    async fn list_versions(&self, name: &str) -> Result<Vec<WorkflowDefinitionRow>, StoreError> {
        let rows = sqlx::query_as::<_, WorkflowDefinitionRow>(&format!(
            r#"
            SELECT {DEFINITION_COLUMNS}
            FROM workflow_definitions
            WHERE name = $1
            ORDER BY version DESC
            "#
        ))
        .bind(name)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }

    #[instrument(skip(self))]
    async fn activate_version(&self, name: &str, version: i32) -> Result<bool, StoreError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("UPDATE workflow_definitions SET is_active = FALSE, updated_at = NOW() WHERE name = $1 AND is_active")
            .bind(name)
            .execute(&mut *tx)
            .await?;

        let result = sqlx::query(
            r#"
            UPDATE workflow_definitions
            SET is_active = TRUE, updated_at = NOW()
            WHERE name = $1 AND version = $2
            "#,
        )
        .bind(name)
        .bind(version)
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            // Unknown version: leave the previous activation untouched.
            tx.rollback().await?;
            return Ok(false);
        }

        tx.commit().await?;

        debug!(name, version, "activated definition version");
        Ok(true)
    }
}
