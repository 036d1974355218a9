//! In-memory execution log store

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::StoreError;
use crate::models::{CreateExecutionLog, ExecutionLogRow, Pagination};
use crate::store::ExecutionLogStore;

use super::InMemoryState;

/// In-memory implementation of [`ExecutionLogStore`].
#[derive(Clone)]
pub struct InMemoryExecutionLogStore {
    state: Arc<InMemoryState>,
}

impl InMemoryExecutionLogStore {
    pub fn new(state: Arc<InMemoryState>) -> Self {
        Self { state }
    }

    fn build_row(input: &CreateExecutionLog) -> ExecutionLogRow {
        ExecutionLogRow {
            id: Uuid::now_v7(),
            workflow_instance_id: input.workflow_instance_id,
            node_instance_id: input.node_instance_id,
            level: input.level.clone(),
            phase: input.phase.clone(),
            message: input.message.clone(),
            details: input.details.clone(),
            created_at: Utc::now(),
        }
    }

    fn page(rows: Vec<ExecutionLogRow>, page: Pagination) -> Vec<ExecutionLogRow> {
        let start = (page.offset as usize).min(rows.len());
        let end = (start + page.limit as usize).min(rows.len());
        rows[start..end].to_vec()
    }
}

#[async_trait]
impl ExecutionLogStore for InMemoryExecutionLogStore {
    async fn create(&self, input: CreateExecutionLog) -> Result<ExecutionLogRow, StoreError> {
        let row = Self::build_row(&input);
        self.state.logs.write().push(row.clone());
        Ok(row)
    }

    async fn create_many(&self, inputs: Vec<CreateExecutionLog>) -> Result<u64, StoreError> {
        let mut logs = self.state.logs.write();
        for input in &inputs {
            logs.push(Self::build_row(input));
        }
        Ok(inputs.len() as u64)
    }

    async fn find_by_workflow_instance_id(
        &self,
        workflow_instance_id: Uuid,
        page: Pagination,
    ) -> Result<Vec<ExecutionLogRow>, StoreError> {
        let rows: Vec<ExecutionLogRow> = self
            .state
            .logs
            .read()
            .iter()
            .filter(|l| l.workflow_instance_id == Some(workflow_instance_id))
            .cloned()
            .collect();
        Ok(Self::page(rows, page))
    }

    async fn find_by_node_instance_id(
        &self,
        node_instance_id: Uuid,
        page: Pagination,
    ) -> Result<Vec<ExecutionLogRow>, StoreError> {
        let rows: Vec<ExecutionLogRow> = self
            .state
            .logs
            .read()
            .iter()
            .filter(|l| l.node_instance_id == Some(node_instance_id))
            .cloned()
            .collect();
        Ok(Self::page(rows, page))
    }

    async fn find_by_level(
        &self,
        level: &str,
        page: Pagination,
    ) -> Result<Vec<ExecutionLogRow>, StoreError> {
        let mut rows: Vec<ExecutionLogRow> = self
            .state
            .logs
            .read()
            .iter()
            .filter(|l| l.level == level)
            .cloned()
            .collect();
        rows.reverse();
        Ok(Self::page(rows, page))
    }

    async fn delete_expired_logs(&self, before: DateTime<Utc>) -> Result<u64, StoreError> {
        let mut logs = self.state.logs.write();
        let before_len = logs.len();
        logs.retain(|l| l.created_at >= before);
        Ok((before_len - logs.len()) as u64)
    }
}
