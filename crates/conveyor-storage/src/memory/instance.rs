//! In-memory workflow instance store

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use conveyor_core::status::InstanceStatus;

use crate::error::StoreError;
use crate::models::{
    CreateWorkflowInstance, InstanceFilter, Pagination, WorkflowInstanceRow, WorkflowStats,
};
use crate::store::InstanceStore;

use super::InMemoryState;

/// In-memory implementation of [`InstanceStore`].
#[derive(Clone)]
pub struct InMemoryInstanceStore {
    state: Arc<InMemoryState>,
}

impl InMemoryInstanceStore {
    pub fn new(state: Arc<InMemoryState>) -> Self {
        Self { state }
    }
}

#[async_trait]
impl InstanceStore for InMemoryInstanceStore {
    async fn create(
        &self,
        input: CreateWorkflowInstance,
    ) -> Result<WorkflowInstanceRow, StoreError> {
        let now = Utc::now();
        let row = WorkflowInstanceRow {
            id: Uuid::now_v7(),
            definition_id: input.definition_id,
            definition_name: input.definition_name,
            version: input.version,
            status: "pending".to_string(),
            current_node_id: None,
            input_data: input.input_data,
            result: None,
            retry_count: 0,
            max_retries: input.max_retries,
            error_message: None,
            started_at: None,
            completed_at: None,
            created_at: now,
            updated_at: now,
        };

        self.state.instances.write().insert(row.id, row.clone());
        Ok(row)
    }

    async fn get(&self, id: Uuid) -> Result<Option<WorkflowInstanceRow>, StoreError> {
        Ok(self.state.instances.read().get(&id).cloned())
    }

    async fn update_status(
        &self,
        id: Uuid,
        status: InstanceStatus,
        error_message: Option<&str>,
    ) -> Result<WorkflowInstanceRow, StoreError> {
        let now = Utc::now();
        let mut instances = self.state.instances.write();
        let instance = instances
            .get_mut(&id)
            .ok_or(StoreError::InstanceNotFound(id))?;

        let from: InstanceStatus = instance
            .parsed_status()
            .map_err(StoreError::Serialization)?;
        if !from.can_transition_to(status) {
            return Err(StoreError::invalid_transition(from, status));
        }

        instance.status = status.to_string();
        if let Some(message) = error_message {
            instance.error_message = Some(message.to_string());
        }
        if status == InstanceStatus::Running && instance.started_at.is_none() {
            instance.started_at = Some(now);
        }
        if status.is_terminal() {
            instance.completed_at = Some(now);
        }
        instance.updated_at = now;
        Ok(instance.clone())
    }

    async fn set_current_node(&self, id: Uuid, node_id: Option<&str>) -> Result<(), StoreError> {
        let mut instances = self.state.instances.write();
        if let Some(instance) = instances.get_mut(&id) {
            instance.current_node_id = node_id.map(str::to_string);
            instance.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn set_result(&self, id: Uuid, result: serde_json::Value) -> Result<(), StoreError> {
        let mut instances = self.state.instances.write();
        if let Some(instance) = instances.get_mut(&id) {
            instance.result = Some(result);
            instance.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn increment_retry_count(&self, id: Uuid) -> Result<i32, StoreError> {
        let mut instances = self.state.instances.write();
        let instance = instances
            .get_mut(&id)
            .ok_or(StoreError::InstanceNotFound(id))?;
        instance.retry_count += 1;
        instance.updated_at = Utc::now();
        Ok(instance.retry_count)
    }

    async fn find_interrupted_instances(&self) -> Result<Vec<WorkflowInstanceRow>, StoreError> {
        let now = Utc::now();
        let locks = self.state.locks.read();
        let instances = self.state.instances.read();

        let mut rows: Vec<WorkflowInstanceRow> = instances
            .values()
            .filter(|w| {
                if w.status == "interrupted" {
                    return true;
                }
                if w.status != "running" {
                    return false;
                }
                let key = format!("workflow:{}", w.id);
                !locks.get(&key).is_some_and(|l| l.expires_at > now)
            })
            .cloned()
            .collect();
        rows.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(rows)
    }

    async fn list(
        &self,
        filter: InstanceFilter,
        page: Pagination,
    ) -> Result<Vec<WorkflowInstanceRow>, StoreError> {
        let status = filter.status.map(|s| s.to_string());
        let instances = self.state.instances.read();

        let mut rows: Vec<WorkflowInstanceRow> = instances
            .values()
            .filter(|w| filter.definition_id.is_none_or(|id| w.definition_id == id))
            .filter(|w| {
                filter
                    .definition_name
                    .as_ref()
                    .is_none_or(|n| &w.definition_name == n)
            })
            .filter(|w| status.as_ref().is_none_or(|s| &w.status == s))
            .filter(|w| filter.created_after.is_none_or(|t| w.created_at >= t))
            .filter(|w| filter.created_before.is_none_or(|t| w.created_at < t))
            .cloned()
            .collect();
        rows.sort_by(|a, b| b.created_at.cmp(&a.created_at));

        let start = (page.offset as usize).min(rows.len());
        let end = (start + page.limit as usize).min(rows.len());
        Ok(rows[start..end].to_vec())
    }

    async fn stats(
        &self,
        definition_id: Option<Uuid>,
        since: Option<DateTime<Utc>>,
    ) -> Result<WorkflowStats, StoreError> {
        let instances = self.state.instances.read();
        let mut stats = WorkflowStats::default();
        let mut durations = vec![];

        for instance in instances
            .values()
            .filter(|w| definition_id.is_none_or(|id| w.definition_id == id))
            .filter(|w| since.is_none_or(|t| w.created_at >= t))
        {
            stats.total += 1;
            match instance.status.as_str() {
                "pending" => stats.pending += 1,
                "running" => stats.running += 1,
                "completed" => stats.completed += 1,
                "failed" => stats.failed += 1,
                "cancelled" => stats.cancelled += 1,
                "interrupted" => stats.interrupted += 1,
                _ => {}
            }
            if let (Some(started), Some(completed)) = (instance.started_at, instance.completed_at)
            {
                durations.push((completed - started).num_milliseconds() as f64);
            }
        }

        if !durations.is_empty() {
            stats.avg_duration_ms = Some(durations.iter().sum::<f64>() / durations.len() as f64);
        }
        Ok(stats)
    }

    async fn cleanup_expired(&self, before: DateTime<Utc>) -> Result<u64, StoreError> {
        let mut instances = self.state.instances.write();
        let before_len = instances.len();

        let expired: Vec<Uuid> = instances
            .values()
            .filter(|w| {
                matches!(w.status.as_str(), "completed" | "failed" | "cancelled")
                    && w.completed_at.is_some_and(|t| t < before)
            })
            .map(|w| w.id)
            .collect();

        for id in &expired {
            instances.remove(id);
        }

        // Cascade: drop node instances of removed workflows.
        if !expired.is_empty() {
            self.state
                .nodes
                .write()
                .retain(|_, n| !expired.contains(&n.workflow_instance_id));
        }

        Ok((before_len - instances.len()) as u64)
    }
}
