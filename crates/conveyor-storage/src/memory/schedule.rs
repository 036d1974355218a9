//! In-memory schedule store

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::StoreError;
use crate::models::{
    CreateSchedule, Pagination, ScheduleExecutionRow, ScheduleRow, UpdateSchedule,
};
use crate::store::ScheduleStore;

use super::InMemoryState;

/// In-memory implementation of [`ScheduleStore`].
#[derive(Clone)]
pub struct InMemoryScheduleStore {
    state: Arc<InMemoryState>,
}

impl InMemoryScheduleStore {
    pub fn new(state: Arc<InMemoryState>) -> Self {
        Self { state }
    }
}

#[async_trait]
impl ScheduleStore for InMemoryScheduleStore {
    async fn create(&self, input: CreateSchedule) -> Result<ScheduleRow, StoreError> {
        let now = Utc::now();
        let row = ScheduleRow {
            id: Uuid::now_v7(),
            workflow_definition_id: input.workflow_definition_id,
            cron: input.cron,
            timezone: input.timezone,
            enabled: input.enabled,
            next_run_at: input.next_run_at,
            last_run_at: None,
            max_instances: input.max_instances,
            input_data: input.input_data,
            created_at: now,
            updated_at: now,
        };

        self.state.schedules.write().insert(row.id, row.clone());
        Ok(row)
    }

    async fn update(
        &self,
        id: Uuid,
        input: UpdateSchedule,
    ) -> Result<Option<ScheduleRow>, StoreError> {
        let mut schedules = self.state.schedules.write();
        Ok(schedules.get_mut(&id).map(|s| {
            if let Some(cron) = input.cron {
                s.cron = cron;
            }
            if let Some(timezone) = input.timezone {
                s.timezone = timezone;
            }
            if let Some(enabled) = input.enabled {
                s.enabled = enabled;
            }
            if let Some(next_run_at) = input.next_run_at {
                s.next_run_at = next_run_at;
            }
            if let Some(max_instances) = input.max_instances {
                s.max_instances = max_instances;
            }
            if let Some(input_data) = input.input_data {
                s.input_data = Some(input_data);
            }
            s.updated_at = Utc::now();
            s.clone()
        }))
    }

    async fn delete(&self, id: Uuid) -> Result<bool, StoreError> {
        let removed = self.state.schedules.write().remove(&id).is_some();
        if removed {
            self.state
                .schedule_executions
                .write()
                .retain(|_, e| e.schedule_id != id);
        }
        Ok(removed)
    }

    async fn get(&self, id: Uuid) -> Result<Option<ScheduleRow>, StoreError> {
        Ok(self.state.schedules.read().get(&id).cloned())
    }

    async fn list(&self) -> Result<Vec<ScheduleRow>, StoreError> {
        let mut rows: Vec<ScheduleRow> =
            self.state.schedules.read().values().cloned().collect();
        rows.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(rows)
    }

    async fn set_enabled(&self, id: Uuid, enabled: bool) -> Result<bool, StoreError> {
        let mut schedules = self.state.schedules.write();
        Ok(schedules
            .get_mut(&id)
            .map(|s| {
                s.enabled = enabled;
                s.updated_at = Utc::now();
            })
            .is_some())
    }

    async fn find_due(&self, now: DateTime<Utc>) -> Result<Vec<ScheduleRow>, StoreError> {
        let mut rows: Vec<ScheduleRow> = self
            .state
            .schedules
            .read()
            .values()
            .filter(|s| s.enabled && s.next_run_at <= now)
            .cloned()
            .collect();
        rows.sort_by(|a, b| a.next_run_at.cmp(&b.next_run_at));
        Ok(rows)
    }

    async fn mark_triggered(
        &self,
        id: Uuid,
        last_run_at: DateTime<Utc>,
        next_run_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut schedules = self.state.schedules.write();
        let schedule = schedules
            .get_mut(&id)
            .ok_or(StoreError::ScheduleNotFound(id))?;
        schedule.last_run_at = Some(last_run_at);
        schedule.next_run_at = next_run_at;
        schedule.updated_at = Utc::now();
        Ok(())
    }

    async fn create_execution(
        &self,
        schedule_id: Uuid,
        trigger_time: DateTime<Utc>,
    ) -> Result<ScheduleExecutionRow, StoreError> {
        let row = ScheduleExecutionRow {
            id: Uuid::now_v7(),
            schedule_id,
            workflow_instance_id: None,
            status: "running".to_string(),
            trigger_time,
            started_at: Utc::now(),
            completed_at: None,
            duration_ms: None,
            error_message: None,
        };

        self.state
            .schedule_executions
            .write()
            .insert(row.id, row.clone());
        Ok(row)
    }

    async fn attach_instance(
        &self,
        execution_id: Uuid,
        workflow_instance_id: Uuid,
    ) -> Result<(), StoreError> {
        let mut executions = self.state.schedule_executions.write();
        if let Some(execution) = executions.get_mut(&execution_id) {
            execution.workflow_instance_id = Some(workflow_instance_id);
        }
        Ok(())
    }

    async fn complete_execution(
        &self,
        execution_id: Uuid,
        status: &str,
        error_message: Option<&str>,
    ) -> Result<(), StoreError> {
        let now = Utc::now();
        let mut executions = self.state.schedule_executions.write();
        if let Some(execution) = executions.get_mut(&execution_id) {
            if execution.status == "running" {
                execution.status = status.to_string();
                execution.error_message = error_message.map(str::to_string);
                execution.completed_at = Some(now);
                execution.duration_ms =
                    Some((now - execution.started_at).num_milliseconds());
            }
        }
        Ok(())
    }

    async fn running_count(&self, schedule_id: Uuid) -> Result<i64, StoreError> {
        Ok(self
            .state
            .schedule_executions
            .read()
            .values()
            .filter(|e| e.schedule_id == schedule_id && e.status == "running")
            .count() as i64)
    }

    async fn list_executions(
        &self,
        schedule_id: Uuid,
        page: Pagination,
    ) -> Result<Vec<ScheduleExecutionRow>, StoreError> {
        let mut rows: Vec<ScheduleExecutionRow> = self
            .state
            .schedule_executions
            .read()
            .values()
            .filter(|e| e.schedule_id == schedule_id)
            .cloned()
            .collect();
        rows.sort_by(|a, b| b.started_at.cmp(&a.started_at));

        let start = (page.offset as usize).min(rows.len());
        let end = (start + page.limit as usize).min(rows.len());
        Ok(rows[start..end].to_vec())
    }

    async fn cleanup_old_executions(&self, before: DateTime<Utc>) -> Result<u64, StoreError> {
        let mut executions = self.state.schedule_executions.write();
        let before_len = executions.len();
        executions.retain(|_, e| e.started_at >= before || e.status == "running");
        Ok((before_len - executions.len()) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> InMemoryScheduleStore {
        InMemoryScheduleStore::new(InMemoryState::new())
    }

    fn input(next_run_at: DateTime<Utc>) -> CreateSchedule {
        CreateSchedule {
            workflow_definition_id: Uuid::now_v7(),
            cron: "0 0 * * * *".to_string(),
            timezone: "UTC".to_string(),
            enabled: true,
            next_run_at,
            max_instances: 1,
            input_data: None,
        }
    }

    #[tokio::test]
    async fn test_find_due_respects_enabled_and_time() {
        let schedules = store();
        let past = Utc::now() - chrono::Duration::seconds(10);
        let future = Utc::now() + chrono::Duration::seconds(3600);

        let due = schedules.create(input(past)).await.unwrap();
        schedules.create(input(future)).await.unwrap();
        let disabled = schedules.create(input(past)).await.unwrap();
        schedules.set_enabled(disabled.id, false).await.unwrap();

        let found = schedules.find_due(Utc::now()).await.unwrap();
        let ids: Vec<Uuid> = found.iter().map(|s| s.id).collect();
        assert_eq!(ids, vec![due.id]);
    }

    #[tokio::test]
    async fn test_mark_triggered_advances_clock() {
        let schedules = store();
        let trigger = Utc::now() - chrono::Duration::seconds(5);
        let next = Utc::now() + chrono::Duration::seconds(3600);

        let schedule = schedules.create(input(trigger)).await.unwrap();
        schedules
            .mark_triggered(schedule.id, trigger, next)
            .await
            .unwrap();

        let row = schedules.get(schedule.id).await.unwrap().unwrap();
        assert_eq!(row.last_run_at, Some(trigger));
        assert_eq!(row.next_run_at, next);
        assert!(schedules.find_due(Utc::now()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_execution_lifecycle() {
        let schedules = store();
        let schedule = schedules.create(input(Utc::now())).await.unwrap();

        let execution = schedules
            .create_execution(schedule.id, Utc::now())
            .await
            .unwrap();
        assert_eq!(schedules.running_count(schedule.id).await.unwrap(), 1);

        let instance_id = Uuid::now_v7();
        schedules
            .attach_instance(execution.id, instance_id)
            .await
            .unwrap();
        schedules
            .complete_execution(execution.id, "success", None)
            .await
            .unwrap();

        assert_eq!(schedules.running_count(schedule.id).await.unwrap(), 0);
        let executions = schedules
            .list_executions(schedule.id, Pagination::default())
            .await
            .unwrap();
        assert_eq!(executions[0].status, "success");
        assert_eq!(executions[0].workflow_instance_id, Some(instance_id));
        assert!(executions[0].duration_ms.is_some());
    }

    #[tokio::test]
    async fn test_cleanup_keeps_running_executions() {
        let schedules = store();
        let schedule = schedules.create(input(Utc::now())).await.unwrap();
        let running = schedules
            .create_execution(schedule.id, Utc::now())
            .await
            .unwrap();
        let done = schedules
            .create_execution(schedule.id, Utc::now())
            .await
            .unwrap();
        schedules
            .complete_execution(done.id, "success", None)
            .await
            .unwrap();

        let removed = schedules
            .cleanup_old_executions(Utc::now() + chrono::Duration::seconds(1))
            .await
            .unwrap();
        assert_eq!(removed, 1);

        let remaining = schedules
            .list_executions(schedule.id, Pagination::default())
            .await
            .unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].id, running.id);
    }
}
