//! Schedule service
//!
//! Cron-driven workflow starts. Each due schedule is claimed under a
//! `schedule-tick:{id}` lock so exactly one process fires a given tick;
//! `max_instances` bounds concurrently running executions per schedule.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use cron::Schedule as CronSchedule;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use conveyor_core::status::{InstanceStatus, LockType};
use conveyor_core::{EngineConfig, ValidationError};
use conveyor_storage::models::{
    CreateSchedule, Pagination, ScheduleExecutionRow, ScheduleRow, UpdateSchedule,
};
use conveyor_storage::{
    schedule_tick_lock_key, DefinitionStore as _, LockStore as _, ScheduleStore as _, Stores,
};

use crate::error::{EngineError, Result};
use crate::scheduler::{wait_for_terminal, StartOptions, WorkflowScheduler};

/// Configuration for creating a schedule.
#[derive(Debug, Clone)]
pub struct ScheduleConfig {
    /// Six- or seven-field cron expression (seconds included).
    pub cron: String,

    /// IANA timezone name, e.g. `Asia/Shanghai`.
    pub timezone: String,

    pub enabled: bool,

    /// Concurrent executions cap.
    pub max_instances: i32,

    pub input_data: Option<serde_json::Value>,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            cron: "0 0 * * * *".to_string(),
            timezone: "UTC".to_string(),
            enabled: true,
            max_instances: 1,
            input_data: None,
        }
    }
}

/// Cron-driven instance creation plus execution-history bookkeeping.
pub struct ScheduleService {
    stores: Stores,
    scheduler: WorkflowScheduler,
    config: EngineConfig,
    owner_id: String,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    tick_handle: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl ScheduleService {
    pub fn new(stores: Stores, scheduler: WorkflowScheduler, config: EngineConfig) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Self {
            stores,
            scheduler,
            config,
            owner_id: format!("schedule-{}", Uuid::now_v7()),
            shutdown_tx,
            shutdown_rx,
            tick_handle: parking_lot::Mutex::new(None),
        }
    }

    // =========================================================================
    // CRUD
    // =========================================================================

    /// Create a schedule for a stored definition.
    #[instrument(skip(self, config), fields(cron = %config.cron))]
    pub async fn create_schedule(
        &self,
        workflow_definition_id: Uuid,
        config: ScheduleConfig,
    ) -> Result<ScheduleRow> {
        let timezone = parse_timezone(&config.timezone)?;
        let next_run_at = next_occurrence(&config.cron, timezone, Utc::now())?
            .ok_or_else(|| ValidationError::new("cron expression never fires"))?;

        let row = self
            .stores
            .schedules
            .create(CreateSchedule {
                workflow_definition_id,
                cron: config.cron,
                timezone: config.timezone,
                enabled: config.enabled,
                next_run_at,
                max_instances: config.max_instances.max(1),
                input_data: config.input_data,
            })
            .await?;

        info!(schedule_id = %row.id, "schedule created");
        Ok(row)
    }

    pub async fn update_schedule(
        &self,
        id: Uuid,
        config: ScheduleConfig,
    ) -> Result<Option<ScheduleRow>> {
        let timezone = parse_timezone(&config.timezone)?;
        let next_run_at = next_occurrence(&config.cron, timezone, Utc::now())?
            .ok_or_else(|| ValidationError::new("cron expression never fires"))?;

        Ok(self
            .stores
            .schedules
            .update(
                id,
                UpdateSchedule {
                    cron: Some(config.cron),
                    timezone: Some(config.timezone),
                    enabled: Some(config.enabled),
                    next_run_at: Some(next_run_at),
                    max_instances: Some(config.max_instances.max(1)),
                    input_data: config.input_data,
                },
            )
            .await?)
    }

    pub async fn delete_schedule(&self, id: Uuid) -> Result<bool> {
        Ok(self.stores.schedules.delete(id).await?)
    }

    pub async fn toggle_schedule(&self, id: Uuid, enabled: bool) -> Result<bool> {
        Ok(self.stores.schedules.set_enabled(id, enabled).await?)
    }

    pub async fn get_schedules(&self) -> Result<Vec<ScheduleRow>> {
        Ok(self.stores.schedules.list().await?)
    }

    pub async fn get_executions(
        &self,
        schedule_id: Uuid,
        page: Pagination,
    ) -> Result<Vec<ScheduleExecutionRow>> {
        Ok(self.stores.schedules.list_executions(schedule_id, page).await?)
    }

    // =========================================================================
    // Ticking
    // =========================================================================

    /// Fire every due schedule once. Returns how many workflows started.
    #[instrument(skip(self))]
    pub async fn tick(&self) -> Result<usize> {
        let due = self.stores.schedules.find_due(Utc::now()).await?;
        let mut started = 0usize;

        for schedule in due {
            match self.fire_schedule(&schedule).await {
                Ok(true) => started += 1,
                Ok(false) => {}
                Err(e) => {
                    error!(schedule_id = %schedule.id, error = %e, "schedule tick failed");
                }
            }
        }
        Ok(started)
    }

    /// Fire one schedule if this process wins the tick lock and capacity
    /// allows. Returns whether a workflow was started.
    async fn fire_schedule(&self, schedule: &ScheduleRow) -> Result<bool> {
        let lock_key = schedule_tick_lock_key(schedule.id);
        let acquired = self
            .stores
            .locks
            .acquire(
                &lock_key,
                &self.owner_id,
                Duration::from_secs(30),
                LockType::Resource,
                None,
            )
            .await?;
        if !acquired {
            return Ok(false);
        }

        let fired = self.fire_locked(schedule).await;

        if let Err(e) = self.stores.locks.release(&lock_key, Some(&self.owner_id)).await {
            warn!(error = %e, "failed to release schedule tick lock");
        }
        fired
    }

    async fn fire_locked(&self, schedule: &ScheduleRow) -> Result<bool> {
        // Re-read under the lock: another process may have fired this tick.
        let schedule = self
            .stores
            .schedules
            .get(schedule.id)
            .await?
            .ok_or_else(|| EngineError::invalid_state("schedule deleted mid-tick"))?;
        let now = Utc::now();
        if !schedule.enabled || schedule.next_run_at > now {
            return Ok(false);
        }

        let timezone = parse_timezone(&schedule.timezone)?;
        let next_run_at = next_occurrence(&schedule.cron, timezone, now)?
            .ok_or_else(|| ValidationError::new("cron expression never fires"))?;

        // Capacity gate: advance the clock but start nothing.
        let running = self.stores.schedules.running_count(schedule.id).await?;
        if running >= schedule.max_instances as i64 {
            debug!(
                schedule_id = %schedule.id,
                running,
                max = schedule.max_instances,
                "schedule at capacity, skipping tick"
            );
            self.stores
                .schedules
                .mark_triggered(schedule.id, schedule.next_run_at, next_run_at)
                .await?;
            return Ok(false);
        }

        let definition = self
            .stores
            .definitions
            .get_by_id(schedule.workflow_definition_id)
            .await?
            .ok_or_else(|| {
                EngineError::DefinitionNotFound(schedule.workflow_definition_id.to_string())
            })?;

        let execution = self
            .stores
            .schedules
            .create_execution(schedule.id, schedule.next_run_at)
            .await?;

        let instance = self
            .scheduler
            .start_workflow(
                &definition,
                StartOptions {
                    input_data: schedule.input_data.clone(),
                    max_retries: 0,
                },
            )
            .await?;
        self.stores
            .schedules
            .attach_instance(execution.id, instance.id)
            .await?;

        self.stores
            .schedules
            .mark_triggered(schedule.id, schedule.next_run_at, next_run_at)
            .await?;

        info!(
            schedule_id = %schedule.id,
            instance_id = %instance.id,
            "schedule fired"
        );

        // Drive the workflow and settle the execution row when it ends.
        let scheduler = self.scheduler.clone();
        let stores = self.stores.clone();
        let execution_id = execution.id;
        let instance_id = instance.id;
        tokio::spawn(async move {
            let run = scheduler.run_workflow(instance_id).await;
            let settled = match run {
                Ok(_) => {
                    wait_for_terminal(&stores, instance_id, Duration::from_secs(24 * 3600)).await
                }
                Err(e) => Err(e),
            };

            let (status, error) = match settled {
                Ok(InstanceStatus::Completed) => ("success", None),
                Ok(InstanceStatus::Failed) => ("failed", Some("workflow failed".to_string())),
                Ok(InstanceStatus::Cancelled) => {
                    ("failed", Some("workflow cancelled".to_string()))
                }
                Ok(other) => ("failed", Some(format!("workflow ended as {}", other))),
                Err(EngineError::Timeout(_)) => ("timeout", Some("workflow timed out".to_string())),
                Err(e) => ("failed", Some(e.to_string())),
            };
            if let Err(e) = stores
                .schedules
                .complete_execution(execution_id, status, error.as_deref())
                .await
            {
                error!(error = %e, "failed to settle schedule execution");
            }
        });

        Ok(true)
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Start the background tick loop.
    pub fn start(self: &Arc<Self>, interval: Duration) -> Result<()> {
        if self.tick_handle.lock().is_some() {
            return Err(EngineError::AlreadyRunning("schedule service"));
        }

        let service = Arc::clone(self);
        let mut shutdown_rx = self.shutdown_rx.clone();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = service.tick().await {
                            error!(error = %e, "schedule tick error");
                        }
                    }
                    _ = shutdown_rx.changed() => {
                        debug!("schedule loop: shutdown requested");
                        break;
                    }
                }
            }
        });

        *self.tick_handle.lock() = Some(handle);
        Ok(())
    }

    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        if let Some(handle) = self.tick_handle.lock().take() {
            handle.abort();
        }
    }

    /// Trim execution history per the retention policy.
    pub async fn cleanup_old_executions(&self) -> Result<u64> {
        let before = Utc::now() - chrono::Duration::days(self.config.retention_days as i64);
        Ok(self.stores.schedules.cleanup_old_executions(before).await?)
    }
}

fn parse_timezone(name: &str) -> Result<Tz> {
    name.parse::<Tz>()
        .map_err(|_| ValidationError::new(format!("unknown timezone: {}", name)).into())
}

/// The next fire time of `cron` in `timezone`, strictly after `now`.
fn next_occurrence(
    cron: &str,
    timezone: Tz,
    now: DateTime<Utc>,
) -> Result<Option<DateTime<Utc>>> {
    let schedule = CronSchedule::from_str(cron)
        .map_err(|e| ValidationError::new(format!("invalid cron expression: {}", e)))?;
    let local = now.with_timezone(&timezone);
    Ok(schedule
        .after(&local)
        .next()
        .map(|next| next.with_timezone(&Utc)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_next_occurrence_hourly() {
        let now = Utc::now();
        let next = next_occurrence("0 0 * * * *", chrono_tz::UTC, now)
            .unwrap()
            .unwrap();
        assert!(next > now);
        assert!(next - now <= chrono::Duration::hours(1));
        assert_eq!(next.timestamp() % 3600, 0);
    }

    #[test]
    fn test_next_occurrence_respects_timezone() {
        // Daily at 09:00 Shanghai = 01:00 UTC.
        let now = "2026-03-01T00:00:00Z".parse::<DateTime<Utc>>().unwrap();
        let next = next_occurrence("0 0 9 * * *", chrono_tz::Asia::Shanghai, now)
            .unwrap()
            .unwrap();
        assert_eq!(next, "2026-03-01T01:00:00Z".parse::<DateTime<Utc>>().unwrap());
    }

    #[test]
    fn test_invalid_cron_rejected() {
        let result = next_occurrence("not a cron", chrono_tz::UTC, Utc::now());
        assert!(result.is_err());
    }

    #[test]
    fn test_unknown_timezone_rejected() {
        assert!(parse_timezone("Mars/Olympus").is_err());
        assert!(parse_timezone("Europe/Berlin").is_ok());
    }
}
