//! Workflow adapter
//!
//! The stable, transport-agnostic control surface over the engine. HTTP
//! handlers, CLIs and embedding hosts talk to this façade only; internals
//! (scheduler, stores, worker pool) stay free to move.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::Value;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use conveyor_core::registry::ExecutorRegistry;
use conveyor_core::status::InstanceStatus;
use conveyor_core::{EngineConfig, WorkflowDefinition};
use conveyor_storage::models::{
    CreateQueueJob, CreateWorkflowDefinition, InstanceFilter, Pagination, QueueJobRow,
    WorkflowInstanceRow, WorkflowStats,
};
use conveyor_storage::{
    DefinitionStore as _, ExecutionLogStore as _, InstanceStore as _, LockStore as _,
    QueueStore as _, Stores,
};

use crate::error::{EngineError, Result};
use crate::recovery::{RecoveryConfig, RecoveryService};
use crate::scheduler::{RunOutcome, StartOptions, WorkflowScheduler};

/// Health report of the engine's moving parts.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct HealthReport {
    pub storage_ok: bool,
    pub unhealthy_executors: Vec<String>,
    pub interrupted_instances: usize,
}

impl HealthReport {
    pub fn is_healthy(&self) -> bool {
        self.storage_ok && self.unhealthy_executors.is_empty()
    }
}

/// The public control surface.
///
/// # Example
///
/// ```ignore
/// let adapter = WorkflowAdapter::new(stores, registry, EngineConfig::default(), "workflow");
///
/// let instance = adapter.start_workflow(definition, None).await?;
/// let status = adapter.get_workflow_status(instance.id).await?;
/// ```
pub struct WorkflowAdapter {
    stores: Stores,
    registry: Arc<ExecutorRegistry>,
    scheduler: WorkflowScheduler,
    recovery: Arc<RecoveryService>,
    config: EngineConfig,
    queue_name: String,
}

impl WorkflowAdapter {
    pub fn new(
        stores: Stores,
        registry: Arc<ExecutorRegistry>,
        config: EngineConfig,
        queue_name: impl Into<String>,
    ) -> Self {
        let queue_name = queue_name.into();
        let scheduler = WorkflowScheduler::new(
            stores.clone(),
            Arc::clone(&registry),
            config.clone(),
            queue_name.clone(),
        );
        let recovery = Arc::new(RecoveryService::new(
            stores.clone(),
            scheduler.clone(),
            RecoveryConfig::default(),
        ));

        Self {
            stores,
            registry,
            scheduler,
            recovery,
            config,
            queue_name,
        }
    }

    pub fn scheduler(&self) -> &WorkflowScheduler {
        &self.scheduler
    }

    pub fn recovery(&self) -> &Arc<RecoveryService> {
        &self.recovery
    }

    pub fn stores(&self) -> &Stores {
        &self.stores
    }

    // =========================================================================
    // Workflow control
    // =========================================================================

    /// Start an instance of the given definition. The definition is stored
    /// (and activated) if this `(name, version)` is new; the drive runs in
    /// the background.
    #[instrument(skip(self, definition, input_data), fields(definition = %definition.name))]
    pub async fn start_workflow(
        &self,
        definition: WorkflowDefinition,
        input_data: Option<Value>,
    ) -> Result<WorkflowInstanceRow> {
        definition.validate(Some(&self.registry.name_set()))?;

        let row = match self
            .stores
            .definitions
            .get_by_name_and_version(&definition.name, definition.version)
            .await?
        {
            Some(row) => row,
            None => {
                self.stores
                    .definitions
                    .create(CreateWorkflowDefinition {
                        name: definition.name.clone(),
                        version: definition.version,
                        graph: serde_json::to_value(&definition.graph)
                            .map_err(|e| EngineError::invalid_state(e.to_string()))?,
                        activate: true,
                    })
                    .await?
            }
        };

        self.start_stored(&row.id, input_data).await
    }

    /// Start the active (or a specific) version of a stored definition.
    pub async fn start_workflow_by_name(
        &self,
        name: &str,
        version: Option<i32>,
        input_data: Option<Value>,
    ) -> Result<WorkflowInstanceRow> {
        let row = match version {
            Some(version) => {
                self.stores
                    .definitions
                    .get_by_name_and_version(name, version)
                    .await?
            }
            None => self.stores.definitions.get_active_by_name(name).await?,
        }
        .ok_or_else(|| EngineError::DefinitionNotFound(name.to_string()))?;

        self.start_stored(&row.id, input_data).await
    }

    async fn start_stored(
        &self,
        definition_id: &Uuid,
        input_data: Option<Value>,
    ) -> Result<WorkflowInstanceRow> {
        let definition = self
            .stores
            .definitions
            .get_by_id(*definition_id)
            .await?
            .ok_or_else(|| EngineError::DefinitionNotFound(definition_id.to_string()))?;

        let instance = self
            .scheduler
            .start_workflow(
                &definition,
                StartOptions {
                    input_data,
                    max_retries: 0,
                },
            )
            .await?;

        let scheduler = self.scheduler.clone();
        let instance_id = instance.id;
        tokio::spawn(async move {
            if let Err(e) = scheduler.run_workflow(instance_id).await {
                warn!(%instance_id, error = %e, "workflow drive ended with error");
            }
        });

        Ok(instance)
    }

    /// Resume an interrupted instance and drive it in the background.
    pub async fn resume_workflow(&self, instance_id: Uuid) -> Result<()> {
        // Validate resumability up front so callers get a synchronous error.
        let instance = self
            .stores
            .instances
            .get(instance_id)
            .await?
            .ok_or(EngineError::InstanceNotFound(instance_id))?;
        if !matches!(instance.status.as_str(), "interrupted" | "running" | "pending") {
            return Err(EngineError::invalid_state(format!(
                "cannot resume instance in status {}",
                instance.status
            )));
        }

        let scheduler = self.scheduler.clone();
        tokio::spawn(async move {
            match scheduler.resume_workflow(instance_id).await {
                Ok(RunOutcome::LockBusy) => {
                    info!(%instance_id, "resume skipped: another worker owns the instance");
                }
                Ok(_) => {}
                Err(e) => warn!(%instance_id, error = %e, "resume failed"),
            }
        });
        Ok(())
    }

    pub async fn stop_workflow(&self, instance_id: Uuid, reason: &str) -> Result<()> {
        self.scheduler.stop_workflow(instance_id, reason).await
    }

    pub async fn cancel_workflow(&self, instance_id: Uuid, reason: &str) -> Result<()> {
        self.scheduler.cancel_workflow(instance_id, reason).await
    }

    pub async fn get_workflow_status(&self, instance_id: Uuid) -> Result<InstanceStatus> {
        self.scheduler.get_workflow_status(instance_id).await
    }

    pub async fn get_workflow_instances(
        &self,
        filter: InstanceFilter,
        page: Pagination,
    ) -> Result<Vec<WorkflowInstanceRow>> {
        Ok(self.stores.instances.list(filter, page).await?)
    }

    pub async fn get_workflow_stats(
        &self,
        definition_id: Option<Uuid>,
        since_days: Option<u32>,
    ) -> Result<WorkflowStats> {
        let since = since_days.map(|days| Utc::now() - chrono::Duration::days(days as i64));
        Ok(self.stores.instances.stats(definition_id, since).await?)
    }

    pub async fn get_interrupted_workflows(&self) -> Result<Vec<WorkflowInstanceRow>> {
        Ok(self.stores.instances.find_interrupted_instances().await?)
    }

    /// Initiate resumes for a batch of instances; per-id acceptance.
    pub async fn batch_resume_workflows(
        &self,
        ids: &[Uuid],
    ) -> HashMap<Uuid, std::result::Result<(), String>> {
        self.recovery
            .batch_resume(ids)
            .await
            .into_iter()
            .map(|(id, outcome)| (id, outcome.map_err(|e| e.to_string())))
            .collect()
    }

    /// Delete terminal instances older than the retention window.
    pub async fn cleanup_expired_instances(&self) -> Result<u64> {
        let before = Utc::now() - chrono::Duration::days(self.config.retention_days as i64);
        let removed = self.stores.instances.cleanup_expired(before).await?;
        let logs_removed = self.stores.execution_logs.delete_expired_logs(before).await?;
        info!(instances = removed, logs = logs_removed, "retention cleanup");
        Ok(removed)
    }

    // =========================================================================
    // Task queue surface
    // =========================================================================

    /// Submit an ad-hoc job to the engine's queue.
    pub async fn submit(&self, mut job: CreateQueueJob) -> Result<QueueJobRow> {
        if !self.registry.contains(&job.executor_name) {
            return Err(EngineError::Registry(
                conveyor_core::registry::RegistryError::UnknownExecutor(job.executor_name),
            ));
        }

        if let Some(max) = self.config.max_queue_size {
            let depth = self.stores.queue.queue_depth(&self.queue_name).await?;
            if depth >= max as i64 {
                return Err(EngineError::QueueFull {
                    queue: self.queue_name.clone(),
                    depth,
                    max,
                });
            }
        }

        job.queue_name = self.queue_name.clone();
        if job.max_attempts <= 0 {
            job.max_attempts = self.config.default_job_max_attempts as i32;
        }
        Ok(self.stores.queue.submit(job).await?)
    }

    /// Cancel a queue job (immediate for waiting/delayed/paused jobs).
    pub async fn cancel_job(&self, id: Uuid) -> Result<bool> {
        Ok(self.stores.queue.cancel_job(id).await?)
    }

    /// Put a permanently failed job back in line.
    pub async fn retry_failed_job(&self, id: Uuid) -> Result<bool> {
        Ok(self.stores.queue.retry_failed_job(id).await?)
    }

    pub async fn pause_group(&self, group_id: &str) -> Result<u64> {
        Ok(self
            .stores
            .queue
            .pause_group(&self.queue_name, group_id)
            .await?)
    }

    pub async fn resume_group(&self, group_id: &str) -> Result<u64> {
        Ok(self
            .stores
            .queue
            .resume_group(&self.queue_name, group_id)
            .await?)
    }

    // =========================================================================
    // Health
    // =========================================================================

    pub async fn health_check(&self) -> HealthReport {
        let storage_ok = self.stores.locks.statistics().await.is_ok();
        let unhealthy_executors = self.registry.health_check().await;
        let interrupted_instances = self
            .stores
            .instances
            .find_interrupted_instances()
            .await
            .map(|v| v.len())
            .unwrap_or(0);

        HealthReport {
            storage_ok,
            unhealthy_executors,
            interrupted_instances,
        }
    }

    /// Convenience: block until an instance settles.
    pub async fn wait_for_completion(
        &self,
        instance_id: Uuid,
        timeout: Duration,
    ) -> Result<InstanceStatus> {
        crate::scheduler::wait_for_terminal(&self.stores, instance_id, timeout).await
    }
}
