//! Recovery service
//!
//! Background housekeeping that makes lock TTLs the fault boundary:
//!
//! - expired lock rows are deleted
//! - jobs stuck in `executing` past the orphan threshold return to
//!   `waiting`
//! - interrupted workflow instances (running with a dead owner lock) are
//!   re-driven

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument};
use uuid::Uuid;

use conveyor_storage::{InstanceStore as _, LockStore as _, QueueStore as _, Stores};

use crate::error::{EngineError, Result};
use crate::scheduler::{RunOutcome, WorkflowScheduler};

/// Recovery configuration.
#[derive(Debug, Clone)]
pub struct RecoveryConfig {
    /// Cadence of the background pass.
    pub interval: Duration,

    /// Executing jobs untouched for this long are considered orphaned.
    pub orphan_threshold: Duration,

    /// Whether the pass also resumes interrupted workflow instances.
    pub resume_workflows: bool,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            orphan_threshold: Duration::from_secs(600),
            resume_workflows: true,
        }
    }
}

/// Point-in-time result of one recovery pass.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecoveryReport {
    pub expired_locks_removed: u64,
    pub job_locks_reset: u64,
    pub orphaned_jobs_reset: usize,
    pub workflows_resumed: usize,
}

/// The recovery service. Explicit lifecycle: `new → start → shutdown`.
pub struct RecoveryService {
    stores: Stores,
    scheduler: WorkflowScheduler,
    config: RecoveryConfig,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    handle: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl RecoveryService {
    pub fn new(stores: Stores, scheduler: WorkflowScheduler, config: RecoveryConfig) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Self {
            stores,
            scheduler,
            config,
            shutdown_tx,
            shutdown_rx,
            handle: parking_lot::Mutex::new(None),
        }
    }

    /// One full recovery pass.
    #[instrument(skip(self))]
    pub async fn run_once(&self) -> Result<RecoveryReport> {
        let mut report = RecoveryReport::default();

        report.expired_locks_removed = self.stores.locks.cleanup_expired().await?;
        report.job_locks_reset = self.stores.queue.cleanup_expired_locks().await?;

        // Jobs whose worker died mid-execution: back to waiting.
        let orphaned = self
            .stores
            .queue
            .find_orphaned_executing_jobs(self.config.orphan_threshold)
            .await?;
        for job in &orphaned {
            if self.stores.queue.reset_job_to_waiting(job.id).await? {
                report.orphaned_jobs_reset += 1;
            }
        }

        if self.config.resume_workflows {
            report.workflows_resumed = self.resume_interrupted().await?;
        }

        if report != RecoveryReport::default() {
            info!(
                locks = report.expired_locks_removed,
                job_locks = report.job_locks_reset,
                orphans = report.orphaned_jobs_reset,
                workflows = report.workflows_resumed,
                "recovery pass"
            );
        }
        Ok(report)
    }

    /// Spawn a re-drive for every interrupted instance; returns how many
    /// resumes were initiated. The drives run in the background; the lock
    /// table arbitrates if another worker races the same instance.
    pub async fn resume_interrupted(&self) -> Result<usize> {
        let interrupted = self.stores.instances.find_interrupted_instances().await?;
        let count = interrupted.len();

        for instance in interrupted {
            let scheduler = self.scheduler.clone();
            tokio::spawn(async move {
                match scheduler.resume_workflow(instance.id).await {
                    Ok(RunOutcome::LockBusy) => {
                        debug!(instance_id = %instance.id, "instance claimed by another worker");
                    }
                    Ok(outcome) => {
                        debug!(instance_id = %instance.id, ?outcome, "resume finished");
                    }
                    Err(e) => {
                        error!(instance_id = %instance.id, error = %e, "resume failed");
                    }
                }
            });
        }
        Ok(count)
    }

    /// Initiate resumes for a specific set of instances; returns whether
    /// each resume was accepted (instance exists and is resumable).
    pub async fn batch_resume(&self, ids: &[Uuid]) -> Vec<(Uuid, Result<()>)> {
        let mut outcomes = vec![];

        for &id in ids {
            let accepted = match self.stores.instances.get(id).await {
                Ok(Some(instance))
                    if matches!(instance.status.as_str(), "interrupted" | "running") =>
                {
                    let scheduler = self.scheduler.clone();
                    tokio::spawn(async move {
                        if let Err(e) = scheduler.resume_workflow(id).await {
                            error!(instance_id = %id, error = %e, "batch resume failed");
                        }
                    });
                    Ok(())
                }
                Ok(Some(instance)) => Err(EngineError::invalid_state(format!(
                    "cannot resume instance in status {}",
                    instance.status
                ))),
                Ok(None) => Err(EngineError::InstanceNotFound(id)),
                Err(e) => Err(e.into()),
            };
            outcomes.push((id, accepted));
        }
        outcomes
    }

    /// Start the background pass loop.
    pub fn start(self: &Arc<Self>) -> Result<()> {
        if self.handle.lock().is_some() {
            return Err(EngineError::AlreadyRunning("recovery service"));
        }

        let service = Arc::clone(self);
        let mut shutdown_rx = self.shutdown_rx.clone();
        let interval = self.config.interval;

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = service.run_once().await {
                            error!(error = %e, "recovery pass failed");
                        }
                    }
                    _ = shutdown_rx.changed() => {
                        debug!("recovery loop: shutdown requested");
                        break;
                    }
                }
            }
        });

        *self.handle.lock() = Some(handle);
        Ok(())
    }

    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        if let Some(handle) = self.handle.lock().take() {
            handle.abort();
        }
    }
}
