//! Queue worker pool
//!
//! Each worker runs a claim-dispatch loop:
//!
//! 1. poll `find_pending_jobs` excluding currently paused groups
//! 2. `lock_job_for_processing` per job; losing the claim means another
//!    worker won, so skip
//! 3. mark executing, resolve the executor by name, run it under the
//!    configured timeout
//! 4. success → transactional `move_to_success`; retryable failure →
//!    delayed re-dispatch via the backoff policy; exhausted → `mark_as_failed`
//! 5. `unlock_job` in all paths (release-in-finally)
//!
//! A reclaim loop periodically returns expired-lock jobs to `waiting`.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use conveyor_core::executor::{ExecutionContext, ExecutionOutcome};
use conveyor_core::registry::ExecutorRegistry;
use conveyor_core::EngineConfig;
use conveyor_storage::models::QueueJobRow;
use conveyor_storage::QueueStore;

use super::backpressure::{BackpressureConfig, BackpressureState};
use super::poller::{PollerConfig, QueuePoller};
use crate::error::{EngineError, Result};

/// Worker pool configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Unique worker instance id; also the queue-job lock owner.
    pub worker_id: String,

    /// Queue this pool drains.
    pub queue_name: String,

    /// Maximum concurrently executing jobs.
    pub max_concurrency: usize,

    /// Per-job claim TTL; renewed while the job runs.
    pub lock_ttl: Duration,

    /// Hard cap on one executor invocation.
    pub job_timeout: Duration,

    /// Reclaim cadence for expired job locks.
    pub reclaim_interval: Duration,

    /// Graceful shutdown drain timeout.
    pub shutdown_timeout: Duration,

    pub poller: PollerConfig,

    pub backpressure: BackpressureConfig,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_id: format!("worker-{}", Uuid::now_v7()),
            queue_name: "default".to_string(),
            max_concurrency: 10,
            lock_ttl: Duration::from_secs(30),
            job_timeout: Duration::from_secs(300),
            reclaim_interval: Duration::from_secs(30),
            shutdown_timeout: Duration::from_secs(30),
            poller: PollerConfig::default(),
            backpressure: BackpressureConfig::default(),
        }
    }
}

impl WorkerConfig {
    /// Derive a worker config from the engine-wide configuration.
    pub fn from_engine(config: &EngineConfig, queue_name: impl Into<String>) -> Self {
        Self {
            queue_name: queue_name.into(),
            max_concurrency: config.max_concurrency,
            lock_ttl: config.lock_ttl,
            job_timeout: config.sandbox.timeout,
            poller: PollerConfig::default().with_min_interval(config.poll_interval),
            backpressure: BackpressureConfig::from_threshold(config.backpressure_threshold),
            ..Default::default()
        }
    }

    pub fn with_worker_id(mut self, id: impl Into<String>) -> Self {
        self.worker_id = id.into();
        self
    }

    pub fn with_max_concurrency(mut self, max: usize) -> Self {
        self.max_concurrency = max.max(1);
        self
    }

    pub fn with_job_timeout(mut self, timeout: Duration) -> Self {
        self.job_timeout = timeout;
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    pub fn with_poller(mut self, poller: PollerConfig) -> Self {
        self.poller = poller;
        self
    }
}

/// Aggregate worker statistics.
#[derive(Debug, Clone, Default, PartialEq, serde::Serialize)]
pub struct WorkerStats {
    pub running: usize,
    pub completed: u64,
    pub failed: u64,
    pub avg_execution_time_ms: f64,
    pub throughput_per_minute: f64,
}

#[derive(Default)]
struct Counters {
    completed: AtomicU64,
    failed: AtomicU64,
    total_execution_ms: AtomicI64,
}

/// The worker pool. Explicit lifecycle: `new → start → shutdown`.
pub struct QueueWorkerPool {
    queue: Arc<dyn QueueStore>,
    registry: Arc<ExecutorRegistry>,
    config: WorkerConfig,
    backoff: conveyor_core::RetryPolicy,
    backpressure: Arc<BackpressureState>,
    counters: Arc<Counters>,
    permits: Arc<Semaphore>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    started_at: parking_lot::Mutex<Option<Instant>>,
    poll_handle: parking_lot::Mutex<Option<JoinHandle<()>>>,
    reclaim_handle: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl QueueWorkerPool {
    pub fn new(
        queue: Arc<dyn QueueStore>,
        registry: Arc<ExecutorRegistry>,
        config: WorkerConfig,
        backoff: conveyor_core::RetryPolicy,
    ) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let backpressure = Arc::new(BackpressureState::new(
            config.backpressure.clone(),
            config.max_concurrency,
        ));

        Self {
            queue,
            registry,
            permits: Arc::new(Semaphore::new(config.max_concurrency)),
            backpressure,
            counters: Arc::new(Counters::default()),
            backoff,
            config,
            shutdown_tx,
            shutdown_rx,
            started_at: parking_lot::Mutex::new(None),
            poll_handle: parking_lot::Mutex::new(None),
            reclaim_handle: parking_lot::Mutex::new(None),
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.config.worker_id
    }

    /// Start the poll and reclaim loops.
    #[instrument(skip(self), fields(worker_id = %self.config.worker_id, queue = %self.config.queue_name))]
    pub fn start(&self) -> Result<()> {
        if self.poll_handle.lock().is_some() {
            return Err(EngineError::AlreadyRunning("worker pool"));
        }

        info!(
            max_concurrency = self.config.max_concurrency,
            "starting queue worker pool"
        );
        *self.started_at.lock() = Some(Instant::now());
        *self.poll_handle.lock() = Some(self.spawn_poll_loop());
        *self.reclaim_handle.lock() = Some(self.spawn_reclaim_loop());
        Ok(())
    }

    /// Signal shutdown and wait for in-flight jobs to drain.
    #[instrument(skip(self), fields(worker_id = %self.config.worker_id))]
    pub async fn shutdown(&self) -> Result<()> {
        let _ = self.shutdown_tx.send(true);

        let deadline = tokio::time::Instant::now() + self.config.shutdown_timeout;
        loop {
            if self.permits.available_permits() == self.config.max_concurrency {
                break;
            }
            if tokio::time::Instant::now() >= deadline {
                warn!(
                    in_flight = self.config.max_concurrency - self.permits.available_permits(),
                    "shutdown drain timed out"
                );
                return Err(EngineError::invalid_state("graceful shutdown timed out"));
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        if let Some(handle) = self.poll_handle.lock().take() {
            handle.abort();
        }
        if let Some(handle) = self.reclaim_handle.lock().take() {
            handle.abort();
        }

        info!("queue worker pool stopped");
        Ok(())
    }

    /// Point-in-time statistics.
    pub fn stats(&self) -> WorkerStats {
        let completed = self.counters.completed.load(Ordering::Relaxed);
        let failed = self.counters.failed.load(Ordering::Relaxed);
        let total_ms = self.counters.total_execution_ms.load(Ordering::Relaxed);
        let finished = completed + failed;

        let avg = if finished > 0 {
            total_ms as f64 / finished as f64
        } else {
            0.0
        };
        let throughput = match *self.started_at.lock() {
            Some(started) => {
                let minutes = started.elapsed().as_secs_f64() / 60.0;
                if minutes > 0.0 {
                    finished as f64 / minutes
                } else {
                    0.0
                }
            }
            None => 0.0,
        };

        WorkerStats {
            running: self.backpressure.current_load(),
            completed,
            failed,
            avg_execution_time_ms: avg,
            throughput_per_minute: throughput,
        }
    }

    fn spawn_poll_loop(&self) -> JoinHandle<()> {
        let queue = Arc::clone(&self.queue);
        let registry = Arc::clone(&self.registry);
        let backpressure = Arc::clone(&self.backpressure);
        let counters = Arc::clone(&self.counters);
        let permits = Arc::clone(&self.permits);
        let config = self.config.clone();
        let backoff = self.backoff.clone();
        let shutdown_rx = self.shutdown_rx.clone();

        tokio::spawn(async move {
            let mut poller = QueuePoller::new(
                Arc::clone(&queue),
                config.queue_name.clone(),
                config.poller.clone(),
                shutdown_rx,
            );

            loop {
                if poller.is_shutdown() {
                    debug!("poll loop: shutdown requested");
                    break;
                }

                if !backpressure.should_accept() || backpressure.available_slots() == 0 {
                    if poller.wait().await {
                        break;
                    }
                    continue;
                }

                // Due delayed jobs become claimable before the fetch.
                if let Err(e) = queue.promote_due_delayed(&config.queue_name).await {
                    error!(error = %e, "failed to promote delayed jobs");
                }

                // Paused groups are re-read each cycle so a pause takes
                // effect on the next poll.
                let excluded = match queue.paused_groups(&config.queue_name).await {
                    Ok(groups) => groups,
                    Err(e) => {
                        error!(error = %e, "failed to read paused groups");
                        vec![]
                    }
                };

                match poller.poll(backpressure.available_slots(), &excluded).await {
                    Ok(jobs) => {
                        for job in jobs {
                            let permit = match Arc::clone(&permits).try_acquire_owned() {
                                Ok(p) => p,
                                Err(_) => break,
                            };

                            let won = match queue
                                .lock_job_for_processing(job.id, &config.worker_id, config.lock_ttl)
                                .await
                            {
                                Ok(won) => won,
                                Err(e) => {
                                    error!(job_id = %job.id, error = %e, "claim failed");
                                    false
                                }
                            };
                            if !won {
                                // Another worker got there first.
                                drop(permit);
                                continue;
                            }

                            backpressure.job_started();
                            let queue = Arc::clone(&queue);
                            let registry = Arc::clone(&registry);
                            let counters = Arc::clone(&counters);
                            let bp = Arc::clone(&backpressure);
                            let config = config.clone();
                            let backoff = backoff.clone();

                            tokio::spawn(async move {
                                process_job(&queue, &registry, &config, &backoff, &counters, job)
                                    .await;
                                bp.job_finished();
                                drop(permit);
                            });
                        }
                    }
                    Err(e) => {
                        error!(error = %e, "poll failed");
                    }
                }

                if poller.wait().await {
                    break;
                }
            }

            debug!("poll loop exited");
        })
    }

    fn spawn_reclaim_loop(&self) -> JoinHandle<()> {
        let queue = Arc::clone(&self.queue);
        let interval = self.config.reclaim_interval;
        let mut shutdown_rx = self.shutdown_rx.clone();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        match queue.cleanup_expired_locks().await {
                            Ok(0) => {}
                            Ok(reset) => info!(count = reset, "reclaimed jobs with expired locks"),
                            Err(e) => error!(error = %e, "lock reclamation failed"),
                        }
                    }
                    _ = shutdown_rx.changed() => {
                        debug!("reclaim loop: shutdown requested");
                        break;
                    }
                }
            }
        })
    }
}

/// Execute one claimed job end-to-end.
#[instrument(skip_all, fields(job_id = %job.id, executor = %job.executor_name))]
async fn process_job(
    queue: &Arc<dyn QueueStore>,
    registry: &Arc<ExecutorRegistry>,
    config: &WorkerConfig,
    backoff: &conveyor_core::RetryPolicy,
    counters: &Counters,
    job: QueueJobRow,
) {
    let started = Instant::now();
    let job_id = job.id;

    // Flip to executing before dispatch; losing here means the claim was
    // taken over, so back off without touching the job.
    match queue.mark_executing(job_id, &config.worker_id).await {
        Ok(true) => {}
        Ok(false) => {
            debug!("job no longer claimable, skipping");
            return;
        }
        Err(e) => {
            error!(error = %e, "failed to mark job executing");
            return;
        }
    }

    // Renew the claim at half TTL while the executor runs, so long jobs
    // are not reclaimed as orphans mid-flight.
    let renew_handle = {
        let queue = Arc::clone(queue);
        let owner = config.worker_id.clone();
        let ttl = config.lock_ttl;
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(ttl / 2).await;
                match queue.renew_job_lock(job_id, &owner, ttl).await {
                    Ok(true) => {}
                    Ok(false) => {
                        warn!(%job_id, "lost job claim during execution");
                        break;
                    }
                    Err(e) => error!(%job_id, error = %e, "job lock renewal failed"),
                }
            }
        })
    };

    let outcome = run_executor(registry, config, &job).await;
    renew_handle.abort();
    let elapsed = started.elapsed();

    match outcome {
        Ok(outcome) if outcome.success => {
            counters.completed.fetch_add(1, Ordering::Relaxed);
            counters
                .total_execution_ms
                .fetch_add(elapsed.as_millis() as i64, Ordering::Relaxed);

            if let Err(e) = queue.move_to_success(job_id, outcome.data, elapsed).await {
                error!(error = %e, "failed to record job success");
            }
            debug!(elapsed_ms = elapsed.as_millis() as u64, "job completed");
        }
        Ok(outcome) => {
            let message = outcome
                .error
                .unwrap_or_else(|| "executor reported failure".to_string());
            record_failure(queue, backoff, counters, &job, &message, None).await;
        }
        Err(EngineError::Timeout(ms)) => {
            let message = format!("executor timed out after {}ms", ms);
            record_failure(queue, backoff, counters, &job, &message, Some("TIMEOUT")).await;
        }
        Err(e) => {
            record_failure(queue, backoff, counters, &job, &e.to_string(), None).await;
        }
    }

    // Release-in-finally: the lock is cleared even when recording failed.
    if let Err(e) = queue.unlock_job(job_id, &config.worker_id).await {
        warn!(error = %e, "failed to unlock job");
    }
}

async fn run_executor(
    registry: &Arc<ExecutorRegistry>,
    config: &WorkerConfig,
    job: &QueueJobRow,
) -> Result<ExecutionOutcome> {
    let executor = registry.get(&job.executor_name)?;

    let mut ctx = ExecutionContext {
        input_data: job.payload.clone(),
        job_id: Some(job.id),
        metadata: job.metadata.clone(),
        ..Default::default()
    };

    // Node jobs carry correlation ids and upstream results in metadata.
    if let Some(meta) = &job.metadata {
        ctx.workflow_instance_id = meta
            .get("workflowInstanceId")
            .and_then(|v| v.as_str())
            .and_then(|s| s.parse().ok());
        ctx.node_instance_id = meta
            .get("nodeInstanceId")
            .and_then(|v| v.as_str())
            .and_then(|s| s.parse().ok());
        if let Some(deps) = meta.get("dependencies") {
            ctx.dependencies = serde_json::from_value(deps.clone()).unwrap_or_default();
        }
        if let Some(config) = meta.get("config") {
            ctx.config = config.clone();
        }
    }

    match tokio::time::timeout(config.job_timeout, executor.execute(ctx)).await {
        Ok(outcome) => Ok(outcome),
        Err(_) => Err(EngineError::Timeout(config.job_timeout.as_millis() as u64)),
    }
}

async fn record_failure(
    queue: &Arc<dyn QueueStore>,
    backoff: &conveyor_core::RetryPolicy,
    counters: &Counters,
    job: &QueueJobRow,
    message: &str,
    code: Option<&str>,
) {
    counters.failed.fetch_add(1, Ordering::Relaxed);

    // `attempts` was incremented by mark_executing; the job row we hold is
    // from before the claim.
    let attempts_used = job.attempts + 1;

    if attempts_used < job.max_attempts {
        let delay = backoff.delay_for_attempt((attempts_used + 1) as u32);
        let delay_until = Utc::now() + chrono::Duration::from_std(delay).unwrap_or_default();

        warn!(
            job_id = %job.id,
            attempts = attempts_used,
            max_attempts = job.max_attempts,
            delay_ms = delay.as_millis() as u64,
            error = message,
            "job failed, scheduling retry"
        );
        if let Err(e) = queue
            .reschedule_for_retry(job.id, delay_until, message)
            .await
        {
            error!(error = %e, "failed to schedule retry");
        }
    } else {
        warn!(
            job_id = %job.id,
            attempts = attempts_used,
            error = message,
            "job failed permanently"
        );
        if let Err(e) = queue.mark_as_failed(job.id, message, code, None).await {
            error!(error = %e, "failed to record job failure");
        }
    }
}
