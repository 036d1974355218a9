//! SmartQueue: in-process submission frontend
//!
//! Fronts the durable queue with submit-side backpressure: submissions
//! above `backpressure_threshold × max_queue_size` wait for the queue to
//! drain, and submissions above `max_queue_size` fail fast. Also tracks
//! the jobs it submitted so callers can await the whole batch.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use conveyor_storage::models::{CreateQueueJob, QueueJobRow, QueueStats};
use conveyor_storage::QueueStore;

use crate::error::{EngineError, Result};

/// SmartQueue configuration.
#[derive(Debug, Clone)]
pub struct SmartQueueConfig {
    pub queue_name: String,

    /// Hard cap on active jobs; submissions above it fail fast.
    pub max_queue_size: Option<usize>,

    /// Fraction of `max_queue_size` above which submissions wait.
    pub backpressure_threshold: f64,

    /// Poll cadence while waiting for drain.
    pub drain_poll_interval: Duration,

    /// Give up waiting for relief after this long.
    pub submit_timeout: Duration,
}

impl Default for SmartQueueConfig {
    fn default() -> Self {
        Self {
            queue_name: "default".to_string(),
            max_queue_size: None,
            backpressure_threshold: 0.8,
            drain_poll_interval: Duration::from_millis(50),
            submit_timeout: Duration::from_secs(30),
        }
    }
}

/// In-process priority + backpressure frontend over the durable queue.
pub struct SmartQueue {
    queue: Arc<dyn QueueStore>,
    config: SmartQueueConfig,
    submitted: Mutex<HashSet<Uuid>>,
}

impl SmartQueue {
    pub fn new(queue: Arc<dyn QueueStore>, config: SmartQueueConfig) -> Self {
        Self {
            queue,
            config,
            submitted: Mutex::new(HashSet::new()),
        }
    }

    pub fn queue_name(&self) -> &str {
        &self.config.queue_name
    }

    /// Submit a job, applying backpressure.
    #[instrument(skip(self, job), fields(queue = %self.config.queue_name))]
    pub async fn add(&self, mut job: CreateQueueJob) -> Result<QueueJobRow> {
        job.queue_name = self.config.queue_name.clone();

        if let Some(max) = self.config.max_queue_size {
            let depth = self.queue.queue_depth(&self.config.queue_name).await?;
            if depth >= max as i64 {
                return Err(EngineError::QueueFull {
                    queue: self.config.queue_name.clone(),
                    depth,
                    max,
                });
            }

            let threshold = (max as f64 * self.config.backpressure_threshold) as i64;
            if depth >= threshold {
                warn!(depth, threshold, "queue above backpressure threshold, waiting");
                self.wait_for_relief(threshold).await?;
            }
        }

        let row = self.queue.submit(job).await?;
        self.submitted.lock().insert(row.id);
        debug!(job_id = %row.id, "job submitted");
        Ok(row)
    }

    /// Cancel a job. Waiting/delayed/paused jobs are removed immediately;
    /// executing jobs are the worker's business (advisory only).
    pub async fn cancel(&self, id: Uuid) -> Result<bool> {
        let cancelled = self.queue.cancel_job(id).await?;
        if cancelled {
            self.submitted.lock().remove(&id);
        }
        Ok(cancelled)
    }

    /// Pause a group: its waiting/delayed jobs stop dispatching.
    pub async fn pause(&self, group_id: &str) -> Result<u64> {
        Ok(self
            .queue
            .pause_group(&self.config.queue_name, group_id)
            .await?)
    }

    /// Resume a paused group.
    pub async fn resume(&self, group_id: &str) -> Result<u64> {
        Ok(self
            .queue
            .resume_group(&self.config.queue_name, group_id)
            .await?)
    }

    /// Wait until every job submitted through this frontend has settled
    /// (moved to success/failure, cancelled, or permanently failed).
    pub async fn wait_for_all(&self, timeout: Duration) -> Result<()> {
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            let pending = {
                let ids: Vec<Uuid> = self.submitted.lock().iter().copied().collect();
                let mut open = vec![];
                for id in ids {
                    match self.queue.get_job(id).await? {
                        None => {
                            self.submitted.lock().remove(&id);
                        }
                        Some(job) if job.status == "failed" => {
                            self.submitted.lock().remove(&id);
                        }
                        Some(_) => open.push(id),
                    }
                }
                open
            };

            if pending.is_empty() {
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(EngineError::Timeout(timeout.as_millis() as u64));
            }
            tokio::time::sleep(self.config.drain_poll_interval).await;
        }
    }

    /// Durable-queue statistics for this queue.
    pub async fn stats(&self) -> Result<QueueStats> {
        Ok(self.queue.queue_stats(&self.config.queue_name).await?)
    }

    async fn wait_for_relief(&self, threshold: i64) -> Result<()> {
        let deadline = tokio::time::Instant::now() + self.config.submit_timeout;

        loop {
            tokio::time::sleep(self.config.drain_poll_interval).await;
            let depth = self.queue.queue_depth(&self.config.queue_name).await?;
            if depth < threshold {
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(EngineError::Timeout(
                    self.config.submit_timeout.as_millis() as u64,
                ));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use conveyor_storage::InMemoryStores;

    fn smart(stores: &InMemoryStores, max: Option<usize>) -> SmartQueue {
        SmartQueue::new(
            Arc::new(stores.queue()),
            SmartQueueConfig {
                queue_name: "q".to_string(),
                max_queue_size: max,
                backpressure_threshold: 0.5,
                drain_poll_interval: Duration::from_millis(5),
                submit_timeout: Duration::from_millis(100),
            },
        )
    }

    fn job(name: &str) -> CreateQueueJob {
        CreateQueueJob::new("ignored", name, "echo", serde_json::json!({}))
    }

    #[tokio::test]
    async fn test_add_overrides_queue_name() {
        let stores = InMemoryStores::new();
        let queue = smart(&stores, None);
        let row = queue.add(job("a")).await.unwrap();
        assert_eq!(row.queue_name, "q");
    }

    #[tokio::test]
    async fn test_fail_fast_over_capacity() {
        let stores = InMemoryStores::new();
        let queue = smart(&stores, Some(2));

        queue.add(job("a")).await.unwrap();
        // Second submission is over the 50% threshold and times out waiting.
        let second = queue.add(job("b")).await;
        assert!(matches!(second, Err(EngineError::Timeout(_))));

        // Fill to the cap behind the frontend's back, then fail fast.
        stores.queue().submit(job("c")).await.unwrap();
        let third = queue.add(job("d")).await;
        assert!(matches!(third, Err(EngineError::QueueFull { .. })));
    }

    #[tokio::test]
    async fn test_cancel_removes_waiting_job() {
        let stores = InMemoryStores::new();
        let queue = smart(&stores, None);
        let row = queue.add(job("a")).await.unwrap();

        assert!(queue.cancel(row.id).await.unwrap());
        assert!(stores.queue().get_job(row.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_wait_for_all_settles_on_success_move() {
        let stores = InMemoryStores::new();
        let queue = smart(&stores, None);
        let row = queue.add(job("a")).await.unwrap();

        let backend = stores.queue();
        let settle = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            backend
                .move_to_success(row.id, None, Duration::from_millis(1))
                .await
                .unwrap();
        });

        queue.wait_for_all(Duration::from_secs(2)).await.unwrap();
        settle.await.unwrap();
    }

    #[tokio::test]
    async fn test_pause_resume_round_trip() {
        let stores = InMemoryStores::new();
        let queue = smart(&stores, None);
        queue.add(job("a").with_group("g")).await.unwrap();

        assert_eq!(queue.pause("g").await.unwrap(), 1);
        let stats = queue.stats().await.unwrap();
        assert_eq!(stats.paused, 1);

        assert_eq!(queue.resume("g").await.unwrap(), 1);
        let stats = queue.stats().await.unwrap();
        assert_eq!(stats.waiting, 1);
    }
}
