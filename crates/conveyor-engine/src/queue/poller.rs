//! Queue polling with adaptive backoff
//!
//! Polls `find_pending_jobs` at the configured cadence, stretching the
//! interval while the queue is idle and snapping back to the minimum as
//! soon as work appears.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, trace};

use conveyor_storage::models::QueueJobRow;
use conveyor_storage::{QueueStore, StoreError};

/// Polling configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct PollerConfig {
    /// Minimum poll interval (when jobs are available).
    pub min_interval: Duration,

    /// Maximum poll interval (when idle).
    pub max_interval: Duration,

    /// Backoff multiplier applied after an empty poll.
    pub backoff_multiplier: f64,

    /// Maximum jobs fetched per poll.
    pub batch_size: usize,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            min_interval: Duration::from_millis(100),
            max_interval: Duration::from_secs(5),
            backoff_multiplier: 1.5,
            batch_size: 10,
        }
    }
}

impl PollerConfig {
    pub fn with_min_interval(mut self, interval: Duration) -> Self {
        self.min_interval = interval;
        self
    }

    pub fn with_max_interval(mut self, interval: Duration) -> Self {
        self.max_interval = interval;
        self
    }

    pub fn with_batch_size(mut self, size: usize) -> Self {
        self.batch_size = size.max(1);
        self
    }
}

/// Queue poller with adaptive backoff.
pub struct QueuePoller {
    queue: Arc<dyn QueueStore>,
    queue_name: String,
    config: PollerConfig,
    current_interval: Duration,
    shutdown_rx: watch::Receiver<bool>,
}

impl QueuePoller {
    pub fn new(
        queue: Arc<dyn QueueStore>,
        queue_name: impl Into<String>,
        config: PollerConfig,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            queue,
            queue_name: queue_name.into(),
            current_interval: config.min_interval,
            config,
            shutdown_rx,
        }
    }

    /// Fetch up to `max_jobs` dispatchable jobs, excluding paused groups.
    pub async fn poll(
        &mut self,
        max_jobs: usize,
        exclude_group_ids: &[String],
    ) -> Result<Vec<QueueJobRow>, StoreError> {
        if self.is_shutdown() {
            return Ok(vec![]);
        }

        let batch = max_jobs.min(self.config.batch_size);
        let jobs = self
            .queue
            .find_pending_jobs(&self.queue_name, batch, exclude_group_ids, None)
            .await?;

        if jobs.is_empty() {
            self.increase_backoff();
            trace!(
                interval_ms = self.current_interval.as_millis(),
                "no pending jobs, backing off"
            );
        } else {
            self.reset_backoff();
            debug!(count = jobs.len(), "fetched pending jobs");
        }

        Ok(jobs)
    }

    /// Sleep for the current interval. Returns true if shutdown was
    /// signalled during the wait.
    pub async fn wait(&mut self) -> bool {
        let mut shutdown_rx = self.shutdown_rx.clone();
        tokio::select! {
            _ = tokio::time::sleep(self.current_interval) => false,
            _ = shutdown_rx.changed() => true,
        }
    }

    pub fn is_shutdown(&self) -> bool {
        *self.shutdown_rx.borrow()
    }

    pub fn current_interval(&self) -> Duration {
        self.current_interval
    }

    fn reset_backoff(&mut self) {
        self.current_interval = self.config.min_interval;
    }

    fn increase_backoff(&mut self) {
        let next = Duration::from_secs_f64(
            self.current_interval.as_secs_f64() * self.config.backoff_multiplier,
        );
        self.current_interval = next.min(self.config.max_interval);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use conveyor_storage::models::CreateQueueJob;
    use conveyor_storage::InMemoryStores;

    #[tokio::test]
    async fn test_backoff_grows_then_resets() {
        let stores = InMemoryStores::new();
        let queue: Arc<dyn QueueStore> = Arc::new(stores.queue());
        let (_tx, rx) = watch::channel(false);
        let mut poller = QueuePoller::new(Arc::clone(&queue), "q", PollerConfig::default(), rx);

        let initial = poller.current_interval();
        poller.poll(10, &[]).await.unwrap();
        assert!(poller.current_interval() > initial);
        poller.poll(10, &[]).await.unwrap();
        let grown = poller.current_interval();
        assert!(grown > initial);

        queue
            .submit(CreateQueueJob::new("q", "a", "echo", serde_json::json!({})))
            .await
            .unwrap();
        let jobs = poller.poll(10, &[]).await.unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(poller.current_interval(), initial);
    }

    #[tokio::test]
    async fn test_backoff_capped_at_max() {
        let stores = InMemoryStores::new();
        let (_tx, rx) = watch::channel(false);
        let config = PollerConfig {
            min_interval: Duration::from_millis(100),
            max_interval: Duration::from_millis(300),
            backoff_multiplier: 10.0,
            batch_size: 10,
        };
        let mut poller = QueuePoller::new(Arc::new(stores.queue()), "q", config, rx);

        poller.poll(10, &[]).await.unwrap();
        poller.poll(10, &[]).await.unwrap();
        assert_eq!(poller.current_interval(), Duration::from_millis(300));
    }

    #[tokio::test]
    async fn test_shutdown_short_circuits() {
        let stores = InMemoryStores::new();
        let (tx, rx) = watch::channel(false);
        let mut poller =
            QueuePoller::new(Arc::new(stores.queue()), "q", PollerConfig::default(), rx);

        tx.send(true).unwrap();
        assert!(poller.is_shutdown());
        assert!(poller.poll(10, &[]).await.unwrap().is_empty());
        assert!(poller.wait().await || poller.is_shutdown());
    }
}
