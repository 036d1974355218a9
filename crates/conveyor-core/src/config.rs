//! Engine configuration
//!
//! One config struct is shared by the worker pool, the scheduler and the
//! schedule service; each component reads the slice it cares about.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::retry::{duration_millis, BackoffKind, RetryPolicy};

/// Sandbox host settings (out-of-process executors).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SandboxConfig {
    pub enabled: bool,

    /// Maximum concurrently live sandbox processes.
    pub max_sandboxes: usize,

    /// Jobs a sandbox may run before being recycled.
    pub max_jobs_per_sandbox: usize,

    /// Per-job execution timeout.
    #[serde(with = "duration_millis")]
    pub timeout: Duration,

    /// Path to the sandbox worker binary.
    pub worker_path: Option<String>,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            max_sandboxes: 4,
            max_jobs_per_sandbox: 100,
            timeout: Duration::from_secs(300),
            worker_path: None,
        }
    }
}

/// Engine-wide configuration.
///
/// # Example
///
/// ```
/// use conveyor_core::config::EngineConfig;
/// use std::time::Duration;
///
/// let config = EngineConfig::default()
///     .with_max_concurrency(20)
///     .with_lock_ttl(Duration::from_secs(60));
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Parallel jobs per worker.
    pub max_concurrency: usize,

    /// Default lock duration; renewal runs at half this interval.
    #[serde(with = "duration_millis")]
    pub lock_ttl: Duration,

    /// Queue poll cadence (minimum interval; the poller backs off when idle).
    #[serde(with = "duration_millis")]
    pub poll_interval: Duration,

    /// Default attempt bound for queue jobs.
    pub default_job_max_attempts: u32,

    /// Backoff between job retries.
    pub backoff: RetryPolicy,

    /// Fraction of `max_queue_size` above which submissions wait.
    pub backpressure_threshold: f64,

    /// Hard cap on queued jobs; submissions above it fail fast.
    pub max_queue_size: Option<usize>,

    pub sandbox: SandboxConfig,

    /// Retention for execution logs and schedule history.
    pub retention_days: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 10,
            lock_ttl: Duration::from_secs(30),
            poll_interval: Duration::from_millis(100),
            default_job_max_attempts: 3,
            backoff: RetryPolicy::exponential(),
            backpressure_threshold: 0.8,
            max_queue_size: None,
            sandbox: SandboxConfig::default(),
            retention_days: 30,
        }
    }
}

impl EngineConfig {
    pub fn with_max_concurrency(mut self, max: usize) -> Self {
        self.max_concurrency = max.max(1);
        self
    }

    pub fn with_lock_ttl(mut self, ttl: Duration) -> Self {
        self.lock_ttl = ttl;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_default_job_max_attempts(mut self, attempts: u32) -> Self {
        self.default_job_max_attempts = attempts.max(1);
        self
    }

    pub fn with_backoff(mut self, kind: BackoffKind, base: Duration, max: Duration) -> Self {
        self.backoff = self
            .backoff
            .with_backoff(kind)
            .with_base_delay(base)
            .with_max_delay(max);
        self
    }

    pub fn with_backpressure_threshold(mut self, threshold: f64) -> Self {
        self.backpressure_threshold = threshold.clamp(0.0, 1.0);
        self
    }

    pub fn with_max_queue_size(mut self, size: usize) -> Self {
        self.max_queue_size = Some(size);
        self
    }

    pub fn with_sandbox(mut self, sandbox: SandboxConfig) -> Self {
        self.sandbox = sandbox;
        self
    }

    pub fn with_retention_days(mut self, days: u32) -> Self {
        self.retention_days = days;
        self
    }

    /// Lock renewal interval: half the TTL.
    pub fn lock_renew_interval(&self) -> Duration {
        self.lock_ttl / 2
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.max_concurrency, 10);
        assert_eq!(config.lock_ttl, Duration::from_secs(30));
        assert_eq!(config.default_job_max_attempts, 3);
        assert_eq!(config.backpressure_threshold, 0.8);
        assert!(!config.sandbox.enabled);
    }

    #[test]
    fn test_builder() {
        let config = EngineConfig::default()
            .with_max_concurrency(20)
            .with_lock_ttl(Duration::from_secs(60))
            .with_backpressure_threshold(1.5)
            .with_max_queue_size(1000);

        assert_eq!(config.max_concurrency, 20);
        assert_eq!(config.lock_renew_interval(), Duration::from_secs(30));
        // Clamped to 1.0
        assert_eq!(config.backpressure_threshold, 1.0);
        assert_eq!(config.max_queue_size, Some(1000));
    }

    #[test]
    fn test_serialization_round_trip() {
        let config = EngineConfig::default().with_max_concurrency(4);
        let json = serde_json::to_string(&config).unwrap();
        let parsed: EngineConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, config);
    }
}
