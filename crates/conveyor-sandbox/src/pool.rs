//! Sandbox pool
//!
//! Bounded pool of sandbox processes. Checkout order: reuse an idle
//! process, else spawn (up to `max_sandboxes`), else wait. Processes are
//! recycled after `max_jobs_per_sandbox` jobs; an idle-cleanup pass shuts
//! down processes idle past the threshold; a crashed process is replaced
//! on next checkout instead of being returned.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Semaphore;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use conveyor_core::executor::ExecutionOutcome;

use crate::host::{Sandbox, SandboxError, SandboxHostConfig};

/// Pool configuration.
#[derive(Debug, Clone)]
pub struct SandboxPoolConfig {
    pub host: SandboxHostConfig,

    /// Maximum live processes.
    pub max_sandboxes: usize,

    /// Jobs per process before recycling.
    pub max_jobs_per_sandbox: usize,

    /// Idle processes older than this are shut down by cleanup.
    pub idle_timeout: Duration,
}

impl Default for SandboxPoolConfig {
    fn default() -> Self {
        Self {
            host: SandboxHostConfig::default(),
            max_sandboxes: 4,
            max_jobs_per_sandbox: 100,
            idle_timeout: Duration::from_secs(300),
        }
    }
}

struct IdleSandbox {
    sandbox: Sandbox,
    idle_since: Instant,
}

/// Bounded pool of sandbox processes.
pub struct SandboxPool {
    config: SandboxPoolConfig,
    idle: Mutex<VecDeque<IdleSandbox>>,
    permits: Arc<Semaphore>,
}

impl SandboxPool {
    pub fn new(config: SandboxPoolConfig) -> Self {
        let permits = Arc::new(Semaphore::new(config.max_sandboxes.max(1)));
        Self {
            config,
            idle: Mutex::new(VecDeque::new()),
            permits,
        }
    }

    /// Run one job on a pooled sandbox.
    ///
    /// A timeout or crash consumes the process (it is killed, not
    /// returned); the next job gets a fresh one.
    pub async fn execute(
        &self,
        job_id: Uuid,
        name: &str,
        data: serde_json::Value,
        config: Option<serde_json::Value>,
    ) -> Result<ExecutionOutcome, SandboxError> {
        let permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .expect("sandbox pool semaphore closed");

        let mut sandbox = self.checkout().await?;

        let result = sandbox
            .execute(job_id, name, data, config, |progress| {
                debug!(%job_id, ?progress, "sandbox progress");
            })
            .await;

        match &result {
            Ok(_) => {
                // Exit-code check catches a child that finished the job and
                // then died.
                if sandbox.exit_code().is_some() {
                    warn!(%job_id, "sandbox exited after job; not returning to pool");
                } else if sandbox.jobs_run() >= self.config.max_jobs_per_sandbox {
                    info!("sandbox reached job limit, recycling");
                    sandbox.shutdown().await;
                } else {
                    self.idle.lock().push_back(IdleSandbox {
                        sandbox,
                        idle_since: Instant::now(),
                    });
                }
            }
            Err(SandboxError::JobTimeout(_)) | Err(SandboxError::Exited { .. }) => {
                // Already dead or killed; drop it.
            }
            Err(_) => {
                sandbox.kill().await;
            }
        }

        drop(permit);
        result
    }

    /// Shut down idle processes past the idle threshold; returns how many
    /// were reaped.
    pub async fn cleanup_idle(&self) -> usize {
        let expired: Vec<Sandbox> = {
            let mut idle = self.idle.lock();
            let mut keep = VecDeque::new();
            let mut expired = vec![];
            while let Some(entry) = idle.pop_front() {
                if entry.idle_since.elapsed() >= self.config.idle_timeout {
                    expired.push(entry.sandbox);
                } else {
                    keep.push_back(entry);
                }
            }
            *idle = keep;
            expired
        };

        let count = expired.len();
        for sandbox in expired {
            sandbox.shutdown().await;
        }
        if count > 0 {
            debug!(count, "reaped idle sandboxes");
        }
        count
    }

    /// Number of idle processes currently pooled.
    pub fn idle_count(&self) -> usize {
        self.idle.lock().len()
    }

    /// Shut every pooled process down.
    pub async fn shutdown(&self) {
        let all: Vec<Sandbox> = {
            let mut idle = self.idle.lock();
            idle.drain(..).map(|entry| entry.sandbox).collect()
        };
        for sandbox in all {
            sandbox.shutdown().await;
        }
    }

    async fn checkout(&self) -> Result<Sandbox, SandboxError> {
        // Prefer an idle process that is still alive.
        loop {
            let candidate = self.idle.lock().pop_front();
            match candidate {
                Some(mut entry) => {
                    if entry.sandbox.exit_code().is_some() {
                        debug!("discarding dead idle sandbox");
                        continue;
                    }
                    return Ok(entry.sandbox);
                }
                None => break,
            }
        }

        Sandbox::spawn(self.config.host.clone()).await
    }
}
