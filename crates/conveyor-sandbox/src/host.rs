//! Sandbox process host
//!
//! Owns one child process: spawn with piped stdio, wait for the `ready`
//! frame, send `execute` frames and collect `progress`/`result`/`error`
//! responses. A job that overruns its timeout kills the process; a child
//! that exits non-zero fails its current job with an exit-code error.

use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tracing::{debug, warn};
use uuid::Uuid;

use conveyor_core::executor::ExecutionOutcome;

use crate::protocol::Frame;

/// Sandbox errors
#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    /// Could not spawn or talk to the child process
    #[error("sandbox spawn failed: {0}")]
    Spawn(String),

    /// The child never sent `ready` within the handshake timeout
    #[error("sandbox did not become ready within {0:?}")]
    HandshakeTimeout(Duration),

    /// The job overran its timeout; the process was killed
    #[error("sandbox job timed out after {0:?}")]
    JobTimeout(Duration),

    /// The child exited mid-job
    #[error("sandbox exited with code {code:?} during job")]
    Exited { code: Option<i32> },

    /// Malformed frame on the wire
    #[error("protocol error: {0}")]
    Protocol(String),

    /// I/O failure on the child's pipes
    #[error("sandbox io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Configuration for spawning sandboxes.
#[derive(Debug, Clone)]
pub struct SandboxHostConfig {
    /// Worker binary to run.
    pub worker_path: String,

    /// Arguments passed to the worker binary.
    pub args: Vec<String>,

    /// How long to wait for the `ready` frame.
    pub handshake_timeout: Duration,

    /// Per-job execution timeout.
    pub job_timeout: Duration,
}

impl Default for SandboxHostConfig {
    fn default() -> Self {
        Self {
            worker_path: "conveyor-sandbox-worker".to_string(),
            args: vec![],
            handshake_timeout: Duration::from_secs(10),
            job_timeout: Duration::from_secs(300),
        }
    }
}

/// One live sandbox process.
pub struct Sandbox {
    child: Child,
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
    config: SandboxHostConfig,
    jobs_run: usize,
}

impl Sandbox {
    /// Spawn the worker process and complete the ready handshake.
    pub async fn spawn(config: SandboxHostConfig) -> Result<Self, SandboxError> {
        let mut child = Command::new(&config.worker_path)
            .args(&config.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| SandboxError::Spawn(e.to_string()))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| SandboxError::Spawn("child stdin unavailable".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| SandboxError::Spawn("child stdout unavailable".to_string()))?;

        let mut sandbox = Self {
            child,
            stdin,
            stdout: BufReader::new(stdout),
            config,
            jobs_run: 0,
        };

        match tokio::time::timeout(sandbox.config.handshake_timeout, sandbox.read_frame()).await {
            Ok(Ok(Frame::Ready)) => {
                debug!("sandbox ready");
                Ok(sandbox)
            }
            Ok(Ok(other)) => Err(SandboxError::Protocol(format!(
                "expected ready frame, got {:?}",
                other
            ))),
            Ok(Err(e)) => Err(e),
            Err(_) => {
                sandbox.kill().await;
                Err(SandboxError::HandshakeTimeout(
                    sandbox.config.handshake_timeout,
                ))
            }
        }
    }

    /// Jobs this process has run; pools recycle past a threshold.
    pub fn jobs_run(&self) -> usize {
        self.jobs_run
    }

    /// Run one executor invocation in the sandbox.
    ///
    /// Progress frames are forwarded to `on_progress`. On timeout the
    /// process is killed and must be discarded.
    pub async fn execute(
        &mut self,
        job_id: Uuid,
        name: &str,
        data: serde_json::Value,
        config: Option<serde_json::Value>,
        mut on_progress: impl FnMut(serde_json::Value),
    ) -> Result<ExecutionOutcome, SandboxError> {
        self.jobs_run += 1;

        self.write_frame(&Frame::Execute {
            job_id,
            name: name.to_string(),
            data,
            config,
        })
        .await?;

        let deadline = tokio::time::Instant::now() + self.config.job_timeout;
        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            let frame = match tokio::time::timeout(remaining, self.read_frame()).await {
                Ok(frame) => frame?,
                Err(_) => {
                    warn!(%job_id, "sandbox job timed out, killing process");
                    self.kill().await;
                    return Err(SandboxError::JobTimeout(self.config.job_timeout));
                }
            };

            match frame {
                Frame::Progress {
                    job_id: frame_job,
                    data,
                } if frame_job == job_id => on_progress(data),
                Frame::Result {
                    job_id: frame_job,
                    data,
                } if frame_job == job_id => {
                    return Ok(ExecutionOutcome::ok(data));
                }
                Frame::Error {
                    job_id: frame_job,
                    error,
                } if frame_job == job_id => {
                    let mut outcome = ExecutionOutcome::err(error.message);
                    if let Some(stack) = error.stack {
                        outcome = outcome.with_details(serde_json::json!({ "stack": stack }));
                    }
                    return Ok(outcome);
                }
                other => {
                    // Frames for other jobs are a protocol violation: the
                    // host runs one job at a time per process.
                    return Err(SandboxError::Protocol(format!(
                        "unexpected frame {:?}",
                        other
                    )));
                }
            }
        }
    }

    /// Ask the child to exit, then make sure it does.
    pub async fn shutdown(mut self) {
        if self.write_frame(&Frame::Shutdown).await.is_ok() {
            let graceful =
                tokio::time::timeout(Duration::from_secs(2), self.child.wait()).await;
            if graceful.is_ok() {
                return;
            }
        }
        self.kill().await;
    }

    /// Kill the process immediately.
    pub async fn kill(&mut self) {
        if let Err(e) = self.child.kill().await {
            warn!(error = %e, "failed to kill sandbox");
        }
    }

    /// Whether the process has exited; returns the code if so.
    pub fn exit_code(&mut self) -> Option<Option<i32>> {
        match self.child.try_wait() {
            Ok(Some(status)) => Some(status.code()),
            _ => None,
        }
    }

    async fn write_frame(&mut self, frame: &Frame) -> Result<(), SandboxError> {
        let mut line = frame
            .encode()
            .map_err(|e| SandboxError::Protocol(e.to_string()))?;
        line.push('\n');
        self.stdin.write_all(line.as_bytes()).await?;
        self.stdin.flush().await?;
        Ok(())
    }

    async fn read_frame(&mut self) -> Result<Frame, SandboxError> {
        let mut line = String::new();
        let read = self.stdout.read_line(&mut line).await?;
        if read == 0 {
            // EOF: the child died.
            let code = self.exit_code().flatten();
            return Err(SandboxError::Exited { code });
        }
        Frame::decode(&line).map_err(|e| SandboxError::Protocol(e.to_string()))
    }
}
