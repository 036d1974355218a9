//! Sandbox worker loop
//!
//! The child side of the protocol. A worker binary builds its own executor
//! registry and hands it to [`run_worker`], which:
//!
//! 1. writes `ready` to stdout
//! 2. reads `execute` frames from stdin
//! 3. runs the named executor and writes `result`/`error` frames
//! 4. exits on `shutdown` or stdin EOF
//!
//! ```ignore
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let mut registry = ExecutorRegistry::new();
//!     registry.register(Arc::new(SyncExecutor))?;
//!     conveyor_sandbox::run_worker(Arc::new(registry)).await
//! }
//! ```

use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::{debug, warn};

use conveyor_core::executor::ExecutionContext;
use conveyor_core::registry::ExecutorRegistry;

use crate::protocol::{Frame, FrameError};

/// Run the worker loop over stdin/stdout until shutdown or EOF.
pub async fn run_worker(registry: Arc<ExecutorRegistry>) -> anyhow::Result<()> {
    let stdin = BufReader::new(tokio::io::stdin());
    let stdout = tokio::io::stdout();
    run_worker_on(registry, stdin, stdout).await
}

/// The worker loop over arbitrary streams; split out for tests.
pub async fn run_worker_on<R, W>(
    registry: Arc<ExecutorRegistry>,
    reader: R,
    mut writer: W,
) -> anyhow::Result<()>
where
    R: tokio::io::AsyncBufRead + Unpin,
    W: tokio::io::AsyncWrite + Unpin,
{
    write_frame(&mut writer, &Frame::Ready).await?;

    let mut lines = reader.lines();
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }

        let frame = match Frame::decode(&line) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(error = %e, "dropping malformed frame");
                continue;
            }
        };

        match frame {
            Frame::Execute {
                job_id,
                name,
                data,
                config,
            } => {
                debug!(%job_id, executor = %name, "sandbox executing");

                let response = match registry.get(&name) {
                    Ok(executor) => {
                        let ctx = ExecutionContext {
                            input_data: data,
                            config: config.unwrap_or(serde_json::Value::Null),
                            job_id: Some(job_id),
                            ..Default::default()
                        };
                        let outcome = executor.execute(ctx).await;
                        if outcome.success {
                            Frame::Result {
                                job_id,
                                data: outcome.data.unwrap_or(serde_json::Value::Null),
                            }
                        } else {
                            Frame::Error {
                                job_id,
                                error: FrameError::new(
                                    outcome
                                        .error
                                        .unwrap_or_else(|| "executor failed".to_string()),
                                ),
                            }
                        }
                    }
                    Err(e) => Frame::Error {
                        job_id,
                        error: FrameError::new(e.to_string()),
                    },
                };

                write_frame(&mut writer, &response).await?;
            }
            Frame::Shutdown => {
                debug!("sandbox worker shutting down");
                break;
            }
            other => {
                warn!(frame = ?other, "unexpected frame on worker stdin");
            }
        }
    }

    Ok(())
}

async fn write_frame<W>(writer: &mut W, frame: &Frame) -> anyhow::Result<()>
where
    W: tokio::io::AsyncWrite + Unpin,
{
    let mut line = frame.encode()?;
    line.push('\n');
    writer.write_all(line.as_bytes()).await?;
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    use async_trait::async_trait;
    use conveyor_core::executor::{ExecutionOutcome, Executor};
    use uuid::Uuid;

    struct Echo;

    #[async_trait]
    impl Executor for Echo {
        fn name(&self) -> &str {
            "echo"
        }

        async fn execute(&self, ctx: ExecutionContext) -> ExecutionOutcome {
            ExecutionOutcome::ok(ctx.input_data)
        }
    }

    struct Fails;

    #[async_trait]
    impl Executor for Fails {
        fn name(&self) -> &str {
            "fails"
        }

        async fn execute(&self, _ctx: ExecutionContext) -> ExecutionOutcome {
            ExecutionOutcome::err("induced failure")
        }
    }

    fn registry() -> Arc<ExecutorRegistry> {
        let mut registry = ExecutorRegistry::new();
        registry.register(Arc::new(Echo)).unwrap();
        registry.register(Arc::new(Fails)).unwrap();
        Arc::new(registry)
    }

    /// Drive the worker loop over in-memory pipes and return its output
    /// frames.
    async fn run_script(input_frames: Vec<Frame>) -> Vec<Frame> {
        let mut input = String::new();
        for frame in input_frames {
            input.push_str(&frame.encode().unwrap());
            input.push('\n');
        }

        let reader = BufReader::new(std::io::Cursor::new(input.into_bytes()));
        let mut sink = std::io::Cursor::new(Vec::new());
        run_worker_on(registry(), reader, &mut sink)
            .await
            .unwrap();

        String::from_utf8(sink.into_inner())
            .unwrap()
            .lines()
            .map(|line| Frame::decode(line).unwrap())
            .collect()
    }

    #[tokio::test]
    async fn test_ready_then_result() {
        let job_id = Uuid::now_v7();
        let frames = run_script(vec![Frame::Execute {
            job_id,
            name: "echo".to_string(),
            data: serde_json::json!({"k": 1}),
            config: None,
        }])
        .await;

        assert_eq!(frames[0], Frame::Ready);
        assert_eq!(
            frames[1],
            Frame::Result {
                job_id,
                data: serde_json::json!({"k": 1}),
            }
        );
    }

    #[tokio::test]
    async fn test_executor_failure_becomes_error_frame() {
        let job_id = Uuid::now_v7();
        let frames = run_script(vec![Frame::Execute {
            job_id,
            name: "fails".to_string(),
            data: serde_json::Value::Null,
            config: None,
        }])
        .await;

        match &frames[1] {
            Frame::Error { job_id: id, error } => {
                assert_eq!(*id, job_id);
                assert_eq!(error.message, "induced failure");
            }
            other => panic!("expected error frame, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_unknown_executor_reports_error() {
        let job_id = Uuid::now_v7();
        let frames = run_script(vec![Frame::Execute {
            job_id,
            name: "missing".to_string(),
            data: serde_json::Value::Null,
            config: None,
        }])
        .await;

        assert!(matches!(&frames[1], Frame::Error { .. }));
    }

    #[tokio::test]
    async fn test_shutdown_ends_loop() {
        let frames = run_script(vec![Frame::Shutdown]).await;
        // Only the handshake; nothing after shutdown.
        assert_eq!(frames, vec![Frame::Ready]);
    }

    #[tokio::test]
    async fn test_multiple_jobs_in_order() {
        let a = Uuid::now_v7();
        let b = Uuid::now_v7();
        let frames = run_script(vec![
            Frame::Execute {
                job_id: a,
                name: "echo".to_string(),
                data: serde_json::json!(1),
                config: None,
            },
            Frame::Execute {
                job_id: b,
                name: "echo".to_string(),
                data: serde_json::json!(2),
                config: None,
            },
        ])
        .await;

        assert_eq!(frames.len(), 3);
        assert_eq!(frames[1].job_id(), Some(a));
        assert_eq!(frames[2].job_id(), Some(b));
    }
}
