//! # Conveyor sandbox
//!
//! Out-of-process executor host. For untrusted or long-running executors
//! the engine trades the in-process call for a child process speaking a
//! framed JSON protocol over stdin/stdout:
//!
//! ```text
//! parent (pool/host)                child (worker loop)
//!        │       ◄── ready ──              │
//!        │       ── execute ──►            │
//!        │       ◄── progress ──           │
//!        │       ◄── result/error ──       │
//! ```
//!
//! The host enforces per-job timeouts by killing the process; the pool
//! bounds live processes, recycles them after a job quota and reaps idle
//! ones. A worker binary embeds [`run_worker`] with its own executor
//! registry.

pub mod host;
pub mod pool;
pub mod protocol;
pub mod worker;

pub use host::{Sandbox, SandboxError, SandboxHostConfig};
pub use pool::{SandboxPool, SandboxPoolConfig};
pub use protocol::{Frame, FrameError};
pub use worker::{run_worker, run_worker_on};
