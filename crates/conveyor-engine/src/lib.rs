//! # Conveyor engine
//!
//! Runtime for the Conveyor workflow and task orchestration platform.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     WorkflowAdapter                          │
//! │   (public control surface: start/stop/resume/cancel/query)  │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │        WorkflowScheduler  +  NodeExecutionService            │
//! │  (drives instances under per-instance locks; simple nodes    │
//! │   enqueue jobs, parallel/loop nodes fan out child nodes)     │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     QueueWorkerPool                          │
//! │  (claims jobs, runs executors under timeouts, records        │
//! │   success/failure, applies retry backoff)                    │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! `ScheduleService` adds cron-driven starts; `RecoveryService` turns lock
//! TTL expiry into takeover of interrupted instances and orphaned jobs.
//! All cross-process coordination goes through the lock table; the engine
//! holds no in-memory mutex across I/O.

pub mod adapter;
pub mod error;
pub mod node_exec;
pub mod queue;
pub mod recovery;
pub mod schedule;
pub mod scheduler;

/// Prelude for common imports
pub mod prelude {
    pub use crate::adapter::{HealthReport, WorkflowAdapter};
    pub use crate::error::{EngineError, Result};
    pub use crate::node_exec::{NodeExecutionService, NodeProgress};
    pub use crate::queue::{
        PollerConfig, QueueWorkerPool, SmartQueue, SmartQueueConfig, WorkerConfig, WorkerStats,
    };
    pub use crate::recovery::{RecoveryConfig, RecoveryService};
    pub use crate::schedule::{ScheduleConfig, ScheduleService};
    pub use crate::scheduler::{RunOutcome, StartOptions, WorkflowScheduler};
}

pub use adapter::{HealthReport, WorkflowAdapter};
pub use error::{EngineError, Result};
pub use node_exec::{NodeExecutionService, NodeProgress};
pub use queue::{QueueWorkerPool, SmartQueue, SmartQueueConfig, WorkerConfig, WorkerStats};
pub use recovery::{RecoveryConfig, RecoveryService};
pub use schedule::{ScheduleConfig, ScheduleService};
pub use scheduler::{wait_for_terminal, RunOutcome, StartOptions, WorkflowScheduler};
