//! # Conveyor core
//!
//! Domain types for the Conveyor workflow and task orchestration engine:
//!
//! - **Definitions**: versioned workflow graphs of `simple`, `parallel` and
//!   `loop` nodes, validated against the executor registry
//! - **Statuses**: instance/node/job state machines with guarded transitions
//! - **Executor contract**: the JSON-level interface between the engine and
//!   user work handlers, plus the name-keyed registry
//! - **Policies**: retry/backoff, token-bucket rate limiting, resource pools
//! - **Configuration**: the engine-wide config consumed by workers,
//!   schedulers and the sandbox host
//!
//! No I/O lives in this crate; persistence is `conveyor-storage` and the
//! runtime is `conveyor-engine`.

pub mod config;
pub mod definition;
pub mod error;
pub mod executor;
pub mod pool;
pub mod ratelimit;
pub mod registry;
pub mod retry;
pub mod status;

/// Prelude for common imports
pub mod prelude {
    pub use crate::config::{EngineConfig, SandboxConfig};
    pub use crate::definition::{
        Edge, JoinPolicy, LoopExecutorConfig, LoopSourceSpec, NodeSpec, OnChildFailure,
        WorkflowDefinition, WorkflowGraph,
    };
    pub use crate::error::ValidationError;
    pub use crate::executor::{
        DependencyResult, ExecutionContext, ExecutionMetrics, ExecutionOutcome, Executor, NextTask,
    };
    pub use crate::registry::{ExecutorRegistry, RegistryError};
    pub use crate::retry::{BackoffKind, RetryPolicy};
    pub use crate::status::{
        InstanceStatus, JobStatus, LockType, LoopPhase, LoopProgress, NodeStatus,
    };
}

pub use config::{EngineConfig, SandboxConfig};
pub use definition::{
    Edge, JoinPolicy, LoopExecutorConfig, LoopSourceSpec, NodeRetrySpec, NodeSpec, OnChildFailure,
    WorkflowDefinition, WorkflowGraph,
};
pub use error::ValidationError;
pub use executor::{
    DependencyResult, ExecutionContext, ExecutionMetrics, ExecutionOutcome, Executor, NextTask,
};
pub use registry::{ExecutorRegistry, RegistryError};
pub use retry::{BackoffKind, RetryPolicy};
pub use status::{InstanceStatus, JobStatus, LockType, LoopPhase, LoopProgress, NodeStatus};
