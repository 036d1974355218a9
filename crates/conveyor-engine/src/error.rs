//! Engine error type
//!
//! Error kinds follow the retry semantics: validation errors are fatal for
//! the affected entity, executor and timeout errors are retried up to the
//! attempt bound, system errors are treated like timeouts. Lock contention
//! is never an error; lock calls return `false`.

use thiserror::Error;
use uuid::Uuid;

use conveyor_core::registry::RegistryError;
use conveyor_core::ValidationError;
use conveyor_storage::StoreError;

/// Result type alias for engine operations
pub type Result<T> = std::result::Result<T, EngineError>;

/// Errors that can occur during engine operation
#[derive(Debug, Error)]
pub enum EngineError {
    /// Bad workflow definition, unknown executor name, malformed payload
    #[error("validation error: {0}")]
    Validation(#[from] ValidationError),

    /// Unknown or duplicate executor
    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),

    /// Storage read/write failure; retried with backoff by callers
    #[error("storage error: {0}")]
    Storage(#[from] StoreError),

    /// The executor reported failure; retriable up to the attempt bound
    #[error("executor error: {0}")]
    Executor(String),

    /// The executor exceeded its configured timeout
    #[error("timeout after {0}ms")]
    Timeout(u64),

    /// Sandbox crash, IPC failure; treated like a timeout for retry purposes
    #[error("system error: {0}")]
    System(String),

    /// Workflow instance lookup failure
    #[error("workflow instance not found: {0}")]
    InstanceNotFound(Uuid),

    /// Definition lookup failure
    #[error("workflow definition not found: {0}")]
    DefinitionNotFound(String),

    /// The operation does not apply to the entity's current state
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// Queue is over its configured capacity
    #[error("queue '{queue}' is full ({depth}/{max})")]
    QueueFull {
        queue: String,
        depth: i64,
        max: usize,
    },

    /// Component lifecycle misuse
    #[error("{0} is already running")]
    AlreadyRunning(&'static str),

    /// Internal error
    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl EngineError {
    pub fn executor(msg: impl Into<String>) -> Self {
        EngineError::Executor(msg.into())
    }

    pub fn system(msg: impl Into<String>) -> Self {
        EngineError::System(msg.into())
    }

    pub fn invalid_state(msg: impl Into<String>) -> Self {
        EngineError::InvalidState(msg.into())
    }

    /// Whether the failure is transient and worth another attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            EngineError::Storage(_)
                | EngineError::Executor(_)
                | EngineError::Timeout(_)
                | EngineError::System(_)
        )
    }
}
