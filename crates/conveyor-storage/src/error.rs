//! Store error type

use uuid::Uuid;

/// Error type for store operations
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Workflow definition not found
    #[error("definition not found: {0}")]
    DefinitionNotFound(String),

    /// Workflow instance not found
    #[error("workflow instance not found: {0}")]
    InstanceNotFound(Uuid),

    /// Node instance not found
    #[error("node instance not found: {0}")]
    NodeNotFound(Uuid),

    /// Queue job not found
    #[error("queue job not found: {0}")]
    JobNotFound(Uuid),

    /// Schedule not found
    #[error("schedule not found: {0}")]
    ScheduleNotFound(Uuid),

    /// Status transition rejected by the guard table
    #[error("invalid status transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    /// Database error
    #[error("database error: {0}")]
    Database(String),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        StoreError::Database(err.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Serialization(err.to_string())
    }
}

impl StoreError {
    pub fn invalid_transition(from: impl ToString, to: impl ToString) -> Self {
        StoreError::InvalidTransition {
            from: from.to_string(),
            to: to.to_string(),
        }
    }
}
