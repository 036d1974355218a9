//! Database models
//!
//! Row structs mirror table shapes one-to-one (`FromRow`); Create/Update
//! structs are the write-side inputs. Statuses are stored as snake_case
//! strings and parsed back through the core enums.

use chrono::{DateTime, Utc};
use sqlx::FromRow;
use uuid::Uuid;

use conveyor_core::status::{InstanceStatus, JobStatus, LoopProgress, NodeStatus};

// ============================================
// Workflow definitions
// ============================================

/// Definition row from database. `graph` is the JSON-persisted
/// `WorkflowGraph`.
#[derive(Debug, Clone, FromRow)]
pub struct WorkflowDefinitionRow {
    pub id: Uuid,
    pub name: String,
    pub version: i32,
    pub graph: serde_json::Value,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct CreateWorkflowDefinition {
    pub name: String,
    pub version: i32,
    pub graph: serde_json::Value,
    pub activate: bool,
}

// ============================================
// Workflow instances
// ============================================

#[derive(Debug, Clone, FromRow)]
pub struct WorkflowInstanceRow {
    pub id: Uuid,
    pub definition_id: Uuid,
    pub definition_name: String,
    pub version: i32,
    pub status: String,
    pub current_node_id: Option<String>,
    pub input_data: Option<serde_json::Value>,
    pub result: Option<serde_json::Value>,
    pub retry_count: i32,
    pub max_retries: i32,
    pub error_message: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WorkflowInstanceRow {
    pub fn parsed_status(&self) -> Result<InstanceStatus, String> {
        self.status.parse()
    }
}

#[derive(Debug, Clone)]
pub struct CreateWorkflowInstance {
    pub definition_id: Uuid,
    pub definition_name: String,
    pub version: i32,
    pub input_data: Option<serde_json::Value>,
    pub max_retries: i32,
}

/// Filters for instance listing.
#[derive(Debug, Clone, Default)]
pub struct InstanceFilter {
    pub definition_id: Option<Uuid>,
    pub definition_name: Option<String>,
    pub status: Option<InstanceStatus>,
    pub created_after: Option<DateTime<Utc>>,
    pub created_before: Option<DateTime<Utc>>,
}

/// Aggregated instance statistics.
#[derive(Debug, Clone, Default, PartialEq, serde::Serialize)]
pub struct WorkflowStats {
    pub total: i64,
    pub pending: i64,
    pub running: i64,
    pub completed: i64,
    pub failed: i64,
    pub cancelled: i64,
    pub interrupted: i64,
    pub avg_duration_ms: Option<f64>,
}

// ============================================
// Node instances
// ============================================

#[derive(Debug, Clone, FromRow)]
pub struct NodeInstanceRow {
    pub id: Uuid,
    pub workflow_instance_id: Uuid,
    /// Non-null for sub-nodes created by parallel/loop fan-out.
    pub parent_node_id: Option<Uuid>,
    /// The graph node id this instance executes.
    pub node_id: String,
    pub node_name: String,
    pub node_type: String,
    pub status: String,
    pub child_index: Option<i32>,
    pub input_data: Option<serde_json::Value>,
    pub result: Option<serde_json::Value>,
    pub loop_progress: Option<serde_json::Value>,
    /// Queue job currently carrying this node's executor invocation.
    pub job_id: Option<Uuid>,
    pub retry_count: i32,
    pub error_message: Option<String>,
    pub error_details: Option<serde_json::Value>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl NodeInstanceRow {
    pub fn parsed_status(&self) -> Result<NodeStatus, String> {
        self.status.parse()
    }

    pub fn parsed_loop_progress(&self) -> Option<LoopProgress> {
        self.loop_progress
            .as_ref()
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }

    /// Top-level nodes have no parent.
    pub fn is_top_level(&self) -> bool {
        self.parent_node_id.is_none()
    }
}

#[derive(Debug, Clone)]
pub struct CreateNodeInstance {
    pub workflow_instance_id: Uuid,
    pub parent_node_id: Option<Uuid>,
    pub node_id: String,
    pub node_name: String,
    pub node_type: String,
    pub child_index: Option<i32>,
    pub input_data: Option<serde_json::Value>,
}

// ============================================
// Queue jobs
// ============================================

#[derive(Debug, Clone, FromRow)]
pub struct QueueJobRow {
    pub id: Uuid,
    pub queue_name: String,
    pub group_id: Option<String>,
    pub job_name: String,
    pub executor_name: String,
    pub payload: serde_json::Value,
    pub status: String,
    pub priority: i32,
    pub attempts: i32,
    pub max_attempts: i32,
    pub delay_until: Option<DateTime<Utc>>,
    pub locked_by: Option<String>,
    pub locked_until: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub error_code: Option<String>,
    pub error_stack: Option<String>,
    pub metadata: Option<serde_json::Value>,
    pub started_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl QueueJobRow {
    pub fn parsed_status(&self) -> Result<JobStatus, String> {
        self.status.parse()
    }

    /// Whether the row is currently claimed by a live lock.
    pub fn is_locked(&self, now: DateTime<Utc>) -> bool {
        matches!(self.locked_until, Some(until) if until > now)
    }
}

#[derive(Debug, Clone)]
pub struct CreateQueueJob {
    pub queue_name: String,
    pub group_id: Option<String>,
    pub job_name: String,
    pub executor_name: String,
    pub payload: serde_json::Value,
    pub priority: i32,
    pub max_attempts: i32,
    pub delay_until: Option<DateTime<Utc>>,
    pub metadata: Option<serde_json::Value>,
}

impl CreateQueueJob {
    pub fn new(
        queue_name: impl Into<String>,
        job_name: impl Into<String>,
        executor_name: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            queue_name: queue_name.into(),
            group_id: None,
            job_name: job_name.into(),
            executor_name: executor_name.into(),
            payload,
            priority: 0,
            max_attempts: 3,
            delay_until: None,
            metadata: None,
        }
    }

    pub fn with_group(mut self, group_id: impl Into<String>) -> Self {
        self.group_id = Some(group_id.into());
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: i32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn with_delay_until(mut self, delay_until: DateTime<Utc>) -> Self {
        self.delay_until = Some(delay_until);
        self
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

/// Row in the success table. Id-preserving move from the active table;
/// job `metadata` is intentionally dropped on the move.
#[derive(Debug, Clone, FromRow)]
pub struct QueueSuccessRow {
    pub id: Uuid,
    pub queue_name: String,
    pub job_name: String,
    pub executor_name: String,
    pub payload: serde_json::Value,
    pub result: Option<serde_json::Value>,
    pub attempts: i32,
    pub execution_time_ms: i64,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

/// Row in the failure table (final-reject flow).
#[derive(Debug, Clone, FromRow)]
pub struct QueueFailureRow {
    pub id: Uuid,
    pub queue_name: String,
    pub job_name: String,
    pub executor_name: String,
    pub payload: serde_json::Value,
    pub attempts: i32,
    pub error_message: Option<String>,
    pub error_code: Option<String>,
    pub error_stack: Option<String>,
    pub failed_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

/// Keyset cursor over the canonical `(priority desc, created_at asc, id asc)`
/// ordering of waiting jobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueCursor {
    pub priority: i32,
    pub created_at: DateTime<Utc>,
    pub id: Uuid,
}

impl QueueCursor {
    pub fn from_job(job: &QueueJobRow) -> Self {
        Self {
            priority: job.priority,
            created_at: job.created_at,
            id: job.id,
        }
    }
}

/// Per-queue counts by status plus archive table sizes.
#[derive(Debug, Clone, Default, PartialEq, serde::Serialize)]
pub struct QueueStats {
    pub waiting: i64,
    pub executing: i64,
    pub paused: i64,
    pub delayed: i64,
    pub failed: i64,
    pub succeeded: i64,
    pub rejected: i64,
}

// ============================================
// Locks
// ============================================

#[derive(Debug, Clone, FromRow)]
pub struct LockRow {
    pub lock_key: String,
    pub owner: String,
    pub lock_type: String,
    pub expires_at: DateTime<Utc>,
    pub lock_data: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Aggregate lock-table statistics, for diagnostics.
#[derive(Debug, Clone, Default, PartialEq, serde::Serialize)]
pub struct LockStats {
    pub total: i64,
    pub expired: i64,
    pub by_type: std::collections::BTreeMap<String, i64>,
}

// ============================================
// Execution log
// ============================================

#[derive(Debug, Clone, FromRow)]
pub struct ExecutionLogRow {
    pub id: Uuid,
    pub workflow_instance_id: Option<Uuid>,
    pub node_instance_id: Option<Uuid>,
    pub level: String,
    pub phase: String,
    pub message: String,
    pub details: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct CreateExecutionLog {
    pub workflow_instance_id: Option<Uuid>,
    pub node_instance_id: Option<Uuid>,
    pub level: String,
    pub phase: String,
    pub message: String,
    pub details: Option<serde_json::Value>,
}

impl CreateExecutionLog {
    pub fn info(phase: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            workflow_instance_id: None,
            node_instance_id: None,
            level: "info".to_string(),
            phase: phase.into(),
            message: message.into(),
            details: None,
        }
    }

    pub fn error(phase: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            level: "error".to_string(),
            ..Self::info(phase, message)
        }
    }

    pub fn for_instance(mut self, workflow_instance_id: Uuid) -> Self {
        self.workflow_instance_id = Some(workflow_instance_id);
        self
    }

    pub fn for_node(mut self, node_instance_id: Uuid) -> Self {
        self.node_instance_id = Some(node_instance_id);
        self
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }
}

// ============================================
// Schedules
// ============================================

#[derive(Debug, Clone, FromRow)]
pub struct ScheduleRow {
    pub id: Uuid,
    pub workflow_definition_id: Uuid,
    pub cron: String,
    pub timezone: String,
    pub enabled: bool,
    pub next_run_at: DateTime<Utc>,
    pub last_run_at: Option<DateTime<Utc>>,
    pub max_instances: i32,
    pub input_data: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct CreateSchedule {
    pub workflow_definition_id: Uuid,
    pub cron: String,
    pub timezone: String,
    pub enabled: bool,
    pub next_run_at: DateTime<Utc>,
    pub max_instances: i32,
    pub input_data: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Default)]
pub struct UpdateSchedule {
    pub cron: Option<String>,
    pub timezone: Option<String>,
    pub enabled: Option<bool>,
    pub next_run_at: Option<DateTime<Utc>>,
    pub max_instances: Option<i32>,
    pub input_data: Option<serde_json::Value>,
}

#[derive(Debug, Clone, FromRow)]
pub struct ScheduleExecutionRow {
    pub id: Uuid,
    pub schedule_id: Uuid,
    pub workflow_instance_id: Option<Uuid>,
    pub status: String,
    pub trigger_time: DateTime<Utc>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
    pub error_message: Option<String>,
}

/// Pagination parameters
#[derive(Debug, Clone, Copy)]
pub struct Pagination {
    pub offset: u32,
    pub limit: u32,
}

impl Default for Pagination {
    fn default() -> Self {
        Self {
            offset: 0,
            limit: 100,
        }
    }
}

impl Pagination {
    pub fn new(offset: u32, limit: u32) -> Self {
        Self { offset, limit }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_queue_job_builder() {
        let job = CreateQueueJob::new("default", "sync", "calendar.sync", serde_json::json!({}))
            .with_group("tenant-1")
            .with_priority(5)
            .with_max_attempts(0);

        assert_eq!(job.queue_name, "default");
        assert_eq!(job.group_id.as_deref(), Some("tenant-1"));
        assert_eq!(job.priority, 5);
        // Clamped to at least one attempt.
        assert_eq!(job.max_attempts, 1);
    }

    #[test]
    fn test_execution_log_builder() {
        let id = Uuid::now_v7();
        let log = CreateExecutionLog::error("node_execution", "executor failed")
            .for_instance(id)
            .with_details(serde_json::json!({"attempt": 2}));

        assert_eq!(log.level, "error");
        assert_eq!(log.workflow_instance_id, Some(id));
        assert!(log.details.is_some());
    }
}
