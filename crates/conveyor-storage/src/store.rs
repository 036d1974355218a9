//! Store trait definitions
//!
//! Each trait covers one persistence domain. Implementations must be
//! thread-safe and support concurrent access from multiple worker
//! processes; every guarantee here must hold without any in-process
//! synchronization (coordination is the lock table, not a mutex).

use chrono::{DateTime, Utc};
use std::time::Duration;

use async_trait::async_trait;
use uuid::Uuid;

/// Lock key guarding advancement of one workflow instance.
pub fn workflow_lock_key(instance_id: Uuid) -> String {
    format!("workflow:{}", instance_id)
}

/// Lock key guarding one schedule's cron tick.
pub fn schedule_tick_lock_key(schedule_id: Uuid) -> String {
    format!("schedule-tick:{}", schedule_id)
}

use conveyor_core::status::{InstanceStatus, LockType, LoopProgress, NodeStatus};

use crate::error::StoreError;
use crate::models::*;

/// Distributed TTL locks.
///
/// "Did not get the lock" is a `false` return, never an error; errors are
/// reserved for storage failures.
#[async_trait]
pub trait LockStore: Send + Sync + 'static {
    /// Atomically acquire `key` for `owner`.
    ///
    /// Succeeds when no row exists for the key or the existing row has
    /// expired (take-over). Must be a single atomic statement, not
    /// read-then-write.
    async fn acquire(
        &self,
        key: &str,
        owner: &str,
        ttl: Duration,
        lock_type: LockType,
        lock_data: Option<serde_json::Value>,
    ) -> Result<bool, StoreError>;

    /// Release the lock. With `owner` set, releases only when the owner
    /// matches; with `None`, force-releases.
    async fn release(&self, key: &str, owner: Option<&str>) -> Result<bool, StoreError>;

    /// Extend a held, unexpired lock owned by `owner`.
    async fn renew(
        &self,
        key: &str,
        owner: &str,
        new_expires_at: DateTime<Utc>,
        lock_data: Option<serde_json::Value>,
    ) -> Result<bool, StoreError>;

    /// Delete all expired rows; returns how many were removed.
    async fn cleanup_expired(&self) -> Result<u64, StoreError>;

    /// The lock row, if present (expired or not).
    async fn get(&self, key: &str) -> Result<Option<LockRow>, StoreError>;

    /// Diagnostic: locks held by an owner.
    async fn find_by_owner(&self, owner: &str) -> Result<Vec<LockRow>, StoreError>;

    /// Diagnostic: locks of a given type.
    async fn find_by_lock_type(&self, lock_type: LockType) -> Result<Vec<LockRow>, StoreError>;

    /// Diagnostic: aggregate lock-table statistics.
    async fn statistics(&self) -> Result<LockStats, StoreError>;
}

/// Durable priority queue over three tables: active jobs, successes,
/// failures.
#[async_trait]
pub trait QueueStore: Send + Sync + 'static {
    /// Insert a new job; returns the complete row.
    async fn submit(&self, job: CreateQueueJob) -> Result<QueueJobRow, StoreError>;

    async fn get_job(&self, id: Uuid) -> Result<Option<QueueJobRow>, StoreError>;

    /// Dispatchable jobs: `waiting`, delay elapsed, group not excluded,
    /// ordered by `(priority desc, created_at asc, id asc)`. The cursor
    /// resumes strictly after its position for reentrant pagination.
    async fn find_pending_jobs(
        &self,
        queue_name: &str,
        limit: usize,
        exclude_group_ids: &[String],
        cursor: Option<QueueCursor>,
    ) -> Result<Vec<QueueJobRow>, StoreError>;

    /// Atomically claim a waiting, unlocked job for `owner`. Returns
    /// whether the caller won the claim.
    async fn lock_job_for_processing(
        &self,
        id: Uuid,
        owner: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError>;

    /// Extend the claim on a job `owner` currently holds.
    async fn renew_job_lock(
        &self,
        id: Uuid,
        owner: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError>;

    /// Clear lock fields; only the owner may unlock.
    async fn unlock_job(&self, id: Uuid, owner: &str) -> Result<bool, StoreError>;

    /// Flip the job's status while it is claimed (e.g. to `executing`).
    async fn mark_executing(&self, id: Uuid, owner: &str) -> Result<bool, StoreError>;

    /// Reset a job to `waiting`, clearing lock and error fields; used by
    /// recovery and explicit re-drives.
    async fn reset_job_to_waiting(&self, id: Uuid) -> Result<bool, StoreError>;

    /// Flip `delayed` jobs whose `delay_until` has elapsed back to
    /// `waiting`; run by pollers before fetching. Returns count promoted.
    async fn promote_due_delayed(&self, queue_name: &str) -> Result<u64, StoreError>;

    /// Reset every expired or orphaned lock in the queue.
    async fn reset_all_job_locks(&self, queue_name: &str) -> Result<u64, StoreError>;

    /// Clear lock fields on jobs whose lock expired; returns count.
    async fn cleanup_expired_locks(&self) -> Result<u64, StoreError>;

    /// Transactionally insert into the success table (id-preserving, job
    /// `metadata` dropped) and delete from the active table.
    async fn move_to_success(
        &self,
        id: Uuid,
        result: Option<serde_json::Value>,
        execution_time: Duration,
    ) -> Result<(), StoreError>;

    /// In-place failure: status `failed` plus error fields; the row stays
    /// in the active table for retry.
    async fn mark_as_failed(
        &self,
        id: Uuid,
        error_message: &str,
        error_code: Option<&str>,
        error_stack: Option<&str>,
    ) -> Result<(), StoreError>;

    /// Schedule another attempt: status `delayed` until `delay_until`,
    /// lock cleared, attempt count already incremented by the claim.
    async fn reschedule_for_retry(
        &self,
        id: Uuid,
        delay_until: DateTime<Utc>,
        error_message: &str,
    ) -> Result<(), StoreError>;

    /// Clear error fields and return a `failed` job to `waiting`. Guarded
    /// by the current status.
    async fn retry_failed_job(&self, id: Uuid) -> Result<bool, StoreError>;

    /// Transactionally move a job to the failure table (final reject).
    async fn move_to_failure(&self, id: Uuid) -> Result<(), StoreError>;

    /// Cancel a waiting/delayed/paused job by deleting it from the active
    /// table. Executing jobs are not touched (advisory cancellation is the
    /// worker's business).
    async fn cancel_job(&self, id: Uuid) -> Result<bool, StoreError>;

    /// Bulk flip `waiting`/`delayed` jobs of a group to `paused`.
    async fn pause_group(&self, queue_name: &str, group_id: &str) -> Result<u64, StoreError>;

    /// Bulk flip `paused` jobs of a group back to `waiting` (jobs with an
    /// unexpired delay go back to `delayed`).
    async fn resume_group(&self, queue_name: &str, group_id: &str) -> Result<u64, StoreError>;

    /// Group ids with at least one paused job in the queue.
    async fn paused_groups(&self, queue_name: &str) -> Result<Vec<String>, StoreError>;

    /// Jobs stuck in `executing` whose `updated_at` is older than the
    /// threshold; used by recovery.
    async fn find_orphaned_executing_jobs(
        &self,
        older_than: Duration,
    ) -> Result<Vec<QueueJobRow>, StoreError>;

    async fn get_success(&self, id: Uuid) -> Result<Option<QueueSuccessRow>, StoreError>;

    async fn get_failure(&self, id: Uuid) -> Result<Option<QueueFailureRow>, StoreError>;

    /// Count of jobs currently in the active table for a queue.
    async fn queue_depth(&self, queue_name: &str) -> Result<i64, StoreError>;

    /// Per-queue statistics across all three tables.
    async fn queue_stats(&self, queue_name: &str) -> Result<QueueStats, StoreError>;
}

/// Versioned workflow definitions.
#[async_trait]
pub trait DefinitionStore: Send + Sync + 'static {
    /// Insert a new version. With `activate`, atomically deactivates other
    /// versions of the same name.
    async fn create(
        &self,
        input: CreateWorkflowDefinition,
    ) -> Result<WorkflowDefinitionRow, StoreError>;

    /// Replace the graph of an existing version.
    async fn update_graph(
        &self,
        id: Uuid,
        graph: serde_json::Value,
    ) -> Result<Option<WorkflowDefinitionRow>, StoreError>;

    async fn get_by_id(&self, id: Uuid) -> Result<Option<WorkflowDefinitionRow>, StoreError>;

    async fn get_by_name_and_version(
        &self,
        name: &str,
        version: i32,
    ) -> Result<Option<WorkflowDefinitionRow>, StoreError>;

    /// The single active version for a name, if any.
    async fn get_active_by_name(
        &self,
        name: &str,
    ) -> Result<Option<WorkflowDefinitionRow>, StoreError>;

    /// All versions of a name, newest first.
    async fn list_versions(&self, name: &str) -> Result<Vec<WorkflowDefinitionRow>, StoreError>;

    /// Atomically make `version` the active one for `name` and deactivate
    /// the rest.
    async fn activate_version(&self, name: &str, version: i32) -> Result<bool, StoreError>;
}

/// Workflow instances.
#[async_trait]
pub trait InstanceStore: Send + Sync + 'static {
    async fn create(&self, input: CreateWorkflowInstance)
        -> Result<WorkflowInstanceRow, StoreError>;

    async fn get(&self, id: Uuid) -> Result<Option<WorkflowInstanceRow>, StoreError>;

    /// Guarded status transition. Terminal statuses reject everything;
    /// returns `InvalidTransition` on a rejected move.
    async fn update_status(
        &self,
        id: Uuid,
        status: InstanceStatus,
        error_message: Option<&str>,
    ) -> Result<WorkflowInstanceRow, StoreError>;

    async fn set_current_node(&self, id: Uuid, node_id: Option<&str>) -> Result<(), StoreError>;

    async fn set_result(&self, id: Uuid, result: serde_json::Value) -> Result<(), StoreError>;

    async fn increment_retry_count(&self, id: Uuid) -> Result<i32, StoreError>;

    /// Running instances whose `workflow:{id}` lock has expired or is
    /// missing, plus instances explicitly marked `interrupted`.
    async fn find_interrupted_instances(&self) -> Result<Vec<WorkflowInstanceRow>, StoreError>;

    async fn list(
        &self,
        filter: InstanceFilter,
        page: Pagination,
    ) -> Result<Vec<WorkflowInstanceRow>, StoreError>;

    /// Aggregate statistics, optionally scoped to a definition and time
    /// range.
    async fn stats(
        &self,
        definition_id: Option<Uuid>,
        since: Option<DateTime<Utc>>,
    ) -> Result<WorkflowStats, StoreError>;

    /// Delete terminal instances completed before `before`; returns count.
    async fn cleanup_expired(&self, before: DateTime<Utc>) -> Result<u64, StoreError>;
}

/// Node instances, including sub-nodes created by parallel/loop fan-out.
#[async_trait]
pub trait NodeStore: Send + Sync + 'static {
    async fn create(&self, input: CreateNodeInstance) -> Result<NodeInstanceRow, StoreError>;

    async fn create_many(
        &self,
        inputs: Vec<CreateNodeInstance>,
    ) -> Result<Vec<NodeInstanceRow>, StoreError>;

    /// The loop fan-out transaction: create all children AND set the
    /// parent's `loop_progress` to `executing` with the final totals, in
    /// ONE transaction. Either everything lands or nothing does.
    async fn create_loop_children(
        &self,
        parent_instance_id: Uuid,
        children: Vec<CreateNodeInstance>,
        progress: LoopProgress,
    ) -> Result<Vec<NodeInstanceRow>, StoreError>;

    async fn get(&self, id: Uuid) -> Result<Option<NodeInstanceRow>, StoreError>;

    /// Top-level instance of a graph node within a workflow instance.
    /// Sub-nodes (non-null parent) never match.
    async fn find_by_workflow_and_node_id(
        &self,
        workflow_instance_id: Uuid,
        node_id: &str,
    ) -> Result<Option<NodeInstanceRow>, StoreError>;

    /// All top-level node instances of a workflow instance.
    async fn find_top_level(
        &self,
        workflow_instance_id: Uuid,
    ) -> Result<Vec<NodeInstanceRow>, StoreError>;

    /// Direct children of a parent node instance, ordered
    /// `(child_index, id)`.
    async fn find_child_nodes(
        &self,
        parent_instance_id: Uuid,
    ) -> Result<Vec<NodeInstanceRow>, StoreError>;

    /// Recursive, cycle-safe descendant listing, ordered
    /// `(child_index, id)` per level.
    async fn find_all_child_nodes(
        &self,
        parent_instance_id: Uuid,
    ) -> Result<Vec<NodeInstanceRow>, StoreError>;

    /// Direct children still pending, ordered `(child_index, id)`.
    async fn find_pending_child_nodes(
        &self,
        parent_instance_id: Uuid,
    ) -> Result<Vec<NodeInstanceRow>, StoreError>;

    async fn find_by_status(
        &self,
        workflow_instance_id: Uuid,
        status: NodeStatus,
    ) -> Result<Vec<NodeInstanceRow>, StoreError>;

    /// Guarded node status transition, stamping start/completion times and
    /// error fields as appropriate.
    async fn update_status(
        &self,
        id: Uuid,
        status: NodeStatus,
        error_message: Option<&str>,
        error_details: Option<serde_json::Value>,
    ) -> Result<NodeInstanceRow, StoreError>;

    async fn set_result(&self, id: Uuid, result: serde_json::Value) -> Result<(), StoreError>;

    /// Link the queue job carrying this node's executor invocation.
    async fn set_job_id(&self, id: Uuid, job_id: Option<Uuid>) -> Result<(), StoreError>;

    async fn increment_retry_count(&self, id: Uuid) -> Result<i32, StoreError>;

    /// Replace the loop progress JSON on a node.
    async fn update_loop_progress(
        &self,
        id: Uuid,
        progress: LoopProgress,
    ) -> Result<(), StoreError>;
}

/// Append-only execution log. Writes are best-effort at call sites.
#[async_trait]
pub trait ExecutionLogStore: Send + Sync + 'static {
    async fn create(&self, input: CreateExecutionLog) -> Result<ExecutionLogRow, StoreError>;

    async fn create_many(&self, inputs: Vec<CreateExecutionLog>) -> Result<u64, StoreError>;

    async fn find_by_workflow_instance_id(
        &self,
        workflow_instance_id: Uuid,
        page: Pagination,
    ) -> Result<Vec<ExecutionLogRow>, StoreError>;

    async fn find_by_node_instance_id(
        &self,
        node_instance_id: Uuid,
        page: Pagination,
    ) -> Result<Vec<ExecutionLogRow>, StoreError>;

    async fn find_by_level(
        &self,
        level: &str,
        page: Pagination,
    ) -> Result<Vec<ExecutionLogRow>, StoreError>;

    /// Delete log rows created before `before`; returns count.
    async fn delete_expired_logs(&self, before: DateTime<Utc>) -> Result<u64, StoreError>;
}

/// Cron schedules and their execution history.
#[async_trait]
pub trait ScheduleStore: Send + Sync + 'static {
    async fn create(&self, input: CreateSchedule) -> Result<ScheduleRow, StoreError>;

    async fn update(
        &self,
        id: Uuid,
        input: UpdateSchedule,
    ) -> Result<Option<ScheduleRow>, StoreError>;

    async fn delete(&self, id: Uuid) -> Result<bool, StoreError>;

    async fn get(&self, id: Uuid) -> Result<Option<ScheduleRow>, StoreError>;

    async fn list(&self) -> Result<Vec<ScheduleRow>, StoreError>;

    async fn set_enabled(&self, id: Uuid, enabled: bool) -> Result<bool, StoreError>;

    /// Enabled schedules with `next_run_at <= now`.
    async fn find_due(&self, now: DateTime<Utc>) -> Result<Vec<ScheduleRow>, StoreError>;

    /// Advance the schedule clock after a trigger.
    async fn mark_triggered(
        &self,
        id: Uuid,
        last_run_at: DateTime<Utc>,
        next_run_at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    /// Insert an execution row (status `running`).
    async fn create_execution(
        &self,
        schedule_id: Uuid,
        trigger_time: DateTime<Utc>,
    ) -> Result<ScheduleExecutionRow, StoreError>;

    /// Attach the started workflow instance to an execution row.
    async fn attach_instance(
        &self,
        execution_id: Uuid,
        workflow_instance_id: Uuid,
    ) -> Result<(), StoreError>;

    /// Final status + timing on an execution row.
    async fn complete_execution(
        &self,
        execution_id: Uuid,
        status: &str,
        error_message: Option<&str>,
    ) -> Result<(), StoreError>;

    /// Executions of a schedule still in `running`.
    async fn running_count(&self, schedule_id: Uuid) -> Result<i64, StoreError>;

    async fn list_executions(
        &self,
        schedule_id: Uuid,
        page: Pagination,
    ) -> Result<Vec<ScheduleExecutionRow>, StoreError>;

    /// Trim execution history older than `before`; returns count.
    async fn cleanup_old_executions(&self, before: DateTime<Utc>) -> Result<u64, StoreError>;
}
